//! Log watchdog
//!
//! repmgr writes to a file so the history survives the container, but its
//! output is also wanted in the pod log. A background thread follows the
//! file by name: it waits for the file to appear, starts over when the file
//! is truncated or replaced, and re-emits every complete line.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Handle to the tailing thread
pub struct LogWatchdog {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LogWatchdog {
    /// Follow `path`, emitting each line through `tracing` with target `repmgr`
    pub fn spawn(path: PathBuf) -> std::io::Result<Self> {
        Self::spawn_with_sink(path, POLL_INTERVAL, |line| {
            tracing::info!(target: "repmgr", "{}", line);
        })
    }

    /// Follow `path`, handing each line to `sink`
    pub fn spawn_with_sink<F>(path: PathBuf, interval: Duration, sink: F) -> std::io::Result<Self>
    where
        F: Fn(&str) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name("repmgr-log".to_string())
            .spawn(move || follow(&path, interval, &flag, sink))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it
    ///
    /// Returns false if the thread had panicked.
    pub fn stop(mut self) -> bool {
        self.shutdown()
    }

    fn shutdown(&mut self) -> bool {
        self.stop.store(true, Ordering::SeqCst);
        match self.handle.take().map(JoinHandle::join) {
            Some(Err(panic)) => {
                tracing::error!("repmgr log watchdog panicked: {}", panic_message(panic.as_ref()));
                false
            }
            _ => true,
        }
    }
}

impl Drop for LogWatchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

struct Tail {
    reader: BufReader<File>,
    inode: u64,
    position: u64,
    partial: String,
}

impl Tail {
    fn open(path: &Path, from_end: bool) -> Option<Self> {
        let file = File::open(path).ok()?;
        let metadata = file.metadata().ok()?;
        let mut reader = BufReader::new(file);
        let position = if from_end {
            reader.seek(SeekFrom::End(0)).ok()?
        } else {
            0
        };
        Some(Self {
            reader,
            inode: metadata.ino(),
            position,
            partial: String::new(),
        })
    }

    /// Whether the file at `path` is no longer the one being read
    fn replaced(&self, path: &Path) -> bool {
        match std::fs::metadata(path) {
            Ok(metadata) => metadata.ino() != self.inode || metadata.len() < self.position,
            Err(_) => true,
        }
    }

    fn drain<F: Fn(&str)>(&mut self, sink: &F) {
        loop {
            match self.reader.read_line(&mut self.partial) {
                Ok(0) => return,
                Ok(read) => {
                    self.position += read as u64;
                    if self.partial.ends_with('\n') {
                        sink(self.partial.trim_end_matches(['\n', '\r']));
                        self.partial.clear();
                    }
                }
                Err(_) => return,
            }
        }
    }
}

fn follow<F: Fn(&str)>(path: &Path, interval: Duration, stop: &AtomicBool, sink: F) {
    // History already in the file when we start is not replayed
    let mut tail = Tail::open(path, true);

    while !stop.load(Ordering::SeqCst) {
        match tail.as_mut() {
            Some(current) => {
                current.drain(&sink);
                if current.replaced(path) {
                    tail = Tail::open(path, false);
                }
            }
            None => tail = Tail::open(path, false),
        }
        thread::sleep(interval);
    }

    if let Some(current) = tail.as_mut() {
        current.drain(&sink);
    }
}
