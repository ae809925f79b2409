//! Daemon hand-off and signal handling
//!
//! Once the node is reconciled the agent runs repmgrd in the foreground as a
//! child process. SIGINT and SIGTERM are forwarded by killing the child; the
//! agent then exits with the child's status.

use crate::command::CommandLine;
use crate::error::Result;
use std::future::Future;
use std::path::Path;
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGTERM
    Terminate,
}

/// How the supervised child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    /// The child exited on its own
    Exited(Option<i32>),
    /// The child was killed after a shutdown signal
    Stopped(ShutdownSignal, Option<i32>),
}

impl ChildExit {
    /// Process exit code the agent should use
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Exited(Some(code)) => *code,
            Self::Exited(None) => 1,
            Self::Stopped(ShutdownSignal::Interrupt, _) => 130,
            Self::Stopped(ShutdownSignal::Terminate, _) => 143,
        }
    }
}

/// Wait for SIGINT or SIGTERM
pub async fn wait_for_signal() -> Result<ShutdownSignal> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = interrupt.recv() => {
            tracing::info!("Received SIGINT, stopping repmgrd");
            Ok(ShutdownSignal::Interrupt)
        }
        _ = terminate.recv() => {
            tracing::info!("Received SIGTERM, stopping repmgrd");
            Ok(ShutdownSignal::Terminate)
        }
    }
}

/// repmgrd in the foreground
pub fn repmgrd_command(conf: &Path, os_user: &str) -> CommandLine {
    CommandLine::new(
        "repmgrd",
        [
            "-v".to_string(),
            "-f".to_string(),
            conf.to_string_lossy().into_owned(),
            "--daemonize=false".to_string(),
            "--no-pid-file".to_string(),
        ],
    )
    .as_user(os_user)
}

/// Run `command` until it exits or `shutdown` resolves, killing it in the
/// latter case
pub async fn supervise<S>(command: &CommandLine, shutdown: S) -> Result<ChildExit>
where
    S: Future<Output = Result<ShutdownSignal>>,
{
    let (program, args) = match command.argv().split_first() {
        Some(split) => split,
        None => return Err(crate::error::ClusterError::configuration("empty command line")),
    };

    tracing::info!("Handing over to {}", command);
    let mut child = Command::new(program).args(args).spawn()?;

    tokio::select! {
        status = child.wait() => {
            let status = status?;
            tracing::info!("{} exited with {}", program, status);
            Ok(ChildExit::Exited(status.code()))
        }
        signal = shutdown => {
            let signal = signal?;
            child.start_kill()?;
            let status = child.wait().await?;
            tracing::info!("{} stopped after {:?}", program, signal);
            Ok(ChildExit::Stopped(signal, status.code()))
        }
    }
}

/// Run repmgrd until it exits or the agent is told to stop
pub async fn run_repmgrd(conf: &Path, os_user: &str) -> Result<ChildExit> {
    supervise(&repmgrd_command(conf, os_user), wait_for_signal()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_repmgrd_command() {
        assert_eq!(
            repmgrd_command(Path::new("/srv/pgconf/repmgr.conf"), "postgres").to_string(),
            "sudo -u postgres -EH -- repmgrd -v -f /srv/pgconf/repmgr.conf --daemonize=false --no-pid-file"
        );
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ChildExit::Exited(Some(3)).exit_code(), 3);
        assert_eq!(ChildExit::Exited(None).exit_code(), 1);
        assert_eq!(ChildExit::Stopped(ShutdownSignal::Terminate, None).exit_code(), 143);
    }

    #[tokio::test]
    async fn test_child_exit_is_reported() {
        let command = CommandLine::new("sh", ["-c", "exit 3"]);
        let exit = supervise(&command, std::future::pending()).await.unwrap();
        assert_eq!(exit, ChildExit::Exited(Some(3)));
    }

    #[tokio::test]
    async fn test_shutdown_kills_child() {
        let command = CommandLine::new("sleep", ["30"]);
        let shutdown = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(ShutdownSignal::Terminate)
        };
        let exit = supervise(&command, shutdown).await.unwrap();
        assert_eq!(exit, ChildExit::Stopped(ShutdownSignal::Terminate, None));
        assert_eq!(exit.exit_code(), 143);
    }
}
