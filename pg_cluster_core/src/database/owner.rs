//! Ownership of files and directories handed to the database account

use crate::error::{ClusterError, Result};
use nix::unistd::{Gid, Uid, User};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Numeric owner applied with `chown`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileOwner {
    pub uid: u32,
    pub gid: u32,
}

impl FileOwner {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// Resolve `user` and its primary group from the account database
    pub fn lookup(user: &str) -> Result<Self> {
        match User::from_name(user) {
            Ok(Some(account)) => Ok(Self::new(account.uid.as_raw(), account.gid.as_raw())),
            Ok(None) => Err(ClusterError::configuration(format!(
                "unknown database account {}",
                user
            ))),
            Err(errno) => Err(std::io::Error::from(errno).into()),
        }
    }

    /// The effective user and group of this process
    pub fn current() -> Self {
        Self::new(Uid::effective().as_raw(), Gid::effective().as_raw())
    }

    pub fn apply(&self, path: &Path) -> Result<()> {
        std::os::unix::fs::chown(path, Some(self.uid), Some(self.gid))?;
        Ok(())
    }
}

/// A directory the node writes into, with the owner and mode it must carry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub path: PathBuf,
    pub owner: FileOwner,
    pub mode: u32,
}

impl MountPoint {
    pub fn new(path: impl Into<PathBuf>, owner: FileOwner, mode: u32) -> Self {
        Self {
            path: path.into(),
            owner,
            mode,
        }
    }
}

/// Create missing mount directories, then fix their owner and mode
pub fn prepare_mounts(mounts: &[MountPoint]) -> Result<()> {
    for mount in mounts {
        tracing::info!(
            uid = mount.owner.uid,
            gid = mount.owner.gid,
            "Updating ownership and permissions of {}",
            mount.path.display()
        );
        if !mount.path.exists() {
            fs::create_dir_all(&mount.path)?;
        }
        mount.owner.apply(&mount.path)?;
        fs::set_permissions(&mount.path, fs::Permissions::from_mode(mount.mode))?;
    }
    Ok(())
}
