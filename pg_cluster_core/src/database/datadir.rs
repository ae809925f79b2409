//! Local data directory and its marker files

use super::owner::FileOwner;
use crate::error::Result;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Name of the file whose presence means "configured as a standby"
pub const STANDBY_SIGNAL: &str = "standby.signal";

/// The PostgreSQL data directory of this node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDirectory {
    path: PathBuf,
}

impl DataDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling file that exists while a clone is in flight
    pub fn clone_pending_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.path
            .with_file_name(format!(".{}.clone-pending", name))
    }

    /// A usable database exists: the directory is present and no clone
    /// was interrupted
    pub fn exists(&self) -> bool {
        self.path.is_dir() && !self.clone_pending_path().exists()
    }

    /// Create the directory (and parents) with mode 0700
    pub fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.path)?;
        fs::set_permissions(&self.path, fs::Permissions::from_mode(0o700))?;
        Ok(())
    }

    /// `prepare`, then hand the directory to `owner`
    pub fn prepare_owned(&self, owner: FileOwner) -> Result<()> {
        self.prepare()?;
        owner.apply(&self.path)
    }

    /// Remove the directory and everything in it
    pub fn wipe(&self) -> Result<()> {
        if self.path.exists() {
            tracing::warn!(path = %self.path.display(), "Removing data directory");
            fs::remove_dir_all(&self.path)?;
        }
        Ok(())
    }

    /// Record that a clone is about to replace this directory
    pub fn begin_clone(&self) -> Result<()> {
        let pending = self.clone_pending_path();
        if let Some(parent) = pending.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(pending, b"")?;
        Ok(())
    }

    /// Record that the clone completed
    pub fn finish_clone(&self) -> Result<()> {
        let pending = self.clone_pending_path();
        if pending.exists() {
            fs::remove_file(pending)?;
        }
        Ok(())
    }

    pub fn standby_marker(&self) -> PathBuf {
        self.path.join(STANDBY_SIGNAL)
    }

    pub fn has_standby_marker(&self) -> bool {
        self.standby_marker().exists()
    }

    /// Create the standby marker if it is missing
    pub fn write_standby_marker(&self) -> Result<()> {
        let marker = self.standby_marker();
        if !marker.exists() {
            fs::write(marker, b"")?;
        }
        Ok(())
    }

    /// Remove the standby marker, reporting whether it was present
    pub fn remove_standby_marker(&self) -> Result<bool> {
        let marker = self.standby_marker();
        if marker.exists() {
            fs::remove_file(marker)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_sets_mode() {
        let root = tempfile::tempdir().unwrap();
        let data = DataDirectory::new(root.path().join("12").join("main"));
        assert!(!data.exists());
        data.prepare().unwrap();
        assert!(data.exists());
        let mode = fs::metadata(data.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_prepare_owned_sets_owner() {
        use std::os::unix::fs::MetadataExt;

        let root = tempfile::tempdir().unwrap();
        let data = DataDirectory::new(root.path().join("12").join("main"));
        let owner = crate::testing::foreign_owner();
        data.prepare_owned(owner).unwrap();

        let meta = fs::metadata(data.path()).unwrap();
        assert_eq!((meta.uid(), meta.gid()), (owner.uid, owner.gid));
        assert_eq!(meta.permissions().mode() & 0o777, 0o700);
    }

    #[test]
    fn test_standby_marker_lifecycle() {
        let root = tempfile::tempdir().unwrap();
        let data = DataDirectory::new(root.path().join("main"));
        data.prepare().unwrap();
        assert!(!data.has_standby_marker());
        data.write_standby_marker().unwrap();
        data.write_standby_marker().unwrap();
        assert!(data.has_standby_marker());
        assert!(data.remove_standby_marker().unwrap());
        assert!(!data.remove_standby_marker().unwrap());
    }

    #[test]
    fn test_interrupted_clone_is_not_a_database() {
        let root = tempfile::tempdir().unwrap();
        let data = DataDirectory::new(root.path().join("main"));
        data.begin_clone().unwrap();
        data.prepare().unwrap();
        assert!(!data.exists());
        data.finish_clone().unwrap();
        assert!(data.exists());
        data.wipe().unwrap();
        assert!(!data.path().exists());
    }
}
