//! Version Store
//!
//! Persists the last firmware version that was flashed and verified on the device.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read version state: {0}")]
    ReadError(#[source] std::io::Error),
    #[error("Failed to write version state: {0}")]
    WriteError(#[source] std::io::Error),
    #[error("Version state is not a plain integer: {0:?}")]
    Corrupt(String),
}

/// Durable home of the applied firmware version
pub trait VersionStore: Send + Sync {
    /// Last committed version, `None` before the first successful update
    fn read(&self) -> Result<Option<u64>, StoreError>;

    /// Record a version that is now running on the device
    fn commit(&self, version: u64) -> Result<(), StoreError>;
}

/// Plaintext integer file on disk
pub struct FileVersionStore {
    path: PathBuf,
}

impl FileVersionStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Store living at `<state_dir>/version`
    pub fn in_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join("version"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl VersionStore for FileVersionStore {
    fn read(&self) -> Result<Option<u64>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path).map_err(StoreError::ReadError)?;
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        trimmed
            .parse::<u64>()
            .map(Some)
            .map_err(|_| StoreError::Corrupt(trimmed.to_string()))
    }

    fn commit(&self, version: u64) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(StoreError::WriteError)?;
        }

        // Write to temp file first, then rename (atomic)
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, format!("{}\n", version)).map_err(StoreError::WriteError)?;
        fs::rename(&temp_path, &self.path).map_err(StoreError::WriteError)?;
        Ok(())
    }
}

/// Store that lives only as long as the process, for callers without a state dir
#[derive(Default)]
pub struct MemoryVersionStore {
    version: Mutex<Option<u64>>,
}

impl MemoryVersionStore {
    pub fn new(initial: Option<u64>) -> Self {
        Self {
            version: Mutex::new(initial),
        }
    }
}

impl VersionStore for MemoryVersionStore {
    fn read(&self) -> Result<Option<u64>, StoreError> {
        Ok(*self.version.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn commit(&self, version: u64) -> Result<(), StoreError> {
        *self.version.lock().unwrap_or_else(|e| e.into_inner()) = Some(version);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_reads_none() {
        let dir = tempdir().unwrap();
        let store = FileVersionStore::in_dir(dir.path());
        assert_eq!(store.read().unwrap(), None);
    }

    #[test]
    fn test_commit_then_read() {
        let dir = tempdir().unwrap();
        let store = FileVersionStore::in_dir(&dir.path().join("nested"));

        store.commit(5).unwrap();
        assert_eq!(store.read().unwrap(), Some(5));
        assert_eq!(fs::read_to_string(store.path()).unwrap(), "5\n");

        store.commit(7).unwrap();
        assert_eq!(store.read().unwrap(), Some(7));
        assert!(!store.path().with_extension("tmp").exists());
    }

    #[test]
    fn test_whitespace_reads_none() {
        let dir = tempdir().unwrap();
        let store = FileVersionStore::in_dir(dir.path());
        fs::write(store.path(), "  \n").unwrap();
        assert_eq!(store.read().unwrap(), None);
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let dir = tempdir().unwrap();
        let store = FileVersionStore::in_dir(dir.path());
        fs::write(store.path(), "v3").unwrap();
        assert!(matches!(store.read(), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryVersionStore::new(Some(3));
        assert_eq!(store.read().unwrap(), Some(3));
        store.commit(4).unwrap();
        assert_eq!(store.read().unwrap(), Some(4));
    }
}
