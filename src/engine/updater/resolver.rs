//! Version Resolver
//!
//! Decides whether the distribution carries firmware newer than what the device
//! last accepted. An unreadable remote version never triggers an update.

use serde::Serialize;
use std::path::PathBuf;

use super::error::UpdateError;
use super::fetch::SecureFetcher;
use super::version_store::VersionStore;

/// Outcome of comparing remote and local versions
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub should_update: bool,
    pub remote_version: u64,
    pub local_version: u64,
    /// Checkout the versions were read from; the package is taken from the same one
    #[serde(skip)]
    pub source_root: PathBuf,
}

pub struct VersionResolver<'a> {
    fetcher: &'a SecureFetcher,
    store: &'a dyn VersionStore,
    version_artifact: &'a str,
}

impl<'a> VersionResolver<'a> {
    pub fn new(fetcher: &'a SecureFetcher, store: &'a dyn VersionStore, version_artifact: &'a str) -> Self {
        Self {
            fetcher,
            store,
            version_artifact,
        }
    }

    pub fn resolve(&self) -> Result<Resolution, UpdateError> {
        let root = self.fetcher.sync().map_err(UpdateError::SourceUnavailable)?;

        let artifact_path = root.join(self.version_artifact);
        let ciphertext = self
            .fetcher
            .read_artifact(&root, self.version_artifact)
            .map_err(UpdateError::Staging)?
            .ok_or_else(|| UpdateError::ArtifactMissing(artifact_path))?;

        let remote_version = match self.fetcher.decrypt(&ciphertext) {
            Ok(plaintext) => match extract_version(&plaintext) {
                Some(version) => version,
                None => {
                    tracing::warn!("Remote version artifact holds no version number, treating as 0");
                    0
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Remote version artifact failed to decrypt, treating as 0");
                0
            }
        };

        let local_version = self.store.read()?.unwrap_or(0);
        let should_update = remote_version > local_version;

        tracing::info!(
            remote = remote_version,
            local = local_version,
            should_update,
            "Version check complete"
        );

        Ok(Resolution {
            should_update,
            remote_version,
            local_version,
            source_root: root,
        })
    }
}

/// First contiguous run of ASCII digits, parsed as a version number
pub fn extract_version(plaintext: &[u8]) -> Option<u64> {
    let start = plaintext.iter().position(u8::is_ascii_digit)?;
    let digits: String = plaintext[start..]
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .map(|b| *b as char)
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::updater::testing::{fetcher_with, XorDecryptor};
    use crate::engine::updater::version_store::MemoryVersionStore;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_extract_version() {
        assert_eq!(extract_version(b"v5-stable"), Some(5));
        assert_eq!(extract_version(b"5"), Some(5));
        assert_eq!(extract_version(b"release 12.3"), Some(12));
        assert_eq!(extract_version(b"\n  0042\n"), Some(42));
        assert_eq!(extract_version(b"no digits"), None);
        assert_eq!(extract_version(b""), None);
        assert_eq!(extract_version(&[0xff, 0xfe, b'7']), Some(7));
        // Larger than u64 degrades like a missing number
        assert_eq!(extract_version(b"99999999999999999999999"), None);
    }

    #[test]
    fn test_newer_remote_updates() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("version.enc"), XorDecryptor::seal(b"v5-stable")).unwrap();
        let fetcher = fetcher_with(dir.path());
        let store = MemoryVersionStore::new(Some(3));

        let resolution = VersionResolver::new(&fetcher, &store, "version.enc").resolve().unwrap();
        assert_eq!(
            resolution,
            Resolution {
                should_update: true,
                remote_version: 5,
                local_version: 3,
                source_root: dir.path().to_path_buf(),
            }
        );
    }

    #[test]
    fn test_equal_or_older_remote_is_noop() {
        let dir = tempdir().unwrap();
        let fetcher = fetcher_with(dir.path());

        for (remote, local) in [(5u64, 5u64), (4, 5), (0, 0)] {
            fs::write(dir.path().join("version.enc"), XorDecryptor::seal(remote.to_string().as_bytes())).unwrap();
            let store = MemoryVersionStore::new(Some(local));
            let resolution = VersionResolver::new(&fetcher, &store, "version.enc").resolve().unwrap();
            assert!(!resolution.should_update, "remote {} local {}", remote, local);
        }
    }

    #[test]
    fn test_missing_local_is_zero() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("version.enc"), XorDecryptor::seal(b"1")).unwrap();
        let fetcher = fetcher_with(dir.path());
        let store = MemoryVersionStore::new(None);

        let resolution = VersionResolver::new(&fetcher, &store, "version.enc").resolve().unwrap();
        assert_eq!(resolution.local_version, 0);
        assert!(resolution.should_update);
    }

    #[test]
    fn test_undecryptable_version_is_zero() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("version.enc"), b"not sealed").unwrap();
        let fetcher = fetcher_with(dir.path());
        let store = MemoryVersionStore::new(None);

        let resolution = VersionResolver::new(&fetcher, &store, "version.enc").resolve().unwrap();
        assert_eq!(resolution.remote_version, 0);
        assert!(!resolution.should_update);
    }

    #[test]
    fn test_missing_artifact_is_fatal() {
        let dir = tempdir().unwrap();
        let fetcher = fetcher_with(dir.path());
        let store = MemoryVersionStore::new(None);

        let result = VersionResolver::new(&fetcher, &store, "version.enc").resolve();
        assert!(matches!(result, Err(UpdateError::ArtifactMissing(_))));
    }
}
