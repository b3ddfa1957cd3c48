//! Update pipeline error taxonomy
//!
//! Every fatal condition of a run maps onto one variant, and every variant onto
//! a stable process exit code so external schedulers can alert on it.

use std::path::PathBuf;
use thiserror::Error;

use super::flash::{ConvertError, FlashFailure, ProgramError};
use super::handshake::HandshakeError;
use super::fetch::{KeyError, SourceError};
use super::package::PackageError;
use super::serial::SerialError;
use super::version_store::StoreError;

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Distribution source unavailable: {0}")]
    SourceUnavailable(#[source] SourceError),
    #[error("Artifact missing: {}", .0.display())]
    ArtifactMissing(PathBuf),
    #[error("Key material unavailable: {0}")]
    Key(#[from] KeyError),
    #[error("Package decryption failed: {0}")]
    PackageDecryptFailed(String),
    #[error("No firmware image with extension .{extension} in {}", .dir.display())]
    ImageNotFound { dir: PathBuf, extension: String },
    #[error("Staging failed: {0}")]
    Staging(#[source] std::io::Error),
    #[error("Serial channel unavailable: {0}")]
    SerialUnavailable(#[source] SerialError),
    #[error("Image conversion failed: {0}")]
    ConversionFailed(#[source] ConvertError),
    #[error("Flashing failed: {0}")]
    FlashFailed(#[source] ProgramError),
    #[error("Update cancelled by operator")]
    Cancelled,
    #[error("Version state error: {0}")]
    Store(#[from] StoreError),
}

impl UpdateError {
    /// Exit code reported to the scheduler for this failure
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::SourceUnavailable(_) => 10,
            Self::ArtifactMissing(_) => 11,
            Self::PackageDecryptFailed(_) => 12,
            Self::ImageNotFound { .. } => 13,
            Self::SerialUnavailable(_) => 14,
            Self::ConversionFailed(_) => 15,
            Self::FlashFailed(_) => 16,
            Self::Cancelled => 18,
            Self::Key(_) => 19,
            Self::Store(_) => 20,
            Self::Staging(_) => 21,
        }
    }

    /// Short machine-readable name of the failure kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceUnavailable(_) => "source_unavailable",
            Self::ArtifactMissing(_) => "artifact_missing",
            Self::PackageDecryptFailed(_) => "package_decrypt_failed",
            Self::ImageNotFound { .. } => "image_not_found",
            Self::SerialUnavailable(_) => "serial_unavailable",
            Self::ConversionFailed(_) => "conversion_failed",
            Self::FlashFailed(_) => "flash_failed",
            Self::Cancelled => "cancelled",
            Self::Key(_) => "key_unavailable",
            Self::Store(_) => "version_state",
            Self::Staging(_) => "staging",
        }
    }
}

impl From<PackageError> for UpdateError {
    fn from(e: PackageError) -> Self {
        match e {
            PackageError::Decrypt(e) => Self::PackageDecryptFailed(e.to_string()),
            PackageError::UnknownFormat => {
                Self::PackageDecryptFailed("decrypted payload is not a recognized archive".to_string())
            }
            PackageError::Unpack(e) => Self::PackageDecryptFailed(format!("archive is corrupt: {}", e)),
            PackageError::Io(e) => Self::Staging(e),
            PackageError::ImageNotFound { dir, extension } => Self::ImageNotFound { dir, extension },
        }
    }
}

impl From<HandshakeError> for UpdateError {
    fn from(e: HandshakeError) -> Self {
        match e {
            HandshakeError::SerialUnavailable(e) => Self::SerialUnavailable(e),
            HandshakeError::Cancelled => Self::Cancelled,
        }
    }
}

impl From<FlashFailure> for UpdateError {
    fn from(e: FlashFailure) -> Self {
        match e {
            FlashFailure::Conversion(e) => Self::ConversionFailed(e),
            FlashFailure::Program(e) => Self::FlashFailed(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_and_nonzero() {
        let errors = vec![
            UpdateError::SourceUnavailable(SourceError::Git(git2::Error::from_str("offline"))),
            UpdateError::ArtifactMissing(PathBuf::from("version.enc")),
            UpdateError::PackageDecryptFailed("bad".to_string()),
            UpdateError::ImageNotFound { dir: PathBuf::from("staging"), extension: "uf2".to_string() },
            UpdateError::SerialUnavailable(SerialError::ConnectionFailed("busy".to_string())),
            UpdateError::Cancelled,
            UpdateError::Store(StoreError::Corrupt("abc".to_string())),
        ];

        let mut codes: Vec<u8> = errors.iter().map(|e| e.exit_code()).collect();
        assert!(codes.iter().all(|c| *c != 0));
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_unknown_package_format_is_decrypt_failure() {
        let err: UpdateError = PackageError::UnknownFormat.into();
        assert_eq!(err.kind(), "package_decrypt_failed");
    }
}
