//! Package Retriever
//!
//! Decrypts the firmware distribution archive, unpacks it into the staging
//! directory and locates the single firmware image inside.

use flate2::read::GzDecoder;
use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::fetch::{DecryptError, SecureFetcher};
use super::verify;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const TAR_MAGIC_OFFSET: usize = 257;
const TAR_MAGIC: &[u8] = b"ustar";

#[derive(Error, Debug)]
pub enum PackageError {
    #[error("Package decryption failed: {0}")]
    Decrypt(#[from] DecryptError),
    #[error("Decrypted package is not a recognized archive")]
    UnknownFormat,
    #[error("Failed to unpack archive: {0}")]
    Unpack(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("No .{extension} image in {}", .dir.display())]
    ImageNotFound { dir: PathBuf, extension: String },
}

/// Container format of a decrypted package
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Zip,
    Tar,
}

impl ArchiveFormat {
    /// Sniff the format from leading magic bytes
    pub fn detect(data: &[u8]) -> Option<Self> {
        if data.starts_with(GZIP_MAGIC) {
            Some(Self::TarGz)
        } else if data.starts_with(ZIP_MAGIC) {
            Some(Self::Zip)
        } else if data.len() > TAR_MAGIC_OFFSET + TAR_MAGIC.len()
            && &data[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + TAR_MAGIC.len()] == TAR_MAGIC
        {
            Some(Self::Tar)
        } else {
            None
        }
    }
}

pub struct PackageRetriever<'a> {
    fetcher: &'a SecureFetcher,
    package_path: PathBuf,
    staging_dir: &'a Path,
    image_extension: &'a str,
}

impl<'a> PackageRetriever<'a> {
    pub fn new(
        fetcher: &'a SecureFetcher,
        package_path: PathBuf,
        staging_dir: &'a Path,
        image_extension: &'a str,
    ) -> Self {
        Self {
            fetcher,
            package_path,
            staging_dir,
            image_extension,
        }
    }

    /// Decrypt, unpack and locate the firmware image
    pub fn retrieve(&self) -> Result<PathBuf, PackageError> {
        let ciphertext = fs::read(&self.package_path)?;
        let archive = self.fetcher.decrypt(&ciphertext)?;
        tracing::info!(
            bytes = archive.len(),
            sha256 = %verify::sha256_hex(&archive),
            "Package decrypted"
        );

        let format = ArchiveFormat::detect(&archive).ok_or(PackageError::UnknownFormat)?;
        unpack(&archive, format, self.staging_dir)?;

        find_image(self.staging_dir, self.image_extension)
    }
}

/// Replace the staging directory with the archive's contents
pub fn unpack(archive: &[u8], format: ArchiveFormat, staging_dir: &Path) -> Result<(), PackageError> {
    if staging_dir.exists() {
        fs::remove_dir_all(staging_dir)?;
    }
    fs::create_dir_all(staging_dir)?;

    match format {
        ArchiveFormat::TarGz => {
            let mut tar = tar::Archive::new(GzDecoder::new(Cursor::new(archive)));
            tar.unpack(staging_dir).map_err(|e| PackageError::Unpack(e.to_string()))?;
        }
        ArchiveFormat::Tar => {
            let mut tar = tar::Archive::new(Cursor::new(archive));
            tar.unpack(staging_dir).map_err(|e| PackageError::Unpack(e.to_string()))?;
        }
        ArchiveFormat::Zip => {
            let mut zip =
                zip::ZipArchive::new(Cursor::new(archive)).map_err(|e| PackageError::Unpack(e.to_string()))?;
            zip.extract(staging_dir).map_err(|e| PackageError::Unpack(e.to_string()))?;
        }
    }

    tracing::debug!(format = ?format, dir = %staging_dir.display(), "Package unpacked");
    Ok(())
}

/// Top-level scan for the firmware image; ties resolve to the first name in sort order
pub fn find_image(dir: &Path, extension: &str) -> Result<PathBuf, PackageError> {
    let wanted = extension.trim_start_matches('.');
    let mut candidates: Vec<PathBuf> = Vec::new();

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case(wanted))
            .unwrap_or(false);
        if matches {
            candidates.push(path);
        }
    }

    candidates.sort();

    match candidates.len() {
        0 => Err(PackageError::ImageNotFound {
            dir: dir.to_path_buf(),
            extension: wanted.to_string(),
        }),
        1 => Ok(candidates.remove(0)),
        n => {
            let names: Vec<String> = candidates
                .iter()
                .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
                .collect();
            tracing::warn!(count = n, candidates = ?names, chosen = %names[0], "Package contains multiple firmware images");
            Ok(candidates.remove(0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::updater::testing::{fetcher_with, tar_gz, zip_archive, XorDecryptor};
    use tempfile::tempdir;

    #[test]
    fn test_detect_formats() {
        assert_eq!(ArchiveFormat::detect(&tar_gz(&[("a.uf2", b"x")])), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::detect(&zip_archive(&[("a.uf2", b"x")])), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::detect(b"garbage"), None);
    }

    #[test]
    fn test_retrieve_single_image() {
        let repo = tempdir().unwrap();
        let staging = tempdir().unwrap();
        let package = repo.path().join("firmware.tar.gz.enc");
        fs::write(
            &package,
            XorDecryptor::seal(&tar_gz(&[("fw.uf2", b"image"), ("README.txt", b"notes")])),
        )
        .unwrap();
        let fetcher = fetcher_with(repo.path());

        let image = PackageRetriever::new(&fetcher, package, staging.path(), "uf2")
            .retrieve()
            .unwrap();
        assert_eq!(image, staging.path().join("fw.uf2"));
        assert_eq!(fs::read(&image).unwrap(), b"image");
    }

    #[test]
    fn test_zip_package() {
        let repo = tempdir().unwrap();
        let staging = tempdir().unwrap();
        let package = repo.path().join("firmware.zip.enc");
        fs::write(&package, XorDecryptor::seal(&zip_archive(&[("FW.UF2", b"image")]))).unwrap();
        let fetcher = fetcher_with(repo.path());

        let image = PackageRetriever::new(&fetcher, package, staging.path(), ".uf2")
            .retrieve()
            .unwrap();
        assert_eq!(image.file_name().unwrap(), "FW.UF2");
    }

    #[test]
    fn test_decrypt_failure_is_fatal() {
        let repo = tempdir().unwrap();
        let staging = tempdir().unwrap();
        let package = repo.path().join("firmware.tar.gz.enc");
        fs::write(&package, b"tampered").unwrap();
        let fetcher = fetcher_with(repo.path());

        let result = PackageRetriever::new(&fetcher, package, staging.path(), "uf2").retrieve();
        assert!(matches!(result, Err(PackageError::Decrypt(_))));
    }

    #[test]
    fn test_restaging_clears_previous_content() {
        let staging = tempdir().unwrap();
        unpack(&tar_gz(&[("old.uf2", b"1")]), ArchiveFormat::TarGz, staging.path()).unwrap();
        unpack(&tar_gz(&[("new.uf2", b"2")]), ArchiveFormat::TarGz, staging.path()).unwrap();

        assert!(!staging.path().join("old.uf2").exists());
        assert_eq!(find_image(staging.path(), "uf2").unwrap(), staging.path().join("new.uf2"));
    }

    #[test]
    fn test_no_image() {
        let staging = tempdir().unwrap();
        unpack(&tar_gz(&[("firmware.bin", b"1")]), ArchiveFormat::TarGz, staging.path()).unwrap();
        assert!(matches!(
            find_image(staging.path(), "uf2"),
            Err(PackageError::ImageNotFound { .. })
        ));
    }

    #[test]
    fn test_nested_images_ignored() {
        let staging = tempdir().unwrap();
        unpack(&tar_gz(&[("sub/fw.uf2", b"1")]), ArchiveFormat::TarGz, staging.path()).unwrap();
        assert!(find_image(staging.path(), "uf2").is_err());
    }

    #[test]
    fn test_multiple_images_pick_first_sorted() {
        let staging = tempdir().unwrap();
        unpack(
            &tar_gz(&[("zeta.uf2", b"z"), ("alpha.uf2", b"a"), ("mid.uf2", b"m")]),
            ArchiveFormat::TarGz,
            staging.path(),
        )
        .unwrap();
        assert_eq!(find_image(staging.path(), "uf2").unwrap(), staging.path().join("alpha.uf2"));
    }
}
