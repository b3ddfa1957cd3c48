//! Secure Fetcher
//!
//! Pulls the distribution repository and decrypts its artifacts with the
//! locally held key.

use git2::{AutotagOption, Cred, CredentialType, FetchOptions, RemoteCallbacks, Repository};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use super::tools::{self, ToolCommand, ToolError};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),
    #[error("Checkout missing at {} and no remote URL configured", .0.display())]
    NoCheckout(PathBuf),
}

#[derive(Error, Debug)]
pub enum DecryptError {
    #[error("Decryption tool failed: {0}")]
    Tool(#[from] ToolError),
    #[error("Decryption failed: {0}")]
    Rejected(String),
}

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Failed to read key file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Key file {} is empty", .0.display())]
    Empty(PathBuf),
}

/// Where the latest distribution state comes from
pub trait DistributionSource: Send + Sync {
    /// Bring the local copy up to date and return its root directory
    fn sync(&self) -> Result<PathBuf, SourceError>;
}

/// Opaque symmetric decryption capability
pub trait Decryptor: Send + Sync {
    fn decrypt(&self, ciphertext: &[u8], key: &KeyMaterial) -> Result<Vec<u8>, DecryptError>;
}

/// Symmetric key loaded from a file-backed secret
pub struct KeyMaterial {
    path: PathBuf,
    bytes: Vec<u8>,
}

impl KeyMaterial {
    pub fn load(path: &Path) -> Result<Self, KeyError> {
        let bytes = fs::read(path).map_err(|source| KeyError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(KeyError::Empty(path.to_path_buf()));
        }
        Ok(Self {
            path: path.to_path_buf(),
            bytes,
        })
    }

    /// Key held only in memory (no backing file)
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            path: PathBuf::new(),
            bytes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("path", &self.path)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Read-only mirror of the distribution repository
pub struct GitSource {
    repo_dir: PathBuf,
    remote_url: Option<String>,
    remote: String,
    branch: String,
}

impl GitSource {
    pub fn new(repo_dir: PathBuf, remote_url: Option<String>, remote: String, branch: String) -> Self {
        Self {
            repo_dir,
            remote_url,
            remote,
            branch,
        }
    }

    fn callbacks<'a>() -> RemoteCallbacks<'a> {
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(|_url, username_from_url, allowed_types| {
            if allowed_types.contains(CredentialType::SSH_KEY) {
                Cred::ssh_key_from_agent(username_from_url.unwrap_or("git"))
            } else {
                Cred::default()
            }
        });
        callbacks
    }

    fn open_or_clone(&self) -> Result<Repository, SourceError> {
        if let Ok(repo) = Repository::open(&self.repo_dir) {
            return Ok(repo);
        }

        let url = self
            .remote_url
            .as_deref()
            .ok_or_else(|| SourceError::NoCheckout(self.repo_dir.clone()))?;

        tracing::info!(url, path = %self.repo_dir.display(), "Cloning distribution repository");
        let mut fetch_options = FetchOptions::new();
        fetch_options.remote_callbacks(Self::callbacks());

        let mut builder = git2::build::RepoBuilder::new();
        builder.fetch_options(fetch_options);
        builder.branch(&self.branch);
        Ok(builder.clone(url, &self.repo_dir)?)
    }
}

impl DistributionSource for GitSource {
    fn sync(&self) -> Result<PathBuf, SourceError> {
        let repo = self.open_or_clone()?;

        let mut fetch_options = FetchOptions::new();
        fetch_options.remote_callbacks(Self::callbacks());
        fetch_options.download_tags(AutotagOption::None);

        let mut remote = repo.find_remote(&self.remote)?;
        remote.fetch(&[&self.branch], Some(&mut fetch_options), None)?;

        let fetch_head = repo.find_reference("FETCH_HEAD")?;
        let fetch_commit = repo.reference_to_annotated_commit(&fetch_head)?;
        let target = repo.find_commit(fetch_commit.id())?;

        let refname = format!("refs/heads/{}", self.branch);
        match repo.find_reference(&refname) {
            Ok(mut reference) => {
                let (analysis, _preference) = repo.merge_analysis(&[&fetch_commit])?;
                if reference.target() == Some(fetch_commit.id()) {
                    tracing::debug!(branch = %self.branch, "Distribution already up to date");
                } else if analysis.is_fast_forward() {
                    reference.set_target(fetch_commit.id(), "fwsync: fast-forward")?;
                } else {
                    // Remote rewound or rewrote history; the mirror follows it
                    tracing::warn!(branch = %self.branch, "Local history diverged, resetting to remote");
                    reference.set_target(fetch_commit.id(), "fwsync: reset to remote")?;
                }
            }
            Err(_) => {
                repo.branch(&self.branch, &target, true)?;
            }
        }

        repo.set_head(&refname)?;
        repo.checkout_head(Some(git2::build::CheckoutBuilder::default().force()))?;

        tracing::info!(commit = %target.id(), "Distribution synced");
        Ok(self.repo_dir.clone())
    }
}

/// Decrypts by piping ciphertext through `openssl enc -d`
pub struct OpensslDecryptor {
    program: String,
    cipher: String,
    timeout: Duration,
}

impl OpensslDecryptor {
    pub fn new(program: String, cipher: String, timeout: Duration) -> Self {
        Self {
            program,
            cipher,
            timeout,
        }
    }

    fn arguments(&self, key: &KeyMaterial) -> Vec<String> {
        vec![
            "enc".to_string(),
            "-d".to_string(),
            format!("-{}", self.cipher.trim_start_matches('-')),
            "-pbkdf2".to_string(),
            "-pass".to_string(),
            format!("file:{}", key.path().display()),
        ]
    }
}

impl Decryptor for OpensslDecryptor {
    fn decrypt(&self, ciphertext: &[u8], key: &KeyMaterial) -> Result<Vec<u8>, DecryptError> {
        if key.path().as_os_str().is_empty() {
            return Err(DecryptError::Rejected("openssl needs a file-backed key".to_string()));
        }
        let program = tools::locate(&self.program)?;
        let output = ToolCommand::new(program, self.timeout)
            .args(self.arguments(key))
            .stdin(ciphertext.to_vec())
            .run()?;
        Ok(output.stdout)
    }
}

/// Source, decryptor and key bundled for the resolver and retriever
pub struct SecureFetcher {
    source: Box<dyn DistributionSource>,
    decryptor: Box<dyn Decryptor>,
    key: KeyMaterial,
}

impl SecureFetcher {
    pub fn new(source: Box<dyn DistributionSource>, decryptor: Box<dyn Decryptor>, key: KeyMaterial) -> Self {
        Self {
            source,
            decryptor,
            key,
        }
    }

    pub fn sync(&self) -> Result<PathBuf, SourceError> {
        self.source.sync()
    }

    /// Read an artifact from the synced tree, `None` if it does not exist
    pub fn read_artifact(&self, root: &Path, name: &str) -> std::io::Result<Option<Vec<u8>>> {
        let path = root.join(name);
        if !path.is_file() {
            return Ok(None);
        }
        fs::read(&path).map(Some)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptError> {
        self.decryptor.decrypt(ciphertext, &self.key)
    }
}
