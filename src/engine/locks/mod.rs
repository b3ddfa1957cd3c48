//! Run Lock
//!
//! Keeps two update runs (say, a cron tick and a manual invocation) from
//! driving the same device at once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

const LOCK_FILE: &str = "run.lock";
const PUBLISH_ATTEMPTS: usize = 3;
/// An unparseable lock this young may still be mid-write by a peer
const UNREADABLE_GRACE: Duration = Duration::from_secs(30);

/// Information stored in the lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub description: String,
    pub timeout_secs: Option<u64>,
}

impl LockInfo {
    pub fn new(description: &str) -> Self {
        Self {
            pid: std::process::id(),
            started_at: Utc::now(),
            description: description.to_string(),
            timeout_secs: None,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Check if lock has expired
    pub fn is_expired(&self) -> bool {
        if let Some(timeout) = self.timeout_secs {
            let elapsed = Utc::now().signed_duration_since(self.started_at);
            elapsed.num_seconds().max(0) as u64 > timeout
        } else {
            false
        }
    }

    /// Check if the process that created the lock is still running
    pub fn is_process_alive(&self) -> bool {
        #[cfg(unix)]
        {
            use std::process::Command;
            Command::new("kill")
                .args(["-0", &self.pid.to_string()])
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false)
        }

        #[cfg(windows)]
        {
            use std::process::Command;
            Command::new("tasklist")
                .args(["/FI", &format!("PID eq {}", self.pid)])
                .output()
                .map(|o| String::from_utf8_lossy(&o.stdout).contains(&self.pid.to_string()))
                .unwrap_or(false)
        }

        #[cfg(not(any(unix, windows)))]
        true
    }

    fn is_live(&self) -> bool {
        self.is_process_alive() && !self.is_expired()
    }
}

/// Lock over the state directory
pub struct RunLock {
    locks_dir: PathBuf,
}

impl RunLock {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            locks_dir: state_dir.join("locks"),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.locks_dir.join(LOCK_FILE)
    }

    /// Acquire the lock, replacing it if its holder is gone
    pub fn acquire(&self, info: LockInfo) -> Result<LockGuard, LockError> {
        fs::create_dir_all(&self.locks_dir).map_err(|e| LockError::IoError(e.to_string()))?;

        let content = serde_json::to_string_pretty(&info).map_err(|e| LockError::SerializeError(e.to_string()))?;

        // Fully written before it is linked into place, so no reader sees it half done
        let staged = self.private_path("new");
        fs::write(&staged, content).map_err(|e| LockError::IoError(e.to_string()))?;
        let result = self.publish(&staged);
        let _ = fs::remove_file(&staged);

        let lock_path = self.path();
        result.map(|()| LockGuard { lock_path })
    }

    /// Current live holder, if any
    pub fn holder(&self) -> Option<LockInfo> {
        self.holder_at(&self.path()).filter(LockInfo::is_live)
    }

    fn holder_at(&self, path: &Path) -> Option<LockInfo> {
        fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
    }

    fn private_path(&self, purpose: &str) -> PathBuf {
        self.locks_dir
            .join(format!("{}.{}.{}", LOCK_FILE, std::process::id(), purpose))
    }

    fn publish(&self, staged: &Path) -> Result<(), LockError> {
        let lock_path = self.path();
        for attempt in 0..PUBLISH_ATTEMPTS {
            match fs::hard_link(staged, &lock_path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if attempt + 1 < PUBLISH_ATTEMPTS {
                        self.clear_stale(&lock_path)?;
                    }
                }
                Err(e) => return Err(LockError::IoError(e.to_string())),
            }
        }
        Err(self.held_by(&lock_path))
    }

    /// Move a dead holder's lock out of the way; errors if the holder is live
    fn clear_stale(&self, lock_path: &Path) -> Result<(), LockError> {
        let observed = match fs::read(lock_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(LockError::IoError(e.to_string())),
        };

        match serde_json::from_slice::<LockInfo>(&observed) {
            Ok(existing) if existing.is_live() => {
                return Err(LockError::AlreadyLocked {
                    pid: existing.pid,
                    description: existing.description,
                    since: existing.started_at,
                });
            }
            Ok(existing) => tracing::warn!(pid = existing.pid, "Replacing stale run lock"),
            Err(_) if modified_within(lock_path, UNREADABLE_GRACE) => return Err(self.held_by(lock_path)),
            Err(_) => tracing::warn!(path = %lock_path.display(), "Replacing unreadable run lock"),
        }

        let retired = self.private_path("stale");
        match fs::rename(lock_path, &retired) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(LockError::IoError(e.to_string())),
        }

        let moved = fs::read(&retired).unwrap_or_default();
        let result = if moved == observed {
            Ok(())
        } else {
            // Another run replaced the stale lock first; hand its lock back
            tracing::debug!("Run lock changed while being replaced, restoring it");
            if let Err(e) = fs::hard_link(&retired, lock_path) {
                tracing::debug!(error = %e, "Run lock already retaken");
            }
            Err(self.held_by(lock_path))
        };
        let _ = fs::remove_file(&retired);
        result
    }

    fn held_by(&self, lock_path: &Path) -> LockError {
        let holder = self.holder_at(lock_path);
        LockError::AlreadyLocked {
            pid: holder.as_ref().map(|h| h.pid).unwrap_or(0),
            description: holder
                .as_ref()
                .map(|h| h.description.clone())
                .unwrap_or_else(|| "lock being written".to_string()),
            since: holder.map(|h| h.started_at).unwrap_or_else(Utc::now),
        }
    }
}

fn modified_within(path: &Path, window: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|t| t.elapsed().map(|age| age < window).unwrap_or(true))
        .unwrap_or(false)
}

/// RAII guard that releases lock on drop
pub struct LockGuard {
    lock_path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

/// Lock errors
#[derive(Debug, Clone)]
pub enum LockError {
    AlreadyLocked {
        pid: u32,
        description: String,
        since: DateTime<Utc>,
    },
    IoError(String),
    SerializeError(String),
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::AlreadyLocked { pid, description, since } => {
                write!(f, "Another run holds the lock (PID {}, since {}): {}", pid, since.to_rfc3339(), description)
            }
            LockError::IoError(e) => write!(f, "IO error: {}", e),
            LockError::SerializeError(e) => write!(f, "Serialize error: {}", e),
        }
    }
}

impl std::error::Error for LockError {}
