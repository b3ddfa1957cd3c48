//! Run Journal
//!
//! Records what the last run did, for `fwsync status` and for operators reading
//! the state directory. Never consulted when deciding whether to update.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Stage the pipeline is in (or stopped at)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStage {
    /// No run in progress
    Idle,
    /// Pulling the distribution and comparing versions
    Resolving,
    /// Decrypting and unpacking the package
    Retrieving,
    /// Announcing to the device
    Handshaking,
    /// Device-requested (or default) delay before flashing
    Waiting { seconds: u64 },
    /// Converting and programming
    Flashing,
    /// Device flashed, version persisted
    Committed { version: u64 },
    /// Run aborted
    Failed { kind: String, reason: String },
}

impl Default for RunStage {
    fn default() -> Self {
        Self::Idle
    }
}

/// Journal persisted next to the version file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunJournal {
    pub stage: RunStage,
    pub last_check: Option<DateTime<Utc>>,
    pub last_remote_version: Option<u64>,
    pub last_local_version: Option<u64>,
    pub last_success: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
}

impl RunJournal {
    /// Load from disk, or start empty if absent
    pub fn load(path: &Path) -> Result<Self, StateError> {
        if path.exists() {
            let content = fs::read_to_string(path).map_err(|e| StateError::ReadError(e.to_string()))?;
            serde_json::from_str(&content).map_err(|e| StateError::ParseError(e.to_string()))
        } else {
            Ok(Self::default())
        }
    }

    /// Save to disk atomically
    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        let content = serde_json::to_string_pretty(self).map_err(|e| StateError::SerializeError(e.to_string()))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StateError::WriteError(e.to_string()))?;
        }
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &content).map_err(|e| StateError::WriteError(e.to_string()))?;
        fs::rename(&temp_path, path).map_err(|e| StateError::WriteError(e.to_string()))?;

        Ok(())
    }

    pub fn start_resolving(&mut self) {
        self.stage = RunStage::Resolving;
        self.last_check = Some(Utc::now());
        self.pid = Some(std::process::id());
    }

    pub fn record_versions(&mut self, remote: u64, local: u64) {
        self.last_remote_version = Some(remote);
        self.last_local_version = Some(local);
    }

    pub fn mark_committed(&mut self, version: u64) {
        self.stage = RunStage::Committed { version };
        self.last_local_version = Some(version);
        self.last_success = Some(Utc::now());
        self.pid = None;
    }

    pub fn mark_failed(&mut self, kind: &str, reason: String) {
        self.stage = RunStage::Failed {
            kind: kind.to_string(),
            reason,
        };
        self.pid = None;
    }

    /// Back to idle after a no-op run
    pub fn reset(&mut self) {
        self.stage = RunStage::Idle;
        self.pid = None;
    }
}

/// Journal bound to its file; write failures are logged, never fatal
pub struct JournalWriter {
    path: PathBuf,
    journal: RunJournal,
}

impl JournalWriter {
    pub fn open(path: PathBuf) -> Self {
        let journal = RunJournal::load(&path).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Run journal unreadable, starting fresh");
            RunJournal::default()
        });
        Self { path, journal }
    }

    pub fn journal(&self) -> &RunJournal {
        &self.journal
    }

    pub fn update(&mut self, change: impl FnOnce(&mut RunJournal)) {
        change(&mut self.journal);
        if let Err(e) = self.journal.save(&self.path) {
            tracing::warn!(error = %e, "Failed to write run journal");
        }
    }
}

/// Journal errors
#[derive(Debug, Clone)]
pub enum StateError {
    ReadError(String),
    WriteError(String),
    ParseError(String),
    SerializeError(String),
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadError(e) => write!(f, "Failed to read journal: {}", e),
            Self::WriteError(e) => write!(f, "Failed to write journal: {}", e),
            Self::ParseError(e) => write!(f, "Failed to parse journal: {}", e),
            Self::SerializeError(e) => write!(f, "Failed to serialize journal: {}", e),
        }
    }
}

impl std::error::Error for StateError {}
