//! Update Orchestrator
//!
//! Runs one update cycle end to end:
//!
//! ```text
//! resolve -> retrieve -> handshake -> flash -> commit
//! ```
//!
//! The persisted version only moves after the programmer reports success, so
//! any failure leaves the next run to retry the same update.

use serde::Serialize;
use std::path::PathBuf;

use super::error::UpdateError;
use super::fetch::SecureFetcher;
use super::flash::{FlashController, ImageConverter, Programmer, ProgrammerTarget};
use super::handshake::{AbortSignal, Clock, HandshakeError, HandshakeProtocol, HandshakeSettings};
use super::package::PackageRetriever;
use super::resolver::{Resolution, VersionResolver};
use super::serial::SerialConnector;
use super::state::{JournalWriter, RunJournal, RunStage};
use super::version_store::VersionStore;

/// Collaborators the pipeline drives
pub struct Capabilities {
    pub fetcher: SecureFetcher,
    pub store: Box<dyn VersionStore>,
    pub connector: Box<dyn SerialConnector>,
    pub converter: Box<dyn ImageConverter>,
    pub programmer: Box<dyn Programmer>,
    pub clock: Box<dyn Clock>,
    pub abort: Box<dyn AbortSignal>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub version_artifact: String,
    pub package_artifact: String,
    pub image_extension: String,
    pub staging_dir: PathBuf,
    /// Scratch directory for converted binaries
    pub work_dir: PathBuf,
    pub handshake: HandshakeSettings,
    pub target: ProgrammerTarget,
    /// Load address when the image format does not carry one
    pub default_address: u32,
}

/// How a completed run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RunOutcome {
    UpToDate {
        local_version: u64,
        remote_version: u64,
    },
    Updated {
        from: u64,
        to: u64,
        acknowledged: Option<u64>,
        wait_secs: u64,
    },
}

pub struct UpdateOrchestrator {
    caps: Capabilities,
    settings: PipelineSettings,
    journal: JournalWriter,
}

impl UpdateOrchestrator {
    pub fn new(caps: Capabilities, settings: PipelineSettings, journal: JournalWriter) -> Self {
        Self {
            caps,
            settings,
            journal,
        }
    }

    pub fn journal(&self) -> &RunJournal {
        self.journal.journal()
    }

    /// Resolve versions without touching the device
    pub fn check(&mut self) -> Result<Resolution, UpdateError> {
        let resolution = self.resolve()?;
        self.journal.update(|j| {
            j.last_check = Some(chrono::Utc::now());
            j.record_versions(resolution.remote_version, resolution.local_version);
        });
        Ok(resolution)
    }

    /// One full update cycle
    pub fn run(&mut self) -> Result<RunOutcome, UpdateError> {
        self.journal.update(|j| j.start_resolving());

        let result = self.execute();
        match &result {
            Ok(RunOutcome::UpToDate { .. }) => self.journal.update(|j| j.reset()),
            Ok(RunOutcome::Updated { to, .. }) => self.journal.update(|j| j.mark_committed(*to)),
            Err(e) => {
                tracing::error!(kind = e.kind(), error = %e, "Update run failed");
                self.journal.update(|j| j.mark_failed(e.kind(), e.to_string()));
            }
        }
        result
    }

    fn resolve(&self) -> Result<Resolution, UpdateError> {
        VersionResolver::new(
            &self.caps.fetcher,
            self.caps.store.as_ref(),
            &self.settings.version_artifact,
        )
        .resolve()
    }

    fn execute(&mut self) -> Result<RunOutcome, UpdateError> {
        let resolution = self.resolve()?;
        self.journal
            .update(|j| j.record_versions(resolution.remote_version, resolution.local_version));

        if !resolution.should_update {
            tracing::info!(version = resolution.local_version, "Device firmware is current, nothing to do");
            return Ok(RunOutcome::UpToDate {
                local_version: resolution.local_version,
                remote_version: resolution.remote_version,
            });
        }
        let version = resolution.remote_version;

        self.journal.update(|j| j.stage = RunStage::Retrieving);
        let package_path = resolution.source_root.join(&self.settings.package_artifact);
        if !package_path.is_file() {
            return Err(UpdateError::ArtifactMissing(package_path));
        }
        let image = PackageRetriever::new(
            &self.caps.fetcher,
            package_path,
            &self.settings.staging_dir,
            &self.settings.image_extension,
        )
        .retrieve()?;
        tracing::info!(image = %image.display(), "Firmware image staged");

        self.journal.update(|j| j.stage = RunStage::Handshaking);
        let protocol = HandshakeProtocol::new(
            self.caps.connector.as_ref(),
            self.caps.clock.as_ref(),
            self.caps.abort.as_ref(),
            self.settings.handshake.clone(),
        );
        let handshake = protocol.negotiate(version).map_err(|e| self.honor_abort(e))?;
        let seconds = handshake.wait.as_secs();
        self.journal.update(|j| j.stage = RunStage::Waiting { seconds });
        protocol.hold(handshake.wait).map_err(|e| self.honor_abort(e))?;

        self.journal.update(|j| j.stage = RunStage::Flashing);
        FlashController::new(
            self.caps.converter.as_ref(),
            self.caps.programmer.as_ref(),
            self.settings.target.clone(),
            self.settings.default_address,
            &self.settings.work_dir,
        )
        .flash(&image)?;

        if let Err(e) = self.caps.store.commit(version) {
            tracing::error!(version, error = %e, "Device flashed but the new version could not be recorded");
            return Err(e.into());
        }
        tracing::info!(from = resolution.local_version, to = version, "Update committed");

        Ok(RunOutcome::Updated {
            from: resolution.local_version,
            to: version,
            acknowledged: handshake.acknowledged,
            wait_secs: seconds,
        })
    }

    fn honor_abort(&self, e: HandshakeError) -> UpdateError {
        if matches!(e, HandshakeError::Cancelled) {
            tracing::warn!("Abort requested, device left untouched");
            self.caps.abort.clear();
        }
        e.into()
    }
}
