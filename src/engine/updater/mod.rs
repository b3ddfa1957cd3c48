//! Firmware Update Pipeline
//!
//! Keeps an attached microcontroller on the latest published firmware.
//!
//! Components:
//! - `fetch` - Distribution sync and artifact decryption
//! - `resolver` - Remote vs. local version comparison
//! - `package` - Package decryption, unpacking and image discovery
//! - `serial` / `handshake` - Update announcement over the device's serial line
//! - `flash` / `uf2` - Image conversion and debug-probe programming
//! - `version_store` - Last successfully flashed version
//! - `state` - Run journal
//! - `orchestrator` - The pipeline itself

pub mod error;
pub mod fetch;
pub mod flash;
pub mod handshake;
pub mod orchestrator;
pub mod package;
pub mod resolver;
pub mod serial;
pub mod state;
pub mod tools;
pub mod uf2;
pub mod verify;
pub mod version_store;

#[cfg(test)]
pub(crate) mod testing;

pub use error::UpdateError;
pub use orchestrator::{Capabilities, PipelineSettings, RunOutcome, UpdateOrchestrator};
pub use resolver::Resolution;
pub use state::{JournalWriter, RunJournal, RunStage};
