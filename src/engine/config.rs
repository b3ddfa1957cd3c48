//! fwsync Configuration Module
//! Handles loading and validating fwsync.config.json

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::engine::updater::flash::ProgrammerTarget;
use crate::engine::updater::handshake::HandshakeSettings;
use crate::engine::updater::PipelineSettings;

pub const CONFIG_FILE: &str = "fwsync.config.json";

/// Ceiling for any configured timeout, deadline or wait
pub const MAX_CONFIG_SECS: u64 = 7 * 24 * 3600;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
    #[error("Could not determine a default {0} directory, set it explicitly")]
    NoDefaultDir(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub flash: FlashConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

/// Where published firmware comes from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_repo_dir")]
    pub repo_dir: PathBuf,
    /// Cloned into `repo_dir` when no checkout exists yet
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_version_artifact")]
    pub version_artifact: String,
    #[serde(default = "default_package_artifact")]
    pub package_artifact: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
    #[serde(default = "default_crypto_tool")]
    pub tool: String,
    #[serde(default = "default_cipher")]
    pub cipher: String,
    #[serde(default = "default_crypto_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_announce_interval_ms")]
    pub announce_interval_ms: u64,
    #[serde(default = "default_five_minutes")]
    pub announce_deadline_secs: u64,
    #[serde(default = "default_five_minutes")]
    pub default_wait_secs: u64,
    #[serde(default = "default_max_wait")]
    pub max_wait_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashConfig {
    #[serde(default = "default_image_extension")]
    pub image_extension: String,
    /// `native`, or an external program run with `converter_args`
    #[serde(default = "default_converter")]
    pub converter: String,
    /// Arguments for an external converter; `{input}` and `{output}` are substituted
    #[serde(default)]
    pub converter_args: Vec<String>,
    #[serde(default = "default_programmer")]
    pub programmer: String,
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default = "default_base_address")]
    pub base_address: u32,
    #[serde(default)]
    pub adapter_speed_khz: Option<u32>,
    #[serde(default = "default_five_minutes")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
}

fn config_root() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fwsync")
}

fn default_repo_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fwsync")
        .join("distribution")
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_version_artifact() -> String {
    "version.enc".to_string()
}

fn default_package_artifact() -> String {
    "firmware.tar.gz.enc".to_string()
}

fn default_key_file() -> PathBuf {
    config_root().join("firmware.key")
}

fn default_crypto_tool() -> String {
    "openssl".to_string()
}

fn default_cipher() -> String {
    "aes-256-cbc".to_string()
}

fn default_crypto_timeout() -> u64 {
    60
}

fn default_port() -> String {
    "/dev/ttyACM0".to_string()
}

fn default_read_timeout_ms() -> u64 {
    2000
}

fn default_announce_interval_ms() -> u64 {
    1000
}

fn default_five_minutes() -> u64 {
    300
}

fn default_max_wait() -> u64 {
    3600
}

fn default_image_extension() -> String {
    "uf2".to_string()
}

fn default_converter() -> String {
    "native".to_string()
}

fn default_programmer() -> String {
    "openocd".to_string()
}

fn default_interface() -> String {
    "raspberrypi-swd".to_string()
}

fn default_target() -> String {
    "rp2040".to_string()
}

fn default_base_address() -> u32 {
    0x1000_0000
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            repo_dir: default_repo_dir(),
            remote_url: None,
            remote: default_remote(),
            branch: default_branch(),
            version_artifact: default_version_artifact(),
            package_artifact: default_package_artifact(),
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            key_file: default_key_file(),
            tool: default_crypto_tool(),
            cipher: default_cipher(),
            timeout_secs: default_crypto_timeout(),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            read_timeout_ms: default_read_timeout_ms(),
            announce_interval_ms: default_announce_interval_ms(),
            announce_deadline_secs: default_five_minutes(),
            default_wait_secs: default_five_minutes(),
            max_wait_secs: default_max_wait(),
        }
    }
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            image_extension: default_image_extension(),
            converter: default_converter(),
            converter_args: Vec::new(),
            programmer: default_programmer(),
            interface: default_interface(),
            target: default_target(),
            base_address: default_base_address(),
            adapter_speed_khz: None,
            timeout_secs: default_five_minutes(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            crypto: CryptoConfig::default(),
            serial: SerialConfig::default(),
            flash: FlashConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

impl Config {
    /// `<config dir>/fwsync/fwsync.config.json`
    pub fn default_path() -> PathBuf {
        config_root().join(CONFIG_FILE)
    }

    pub fn load(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path.to_path_buf()));
        }
        let content = std::fs::read_to_string(config_path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, config_path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.serial.port.trim().is_empty() {
            return invalid("serial.port must be set");
        }
        if self.serial.read_timeout_ms == 0 {
            return invalid("serial.read_timeout_ms must be non-zero");
        }
        if self.serial.announce_deadline_secs == 0 {
            return invalid("serial.announce_deadline_secs must be non-zero");
        }
        if self.serial.default_wait_secs > self.serial.max_wait_secs {
            return invalid("serial.default_wait_secs exceeds serial.max_wait_secs");
        }
        if self.crypto.timeout_secs == 0 || self.flash.timeout_secs == 0 {
            return invalid("tool timeouts must be non-zero");
        }
        let bounded = [
            ("serial.read_timeout_ms", self.serial.read_timeout_ms / 1000),
            ("serial.announce_interval_ms", self.serial.announce_interval_ms / 1000),
            ("serial.announce_deadline_secs", self.serial.announce_deadline_secs),
            ("serial.default_wait_secs", self.serial.default_wait_secs),
            ("serial.max_wait_secs", self.serial.max_wait_secs),
            ("crypto.timeout_secs", self.crypto.timeout_secs),
            ("flash.timeout_secs", self.flash.timeout_secs),
        ];
        if let Some((name, _)) = bounded.iter().find(|(_, secs)| *secs > MAX_CONFIG_SECS) {
            return Err(ConfigError::Invalid(format!("{} exceeds {} seconds", name, MAX_CONFIG_SECS)));
        }
        if self.flash.image_extension.trim_start_matches('.').is_empty() {
            return invalid("flash.image_extension must be set");
        }
        if self.flash.converter != "native" && self.flash.converter_args.is_empty() {
            return invalid("flash.converter_args are required for an external converter");
        }
        Ok(())
    }

    pub fn state_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.paths.state_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::data_local_dir()
                .map(|d| d.join("fwsync"))
                .ok_or(ConfigError::NoDefaultDir("state")),
        }
    }

    pub fn staging_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.paths.staging_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(self.state_dir()?.join("staging")),
        }
    }

    pub fn handshake_settings(&self) -> HandshakeSettings {
        HandshakeSettings {
            read_timeout: Duration::from_millis(self.serial.read_timeout_ms),
            announce_interval: Duration::from_millis(self.serial.announce_interval_ms),
            deadline: Duration::from_secs(self.serial.announce_deadline_secs),
            default_wait: Duration::from_secs(self.serial.default_wait_secs),
            max_wait: Duration::from_secs(self.serial.max_wait_secs),
        }
    }

    pub fn pipeline_settings(&self) -> Result<PipelineSettings, ConfigError> {
        let state_dir = self.state_dir()?;
        Ok(PipelineSettings {
            version_artifact: self.source.version_artifact.clone(),
            package_artifact: self.source.package_artifact.clone(),
            image_extension: self.flash.image_extension.trim_start_matches('.').to_string(),
            staging_dir: self.staging_dir()?,
            work_dir: state_dir.join("work"),
            handshake: self.handshake_settings(),
            target: ProgrammerTarget {
                interface: self.flash.interface.clone(),
                target: self.flash.target.clone(),
                adapter_speed_khz: self.flash.adapter_speed_khz,
            },
            default_address: self.flash.base_address,
        })
    }
}
