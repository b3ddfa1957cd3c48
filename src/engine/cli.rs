//! fwsync CLI Module
//! Command-line interface for the firmware update pipeline

pub mod formatter;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::engine::config::Config;

#[derive(Parser, Debug)]
#[command(name = "fwsync")]
#[command(version)]
#[command(about = "Keeps an attached microcontroller on the latest published firmware", long_about = None)]
pub struct Cli {
    /// Config file (defaults to the per-user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Debug logging (FWSYNC_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one update cycle: check, announce, flash, commit
    Run,

    /// Compare remote and local versions without touching the device
    Check,

    /// Show the local version, last run and lock holder
    Status,

    /// Write a default configuration file
    Init {
        /// Serial port the device is attached to
        #[arg(long)]
        port: Option<String>,

        /// Distribution checkout directory
        #[arg(long)]
        repo_dir: Option<PathBuf>,

        /// Remote to clone from when no checkout exists
        #[arg(long)]
        remote_url: Option<String>,

        /// Key file for artifact decryption
        #[arg(long)]
        key_file: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

impl Cli {
    pub fn get_config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(Config::default_path)
    }
}
