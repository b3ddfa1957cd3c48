//! fwsync CLI - Main entry point for CLI binary
//!
//! Meant to be run from a scheduler (cron, systemd timer). The exit code says
//! how the run ended; see `UpdateError::exit_code`.

use anyhow::Context;
use clap::Parser;
use fwsync_lib::engine::{
    cli::formatter::{format_duration, format_version, CliFormatter},
    cli::{Cli, Commands, OutputFormat},
    config::{Config, ConfigError},
    locks::{LockError, LockGuard, LockInfo, RunLock},
    updater::{
        fetch::{GitSource, KeyMaterial, OpensslDecryptor, SecureFetcher},
        flash::{CommandConverter, ImageConverter, NativeConverter, OpenOcdProgrammer},
        handshake::{AbortFile, MonotonicClock},
        serial::SerialPortConnector,
        version_store::{FileVersionStore, VersionStore},
        Capabilities, JournalWriter, RunJournal, RunOutcome, RunStage, UpdateError, UpdateOrchestrator,
    },
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const EXIT_FAILURE: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_LOCKED: u8 = 17;

/// Why the command failed, carrying its exit code
enum Failure {
    Update(UpdateError),
    Locked(LockError),
    Config(anyhow::Error),
    Other(anyhow::Error),
}

impl Failure {
    fn exit_code(&self) -> u8 {
        match self {
            Failure::Update(e) => e.exit_code(),
            Failure::Locked(_) => EXIT_LOCKED,
            Failure::Config(_) => EXIT_CONFIG,
            Failure::Other(_) => EXIT_FAILURE,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Failure::Update(e) => e.kind(),
            Failure::Locked(_) => "locked",
            Failure::Config(_) => "config",
            Failure::Other(_) => "error",
        }
    }

    fn message(&self) -> String {
        match self {
            Failure::Update(e) => e.to_string(),
            Failure::Locked(e) => e.to_string(),
            Failure::Config(e) | Failure::Other(e) => format!("{:#}", e),
        }
    }
}

impl From<UpdateError> for Failure {
    fn from(e: UpdateError) -> Self {
        Failure::Update(e)
    }
}

impl From<LockError> for Failure {
    fn from(e: LockError) -> Self {
        Failure::Locked(e)
    }
}

impl From<ConfigError> for Failure {
    fn from(e: ConfigError) -> Self {
        Failure::Config(e.into())
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let json = cli.format == OutputFormat::Json;
    match run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "success": false,
                        "kind": failure.kind(),
                        "error": failure.message(),
                        "exit_code": failure.exit_code(),
                    })
                );
            } else {
                CliFormatter::error(&failure.message());
            }
            ExitCode::from(failure.exit_code())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("FWSYNC_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run_cli(cli: Cli) -> Result<(), Failure> {
    let config_path = cli.get_config_path();
    let json = cli.format == OutputFormat::Json;

    match cli.command {
        Commands::Run => cmd_run(&config_path, json),
        Commands::Check => cmd_check(&config_path, json),
        Commands::Status => cmd_status(&config_path, json),
        Commands::Init {
            port,
            repo_dir,
            remote_url,
            key_file,
            force,
        } => cmd_init(&config_path, port, repo_dir, remote_url, key_file, force, json).map_err(Failure::Other),
    }
}

fn load_config(path: &Path) -> Result<Config, Failure> {
    Config::load(path)
        .with_context(|| format!("Could not load configuration from {}", path.display()))
        .map_err(Failure::Config)
}

/// Hold the run lock for as long as a run may legitimately take
fn acquire_lock(config: &Config, state_dir: &Path, description: &str) -> Result<LockGuard, Failure> {
    let budget = [
        config.serial.announce_deadline_secs,
        config.serial.max_wait_secs,
        config.flash.timeout_secs.saturating_mul(2),
        config.crypto.timeout_secs.saturating_mul(2),
        600,
    ]
    .into_iter()
    .fold(0u64, u64::saturating_add);
    Ok(RunLock::new(state_dir).acquire(LockInfo::new(description).with_timeout(budget))?)
}

fn build_orchestrator(config: &Config, state_dir: &Path) -> Result<UpdateOrchestrator, Failure> {
    let key = KeyMaterial::load(&config.crypto.key_file).map_err(UpdateError::from)?;
    let source = GitSource::new(
        config.source.repo_dir.clone(),
        config.source.remote_url.clone(),
        config.source.remote.clone(),
        config.source.branch.clone(),
    );
    let decryptor = OpensslDecryptor::new(
        config.crypto.tool.clone(),
        config.crypto.cipher.clone(),
        Duration::from_secs(config.crypto.timeout_secs),
    );

    let flash_timeout = Duration::from_secs(config.flash.timeout_secs);
    let converter: Box<dyn ImageConverter> = if config.flash.converter == "native" {
        Box::new(NativeConverter)
    } else {
        Box::new(CommandConverter::new(
            config.flash.converter.clone(),
            config.flash.converter_args.clone(),
            flash_timeout,
        ))
    };

    let caps = Capabilities {
        fetcher: SecureFetcher::new(Box::new(source), Box::new(decryptor), key),
        store: Box::new(FileVersionStore::in_dir(state_dir)),
        connector: Box::new(SerialPortConnector::new(config.serial.port.clone())),
        converter,
        programmer: Box::new(OpenOcdProgrammer::new(config.flash.programmer.clone(), flash_timeout)),
        clock: Box::new(MonotonicClock),
        abort: Box::new(AbortFile::new(state_dir.join("abort"))),
    };

    Ok(UpdateOrchestrator::new(
        caps,
        config.pipeline_settings()?,
        JournalWriter::open(state_dir.join("journal.json")),
    ))
}

fn cmd_run(config_path: &Path, json: bool) -> Result<(), Failure> {
    let config = load_config(config_path)?;
    let state_dir = config.state_dir()?;
    let _lock = acquire_lock(&config, &state_dir, "fwsync run")?;

    let mut orchestrator = build_orchestrator(&config, &state_dir)?;
    let outcome = orchestrator.run()?;

    if json {
        println!("{}", serde_json::json!({ "success": true, "outcome": outcome }));
        return Ok(());
    }

    match outcome {
        RunOutcome::UpToDate { local_version, .. } => {
            CliFormatter::success(&format!("Firmware is current (version {})", format_version(Some(local_version))));
        }
        RunOutcome::Updated {
            from,
            to,
            acknowledged,
            wait_secs,
        } => {
            CliFormatter::success(&format!("Flashed firmware version {} (was {})", to, format_version(Some(from))));
            match acknowledged {
                Some(_) => CliFormatter::kv("Device acknowledged", "yes"),
                None => CliFormatter::kv("Device acknowledged", "no (default wait)"),
            }
            CliFormatter::kv("Waited", &format_duration(wait_secs));
        }
    }
    Ok(())
}

fn cmd_check(config_path: &Path, json: bool) -> Result<(), Failure> {
    let config = load_config(config_path)?;
    let state_dir = config.state_dir()?;
    let _lock = acquire_lock(&config, &state_dir, "fwsync check")?;

    let mut orchestrator = build_orchestrator(&config, &state_dir)?;
    let resolution = orchestrator.check()?;

    if json {
        println!("{}", serde_json::json!({ "success": true, "resolution": resolution }));
    } else {
        CliFormatter::header("Version check");
        CliFormatter::kv("Remote", &format_version(Some(resolution.remote_version)));
        CliFormatter::kv("Local", &format_version(Some(resolution.local_version)));
        if resolution.should_update {
            CliFormatter::info("An update is available; `fwsync run` will flash it");
        } else {
            CliFormatter::success("Firmware is current");
        }
    }
    Ok(())
}

fn describe_stage(stage: &RunStage) -> String {
    match stage {
        RunStage::Idle => "idle".to_string(),
        RunStage::Resolving => "resolving versions".to_string(),
        RunStage::Retrieving => "retrieving package".to_string(),
        RunStage::Handshaking => "announcing to device".to_string(),
        RunStage::Waiting { seconds } => format!("waiting {} for device", format_duration(*seconds)),
        RunStage::Flashing => "flashing".to_string(),
        RunStage::Committed { version } => format!("committed version {}", version),
        RunStage::Failed { kind, reason } => format!("failed ({}): {}", kind, reason),
    }
}

fn cmd_status(config_path: &Path, json: bool) -> Result<(), Failure> {
    let config = load_config(config_path)?;
    let state_dir = config.state_dir()?;

    let local = FileVersionStore::in_dir(&state_dir).read().map_err(UpdateError::from)?;
    let journal_path = state_dir.join("journal.json");
    let journal = RunJournal::load(&journal_path).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Run journal unreadable");
        RunJournal::default()
    });
    let holder = RunLock::new(&state_dir).holder();

    if json {
        println!(
            "{}",
            serde_json::json!({
                "local_version": local,
                "state_dir": state_dir.display().to_string(),
                "journal": journal,
                "lock": holder,
            })
        );
        return Ok(());
    }

    CliFormatter::header("fwsync status");
    CliFormatter::kv("Local version", &format_version(local));
    CliFormatter::kv("Serial port", &config.serial.port);
    CliFormatter::kv("State dir", &state_dir.display().to_string());
    CliFormatter::kv(
        "Last check",
        &journal
            .last_check
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string()),
    );
    CliFormatter::kv("Last run", &describe_stage(&journal.stage));
    if let Some(remote) = journal.last_remote_version {
        CliFormatter::kv("Last seen remote", &remote.to_string());
    }
    match holder {
        Some(info) => CliFormatter::warning(&format!(
            "Run in progress (PID {}, since {})",
            info.pid,
            info.started_at.to_rfc3339()
        )),
        None => CliFormatter::info("No run in progress"),
    }
    Ok(())
}

fn cmd_init(
    config_path: &Path,
    port: Option<String>,
    repo_dir: Option<PathBuf>,
    remote_url: Option<String>,
    key_file: Option<PathBuf>,
    force: bool,
    json: bool,
) -> anyhow::Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "Configuration already exists at {} (use --force to overwrite)",
            config_path.display()
        );
    }

    let mut config = Config::default();
    if let Some(port) = port {
        config.serial.port = port;
    }
    if let Some(repo_dir) = repo_dir {
        config.source.repo_dir = repo_dir;
    }
    if let Some(key_file) = key_file {
        config.crypto.key_file = key_file;
    }
    config.source.remote_url = remote_url;
    config.validate()?;
    config
        .save(config_path)
        .with_context(|| format!("Could not write {}", config_path.display()))?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "success": true,
                "config": config_path.display().to_string(),
            })
        );
    } else {
        CliFormatter::success(&format!("Wrote {}", config_path.display()));
        CliFormatter::kv("Serial port", &config.serial.port);
        CliFormatter::kv("Distribution", &config.source.repo_dir.display().to_string());
        CliFormatter::kv("Key file", &config.crypto.key_file.display().to_string());
        if !config.crypto.key_file.exists() {
            CliFormatter::warning("Key file does not exist yet; install it before the first run");
        }
    }
    Ok(())
}
