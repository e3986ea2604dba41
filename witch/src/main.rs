//! Periodic versioned backups driven by rclone.
//!
//! Reads `backup-witch.toml`, then runs the backup service until it is
//! interrupted or fails. Persistent state lives in `<data_dir>/state.json`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use backup_witch::backup::{BACKUP_NAMESPACE, BackupOrchestrator};
use backup_witch::core::classifier::LogClassifier;
use backup_witch::core::types::{ErrorClassification, IgnoreFlags};
use backup_witch::error::{Diagnosis, WitchError};
use backup_witch::exit_codes;
use backup_witch::io::config::{DEFAULT_CONFIG_FILE, WitchConfig, load_config};
use backup_witch::io::notify::notify_failure;
use backup_witch::io::state_store::StateStore;
use backup_witch::logging;
use backup_witch::scheduler::{IntervalScheduler, SchedulerStop};
use backup_witch::service::Service;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(
    name = "backup-witch",
    version,
    about = "Periodic versioned backups driven by rclone"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the backup service until interrupted or an error occurs.
    Run {
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        /// Run a single backup and exit, ignoring `interval_secs`.
        #[arg(long)]
        once: bool,
    },
    /// Classify an existing sync log and print the lines that would be fatal.
    CheckLog {
        file: PathBuf,
        /// Take ignore flags from this config instead of the defaults.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print the persisted service state.
    State {
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
    /// Load and validate the config file.
    Validate {
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run { config, once } => cmd_run(&config, once).await,
        Command::CheckLog { file, config } => report(cmd_check_log(&file, config.as_deref())),
        Command::State { config } => report(cmd_state(&config).map(|()| exit_codes::OK)),
        Command::Validate { config } => report(cmd_validate(&config).map(|()| exit_codes::OK)),
    };
    std::process::exit(code);
}

fn report(result: Result<i32>) -> i32 {
    result.unwrap_or_else(|err| {
        eprintln!("{err:#}");
        exit_codes::FAILURE
    })
}

async fn cmd_run(config_path: &Path, once: bool) -> i32 {
    let cfg = match load_config(config_path) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("{err:#}");
            return exit_codes::FAILURE;
        }
    };
    let _guard = match logging::init_with_file(&cfg.app_log_file(), cfg.debug) {
        Ok(guard) => Some(guard),
        Err(err) => {
            logging::init();
            warn!(err = %format!("{err:#}"), "application log file unavailable");
            None
        }
    };

    match run_service(&cfg, once).await {
        Ok(stop) => {
            info!(?stop, "backup service stopped");
            exit_codes::OK
        }
        Err(err) => {
            let code = exit_code_for(&err);
            if err.diagnosis() == Diagnosis::Unclassified {
                error!(err = %format!("{err:#}"), "backup service failed");
            }
            if cfg.debug {
                eprintln!("{err:?}");
            } else {
                let command = cfg.notify.command.clone();
                let log_file = cfg.app_log_file();
                let message = err.to_string();
                let sent = tokio::task::spawn_blocking(move || {
                    notify_failure(&command, &log_file, &message);
                })
                .await;
                if let Err(join) = sent {
                    warn!(err = %join, "notification task failed");
                }
            }
            code
        }
    }
}

async fn run_service(cfg: &WitchConfig, once: bool) -> Result<SchedulerStop, WitchError> {
    let scheduler = match cfg.interval() {
        Some(interval) if !once => IntervalScheduler::periodic(interval)?,
        _ => IntervalScheduler::one_shot(),
    };
    let store = Arc::new(StateStore::open_json(cfg.state_file())?);
    let service = Service::new(
        scheduler,
        store,
        BACKUP_NAMESPACE,
        BackupOrchestrator::from_config(cfg),
    )?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; stopping after the current backup");
            on_signal.cancel();
        }
    });

    info!(
        source = %cfg.source.display(),
        destination = %cfg.destination_latest().display(),
        interval = ?service.scheduler().interval(),
        "backup service starting"
    );
    service.run(&cancel).await
}

fn exit_code_for(err: &WitchError) -> i32 {
    match err {
        WitchError::Sync { .. } => exit_codes::FATAL_LOG,
        _ => exit_codes::FAILURE,
    }
}

fn cmd_check_log(file: &Path, config: Option<&Path>) -> Result<i32> {
    let flags = match config {
        Some(path) => load_config(path)?.ignore,
        None => IgnoreFlags::default(),
    };
    let log = fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    let classification = LogClassifier::new(flags).classify(&log);
    for line in classification.covered() {
        println!("ignored\t{}\t{:?}\t{}", line.line_no, line.signature, line.text);
    }
    match classification {
        ErrorClassification::Ignorable { .. } => Ok(exit_codes::OK),
        ErrorClassification::Fatal { offending, .. } => {
            for line in &offending {
                println!("fatal\t{}\t{:?}\t{}", line.line_no, line.reason, line.text);
            }
            Ok(exit_codes::FATAL_LOG)
        }
    }
}

fn cmd_state(config: &Path) -> Result<()> {
    let cfg = load_config(config)?;
    let store = StateStore::open_json(cfg.state_file())?;
    let payload =
        serde_json::to_string_pretty(&store.snapshot()).context("serialize state")?;
    println!("{payload}");
    Ok(())
}

fn cmd_validate(config: &Path) -> Result<()> {
    let cfg = load_config(config)?;
    println!(
        "ok: {} -> {} ({})",
        cfg.source.display(),
        cfg.destination_latest().display(),
        match cfg.interval_secs {
            Some(secs) => format!("every {secs}s"),
            None => "single run".to_string(),
        }
    );
    Ok(())
}
