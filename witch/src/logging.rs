//! Tracing setup for the backup service.
//!
//! - **stderr**: compact human-readable output, always on.
//! - **application log** (`<data_dir>/backup-witch.log`): the same events without
//!   ANSI colours, appended across runs. The failure notification points here.
//!
//! The sync tool's own log is written by the orchestrator, not by tracing.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "backup_witch=info,warn";
const DEBUG_FILTER: &str = "backup_witch=debug,info";

fn env_filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if debug { DEBUG_FILTER } else { DEFAULT_FILTER })
    })
}

/// Initialize stderr-only tracing. Used by commands that have no data dir.
///
/// Reads `RUST_LOG`, defaulting to `backup_witch=info,warn`.
pub fn init() {
    tracing_subscriber::registry()
        .with(env_filter(false))
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init()
        .ok();
}

/// Initialize stderr tracing plus the application log file under `log_file`.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// lifetime of the process.
///
/// # Example
/// ```bash
/// RUST_LOG=backup_witch=trace backup-witch run --once
/// ```
pub fn init_with_file(log_file: &Path, debug: bool) -> Result<WorkerGuard> {
    let dir = log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).with_context(|| format!("create log dir {}", dir.display()))?;
    let file_name = log_file
        .file_name()
        .context("application log path has no file name")?;

    let appender = tracing_appender::rolling::never(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(env_filter(debug))
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .try_init()
        .ok();
    Ok(guard)
}
