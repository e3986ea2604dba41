//! Sync tool abstraction for the versioned mirror step.
//!
//! The [`SyncTool`] trait decouples the orchestrator from the actual sync
//! backend (currently `rclone sync`). Tests use scripted tools that return
//! predetermined output without spawning processes.

use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::flags::split_flag;
use crate::io::process::run_command;

/// Maximum captured sync output kept in memory per invocation.
pub const DEFAULT_SYNC_OUTPUT_LIMIT_BYTES: usize = 8 * 1024 * 1024;

/// Parameters for one sync invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub source: PathBuf,
    /// Mirror of the source (destination-latest).
    pub destination: PathBuf,
    /// Version-archive root (destination-previous).
    pub version_root: PathBuf,
    /// Token naming this tick's version folder. Computed once per tick.
    pub timestamp: String,
    pub filter_flags: Vec<String>,
    pub additional_flags: Vec<String>,
}

impl SyncRequest {
    /// Folder receiving every file superseded during this invocation.
    pub fn version_folder(&self) -> PathBuf {
        self.version_root.join(&self.timestamp)
    }
}

/// Exit status and combined output of one sync invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutput {
    pub exit_code: Option<i32>,
    pub success: bool,
    pub output: String,
    /// Bytes produced by the tool beyond the capture limit. Never inspected.
    pub dropped_bytes: usize,
}

/// Abstraction over sync backends.
pub trait SyncTool: Send + Sync {
    /// Run one invocation. Only failures to run the tool at all are errors;
    /// the tool's own failures are reported through [`SyncOutput`].
    fn sync(&self, request: &SyncRequest) -> Result<SyncOutput>;
}

/// Sync tool that spawns `rclone sync --backup-dir`.
#[derive(Debug, Clone)]
pub struct RcloneSync {
    binary: PathBuf,
    output_limit_bytes: usize,
}

impl RcloneSync {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            output_limit_bytes: DEFAULT_SYNC_OUTPUT_LIMIT_BYTES,
        }
    }

    /// Cap on captured output per stream. Anything beyond it is counted in
    /// [`SyncOutput::dropped_bytes`].
    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = bytes;
        self
    }

    /// Build the rclone invocation for `request`.
    pub fn command(&self, request: &SyncRequest) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("sync")
            .arg(&request.source)
            .arg(&request.destination)
            .arg("--backup-dir")
            .arg(request.version_folder())
            // Symlinks are stored as `.rclonelink` files unless filters ask to follow them.
            .arg("--links");
        for entry in request.filter_flags.iter().chain(&request.additional_flags) {
            cmd.args(split_flag(entry));
        }
        cmd
    }
}

impl SyncTool for RcloneSync {
    #[instrument(skip_all, fields(timestamp = %request.timestamp))]
    fn sync(&self, request: &SyncRequest) -> Result<SyncOutput> {
        info!(
            source = %request.source.display(),
            destination = %request.destination.display(),
            "starting rclone sync"
        );
        let output = run_command(self.command(request), None, self.output_limit_bytes)
            .context("run rclone sync")?;
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "rclone sync exited unsuccessfully");
        } else {
            debug!("rclone sync completed");
        }
        Ok(SyncOutput {
            exit_code: output.status.code(),
            success: output.status.success(),
            output: output.combined(),
            dropped_bytes: output.stdout_truncated + output.stderr_truncated,
        })
    }
}
