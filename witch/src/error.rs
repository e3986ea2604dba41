//! Error taxonomy for the orchestration engine.
//!
//! Every error raised while a service runs propagates unchanged to the caller of
//! [`Service::run`](crate::service::Service::run). The process-level caller uses
//! [`WitchError::diagnosis`] to decide whether the error still needs logging.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::core::types::OffendingLine;

/// Whether the diagnostic detail of an error has already been written to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnosis {
    /// The component that raised the error already logged everything useful.
    AlreadyDiagnosed,
    /// The outer handler is responsible for logging the error.
    Unclassified,
}

/// Hook pipeline phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    Pre,
    Post,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookPhase::Pre => f.write_str("pre-backup"),
            HookPhase::Post => f.write_str("post-backup"),
        }
    }
}

/// Why a sync invocation was judged fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncFailure {
    /// The log contained lines that are not covered by the enabled ignore flags.
    FatalLog,
    /// The tool exited unsuccessfully without producing any output.
    Crashed { exit_code: Option<i32> },
    /// Part of the output was dropped at the capture limit, so the run cannot
    /// be judged clean.
    OutputTruncated { dropped_bytes: usize },
}

impl fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncFailure::FatalLog => f.write_str("sync log contains fatal errors"),
            SyncFailure::Crashed {
                exit_code: Some(code),
            } => write!(f, "sync tool exited with status {code} and no output"),
            SyncFailure::Crashed { exit_code: None } => {
                f.write_str("sync tool was terminated without output")
            }
            SyncFailure::OutputTruncated { dropped_bytes } => write!(
                f,
                "sync output exceeded the capture limit; {dropped_bytes} bytes were not inspected"
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum WitchError {
    #[error("scheduler is already running")]
    AlreadyRunning,

    #[error("state file {path}: {message}")]
    Persistence { path: PathBuf, message: String },

    #[error("{phase} hook '{hook}' failed: {source:#}")]
    Hook {
        phase: HookPhase,
        hook: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{reason} (see {})", log_file.display())]
    Sync {
        reason: SyncFailure,
        lines: Vec<OffendingLine>,
        log_file: PathBuf,
    },

    #[error("sync invocation failed: {0:#}")]
    SyncInvocation(#[source] anyhow::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid state namespace '{0}': must be non-empty and must not contain ':'")]
    InvalidNamespace(String),
}

impl WitchError {
    pub fn persistence(path: impl Into<PathBuf>, message: impl fmt::Display) -> Self {
        WitchError::Persistence {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Sync failures carry their classified log lines, which the orchestrator has
    /// already logged; everything else still needs to be reported.
    pub fn diagnosis(&self) -> Diagnosis {
        match self {
            WitchError::Sync { .. } => Diagnosis::AlreadyDiagnosed,
            _ => Diagnosis::Unclassified,
        }
    }
}

pub type Result<T> = std::result::Result<T, WitchError>;
