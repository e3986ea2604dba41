//! Shared deterministic types for log classification.
//!
//! These types define stable contracts between the classifier and the
//! orchestrator. They do not depend on external state or I/O.

use serde::{Deserialize, Serialize};

/// Error signatures recognized in sync-tool log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSignature {
    /// A source file or directory could not be read.
    PermissionDenied,
    /// A file changed while it was being uploaded.
    PartiallyWrittenFile,
    /// Aggregate retry/failure line restating earlier errors.
    RetrySummary,
    /// Error-level line with no known signature.
    Unrecognized,
}

/// Per-signature ignore switches.
///
/// Only signatures with a corresponding flag can ever be ignored;
/// [`ErrorSignature::Unrecognized`] is always fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IgnoreFlags {
    /// Ignore `permission denied` errors reported for the backup source.
    pub permission_denied_on_source: bool,
    /// Ignore errors for files that were modified during upload.
    pub partially_written_files: bool,
}

impl Default for IgnoreFlags {
    fn default() -> Self {
        Self {
            permission_denied_on_source: true,
            partially_written_files: true,
        }
    }
}

impl IgnoreFlags {
    pub fn all_enabled() -> Self {
        Self {
            permission_denied_on_source: true,
            partially_written_files: true,
        }
    }

    pub fn none_enabled() -> Self {
        Self {
            permission_denied_on_source: false,
            partially_written_files: false,
        }
    }
}

/// Why a log line made the classification fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalReason {
    /// The line matches a signature whose ignore flag is disabled (or has none).
    NotIgnored(ErrorSignature),
    /// The line does not have any recognized shape.
    Unparseable,
}

/// A log line that caused a fatal classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffendingLine {
    /// 1-based line number within the captured output.
    pub line_no: usize,
    pub text: String,
    pub reason: FatalReason,
}

/// An error line that was tolerated because its ignore flag is enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoveredLine {
    pub line_no: usize,
    pub text: String,
    pub signature: ErrorSignature,
}

/// Outcome of inspecting one sync run's log output.
///
/// Only error lines are carried in `covered`; info noise is not retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClassification {
    Ignorable {
        covered: Vec<CoveredLine>,
    },
    Fatal {
        offending: Vec<OffendingLine>,
        covered: Vec<CoveredLine>,
    },
}

impl ErrorClassification {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorClassification::Fatal { .. })
    }

    pub fn offending(&self) -> &[OffendingLine] {
        match self {
            ErrorClassification::Ignorable { .. } => &[],
            ErrorClassification::Fatal { offending, .. } => offending,
        }
    }

    pub fn covered(&self) -> &[CoveredLine] {
        match self {
            ErrorClassification::Ignorable { covered }
            | ErrorClassification::Fatal { covered, .. } => covered,
        }
    }
}
