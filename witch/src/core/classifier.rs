//! Deterministic classification of sync-tool log output.
//!
//! rclone writes one entry per line in the shape
//! `YYYY/MM/DD HH:MM:SS LEVEL : message`, optionally interleaved with its
//! periodic stats block. Every line must have one of those shapes: anything
//! else is unparseable and makes the run fatal, because a format change in the
//! tool must never be mistaken for a clean run.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{
    CoveredLine, ErrorClassification, ErrorSignature, FatalReason, IgnoreFlags, OffendingLine,
};

static ENTRY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2}(?:\.\d+)? ",
        r"(DEBUG|INFO|NOTICE|WARNING|ERROR|CRITICAL|ALERT|EMERGENCY)\s*:\s?(.*)$",
    ))
    .expect("entry regex is valid")
});

static BARE_ENTRY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2}(?:\.\d+)? (.*)$")
        .expect("bare entry regex is valid")
});

static STATS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^\s*(?:Transferred|Errors|Checks|Deleted|Renamed|Elapsed time|Transferring",
        r"|Server Side Copies|Server Side Moves):|^\s+\*\s",
    ))
    .expect("stats regex is valid")
});

static RETRY_SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^(?:Attempt \d+/\d+ failed with \d+ errors",
        r"|Failed to (?:sync|copy|move) with \d+ errors)",
    ))
    .expect("retry summary regex is valid")
});

/// rclone log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

impl Level {
    fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "DEBUG" => Level::Debug,
            "INFO" => Level::Info,
            "NOTICE" => Level::Notice,
            "WARNING" => Level::Warning,
            "ERROR" => Level::Error,
            "CRITICAL" => Level::Critical,
            "ALERT" => Level::Alert,
            "EMERGENCY" => Level::Emergency,
            _ => return None,
        })
    }

    pub fn is_error(self) -> bool {
        matches!(
            self,
            Level::Error | Level::Critical | Level::Alert | Level::Emergency
        )
    }
}

/// Recognized shape of a single log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineShape<'a> {
    Blank,
    /// A line of rclone's periodic transfer statistics.
    Stats,
    Entry {
        level: Level,
        message: &'a str,
    },
    Unparseable,
}

pub fn parse_line(line: &str) -> LineShape<'_> {
    if line.trim().is_empty() {
        return LineShape::Blank;
    }
    if let Some(caps) = ENTRY_RE.captures(line) {
        let level = caps.get(1).and_then(|m| Level::parse(m.as_str()));
        let message = caps.get(2).map_or("", |m| m.as_str());
        if let Some(level) = level {
            return LineShape::Entry { level, message };
        }
    }
    // rclone's final fatal summary is logged without a level.
    if let Some(message) = BARE_ENTRY_RE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .filter(|message| RETRY_SUMMARY_RE.is_match(message))
    {
        return LineShape::Entry {
            level: Level::Error,
            message,
        };
    }
    if STATS_RE.is_match(line) {
        return LineShape::Stats;
    }
    LineShape::Unparseable
}

/// Match an error-level message against the known signatures.
pub fn error_signature(message: &str) -> ErrorSignature {
    let lowered = message.to_ascii_lowercase();
    if RETRY_SUMMARY_RE.is_match(message.trim_start()) {
        ErrorSignature::RetrySummary
    } else if lowered.contains("permission denied") {
        ErrorSignature::PermissionDenied
    } else if lowered.contains("source file is being updated") {
        ErrorSignature::PartiallyWrittenFile
    } else {
        ErrorSignature::Unrecognized
    }
}

/// Classifies a completed run's log against the configured ignore flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogClassifier {
    flags: IgnoreFlags,
}

impl LogClassifier {
    pub fn new(flags: IgnoreFlags) -> Self {
        Self { flags }
    }

    pub fn flags(&self) -> IgnoreFlags {
        self.flags
    }

    fn is_ignored(&self, signature: ErrorSignature) -> bool {
        match signature {
            ErrorSignature::PermissionDenied => self.flags.permission_denied_on_source,
            ErrorSignature::PartiallyWrittenFile => self.flags.partially_written_files,
            ErrorSignature::RetrySummary | ErrorSignature::Unrecognized => false,
        }
    }

    /// Fatal iff some error line is not covered by an enabled ignore flag or
    /// some line is unparseable.
    ///
    /// Retry summaries only restate earlier errors: they are covered when at
    /// least one individual error was covered and none was fatal.
    pub fn classify(&self, log: &str) -> ErrorClassification {
        let mut offending = Vec::new();
        let mut covered = Vec::new();
        let mut summaries = Vec::new();

        for (idx, line) in log.lines().enumerate() {
            let line_no = idx + 1;
            match parse_line(line) {
                LineShape::Blank | LineShape::Stats => {}
                LineShape::Entry { level, .. } if !level.is_error() => {}
                LineShape::Entry { message, .. } => match error_signature(message) {
                    ErrorSignature::RetrySummary => summaries.push((line_no, line)),
                    signature if self.is_ignored(signature) => covered.push(CoveredLine {
                        line_no,
                        text: line.to_string(),
                        signature,
                    }),
                    signature => offending.push(OffendingLine {
                        line_no,
                        text: line.to_string(),
                        reason: FatalReason::NotIgnored(signature),
                    }),
                },
                LineShape::Unparseable => offending.push(OffendingLine {
                    line_no,
                    text: line.to_string(),
                    reason: FatalReason::Unparseable,
                }),
            }
        }

        let summaries_covered = offending.is_empty() && !covered.is_empty();
        for (line_no, line) in summaries {
            if summaries_covered {
                covered.push(CoveredLine {
                    line_no,
                    text: line.to_string(),
                    signature: ErrorSignature::RetrySummary,
                });
            } else {
                offending.push(OffendingLine {
                    line_no,
                    text: line.to_string(),
                    reason: FatalReason::NotIgnored(ErrorSignature::RetrySummary),
                });
            }
        }
        covered.sort_by_key(|line| line.line_no);
        offending.sort_by_key(|line| line.line_no);

        if offending.is_empty() {
            ErrorClassification::Ignorable { covered }
        } else {
            ErrorClassification::Fatal { offending, covered }
        }
    }
}
