//! Stable exit codes for backup-witch CLI commands.

/// Command succeeded, or the service was stopped by a signal.
pub const OK: i32 = 0;
/// Invalid config, hook failure, persistence failure or any other error.
pub const FAILURE: i32 = 1;
/// The sync log contained errors that are not ignored, or the sync tool crashed.
pub const FATAL_LOG: i32 = 2;
