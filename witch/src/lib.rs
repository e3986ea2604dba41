//! Periodic versioned backups driven by rclone.
//!
//! A [`service::Service`] binds a unit of work to an [`scheduler::IntervalScheduler`]
//! and a namespaced slice of the persistent [`io::state_store::StateStore`]. The
//! backup work ([`backup::BackupOrchestrator`]) runs pre-hooks, mirrors the
//! source while archiving superseded files into dated version folders,
//! classifies the sync log and runs post-hooks.
//!
//! - **[`core`]**: Pure logic (log classification, flag checks, timestamps).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (state file, child processes, hooks,
//!   config). Isolated behind traits so tests can substitute them.

pub mod backup;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod scheduler;
pub mod service;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
