//! Side-effecting operations: state persistence, child processes, config.

pub mod config;
pub mod hooks;
pub mod notify;
pub mod process;
pub mod scoped_state;
pub mod state_store;
pub mod sync;
