//! Desktop notification sent when the service stops on an error.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{info, warn};

use crate::io::process::run_command;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);
const NOTIFY_OUTPUT_LIMIT_BYTES: usize = 64 * 1024;

/// Substitute `{log_file}` and `{error}` in every argv entry.
pub fn render_notify_command(template: &[String], log_file: &Path, error: &str) -> Vec<String> {
    let log_file = log_file.display().to_string();
    template
        .iter()
        .map(|arg| arg.replace("{log_file}", &log_file).replace("{error}", error))
        .collect()
}

/// Run the notification command. An empty template disables notification.
pub fn send_notification(template: &[String], log_file: &Path, error: &str) -> Result<()> {
    let argv = render_notify_command(template, log_file, error);
    let Some((program, args)) = argv.split_first() else {
        return Ok(());
    };
    let mut cmd = Command::new(program);
    cmd.args(args);
    let output = run_command(cmd, Some(NOTIFY_TIMEOUT), NOTIFY_OUTPUT_LIMIT_BYTES)
        .with_context(|| format!("run {program}"))?;
    if output.timed_out {
        bail!("{program} timed out");
    }
    if !output.status.success() {
        return Err(anyhow!(
            "{program} exited with status {:?}: {}",
            output.status.code(),
            output.stderr_tail(3)
        ));
    }
    info!(%program, "failure notification sent");
    Ok(())
}

/// Like [`send_notification`], but a failed notification only warns.
pub fn notify_failure(template: &[String], log_file: &Path, error: &str) {
    if let Err(err) = send_notification(template, log_file, error) {
        warn!(err = %format!("{err:#}"), "failed to send failure notification");
    }
}
