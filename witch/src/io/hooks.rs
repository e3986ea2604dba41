//! Pre/post backup hooks.
//!
//! A hook is a single no-argument action that either succeeds or fails. The
//! orchestrator runs hook lists in declared order and stops at the first
//! failure.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info};

use crate::io::process::run_command;

const HOOK_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

pub trait Hook: Send + Sync {
    fn name(&self) -> &str;
    fn run(&self) -> Result<()>;
}

/// Runs an external command; a non-zero exit or timeout is a failure.
#[derive(Debug, Clone)]
pub struct CommandHook {
    name: String,
    argv: Vec<String>,
    workdir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl CommandHook {
    pub fn new(name: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            name: name.into(),
            argv,
            workdir: None,
            timeout: None,
        }
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Hook for CommandHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self) -> Result<()> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| anyhow!("hook command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(workdir) = &self.workdir {
            cmd.current_dir(workdir);
        }
        debug!(hook = %self.name, "running command hook");
        let output = run_command(cmd, self.timeout, HOOK_OUTPUT_LIMIT_BYTES)
            .with_context(|| format!("run {program}"))?;
        if output.timed_out {
            bail!("{program} timed out after {:?}", self.timeout.unwrap_or_default());
        }
        if !output.status.success() {
            bail!(
                "{program} exited with status {:?}: {}",
                output.status.code(),
                output.stderr_tail(5)
            );
        }
        Ok(())
    }
}

/// Package manager listed by [`InstalledAppsHook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageSource {
    pub label: &'static str,
    pub argv: &'static [&'static str],
}

pub const PACKAGE_SOURCES: [PackageSource; 3] = [
    PackageSource {
        label: "flatpak",
        argv: &["flatpak", "list", "--app"],
    },
    PackageSource {
        label: "snap",
        argv: &["snap", "list"],
    },
    PackageSource {
        label: "apt",
        argv: &["apt-mark", "showmanual"],
    },
];

/// Records manually installed applications into a file inside the backup
/// source, so the list is backed up with everything else.
///
/// The file is only rewritten when its content changes, which keeps the sync
/// from archiving identical versions every tick.
#[derive(Debug, Clone)]
pub struct InstalledAppsHook {
    output_file: PathBuf,
    sources: Vec<PackageSource>,
}

impl InstalledAppsHook {
    pub fn new(output_file: impl Into<PathBuf>) -> Self {
        Self {
            output_file: output_file.into(),
            sources: PACKAGE_SOURCES.to_vec(),
        }
    }

    pub fn with_sources(mut self, sources: Vec<PackageSource>) -> Self {
        self.sources = sources;
        self
    }

    fn list(source: &PackageSource) -> String {
        let Some((program, args)) = source.argv.split_first() else {
            return "(unavailable)\n".to_string();
        };
        let mut cmd = Command::new(program);
        cmd.args(args);
        match run_command(cmd, Some(Duration::from_secs(60)), HOOK_OUTPUT_LIMIT_BYTES) {
            Ok(output) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout).into_owned()
            }
            Ok(output) => {
                debug!(
                    source = source.label,
                    exit_code = ?output.status.code(),
                    "package listing failed"
                );
                "(unavailable)\n".to_string()
            }
            Err(err) => {
                debug!(source = source.label, err = %err, "package manager not available");
                "(unavailable)\n".to_string()
            }
        }
    }
}

impl Hook for InstalledAppsHook {
    fn name(&self) -> &str {
        "installed-apps"
    }

    fn run(&self) -> Result<()> {
        let sections: Vec<(&str, String)> = self
            .sources
            .iter()
            .map(|source| (source.label, Self::list(source)))
            .collect();
        let rendered = render_app_list(&sections);
        if write_if_changed(&self.output_file, &rendered)? {
            info!(path = %self.output_file.display(), "installed apps list updated");
        }
        Ok(())
    }
}

/// Render `---<label>` sections in the given order.
pub fn render_app_list(sections: &[(&str, String)]) -> String {
    let mut out = String::new();
    for (label, body) in sections {
        out.push_str("---");
        out.push_str(label);
        out.push('\n');
        out.push_str(body);
        if !body.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

/// Sorted lines of `text`, so listings compare equal regardless of order.
fn sorted_lines(text: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = text.lines().collect();
    lines.sort_unstable();
    lines
}

/// Write `contents` unless the file already holds the same lines in any
/// order. Returns whether the file was written.
pub fn write_if_changed(path: &std::path::Path, contents: &str) -> Result<bool> {
    match fs::read_to_string(path) {
        Ok(existing) if sorted_lines(&existing) == sorted_lines(contents) => return Ok(false),
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))?;
    Ok(true)
}
