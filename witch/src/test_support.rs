//! Test doubles for sync tools, hooks and the version clock.

use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow, bail};
use tempfile::TempDir;

use crate::backup::{BACKUP_NAMESPACE, BackupOrchestrator, BackupPlan, Clock};
use crate::io::config::LogMode;
use crate::io::hooks::Hook;
use crate::io::state_store::StateStore;
use crate::io::sync::{SyncOutput, SyncRequest, SyncTool};
use crate::scheduler::IntervalScheduler;
use crate::service::Service;

/// Scratch layout with a source tree, a backup destination and a data dir.
pub struct BackupSandbox {
    temp: TempDir,
}

impl BackupSandbox {
    pub fn new() -> Result<Self> {
        let sandbox = Self {
            temp: tempfile::tempdir().context("create sandbox")?,
        };
        fs::create_dir_all(sandbox.source()).context("create source dir")?;
        Ok(sandbox)
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn source(&self) -> PathBuf {
        self.root().join("home")
    }

    pub fn latest(&self) -> PathBuf {
        self.root().join("backup/latest")
    }

    pub fn previous(&self) -> PathBuf {
        self.root().join("backup/previous")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root().join("data")
    }

    pub fn plan(&self) -> BackupPlan {
        BackupPlan {
            source: self.source(),
            destination_latest: self.latest(),
            destination_previous: self.previous(),
            filter_flags: Vec::new(),
            additional_flags: Vec::new(),
            sync_log_file: self.data_dir().join("rclone.log"),
            sync_log_mode: LogMode::Overwrite,
        }
    }

    /// Opens the sandbox state file. Each call reloads it from disk.
    pub fn store(&self) -> Result<Arc<StateStore>> {
        Ok(Arc::new(StateStore::open_json(
            self.data_dir().join("state.json"),
        )?))
    }

    pub fn one_shot(&self, backup: BackupOrchestrator) -> Result<Service<BackupOrchestrator>> {
        Ok(Service::new(
            IntervalScheduler::one_shot(),
            self.store()?,
            BACKUP_NAMESPACE,
            backup,
        )?)
    }
}

/// Relative path and contents of every file under `root`.
pub fn snapshot(root: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    relative_files(root)?
        .into_iter()
        .map(|rel| {
            let bytes = fs::read(root.join(&rel))?;
            Ok((rel.display().to_string(), bytes))
        })
        .collect()
}

/// Sorted names of the direct children of `root`; empty when it is missing.
pub fn subfolders(root: &Path) -> Result<Vec<String>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(root)? {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

/// Clock that always returns `token`.
pub fn fixed_clock(token: &str) -> Clock {
    let token = token.to_string();
    Box::new(move || token.clone())
}

/// Clock that returns `tokens` in order, then repeats the last one.
pub fn sequence_clock(tokens: &[&str]) -> Clock {
    let mut tokens: VecDeque<String> = tokens.iter().map(|t| t.to_string()).collect();
    Box::new(move || {
        if tokens.len() > 1 {
            tokens.pop_front().unwrap_or_default()
        } else {
            tokens.front().cloned().unwrap_or_default()
        }
    })
}

pub fn ok_output(output: &str) -> SyncOutput {
    SyncOutput {
        exit_code: Some(0),
        success: true,
        output: output.to_string(),
        dropped_bytes: 0,
    }
}

pub fn failed_output(exit_code: i32, output: &str) -> SyncOutput {
    SyncOutput {
        exit_code: Some(exit_code),
        success: false,
        output: output.to_string(),
        dropped_bytes: 0,
    }
}

/// Returns predetermined outputs in order and records every request.
#[derive(Default)]
pub struct ScriptedSync {
    outputs: Mutex<VecDeque<SyncOutput>>,
    requests: Mutex<Vec<SyncRequest>>,
}

impl ScriptedSync {
    pub fn new(outputs: Vec<SyncOutput>) -> Self {
        Self {
            outputs: Mutex::new(outputs.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<SyncRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

impl SyncTool for ScriptedSync {
    fn sync(&self, request: &SyncRequest) -> Result<SyncOutput> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        self.outputs
            .lock()
            .expect("outputs lock")
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted sync output left"))
    }
}

/// In-process stand-in for `rclone sync --backup-dir`.
///
/// Mirrors the source tree into the destination. Files that would be
/// overwritten or deleted in the destination are first moved into the
/// request's version folder. Extra log lines can be appended to simulate
/// errors reported during the transfer.
#[derive(Default)]
pub struct MirrorSync {
    extra_log: Mutex<VecDeque<(bool, String)>>,
    requests: Mutex<Vec<SyncRequest>>,
}

impl MirrorSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `log` to the next invocation's output; `success` becomes its
    /// exit status.
    pub fn push_log(&self, success: bool, log: &str) {
        self.extra_log
            .lock()
            .expect("log lock")
            .push_back((success, log.to_string()));
    }

    pub fn requests(&self) -> Vec<SyncRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

const LOG_PREFIX: &str = "2024/03/01 10:00:00";

impl SyncTool for MirrorSync {
    fn sync(&self, request: &SyncRequest) -> Result<SyncOutput> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        if !request.source.is_dir() {
            bail!("source {} is not a directory", request.source.display());
        }
        fs::create_dir_all(&request.destination)?;
        let version_folder = request.version_folder();
        let mut log = String::new();

        let source_files = relative_files(&request.source)?;
        let dest_files = relative_files(&request.destination)?;

        for rel in &source_files {
            let src = request.source.join(rel);
            let dst = request.destination.join(rel);
            let contents = fs::read(&src).with_context(|| format!("read {}", src.display()))?;
            if dst.exists() {
                if fs::read(&dst)? == contents {
                    continue;
                }
                archive(&dst, &version_folder.join(rel))?;
                let rel = rel.display();
                log.push_str(&format!("{LOG_PREFIX} INFO  : {rel}: Moved (server-side)\n"));
                log.push_str(&format!("{LOG_PREFIX} INFO  : {rel}: Copied (replaced existing)\n"));
            } else {
                log.push_str(&format!("{LOG_PREFIX} INFO  : {}: Copied (new)\n", rel.display()));
            }
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&dst, contents)?;
        }

        for rel in dest_files.difference(&source_files) {
            archive(&request.destination.join(rel), &version_folder.join(rel))?;
            log.push_str(&format!("{LOG_PREFIX} INFO  : {}: Moved (server-side)\n", rel.display()));
        }

        let (success, extra) = self
            .extra_log
            .lock()
            .expect("log lock")
            .pop_front()
            .unwrap_or((true, String::new()));
        log.push_str(&extra);
        Ok(SyncOutput {
            exit_code: Some(if success { 0 } else { 1 }),
            success,
            output: log,
            dropped_bytes: 0,
        })
    }
}

fn archive(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(from, to).with_context(|| format!("move {} to {}", from.display(), to.display()))
}

/// Every regular file under `root`, relative to `root`.
pub fn relative_files(root: &Path) -> Result<BTreeSet<PathBuf>> {
    let mut files = BTreeSet::new();
    if !root.exists() {
        return Ok(files);
    }
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir).with_context(|| format!("read dir {}", dir.display()))? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if let Ok(rel) = path.strip_prefix(root) {
                files.insert(rel.to_path_buf());
            }
        }
    }
    Ok(files)
}

/// Hook that succeeds and counts its invocations.
pub struct RecordingHook {
    name: String,
    calls: Mutex<usize>,
    log: Option<Arc<Mutex<Vec<String>>>>,
}

impl RecordingHook {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            calls: Mutex::new(0),
            log: None,
        }
    }

    /// Also push the hook name onto `log` on every run.
    pub fn with_log(name: &str, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            log: Some(log),
            ..Self::new(name)
        }
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().expect("calls lock")
    }
}

impl Hook for RecordingHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self) -> Result<()> {
        *self.calls.lock().expect("calls lock") += 1;
        if let Some(log) = &self.log {
            log.lock().expect("log lock").push(self.name.clone());
        }
        Ok(())
    }
}

/// Hook that always fails.
pub struct FailingHook {
    name: String,
}

impl FailingHook {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl Hook for FailingHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self) -> Result<()> {
        bail!("{} exited with status Some(1)", self.name)
    }
}
