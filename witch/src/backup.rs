//! The backup unit of work executed on every tick.
//!
//! A tick runs the pre-hooks, mirrors the source into destination-latest while
//! archiving superseded files under `destination-previous/<timestamp>`,
//! classifies the sync log, runs the post-hooks and finally records the
//! successful run in the service's scoped state.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::Local;
use tracing::{debug, error, info, instrument, warn};

use crate::core::classifier::LogClassifier;
use crate::core::timestamp::version_token;
use crate::core::types::ErrorClassification;
use crate::error::{HookPhase, Result, SyncFailure, WitchError};
use crate::io::config::{LogMode, WitchConfig};
use crate::io::hooks::Hook;
use crate::io::scoped_state::ScopedState;
use crate::io::sync::{RcloneSync, SyncOutput, SyncRequest, SyncTool};
use crate::service::Work;

/// State namespace owned by the backup service.
pub const BACKUP_NAMESPACE: &str = "backup";
/// Timestamp token of the last fully successful tick.
pub const LAST_SUCCESSFUL_RUN_KEY: &str = "last_successful_run";
/// Version folder used by the last fully successful tick.
pub const LAST_VERSION_FOLDER_KEY: &str = "last_version_folder";
/// Number of fully successful ticks.
pub const SUCCESSFUL_RUNS_KEY: &str = "successful_runs";

/// Source, destinations and flags handed to the sync tool on every tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupPlan {
    pub source: PathBuf,
    pub destination_latest: PathBuf,
    pub destination_previous: PathBuf,
    pub filter_flags: Vec<String>,
    pub additional_flags: Vec<String>,
    pub sync_log_file: PathBuf,
    pub sync_log_mode: LogMode,
}

impl BackupPlan {
    pub fn from_config(cfg: &WitchConfig) -> Self {
        Self {
            source: cfg.source.clone(),
            destination_latest: cfg.destination_latest(),
            destination_previous: cfg.destination_previous(),
            filter_flags: cfg.rclone.filter_flags.clone(),
            additional_flags: cfg.rclone.additional_flags.clone(),
            sync_log_file: cfg.sync_log_file(),
            sync_log_mode: cfg.log.sync_log_mode,
        }
    }

    fn request(&self, timestamp: String) -> SyncRequest {
        SyncRequest {
            source: self.source.clone(),
            destination: self.destination_latest.clone(),
            version_root: self.destination_previous.clone(),
            timestamp,
            filter_flags: self.filter_flags.clone(),
            additional_flags: self.additional_flags.clone(),
        }
    }
}

/// Produces the version token for a tick. Called exactly once per tick.
pub type Clock = Box<dyn FnMut() -> String + Send + Sync>;

pub struct BackupOrchestrator {
    plan: BackupPlan,
    sync_tool: Arc<dyn SyncTool>,
    classifier: LogClassifier,
    pre_hooks: Vec<Arc<dyn Hook>>,
    post_hooks: Vec<Arc<dyn Hook>>,
    clock: Clock,
}

impl BackupOrchestrator {
    pub fn new(plan: BackupPlan, sync_tool: Arc<dyn SyncTool>, classifier: LogClassifier) -> Self {
        Self {
            plan,
            sync_tool,
            classifier,
            pre_hooks: Vec::new(),
            post_hooks: Vec::new(),
            clock: Box::new(|| version_token(&Local::now())),
        }
    }

    /// Orchestrator for `cfg` backed by rclone.
    pub fn from_config(cfg: &WitchConfig) -> Self {
        Self::new(
            BackupPlan::from_config(cfg),
            Arc::new(RcloneSync::new(&cfg.rclone.binary)),
            LogClassifier::new(cfg.ignore),
        )
        .with_pre_hooks(cfg.pre_hooks())
        .with_post_hooks(cfg.post_hooks())
    }

    pub fn with_pre_hooks(mut self, hooks: Vec<Arc<dyn Hook>>) -> Self {
        self.pre_hooks = hooks;
        self
    }

    pub fn with_post_hooks(mut self, hooks: Vec<Arc<dyn Hook>>) -> Self {
        self.post_hooks = hooks;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn plan(&self) -> &BackupPlan {
        &self.plan
    }

    async fn run_hooks(&self, phase: HookPhase) -> Result<()> {
        let hooks = match phase {
            HookPhase::Pre => &self.pre_hooks,
            HookPhase::Post => &self.post_hooks,
        };
        for hook in hooks {
            let name = hook.name().to_string();
            debug!(%phase, hook = %name, "running hook");
            let hook = Arc::clone(hook);
            let outcome = tokio::task::spawn_blocking(move || hook.run())
                .await
                .map_err(|err| anyhow::anyhow!("hook task failed: {err}"))
                .and_then(|res| res);
            if let Err(source) = outcome {
                return Err(WitchError::Hook {
                    phase,
                    hook: name,
                    source,
                });
            }
        }
        Ok(())
    }

    async fn invoke_sync(&self, request: SyncRequest) -> Result<SyncOutput> {
        let tool = Arc::clone(&self.sync_tool);
        tokio::task::spawn_blocking(move || tool.sync(&request))
            .await
            .map_err(|err| WitchError::SyncInvocation(anyhow::anyhow!("sync task failed: {err}")))?
            .map_err(WitchError::SyncInvocation)
    }

    /// Judge one invocation's output. Offending lines are logged here so the
    /// returned error never needs logging again.
    fn judge(&self, output: &SyncOutput) -> Result<ErrorClassification> {
        if !output.success && output.output.trim().is_empty() {
            error!(exit_code = ?output.exit_code, "sync tool failed without output");
            return Err(WitchError::Sync {
                reason: SyncFailure::Crashed {
                    exit_code: output.exit_code,
                },
                lines: Vec::new(),
                log_file: self.plan.sync_log_file.clone(),
            });
        }

        let classification = self.classifier.classify(&output.output);
        for line in classification.covered() {
            debug!(line_no = line.line_no, signature = ?line.signature, "ignored sync error");
        }
        match classification {
            ErrorClassification::Fatal { offending, .. } => {
                for line in &offending {
                    error!(
                        line_no = line.line_no,
                        reason = ?line.reason,
                        text = %line.text,
                        "fatal sync log line"
                    );
                }
                Err(WitchError::Sync {
                    reason: SyncFailure::FatalLog,
                    lines: offending,
                    log_file: self.plan.sync_log_file.clone(),
                })
            }
            _ if output.dropped_bytes > 0 => {
                error!(
                    dropped_bytes = output.dropped_bytes,
                    "sync output exceeded the capture limit"
                );
                Err(WitchError::Sync {
                    reason: SyncFailure::OutputTruncated {
                        dropped_bytes: output.dropped_bytes,
                    },
                    lines: Vec::new(),
                    log_file: self.plan.sync_log_file.clone(),
                })
            }
            ignorable => {
                if !output.success {
                    warn!(
                        exit_code = ?output.exit_code,
                        "sync tool exited unsuccessfully but all errors are ignored"
                    );
                }
                Ok(ignorable)
            }
        }
    }
}

impl Work for BackupOrchestrator {
    #[instrument(skip_all, fields(source = %self.plan.source.display()))]
    async fn execute(&mut self, state: &ScopedState) -> Result<()> {
        self.run_hooks(HookPhase::Pre).await?;

        let timestamp = (self.clock)();
        let request = self.plan.request(timestamp.clone());
        let version_folder = request.version_folder();
        info!(%timestamp, "backup sync starting");
        let output = self.invoke_sync(request).await?;
        write_sync_log(
            &self.plan.sync_log_file,
            self.plan.sync_log_mode,
            &output.output,
        )
        .map_err(WitchError::SyncInvocation)?;
        let classification = self.judge(&output)?;

        self.run_hooks(HookPhase::Post).await?;

        let runs: u64 = state.get_or(SUCCESSFUL_RUNS_KEY, 0)?;
        state.set(LAST_SUCCESSFUL_RUN_KEY, &timestamp)?;
        state.set(LAST_VERSION_FOLDER_KEY, &version_folder)?;
        state.set(SUCCESSFUL_RUNS_KEY, &(runs + 1))?;
        info!(
            %timestamp,
            ignored_errors = classification.covered().len(),
            "backup completed"
        );
        Ok(())
    }
}

/// Write this invocation's output to the sync log.
pub fn write_sync_log(path: &Path, mode: LogMode, output: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create sync log dir {}", parent.display()))?;
    }
    match mode {
        LogMode::Overwrite => {
            fs::write(path, output).with_context(|| format!("write sync log {}", path.display()))
        }
        LogMode::Append => {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open sync log {}", path.display()))?;
            file.write_all(output.as_bytes())
                .with_context(|| format!("append sync log {}", path.display()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use tokio_util::sync::CancellationToken;

    use crate::core::types::{FatalReason, IgnoreFlags};
    use crate::error::Diagnosis;
    use crate::io::state_store::StateStore;
    use crate::scheduler::IntervalScheduler;
    use crate::service::Service;
    use crate::test_support::{
        FailingHook, RecordingHook, ScriptedSync, failed_output, fixed_clock, ok_output,
    };

    const PERMISSION_DENIED: &str = concat!(
        "2024/03/01 10:00:00 ERROR : root: error reading source directory: ",
        "open /root: permission denied\n"
    );

    struct Fixture {
        temp: tempfile::TempDir,
        state: ScopedState,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempfile::tempdir().expect("tempdir");
            let store =
                Arc::new(StateStore::open_json(temp.path().join("state.json")).expect("store"));
            let state = ScopedState::new(store, BACKUP_NAMESPACE).expect("state");
            Self { temp, state }
        }

        fn plan(&self) -> BackupPlan {
            BackupPlan {
                source: self.temp.path().join("source"),
                destination_latest: self.temp.path().join("dest/latest"),
                destination_previous: self.temp.path().join("dest/previous"),
                filter_flags: vec!["--copy-links".to_string()],
                additional_flags: Vec::new(),
                sync_log_file: self.temp.path().join("data/rclone.log"),
                sync_log_mode: LogMode::Overwrite,
            }
        }
    }

    #[tokio::test]
    async fn successful_tick_records_state_and_writes_log() {
        let fx = Fixture::new();
        let sync = Arc::new(ScriptedSync::new(vec![ok_output(
            "2024/03/01 10:00:00 INFO  : a.txt: Copied (new)\n",
        )]));
        let mut backup = BackupOrchestrator::new(
            fx.plan(),
            sync.clone(),
            LogClassifier::new(IgnoreFlags::default()),
        )
        .with_clock(fixed_clock("2024-03-01_10-00-00"));

        backup.execute(&fx.state).await.expect("tick");

        let requests = sync.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].timestamp, "2024-03-01_10-00-00");
        assert_eq!(
            requests[0].version_folder(),
            fx.temp.path().join("dest/previous/2024-03-01_10-00-00")
        );
        assert_eq!(
            fx.state.get::<String>(LAST_SUCCESSFUL_RUN_KEY).expect("get").as_deref(),
            Some("2024-03-01_10-00-00")
        );
        assert_eq!(fx.state.get_or(SUCCESSFUL_RUNS_KEY, 0u64).expect("get"), 1);
        let log = fs::read_to_string(fx.temp.path().join("data/rclone.log")).expect("log");
        assert!(log.contains("Copied (new)"));
    }

    #[tokio::test]
    async fn failing_pre_hook_skips_sync_and_post_hooks() {
        let fx = Fixture::new();
        let sync = Arc::new(ScriptedSync::new(Vec::new()));
        let post = Arc::new(RecordingHook::new("post"));
        let mut backup = BackupOrchestrator::new(
            fx.plan(),
            sync.clone(),
            LogClassifier::new(IgnoreFlags::default()),
        )
        .with_pre_hooks(vec![Arc::new(FailingHook::new("apps"))])
        .with_post_hooks(vec![post.clone() as Arc<dyn Hook>]);

        let err = backup.execute(&fx.state).await.unwrap_err();
        match &err {
            WitchError::Hook { phase, hook, .. } => {
                assert_eq!(*phase, HookPhase::Pre);
                assert_eq!(hook, "apps");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(err.diagnosis(), Diagnosis::Unclassified);
        assert!(sync.requests().is_empty());
        assert_eq!(post.calls(), 0);
        assert_eq!(fx.state.get::<String>(LAST_SUCCESSFUL_RUN_KEY).expect("get"), None);
    }

    #[tokio::test]
    async fn hooks_run_in_declared_order() {
        let fx = Fixture::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let sync = Arc::new(ScriptedSync::new(vec![ok_output("")]));
        let mut backup = BackupOrchestrator::new(
            fx.plan(),
            sync,
            LogClassifier::new(IgnoreFlags::default()),
        )
        .with_pre_hooks(vec![
            Arc::new(RecordingHook::with_log("pre-1", order.clone())),
            Arc::new(RecordingHook::with_log("pre-2", order.clone())),
        ])
        .with_post_hooks(vec![Arc::new(RecordingHook::with_log(
            "post-1",
            order.clone(),
        ))]);

        backup.execute(&fx.state).await.expect("tick");
        assert_eq!(
            *order.lock().expect("lock"),
            vec!["pre-1", "pre-2", "post-1"]
        );
    }

    #[tokio::test]
    async fn fatal_log_is_already_diagnosed_and_skips_post_hooks() {
        let fx = Fixture::new();
        let sync = Arc::new(ScriptedSync::new(vec![failed_output(1, PERMISSION_DENIED)]));
        let post = Arc::new(RecordingHook::new("post"));
        let mut backup = BackupOrchestrator::new(
            fx.plan(),
            sync,
            LogClassifier::new(IgnoreFlags::none_enabled()),
        )
        .with_post_hooks(vec![post.clone() as Arc<dyn Hook>]);

        let err = backup.execute(&fx.state).await.unwrap_err();
        assert_eq!(err.diagnosis(), Diagnosis::AlreadyDiagnosed);
        match err {
            WitchError::Sync { reason, lines, .. } => {
                assert_eq!(reason, SyncFailure::FatalLog);
                assert_eq!(lines.len(), 1);
                assert!(matches!(lines[0].reason, FatalReason::NotIgnored(_)));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(post.calls(), 0);
        // The log is written even when the run is fatal.
        let log = fs::read_to_string(fx.temp.path().join("data/rclone.log")).expect("log");
        assert_eq!(log, PERMISSION_DENIED);
    }

    #[tokio::test]
    async fn ignored_errors_with_nonzero_exit_still_succeed() {
        let fx = Fixture::new();
        let sync = Arc::new(ScriptedSync::new(vec![failed_output(1, PERMISSION_DENIED)]));
        let post = Arc::new(RecordingHook::new("post"));
        let mut backup = BackupOrchestrator::new(
            fx.plan(),
            sync,
            LogClassifier::new(IgnoreFlags::all_enabled()),
        )
        .with_post_hooks(vec![post.clone() as Arc<dyn Hook>]);

        backup.execute(&fx.state).await.expect("tick");
        assert_eq!(post.calls(), 1);
    }

    #[tokio::test]
    async fn crash_without_output_is_fatal() {
        let fx = Fixture::new();
        let sync = Arc::new(ScriptedSync::new(vec![SyncOutput {
            exit_code: None,
            success: false,
            output: String::new(),
            dropped_bytes: 0,
        }]));
        let mut backup = BackupOrchestrator::new(
            fx.plan(),
            sync,
            LogClassifier::new(IgnoreFlags::all_enabled()),
        );

        let err = backup.execute(&fx.state).await.unwrap_err();
        assert!(matches!(
            err,
            WitchError::Sync {
                reason: SyncFailure::Crashed { exit_code: None },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn truncated_output_is_fatal_even_when_visible_part_is_clean() {
        let fx = Fixture::new();
        let mut output = failed_output(1, "2024/03/01 10:00:00 INFO  : a.txt: Copied (new)\n");
        output.dropped_bytes = 4096;
        let sync = Arc::new(ScriptedSync::new(vec![output]));
        let post = Arc::new(RecordingHook::new("post"));
        let mut backup = BackupOrchestrator::new(
            fx.plan(),
            sync,
            LogClassifier::new(IgnoreFlags::all_enabled()),
        )
        .with_post_hooks(vec![post.clone() as Arc<dyn Hook>]);

        let err = backup.execute(&fx.state).await.unwrap_err();
        assert_eq!(err.diagnosis(), Diagnosis::AlreadyDiagnosed);
        assert!(matches!(
            err,
            WitchError::Sync {
                reason: SyncFailure::OutputTruncated {
                    dropped_bytes: 4096
                },
                ..
            }
        ));
        assert_eq!(post.calls(), 0);
        assert_eq!(fx.state.get_or(SUCCESSFUL_RUNS_KEY, 0u64).expect("get"), 0);
    }

    #[tokio::test]
    async fn failing_post_hook_does_not_record_success() {
        let fx = Fixture::new();
        let sync = Arc::new(ScriptedSync::new(vec![ok_output("")]));
        let mut backup = BackupOrchestrator::new(
            fx.plan(),
            sync,
            LogClassifier::new(IgnoreFlags::default()),
        )
        .with_post_hooks(vec![Arc::new(FailingHook::new("upload-report"))]);

        let err = backup.execute(&fx.state).await.unwrap_err();
        assert!(matches!(
            err,
            WitchError::Hook {
                phase: HookPhase::Post,
                ..
            }
        ));
        assert_eq!(fx.state.get_or(SUCCESSFUL_RUNS_KEY, 0u64).expect("get"), 0);
    }

    #[tokio::test]
    async fn append_mode_keeps_previous_runs() {
        let fx = Fixture::new();
        let mut plan = fx.plan();
        plan.sync_log_mode = LogMode::Append;
        let sync = Arc::new(ScriptedSync::new(vec![
            ok_output("2024/03/01 10:00:00 INFO  : first\n"),
            ok_output("2024/03/01 11:00:00 INFO  : second\n"),
        ]));
        let mut backup =
            BackupOrchestrator::new(plan, sync, LogClassifier::new(IgnoreFlags::default()));
        backup.execute(&fx.state).await.expect("first");
        backup.execute(&fx.state).await.expect("second");

        let log = fs::read_to_string(fx.temp.path().join("data/rclone.log")).expect("log");
        assert!(log.contains("first"));
        assert!(log.contains("second"));
        assert_eq!(fx.state.get_or(SUCCESSFUL_RUNS_KEY, 0u64).expect("get"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_sync_stops_the_service() {
        let fx = Fixture::new();
        let sync = Arc::new(ScriptedSync::new(vec![
            ok_output(""),
            failed_output(1, "unexpected banner\n"),
        ]));
        let store =
            Arc::new(StateStore::open_json(fx.temp.path().join("svc-state.json")).expect("store"));
        let service = Service::new(
            IntervalScheduler::periodic(std::time::Duration::from_secs(60)).expect("scheduler"),
            store,
            BACKUP_NAMESPACE,
            BackupOrchestrator::new(
                fx.plan(),
                sync.clone(),
                LogClassifier::new(IgnoreFlags::all_enabled()),
            ),
        )
        .expect("service");

        let err = service.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, WitchError::Sync { .. }));
        assert_eq!(sync.requests().len(), 2);
        assert_eq!(service.state().get_or(SUCCESSFUL_RUNS_KEY, 0u64).expect("get"), 1);
    }
}
