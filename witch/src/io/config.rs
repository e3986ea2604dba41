//! Service configuration loaded from `backup-witch.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::flags::prohibited_flags;
use crate::core::types::IgnoreFlags;
use crate::io::hooks::{CommandHook, Hook, InstalledAppsHook};

pub const DEFAULT_CONFIG_FILE: &str = "backup-witch.toml";

/// Service configuration (TOML).
///
/// Created once at startup and passed into each component's constructor.
/// Missing optional fields default to sensible values; `source` and
/// `destination` are required.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WitchConfig {
    /// Seconds between tick starts. Absent runs a single backup and exits.
    pub interval_secs: Option<u64>,

    pub source: PathBuf,
    pub destination: PathBuf,
    /// Defaults to `<destination>/latest`.
    pub destination_latest: Option<PathBuf>,
    /// Defaults to `<destination>/previous`.
    pub destination_previous: Option<PathBuf>,

    /// Holds the state file, the sync log and the application log.
    pub data_dir: PathBuf,

    /// Skip the failure notification and let errors surface unchanged.
    pub debug: bool,

    pub rclone: RcloneConfig,
    pub ignore: IgnoreFlags,
    pub log: LogConfig,
    pub notify: NotifyConfig,
    pub pre_hooks: Vec<HookConfig>,
    pub post_hooks: Vec<HookConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RcloneConfig {
    pub binary: PathBuf,
    /// Filtering flags (`--filter-from`, `--include`, `--copy-links`, ...).
    pub filter_flags: Vec<String>,
    /// Any other rclone flags.
    pub additional_flags: Vec<String>,
}

impl Default for RcloneConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("rclone"),
            filter_flags: Vec::new(),
            additional_flags: Vec::new(),
        }
    }
}

/// How the sync log file is written on each invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogMode {
    #[default]
    Overwrite,
    Append,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    pub sync_log_mode: LogMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotifyConfig {
    /// Command run when the service stops on an error. Entries may contain
    /// `{log_file}` and `{error}`. An empty list disables notification.
    pub command: Vec<String>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "notify-send".to_string(),
                "backup-witch".to_string(),
                "Exception Occurred\nCheck log -> {log_file}".to_string(),
                "-u".to_string(),
                "critical".to_string(),
            ],
        }
    }
}

/// One configured hook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum HookConfig {
    Command {
        name: String,
        command: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workdir: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
    InstalledApps {
        output_file: PathBuf,
    },
}

impl HookConfig {
    pub fn build(&self) -> Arc<dyn Hook> {
        match self {
            HookConfig::Command {
                name,
                command,
                workdir,
                timeout_secs,
            } => {
                let mut hook = CommandHook::new(name.clone(), command.clone());
                if let Some(workdir) = workdir {
                    hook = hook.with_workdir(workdir);
                }
                if let Some(secs) = timeout_secs {
                    hook = hook.with_timeout(Duration::from_secs(*secs));
                }
                Arc::new(hook)
            }
            HookConfig::InstalledApps { output_file } => {
                Arc::new(InstalledAppsHook::new(output_file))
            }
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            HookConfig::Command {
                name,
                command,
                timeout_secs,
                ..
            } => {
                if name.trim().is_empty() {
                    return Err(anyhow!("hook name must not be empty"));
                }
                if command.is_empty() || command[0].trim().is_empty() {
                    return Err(anyhow!("hook '{name}' command must be a non-empty array"));
                }
                if *timeout_secs == Some(0) {
                    return Err(anyhow!("hook '{name}' timeout_secs must be > 0"));
                }
            }
            HookConfig::InstalledApps { output_file } => {
                if output_file.as_os_str().is_empty() {
                    return Err(anyhow!("installed-apps hook output_file must be set"));
                }
            }
        }
        Ok(())
    }
}

impl Default for WitchConfig {
    fn default() -> Self {
        Self {
            interval_secs: None,
            source: PathBuf::new(),
            destination: PathBuf::new(),
            destination_latest: None,
            destination_previous: None,
            data_dir: PathBuf::from(".backup-witch"),
            debug: false,
            rclone: RcloneConfig::default(),
            ignore: IgnoreFlags::default(),
            log: LogConfig::default(),
            notify: NotifyConfig::default(),
            pre_hooks: Vec::new(),
            post_hooks: Vec::new(),
        }
    }
}

impl WitchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == Some(0) {
            return Err(anyhow!("interval_secs must be > 0 (omit it for a single run)"));
        }
        if self.source.as_os_str().is_empty() {
            return Err(anyhow!("source must be set"));
        }
        if self.destination.as_os_str().is_empty() {
            return Err(anyhow!("destination must be set"));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(anyhow!("data_dir must not be empty"));
        }
        if self.rclone.binary.as_os_str().is_empty() {
            return Err(anyhow!("rclone.binary must not be empty"));
        }
        let prohibited: Vec<String> = prohibited_flags(&self.rclone.filter_flags)
            .into_iter()
            .chain(prohibited_flags(&self.rclone.additional_flags))
            .collect();
        if !prohibited.is_empty() {
            return Err(anyhow!(
                "rclone flags conflict with versioned backups: {}",
                prohibited.join(", ")
            ));
        }
        for hook in self.pre_hooks.iter().chain(&self.post_hooks) {
            hook.validate()?;
        }
        Ok(())
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval_secs.map(Duration::from_secs)
    }

    pub fn destination_latest(&self) -> PathBuf {
        self.destination_latest
            .clone()
            .unwrap_or_else(|| self.destination.join("latest"))
    }

    pub fn destination_previous(&self) -> PathBuf {
        self.destination_previous
            .clone()
            .unwrap_or_else(|| self.destination.join("previous"))
    }

    pub fn state_file(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    pub fn sync_log_file(&self) -> PathBuf {
        self.data_dir.join("rclone.log")
    }

    pub fn app_log_file(&self) -> PathBuf {
        self.data_dir.join("backup-witch.log")
    }

    pub fn pre_hooks(&self) -> Vec<Arc<dyn Hook>> {
        self.pre_hooks.iter().map(HookConfig::build).collect()
    }

    pub fn post_hooks(&self) -> Vec<Arc<dyn Hook>> {
        self.post_hooks.iter().map(HookConfig::build).collect()
    }
}

/// Load and validate config from a TOML file.
pub fn load_config(path: &Path) -> Result<WitchConfig> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: WitchConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}
