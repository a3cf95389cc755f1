//! Configuration resolution for cmdpipe.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/cmdpipe/settings.json)
//! 3. Project config (.cmdpipe/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};

/// Complete cmdpipe configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub executor: ExecutorConfig,
    pub lifecycle: LifecycleConfig,
    pub snapshot: SnapshotConfig,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            lifecycle: LifecycleConfig::default(),
            snapshot: SnapshotConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

/// Bounds for the task executor that runs stream handlers and supervisors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum number of handler/supervisor tasks running at once.
    pub max_concurrent_tasks: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 16,
        }
    }
}

/// Process lifecycle knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Seconds between a graceful timeout kill and the forced escalation.
    pub kill_grace_secs: u64,
    /// Grant the execute bit and retry once when a stage fails with EACCES.
    pub auto_grant_executable: bool,
}

impl LifecycleConfig {
    pub const fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            kill_grace_secs: 5,
            auto_grant_executable: false,
        }
    }
}

/// Shape of the stderr snapshot kept for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Characters kept per line; the rest of the line is dropped.
    pub line_width: usize,
    /// Leading non-blank lines kept verbatim.
    pub head_lines: usize,
    /// Trailing non-blank lines kept in a sliding window.
    pub tail_lines: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            line_width: 80,
            head_lines: 4,
            tail_lines: 4,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            let global = load_config_file(&global_path)?;
            merge_config(&mut config, global);
        }
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".cmdpipe").join("settings.json");
        if project_path.exists() {
            let project = load_config_file(&project_path)?;
            merge_config(&mut config, project);
        }
    }

    apply_env_overrides(&mut config, |name| std::env::var(name).ok());

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".cmdpipe").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/cmdpipe/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("cmdpipe").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

/// Read a single settings file. Missing sections fall back to defaults.
pub fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let config = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    debug!(path = %path.display(), "Loaded config file");
    Ok(config)
}

fn merge_config(base: &mut Config, overlay: Config) {
    base.executor = overlay.executor;
    base.lifecycle = overlay.lifecycle;
    base.snapshot = overlay.snapshot;
    base.log_level = overlay.log_level;
}

/// Apply `CMDPIPE_*` overrides. Unparseable values are ignored.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("CMDPIPE_MAX_CONCURRENT_TASKS") {
        if let Ok(n) = val.parse() {
            config.executor.max_concurrent_tasks = n;
        }
    }
    if let Some(val) = lookup("CMDPIPE_KILL_GRACE_SECS") {
        if let Ok(n) = val.parse() {
            config.lifecycle.kill_grace_secs = n;
        }
    }
    if let Some(val) = lookup("CMDPIPE_AUTO_GRANT_EXECUTABLE") {
        match val.as_str() {
            "1" | "true" | "yes" => config.lifecycle.auto_grant_executable = true,
            "0" | "false" | "no" => config.lifecycle.auto_grant_executable = false,
            _ => {}
        }
    }
    if let Some(val) = lookup("CMDPIPE_LOG_LEVEL") {
        config.log_level = val;
    }
}
