//! Configuration resolution for `ptyfleet`.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`<config dir>/ptyfleet/settings.json`)
//! 3. Project config (`.ptyfleet/settings.json` in the working directory)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// Complete `ptyfleet` configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
}

/// Timing and logging for the runner itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Pause between successive worker launches.
    pub stagger_delay_ms: u64,
    /// Monitor tick interval.
    pub monitor_interval_ms: u64,
    /// How long to wait for exit reactions after terminating.
    pub shutdown_grace_secs: u64,
    pub log_level: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            stagger_delay_ms: 2_000,
            monitor_interval_ms: 10_000,
            shutdown_grace_secs: 5,
            log_level: "info".to_string(),
        }
    }
}

/// The external agent program launched once per worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub program: String,
    /// Arguments placed before the generated prompt.
    pub args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            args: vec!["--dangerously-skip-permissions".to_string()],
        }
    }
}

/// Pseudo-terminal settings handed to every worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub term: String,
    pub cols: u16,
    pub rows: u16,
    /// Extra variables layered over the fixed worker environment.
    pub extra_env: BTreeMap<String, String>,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            term: "xterm-256color".to_string(),
            cols: 80,
            rows: 30,
            extra_env: BTreeMap::new(),
        }
    }
}

impl TerminalConfig {
    /// Environment set on every worker, on top of the inherited one.
    pub fn worker_env(&self) -> Vec<(String, String)> {
        let mut env: BTreeMap<String, String> = [
            ("TERM", self.term.as_str()),
            ("FORCE_COLOR", "1"),
            ("CI", "false"),
            ("NODE_NO_READLINE", "1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        env.extend(self.extra_env.clone());
        env.into_iter().collect()
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            config = load_config_file(&global_path)?;
            debug!(path = %global_path.display(), "Loaded global config");
        }
    }

    if let Some(dir) = project_dir {
        let project_path = project_config_path(dir);
        if project_path.exists() {
            let project = load_config_file(&project_path)?;
            merge_config(&mut config, project);
            debug!(path = %project_path.display(), "Loaded project config");
        }
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Global settings file under the platform config directory.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("ptyfleet").join("settings.json"))
}

pub fn project_config_path(dir: &Path) -> PathBuf {
    dir.join(".ptyfleet").join("settings.json")
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    base.runner = overlay.runner;
    base.agent = overlay.agent;

    let extra_env = std::mem::take(&mut base.terminal.extra_env);
    base.terminal = overlay.terminal;
    for (key, value) in extra_env {
        base.terminal.extra_env.entry(key).or_insert(value);
    }
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(n) = var("PTYFLEET_STAGGER_MS").and_then(|v| v.parse().ok()) {
        config.runner.stagger_delay_ms = n;
    }
    if let Some(n) = var("PTYFLEET_MONITOR_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        config.runner.monitor_interval_ms = n;
    }
    if let Some(n) = var("PTYFLEET_SHUTDOWN_GRACE_SECS").and_then(|v| v.parse().ok()) {
        config.runner.shutdown_grace_secs = n;
    }
    if let Some(val) = var("PTYFLEET_LOG_LEVEL") {
        config.runner.log_level = val;
    }
    if let Some(val) = var("PTYFLEET_AGENT_BIN") {
        config.agent.program = val;
    }
}
