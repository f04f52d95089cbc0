use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Central server URL the local agent connects to.
    pub url: String,
    /// Directory holding the installed release (for the auto-update checker).
    pub install_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "wss://localhost:8080".to_string(),
            install_dir: default_install_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Complexity score (0-10) at or above which Dot must hand the request to
    /// the agent pipeline instead of answering inline.
    pub threshold: f32,
    /// Tool-loop iteration at which Dot escalates to the workhorse tier.
    pub escalate_workhorse_at: u32,
    /// Tool-loop iteration at which Dot escalates to the architect tier.
    pub escalate_architect_at: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            threshold: 7.0,
            escalate_workhorse_at: 6,
            escalate_architect_at: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Max scheduled-task prompts in flight at once.
    pub max_concurrent: usize,
    /// Consecutive failures before a scheduled task is paused.
    pub max_consecutive_failures: u32,
    /// Grace period in minutes after `next_run_at` inside which a task still
    /// runs silently. Past it the user is consulted.
    pub grace_minutes: i64,
    /// Per-task response timeout in minutes.
    pub response_timeout_minutes: i64,
    /// IANA timezone for schedule math. Empty means detect from the system.
    pub timezone: String,
    /// Quiet-window hours for the auto-update checker.
    pub update_quiet_start_hour: u8,
    pub update_quiet_end_hour: u8,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            max_consecutive_failures: 3,
            grace_minutes: 120,
            response_timeout_minutes: 5,
            timezone: String::new(),
            update_quiet_start_hour: 2,
            update_quiet_end_hour: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Max tool-loop iterations for a single pipeline step.
    pub step_max_iterations: u32,
    /// Hours a completed agent workspace is retained before GC.
    pub workspace_retention_hours: i64,
    /// Upper bound on planner steps.
    pub max_plan_steps: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            step_max_iterations: 30,
            workspace_retention_hours: 24,
            max_plan_steps: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Session token lifetime in days.
    pub session_days: i64,
    /// Default invite-token lifetime in days.
    pub invite_days: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_days: 30,
            invite_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub dispatch: DispatchConfig,
    pub scheduler: SchedulerConfig,
    pub agent: AgentConfig,
    pub auth: AuthConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Load from a toml file, then apply environment overrides. A missing file
    /// yields defaults; a malformed file is an error.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("DOTBOT_SERVER") {
            if !value.is_empty() {
                config.server.url = value;
            }
        }
        if let Ok(value) = env::var("DOTBOT_INSTALL_DIR") {
            if !value.is_empty() {
                config.server.install_dir = value;
            }
        }

        Ok(config)
    }

    /// Load from the default location (`~/.bot/config.toml`).
    pub fn load() -> Result<Self> {
        Self::load_from(bot_dir().join("config.toml"))
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}

/// Root of all persisted local state: `~/.bot/`.
pub fn bot_dir() -> PathBuf {
    home_dir().join(".bot")
}

/// `~/.bot/memory/`
pub fn memory_dir() -> PathBuf {
    bot_dir().join("memory")
}

/// `~/.bot/agent-workspaces/`
pub fn agent_workspaces_dir() -> PathBuf {
    bot_dir().join("agent-workspaces")
}

/// `~/.bot/scheduled-tasks.json`
pub fn scheduled_tasks_path() -> PathBuf {
    bot_dir().join("scheduled-tasks.json")
}

/// `~/.bot/vault.json`
pub fn vault_path() -> PathBuf {
    bot_dir().join("vault.json")
}

/// `~/.bot/device.json`
pub fn device_path() -> PathBuf {
    bot_dir().join("device.json")
}

fn home_dir() -> PathBuf {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

fn default_install_dir() -> String {
    if cfg!(windows) {
        env::var("USERPROFILE")
            .map(|p| format!("{p}\\DotBot"))
            .unwrap_or_else(|_| "C:\\DotBot".to_string())
    } else {
        home_dir().join(".local/share/dotbot").display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.dispatch.threshold, 7.0);
        assert_eq!(config.scheduler.max_concurrent, 2);
        assert_eq!(config.scheduler.grace_minutes, 120);
        assert_eq!(config.agent.step_max_iterations, 30);
        assert_eq!(config.auth.session_days, 30);
        assert_eq!(config.auth.invite_days, 7);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_from(dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.dispatch.threshold, 7.0);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[dispatch]\nthreshold = 5.0\n").unwrap();
        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.dispatch.threshold, 5.0);
        assert_eq!(config.scheduler.max_concurrent, 2);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");
        let mut config = AppConfig::default();
        config.dispatch.threshold = 8.5;
        config.scheduler.timezone = "America/Chicago".to_string();
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.dispatch.threshold, 8.5);
        assert_eq!(loaded.scheduler.timezone, "America/Chicago");
    }
}
