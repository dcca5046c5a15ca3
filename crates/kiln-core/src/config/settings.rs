use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Interpreters the gdb frontend accepts
pub const INTERPRETERS: &[&str] = &["console", "mi", "mi1", "mi2", "mi3"];

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub discovery: DiscoverySettings,

    #[serde(default)]
    pub debug: DebugSettings,

    #[serde(default)]
    pub operations: OperationSettings,

    /// Overrides the XDG data directory (package index, installed platforms)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverySettings {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Used when a `board_list` call passes a zero timeout
    #[serde(default = "default_board_list_timeout")]
    pub board_list_timeout_ms: u64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            board_list_timeout_ms: default_board_list_timeout(),
        }
    }
}

impl DiscoverySettings {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugSettings {
    #[serde(default = "default_max_sessions")]
    pub max_sessions_per_instance: usize,

    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    #[serde(default = "default_interpreter")]
    pub default_interpreter: String,
}

impl Default for DebugSettings {
    fn default() -> Self {
        Self {
            max_sessions_per_instance: default_max_sessions(),
            shutdown_grace_ms: default_shutdown_grace(),
            default_interpreter: default_interpreter(),
        }
    }
}

impl DebugSettings {
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationSettings {
    /// Capacity of every per-stream event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for OperationSettings {
    fn default() -> Self {
        Self {
            event_buffer: default_event_buffer(),
        }
    }
}

fn default_poll_interval() -> u64 {
    1000
}
fn default_board_list_timeout() -> u64 {
    1000
}
fn default_max_sessions() -> usize {
    4
}
fn default_shutdown_grace() -> u64 {
    2000
}
fn default_interpreter() -> String {
    "console".to_string()
}
fn default_event_buffer() -> usize {
    64
}

impl Config {
    /// Load config from file.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, contains invalid JSON,
    /// or holds values that fail [`Config::validate`].
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        super::validation::warn_unknown_fields(&content, "config.json");
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the daemon cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        let zero_checks = [
            ("discovery.pollIntervalMs", self.discovery.poll_interval_ms == 0),
            (
                "discovery.boardListTimeoutMs",
                self.discovery.board_list_timeout_ms == 0,
            ),
            (
                "debug.maxSessionsPerInstance",
                self.debug.max_sessions_per_instance == 0,
            ),
            ("operations.eventBuffer", self.operations.event_buffer == 0),
        ];
        if let Some((field, _)) = zero_checks.iter().find(|(_, is_zero)| *is_zero) {
            return Err(Error::Config(format!("{field} must be greater than zero")));
        }

        if !INTERPRETERS.contains(&self.debug.default_interpreter.as_str()) {
            return Err(Error::Config(format!(
                "debug.defaultInterpreter: unknown interpreter '{}'",
                self.debug.default_interpreter
            )));
        }
        Ok(())
    }
}
