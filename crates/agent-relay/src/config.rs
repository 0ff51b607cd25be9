//! Application configuration.
//!
//! Loaded by the binary from `config.toml` layered with `AGENT_RELAY__*`
//! environment variables. Every section has defaults so an empty file is a
//! valid configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    /// External tool invocation.
    pub tool: ToolConfig,
    pub workspace: WorkspaceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
        }
    }
}

/// How a known conversation id is passed back to the tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResumeMode {
    /// `--resume <id>`
    #[default]
    Resume,
    /// `--continue` (most recent conversation in the working directory)
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Executable name or path.
    pub binary: String,
    /// Arguments placed before the streaming flags (wrappers, interpreters).
    pub base_args: Vec<String>,
    /// Arguments appended after all generated flags.
    pub extra_args: Vec<String>,
    pub resume_mode: ResumeMode,
    /// Wall-clock ceiling for one turn.
    pub turn_timeout_secs: u64,
    /// Delay between SIGTERM and SIGKILL after a user cancel.
    pub kill_grace_secs: u64,
    /// How long to keep reading output pipes after the process exits.
    pub drain_timeout_ms: u64,
    /// Stderr lines containing this marker are logged but not relayed.
    pub stderr_debug_marker: String,
    /// Extra environment for the tool.
    pub env: HashMap<String, String>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            base_args: Vec::new(),
            extra_args: Vec::new(),
            resume_mode: ResumeMode::Resume,
            turn_timeout_secs: 600,
            kill_grace_secs: 5,
            drain_timeout_ms: 2000,
            stderr_debug_marker: "[DEBUG]".to_string(),
            env: HashMap::new(),
        }
    }
}

/// Ceiling applied to every configured duration.
pub const MAX_LIMIT: Duration = Duration::from_secs(30 * 24 * 60 * 60);

impl ToolConfig {
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs).min(MAX_LIMIT)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs).min(MAX_LIMIT)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms).min(MAX_LIMIT)
    }

    /// Longest a turn can take to wind down once cancelled.
    pub fn teardown_bound(&self, slack: Duration) -> Duration {
        self.kill_grace()
            .saturating_add(self.drain_timeout())
            .saturating_add(slack)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Working directory for the tool. Defaults to the server's cwd.
    pub project_path: Option<String>,
    /// Root for per-connection image attachments. Defaults to
    /// `<data_dir>/attachments`.
    pub attachments_dir: Option<String>,
}
