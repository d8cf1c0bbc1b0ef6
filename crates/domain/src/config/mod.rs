mod agent;
mod llm;
mod server;
mod toolserver;

pub use agent::*;
pub use llm::*;
pub use server::*;
pub use toolserver::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub toolserver: ToolServerConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Auth
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Caller identity plumbing. Authentication itself is handled by the
/// fronting layer; the gateway reads the resolved user id from a header
/// and optionally gates the API behind a bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Environment variable holding the API bearer token.
    /// If the env var is unset, the API is open (dev mode).
    #[serde(default = "d_api_token_env")]
    pub api_token_env: String,
    /// Environment variable holding the admin bearer token.
    /// Presenting this token marks the caller as administrator.
    #[serde(default = "d_admin_token_env")]
    pub admin_token_env: String,
    /// Header carrying the caller's resolved user id.
    #[serde(default = "d_user_header")]
    pub user_header: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_token_env: d_api_token_env(),
            admin_token_env: d_admin_token_env(),
            user_header: d_user_header(),
        }
    }
}

fn d_api_token_env() -> String {
    "OD_API_TOKEN".into()
}
fn d_admin_token_env() -> String {
    "OD_ADMIN_TOKEN".into()
}
fn d_user_header() -> String {
    "x-user-id".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State directory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Root directory for persisted state (conversations, stop flags).
    /// Replicas share this directory.
    #[serde(default = "d_state_path")]
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: d_state_path(),
        }
    }
}

fn d_state_path() -> PathBuf {
    PathBuf::from("./data")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        let mut err = |field: &str, message: String| {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: field.into(),
                message,
            });
        };

        if self.server.port == 0 {
            err("server.port", "port must be greater than 0".into());
        }
        if self.server.host.is_empty() {
            err("server.host", "host must not be empty".into());
        }
        if self.llm.model.is_empty() {
            err("llm.model", "model must not be empty".into());
        }
        if self.llm.base_url.is_empty() {
            err("llm.base_url", "base_url must not be empty".into());
        }
        if self.toolserver.base_url.is_empty() {
            err("toolserver.base_url", "base_url must not be empty".into());
        }
        if self.agent.sliding_window_tokens == 0 {
            err(
                "agent.sliding_window_tokens",
                "window budget must be greater than 0".into(),
            );
        }
        if self.agent.max_tool_loops == 0 {
            err(
                "agent.max_tool_loops",
                "loop bound must be greater than 0".into(),
            );
        }

        if self.agent.stream_heartbeat_seconds < 5 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "agent.stream_heartbeat_seconds".into(),
                message: "very short heartbeat interval; clients will see noisy streams".into(),
            });
        }

        issues
    }
}
