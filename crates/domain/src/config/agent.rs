use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// System prompt prepended to every run. Treated as an opaque string.
    #[serde(default = "d_system_prompt")]
    pub system_prompt: String,
    /// Message-window budget in (estimated) tokens. The system message is
    /// always kept; older messages are dropped oldest-first past this.
    #[serde(default = "d_window")]
    pub sliding_window_tokens: usize,
    /// Maximum LLM-tool loop iterations before the run is force-failed.
    #[serde(default = "d_loops")]
    pub max_tool_loops: usize,
    /// Stop-flag TTL, seconds.
    #[serde(default = "d_stop_ttl")]
    pub stop_flag_ttl_seconds: u64,
    /// Idle interval before a heartbeat frame is written to the stream.
    #[serde(default = "d_heartbeat")]
    pub stream_heartbeat_seconds: u64,
    /// When set, a call still awaiting approval after this many seconds
    /// is auto-denied.
    #[serde(default)]
    pub approval_timeout_seconds: Option<u64>,
    /// Tools that always require approval regardless of their descriptor
    /// annotations (user preference).
    #[serde(default)]
    pub approval_required_tools: Vec<String>,
    /// Integration-metadata keys stripped from event payloads before
    /// publication, in addition to any key starting with `_`.
    #[serde(default)]
    pub integration_metadata_keys: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: d_system_prompt(),
            sliding_window_tokens: d_window(),
            max_tool_loops: d_loops(),
            stop_flag_ttl_seconds: d_stop_ttl(),
            stream_heartbeat_seconds: d_heartbeat(),
            approval_timeout_seconds: None,
            approval_required_tools: Vec::new(),
            integration_metadata_keys: Vec::new(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_system_prompt() -> String {
    "You are an operations assistant. Use the available tools to inspect \
     and act on the user's infrastructure, then explain what you did in \
     concise markdown."
        .into()
}
fn d_window() -> usize {
    24_000
}
fn d_loops() -> usize {
    25
}
fn d_stop_ttl() -> u64 {
    600
}
fn d_heartbeat() -> u64 {
    60
}
