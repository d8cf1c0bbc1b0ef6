use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool server client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerConfig {
    /// Base URL of the tool server's JSON-RPC endpoint.
    #[serde(default = "d_base_url")]
    pub base_url: String,
    /// How long a fetched catalog stays fresh, seconds.
    #[serde(default = "d_catalog_ttl")]
    pub catalog_ttl_seconds: u64,
    /// Bounded retry on transport errors.
    #[serde(default = "d_retries")]
    pub max_retries: u32,
    /// Base delay for exponential backoff, milliseconds.
    #[serde(default = "d_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Per-request timeout, seconds.
    #[serde(default = "d_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ToolServerConfig {
    fn default() -> Self {
        Self {
            base_url: d_base_url(),
            catalog_ttl_seconds: d_catalog_ttl(),
            max_retries: d_retries(),
            retry_base_ms: d_retry_base_ms(),
            timeout_seconds: d_timeout(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_base_url() -> String {
    "http://127.0.0.1:8971/rpc".into()
}
fn d_catalog_ttl() -> u64 {
    300
}
fn d_retries() -> u32 {
    3
}
fn d_retry_base_ms() -> u64 {
    250
}
fn d_timeout() -> u64 {
    60
}
