use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Model identifier sent to the provider (e.g. "gpt-4o").
    #[serde(default = "d_model")]
    pub model: String,
    /// Base URL of an OpenAI-compatible chat completions endpoint.
    #[serde(default = "d_base_url")]
    pub base_url: String,
    /// Environment variable holding the provider API key.
    #[serde(default = "d_api_key_env")]
    pub api_key_env: String,
    /// Sampling temperature for the main loop.
    #[serde(default = "d_temperature")]
    pub temperature: f32,
    /// Per-request timeout, seconds.
    #[serde(default = "d_timeout")]
    pub timeout_seconds: u64,
    /// Bounded retry on rate-limit or timeout.
    #[serde(default = "d_retries")]
    pub max_retries: u32,
    /// Base delay for exponential backoff, seconds.
    #[serde(default = "d_retry_base")]
    pub retry_base_seconds: f64,
    /// Per-model pricing for cost estimation (key = model name).
    #[serde(default)]
    pub pricing: HashMap<String, ModelPricing>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: d_model(),
            base_url: d_base_url(),
            api_key_env: d_api_key_env(),
            temperature: d_temperature(),
            timeout_seconds: d_timeout(),
            max_retries: d_retries(),
            retry_base_seconds: d_retry_base(),
            pricing: HashMap::new(),
        }
    }
}

/// Pricing per million tokens for a specific model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Dollars per 1 million input (prompt) tokens.
    pub input_per_1m: f64,
    /// Dollars per 1 million output (completion) tokens.
    pub output_per_1m: f64,
}

impl ModelPricing {
    /// Estimated cost in USD for the given token counts.
    pub fn estimate_cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (input_tokens as f64 * self.input_per_1m + output_tokens as f64 * self.output_per_1m)
            / 1_000_000.0
    }
}

impl LlmConfig {
    /// Look up pricing for the configured model.
    pub fn pricing_for(&self, model: &str) -> Option<ModelPricing> {
        self.pricing.get(model).copied()
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_model() -> String {
    "gpt-4o".into()
}
fn d_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn d_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn d_temperature() -> f32 {
    0.2
}
fn d_timeout() -> u64 {
    120
}
fn d_retries() -> u32 {
    3
}
fn d_retry_base() -> f64 {
    5.0
}
