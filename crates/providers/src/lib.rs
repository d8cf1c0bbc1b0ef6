//! `od-providers` — LLM provider adapters for opsdeck.
//!
//! The gateway talks to models through the [`LlmProvider`] trait. One real
//! adapter ships here (any OpenAI-compatible chat completions endpoint)
//! plus a deterministic scripted provider for tests.

pub mod mock;
pub mod openai_compat;
pub mod retry;
pub mod traits;
mod util;

pub use openai_compat::OpenAiCompatProvider;
pub use traits::{ChatRequest, ChatResponse, LlmProvider};

use std::sync::Arc;

use od_domain::config::LlmConfig;
use od_domain::Result;

/// Build the configured provider.
pub fn provider_from_config(cfg: &LlmConfig) -> Result<Arc<dyn LlmProvider>> {
    let api_key = std::env::var(&cfg.api_key_env).unwrap_or_default();
    if api_key.is_empty() {
        tracing::warn!(
            env_var = %cfg.api_key_env,
            "LLM API key env var is unset — provider calls will be rejected upstream"
        );
    }
    Ok(Arc::new(OpenAiCompatProvider::new(cfg, api_key)?))
}
