use std::sync::Arc;

use od_conversations::ConversationStore;
use od_domain::config::Config;
use od_providers::LlmProvider;
use od_toolserver::ToolCatalog;

use crate::runtime::events::EventBus;
use crate::runtime::stop::StopRegistry;

/// Shared application state passed to all API handlers.
///
/// Fields are grouped by concern:
/// - **Core services** — config, LLM provider, tool catalog
/// - **Persistence** — conversation store, stop registry
/// - **Streaming** — event bus
/// - **Security** — startup-computed token hashes
#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub llm: Arc<dyn LlmProvider>,
    pub tools: Arc<dyn ToolCatalog>,

    // ── Persistence ───────────────────────────────────────────────────
    pub conversations: Arc<ConversationStore>,
    pub stops: Arc<StopRegistry>,

    // ── Streaming ─────────────────────────────────────────────────────
    pub events: Arc<EventBus>,

    // ── Security (startup-computed) ───────────────────────────────────
    /// SHA-256 hash of the API bearer token. `None` = dev mode (no auth).
    pub api_token_hash: Option<Vec<u8>>,
    /// SHA-256 hash of the admin bearer token. `None` = no admin override.
    pub admin_token_hash: Option<Vec<u8>>,
}
