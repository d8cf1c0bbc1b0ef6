pub mod approvals;
pub mod auth;
pub mod chat;
pub mod sse;
pub mod stop;
pub mod tools;

use axum::middleware;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Build the full API router.
///
/// Routes are split into **public** (no auth required) and **protected**
/// (gated behind the bearer-token middleware).
///
/// `state` is needed to wire up the auth middleware at build time.
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new().route("/health", get(health));

    let protected = Router::new()
        // Chat (core runtime)
        .route("/chat", post(chat::chat))
        // Stop (cooperative cancellation)
        .route("/stop", post(stop::stop_run))
        // Approvals (resume a suspended run)
        .route("/approvals/:call_id", post(approvals::decide))
        // Tool catalog
        .route("/tools", get(tools::list_tools))
        .route_layer(middleware::from_fn_with_state(
            state,
            auth::require_api_token,
        ));

    public
        .merge(protected)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
