//! Tool catalog API.
//!
//! `GET /tools` — the catalog as `[{name, title, tags, annotations}]`,
//! for UI and debugging.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use crate::state::AppState;

pub async fn list_tools(State(state): State<AppState>) -> Response {
    match state.tools.list_tools().await {
        Ok(descriptors) => {
            let catalog: Vec<serde_json::Value> = descriptors
                .iter()
                .map(|d| {
                    json!({
                        "name": d.name,
                        "title": d.display_title(),
                        "tags": d.tags(),
                        "annotations": d.annotations.clone().unwrap_or_else(|| json!({})),
                    })
                })
                .collect();
            Json(catalog).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("error fetching tool catalog: {e}") })),
        )
            .into_response(),
    }
}
