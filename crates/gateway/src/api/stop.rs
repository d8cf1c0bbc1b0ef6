//! Stop API — cooperative cancellation of an in-flight run.
//!
//! `POST /stop` sets the run's stop flag (visible to whichever replica
//! owns the run) and immediately publishes the terminal event so any
//! attached stream closes without waiting for the next loop boundary.

use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;

use od_conversations::authorize;

use crate::runtime::channel_for;
use crate::state::AppState;

use super::auth::Caller;

#[derive(Debug, Deserialize)]
pub struct StopRequest {
    /// Conversation the run belongs to, for authorization.
    pub conversation_id: String,
    /// The specific run to stop.
    pub run_id: String,
}

pub async fn stop_run(
    State(state): State<AppState>,
    caller: Caller,
    Json(body): Json<StopRequest>,
) -> Response {
    if let Ok(Some(record)) = state.conversations.get(&body.conversation_id) {
        if authorize(&record, caller.user_id.as_deref(), caller.is_admin).is_err() {
            return (
                StatusCode::FORBIDDEN,
                Json(json!({ "error": "not the conversation owner" })),
            )
                .into_response();
        }
    }

    state.stops.request_stop(
        &body.run_id,
        Some(Duration::from_secs(state.config.agent.stop_flag_ttl_seconds)),
    );

    state.events.publish(
        &channel_for(&body.run_id),
        "workflow_complete",
        json!({
            "run_id": body.run_id,
            "status": "stopped",
            "result": {"done": true},
        }),
        Some(body.conversation_id.as_str()),
    );

    Json(json!({
        "status": "stopped",
        "conversation_id": body.conversation_id,
        "run_id": body.run_id,
    }))
    .into_response()
}
