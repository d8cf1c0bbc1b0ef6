//! Approval API — decides a pending tool call and resumes the run.
//!
//! `POST /approvals/:call_id` — body `{ approve, reason?, conversation_id }`,
//! response is the SSE stream of the resume run.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::json;

use od_conversations::{authorize, ToolStatus};
use od_domain::clock::new_id;

use crate::runtime::transcript::pending_calls;
use crate::runtime::{channel_for, persist_or_log, spawn_run, RunInput, DENIAL_TEXT};
use crate::state::AppState;

use super::auth::Caller;
use super::sse::run_event_stream;

#[derive(Debug, Deserialize)]
pub struct ApprovalDecision {
    pub approve: bool,
    #[serde(default)]
    pub reason: Option<String>,
    pub conversation_id: String,
}

fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

pub async fn decide(
    State(state): State<AppState>,
    caller: Caller,
    Path(call_id): Path<String>,
    Json(body): Json<ApprovalDecision>,
) -> Response {
    let record = match state.conversations.get(&body.conversation_id) {
        Ok(Some(record)) => record,
        Ok(None) => return api_error(StatusCode::NOT_FOUND, "conversation not found"),
        Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    if authorize(&record, caller.user_id.as_deref(), caller.is_admin).is_err() {
        return api_error(StatusCode::FORBIDDEN, "not the conversation owner");
    }

    // Recover the suspended calls before any status change.
    let pending = pending_calls(&record);
    if !pending.iter().any(|p| p.call_id == call_id) {
        return api_error(
            StatusCode::BAD_REQUEST,
            format!("call {call_id} is not awaiting approval"),
        );
    }

    tracing::info!(
        call_id = %call_id,
        approve = body.approve,
        reason = body.reason.as_deref().unwrap_or(""),
        "approval decision received"
    );

    // Eagerly persist a denial so a client reloading the transcript sees
    // it even if the resume run is slow.
    if !body.approve {
        persist_or_log(
            state.conversations.update_tool_segment_status(
                &body.conversation_id,
                &call_id,
                ToolStatus::Denied,
                Some(vec![json!({"type": "text", "text": DENIAL_TEXT})]),
                None,
            ),
            "eager denial",
        );
    }

    let run_id = new_id();
    let channel = channel_for(&run_id);
    let rx = state.events.subscribe(&channel);

    let mut input = RunInput::new_turn(run_id.clone(), Some(body.conversation_id.clone()), Vec::new());
    input.pending_calls = pending;
    input.approval_decisions = HashMap::from([(call_id, body.approve)]);
    input.suppress_pending_event = true;
    spawn_run(state.clone(), input);

    run_event_stream(
        rx,
        run_id,
        Some(body.conversation_id),
        Duration::from_secs(state.config.agent.stream_heartbeat_seconds),
    )
    .into_response()
}
