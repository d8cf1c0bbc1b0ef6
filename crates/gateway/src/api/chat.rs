//! Chat API — the primary interface for running agent turns.
//!
//! `POST /chat` — streams the run's events back as SSE.

use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;

use od_conversations::authorize;
use od_domain::clock::{new_id, now_ms};

use crate::runtime::title::maybe_spawn_title_generation;
use crate::runtime::{channel_for, persist_or_log, spawn_run, IncomingMessage, RunInput};
use crate::state::AppState;

use super::auth::Caller;
use super::sse::run_event_stream;

#[derive(Debug, Deserialize)]
pub struct ChatRequestBody {
    /// The message list; the last `user` message is the new turn.
    pub messages: Vec<IncomingMessage>,
    /// When present, the turn is persisted into this conversation.
    #[serde(default)]
    pub conversation_id: Option<String>,
}

fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

pub async fn chat(
    State(state): State<AppState>,
    caller: Caller,
    Json(body): Json<ChatRequestBody>,
) -> Response {
    if body.messages.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "messages are required");
    }
    if !body.messages.iter().any(|m| !m.content.is_empty()) {
        return api_error(StatusCode::BAD_REQUEST, "no valid messages found");
    }

    // Resolve the conversation (if any) and persist the user turn before
    // the run starts, so a crash mid-run still leaves the question on
    // record.
    let mut conversation_id = None;
    if let Some(cid) = &body.conversation_id {
        match state.conversations.get(cid) {
            Ok(Some(record)) => {
                if authorize(&record, caller.user_id.as_deref(), caller.is_admin).is_err() {
                    return api_error(StatusCode::FORBIDDEN, "not the conversation owner");
                }
                if let Some(last_user) = body.messages.iter().rev().find(|m| m.role == "user") {
                    persist_or_log(
                        state
                            .conversations
                            .append_user_message(cid, &last_user.content, now_ms()),
                        "append user message",
                    );
                }
                if record.title.is_none() {
                    maybe_spawn_title_generation(&state, cid);
                }
                conversation_id = Some(cid.clone());
            }
            Ok(None) => {
                // Unknown id: run the turn without persistence, matching
                // the stateless-call behavior.
                tracing::warn!(conversation_id = %cid, "conversation not found; running without persistence");
            }
            Err(e) => {
                return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
            }
        }
    }

    let run_id = new_id();
    let channel = channel_for(&run_id);
    let rx = state.events.subscribe(&channel);

    spawn_run(
        state.clone(),
        RunInput::new_turn(run_id.clone(), conversation_id.clone(), body.messages),
    );

    run_event_stream(
        rx,
        run_id,
        conversation_id,
        Duration::from_secs(state.config.agent.stream_heartbeat_seconds),
    )
    .into_response()
}
