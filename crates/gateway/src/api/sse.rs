//! Event-bus → server-sent-events pump.
//!
//! Each frame is written as `event: <type>\ndata: <json>\n\n`. The pump
//! writes `ready` first, forwards frames until a terminal status, and
//! emits a `heartbeat` when the subscription idles. A client disconnect
//! just drops the stream — the orchestrator keeps running to its own
//! terminal event.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, Sse};
use futures_core::Stream;
use tokio::sync::broadcast;

use od_domain::clock::now_ms;

use crate::runtime::events::Frame;

/// Build the SSE response for one run from an already-held subscription.
///
/// Subscribing before the orchestrator is spawned is the caller's job;
/// events published with no subscriber are dropped by design.
pub fn run_event_stream(
    rx: broadcast::Receiver<Frame>,
    run_id: String,
    conversation_id: Option<String>,
    heartbeat: Duration,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        let mut rx = rx;

        let mut ready = serde_json::json!({
            "run_id": run_id,
            "timestamp": now_ms(),
        });
        if let Some(cid) = &conversation_id {
            ready["conversation_id"] = serde_json::json!(cid);
        }
        yield Ok(Event::default().event("ready").data(ready.to_string()));

        loop {
            match tokio::time::timeout(heartbeat, rx.recv()).await {
                Ok(Ok(frame)) => {
                    let terminal = frame.terminal_status().is_some()
                        && (frame.event == "workflow_complete"
                            || frame.event == "workflow_error");
                    yield Ok(Event::default()
                        .event(frame.event.clone())
                        .data(frame.data.to_string()));
                    if terminal {
                        break;
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(missed))) => {
                    // At-most-once: a slow client loses frames rather than
                    // applying backpressure to the run.
                    tracing::warn!(missed, "subscriber lagged; frames dropped");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => break,
                Err(_idle) => {
                    let mut beat = serde_json::json!({"timestamp": now_ms()});
                    if let Some(cid) = &conversation_id {
                        beat["conversation_id"] = serde_json::json!(cid);
                    }
                    yield Ok(Event::default()
                        .event("heartbeat")
                        .data(beat.to_string()));
                }
            }
        }
    };

    Sse::new(stream)
}
