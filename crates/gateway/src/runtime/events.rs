//! Per-run event bus.
//!
//! Each run publishes to its own channel (`run:<run_id>`); the streaming
//! transport subscribes before the run is spawned. Delivery is
//! at-most-once: lagged subscribers drop frames, and publishing never
//! blocks or fails the publisher. Events published with no subscriber are
//! dropped — the persisted transcript is the source of truth for clients
//! that reconnect.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;

use od_domain::clock::now_ms;

const CHANNEL_CAPACITY: usize = 256;

/// Statuses that end a stream.
pub const TERMINAL_STATUSES: [&str; 4] = ["completed", "error", "awaiting_approval", "stopped"];

/// One published event: the SSE event name plus its JSON payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub event: String,
    pub data: Value,
}

impl Frame {
    /// The terminal status carried by this frame, if any.
    pub fn terminal_status(&self) -> Option<&str> {
        self.data
            .get("status")
            .and_then(|s| s.as_str())
            .filter(|s| TERMINAL_STATUSES.contains(s))
    }
}

pub struct EventBus {
    channels: RwLock<HashMap<String, broadcast::Sender<Frame>>>,
    /// Keys stripped from payloads in addition to `_`-prefixed ones.
    redact_keys: Vec<String>,
}

impl EventBus {
    pub fn new(redact_keys: Vec<String>) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            redact_keys,
        }
    }

    /// Subscribe to a channel, creating it if needed.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Frame> {
        let mut channels = self.channels.write();
        let tx = channels
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        tx.subscribe()
    }

    /// Publish an event on a channel. Stamps `timestamp` (ms) and
    /// `conversation_id` when absent, strips integration-metadata keys,
    /// and silently drops the frame when nobody is subscribed.
    pub fn publish(
        &self,
        channel: &str,
        event_type: &str,
        mut payload: Value,
        conversation_id: Option<&str>,
    ) {
        strip_metadata_keys(&mut payload, &self.redact_keys);

        if let Some(obj) = payload.as_object_mut() {
            obj.entry("timestamp").or_insert_with(|| now_ms().into());
            if let Some(cid) = conversation_id {
                obj.entry("conversation_id").or_insert_with(|| cid.into());
            }
        }

        let channels = self.channels.read();
        if let Some(tx) = channels.get(channel) {
            // Send fails only when every receiver is gone; that is the
            // fire-and-forget case.
            let _ = tx.send(Frame {
                event: event_type.to_owned(),
                data: payload,
            });
        }
    }

    /// Drop a completed run's channel.
    pub fn close_channel(&self, channel: &str) {
        self.channels.write().remove(channel);
    }
}

/// Remove integration-metadata keys (leading `_`, or listed in config)
/// from every object in the payload tree. Internal correlation data must
/// never reach a client.
fn strip_metadata_keys(value: &mut Value, redact: &[String]) {
    match value {
        Value::Object(map) => {
            map.retain(|key, _| !key.starts_with('_') && !redact.iter().any(|r| r == key));
            for v in map.values_mut() {
                strip_metadata_keys(v, redact);
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                strip_metadata_keys(v, redact);
            }
        }
        _ => {}
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
