//! Core runtime — the orchestrator that ties the LLM loop, tool dispatch,
//! event publication, and transcript persistence into one deterministic
//! run per user turn.
//!
//! Entry point: [`spawn_run`] takes a [`RunInput`] and drives the loop on
//! its own task, publishing progress on the run's event channel.

pub mod events;
pub mod orchestrator;
pub mod stop;
pub mod title;
pub mod transcript;
pub mod window;

pub use orchestrator::{channel_for, spawn_run, IncomingMessage, RunInput};

/// Result text recorded for a denied call and fed back to the model.
pub const DENIAL_TEXT: &str = "Tool call was denied by the user";

/// Persistence failures are logged, never fatal: while a run is live the
/// event stream is the client's view, and the transcript catches up on the
/// next successful write.
pub(crate) fn persist_or_log(result: od_domain::Result<()>, context: &'static str) {
    if let Err(e) = result {
        tracing::warn!(error = %e, context, "transcript write failed");
    }
}
