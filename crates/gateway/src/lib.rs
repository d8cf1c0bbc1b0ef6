//! `od-gateway` — the opsdeck HTTP gateway and run orchestrator.
//!
//! `POST /chat` starts a turn: the orchestrator drives the LLM in an
//! iterative tool loop, streams progress over server-sent events, and
//! persists the evolving assistant message. Approval-gated tool calls
//! suspend the run; `POST /approvals/:call_id` resumes it from the
//! persisted transcript. `POST /stop` requests cooperative cancellation.

pub mod api;
pub mod cli;
pub mod runtime;
pub mod state;
