//! `od-toolserver` — client for the external tool server.
//!
//! The tool server exposes operations tools over JSON-RPC 2.0. This crate
//! provides:
//! - the protocol types (`tools/list`, `tools/call` payloads),
//! - an HTTP transport with bounded exponential backoff on transport errors,
//! - a [`ToolCatalog`] trait plus the [`ToolServerClient`] implementation
//!   that caches the catalog, infers obvious missing arguments from an
//!   `action` hint, and normalizes result shapes.

pub mod catalog;
pub mod protocol;
pub mod transport;

pub use catalog::{ToolCallOutcome, ToolCatalog, ToolServerClient};
pub use protocol::ToolDescriptor;
