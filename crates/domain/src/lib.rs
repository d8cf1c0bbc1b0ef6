//! `od-domain` — shared types for opsdeck.
//!
//! Plain value types only: errors, clock/ID helpers, LLM wire types,
//! stream events, and the configuration tree. No I/O lives here.

pub mod clock;
pub mod config;
pub mod error;
pub mod stream;
pub mod tool;

pub use error::{Error, Result};
