//! `od-conversations` — conversation transcript persistence.
//!
//! A conversation is an ordered list of user and assistant messages; an
//! assistant message is an ordered list of text and tool segments. This
//! crate owns the value types, the tool-segment status machine, and the
//! file-backed store that is the only code knowing the storage layout.

pub mod segment;
pub mod store;

pub use segment::{
    ConversationRecord, MessageRecord, Segment, TokenUsage, ToolSegment, ToolStatus, UsageSource,
};
pub use store::{authorize, ConversationStore};
