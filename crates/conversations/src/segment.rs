//! Conversation value types and the tool-segment status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Pending,
    AwaitingApproval,
    Executing,
    Approved,
    Denied,
    Completed,
    Error,
}

impl ToolStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Denied | Self::Completed | Self::Error)
    }

    /// The legal transitions:
    ///
    /// ```text
    ///               pending
    ///                 │
    ///      requires_approval?
    ///           │         │
    ///          yes        no
    ///           ▼          ▼
    ///   awaiting_approval  executing
    ///      │         │        │
    ///   approve    deny       │
    ///      ▼         ▼        ▼
    ///   executing  denied   completed / error
    /// ```
    ///
    /// `approved` is accepted as an intermediate between approval and
    /// dispatch. Everything else is illegal.
    pub fn can_transition(self, to: ToolStatus) -> bool {
        use ToolStatus::*;
        matches!(
            (self, to),
            (Pending, AwaitingApproval)
                | (Pending, Executing)
                | (AwaitingApproval, Approved)
                | (AwaitingApproval, Executing)
                | (AwaitingApproval, Denied)
                | (Approved, Executing)
                | (Executing, Completed)
                | (Executing, Error)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Executing => "executing",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Segments
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One tool invocation inside an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSegment {
    /// Unique within the conversation.
    pub call_id: String,
    pub tool: String,
    pub title: String,
    pub args: Value,
    pub status: ToolStatus,
    #[serde(default)]
    pub requires_approval: bool,
    /// Present iff status is `completed` or `denied`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Vec<Value>>,
    /// Present iff status is `error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Milliseconds since epoch.
    pub timestamp: i64,
}

/// An element of an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Segment {
    Text { text: String, timestamp: i64 },
    Tool(ToolSegment),
}

impl Segment {
    pub fn timestamp(&self) -> i64 {
        match self {
            Segment::Text { timestamp, .. } => *timestamp,
            Segment::Tool(t) => t.timestamp,
        }
    }

    pub fn as_tool(&self) -> Option<&ToolSegment> {
        match self {
            Segment::Tool(t) => Some(t),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Token usage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UsageSource {
    #[default]
    Provider,
    Estimated,
}

/// Token and latency metrics attached to a completed assistant message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    #[serde(default)]
    pub cached_tokens: u32,
    #[serde(default)]
    pub cost: f64,
    /// Latency to first content token, from run start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttft_ms: Option<i64>,
    /// Total response latency, from run start to the final event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttr_ms: Option<i64>,
    #[serde(default)]
    pub source: UsageSource,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Messages and conversations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageRecord {
    User {
        text: String,
        timestamp: i64,
    },
    Assistant {
        segments: Vec<Segment>,
        #[serde(skip_serializing_if = "Option::is_none")]
        token_usage: Option<TokenUsage>,
        timestamp: i64,
    },
}

impl MessageRecord {
    pub fn is_assistant(&self) -> bool {
        matches!(self, MessageRecord::Assistant { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: String,
    pub owner_user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub messages: Vec<MessageRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationRecord {
    /// Find a tool segment anywhere in the transcript by call id.
    pub fn find_tool_segment(&self, call_id: &str) -> Option<&ToolSegment> {
        self.messages.iter().find_map(|m| match m {
            MessageRecord::Assistant { segments, .. } => segments
                .iter()
                .filter_map(Segment::as_tool)
                .find(|t| t.call_id == call_id),
            _ => None,
        })
    }

    /// Tool segments of the most recent assistant message that are still
    /// waiting on a user decision.
    pub fn awaiting_approval_segments(&self) -> Vec<&ToolSegment> {
        self.messages
            .iter()
            .rev()
            .find_map(|m| match m {
                MessageRecord::Assistant { segments, .. } => Some(segments),
                _ => None,
            })
            .map(|segments| {
                segments
                    .iter()
                    .filter_map(Segment::as_tool)
                    .filter(|t| t.status == ToolStatus::AwaitingApproval)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The user message opening the first turn, if any.
    pub fn first_user_text(&self) -> Option<&str> {
        self.messages.iter().find_map(|m| match m {
            MessageRecord::User { text, .. } => Some(text.as_str()),
            _ => None,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
