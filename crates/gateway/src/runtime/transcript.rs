//! Rebuild LLM working state from a persisted conversation.
//!
//! Resume-after-approval starts a fresh run on whatever replica receives
//! the request; everything it needs is reconstructed here from the
//! transcript: the message history (including tool uses and results) and
//! the list of calls still pending a decision.

use serde_json::Value;

use od_conversations::{ConversationRecord, MessageRecord, Segment, ToolSegment, ToolStatus};
use od_domain::tool::{ContentPart, Message, MessageContent, Role};

use super::DENIAL_TEXT;

/// A tool call recovered from the transcript for a resume run.
#[derive(Debug, Clone)]
pub struct PendingCall {
    pub call_id: String,
    pub tool: String,
    pub title: String,
    pub args: Value,
    pub requires_approval: bool,
}

impl From<&ToolSegment> for PendingCall {
    fn from(segment: &ToolSegment) -> Self {
        Self {
            call_id: segment.call_id.clone(),
            tool: segment.tool.clone(),
            title: segment.title.clone(),
            args: segment.args.clone(),
            requires_approval: segment.requires_approval,
        }
    }
}

/// Joined text of a tool segment's result blocks.
fn result_text(blocks: &[Value]) -> String {
    blocks
        .iter()
        .filter_map(|b| {
            if b.get("type").and_then(|t| t.as_str()) == Some("text") {
                b.get("text").and_then(|t| t.as_str())
            } else {
                None
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Convert a persisted conversation into the LLM working message list.
///
/// Tool segments become `tool_use` parts on their assistant message;
/// settled calls additionally produce a tool-role result message. Calls
/// that never ran (pending, awaiting approval, mid-execution at a crash)
/// contribute the `tool_use` part only — the resume loop supplies their
/// results.
pub fn conversation_to_messages(record: &ConversationRecord) -> Vec<Message> {
    let mut messages = Vec::new();

    for message in &record.messages {
        match message {
            MessageRecord::User { text, .. } => messages.push(Message::user(text.clone())),
            MessageRecord::Assistant { segments, .. } => {
                let mut parts: Vec<ContentPart> = Vec::new();
                let mut results: Vec<Message> = Vec::new();

                for segment in segments {
                    match segment {
                        Segment::Text { text, .. } => parts.push(ContentPart::Text {
                            text: text.clone(),
                        }),
                        Segment::Tool(tool) => {
                            parts.push(ContentPart::ToolUse {
                                id: tool.call_id.clone(),
                                name: tool.tool.clone(),
                                input: tool.args.clone(),
                            });
                            match tool.status {
                                ToolStatus::Completed => {
                                    let text = tool
                                        .result
                                        .as_deref()
                                        .map(result_text)
                                        .unwrap_or_default();
                                    results.push(Message::tool_result(
                                        tool.call_id.clone(),
                                        text,
                                        false,
                                    ));
                                }
                                ToolStatus::Denied => {
                                    results.push(Message::tool_result(
                                        tool.call_id.clone(),
                                        DENIAL_TEXT,
                                        false,
                                    ));
                                }
                                ToolStatus::Error => {
                                    let text = format!(
                                        "tool failed: {}",
                                        tool.error.as_deref().unwrap_or("unknown error")
                                    );
                                    results.push(Message::tool_result(
                                        tool.call_id.clone(),
                                        text,
                                        true,
                                    ));
                                }
                                _ => {}
                            }
                        }
                    }
                }

                if !parts.is_empty() {
                    messages.push(Message {
                        role: Role::Assistant,
                        content: MessageContent::Parts(parts),
                    });
                }
                messages.extend(results);
            }
        }
    }

    messages
}

/// Calls of the most recent assistant message still awaiting a decision.
pub fn pending_calls(record: &ConversationRecord) -> Vec<PendingCall> {
    record
        .awaiting_approval_segments()
        .into_iter()
        .map(PendingCall::from)
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use od_conversations::TokenUsage;

    fn tool(call_id: &str, status: ToolStatus, result: Option<Vec<Value>>) -> ToolSegment {
        ToolSegment {
            call_id: call_id.into(),
            tool: "get_pods".into(),
            title: "Get pods".into(),
            args: serde_json::json!({"namespace": "default"}),
            status,
            requires_approval: status == ToolStatus::AwaitingApproval,
            result,
            error: None,
            timestamp: 0,
        }
    }

    fn record(messages: Vec<MessageRecord>) -> ConversationRecord {
        ConversationRecord {
            id: "c1".into(),
            owner_user_id: "u1".into(),
            title: None,
            messages,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn completed_call_produces_use_and_result() {
        let blocks = vec![serde_json::json!({"type": "text", "text": "pod-a\npod-b"})];
        let rec = record(vec![
            MessageRecord::User {
                text: "list pods".into(),
                timestamp: 1,
            },
            MessageRecord::Assistant {
                segments: vec![
                    Segment::Tool(tool("C1", ToolStatus::Completed, Some(blocks))),
                    Segment::Text {
                        text: "You have 2 pods.".into(),
                        timestamp: 3,
                    },
                ],
                token_usage: Some(TokenUsage::default()),
                timestamp: 2,
            },
        ]);

        let messages = conversation_to_messages(&rec);
        // user, assistant(parts), tool result
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[2].role, Role::Tool);
        match &messages[2].content {
            MessageContent::Parts(parts) => match &parts[0] {
                ContentPart::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    assert_eq!(tool_use_id, "C1");
                    assert_eq!(content, "pod-a\npod-b");
                    assert!(!is_error);
                }
                _ => panic!("expected tool result part"),
            },
            _ => panic!("expected parts"),
        }
    }

    #[test]
    fn awaiting_call_has_no_result_message() {
        let rec = record(vec![MessageRecord::Assistant {
            segments: vec![Segment::Tool(tool("C1", ToolStatus::AwaitingApproval, None))],
            token_usage: None,
            timestamp: 1,
        }]);

        let messages = conversation_to_messages(&rec);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::Assistant);
    }

    #[test]
    fn denied_call_feeds_denial_text() {
        let rec = record(vec![MessageRecord::Assistant {
            segments: vec![Segment::Tool(ToolSegment {
                result: Some(vec![serde_json::json!({"type":"text","text": DENIAL_TEXT})]),
                ..tool("C1", ToolStatus::Denied, None)
            })],
            token_usage: None,
            timestamp: 1,
        }]);

        let messages = conversation_to_messages(&rec);
        assert_eq!(messages.len(), 2);
        match &messages[1].content {
            MessageContent::Parts(parts) => match &parts[0] {
                ContentPart::ToolResult { content, .. } => assert_eq!(content, DENIAL_TEXT),
                _ => panic!("expected tool result"),
            },
            _ => panic!("expected parts"),
        }
    }

    #[test]
    fn errored_call_feeds_failure_text() {
        let rec = record(vec![MessageRecord::Assistant {
            segments: vec![Segment::Tool(ToolSegment {
                error: Some("connection refused".into()),
                ..tool("C2", ToolStatus::Error, None)
            })],
            token_usage: None,
            timestamp: 1,
        }]);

        let messages = conversation_to_messages(&rec);
        match &messages[1].content {
            MessageContent::Parts(parts) => match &parts[0] {
                ContentPart::ToolResult {
                    content, is_error, ..
                } => {
                    assert_eq!(content, "tool failed: connection refused");
                    assert!(*is_error);
                }
                _ => panic!("expected tool result"),
            },
            _ => panic!("expected parts"),
        }
    }

    #[test]
    fn pending_calls_recovers_awaiting_segments_only() {
        let rec = record(vec![MessageRecord::Assistant {
            segments: vec![
                Segment::Tool(tool("done", ToolStatus::Completed, Some(vec![]))),
                Segment::Tool(tool("C1", ToolStatus::AwaitingApproval, None)),
            ],
            token_usage: None,
            timestamp: 1,
        }]);

        let pending = pending_calls(&rec);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].call_id, "C1");
        assert!(pending[0].requires_approval);
    }
}
