//! Deterministic scripted provider for tests.
//!
//! Each call to `chat_stream` pops the next script from the front of the
//! queue and replays its events. Tests can specify exact sequences —
//! including tool calls and usage — without network access.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use od_domain::stream::{BoxStream, StreamEvent, Usage};
use od_domain::tool::ToolCall;
use od_domain::{Error, Result};

use crate::traits::{ChatRequest, ChatResponse, LlmProvider};

pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Vec<StreamEvent>>>,
    /// The last request seen, so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<ChatRequest>>>,
}

impl ScriptedProvider {
    /// Build a provider from an ordered list of per-call scripts.
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Script for a pure-text completion, streamed one character at a time.
    pub fn text_script(text: &str) -> Vec<StreamEvent> {
        let mut events: Vec<StreamEvent> = text
            .chars()
            .map(|c| StreamEvent::Token {
                text: c.to_string(),
            })
            .collect();
        events.push(StreamEvent::Done {
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: text.chars().count().max(1) as u32,
                total_tokens: 10 + text.chars().count().max(1) as u32,
                cached_tokens: 0,
            }),
            finish_reason: Some("stop".into()),
        });
        events
    }

    /// Script for a turn that requests a single tool call.
    pub fn tool_call_script(call_id: &str, name: &str, args: serde_json::Value) -> Vec<StreamEvent> {
        vec![
            StreamEvent::ToolCallStarted {
                call_id: call_id.into(),
                tool_name: name.into(),
            },
            StreamEvent::ToolCallFinished {
                call_id: call_id.into(),
                tool_name: name.into(),
                arguments: args,
            },
            StreamEvent::Done {
                usage: Some(Usage {
                    prompt_tokens: 15,
                    completion_tokens: 5,
                    total_tokens: 20,
                    cached_tokens: 0,
                }),
                finish_reason: Some("tool_calls".into()),
            },
        ]
    }

    /// Script that fails mid-stream.
    pub fn error_script(message: &str) -> Vec<StreamEvent> {
        vec![StreamEvent::Error {
            message: message.into(),
        }]
    }

    fn next_script(&self) -> Vec<StreamEvent> {
        self.scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| Self::text_script("[no more scripts]"))
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        *self.last_request.lock() = Some(req.clone());
        let script = self.next_script();

        let mut content = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut usage = None;
        for event in script {
            match event {
                StreamEvent::Token { text } => content.push_str(&text),
                StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                } => tool_calls.push(ToolCall {
                    call_id,
                    tool_name,
                    arguments,
                }),
                StreamEvent::Done { usage: u, .. } => usage = u,
                StreamEvent::Error { message } => {
                    return Err(Error::Provider {
                        provider: "scripted".into(),
                        message,
                    })
                }
                _ => {}
            }
        }

        Ok(ChatResponse {
            content,
            tool_calls,
            usage,
            model: "scripted-model".into(),
            finish_reason: Some("stop".into()),
        })
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        *self.last_request.lock() = Some(req.clone());
        let events: Vec<Result<StreamEvent>> =
            self.next_script().into_iter().map(Ok).collect();
        Ok(Box::pin(futures_util::stream::iter(events)))
    }

    fn provider_id(&self) -> &str {
        "scripted"
    }
}
