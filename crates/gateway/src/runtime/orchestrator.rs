//! The run orchestrator.
//!
//! One run = one execution of the loop below, from invocation to a
//! terminal event (`workflow_complete` or `workflow_error`). The loop
//! alternates between streaming an LLM response and dispatching the tool
//! calls it requested, checking the stop flag at every iteration
//! boundary. Approval-gated calls suspend the run: their segments are
//! persisted as `awaiting_approval` and a fresh run resumes from the
//! transcript once the user decides.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tracing::Instrument;

use od_conversations::{TokenUsage, ToolSegment, ToolStatus, UsageSource};
use od_domain::clock::{new_id, now_ms};
use od_domain::config::LlmConfig;
use od_domain::stream::{StreamEvent, Usage};
use od_domain::tool::{Message, ToolCall, ToolDefinition};
use od_domain::{Error, Result};
use od_providers::ChatRequest;
use od_toolserver::ToolDescriptor;

use crate::state::AppState;

use super::transcript::{conversation_to_messages, PendingCall};
use super::window::{apply_window, estimate_total_tokens};
use super::{persist_or_log, DENIAL_TEXT};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run input
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A caller-supplied message, used when the turn runs without a persisted
/// conversation.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct IncomingMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

/// Everything one run needs. Resume runs carry the calls recovered from
/// the transcript plus the user's decisions.
pub struct RunInput {
    pub run_id: String,
    pub conversation_id: Option<String>,
    pub messages: Vec<IncomingMessage>,
    pub pending_calls: Vec<PendingCall>,
    pub approval_decisions: HashMap<String, bool>,
    pub suppress_pending_event: bool,
}

impl RunInput {
    pub fn new_turn(
        run_id: String,
        conversation_id: Option<String>,
        messages: Vec<IncomingMessage>,
    ) -> Self {
        Self {
            run_id,
            conversation_id,
            messages,
            pending_calls: Vec::new(),
            approval_decisions: HashMap::new(),
            suppress_pending_event: false,
        }
    }
}

/// The pub/sub channel carrying one run's events.
pub fn channel_for(run_id: &str) -> String {
    format!("run:{run_id}")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Spawn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Spawn the orchestrator on its own task. The caller should already hold
/// a subscription on the run channel; events published before the first
/// subscription are dropped by design.
pub fn spawn_run(state: AppState, input: RunInput) {
    let span = tracing::info_span!("run", run_id = %input.run_id);
    tokio::spawn(run(state, input).instrument(span));
}

async fn run(state: AppState, input: RunInput) {
    let channel = channel_for(&input.run_id);

    // A stop requested against a prior run must not leak into this one.
    state.stops.clear_stop(&input.run_id);

    let started_ms = now_ms();
    tracing::debug!("run started");

    if let Err(e) = run_loop(&state, &input, &channel, started_ms).await {
        tracing::error!(error = %e, "run failed");
        state.events.publish(
            &channel,
            "workflow_error",
            json!({
                "run_id": input.run_id,
                "error": e.to_string(),
                "status": "error",
            }),
            input.conversation_id.as_deref(),
        );
    }

    state.events.close_channel(&channel);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Prepared calls & metrics
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct PreparedCall {
    call_id: String,
    tool: String,
    title: String,
    args: Value,
    requires_approval: bool,
}

impl From<&PendingCall> for PreparedCall {
    fn from(p: &PendingCall) -> Self {
        Self {
            call_id: p.call_id.clone(),
            tool: p.tool.clone(),
            title: p.title.clone(),
            args: p.args.clone(),
            requires_approval: p.requires_approval,
        }
    }
}

#[derive(Default)]
struct RunMetrics {
    usage: Usage,
    estimated: bool,
    ttft_ms: Option<i64>,
}

impl RunMetrics {
    fn finalize(&self, started_ms: i64, llm: &LlmConfig) -> TokenUsage {
        let cost = llm
            .pricing_for(&llm.model)
            .map(|p| p.estimate_cost(self.usage.prompt_tokens, self.usage.completion_tokens))
            .unwrap_or(0.0);
        TokenUsage {
            prompt_tokens: self.usage.prompt_tokens,
            completion_tokens: self.usage.completion_tokens,
            total_tokens: self.usage.total_tokens,
            cached_tokens: self.usage.cached_tokens,
            cost,
            ttft_ms: self.ttft_ms,
            ttr_ms: Some(now_ms() - started_ms),
            source: if self.estimated {
                UsageSource::Estimated
            } else {
                UsageSource::Provider
            },
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool-call assembly (streamed fragments → complete calls)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct CallAssembly {
    order: Vec<String>,
    entries: HashMap<String, AssemblyEntry>,
}

struct AssemblyEntry {
    tool_name: String,
    args_buf: String,
    finished_args: Option<Value>,
}

impl CallAssembly {
    fn start(&mut self, call_id: String, tool_name: String) {
        if !self.entries.contains_key(&call_id) {
            self.order.push(call_id.clone());
        }
        self.entries.insert(
            call_id,
            AssemblyEntry {
                tool_name,
                args_buf: String::new(),
                finished_args: None,
            },
        );
    }

    /// Argument fragments arrive keyed either by call id or by stream
    /// index, depending on the provider.
    fn delta(&mut self, key: &str, fragment: &str) {
        let call_id = if self.entries.contains_key(key) {
            Some(key.to_owned())
        } else {
            key.parse::<usize>()
                .ok()
                .and_then(|idx| self.order.get(idx).cloned())
        };
        if let Some(id) = call_id {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.args_buf.push_str(fragment);
            }
        }
    }

    fn finish(&mut self, call_id: String, tool_name: String, arguments: Value) {
        if !self.entries.contains_key(&call_id) {
            self.order.push(call_id.clone());
        }
        self.entries.insert(
            call_id,
            AssemblyEntry {
                tool_name,
                args_buf: String::new(),
                finished_args: Some(arguments),
            },
        );
    }

    fn into_calls(mut self) -> Vec<ToolCall> {
        let mut calls = Vec::with_capacity(self.order.len());
        for call_id in self.order {
            let Some(entry) = self.entries.remove(&call_id) else {
                continue;
            };
            let arguments = entry.finished_args.unwrap_or_else(|| {
                if entry.args_buf.trim().is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&entry.args_buf).unwrap_or_else(|e| {
                        tracing::warn!(
                            call_id = %call_id,
                            tool = %entry.tool_name,
                            error = %e,
                            "tool call arguments are not valid JSON; defaulting to empty object"
                        );
                        Value::Object(Default::default())
                    })
                }
            });
            calls.push(ToolCall {
                call_id,
                tool_name: entry.tool_name,
                arguments,
            });
        }
        calls
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_loop(
    state: &AppState,
    input: &RunInput,
    channel: &str,
    started_ms: i64,
) -> Result<()> {
    let cfg = &state.config.agent;
    let cid = input.conversation_id.as_deref();

    // Authorization already happened at the API layer; a vanished
    // conversation just means the run proceeds without persistence.
    let record = match cid {
        Some(id) => state.conversations.get(id)?,
        None => None,
    };

    // A catalog outage degrades to a tool-less turn rather than failing it.
    let descriptors = match state.tools.list_tools().await {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!(error = %e, "tool catalog unavailable; continuing without tools");
            Vec::new()
        }
    };
    let tool_defs: Vec<ToolDefinition> = descriptors
        .iter()
        .map(|d| ToolDefinition {
            name: d.name.clone(),
            description: d.description.clone(),
            parameters: d.input_schema.clone(),
        })
        .collect();
    let by_name: HashMap<&str, &ToolDescriptor> =
        descriptors.iter().map(|d| (d.name.as_str(), d)).collect();

    // Working message list: system prompt + history. With persistence the
    // transcript already contains the new user message; without it the
    // caller-supplied list is used as-is.
    let mut messages: Vec<Message> = vec![Message::system(cfg.system_prompt.clone())];
    match &record {
        Some(rec) => messages.extend(conversation_to_messages(rec)),
        None => {
            for m in &input.messages {
                match m.role.as_str() {
                    "user" => messages.push(Message::user(m.content.clone())),
                    "assistant" => messages.push(Message::assistant(m.content.clone())),
                    "system" => messages.push(Message::system(m.content.clone())),
                    other => tracing::debug!(role = other, "skipping unknown message role"),
                }
            }
        }
    }

    // Calls the transcript already settled (an eager denial, a completed
    // retry) must not be re-recorded or double-fed to the model.
    let settled: std::collections::HashSet<String> = record
        .as_ref()
        .map(|r| {
            r.messages
                .iter()
                .filter_map(|m| match m {
                    od_conversations::MessageRecord::Assistant { segments, .. } => Some(segments),
                    _ => None,
                })
                .flatten()
                .filter_map(|s| s.as_tool())
                .filter(|t| t.status.is_terminal())
                .map(|t| t.call_id.clone())
                .collect()
        })
        .unwrap_or_default();

    let mut metrics = RunMetrics::default();

    // Resume runs act on the recovered calls before any LLM activity.
    let mut queued: Option<Vec<PreparedCall>> = if input.pending_calls.is_empty() {
        None
    } else {
        Some(input.pending_calls.iter().map(PreparedCall::from).collect())
    };

    for loop_idx in 0..cfg.max_tool_loops {
        tracing::debug!(loop_idx, "loop iteration");

        // ── Stop check (iteration boundary) ───────────────────────
        if state.stops.should_stop(&input.run_id) {
            return finish_stopped(state, input, channel, cid);
        }

        let calls = match queued.take() {
            Some(calls) => calls,
            None => {
                // ── Request generation ────────────────────────────
                let windowed = apply_window(&messages, cfg.sliding_window_tokens);
                let req = ChatRequest {
                    messages: windowed.clone(),
                    tools: tool_defs.clone(),
                    temperature: None,
                    max_tokens: None,
                    model: None,
                };

                let mut stream = state.llm.chat_stream(&req).await?;
                let mut text_buf = String::new();
                let mut assembly = CallAssembly::default();
                let mut turn_usage: Option<Usage> = None;

                while let Some(event) = stream.next().await {
                    match event? {
                        StreamEvent::Token { text } => {
                            if metrics.ttft_ms.is_none() {
                                metrics.ttft_ms = Some(now_ms() - started_ms);
                            }
                            state
                                .events
                                .publish(channel, "token", json!({"delta": text}), cid);
                            text_buf.push_str(&text);
                        }
                        StreamEvent::ToolCallStarted { call_id, tool_name } => {
                            assembly.start(call_id, tool_name);
                        }
                        StreamEvent::ToolCallDelta { call_id, delta } => {
                            assembly.delta(&call_id, &delta);
                        }
                        StreamEvent::ToolCallFinished {
                            call_id,
                            tool_name,
                            arguments,
                        } => {
                            assembly.finish(call_id, tool_name, arguments);
                        }
                        StreamEvent::Done { usage, .. } => turn_usage = usage,
                        StreamEvent::Error { message } => {
                            return Err(Error::Provider {
                                provider: state.llm.provider_id().to_owned(),
                                message,
                            });
                        }
                    }
                }

                match turn_usage {
                    Some(u) => metrics.usage.add(&u),
                    None => {
                        // Provider reported nothing; fall back to the local
                        // estimate and flag the metrics accordingly.
                        metrics.estimated = true;
                        let prompt = estimate_total_tokens(&windowed) as u32;
                        let completion = (text_buf.len() / 4).max(1) as u32;
                        metrics.usage.add(&Usage {
                            prompt_tokens: prompt,
                            completion_tokens: completion,
                            total_tokens: prompt + completion,
                            cached_tokens: 0,
                        });
                    }
                }

                let tool_calls = assembly.into_calls();

                // ── Pure text completion ──────────────────────────
                if tool_calls.is_empty() {
                    if let Some(id) = cid {
                        persist_or_log(
                            state.conversations.append_text_segment(id, &text_buf, now_ms()),
                            "append text segment",
                        );
                        persist_or_log(
                            state.conversations.finalize_assistant_message(
                                id,
                                metrics.finalize(started_ms, &state.config.llm),
                            ),
                            "finalize assistant message",
                        );
                    }
                    state.events.publish(
                        channel,
                        "generation.complete",
                        json!({"content": text_buf}),
                        cid,
                    );
                    state.events.publish(
                        channel,
                        "workflow_complete",
                        json!({
                            "run_id": input.run_id,
                            "status": "completed",
                            "result": {"content": text_buf},
                        }),
                        cid,
                    );
                    return Ok(());
                }

                // ── Tool calls requested ──────────────────────────
                if !text_buf.is_empty() {
                    if let Some(id) = cid {
                        persist_or_log(
                            state.conversations.append_text_segment(id, &text_buf, now_ms()),
                            "append text segment",
                        );
                    }
                }
                messages.push(Message::assistant_with_calls(&text_buf, &tool_calls));

                let ts = now_ms();
                let prepared: Vec<PreparedCall> = tool_calls
                    .into_iter()
                    .map(|tc| {
                        let call_id = if tc.call_id.is_empty() {
                            new_id()
                        } else {
                            tc.call_id
                        };
                        let descriptor = by_name.get(tc.tool_name.as_str());
                        let requires_approval = descriptor
                            .map(|d| d.requires_approval())
                            .unwrap_or(false)
                            || cfg.approval_required_tools.contains(&tc.tool_name);
                        PreparedCall {
                            call_id,
                            title: descriptor
                                .map(|d| d.display_title().to_owned())
                                .unwrap_or_else(|| tc.tool_name.clone()),
                            tool: tc.tool_name,
                            args: tc.arguments,
                            requires_approval,
                        }
                    })
                    .collect();

                // ── Pending-tools publication ─────────────────────
                if !input.suppress_pending_event {
                    let tools_payload: Vec<Value> = prepared
                        .iter()
                        .map(|c| {
                            json!({
                                "call_id": c.call_id,
                                "tool": c.tool,
                                "title": c.title,
                                "args": c.args,
                                "requires_approval": c.requires_approval,
                                "timestamp": ts,
                            })
                        })
                        .collect();
                    state.events.publish(
                        channel,
                        "tools.pending",
                        json!({"tools": tools_payload}),
                        cid,
                    );
                }
                if let Some(id) = cid {
                    for c in &prepared {
                        persist_or_log(
                            state.conversations.append_tool_segment(
                                id,
                                ToolSegment {
                                    call_id: c.call_id.clone(),
                                    tool: c.tool.clone(),
                                    title: c.title.clone(),
                                    args: c.args.clone(),
                                    status: ToolStatus::Pending,
                                    requires_approval: c.requires_approval,
                                    result: None,
                                    error: None,
                                    timestamp: ts,
                                },
                                ts,
                            ),
                            "append tool segment",
                        );
                    }
                }

                // ── Approval gate ─────────────────────────────────
                let needs_decision: Vec<&PreparedCall> = prepared
                    .iter()
                    .filter(|c| {
                        c.requires_approval
                            && !input.approval_decisions.contains_key(&c.call_id)
                    })
                    .collect();
                if !needs_decision.is_empty() {
                    for c in &needs_decision {
                        state.events.publish(
                            channel,
                            "tool.awaiting_approval",
                            json!({
                                "call_id": c.call_id,
                                "tool": c.tool,
                                "title": c.title,
                                "args": c.args,
                            }),
                            cid,
                        );
                        if let Some(id) = cid {
                            persist_or_log(
                                state.conversations.update_tool_segment_status(
                                    id,
                                    &c.call_id,
                                    ToolStatus::AwaitingApproval,
                                    None,
                                    None,
                                ),
                                "mark awaiting approval",
                            );
                            if let Some(secs) = cfg.approval_timeout_seconds {
                                arm_approval_timeout(
                                    state,
                                    id,
                                    &c.call_id,
                                    Duration::from_secs(secs),
                                );
                            }
                        }
                    }
                    state.events.publish(
                        channel,
                        "workflow_complete",
                        json!({
                            "run_id": input.run_id,
                            "status": "awaiting_approval",
                        }),
                        cid,
                    );
                    return Ok(());
                }

                prepared
            }
        };

        // ── Execute approved calls, record denials ────────────────
        let mut still_awaiting = false;
        for call in &calls {
            // Stop check between tool calls.
            if state.stops.should_stop(&input.run_id) {
                return finish_stopped(state, input, channel, cid);
            }

            let decision = input.approval_decisions.get(&call.call_id).copied();

            // A resume may decide only one of several suspended calls;
            // the undecided rest stay suspended.
            if call.requires_approval && decision.is_none() {
                still_awaiting = true;
                continue;
            }

            if decision == Some(false) {
                state.events.publish(
                    channel,
                    "tool.denied",
                    json!({"call_id": call.call_id}),
                    cid,
                );
                if settled.contains(&call.call_id) {
                    // The controller already persisted the denial and the
                    // transcript reconstruction already fed it to the model.
                    continue;
                }
                if let Some(id) = cid {
                    persist_or_log(
                        state.conversations.update_tool_segment_status(
                            id,
                            &call.call_id,
                            ToolStatus::Denied,
                            Some(vec![json!({"type": "text", "text": DENIAL_TEXT})]),
                            None,
                        ),
                        "mark denied",
                    );
                }
                messages.push(Message::tool_result(call.call_id.clone(), DENIAL_TEXT, false));
                continue;
            }

            state.events.publish(
                channel,
                "tool.executing",
                json!({"call_id": call.call_id}),
                cid,
            );
            if let Some(id) = cid {
                persist_or_log(
                    state.conversations.update_tool_segment_status(
                        id,
                        &call.call_id,
                        ToolStatus::Executing,
                        None,
                        None,
                    ),
                    "mark executing",
                );
            }

            let call_started = std::time::Instant::now();
            let action = call
                .args
                .get("action")
                .and_then(|a| a.as_str())
                .map(str::to_owned);
            match state
                .tools
                .call_tool(&call.tool, &call.args, action.as_deref())
                .await
            {
                Ok(outcome) => {
                    tracing::debug!(
                        call_id = %call.call_id,
                        tool = %call.tool,
                        elapsed_ms = call_started.elapsed().as_millis() as u64,
                        is_error = outcome.is_error,
                        "tool call finished"
                    );
                    state.events.publish(
                        channel,
                        "tool.result",
                        json!({"call_id": call.call_id, "result": outcome.content}),
                        cid,
                    );
                    if let Some(id) = cid {
                        persist_or_log(
                            state.conversations.update_tool_segment_status(
                                id,
                                &call.call_id,
                                ToolStatus::Completed,
                                Some(outcome.content.clone()),
                                None,
                            ),
                            "mark completed",
                        );
                    }
                    messages.push(Message::tool_result(
                        call.call_id.clone(),
                        outcome.text(),
                        outcome.is_error,
                    ));
                }
                Err(e) => {
                    let error_text = e.to_string();
                    tracing::warn!(
                        call_id = %call.call_id,
                        tool = %call.tool,
                        error = %error_text,
                        "tool call transport error"
                    );
                    state.events.publish(
                        channel,
                        "tool.error",
                        json!({"call_id": call.call_id, "error": error_text}),
                        cid,
                    );
                    if let Some(id) = cid {
                        persist_or_log(
                            state.conversations.update_tool_segment_status(
                                id,
                                &call.call_id,
                                ToolStatus::Error,
                                None,
                                Some(error_text.clone()),
                            ),
                            "mark errored",
                        );
                    }
                    messages.push(Message::tool_result(
                        call.call_id.clone(),
                        format!("tool failed: {error_text}"),
                        true,
                    ));
                }
            }
        }

        if still_awaiting {
            state.events.publish(
                channel,
                "workflow_complete",
                json!({
                    "run_id": input.run_id,
                    "status": "awaiting_approval",
                }),
                cid,
            );
            return Ok(());
        }

        if loop_idx + 1 == cfg.max_tool_loops {
            return Err(Error::Other(format!(
                "tool loop limit reached ({} iterations)",
                cfg.max_tool_loops
            )));
        }
    }

    Ok(())
}

/// Terminal handling for a detected stop: publish and exit, leaving the
/// in-flight segment in whatever state it reached.
fn finish_stopped(
    state: &AppState,
    input: &RunInput,
    channel: &str,
    cid: Option<&str>,
) -> Result<()> {
    tracing::info!("run stopped by user");
    state.events.publish(
        channel,
        "workflow_complete",
        json!({
            "run_id": input.run_id,
            "status": "stopped",
        }),
        cid,
    );
    Ok(())
}

/// Auto-deny a call still awaiting approval after the configured bound.
fn arm_approval_timeout(
    state: &AppState,
    conversation_id: &str,
    call_id: &str,
    timeout: Duration,
) {
    let state = state.clone();
    let conversation_id = conversation_id.to_owned();
    let call_id = call_id.to_owned();
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        let still_waiting = state
            .conversations
            .get(&conversation_id)
            .ok()
            .flatten()
            .and_then(|r| {
                r.find_tool_segment(&call_id)
                    .map(|t| t.status == ToolStatus::AwaitingApproval)
            })
            .unwrap_or(false);
        if still_waiting {
            tracing::info!(%call_id, "approval timed out; auto-denying");
            persist_or_log(
                state.conversations.update_tool_segment_status(
                    &conversation_id,
                    &call_id,
                    ToolStatus::Denied,
                    Some(vec![json!({"type": "text", "text": DENIAL_TEXT})]),
                    None,
                ),
                "auto-deny timed-out approval",
            );
        }
    });
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
