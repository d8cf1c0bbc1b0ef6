//! End-to-end run scenarios against a scripted LLM provider and a
//! scripted tool catalog: pure text turns, auto-approved and
//! approval-gated tool calls, denials, stop requests, and tool transport
//! errors. Events are observed straight off the run channel (the SSE
//! layer adds only the `ready` frame and heartbeats on top).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use od_conversations::{ConversationStore, MessageRecord, Segment, ToolStatus};
use od_domain::config::Config;
use od_domain::{Error, Result};
use od_gateway::runtime::events::{EventBus, Frame};
use od_gateway::runtime::stop::StopRegistry;
use od_gateway::runtime::transcript::pending_calls;
use od_gateway::runtime::{channel_for, spawn_run, IncomingMessage, RunInput, DENIAL_TEXT};
use od_gateway::state::AppState;
use od_providers::mock::ScriptedProvider;
use od_toolserver::{ToolCallOutcome, ToolCatalog, ToolDescriptor};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted tool catalog
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn descriptor(name: &str, requires_approval: bool) -> ToolDescriptor {
    ToolDescriptor {
        name: name.into(),
        title: Some(format!("Tool {name}")),
        description: format!("{name} against the cluster"),
        input_schema: json!({"type": "object", "properties": {}}),
        meta: None,
        annotations: Some(json!({"requires_approval": requires_approval})),
    }
}

fn text_outcome(text: &str) -> ToolCallOutcome {
    ToolCallOutcome {
        content: vec![json!({"type": "text", "text": text})],
        is_error: false,
    }
}

/// Catalog returning canned outcomes in order; records every invocation.
struct ScriptedCatalog {
    tools: Vec<ToolDescriptor>,
    results: Mutex<VecDeque<Result<ToolCallOutcome>>>,
    invocations: Mutex<Vec<(String, Value)>>,
    /// When set, the stop flag for this run is raised while a call is in
    /// flight (models `/stop` landing mid-execution).
    stop_during_call: Mutex<Option<(Arc<StopRegistry>, String)>>,
}

impl ScriptedCatalog {
    fn new(tools: Vec<ToolDescriptor>, results: Vec<Result<ToolCallOutcome>>) -> Self {
        Self {
            tools,
            results: Mutex::new(results.into()),
            invocations: Mutex::new(Vec::new()),
            stop_during_call: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ToolCatalog for ScriptedCatalog {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        Ok(self.tools.clone())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: &Value,
        _action: Option<&str>,
    ) -> Result<ToolCallOutcome> {
        self.invocations
            .lock()
            .push((name.to_owned(), arguments.clone()));
        if let Some((registry, run_id)) = self.stop_during_call.lock().as_ref() {
            registry.request_stop(run_id, None);
        }
        self.results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(text_outcome("[no scripted result]")))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Harness {
    state: AppState,
    catalog: Arc<ScriptedCatalog>,
    _dir: tempfile::TempDir,
}

fn harness(scripts: Vec<Vec<od_domain::stream::StreamEvent>>, catalog: ScriptedCatalog) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let catalog = Arc::new(catalog);
    let state = AppState {
        config: Arc::new(Config::default()),
        llm: Arc::new(ScriptedProvider::new(scripts)),
        tools: catalog.clone(),
        conversations: Arc::new(ConversationStore::new(dir.path()).unwrap()),
        stops: Arc::new(StopRegistry::new(dir.path(), Duration::from_secs(600)).unwrap()),
        events: Arc::new(EventBus::new(Vec::new())),
        api_token_hash: None,
        admin_token_hash: None,
    };
    Harness {
        state,
        catalog,
        _dir: dir,
    }
}

fn user_turn(run_id: &str, conversation_id: &str, text: &str) -> RunInput {
    RunInput::new_turn(
        run_id.into(),
        Some(conversation_id.into()),
        vec![IncomingMessage {
            role: "user".into(),
            content: text.into(),
        }],
    )
}

/// Subscribe, spawn, and collect frames until the terminal event.
async fn run_and_collect(state: &AppState, input: RunInput) -> Vec<Frame> {
    let channel = channel_for(&input.run_id);
    let mut rx = state.events.subscribe(&channel);
    spawn_run(state.clone(), input);

    let mut frames = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Ok(frame)) => {
                let terminal =
                    frame.event == "workflow_complete" || frame.event == "workflow_error";
                frames.push(frame);
                if terminal {
                    break;
                }
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => break,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Err(_) => panic!("timed out waiting for run events"),
        }
    }
    frames
}

fn event_names(frames: &[Frame]) -> Vec<&str> {
    frames.iter().map(|f| f.event.as_str()).collect()
}

fn assistant_segments(store: &ConversationStore, conversation_id: &str) -> Vec<Segment> {
    let record = store.get(conversation_id).unwrap().unwrap();
    record
        .messages
        .iter()
        .rev()
        .find_map(|m| match m {
            MessageRecord::Assistant { segments, .. } => Some(segments.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// S1 — pure text turn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn pure_text_turn_streams_tokens_and_persists() {
    let h = harness(
        vec![ScriptedProvider::text_script("hi")],
        ScriptedCatalog::new(Vec::new(), Vec::new()),
    );
    let record = h.state.conversations.create("user-1").unwrap();
    h.state
        .conversations
        .append_user_message(&record.id, "Say hi.", 1)
        .unwrap();

    let frames = run_and_collect(&h.state, user_turn("r1", &record.id, "Say hi.")).await;

    assert_eq!(
        event_names(&frames),
        vec!["token", "token", "generation.complete", "workflow_complete"]
    );
    assert_eq!(frames[0].data["delta"], "h");
    assert_eq!(frames[1].data["delta"], "i");
    assert_eq!(frames[2].data["content"], "hi");
    assert_eq!(frames[3].data["status"], "completed");
    // Every frame carries timestamp + conversation_id.
    for frame in &frames {
        assert!(frame.data["timestamp"].as_i64().unwrap() > 0);
        assert_eq!(frame.data["conversation_id"], record.id.as_str());
    }

    let loaded = h.state.conversations.get(&record.id).unwrap().unwrap();
    assert_eq!(loaded.messages.len(), 2);
    match &loaded.messages[1] {
        MessageRecord::Assistant {
            segments,
            token_usage,
            ..
        } => {
            assert_eq!(segments.len(), 1);
            match &segments[0] {
                Segment::Text { text, .. } => assert_eq!(text, "hi"),
                _ => panic!("expected text segment"),
            }
            let usage = token_usage.as_ref().expect("usage attached on completion");
            assert!(usage.completion_tokens >= 1);
            assert!(usage.ttr_ms.is_some());
        }
        _ => panic!("expected assistant message"),
    }
}

#[tokio::test]
async fn no_events_after_terminal() {
    let h = harness(
        vec![ScriptedProvider::text_script("ok")],
        ScriptedCatalog::new(Vec::new(), Vec::new()),
    );
    let record = h.state.conversations.create("user-1").unwrap();

    let channel = channel_for("r-terminal");
    let mut rx = h.state.events.subscribe(&channel);
    spawn_run(
        h.state.clone(),
        user_turn("r-terminal", &record.id, "Say ok."),
    );

    let mut saw_terminal = false;
    loop {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Ok(frame)) => {
                assert!(!saw_terminal, "event after terminal: {}", frame.event);
                if frame.event == "workflow_complete" {
                    saw_terminal = true;
                }
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => break,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Err(_) => panic!("channel never closed after terminal event"),
        }
    }
    assert!(saw_terminal);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// S2 — auto-approved tool call
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn auto_approved_tool_call_executes_and_loops_back() {
    let h = harness(
        vec![
            ScriptedProvider::tool_call_script("C1", "get_pods", json!({"namespace": "default"})),
            ScriptedProvider::text_script("You have 2 pods."),
        ],
        ScriptedCatalog::new(
            vec![descriptor("get_pods", false)],
            vec![Ok(text_outcome("pod-a\npod-b"))],
        ),
    );
    let record = h.state.conversations.create("user-1").unwrap();
    h.state
        .conversations
        .append_user_message(&record.id, "List pods.", 1)
        .unwrap();

    let frames = run_and_collect(&h.state, user_turn("r2", &record.id, "List pods.")).await;

    let names = event_names(&frames);
    assert_eq!(names[0], "tools.pending");
    assert_eq!(names[1], "tool.executing");
    assert_eq!(names[2], "tool.result");
    assert!(names[3..names.len() - 2].iter().all(|n| *n == "token"));
    assert_eq!(names[names.len() - 2], "generation.complete");
    assert_eq!(names[names.len() - 1], "workflow_complete");
    assert_eq!(frames.last().unwrap().data["status"], "completed");

    // tools.pending lists the call with its approval flag.
    let pending = &frames[0].data["tools"][0];
    assert_eq!(pending["call_id"], "C1");
    assert_eq!(pending["tool"], "get_pods");
    assert_eq!(pending["requires_approval"], false);

    // tool.result carries the normalized blocks.
    assert_eq!(frames[2].data["result"][0]["text"], "pod-a\npod-b");

    // The tool server saw the exact arguments the model emitted.
    let invocations = h.catalog.invocations.lock();
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].0, "get_pods");
    assert_eq!(invocations[0].1, json!({"namespace": "default"}));
    drop(invocations);

    // Transcript: tool segment (completed) then the text segment.
    let segments = assistant_segments(&h.state.conversations, &record.id);
    assert_eq!(segments.len(), 2);
    match &segments[0] {
        Segment::Tool(t) => {
            assert_eq!(t.call_id, "C1");
            assert_eq!(t.status, ToolStatus::Completed);
            assert!(t.result.is_some());
        }
        _ => panic!("expected tool segment first"),
    }
    match &segments[1] {
        Segment::Text { text, .. } => assert_eq!(text, "You have 2 pods."),
        _ => panic!("expected text segment second"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// S3 — approval required, user approves
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn approval_gate_suspends_then_resume_completes() {
    let h = harness(
        vec![
            ScriptedProvider::tool_call_script("C1", "delete_pod", json!({"name": "api-0"})),
            ScriptedProvider::text_script("Deleted."),
        ],
        ScriptedCatalog::new(
            vec![descriptor("delete_pod", true)],
            vec![Ok(text_outcome("pod \"api-0\" deleted"))],
        ),
    );
    let record = h.state.conversations.create("user-1").unwrap();
    h.state
        .conversations
        .append_user_message(&record.id, "Delete api-0.", 1)
        .unwrap();

    // First run suspends at the approval gate.
    let frames = run_and_collect(&h.state, user_turn("r3", &record.id, "Delete api-0.")).await;
    assert_eq!(
        event_names(&frames),
        vec!["tools.pending", "tool.awaiting_approval", "workflow_complete"]
    );
    assert_eq!(frames[1].data["call_id"], "C1");
    assert_eq!(frames.last().unwrap().data["status"], "awaiting_approval");

    let segments = assistant_segments(&h.state.conversations, &record.id);
    assert_eq!(
        segments[0].as_tool().unwrap().status,
        ToolStatus::AwaitingApproval
    );
    // No tool was invoked while suspended.
    assert!(h.catalog.invocations.lock().is_empty());

    // Resume with an approval, the way the approval controller does.
    let loaded = h.state.conversations.get(&record.id).unwrap().unwrap();
    let mut input = RunInput::new_turn("r3b".into(), Some(record.id.clone()), Vec::new());
    input.pending_calls = pending_calls(&loaded);
    input.approval_decisions = HashMap::from([("C1".to_string(), true)]);
    input.suppress_pending_event = true;

    let resume_frames = run_and_collect(&h.state, input).await;
    let names = event_names(&resume_frames);
    // No duplicate tools.pending on resume.
    assert!(!names.contains(&"tools.pending"));
    assert_eq!(names[0], "tool.executing");
    assert_eq!(names[1], "tool.result");
    assert_eq!(resume_frames.last().unwrap().data["status"], "completed");

    // Exactly one C1 segment, now completed, followed by the reply text.
    let segments = assistant_segments(&h.state.conversations, &record.id);
    let tool_count = segments
        .iter()
        .filter(|s| s.as_tool().map(|t| t.call_id == "C1").unwrap_or(false))
        .count();
    assert_eq!(tool_count, 1);
    assert_eq!(segments[0].as_tool().unwrap().status, ToolStatus::Completed);
    assert!(matches!(&segments[1], Segment::Text { text, .. } if text == "Deleted."));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// S4 — approval required, user denies
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn denied_call_records_denial_and_informs_the_model() {
    let h = harness(
        vec![
            ScriptedProvider::tool_call_script("C1", "delete_pod", json!({"name": "api-0"})),
            ScriptedProvider::text_script("Understood, not deleting."),
        ],
        ScriptedCatalog::new(vec![descriptor("delete_pod", true)], Vec::new()),
    );
    let record = h.state.conversations.create("user-1").unwrap();
    h.state
        .conversations
        .append_user_message(&record.id, "Delete api-0.", 1)
        .unwrap();

    let _ = run_and_collect(&h.state, user_turn("r4", &record.id, "Delete api-0.")).await;

    // The controller eagerly persists the denial, then resumes.
    let loaded = h.state.conversations.get(&record.id).unwrap().unwrap();
    let pending = pending_calls(&loaded);
    h.state
        .conversations
        .update_tool_segment_status(
            &record.id,
            "C1",
            ToolStatus::Denied,
            Some(vec![json!({"type": "text", "text": DENIAL_TEXT})]),
            None,
        )
        .unwrap();

    let mut input = RunInput::new_turn("r4b".into(), Some(record.id.clone()), Vec::new());
    input.pending_calls = pending;
    input.approval_decisions = HashMap::from([("C1".to_string(), false)]);
    input.suppress_pending_event = true;

    let frames = run_and_collect(&h.state, input).await;
    let names = event_names(&frames);
    assert_eq!(names[0], "tool.denied");
    assert_eq!(frames.last().unwrap().data["status"], "completed");

    // The tool was never invoked.
    assert!(h.catalog.invocations.lock().is_empty());

    let segments = assistant_segments(&h.state.conversations, &record.id);
    let tool = segments[0].as_tool().unwrap();
    assert_eq!(tool.status, ToolStatus::Denied);
    assert_eq!(tool.result.as_ref().unwrap()[0]["text"], DENIAL_TEXT);
    assert!(matches!(
        &segments[1],
        Segment::Text { text, .. } if text == "Understood, not deleting."
    ));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// S5 — stop mid-run
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn stop_is_observed_at_the_next_boundary() {
    let h = harness(
        vec![ScriptedProvider::tool_call_script(
            "C1",
            "get_pods",
            json!({}),
        )],
        ScriptedCatalog::new(
            vec![descriptor("get_pods", false)],
            vec![Ok(text_outcome("pod-a"))],
        ),
    );
    let record = h.state.conversations.create("user-1").unwrap();
    h.state
        .conversations
        .append_user_message(&record.id, "Watch everything.", 1)
        .unwrap();

    // Raise the stop flag while the tool call is in flight; the current
    // call runs to completion and the loop exits at the next boundary.
    *h.catalog.stop_during_call.lock() = Some((h.state.stops.clone(), "r5".to_string()));

    let frames = run_and_collect(&h.state, user_turn("r5", &record.id, "Watch everything.")).await;
    let names = event_names(&frames);
    assert_eq!(
        names,
        vec![
            "tools.pending",
            "tool.executing",
            "tool.result",
            "workflow_complete"
        ]
    );
    assert_eq!(frames.last().unwrap().data["status"], "stopped");
    // No further LLM call was issued: no token events after the stop.
    assert!(!names.contains(&"token"));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// S6 — tool transport error
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn transport_error_surfaces_and_the_model_recovers() {
    let h = harness(
        vec![
            ScriptedProvider::tool_call_script("C2", "get_pods", json!({})),
            ScriptedProvider::text_script("The tool is unreachable right now."),
        ],
        ScriptedCatalog::new(
            vec![descriptor("get_pods", false)],
            vec![Err(Error::Other("connection refused".into()))],
        ),
    );
    let record = h.state.conversations.create("user-1").unwrap();
    h.state
        .conversations
        .append_user_message(&record.id, "List pods.", 1)
        .unwrap();

    let frames = run_and_collect(&h.state, user_turn("r6", &record.id, "List pods.")).await;
    let names = event_names(&frames);
    assert_eq!(names[0], "tools.pending");
    assert_eq!(names[1], "tool.executing");
    assert_eq!(names[2], "tool.error");
    assert_eq!(frames[2].data["call_id"], "C2");
    assert_eq!(frames[2].data["error"], "connection refused");
    assert_eq!(frames.last().unwrap().data["status"], "completed");

    let segments = assistant_segments(&h.state.conversations, &record.id);
    let tool = segments[0].as_tool().unwrap();
    assert_eq!(tool.status, ToolStatus::Error);
    assert_eq!(tool.error.as_deref(), Some("connection refused"));
    assert!(tool.result.is_none());
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM failure → workflow_error
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn llm_stream_error_terminates_with_workflow_error() {
    let h = harness(
        vec![ScriptedProvider::error_script("upstream exploded")],
        ScriptedCatalog::new(Vec::new(), Vec::new()),
    );
    let record = h.state.conversations.create("user-1").unwrap();

    let frames = run_and_collect(&h.state, user_turn("r7", &record.id, "hello")).await;
    let last = frames.last().unwrap();
    assert_eq!(last.event, "workflow_error");
    assert_eq!(last.data["status"], "error");
    assert!(last.data["error"]
        .as_str()
        .unwrap()
        .contains("upstream exploded"));
}
