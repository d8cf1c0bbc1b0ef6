//! File-backed conversation store.
//!
//! One JSON document per conversation under `<state_path>/conversations/`.
//! Writers are serialized per conversation; each mutation is a
//! read-modify-write finished with a tmp+rename so readers never observe a
//! torn document.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;

use od_domain::clock::new_id;
use od_domain::{Error, Result};

use crate::segment::{
    ConversationRecord, MessageRecord, Segment, TokenUsage, ToolSegment, ToolStatus,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Authorization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Ownership check: the caller must own the conversation or be an
/// administrator. Runs before any core operation mutates the transcript.
pub fn authorize(record: &ConversationRecord, user_id: Option<&str>, is_admin: bool) -> Result<()> {
    if is_admin {
        return Ok(());
    }
    match user_id {
        Some(uid) if uid == record.owner_user_id => Ok(()),
        _ => Err(Error::Unauthorized(format!(
            "caller does not own conversation {}",
            record.id
        ))),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ConversationStore {
    dir: PathBuf,
    /// Per-conversation write locks. Mutations hold the lock across the
    /// whole read-modify-write.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConversationStore {
    /// Open (or create) the store under `state_path/conversations`.
    pub fn new(state_path: &Path) -> Result<Self> {
        let dir = state_path.join("conversations");
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    fn path_for(&self, conversation_id: &str) -> PathBuf {
        self.dir.join(format!("{conversation_id}.json"))
    }

    fn lock_for(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(conversation_id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn read_record(&self, conversation_id: &str) -> Result<ConversationRecord> {
        let path = self.path_for(conversation_id);
        if !path.exists() {
            return Err(Error::NotFound(conversation_id.to_owned()));
        }
        let raw = std::fs::read_to_string(&path)?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::Storage(format!("corrupt conversation {conversation_id}: {e}")))
    }

    fn write_record(&self, record: &ConversationRecord) -> Result<()> {
        let path = self.path_for(&record.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(record)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Run a mutation under the conversation's write lock.
    fn with_record<R>(
        &self,
        conversation_id: &str,
        f: impl FnOnce(&mut ConversationRecord) -> Result<R>,
    ) -> Result<R> {
        let lock = self.lock_for(conversation_id);
        let _guard = lock.lock();

        let mut record = self.read_record(conversation_id)?;
        let out = f(&mut record)?;
        record.updated_at = Utc::now();
        self.write_record(&record)?;
        Ok(out)
    }

    // ── Creation / reads ───────────────────────────────────────────

    /// Create a new empty conversation owned by `owner_user_id`.
    pub fn create(&self, owner_user_id: &str) -> Result<ConversationRecord> {
        let now = Utc::now();
        let record = ConversationRecord {
            id: new_id(),
            owner_user_id: owner_user_id.to_owned(),
            title: None,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        let lock = self.lock_for(&record.id);
        let _guard = lock.lock();
        self.write_record(&record)?;
        Ok(record)
    }

    /// Read a conversation. Readers see a consistent snapshot.
    pub fn get(&self, conversation_id: &str) -> Result<Option<ConversationRecord>> {
        match self.read_record(conversation_id) {
            Ok(record) => Ok(Some(record)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    // ── Transcript mutations ──────────────────────────────────────

    /// Append a user message at the end of the transcript.
    pub fn append_user_message(
        &self,
        conversation_id: &str,
        text: &str,
        timestamp: i64,
    ) -> Result<()> {
        self.with_record(conversation_id, |record| {
            record.messages.push(MessageRecord::User {
                text: text.to_owned(),
                timestamp,
            });
            Ok(())
        })
    }

    /// Append text to the current assistant message. If its last segment is
    /// already a text segment (no intervening tool segment), the text is
    /// concatenated instead of starting a new segment.
    pub fn append_text_segment(
        &self,
        conversation_id: &str,
        text: &str,
        timestamp: i64,
    ) -> Result<()> {
        self.with_record(conversation_id, |record| {
            let segments = current_assistant_segments(record, timestamp);
            match segments.last_mut() {
                Some(Segment::Text { text: existing, .. }) => existing.push_str(text),
                _ => segments.push(Segment::Text {
                    text: text.to_owned(),
                    timestamp,
                }),
            }
            Ok(())
        })
    }

    /// Append a tool segment to the current assistant message. A segment
    /// with the same `call_id` anywhere in the conversation makes this a
    /// no-op.
    pub fn append_tool_segment(
        &self,
        conversation_id: &str,
        tool: ToolSegment,
        timestamp: i64,
    ) -> Result<()> {
        self.with_record(conversation_id, |record| {
            if record.find_tool_segment(&tool.call_id).is_some() {
                return Ok(());
            }
            let segments = current_assistant_segments(record, timestamp);
            segments.push(Segment::Tool(tool));
            Ok(())
        })
    }

    /// Mutate a tool segment's status in place. Illegal transitions leave
    /// the segment unchanged and surface an error. `result` is recorded
    /// only for `completed`/`denied`; `error` only for `error`.
    pub fn update_tool_segment_status(
        &self,
        conversation_id: &str,
        call_id: &str,
        status: ToolStatus,
        result: Option<Vec<Value>>,
        error: Option<String>,
    ) -> Result<()> {
        self.with_record(conversation_id, |record| {
            let segment = find_tool_segment_mut(record, call_id)
                .ok_or_else(|| Error::NotFound(format!("tool segment {call_id}")))?;

            if !segment.status.can_transition(status) {
                return Err(Error::IllegalTransition {
                    call_id: call_id.to_owned(),
                    from: segment.status.as_str().to_owned(),
                    to: status.as_str().to_owned(),
                });
            }

            segment.status = status;
            segment.result = match status {
                ToolStatus::Completed | ToolStatus::Denied => result,
                _ => None,
            };
            segment.error = match status {
                ToolStatus::Error => error,
                _ => None,
            };
            Ok(())
        })
    }

    /// Attach usage metrics to the most recent assistant message.
    pub fn finalize_assistant_message(
        &self,
        conversation_id: &str,
        usage: TokenUsage,
    ) -> Result<()> {
        self.with_record(conversation_id, |record| {
            if let Some(MessageRecord::Assistant { token_usage, .. }) = record
                .messages
                .iter_mut()
                .rev()
                .find(|m| m.is_assistant())
            {
                *token_usage = Some(usage);
            }
            Ok(())
        })
    }

    /// Set the conversation title (from the title generator).
    pub fn set_title(&self, conversation_id: &str, title: &str) -> Result<()> {
        self.with_record(conversation_id, |record| {
            record.title = Some(title.to_owned());
            Ok(())
        })
    }
}

/// The segment list of the current assistant message: the last message if
/// it is assistant-kind, else a fresh assistant message appended now.
fn current_assistant_segments(record: &mut ConversationRecord, timestamp: i64) -> &mut Vec<Segment> {
    let needs_new = !matches!(record.messages.last(), Some(MessageRecord::Assistant { .. }));
    if needs_new {
        record.messages.push(MessageRecord::Assistant {
            segments: Vec::new(),
            token_usage: None,
            timestamp,
        });
    }
    match record.messages.last_mut() {
        Some(MessageRecord::Assistant { segments, .. }) => segments,
        _ => unreachable!("assistant message was just appended"),
    }
}

fn find_tool_segment_mut<'a>(
    record: &'a mut ConversationRecord,
    call_id: &str,
) -> Option<&'a mut ToolSegment> {
    record.messages.iter_mut().find_map(|m| match m {
        MessageRecord::Assistant { segments, .. } => segments.iter_mut().find_map(|s| match s {
            Segment::Tool(t) if t.call_id == call_id => Some(t),
            _ => None,
        }),
        _ => None,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, ConversationStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path()).unwrap();
        (dir, store)
    }

    fn tool_segment(call_id: &str, requires_approval: bool, timestamp: i64) -> ToolSegment {
        ToolSegment {
            call_id: call_id.into(),
            tool: "get_pods".into(),
            title: "Get pods".into(),
            args: serde_json::json!({"namespace": "default"}),
            status: ToolStatus::Pending,
            requires_approval,
            result: None,
            error: None,
            timestamp,
        }
    }

    #[test]
    fn create_and_read_back() {
        let (_dir, store) = make_store();
        let record = store.create("user-1").unwrap();

        let loaded = store.get(&record.id).unwrap().unwrap();
        assert_eq!(loaded.owner_user_id, "user-1");
        assert!(loaded.messages.is_empty());
        assert!(loaded.title.is_none());
    }

    #[test]
    fn get_missing_returns_none() {
        let (_dir, store) = make_store();
        assert!(store.get("nope").unwrap().is_none());
    }

    #[test]
    fn text_segments_merge_when_contiguous() {
        let (_dir, store) = make_store();
        let record = store.create("u").unwrap();

        store.append_user_message(&record.id, "hi", 1).unwrap();
        store.append_text_segment(&record.id, "Hello", 2).unwrap();
        store.append_text_segment(&record.id, ", world", 3).unwrap();

        let loaded = store.get(&record.id).unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 2);
        match &loaded.messages[1] {
            MessageRecord::Assistant { segments, .. } => {
                assert_eq!(segments.len(), 1);
                match &segments[0] {
                    Segment::Text { text, .. } => assert_eq!(text, "Hello, world"),
                    _ => panic!("expected text segment"),
                }
            }
            _ => panic!("expected assistant message"),
        }
    }

    #[test]
    fn tool_segment_breaks_text_merge() {
        let (_dir, store) = make_store();
        let record = store.create("u").unwrap();

        store.append_text_segment(&record.id, "Checking", 1).unwrap();
        store
            .append_tool_segment(&record.id, tool_segment("C1", false, 2), 2)
            .unwrap();
        store.append_text_segment(&record.id, "Done", 3).unwrap();

        let loaded = store.get(&record.id).unwrap().unwrap();
        match &loaded.messages[0] {
            MessageRecord::Assistant { segments, .. } => {
                assert_eq!(segments.len(), 3);
                assert!(matches!(segments[0], Segment::Text { .. }));
                assert!(matches!(segments[1], Segment::Tool(_)));
                assert!(matches!(segments[2], Segment::Text { .. }));
            }
            _ => panic!("expected assistant message"),
        }
    }

    #[test]
    fn tool_append_is_idempotent_on_call_id() {
        let (_dir, store) = make_store();
        let record = store.create("u").unwrap();

        store
            .append_tool_segment(&record.id, tool_segment("C1", false, 1), 1)
            .unwrap();
        store
            .append_tool_segment(&record.id, tool_segment("C1", false, 2), 2)
            .unwrap();

        let loaded = store.get(&record.id).unwrap().unwrap();
        let count: usize = loaded
            .messages
            .iter()
            .map(|m| match m {
                MessageRecord::Assistant { segments, .. } => segments
                    .iter()
                    .filter_map(Segment::as_tool)
                    .filter(|t| t.call_id == "C1")
                    .count(),
                _ => 0,
            })
            .sum();
        assert_eq!(count, 1);
    }

    #[test]
    fn legal_transition_chain_records_result() {
        let (_dir, store) = make_store();
        let record = store.create("u").unwrap();
        store
            .append_tool_segment(&record.id, tool_segment("C1", false, 1), 1)
            .unwrap();

        store
            .update_tool_segment_status(&record.id, "C1", ToolStatus::Executing, None, None)
            .unwrap();
        let blocks = vec![serde_json::json!({"type": "text", "text": "pod-a\npod-b"})];
        store
            .update_tool_segment_status(
                &record.id,
                "C1",
                ToolStatus::Completed,
                Some(blocks.clone()),
                None,
            )
            .unwrap();

        let loaded = store.get(&record.id).unwrap().unwrap();
        let tool = loaded.find_tool_segment("C1").unwrap();
        assert_eq!(tool.status, ToolStatus::Completed);
        assert_eq!(tool.result.as_ref().unwrap(), &blocks);
        assert!(tool.error.is_none());
    }

    #[test]
    fn illegal_transition_leaves_segment_unchanged() {
        let (_dir, store) = make_store();
        let record = store.create("u").unwrap();
        store
            .append_tool_segment(&record.id, tool_segment("C1", false, 1), 1)
            .unwrap();

        let err = store
            .update_tool_segment_status(&record.id, "C1", ToolStatus::Completed, None, None)
            .unwrap_err();
        assert!(matches!(err, Error::IllegalTransition { .. }));

        let loaded = store.get(&record.id).unwrap().unwrap();
        assert_eq!(
            loaded.find_tool_segment("C1").unwrap().status,
            ToolStatus::Pending
        );
    }

    #[test]
    fn error_status_records_error_not_result() {
        let (_dir, store) = make_store();
        let record = store.create("u").unwrap();
        store
            .append_tool_segment(&record.id, tool_segment("C2", false, 1), 1)
            .unwrap();
        store
            .update_tool_segment_status(&record.id, "C2", ToolStatus::Executing, None, None)
            .unwrap();
        store
            .update_tool_segment_status(
                &record.id,
                "C2",
                ToolStatus::Error,
                Some(vec![serde_json::json!({"type":"text","text":"ignored"})]),
                Some("connection refused".into()),
            )
            .unwrap();

        let loaded = store.get(&record.id).unwrap().unwrap();
        let tool = loaded.find_tool_segment("C2").unwrap();
        assert_eq!(tool.status, ToolStatus::Error);
        assert!(tool.result.is_none());
        assert_eq!(tool.error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn segment_timestamps_are_nondecreasing() {
        let (_dir, store) = make_store();
        let record = store.create("u").unwrap();

        store.append_text_segment(&record.id, "a", 10).unwrap();
        store
            .append_tool_segment(&record.id, tool_segment("C1", false, 20), 20)
            .unwrap();
        store.append_text_segment(&record.id, "b", 30).unwrap();

        let loaded = store.get(&record.id).unwrap().unwrap();
        match &loaded.messages[0] {
            MessageRecord::Assistant { segments, .. } => {
                let stamps: Vec<i64> = segments.iter().map(Segment::timestamp).collect();
                let mut sorted = stamps.clone();
                sorted.sort();
                assert_eq!(stamps, sorted);
            }
            _ => panic!("expected assistant message"),
        }
    }

    #[test]
    fn finalize_attaches_usage_to_last_assistant_message() {
        let (_dir, store) = make_store();
        let record = store.create("u").unwrap();
        store.append_user_message(&record.id, "hi", 1).unwrap();
        store.append_text_segment(&record.id, "hello", 2).unwrap();

        let usage = TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 2,
            total_tokens: 12,
            cached_tokens: 0,
            cost: 0.0001,
            ttft_ms: Some(120),
            ttr_ms: Some(900),
            source: crate::segment::UsageSource::Provider,
        };
        store.finalize_assistant_message(&record.id, usage).unwrap();

        let loaded = store.get(&record.id).unwrap().unwrap();
        match &loaded.messages[1] {
            MessageRecord::Assistant { token_usage, .. } => {
                let u = token_usage.as_ref().unwrap();
                assert_eq!(u.total_tokens, 12);
                assert_eq!(u.ttft_ms, Some(120));
            }
            _ => panic!("expected assistant message"),
        }
    }

    #[test]
    fn new_turn_starts_a_new_assistant_message() {
        let (_dir, store) = make_store();
        let record = store.create("u").unwrap();

        store.append_text_segment(&record.id, "first", 1).unwrap();
        store.append_user_message(&record.id, "more", 2).unwrap();
        store.append_text_segment(&record.id, "second", 3).unwrap();

        let loaded = store.get(&record.id).unwrap().unwrap();
        // assistant / user / assistant — no cross-turn merge.
        assert_eq!(loaded.messages.len(), 3);
    }

    #[test]
    fn authorize_owner_admin_and_stranger() {
        let (_dir, store) = make_store();
        let record = store.create("owner-1").unwrap();

        assert!(authorize(&record, Some("owner-1"), false).is_ok());
        assert!(authorize(&record, Some("someone-else"), true).is_ok());
        assert!(authorize(&record, Some("someone-else"), false).is_err());
        assert!(authorize(&record, None, false).is_err());
    }

    #[test]
    fn persisted_record_round_trips_identically() {
        let (_dir, store) = make_store();
        let record = store.create("u").unwrap();
        store.append_user_message(&record.id, "list pods", 1).unwrap();
        store
            .append_tool_segment(&record.id, tool_segment("C9", true, 2), 2)
            .unwrap();
        store.append_text_segment(&record.id, "done", 3).unwrap();

        let first = store.get(&record.id).unwrap().unwrap();
        let second = store.get(&record.id).unwrap().unwrap();
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
        assert_eq!(first.find_tool_segment("C9").unwrap().call_id, "C9");
    }
}
