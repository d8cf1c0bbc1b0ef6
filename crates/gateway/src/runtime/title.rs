//! Background conversation titles.
//!
//! After the first turn of an untitled conversation the gateway asks the
//! model for a short title. Fire-and-forget: failures are logged and the
//! conversation simply stays untitled.

use od_domain::tool::Message;
use od_providers::ChatRequest;

use crate::state::AppState;

use super::persist_or_log;

const TITLE_PROMPT: &str = "Summarize the following request as a conversation title. \
     At most 40 characters, no quotes, no trailing punctuation.";

/// Spawn title generation for a conversation unless it already has one.
pub fn maybe_spawn_title_generation(state: &AppState, conversation_id: &str) {
    let state = state.clone();
    let conversation_id = conversation_id.to_owned();

    tokio::spawn(async move {
        let record = match state.conversations.get(&conversation_id) {
            Ok(Some(record)) => record,
            _ => return,
        };
        if record.title.is_some() {
            return;
        }
        let Some(first_user) = record.first_user_text() else {
            return;
        };

        let req = ChatRequest {
            messages: vec![Message::user(format!("{TITLE_PROMPT}\n\n{first_user}"))],
            tools: Vec::new(),
            temperature: Some(0.1),
            max_tokens: Some(30),
            model: None,
        };

        match state.llm.chat(&req).await {
            Ok(resp) => {
                let title: String = resp
                    .content
                    .trim()
                    .trim_matches('"')
                    .chars()
                    .take(80)
                    .collect();
                if !title.is_empty() {
                    persist_or_log(
                        state.conversations.set_title(&conversation_id, &title),
                        "store generated title",
                    );
                }
            }
            Err(e) => tracing::warn!(error = %e, "title generation failed"),
        }
    });
}
