//! Sliding-window message budget.
//!
//! The system message is always kept; after it, the most recent messages
//! whose cumulative estimated token count fits the budget survive. Token
//! counts are a chars/4 estimate plus per-message overhead.

use od_domain::tool::{Message, Role};

/// Per-message protocol overhead, in tokens.
const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Estimated token count for one message.
pub fn estimate_tokens(message: &Message) -> usize {
    message.content.approx_chars() / 4 + MESSAGE_OVERHEAD_TOKENS
}

/// Estimated token count for a message list.
pub fn estimate_total_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_tokens).sum()
}

/// Apply the sliding-window policy.
///
/// The newest message is always kept even if it alone exceeds the budget;
/// an empty request is never produced.
pub fn apply_window(messages: &[Message], budget_tokens: usize) -> Vec<Message> {
    let (system, rest): (Vec<&Message>, Vec<&Message>) =
        messages.iter().partition(|m| m.role == Role::System);

    let mut kept: Vec<&Message> = Vec::new();
    let mut used: usize = system.iter().map(|m| estimate_tokens(m)).sum();

    for message in rest.iter().rev() {
        let cost = estimate_tokens(message);
        if kept.is_empty() || used + cost <= budget_tokens {
            used += cost;
            kept.push(message);
        } else {
            break;
        }
    }
    kept.reverse();

    system.into_iter().chain(kept).cloned().collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
