//! Prompt and context assembly for retrieved chunks.
//!
//! Budgets are measured in characters (Unicode scalar values), dividers
//! included, so the assembled context never exceeds `max_context_chars` plus
//! one ellipsis.

use serde::{Deserialize, Serialize};

use super::conversation::{ConversationTurn, HISTORY_WINDOW};
use super::store::{clamp_score, RetrievalResult};
use crate::llm::ChatMessage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSettings {
    /// Character budget for the assembled context, dividers included.
    pub max_context_chars: usize,
    /// A truncated chunk is only kept if more than this many characters fit.
    pub min_fragment_chars: usize,
    pub divider: String,
    pub ellipsis: String,
    /// Length of the `context_used` preview returned with answers.
    pub preview_chars: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            max_context_chars: 1500,
            min_fragment_chars: 50,
            divider: "\n\n---\n\n".to_string(),
            ellipsis: "…".to_string(),
            preview_chars: 500,
        }
    }
}

/// Concatenate chunk texts in rank order until the budget runs out.
///
/// The chunk that overflows is cut to the remaining budget and marked with
/// the ellipsis, unless too little room is left, in which case it is dropped.
/// Nothing ranked below it is considered.
pub fn prepare_context(results: &[RetrievalResult], settings: &ContextSettings) -> String {
    let budget = settings.max_context_chars;
    let divider_len = settings.divider.chars().count();
    let mut context = String::new();
    let mut used = 0usize;

    for result in results {
        let separator = if context.is_empty() { 0 } else { divider_len };
        let text_len = result.document.chars().count();

        if used + separator + text_len <= budget {
            if separator > 0 {
                context.push_str(&settings.divider);
            }
            context.push_str(&result.document);
            used += separator + text_len;
            continue;
        }

        let remaining = budget.saturating_sub(used + separator);
        if remaining > settings.min_fragment_chars {
            if separator > 0 {
                context.push_str(&settings.divider);
            }
            context.extend(result.document.chars().take(remaining));
            context.push_str(&settings.ellipsis);
        }
        break;
    }

    context
}

/// Mean retrieval score clamped to `[0, 1]`. Not a calibrated probability.
pub fn calculate_confidence(results: &[RetrievalResult]) -> f32 {
    if results.is_empty() {
        return 0.0;
    }
    let total: f32 = results.iter().map(|r| r.score).sum();
    clamp_score(total / results.len() as f32)
}

pub fn create_prompt(query: &str, context: &str) -> String {
    format!(
        "You are a helpful assistant. Answer the question below **only** using the provided \
         context. If the answer is absent, say \"I do not have that information in my \
         documents.\"\n\nContext:\n{}\n\nQuestion:\n{}\n\nAnswer:",
        context, query
    )
}

/// First `preview_chars` characters of the context, with an ellipsis if cut.
pub fn preview(context: &str, settings: &ContextSettings) -> String {
    let mut chars = context.chars();
    let head: String = chars.by_ref().take(settings.preview_chars).collect();
    if chars.next().is_some() {
        format!("{}{}", head, settings.ellipsis)
    } else {
        head
    }
}

fn recent(history: &[ConversationTurn]) -> &[ConversationTurn] {
    &history[history.len().saturating_sub(HISTORY_WINDOW)..]
}

/// Retrieval query biased toward the recent conversation.
pub fn build_retrieval_query(history: &[ConversationTurn], query: &str) -> String {
    let mut parts: Vec<String> = recent(history)
        .iter()
        .map(|turn| format!("Human: {}\nAssistant: {}", turn.human, turn.assistant))
        .collect();
    parts.push(format!("Human: {}", query));
    parts.join("\n")
}

/// One user/assistant pair per recent turn, then the final user prompt.
pub fn build_chat_messages(history: &[ConversationTurn], prompt: String) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(HISTORY_WINDOW * 2 + 1);
    for turn in recent(history) {
        messages.push(ChatMessage::user(turn.human.clone()));
        messages.push(ChatMessage::assistant(turn.assistant.clone()));
    }
    messages.push(ChatMessage::user(prompt));
    messages
}
