//! Context-window pruning.
//!
//! When the estimated request size crosses the auto-prune trigger, the
//! history is shrunk in stages: oversized single messages first, then
//! summarize-oldest, then drop-oldest, down to a floor of one message and
//! a final tail-trim. Summarization is deterministic truncation by
//! default; an AI-assisted pass can run first and falls open to the
//! deterministic path on any guard or upstream failure.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use kirogate_core::anthropic::{
    tool_result_text, ChatMessage, ContentPart, MessageContent, Role,
};

use crate::sanitize::truncate_keep_edges;
use crate::tokens::{estimate_message, estimate_messages, MAX_CONTEXT_TOKENS};

/// Messages never pruned from the tail of the conversation.
const KEEP_RECENT: usize = 5;
/// Deterministic summary caps.
const SUMMARY_TEXT_CHARS: usize = 1000;
const SUMMARY_TOOL_RESULT_CHARS: usize = 2000;
/// Oversized-result truncation in stage 1.
const OVERSIZED_RESULT_CHARS: usize = 500;

/// AI-path guards.
const AI_MIN_MESSAGES: usize = 8;
const AI_MIN_INTERVAL: Duration = Duration::from_secs(180);
const AI_MAX_INPUT_CHARS: usize = 50_000;
const AI_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum SummarizeError {
    #[error("summarization upstream error: {0}")]
    Upstream(String),
    #[error("summarization timed out")]
    Timeout,
}

/// Seam for the AI-assisted summarization path, so the pruner never
/// depends on the HTTP stack and tests can inject a stub.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, transcript: &str) -> Result<String, SummarizeError>;
}

fn truncate_chars(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        return text.to_string();
    }
    let head: String = text.chars().take(cap).collect();
    format!("{head}...")
}

/// Deterministic per-message summary: text to 1000 chars, tool results to
/// 2000, tool calls kept structurally.
fn summarize_message(msg: &ChatMessage) -> ChatMessage {
    let parts = msg
        .content
        .parts()
        .into_iter()
        .map(|p| match p {
            ContentPart::Text { text } => ContentPart::Text {
                text: truncate_chars(&text, SUMMARY_TEXT_CHARS),
            },
            ContentPart::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => ContentPart::ToolResult {
                tool_use_id,
                content: Value::String(truncate_chars(
                    &tool_result_text(&content),
                    SUMMARY_TOOL_RESULT_CHARS,
                )),
                is_error,
            },
            other => other,
        })
        .collect();
    ChatMessage {
        role: msg.role,
        content: MessageContent::Parts(parts),
    }
}

/// A message already shrunk by [`summarize_message`]: its text ends with
/// the ellipsis marker within the truncated length.
fn is_summarized(msg: &ChatMessage) -> bool {
    msg.content.parts().iter().any(|p| match p {
        ContentPart::Text { text } => {
            text.ends_with("...") && text.chars().count() <= SUMMARY_TEXT_CHARS + 3
        }
        _ => false,
    })
}

fn truncate_large_tool_results(msg: &mut ChatMessage) -> bool {
    let mut parts = msg.content.parts();
    let mut touched = false;
    for part in &mut parts {
        if let ContentPart::ToolResult { content, .. } = part {
            let text = tool_result_text(content);
            if text.chars().count() > OVERSIZED_RESULT_CHARS {
                *content = Value::String(truncate_chars(&text, OVERSIZED_RESULT_CHARS));
                touched = true;
            }
        }
    }
    if touched {
        msg.content = MessageContent::Parts(parts);
    }
    touched
}

fn tail_trim_to_tokens(msg: &mut ChatMessage, token_budget: u64) {
    // worst case one token per ~1/0.35 chars; keep the tail
    let char_budget = ((token_budget as f64) / 0.35) as usize;
    let mut parts = msg.content.parts();
    for part in &mut parts {
        if let ContentPart::Text { text } = part {
            let total = text.chars().count();
            if total > char_budget {
                *text = text.chars().skip(total - char_budget).collect();
            }
        }
    }
    msg.content = MessageContent::Parts(parts);
}

/// Shrink `messages` until the estimate fits `budget - reserved`.
///
/// The stage order mirrors how much information each step destroys: local
/// truncation of whales first, summaries next, whole-message drops last.
pub fn prune(mut messages: Vec<ChatMessage>, budget: u64, reserved: u64) -> Vec<ChatMessage> {
    let target = budget.saturating_sub(reserved).max(1024);
    let before = estimate_messages(&messages);
    if before <= target {
        return messages;
    }
    info!(before, target, "pruning context window");

    // Stage 1: any single message above a third of the window.
    let whale_limit = MAX_CONTEXT_TOKENS / 3;
    for msg in messages.iter_mut() {
        if estimate_message(msg) <= whale_limit {
            continue;
        }
        if !truncate_large_tool_results(msg) {
            tail_trim_to_tokens(msg, whale_limit);
        }
    }

    // Stage 2: summarize oldest while more than KEEP_RECENT remain.
    let mut idx = 0;
    while estimate_messages(&messages) > target
        && messages.len() > KEEP_RECENT
        && idx < messages.len().saturating_sub(KEEP_RECENT)
    {
        if !is_summarized(&messages[idx]) {
            messages[idx] = summarize_message(&messages[idx]);
        }
        idx += 1;
    }

    // Stage 3: drop oldest while keeping KEEP_RECENT.
    while estimate_messages(&messages) > target && messages.len() > KEEP_RECENT {
        messages.remove(0);
    }

    // Stage 4: summarize whatever remains, skipping already-shrunk ones.
    let mut idx = 0;
    while estimate_messages(&messages) > target && idx < messages.len() {
        if !is_summarized(&messages[idx]) {
            messages[idx] = summarize_message(&messages[idx]);
        }
        idx += 1;
    }

    // Stage 5: drop oldest while keeping at least one.
    while estimate_messages(&messages) > target && messages.len() > 1 {
        messages.remove(0);
    }

    // Stage 6: final tail-trim of the survivor.
    if estimate_messages(&messages) > target {
        if let Some(first) = messages.first_mut() {
            tail_trim_to_tokens(first, target);
        }
    }

    let after = estimate_messages(&messages);
    info!(after, kept = messages.len(), "prune complete");
    messages
}

/// Shared state for the AI pass (per-process throttle).
#[derive(Default)]
pub struct AiSummaryState {
    last_run: Mutex<Option<Instant>>,
}

impl AiSummaryState {
    pub fn new() -> Self {
        Self::default()
    }
}

fn transcript_of(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User => "USER",
                Role::Assistant => "ASSISTANT",
            };
            format!("{role}: {}", m.content.text())
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// AI-assisted condensation: collapse everything but the most recent
/// [`KEEP_RECENT`] messages into one synthesized user message. Returns
/// `None` when any guard trips or the upstream call fails — the caller
/// falls back to [`prune`].
pub async fn ai_condense(
    summarizer: &dyn Summarizer,
    state: &AiSummaryState,
    messages: &[ChatMessage],
) -> Option<Vec<ChatMessage>> {
    if messages.len() < AI_MIN_MESSAGES {
        return None;
    }

    {
        let last = state.last_run.lock().await;
        if let Some(at) = *last {
            if at.elapsed() < AI_MIN_INTERVAL {
                return None;
            }
        }
    }

    let split = messages.len() - KEEP_RECENT;
    let old = &messages[..split];
    let transcript = transcript_of(old);
    if transcript.chars().count() > AI_MAX_INPUT_CHARS {
        return None;
    }

    let summary = match tokio::time::timeout(AI_TIMEOUT, summarizer.summarize(&transcript)).await {
        Ok(Ok(s)) if !s.trim().is_empty() => s,
        Ok(Ok(_)) => return None,
        Ok(Err(e)) => {
            warn!(error = %e, "AI summarization failed, falling back to truncation");
            return None;
        }
        Err(_) => {
            warn!("AI summarization timed out, falling back to truncation");
            return None;
        }
    };

    *state.last_run.lock().await = Some(Instant::now());

    let mut out = Vec::with_capacity(KEEP_RECENT + 1);
    out.push(ChatMessage::user(format!(
        "Summary of the earlier conversation:\n\n{summary}"
    )));
    out.extend_from_slice(&messages[split..]);
    Some(out)
}
