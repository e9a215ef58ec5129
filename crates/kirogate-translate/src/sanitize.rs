//! Message-history sanitizer.
//!
//! The upstream is strict about conversation shape: user-first, strictly
//! alternating roles, user-last, every tool_use answered by a tool_result
//! in the immediately following user message. `sanitize` rewrites an
//! arbitrary client history into that shape and is idempotent — running it
//! twice yields the same list.

use serde_json::Value;
use tracing::debug;

use kirogate_core::anthropic::{ChatMessage, ContentPart, MessageContent, Role};

/// Per-message content cap in characters.
pub const MAX_MESSAGE_CHARS: usize = 200_000;

const TRUNCATION_MARKER: &str = "\n...[content truncated]...\n";

/// Placeholder inserted between two consecutive user messages.
const ASSISTANT_PLACEHOLDER: &str = "understood";
/// Placeholder inserted between two consecutive assistant messages, and
/// appended when the history does not end with a user message.
const USER_PLACEHOLDER: &str = "Continue";

pub fn sanitize(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut msgs: Vec<ChatMessage> = messages;

    if msgs.is_empty() {
        return vec![ChatMessage::user("Hello")];
    }

    strip_thinking(&mut msgs);
    drop_truncated_assistant_json(&mut msgs);
    repair_tool_pairing(&mut msgs);
    drop_empty_user_messages(&mut msgs);
    enforce_alternation(&mut msgs);

    if msgs.first().map(|m| m.role) != Some(Role::User) {
        msgs.insert(0, ChatMessage::user("Hello"));
    }
    if msgs.last().map(|m| m.role) != Some(Role::User) {
        msgs.push(ChatMessage::user(USER_PLACEHOLDER));
    }

    for msg in &mut msgs {
        cap_message_length(msg);
    }

    msgs
}

/// Thinking signatures do not survive the upstream hop; historical
/// thinking blocks are dropped wholesale.
fn strip_thinking(msgs: &mut [ChatMessage]) {
    for msg in msgs.iter_mut() {
        if let MessageContent::Parts(parts) = &mut msg.content {
            parts.retain(|p| !matches!(p, ContentPart::Thinking { .. }));
        }
    }
}

/// An assistant message whose string content starts like JSON but does not
/// parse is a truncation artifact from an aborted stream — drop it.
fn drop_truncated_assistant_json(msgs: &mut Vec<ChatMessage>) {
    msgs.retain(|m| {
        if m.role != Role::Assistant {
            return true;
        }
        let MessageContent::Text(text) = &m.content else {
            return true;
        };
        let trimmed = text.trim_start();
        if !(trimmed.starts_with('[') || trimmed.starts_with('{')) {
            return true;
        }
        let parses = serde_json::from_str::<Value>(trimmed).is_ok();
        if !parses {
            debug!("dropping truncated assistant message");
        }
        parses
    });
}

fn tool_use_ids(msg: &ChatMessage) -> Vec<String> {
    msg.content
        .parts()
        .iter()
        .filter_map(|p| match p {
            ContentPart::ToolUse { id, .. } => Some(id.clone()),
            _ => None,
        })
        .collect()
}

/// Enforce tool_use ↔ tool_result pairing:
/// - results for an assistant's tool calls live in the immediately
///   following user message (created when absent, synthesized when
///   missing);
/// - results with no matching preceding call are dropped.
fn repair_tool_pairing(msgs: &mut Vec<ChatMessage>) {
    let mut out: Vec<ChatMessage> = Vec::with_capacity(msgs.len());
    let mut i = 0;

    while i < msgs.len() {
        let msg = msgs[i].clone();

        if msg.role == Role::Assistant {
            let pending = tool_use_ids(&msg);
            out.push(msg);

            if pending.is_empty() {
                i += 1;
                continue;
            }

            // Gather the following user message (if any), keep only results
            // answering this assistant, and synthesize the missing ones.
            let mut follow_parts: Vec<ContentPart> = Vec::new();
            let mut consumed_next = false;
            if let Some(next) = msgs.get(i + 1) {
                if next.role == Role::User {
                    follow_parts = next.content.parts();
                    consumed_next = true;
                }
            }

            let answered: Vec<String> = follow_parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
                    _ => None,
                })
                .collect();

            // Orphan results in the follow-up (answering nothing we asked)
            // are dropped.
            follow_parts.retain(|p| match p {
                ContentPart::ToolResult { tool_use_id, .. } => pending.contains(tool_use_id),
                _ => true,
            });

            let mut synthetic: Vec<ContentPart> = pending
                .iter()
                .filter(|id| !answered.contains(id))
                .map(|id| ContentPart::ToolResult {
                    tool_use_id: id.clone(),
                    content: Value::String("Tool execution failed".to_string()),
                    is_error: true,
                })
                .collect();

            if !synthetic.is_empty() {
                debug!(count = synthetic.len(), "synthesizing missing tool results");
            }
            // results first so they immediately follow the tool_use block
            synthetic.extend(follow_parts);

            out.push(ChatMessage {
                role: Role::User,
                content: MessageContent::Parts(synthetic),
            });
            i += if consumed_next { 2 } else { 1 };
            continue;
        }

        // user message not following an assistant tool call: orphan results
        let mut parts = msg.content.parts();
        let before = parts.len();
        parts.retain(|p| !matches!(p, ContentPart::ToolResult { .. }));
        if parts.len() != before {
            debug!(dropped = before - parts.len(), "dropping orphan tool results");
            out.push(ChatMessage {
                role: Role::User,
                content: MessageContent::Parts(parts),
            });
        } else {
            out.push(msg);
        }
        i += 1;
    }

    *msgs = out;
}

/// Empty user messages are dropped except a leading placeholder.
fn drop_empty_user_messages(msgs: &mut Vec<ChatMessage>) {
    let mut index = 0;
    msgs.retain(|m| {
        let keep = index == 0 || m.role != Role::User || !m.content.is_empty();
        index += 1;
        keep
    });
}

fn enforce_alternation(msgs: &mut Vec<ChatMessage>) {
    let mut out: Vec<ChatMessage> = Vec::with_capacity(msgs.len());
    for msg in msgs.drain(..) {
        if let Some(prev) = out.last() {
            if prev.role == msg.role {
                let placeholder = match msg.role {
                    Role::User => ChatMessage::assistant(ASSISTANT_PLACEHOLDER),
                    Role::Assistant => ChatMessage::user(USER_PLACEHOLDER),
                };
                out.push(placeholder);
            }
        }
        out.push(msg);
    }
    *msgs = out;
}

/// Keep the first 70% and last 30%-minus-marker of oversized text.
pub fn truncate_keep_edges(text: &str, cap: usize) -> String {
    let total: usize = text.chars().count();
    if total <= cap {
        return text.to_string();
    }
    let marker_len = TRUNCATION_MARKER.chars().count();
    let head_len = cap * 7 / 10;
    let tail_len = cap.saturating_sub(head_len + marker_len);

    let head: String = text.chars().take(head_len).collect();
    let tail: String = text
        .chars()
        .skip(total.saturating_sub(tail_len))
        .collect();
    format!("{head}{TRUNCATION_MARKER}{tail}")
}

fn cap_message_length(msg: &mut ChatMessage) {
    match &mut msg.content {
        MessageContent::Text(text) => {
            if text.chars().count() > MAX_MESSAGE_CHARS {
                *text = truncate_keep_edges(text, MAX_MESSAGE_CHARS);
            }
        }
        MessageContent::Parts(parts) => {
            for part in parts {
                if let ContentPart::Text { text } = part {
                    if text.chars().count() > MAX_MESSAGE_CHARS {
                        *text = truncate_keep_edges(text, MAX_MESSAGE_CHARS);
                    }
                }
            }
        }
    }
}
