//! Upstream request assembly.
//!
//! Takes a sanitized, pruned Anthropic request and produces the
//! `conversationState` the upstream accepts: system prompt folded into the
//! first user turn, history entries converted pairwise, tool definitions
//! remapped, dangling tool references filtered, and a final shape pass
//! that re-enforces the sanitizer's invariants on the assembled output.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use kirogate_core::anthropic::{
    tool_result_text, ChatMessage, ContentPart, MessagesRequest, Role,
};

use crate::conversation::*;
use crate::models;
use crate::prune::prune;
use crate::sanitize::{sanitize, truncate_keep_edges};
use crate::thinking::THINKING_PROMPT;
use crate::tokens::{estimate_messages, reserved_tokens, AUTO_PRUNE_TRIGGER, MAX_CONTEXT_TOKENS};
use crate::tools;

/// Cap on a single tool result forwarded in history.
pub const MAX_TOOL_OUTPUT_LEN: usize = 64_000;
/// Cap on the current message content.
pub const MAX_CURRENT_MESSAGE_LEN: usize = 32_000;

const TOOL_OUTPUT_MARKER: &str = "\n...[tool output truncated]...";

pub struct BuildOptions {
    pub default_model_id: String,
    pub thinking_default: bool,
    pub profile_arn: Option<String>,
}

pub struct BuiltRequest {
    pub request: GenerateAssistantResponseRequest,
    pub model_id: String,
    /// Thinking was requested via prompt injection — the response stream
    /// must be run through the `<thinking>` splitter.
    pub thinking_injected: bool,
}

/// Assemble the upstream request. Infallible by construction: every input
/// shape is repaired rather than rejected (shape violations the client
/// must hear about are caught earlier, at deserialization).
pub fn build_request(req: &MessagesRequest, opts: &BuildOptions) -> BuiltRequest {
    let mut messages = sanitize(req.messages.clone());

    let reserved = reserved_tokens(req.system.as_ref(), &req.tools);
    if estimate_messages(&messages) + reserved > AUTO_PRUNE_TRIGGER {
        messages = prune(messages, MAX_CONTEXT_TOKENS, reserved);
    }

    let model_id = models::map_model(&req.model, &opts.default_model_id);
    let thinking = req
        .thinking
        .as_ref()
        .map(|t| t.enabled())
        .unwrap_or(opts.thinking_default);

    // System prompt, with the thinking instructions prepended when enabled.
    let mut system_text = req.system.as_ref().map(|s| s.text()).unwrap_or_default();
    if thinking {
        system_text = if system_text.is_empty() {
            THINKING_PROMPT.to_string()
        } else {
            format!("{THINKING_PROMPT}\n\n{system_text}")
        };
    }

    // Fold the system prompt into the first user turn.
    if !system_text.is_empty() {
        match messages.first_mut() {
            Some(first) if first.role == Role::User => prepend_text(first, &system_text),
            _ => messages.insert(0, ChatMessage::user(system_text.clone())),
        }
    }

    // Tool definitions: drop builtins/removed, cap, remap.
    let kept_defs = tools::filter_client_tools(&req.tools);
    let kept_names: HashSet<&str> = kept_defs.iter().map(|t| t.name.as_str()).collect();
    if kept_defs.len() < req.tools.len() {
        debug!(
            requested = req.tools.len(),
            kept = kept_defs.len(),
            "tool list trimmed"
        );
    }
    let upstream_tools: Vec<UpstreamTool> = kept_defs
        .iter()
        .map(|t| {
            let schema = t
                .input_schema
                .clone()
                .unwrap_or_else(|| serde_json::json!({"type": "object"}));
            UpstreamTool {
                tool_specification: ToolSpecification {
                    name: tools::upstream_name(&t.name).to_string(),
                    description: tools::compress_description(t.description.as_deref().unwrap_or("")),
                    input_schema: InputSchema {
                        json: tools::clean_schema(&tools::rename_schema_params(&t.name, &schema)),
                    },
                },
            }
        })
        .collect();

    // Ids whose tool is no longer registered on this request must vanish
    // from history or the upstream 400s on the dangling reference.
    let dropped_ids = dropped_tool_ids(&messages, &kept_names, !req.tools.is_empty());

    merge_adjacent_same_role(&mut messages);

    // The last message becomes the current turn; an assistant tail is
    // pushed into history and replaced by a continuation prompt.
    let last = messages
        .pop()
        .unwrap_or_else(|| ChatMessage::user("Hello"));
    let (history_msgs, current_src) = if last.role == Role::Assistant {
        let mut h = messages;
        h.push(last);
        (h, ChatMessage::user("Continue"))
    } else {
        (messages, last)
    };

    let mut history: Vec<HistoryEntry> = history_msgs
        .iter()
        .map(|m| convert_message(m, &model_id, &dropped_ids))
        .collect();

    let mut current = match convert_message(&current_src, &model_id, &dropped_ids) {
        HistoryEntry::User { user_input_message } => user_input_message,
        // unreachable by construction, but stay total
        HistoryEntry::Assistant { .. } => UserInputMessage::new("Continue", &model_id),
    };
    current.content = cap_current_content(&current.content);

    // Tools ride on the current message context.
    if !upstream_tools.is_empty() {
        let ctx = current.user_input_message_context.get_or_insert_with(Default::default);
        ctx.tools = upstream_tools;
    }

    enforce_shape(&mut history, &mut current, &model_id);

    let meta = |key: &str| -> Option<String> {
        req.metadata
            .as_ref()
            .and_then(|m| m.get(key))
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    let conversation_state = ConversationState {
        conversation_id: meta("conversation_id").unwrap_or_else(|| Uuid::new_v4().to_string()),
        agent_continuation_id: meta("continuation_id"),
        agent_task_type: meta("task_type"),
        chat_trigger_type: CHAT_TRIGGER_MANUAL.to_string(),
        history,
        current_message: CurrentMessage {
            user_input_message: current,
        },
    };

    BuiltRequest {
        request: GenerateAssistantResponseRequest {
            conversation_state,
            profile_arn: opts.profile_arn.clone(),
        },
        model_id,
        thinking_injected: thinking,
    }
}

fn prepend_text(msg: &mut ChatMessage, prefix: &str) {
    let mut parts = msg.content.parts();
    let existing = msg.content.text();
    let combined = if existing.is_empty() {
        prefix.to_string()
    } else {
        format!("{prefix}\n\n{existing}")
    };
    parts.retain(|p| !matches!(p, ContentPart::Text { .. }));
    parts.insert(0, ContentPart::Text { text: combined });
    msg.content = kirogate_core::anthropic::MessageContent::Parts(parts);
}

/// Tool-use ids that reference a tool absent from the kept set. When the
/// client sent no tools at all, nothing is filtered — historical calls to
/// unadvertised tools are the client's own business.
fn dropped_tool_ids(
    messages: &[ChatMessage],
    kept_names: &HashSet<&str>,
    request_has_tools: bool,
) -> HashSet<String> {
    if !request_has_tools {
        return HashSet::new();
    }
    let mut id_to_name: HashMap<String, String> = HashMap::new();
    for msg in messages.iter().filter(|m| m.role == Role::Assistant) {
        for part in msg.content.parts() {
            if let ContentPart::ToolUse { id, name, .. } = part {
                id_to_name.insert(id, name);
            }
        }
    }
    id_to_name
        .into_iter()
        .filter(|(_, name)| !kept_names.contains(name.as_str()))
        .map(|(id, _)| id)
        .collect()
}

fn merge_adjacent_same_role(messages: &mut Vec<ChatMessage>) {
    let mut out: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    for msg in messages.drain(..) {
        match out.last_mut() {
            Some(prev) if prev.role == msg.role => {
                let mut parts = prev.content.parts();
                parts.extend(msg.content.parts());
                prev.content = kirogate_core::anthropic::MessageContent::Parts(parts);
            }
            _ => out.push(msg),
        }
    }
    *messages = out;
}

fn sniff_image_format(media_type: Option<&str>, data: &str) -> String {
    if let Some(mt) = media_type {
        if let Some(fmt) = mt.strip_prefix("image/") {
            return fmt.to_string();
        }
    }
    // base64 magic prefixes
    if data.starts_with("iVBORw0KGgo") {
        "png".to_string()
    } else if data.starts_with("/9j/") {
        "jpeg".to_string()
    } else if data.starts_with("R0lGOD") {
        "gif".to_string()
    } else if data.starts_with("UklGR") {
        "webp".to_string()
    } else {
        "png".to_string()
    }
}

fn convert_message(
    msg: &ChatMessage,
    model_id: &str,
    dropped_ids: &HashSet<String>,
) -> HistoryEntry {
    match msg.role {
        Role::User => {
            let mut texts: Vec<String> = Vec::new();
            let mut images: Vec<ImageBlock> = Vec::new();
            let mut results: Vec<UpstreamToolResult> = Vec::new();
            let mut seen_ids: HashSet<String> = HashSet::new();

            for part in msg.content.parts() {
                match part {
                    ContentPart::Text { text } => texts.push(text),
                    ContentPart::Image { source } => {
                        if let Some(data) = &source.data {
                            images.push(ImageBlock {
                                format: sniff_image_format(source.media_type.as_deref(), data),
                                source: ImageSourceBlock { bytes: data.clone() },
                            });
                        }
                    }
                    ContentPart::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => {
                        if dropped_ids.contains(&tool_use_id) {
                            continue;
                        }
                        // duplicates by id confuse the upstream pairing
                        if !seen_ids.insert(tool_use_id.clone()) {
                            continue;
                        }
                        let mut text = tool_result_text(&content);
                        if text.chars().count() > MAX_TOOL_OUTPUT_LEN {
                            text = text.chars().take(MAX_TOOL_OUTPUT_LEN).collect::<String>()
                                + TOOL_OUTPUT_MARKER;
                        }
                        results.push(UpstreamToolResult {
                            tool_use_id,
                            content: vec![ToolResultContentBlock { text }],
                            status: if is_error { "error" } else { "success" }.to_string(),
                        });
                    }
                    // thinking never appears in user messages; total anyway
                    ContentPart::Thinking { .. } | ContentPart::ToolUse { .. } => {}
                }
            }

            let mut message = UserInputMessage::new(texts.join("\n"), model_id);
            message.images = images;
            if !results.is_empty() {
                message.user_input_message_context = Some(UserInputMessageContext {
                    tool_results: results,
                    ..Default::default()
                });
            }
            HistoryEntry::User {
                user_input_message: message,
            }
        }
        Role::Assistant => {
            let mut text = String::new();
            let mut tool_uses: Vec<UpstreamToolUse> = Vec::new();

            for part in msg.content.parts() {
                match part {
                    ContentPart::Text { text: t } => text.push_str(&t),
                    // typed thinking cannot cross the hop — inline it
                    ContentPart::Thinking { thinking, .. } => {
                        text = format!("<thinking>{thinking}</thinking>{text}");
                    }
                    ContentPart::ToolUse { id, name, input } => {
                        if dropped_ids.contains(&id) {
                            continue;
                        }
                        let (upstream, mapped) = tools::map_outbound(&name, &input);
                        tool_uses.push(UpstreamToolUse {
                            tool_use_id: id,
                            name: upstream,
                            input: mapped,
                        });
                    }
                    ContentPart::Image { .. } | ContentPart::ToolResult { .. } => {}
                }
            }

            HistoryEntry::Assistant {
                assistant_response_message: AssistantResponseMessage {
                    content: text,
                    tool_uses,
                },
            }
        }
    }
}

fn remove_system_reminders(text: &str) -> String {
    const OPEN: &str = "<system-reminder>";
    const CLOSE: &str = "</system-reminder>";
    let mut out = text.to_string();
    while let Some(start) = out.find(OPEN) {
        match out[start..].find(CLOSE) {
            Some(rel_end) => out.replace_range(start..start + rel_end + CLOSE.len(), ""),
            None => break,
        }
    }
    out
}

fn cap_current_content(content: &str) -> String {
    if content.chars().count() <= MAX_CURRENT_MESSAGE_LEN {
        return content.to_string();
    }
    let stripped = remove_system_reminders(content);
    truncate_keep_edges(&stripped, MAX_CURRENT_MESSAGE_LEN)
}

/// Final shape pass over the assembled request: alternation with
/// placeholders, non-empty contents, object tool inputs, and orphan
/// tool-use/tool-result pruning across adjacent entries.
fn enforce_shape(history: &mut Vec<HistoryEntry>, current: &mut UserInputMessage, model_id: &str) {
    // Pairing: a user entry's toolResults must answer the immediately
    // preceding assistant entry's toolUses; a toolUse without an answer in
    // the immediately following user entry is dropped.
    let mut idx = 0;
    while idx < history.len() {
        let prev_uses: HashSet<String> = if idx > 0 {
            match &history[idx - 1] {
                HistoryEntry::Assistant {
                    assistant_response_message,
                } => assistant_response_message
                    .tool_uses
                    .iter()
                    .map(|t| t.tool_use_id.clone())
                    .collect(),
                _ => HashSet::new(),
            }
        } else {
            HashSet::new()
        };

        if let HistoryEntry::User { user_input_message } = &mut history[idx] {
            if let Some(ctx) = &mut user_input_message.user_input_message_context {
                ctx.tool_results
                    .retain(|r| prev_uses.contains(&r.tool_use_id));
                if ctx.is_empty() {
                    user_input_message.user_input_message_context = None;
                }
            }
        }
        idx += 1;
    }

    // Orphan toolUses: answered either by the next history entry or, for
    // the final assistant entry, by the current message.
    let len = history.len();
    for idx in 0..len {
        let answered: HashSet<String> = if idx + 1 < len {
            match &history[idx + 1] {
                HistoryEntry::User { user_input_message } => user_input_message
                    .user_input_message_context
                    .as_ref()
                    .map(|c| {
                        c.tool_results
                            .iter()
                            .map(|r| r.tool_use_id.clone())
                            .collect()
                    })
                    .unwrap_or_default(),
                _ => HashSet::new(),
            }
        } else {
            current
                .user_input_message_context
                .as_ref()
                .map(|c| {
                    c.tool_results
                        .iter()
                        .map(|r| r.tool_use_id.clone())
                        .collect()
                })
                .unwrap_or_default()
        };

        if let HistoryEntry::Assistant {
            assistant_response_message,
        } = &mut history[idx]
        {
            assistant_response_message
                .tool_uses
                .retain(|t| answered.contains(&t.tool_use_id));
            for tu in &mut assistant_response_message.tool_uses {
                if !tu.input.is_object() {
                    tu.input = Value::Object(Default::default());
                }
            }
        }
    }

    // Alternation over history + current (current is always a user turn).
    let mut shaped: Vec<HistoryEntry> = Vec::with_capacity(history.len());
    for entry in history.drain(..) {
        let prev_is_user = shaped.last().map(HistoryEntry::is_user);
        if prev_is_user == Some(entry.is_user()) {
            shaped.push(placeholder_for(!entry.is_user(), model_id));
        } else if shaped.is_empty() && !entry.is_user() {
            shaped.push(placeholder_for(true, model_id));
        }
        shaped.push(entry);
    }
    if let Some(last) = shaped.last() {
        if last.is_user() {
            shaped.push(placeholder_for(false, model_id));
        }
    }
    *history = shaped;

    // Non-empty contents.
    for entry in history.iter_mut() {
        match entry {
            HistoryEntry::User { user_input_message } => {
                fill_user_content(user_input_message);
            }
            HistoryEntry::Assistant {
                assistant_response_message,
            } => {
                if assistant_response_message.content.trim().is_empty() {
                    assistant_response_message.content =
                        if assistant_response_message.tool_uses.is_empty() {
                            "...".to_string()
                        } else {
                            "Calling tools...".to_string()
                        };
                }
            }
        }
    }
    fill_user_content(current);
}

fn fill_user_content(msg: &mut UserInputMessage) {
    if !msg.content.trim().is_empty() {
        return;
    }
    let has_results = msg
        .user_input_message_context
        .as_ref()
        .map(|c| !c.tool_results.is_empty())
        .unwrap_or(false);
    msg.content = if has_results {
        "Tool results provided.".to_string()
    } else {
        "Continue".to_string()
    };
}

fn placeholder_for(user: bool, model_id: &str) -> HistoryEntry {
    if user {
        HistoryEntry::User {
            user_input_message: UserInputMessage::new("Continue", model_id),
        }
    } else {
        HistoryEntry::Assistant {
            assistant_response_message: AssistantResponseMessage {
                content: "understood".to_string(),
                tool_uses: Vec::new(),
            },
        }
    }
}
