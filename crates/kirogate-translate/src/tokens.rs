//! Fast token estimation.
//!
//! The counter only has to be good enough for threshold decisions, not
//! billing: CJK text runs ~2.5 tokens per character, everything else
//! ~0.35, serialized JSON adds ~10% structural overhead, and images are a
//! flat 1500.

use kirogate_core::anthropic::{
    tool_result_text, ChatMessage, ContentPart, SystemPrompt, ToolDefinition,
};

pub const MAX_CONTEXT_TOKENS: u64 = 200_000;
/// Auto-prune trigger — 80% of the window.
pub const AUTO_PRUNE_TRIGGER: u64 = 160_000;
/// Tokens reserved for the response itself.
pub const RESPONSE_RESERVE: u64 = 4096;

const IMAGE_TOKENS: u64 = 1500;
const JSON_OVERHEAD: f64 = 1.10;
const TOOL_BASE_TOKENS: u64 = 80;
const TOOL_PROPERTY_TOKENS: u64 = 50;

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{3000}'..='\u{303F}'   // CJK symbols and punctuation
        | '\u{3040}'..='\u{30FF}' // hiragana + katakana
        | '\u{3400}'..='\u{4DBF}' // CJK extension A
        | '\u{4E00}'..='\u{9FFF}' // CJK unified
        | '\u{AC00}'..='\u{D7AF}' // hangul
        | '\u{FF00}'..='\u{FFEF}' // full-width forms
    )
}

pub fn estimate_text(text: &str) -> u64 {
    let mut cjk = 0u64;
    let mut other = 0u64;
    for c in text.chars() {
        if is_cjk(c) {
            cjk += 1;
        } else {
            other += 1;
        }
    }
    (cjk as f64 * 2.5 + other as f64 * 0.35).ceil() as u64
}

/// Full-message estimate across all content parts.
pub fn estimate_message(msg: &ChatMessage) -> u64 {
    let mut text_tokens = 0u64;
    let mut images = 0u64;

    for part in msg.content.parts() {
        match part {
            ContentPart::Text { text } => text_tokens += estimate_text(&text),
            ContentPart::Thinking { thinking, .. } => text_tokens += estimate_text(&thinking),
            ContentPart::ToolResult { content, .. } => {
                text_tokens += estimate_text(&tool_result_text(&content))
            }
            ContentPart::ToolUse { name, input, .. } => {
                text_tokens += estimate_text(&name);
                text_tokens += estimate_text(&input.to_string());
            }
            ContentPart::Image { .. } => images += 1,
        }
    }

    (text_tokens as f64 * JSON_OVERHEAD).ceil() as u64 + images * IMAGE_TOKENS
}

pub fn estimate_messages(msgs: &[ChatMessage]) -> u64 {
    msgs.iter().map(estimate_message).sum()
}

pub fn estimate_tools(tools: &[ToolDefinition]) -> u64 {
    tools
        .iter()
        .map(|t| {
            let desc = t
                .description
                .as_deref()
                .map(estimate_text)
                .unwrap_or_default();
            let props = t
                .input_schema
                .as_ref()
                .and_then(|s| s.get("properties"))
                .and_then(|p| p.as_object())
                .map(|p| p.len() as u64)
                .unwrap_or(0);
            TOOL_BASE_TOKENS + desc + props * TOOL_PROPERTY_TOKENS
        })
        .sum()
}

/// Tokens reserved before any history fits: response budget + system
/// prompt + tool definitions.
pub fn reserved_tokens(system: Option<&SystemPrompt>, tools: &[ToolDefinition]) -> u64 {
    let system_tokens = system.map(|s| estimate_text(&s.text())).unwrap_or(0);
    RESPONSE_RESERVE + system_tokens + estimate_tools(tools)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ascii_rate_is_035_per_char() {
        assert_eq!(estimate_text("aaaaaaaaaa"), 4); // ceil(10 * 0.35)
        assert_eq!(estimate_text(""), 0);
    }

    #[test]
    fn cjk_rate_is_25_per_char() {
        assert_eq!(estimate_text("你好世界"), 10); // 4 * 2.5
    }

    #[test]
    fn image_adds_flat_1500() {
        let msg = ChatMessage {
            role: kirogate_core::anthropic::Role::User,
            content: kirogate_core::anthropic::MessageContent::Parts(vec![
                ContentPart::Image {
                    source: kirogate_core::anthropic::ImageSource {
                        source_type: "base64".into(),
                        media_type: Some("image/png".into()),
                        data: Some("AAAA".into()),
                        url: None,
                    },
                },
            ]),
        };
        assert_eq!(estimate_message(&msg), 1500);
    }

    #[test]
    fn tool_use_counts_serialized_input() {
        let msg = ChatMessage {
            role: kirogate_core::anthropic::Role::Assistant,
            content: kirogate_core::anthropic::MessageContent::Parts(vec![
                ContentPart::ToolUse {
                    id: "tu".into(),
                    name: "Bash".into(),
                    input: json!({"command": "cargo test --workspace"}),
                },
            ]),
        };
        assert!(estimate_message(&msg) > 10);
    }

    #[test]
    fn reserved_includes_tools_and_system() {
        let tools = vec![ToolDefinition {
            name: "Read".into(),
            tool_type: None,
            description: Some("read a file".into()),
            input_schema: Some(json!({"type":"object","properties":{"file_path":{},"limit":{}}})),
        }];
        let system = SystemPrompt::Text("be helpful".into());
        let reserved = reserved_tokens(Some(&system), &tools);
        assert!(reserved > RESPONSE_RESERVE + 100);
    }
}
