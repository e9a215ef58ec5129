//! Typed interpretation of decoded event-stream frames.

use serde::Deserialize;
use tracing::debug;

use crate::eventstream::{CodecError, Frame};

/// A decoded upstream event the streaming engine consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// Assistant text delta.
    Content { content: String },

    /// Tool-call fragment. `input` accumulates across frames for the same
    /// `tool_use_id` until a frame arrives with `stop == true`.
    ToolUse {
        tool_use_id: String,
        name: String,
        input: String,
        stop: bool,
    },

    /// Reasoning text delta.
    Thinking { content: String },

    /// Licensed-code attribution. Only entries with a license name,
    /// repository, and URL survive decoding.
    CodeReference(Vec<CodeReference>),

    /// Billing meter. `usage * 1000` approximates output tokens when local
    /// counting is unavailable.
    Metering { usage: f64, unit: String },

    /// Stream metadata (upstream conversation id).
    Metadata { conversation_id: String },

    /// Upstream exception frame (`:message-type: exception`).
    Error { code: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeReference {
    #[serde(default)]
    pub license_name: String,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub recommendation_content_span: Option<ContentSpan>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ContentSpan {
    pub start: u64,
    pub end: u64,
}

// Per-event payload shapes. Private — deserialization only.

#[derive(Deserialize)]
struct ContentPayload {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolUsePayload {
    tool_use_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    input: Option<String>,
    #[serde(default)]
    stop: Option<bool>,
}

#[derive(Deserialize)]
struct ReasoningPayload {
    #[serde(default, alias = "text")]
    content: String,
}

#[derive(Deserialize)]
struct CodeReferencePayload {
    #[serde(default)]
    references: Vec<CodeReference>,
}

#[derive(Deserialize)]
struct MeteringPayload {
    #[serde(default)]
    usage: f64,
    #[serde(default)]
    unit: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetadataPayload {
    #[serde(default)]
    conversation_id: String,
}

fn parse_json<'a, T: Deserialize<'a>>(frame: &'a Frame, event_type: &str) -> Result<T, CodecError> {
    serde_json::from_slice(&frame.payload).map_err(|e| CodecError::Payload {
        event_type: event_type.to_string(),
        expected: "JSON",
        detail: e.to_string(),
    })
}

/// Interpret one frame. Returns `Ok(None)` for frame types the gateway has
/// no use for (followup prompts, unknown events); the caller logs and skips
/// `Err` frames without aborting the stream.
pub fn parse_event(frame: &Frame) -> Result<Option<UpstreamEvent>, CodecError> {
    if frame.message_type() == Some("exception") {
        let code = frame
            .exception_type()
            .or_else(|| frame.event_type())
            .unwrap_or("unknown")
            .to_string();
        let message = String::from_utf8_lossy(&frame.payload).into_owned();
        return Ok(Some(UpstreamEvent::Error { code, message }));
    }

    let Some(event_type) = frame.event_type() else {
        debug!("event-stream frame without :event-type header");
        return Ok(None);
    };

    let event = match event_type {
        "assistantResponseEvent" => {
            let p: ContentPayload = parse_json(frame, event_type)?;
            Some(UpstreamEvent::Content { content: p.content })
        }
        "toolUseEvent" => {
            let p: ToolUsePayload = parse_json(frame, event_type)?;
            Some(UpstreamEvent::ToolUse {
                tool_use_id: p.tool_use_id,
                name: p.name,
                input: p.input.unwrap_or_default(),
                stop: p.stop.unwrap_or(false),
            })
        }
        "reasoningContentEvent" => {
            let p: ReasoningPayload = parse_json(frame, event_type)?;
            Some(UpstreamEvent::Thinking { content: p.content })
        }
        "codeReferenceEvent" => {
            let p: CodeReferencePayload = parse_json(frame, event_type)?;
            let refs: Vec<CodeReference> = p
                .references
                .into_iter()
                .filter(|r| {
                    !r.license_name.is_empty() && !r.repository.is_empty() && !r.url.is_empty()
                })
                .collect();
            if refs.is_empty() {
                None
            } else {
                Some(UpstreamEvent::CodeReference(refs))
            }
        }
        "meteringEvent" => {
            let p: MeteringPayload = parse_json(frame, event_type)?;
            Some(UpstreamEvent::Metering {
                usage: p.usage,
                unit: p.unit,
            })
        }
        "messageMetadataEvent" => {
            let p: MetadataPayload = parse_json(frame, event_type)?;
            Some(UpstreamEvent::Metadata {
                conversation_id: p.conversation_id,
            })
        }
        "followupPromptEvent" => None,
        other => {
            debug!(event_type = other, "unhandled upstream event type");
            None
        }
    };

    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventstream::event_frame;

    #[test]
    fn content_event_parses() {
        let frame = event_frame("assistantResponseEvent", r#"{"content":"hello"}"#);
        let ev = parse_event(&frame).unwrap().unwrap();
        assert_eq!(
            ev,
            UpstreamEvent::Content {
                content: "hello".into()
            }
        );
    }

    #[test]
    fn tool_use_fragments_carry_stop_flag() {
        let frame = event_frame(
            "toolUseEvent",
            r#"{"toolUseId":"tu_1","name":"readFile","input":"{\"pa"}"#,
        );
        let ev = parse_event(&frame).unwrap().unwrap();
        assert_eq!(
            ev,
            UpstreamEvent::ToolUse {
                tool_use_id: "tu_1".into(),
                name: "readFile".into(),
                input: "{\"pa".into(),
                stop: false,
            }
        );

        let stop = event_frame(
            "toolUseEvent",
            r#"{"toolUseId":"tu_1","name":"readFile","stop":true}"#,
        );
        match parse_event(&stop).unwrap().unwrap() {
            UpstreamEvent::ToolUse { stop, input, .. } => {
                assert!(stop);
                assert!(input.is_empty());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn code_references_without_license_are_dropped() {
        let frame = event_frame(
            "codeReferenceEvent",
            r#"{"references":[
                {"licenseName":"MIT","repository":"a/b","url":"https://x"},
                {"licenseName":"","repository":"c/d","url":"https://y"}
            ]}"#,
        );
        match parse_event(&frame).unwrap().unwrap() {
            UpstreamEvent::CodeReference(refs) => {
                assert_eq!(refs.len(), 1);
                assert_eq!(refs[0].license_name, "MIT");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn all_dropped_references_yield_no_event() {
        let frame = event_frame(
            "codeReferenceEvent",
            r#"{"references":[{"licenseName":"","repository":"","url":""}]}"#,
        );
        assert!(parse_event(&frame).unwrap().is_none());
    }

    #[test]
    fn metering_and_metadata() {
        let m = event_frame("meteringEvent", r#"{"usage":0.042,"unit":"CREDIT"}"#);
        assert_eq!(
            parse_event(&m).unwrap().unwrap(),
            UpstreamEvent::Metering {
                usage: 0.042,
                unit: "CREDIT".into()
            }
        );

        let md = event_frame("messageMetadataEvent", r#"{"conversationId":"c-1"}"#);
        assert_eq!(
            parse_event(&md).unwrap().unwrap(),
            UpstreamEvent::Metadata {
                conversation_id: "c-1".into()
            }
        );
    }

    #[test]
    fn malformed_payload_is_a_skippable_error() {
        let frame = event_frame("assistantResponseEvent", "not json");
        assert!(parse_event(&frame).is_err());
    }

    #[test]
    fn followup_prompt_is_ignored() {
        let frame = event_frame("followupPromptEvent", r#"{"followupPrompt":{"content":"?"}}"#);
        assert!(parse_event(&frame).unwrap().is_none());
    }

    #[test]
    fn exception_frames_become_errors() {
        use crate::eventstream::{Frame, Header, HeaderValue};
        let frame = Frame {
            headers: vec![
                Header {
                    name: ":message-type".into(),
                    value: HeaderValue::String("exception".into()),
                },
                Header {
                    name: ":exception-type".into(),
                    value: HeaderValue::String("ThrottlingException".into()),
                },
            ],
            payload: bytes::Bytes::from_static(b"{\"message\":\"slow down\"}"),
        };
        match parse_event(&frame).unwrap().unwrap() {
            UpstreamEvent::Error { code, message } => {
                assert_eq!(code, "ThrottlingException");
                assert!(message.contains("slow down"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
