// Verify the event-stream wire format against synthetic vectors covering
// every recognized event type. Upstream compatibility must never break.

use bytes::BytesMut;
use kirogate_protocol::events::parse_event;
use kirogate_protocol::eventstream::{decode_frames, encode_frame, event_frame, Frame};
use kirogate_protocol::UpstreamEvent;

fn all_event_vectors() -> Vec<Frame> {
    vec![
        event_frame("assistantResponseEvent", r#"{"content":"hello world"}"#),
        event_frame(
            "toolUseEvent",
            r#"{"toolUseId":"tu_9","name":"executeBash","input":"{\"command\":\"ls\"}","stop":false}"#,
        ),
        event_frame("toolUseEvent", r#"{"toolUseId":"tu_9","name":"executeBash","stop":true}"#),
        event_frame("reasoningContentEvent", r#"{"content":"thinking about it"}"#),
        event_frame(
            "codeReferenceEvent",
            r#"{"references":[{"licenseName":"Apache-2.0","repository":"org/repo","url":"https://github.com/org/repo","recommendationContentSpan":{"start":0,"end":42}}]}"#,
        ),
        event_frame("meteringEvent", r#"{"usage":0.125,"unit":"CREDIT"}"#),
        event_frame("messageMetadataEvent", r#"{"conversationId":"conv-abc"}"#),
        event_frame("followupPromptEvent", r#"{"followupPrompt":{"content":"next?"}}"#),
    ]
}

#[test]
fn encode_decode_round_trip_all_event_types() {
    let frames = all_event_vectors();

    let mut wire = BytesMut::new();
    for f in &frames {
        wire.extend_from_slice(&encode_frame(f));
    }

    let decoded = decode_frames(&mut wire).unwrap();
    assert!(wire.is_empty());
    assert_eq!(decoded, frames);
}

#[test]
fn round_trip_survives_byte_at_a_time_delivery() {
    let frames = all_event_vectors();
    let mut wire = Vec::new();
    for f in &frames {
        wire.extend_from_slice(&encode_frame(f));
    }

    let mut buf = BytesMut::new();
    let mut decoded = Vec::new();
    for b in wire {
        buf.extend_from_slice(&[b]);
        decoded.extend(decode_frames(&mut buf).unwrap());
    }
    assert_eq!(decoded, frames);
}

#[test]
fn every_recognized_vector_parses_to_the_expected_event() {
    let frames = all_event_vectors();
    let events: Vec<Option<UpstreamEvent>> =
        frames.iter().map(|f| parse_event(f).unwrap()).collect();

    assert!(matches!(
        events[0],
        Some(UpstreamEvent::Content { ref content }) if content == "hello world"
    ));
    assert!(matches!(
        events[1],
        Some(UpstreamEvent::ToolUse { ref name, stop: false, .. }) if name == "executeBash"
    ));
    assert!(matches!(
        events[2],
        Some(UpstreamEvent::ToolUse { stop: true, .. })
    ));
    assert!(matches!(events[3], Some(UpstreamEvent::Thinking { .. })));
    assert!(matches!(
        events[4],
        Some(UpstreamEvent::CodeReference(ref refs)) if refs.len() == 1
    ));
    assert!(matches!(
        events[5],
        Some(UpstreamEvent::Metering { usage, .. }) if (usage - 0.125).abs() < f64::EPSILON
    ));
    assert!(matches!(
        events[6],
        Some(UpstreamEvent::Metadata { ref conversation_id }) if conversation_id == "conv-abc"
    ));
    // followup prompts are parsed and discarded
    assert!(events[7].is_none());
}
