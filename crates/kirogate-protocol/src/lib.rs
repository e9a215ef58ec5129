//! `kirogate-protocol` — AWS event-stream framing and upstream event types.
//!
//! The CodeWhisperer streaming endpoint answers with the binary
//! `application/vnd.amazon.eventstream` framing. [`eventstream`] turns an
//! append-only byte buffer into decoded [`eventstream::Frame`]s;
//! [`events`] interprets frame payloads into typed [`events::UpstreamEvent`]s
//! that the streaming engine re-emits in Anthropic grammar.

pub mod events;
pub mod eventstream;

pub use events::UpstreamEvent;
pub use eventstream::{decode_frames, encode_frame, CodecError, Frame, HeaderValue};
