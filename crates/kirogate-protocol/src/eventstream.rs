//! Binary event-stream framing.
//!
//! Wire layout per message:
//!
//! ```text
//! +-------------+--------------+-------------+---------+---------+---------+
//! | total: u32  | headers: u32 | crc32: u32  | headers | payload | crc32   |
//! | big-endian  | big-endian   | of first 8  | region  |         | of rest |
//! +-------------+--------------+-------------+---------+---------+---------+
//! ```
//!
//! Each header is `name_len:u8 | name | value_type:u8 | value`. String
//! headers (type 7) carry a `u16` length prefix and are the only ones the
//! gateway reads (`:event-type`, `:content-type`, `:message-type`); other
//! value types are retained opaquely so frames re-encode byte-identically.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

pub const PRELUDE_LEN: usize = 12;
pub const MIN_FRAME_LEN: usize = 16; // prelude + trailing CRC

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("inconsistent prelude: total {total} headers {headers}")]
    Prelude { total: u32, headers: u32 },

    #[error("truncated header region at offset {0}")]
    Header(usize),

    #[error("payload for {event_type} is not valid {expected}: {detail}")]
    Payload {
        event_type: String,
        expected: &'static str,
        detail: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    String(String),
    /// Non-string header retained verbatim (`value_type`, raw value bytes).
    Opaque { value_type: u8, bytes: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub name: String,
    pub value: HeaderValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub headers: Vec<Header>,
    pub payload: Bytes,
}

impl Frame {
    fn string_header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|h| h.name == name).and_then(|h| {
            if let HeaderValue::String(s) = &h.value {
                Some(s.as_str())
            } else {
                None
            }
        })
    }

    pub fn event_type(&self) -> Option<&str> {
        self.string_header(":event-type")
    }

    pub fn content_type(&self) -> Option<&str> {
        self.string_header(":content-type")
    }

    pub fn message_type(&self) -> Option<&str> {
        self.string_header(":message-type")
    }

    /// Exception frames carry the exception name in `:exception-type`.
    pub fn exception_type(&self) -> Option<&str> {
        self.string_header(":exception-type")
    }
}

/// Fixed value length for a header type, or `None` for u16-prefixed types.
fn fixed_value_len(value_type: u8) -> Option<usize> {
    match value_type {
        0 | 1 => Some(0),  // bool true / false
        2 => Some(1),      // byte
        3 => Some(2),      // i16
        4 => Some(4),      // i32
        5 | 8 => Some(8),  // i64 / timestamp
        9 => Some(16),     // uuid
        6 | 7 => None,     // byte array / string
        other => {
            warn!(value_type = other, "unknown event-stream header type");
            Some(0)
        }
    }
}

fn parse_headers(region: &[u8]) -> Result<Vec<Header>, CodecError> {
    let mut headers = Vec::new();
    let mut pos = 0usize;
    while pos < region.len() {
        let name_len = region[pos] as usize;
        pos += 1;
        if pos + name_len + 1 > region.len() {
            return Err(CodecError::Header(pos));
        }
        let name = String::from_utf8_lossy(&region[pos..pos + name_len]).into_owned();
        pos += name_len;
        let value_type = region[pos];
        pos += 1;

        let value = match fixed_value_len(value_type) {
            Some(len) => {
                if pos + len > region.len() {
                    return Err(CodecError::Header(pos));
                }
                let bytes = region[pos..pos + len].to_vec();
                pos += len;
                HeaderValue::Opaque { value_type, bytes }
            }
            None => {
                if pos + 2 > region.len() {
                    return Err(CodecError::Header(pos));
                }
                let len = u16::from_be_bytes([region[pos], region[pos + 1]]) as usize;
                pos += 2;
                if pos + len > region.len() {
                    return Err(CodecError::Header(pos));
                }
                let raw = &region[pos..pos + len];
                pos += len;
                if value_type == 7 {
                    HeaderValue::String(String::from_utf8_lossy(raw).into_owned())
                } else {
                    HeaderValue::Opaque {
                        value_type,
                        bytes: raw.to_vec(),
                    }
                }
            }
        };

        headers.push(Header { name, value });
    }
    Ok(headers)
}

/// Decode all complete frames from `buf`, leaving any incomplete trailing
/// frame in place for the next call.
///
/// CRC words are verified and logged on mismatch but do not fail the
/// stream; inconsistent prelude lengths do, since resynchronization is
/// impossible once the length words lie.
pub fn decode_frames(buf: &mut BytesMut) -> Result<Vec<Frame>, CodecError> {
    let mut frames = Vec::new();

    loop {
        if buf.len() < MIN_FRAME_LEN {
            break;
        }

        let total = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let headers_len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let prelude_crc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        if (total as usize) < MIN_FRAME_LEN || headers_len as usize > total as usize - MIN_FRAME_LEN
        {
            return Err(CodecError::Prelude {
                total,
                headers: headers_len,
            });
        }
        if buf.len() < total as usize {
            break; // incomplete tail — preserved unchanged
        }

        let frame_bytes = buf.split_to(total as usize);

        let computed_prelude = crc32fast::hash(&frame_bytes[0..8]);
        if computed_prelude != prelude_crc {
            warn!(
                expected = prelude_crc,
                computed = computed_prelude,
                "event-stream prelude CRC mismatch"
            );
        }

        let crc_offset = total as usize - 4;
        let message_crc = u32::from_be_bytes([
            frame_bytes[crc_offset],
            frame_bytes[crc_offset + 1],
            frame_bytes[crc_offset + 2],
            frame_bytes[crc_offset + 3],
        ]);
        let computed_message = crc32fast::hash(&frame_bytes[0..crc_offset]);
        if computed_message != message_crc {
            warn!(
                expected = message_crc,
                computed = computed_message,
                "event-stream message CRC mismatch"
            );
        }

        let headers_end = PRELUDE_LEN + headers_len as usize;
        let headers = parse_headers(&frame_bytes[PRELUDE_LEN..headers_end])?;
        let payload = Bytes::copy_from_slice(&frame_bytes[headers_end..crc_offset]);

        frames.push(Frame { headers, payload });
    }

    Ok(frames)
}

/// Encode a frame back to wire bytes, CRC words included.
pub fn encode_frame(frame: &Frame) -> Bytes {
    let mut header_region = BytesMut::new();
    for h in &frame.headers {
        header_region.put_u8(h.name.len() as u8);
        header_region.put_slice(h.name.as_bytes());
        match &h.value {
            HeaderValue::String(s) => {
                header_region.put_u8(7);
                header_region.put_u16(s.len() as u16);
                header_region.put_slice(s.as_bytes());
            }
            HeaderValue::Opaque { value_type, bytes } => {
                header_region.put_u8(*value_type);
                if fixed_value_len(*value_type).is_none() {
                    header_region.put_u16(bytes.len() as u16);
                }
                header_region.put_slice(bytes);
            }
        }
    }

    let total = MIN_FRAME_LEN + header_region.len() + frame.payload.len();
    let mut out = BytesMut::with_capacity(total);
    out.put_u32(total as u32);
    out.put_u32(header_region.len() as u32);
    let prelude_crc = crc32fast::hash(&out[0..8]);
    out.put_u32(prelude_crc);
    out.put_slice(&header_region);
    out.put_slice(&frame.payload);
    let message_crc = crc32fast::hash(&out);
    out.put_u32(message_crc);
    out.freeze()
}

/// Convenience constructor for event frames used across the test suites.
pub fn event_frame(event_type: &str, payload: &str) -> Frame {
    Frame {
        headers: vec![
            Header {
                name: ":message-type".to_string(),
                value: HeaderValue::String("event".to_string()),
            },
            Header {
                name: ":event-type".to_string(),
                value: HeaderValue::String(event_type.to_string()),
            },
            Header {
                name: ":content-type".to_string(),
                value: HeaderValue::String("application/json".to_string()),
            },
        ],
        payload: Bytes::copy_from_slice(payload.as_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_single_frame() {
        let frame = event_frame("assistantResponseEvent", r#"{"content":"hi"}"#);
        let mut buf = BytesMut::from(&encode_frame(&frame)[..]);
        let decoded = decode_frames(&mut buf).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0], frame);
        assert!(buf.is_empty());
        assert_eq!(decoded[0].event_type(), Some("assistantResponseEvent"));
        assert_eq!(decoded[0].message_type(), Some("event"));
    }

    #[test]
    fn incomplete_tail_is_preserved() {
        let frame = event_frame("toolUseEvent", r#"{"toolUseId":"tu_1","name":"readFile"}"#);
        let wire = encode_frame(&frame);
        let mut buf = BytesMut::from(&wire[..]);
        // append half of a second frame
        buf.extend_from_slice(&wire[..wire.len() / 2]);

        let decoded = decode_frames(&mut buf).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(buf.len(), wire.len() / 2);

        // feeding the rest completes the second frame
        buf.extend_from_slice(&wire[wire.len() / 2..]);
        let decoded = decode_frames(&mut buf).unwrap();
        assert_eq!(decoded.len(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn multiple_frames_in_one_buffer() {
        let a = event_frame("assistantResponseEvent", r#"{"content":"po"}"#);
        let b = event_frame("assistantResponseEvent", r#"{"content":"ng"}"#);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(&a));
        buf.extend_from_slice(&encode_frame(&b));
        let decoded = decode_frames(&mut buf).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0], a);
        assert_eq!(decoded[1], b);
    }

    #[test]
    fn inconsistent_prelude_is_fatal() {
        let mut buf = BytesMut::new();
        // total=16 but headers_len=200: impossible
        buf.put_u32(16);
        buf.put_u32(200);
        buf.put_u32(0);
        buf.put_u32(0);
        assert!(matches!(
            decode_frames(&mut buf),
            Err(CodecError::Prelude { .. })
        ));
    }

    #[test]
    fn opaque_header_types_round_trip() {
        let frame = Frame {
            headers: vec![
                Header {
                    name: ":event-type".into(),
                    value: HeaderValue::String("meteringEvent".into()),
                },
                Header {
                    name: ":flags".into(),
                    value: HeaderValue::Opaque {
                        value_type: 4,
                        bytes: vec![0, 0, 0, 7],
                    },
                },
                Header {
                    name: ":blob".into(),
                    value: HeaderValue::Opaque {
                        value_type: 6,
                        bytes: vec![1, 2, 3],
                    },
                },
            ],
            payload: Bytes::from_static(b"{}"),
        };
        let mut buf = BytesMut::from(&encode_frame(&frame)[..]);
        let decoded = decode_frames(&mut buf).unwrap();
        assert_eq!(decoded[0], frame);
    }

    #[test]
    fn bad_crc_is_tolerated() {
        let frame = event_frame("assistantResponseEvent", r#"{"content":"x"}"#);
        let wire = encode_frame(&frame);
        let mut corrupted = wire.to_vec();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xFF; // flip a message-CRC byte
        let mut buf = BytesMut::from(&corrupted[..]);
        let decoded = decode_frames(&mut buf).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].payload, frame.payload);
    }
}
