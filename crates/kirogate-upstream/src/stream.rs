//! Response-body pump: bytes → frames → typed events.

use bytes::BytesMut;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use kirogate_protocol::events::parse_event;
use kirogate_protocol::eventstream::{decode_frames, CodecError};
use kirogate_protocol::UpstreamEvent;

/// Read the streaming response until it ends, the receiver is dropped, or
/// the request is cancelled. Malformed payloads are logged and skipped;
/// only an unrecoverable framing error aborts the stream.
pub async fn pump_events(
    response: reqwest::Response,
    tx: mpsc::Sender<UpstreamEvent>,
    cancel: CancellationToken,
) {
    let mut body = response.bytes_stream();
    let mut buf = BytesMut::new();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("upstream stream cancelled by client");
                return;
            }
            chunk = body.next() => chunk,
        };

        let chunk = match chunk {
            Some(Ok(c)) => c,
            Some(Err(e)) => {
                warn!(error = %e, "upstream stream read error");
                let _ = tx
                    .send(UpstreamEvent::Error {
                        code: "StreamReadError".to_string(),
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
            None => break,
        };

        buf.extend_from_slice(&chunk);

        let frames = match decode_frames(&mut buf) {
            Ok(frames) => frames,
            Err(e @ CodecError::Prelude { .. }) => {
                // length words lied — resynchronization is impossible
                warn!(error = %e, "fatal event-stream framing error");
                let _ = tx
                    .send(UpstreamEvent::Error {
                        code: "CodecError".to_string(),
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
            Err(e) => {
                warn!(error = %e, "event-stream decode error, dropping buffer");
                buf.clear();
                continue;
            }
        };

        for frame in frames {
            match parse_event(&frame) {
                Ok(Some(event)) => {
                    if tx.send(event).await.is_err() {
                        return; // receiver dropped
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    // one bad payload does not end the conversation
                    warn!(error = %e, "skipping malformed upstream event");
                }
            }
        }
    }

    if !buf.is_empty() {
        debug!(remaining = buf.len(), "stream ended with a partial frame in the buffer");
    }
}
