//! `kirogate-upstream` — the CodeWhisperer side of the proxy.
//!
//! [`client::UpstreamClient`] owns the pooled HTTP client (rebuilt on
//! socket-class failures), sends `generateAssistantResponse` calls with
//! the fingerprint headers, and hands the response body to
//! [`stream::pump_events`], which decodes event-stream frames into typed
//! [`kirogate_protocol::UpstreamEvent`]s on an mpsc channel.

pub mod client;
pub mod stream;
pub mod summarize;
pub mod usage;
pub mod websearch;

pub use client::UpstreamClient;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("stream error: {0}")]
    Stream(String),

    #[error("operation cancelled")]
    Cancelled,
}
