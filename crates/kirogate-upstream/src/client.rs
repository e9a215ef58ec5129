//! Pooled HTTP client for the streaming endpoint.

use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use kirogate_auth::fingerprint::{invocation_id, Fingerprint};
use kirogate_protocol::UpstreamEvent;
use kirogate_translate::conversation::GenerateAssistantResponseRequest;

use crate::stream::pump_events;
use crate::UpstreamError;

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_MAX_IDLE_PER_HOST: usize = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const SOCKET_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct UpstreamClient {
    inner: RwLock<reqwest::Client>,
    api_base: String,
    usage_base: String,
    fingerprint: Fingerprint,
    use_system_proxy: bool,
    max_retries: u32,
}

fn build_client(use_system_proxy: bool) -> reqwest::Client {
    let mut builder = reqwest::Client::builder()
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(Duration::from_secs(10));
    if !use_system_proxy {
        builder = builder.no_proxy();
    }
    builder.build().unwrap_or_else(|e| {
        warn!(error = %e, "client builder failed, falling back to defaults");
        reqwest::Client::new()
    })
}

/// Socket-class failures warrant a pool rebuild and retry; everything else
/// propagates.
fn is_socket_error(e: &reqwest::Error) -> bool {
    if e.is_connect() || e.is_timeout() {
        return true;
    }
    let text = e.to_string().to_lowercase();
    ["connection reset", "connection closed", "broken pipe", "dns error"]
        .iter()
        .any(|p| text.contains(p))
}

impl UpstreamClient {
    pub fn new(
        region: &str,
        fingerprint: Fingerprint,
        use_system_proxy: bool,
        max_retries: u32,
    ) -> Self {
        Self {
            inner: RwLock::new(build_client(use_system_proxy)),
            api_base: format!("https://codewhisperer.{region}.amazonaws.com"),
            usage_base: format!("https://q.{region}.amazonaws.com"),
            fingerprint,
            use_system_proxy,
            max_retries,
        }
    }

    /// Point the client at arbitrary base URLs — tests use local stubs.
    pub fn with_bases(
        api_base: impl Into<String>,
        usage_base: impl Into<String>,
        fingerprint: Fingerprint,
        max_retries: u32,
    ) -> Self {
        Self {
            inner: RwLock::new(build_client(true)),
            api_base: api_base.into(),
            usage_base: usage_base.into(),
            fingerprint,
            use_system_proxy: true,
            max_retries,
        }
    }

    pub async fn http(&self) -> reqwest::Client {
        self.inner.read().await.clone()
    }

    pub fn usage_base(&self) -> &str {
        &self.usage_base
    }

    /// Tear down and rebuild the connection pool. Only the request path
    /// calls this, on socket-class errors.
    async fn reset_pool(&self) {
        warn!("rebuilding upstream connection pool");
        *self.inner.write().await = build_client(self.use_system_proxy);
    }

    /// Open the streaming call and pump decoded events into the returned
    /// receiver. Transport errors are retried with a fresh pool up to the
    /// configured budget; HTTP-level failures return immediately for
    /// classification by the caller.
    pub async fn send_generate(
        &self,
        request: &GenerateAssistantResponseRequest,
        access_token: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<UpstreamEvent>, UpstreamError> {
        let url = format!("{}/generateAssistantResponse", self.api_base);
        let mut attempt = 0u32;

        let response = loop {
            let client = self.http().await;
            let result = client
                .post(&url)
                .bearer_auth(access_token)
                .header("content-type", "application/json")
                .header("amz-sdk-invocation-id", invocation_id())
                .header(
                    "amz-sdk-request",
                    format!("attempt=1; max={}", self.max_retries.max(2)),
                )
                .header("x-amzn-kiro-agent-mode", "vibe")
                .header("user-agent", self.fingerprint.user_agent())
                .header("x-amz-user-agent", self.fingerprint.amz_user_agent())
                .json(request)
                .send()
                .await;

            match result {
                Ok(resp) => break resp,
                Err(e) if is_socket_error(&e) && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(attempt, error = %e, "socket error, resetting pool and retrying");
                    self.reset_pool().await;
                    tokio::time::sleep(SOCKET_RETRY_DELAY).await;
                }
                Err(e) => return Err(UpstreamError::Http(e)),
            }
        };

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %message, "upstream rejected request");
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                message,
            });
        }

        debug!("upstream stream opened");
        let (tx, rx) = mpsc::channel::<UpstreamEvent>(64);
        tokio::spawn(pump_events(response, tx, cancel));
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::header;
    use axum::routing::post;
    use axum::Router;
    use kirogate_protocol::eventstream::{encode_frame, event_frame};
    use kirogate_translate::conversation::*;

    fn minimal_request() -> GenerateAssistantResponseRequest {
        GenerateAssistantResponseRequest {
            conversation_state: ConversationState {
                conversation_id: "c-1".into(),
                agent_continuation_id: None,
                agent_task_type: None,
                chat_trigger_type: CHAT_TRIGGER_MANUAL.into(),
                history: Vec::new(),
                current_message: CurrentMessage {
                    user_input_message: UserInputMessage::new("ping", "MODEL"),
                },
            },
            profile_arn: None,
        }
    }

    async fn spawn_stream_stub(frames: Vec<Vec<u8>>) -> String {
        let app = Router::new().route(
            "/generateAssistantResponse",
            post(move || {
                let body: Vec<u8> = frames.iter().flatten().copied().collect();
                async move {
                    (
                        [(header::CONTENT_TYPE, "application/vnd.amazon.eventstream")],
                        Body::from(body),
                    )
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn streams_decoded_events() {
        let frames = vec![
            encode_frame(&event_frame("assistantResponseEvent", r#"{"content":"po"}"#)).to_vec(),
            encode_frame(&event_frame("assistantResponseEvent", r#"{"content":"ng"}"#)).to_vec(),
        ];
        let base = spawn_stream_stub(frames).await;
        let client = UpstreamClient::with_bases(&base, &base, Fingerprint::generate(), 1);

        let mut rx = client
            .send_generate(&minimal_request(), "token", CancellationToken::new())
            .await
            .unwrap();

        let mut texts = Vec::new();
        while let Some(ev) = rx.recv().await {
            if let UpstreamEvent::Content { content } = ev {
                texts.push(content);
            }
        }
        assert_eq!(texts, vec!["po", "ng"]);
    }

    #[tokio::test]
    async fn non_2xx_is_a_status_error() {
        let app = Router::new().route(
            "/generateAssistantResponse",
            post(|| async { (axum::http::StatusCode::FORBIDDEN, "Forbidden".to_string()) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let base = format!("http://{addr}");
        let client = UpstreamClient::with_bases(&base, &base, Fingerprint::generate(), 1);

        match client
            .send_generate(&minimal_request(), "token", CancellationToken::new())
            .await
        {
            Err(UpstreamError::Status { status, .. }) => assert_eq!(status, 403),
            other => panic!("expected status error, got {other:?}"),
        }
    }
}
