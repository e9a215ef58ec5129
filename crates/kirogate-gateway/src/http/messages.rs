//! `POST /v1/messages` — the Anthropic-compatible endpoint.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kirogate_core::anthropic::MessagesRequest;
use kirogate_core::GatewayError;

use crate::app::AppState;
use crate::auth::check_client_auth;
use crate::emit::{collect_response, AnthropicEvent};
use crate::error;
use crate::orchestrate::execute;

pub async fn messages_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<MessagesRequest>,
) -> Response {
    if let Err(e) = check_client_auth(&state.config, &headers) {
        return error::into_response(e);
    }

    info!(model = %req.model, stream = req.stream, messages = req.messages.len(), "messages request");

    if req.stream {
        handle_streaming(state, req).await.into_response()
    } else {
        handle_buffered(state, req).await
    }
}

async fn handle_streaming(
    state: Arc<AppState>,
    req: MessagesRequest,
) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
    let (tx, mut rx) = mpsc::channel::<AnthropicEvent>(256);
    let cancel = CancellationToken::new();

    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = execute(state, req, task_cancel, tx.clone()).await {
            warn!(error = %e, code = e.code(), "request failed before the stream opened");
            let _ = tx
                .send(AnthropicEvent {
                    name: "error",
                    data: error::error_event_body(&e),
                })
                .await;
        }
    });

    // Dropping the SSE response (client disconnect) drops this guard and
    // tears down the upstream stream.
    let guard = cancel.drop_guard();
    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some(event) = rx.recv().await {
            let json = serde_json::to_string(&event.data).unwrap_or_default();
            yield Ok(Event::default().event(event.name).data(json));
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn handle_buffered(state: Arc<AppState>, req: MessagesRequest) -> Response {
    let (tx, mut rx) = mpsc::channel::<AnthropicEvent>(256);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(execute(state, req, cancel, tx));

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    match task.await {
        Ok(Ok(_summary)) => {
            let body = collect_response(&events);
            if body["type"] == "error" {
                let status = status_for_error_type(
                    body["error"]["type"].as_str().unwrap_or("api_error"),
                );
                (status, Json(body)).into_response()
            } else {
                (StatusCode::OK, Json(body)).into_response()
            }
        }
        Ok(Err(e)) => error::into_response(e),
        Err(e) => {
            warn!(error = %e, "request task aborted");
            error::into_response(GatewayError::Internal("request task aborted".to_string()))
        }
    }
}

fn status_for_error_type(error_type: &str) -> StatusCode {
    match error_type {
        "rate_limit_error" => StatusCode::TOO_MANY_REQUESTS,
        "permission_error" => StatusCode::FORBIDDEN,
        "authentication_error" => StatusCode::UNAUTHORIZED,
        "invalid_request_error" => StatusCode::BAD_REQUEST,
        _ => StatusCode::BAD_GATEWAY,
    }
}
