//! Mapping internal failures onto the Anthropic error wire shape.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use kirogate_core::GatewayError;
use kirogate_pool::{classify, Classified, Disposition};
use kirogate_upstream::UpstreamError;

/// Anthropic top-level error object for buffered responses.
pub fn error_body(error: &GatewayError) -> Value {
    json!({
        "type": "error",
        "error": {
            "type": error.anthropic_type(),
            "message": error.to_string(),
        }
    })
}

/// Anthropic `error` event payload for streams.
pub fn error_event_body(error: &GatewayError) -> Value {
    error_body(error)
}

pub fn into_response(error: GatewayError) -> Response {
    let status =
        StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(error_body(&error))).into_response()
}

/// Classify an upstream failure and shape it for the client in one step.
pub fn from_upstream(error: &UpstreamError) -> (Classified, GatewayError) {
    let classified = match error {
        UpstreamError::Status { status, message } => classify(Some(*status), message),
        other => classify(None, &other.to_string()),
    };
    let gateway_error = match classified.disposition {
        Disposition::ClientFault => GatewayError::ClientFault(classified.message.clone()),
        Disposition::RateLimited => GatewayError::RateLimited { retry_after_ms: 0 },
        Disposition::Fatal => GatewayError::Fatal {
            status: classified.status.unwrap_or(403),
            message: classified.message.clone(),
        },
        Disposition::Transient => GatewayError::Transport(classified.message.clone()),
        Disposition::Other => GatewayError::UpstreamStatus {
            status: classified.status.unwrap_or(502),
            message: classified.message.clone(),
        },
    };
    (classified, gateway_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_is_anthropic_shaped() {
        let body = error_body(&GatewayError::RateLimited { retry_after_ms: 500 });
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "rate_limit_error");
    }

    #[test]
    fn upstream_403_maps_to_permission_error() {
        let (classified, err) = from_upstream(&UpstreamError::Status {
            status: 403,
            message: "Forbidden".into(),
        });
        assert_eq!(classified.disposition, Disposition::Fatal);
        assert_eq!(err.anthropic_type(), "permission_error");
        assert_eq!(err.http_status(), 403);
    }
}
