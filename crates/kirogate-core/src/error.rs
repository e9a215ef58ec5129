use thiserror::Error;

/// Gateway-wide error taxonomy. Every failure that can reach a client is
/// classified into one of these kinds; the HTTP layer maps them onto the
/// Anthropic error shape via [`GatewayError::anthropic_type`].
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Missing or wrong client bearer key on `/v1/messages`.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Request-shape violation, locally caught or upstream 400.
    #[error("Invalid request: {0}")]
    ClientFault(String),

    /// Access token refresh required and failed.
    #[error("Token expired: {0}")]
    AuthExpired(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Socket/DNS/5xx class failures after the retry budget is spent.
    #[error("Upstream transport error: {0}")]
    Transport(String),

    /// Forbidden / quota / suspended — the account is done for.
    #[error("Upstream rejected the account ({status}): {message}")]
    Fatal { status: u16, message: String },

    /// Other upstream non-2xx.
    #[error("Upstream error ({status}): {message}")]
    UpstreamStatus { status: u16, message: String },

    #[error("Event stream decode error: {0}")]
    Codec(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Anthropic error `type` for client-visible payloads.
    pub fn anthropic_type(&self) -> &'static str {
        match self {
            GatewayError::AuthFailed(_) | GatewayError::AuthExpired(_) => "authentication_error",
            GatewayError::ClientFault(_) => "invalid_request_error",
            GatewayError::RateLimited { .. } => "rate_limit_error",
            GatewayError::Fatal { .. } => "permission_error",
            _ => "api_error",
        }
    }

    /// HTTP status to surface for buffered responses.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::AuthFailed(_) | GatewayError::AuthExpired(_) => 401,
            GatewayError::ClientFault(_) => 400,
            GatewayError::RateLimited { .. } => 429,
            GatewayError::Fatal { status, .. } => *status,
            GatewayError::UpstreamStatus { status, .. } => *status,
            GatewayError::Transport(_) => 502,
            _ => 500,
        }
    }

    /// Stable internal code for logs and debug strings. Never leaks stack
    /// contents to clients.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "CONFIG_ERROR",
            GatewayError::AuthFailed(_) => "AUTH_FAILED",
            GatewayError::ClientFault(_) => "CLIENT_FAULT",
            GatewayError::AuthExpired(_) => "AUTH_EXPIRED",
            GatewayError::RateLimited { .. } => "RATE_LIMITED",
            GatewayError::Transport(_) => "TRANSPORT",
            GatewayError::Fatal { .. } => "FATAL",
            GatewayError::UpstreamStatus { .. } => "UPSTREAM_STATUS",
            GatewayError::Codec(_) => "CODEC_ERROR",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
            GatewayError::Serialization(_) => "SERIALIZATION_ERROR",
            GatewayError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
