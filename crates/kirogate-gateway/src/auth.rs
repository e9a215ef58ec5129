//! Client bearer authentication for `/v1/messages`.

use axum::http::HeaderMap;

use kirogate_core::config::GatewayConfig;
use kirogate_core::GatewayError;

/// Accepts the key as `x-api-key: <key>` or `Authorization: Bearer <key>`.
/// No configured key means the check is disabled.
pub fn check_client_auth(config: &GatewayConfig, headers: &HeaderMap) -> Result<(), GatewayError> {
    let Some(required) = config.required_api_key.as_deref() else {
        return Ok(());
    };

    let presented = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        });

    match presented {
        Some(key) if key == required => Ok(()),
        Some(_) => Err(GatewayError::AuthFailed("invalid api key".to_string())),
        None => Err(GatewayError::AuthFailed("missing api key".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn config_with_key(key: Option<&str>) -> GatewayConfig {
        GatewayConfig {
            required_api_key: key.map(str::to_string),
            ..GatewayConfig::default()
        }
    }

    #[test]
    fn x_api_key_header_is_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-good"));
        assert!(check_client_auth(&config_with_key(Some("sk-good")), &headers).is_ok());
    }

    #[test]
    fn bearer_header_is_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer sk-good"));
        assert!(check_client_auth(&config_with_key(Some("sk-good")), &headers).is_ok());
    }

    #[test]
    fn wrong_or_missing_key_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-bad"));
        assert!(check_client_auth(&config_with_key(Some("sk-good")), &headers).is_err());
        assert!(check_client_auth(&config_with_key(Some("sk-good")), &HeaderMap::new()).is_err());
    }

    #[test]
    fn no_configured_key_disables_the_check() {
        assert!(check_client_auth(&config_with_key(None), &HeaderMap::new()).is_ok());
    }
}
