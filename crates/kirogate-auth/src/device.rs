//! IAM Identity Center device-authorization bootstrap.
//!
//! Flow: register an OIDC client (randomized name and user agent) →
//! request a device authorization → show the verification URI → poll the
//! token endpoint at the server-provided interval until approval, expiry,
//! or denial. The resulting bundle persists with `authMethod: idc`.

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::credentials::{AuthMethod, TokenBundle};
use crate::fingerprint::Fingerprint;
use crate::AuthError;

const GRANT_TYPE_DEVICE_CODE: &str = "urn:ietf:params:oauth:grant-type:device_code";
const START_URL: &str = "https://view.awsapps.com/start";
const SCOPES: &[&str] = &[
    "codewhisperer:completions",
    "codewhisperer:analysis",
    "codewhisperer:conversations",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredClient {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub client_secret_expires_at: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    pub expires_in: u64,
    #[serde(default = "default_interval")]
    pub interval: u64,
}

fn default_interval() -> u64 {
    5
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

pub struct DeviceAuthClient {
    client: reqwest::Client,
    oidc_base: String,
    fingerprint: Fingerprint,
    region: String,
}

impl DeviceAuthClient {
    pub fn new(client: reqwest::Client, region: &str, fingerprint: Fingerprint) -> Self {
        Self {
            client,
            oidc_base: format!("https://oidc.{region}.amazonaws.com"),
            fingerprint,
            region: region.to_string(),
        }
    }

    #[cfg(test)]
    fn with_base(client: reqwest::Client, base: &str, fingerprint: Fingerprint) -> Self {
        Self {
            client,
            oidc_base: base.to_string(),
            fingerprint,
            region: "us-east-1".to_string(),
        }
    }

    pub async fn register_client(&self) -> Result<RegisteredClient, AuthError> {
        let redirect = format!("http://127.0.0.1:{}/callback", self.fingerprint.redirect_port());
        let response = self
            .client
            .post(format!("{}/client/register", self.oidc_base))
            .header("user-agent", self.fingerprint.user_agent())
            .header("x-amz-user-agent", self.fingerprint.amz_user_agent())
            .json(&json!({
                "clientName": self.fingerprint.client_name(),
                "clientType": "public",
                "scopes": SCOPES,
                "redirectUris": [redirect],
                "grantTypes": [GRANT_TYPE_DEVICE_CODE, "refresh_token"],
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::DeviceFlow(format!(
                "client registration failed (HTTP {status}): {body}"
            )));
        }
        let registered: RegisteredClient = response
            .json()
            .await
            .map_err(|e| AuthError::DeviceFlow(format!("unparseable registration: {e}")))?;
        info!(client_id = %registered.client_id, "OIDC client registered");
        Ok(registered)
    }

    pub async fn start_device_authorization(
        &self,
        client: &RegisteredClient,
    ) -> Result<DeviceAuthorization, AuthError> {
        let response = self
            .client
            .post(format!("{}/device_authorization", self.oidc_base))
            .header("user-agent", self.fingerprint.user_agent())
            .json(&json!({
                "clientId": client.client_id,
                "clientSecret": client.client_secret,
                "startUrl": START_URL,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::DeviceFlow(format!(
                "device authorization failed (HTTP {status}): {body}"
            )));
        }
        response
            .json()
            .await
            .map_err(|e| AuthError::DeviceFlow(format!("unparseable device authorization: {e}")))
    }

    /// Poll the token endpoint until the user approves, the code expires,
    /// or access is denied. `slow_down` adds five seconds to the interval.
    pub async fn poll_token(
        &self,
        client: &RegisteredClient,
        device: &DeviceAuthorization,
    ) -> Result<TokenBundle, AuthError> {
        let mut interval = device.interval.max(1);
        let deadline = Utc::now() + chrono::Duration::seconds(device.expires_in as i64);

        loop {
            if Utc::now() >= deadline {
                return Err(AuthError::DeviceCodeExpired);
            }

            let response = self
                .client
                .post(format!("{}/token", self.oidc_base))
                .header("user-agent", self.fingerprint.user_agent())
                .json(&json!({
                    "clientId": client.client_id,
                    "clientSecret": client.client_secret,
                    "deviceCode": device.device_code,
                    "grantType": GRANT_TYPE_DEVICE_CODE,
                }))
                .send()
                .await?;

            let parsed: TokenResponse = response
                .json()
                .await
                .map_err(|e| AuthError::DeviceFlow(format!("unparseable token response: {e}")))?;

            match parsed.error.as_deref() {
                Some("authorization_pending") => {
                    debug!("device authorization pending");
                }
                Some("slow_down") => {
                    interval += 5;
                    debug!(interval, "server asked to slow down");
                }
                Some("expired_token") => return Err(AuthError::DeviceCodeExpired),
                Some("access_denied") => return Err(AuthError::AccessDenied),
                Some(other) => {
                    warn!(error = other, "device token poll failed");
                    return Err(AuthError::DeviceFlow(other.to_string()));
                }
                None => {
                    let (Some(access_token), Some(refresh_token)) =
                        (parsed.access_token, parsed.refresh_token)
                    else {
                        return Err(AuthError::DeviceFlow(
                            "token response missing tokens".to_string(),
                        ));
                    };
                    let expires_at = Utc::now()
                        + chrono::Duration::seconds(parsed.expires_in.unwrap_or(3600) as i64);
                    info!("device authorization complete");
                    return Ok(TokenBundle {
                        access_token,
                        refresh_token,
                        expires_at: Some(expires_at),
                        client_id: Some(client.client_id.clone()),
                        client_secret: Some(client.client_secret.clone()),
                        auth_method: AuthMethod::IdC,
                        profile_arn: None,
                        region: self.region.clone(),
                        provider: Some("BuilderId".to_string()),
                    });
                }
            }

            sleep(Duration::from_secs(interval)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn spawn_oidc_stub(polls_until_grant: usize) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let app = Router::new()
            .route(
                "/client/register",
                post(|| async {
                    Json(serde_json::json!({
                        "clientId": "cid-1",
                        "clientSecret": "secret-1",
                        "clientSecretExpiresAt": 1999999999
                    }))
                }),
            )
            .route(
                "/device_authorization",
                post(|| async {
                    Json(serde_json::json!({
                        "deviceCode": "dev-1",
                        "userCode": "ABCD-1234",
                        "verificationUri": "https://device.sso.example/",
                        "verificationUriComplete": "https://device.sso.example/?code=ABCD-1234",
                        "expiresIn": 600,
                        "interval": 1
                    }))
                }),
            )
            .route(
                "/token",
                post(move || {
                    let hits = hits_clone.clone();
                    async move {
                        let n = hits.fetch_add(1, Ordering::SeqCst);
                        if n + 1 < polls_until_grant {
                            Json(serde_json::json!({"error": "authorization_pending"}))
                        } else {
                            Json(serde_json::json!({
                                "accessToken": "granted-at",
                                "refreshToken": "granted-rt",
                                "expiresIn": 3600
                            }))
                        }
                    }
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), hits)
    }

    #[tokio::test]
    async fn full_device_flow_grants_an_idc_bundle() {
        let (base, hits) = spawn_oidc_stub(2).await;
        let flow =
            DeviceAuthClient::with_base(reqwest::Client::new(), &base, Fingerprint::generate());

        let registered = flow.register_client().await.unwrap();
        assert_eq!(registered.client_id, "cid-1");

        let device = flow.start_device_authorization(&registered).await.unwrap();
        assert_eq!(device.user_code, "ABCD-1234");

        let bundle = flow.poll_token(&registered, &device).await.unwrap();
        assert_eq!(bundle.access_token, "granted-at");
        assert_eq!(bundle.auth_method, AuthMethod::IdC);
        assert_eq!(bundle.provider.as_deref(), Some("BuilderId"));
        assert_eq!(bundle.client_id.as_deref(), Some("cid-1"));
        assert!(hits.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn access_denied_is_fatal() {
        let app = Router::new().route(
            "/token",
            post(|| async { Json(serde_json::json!({"error": "access_denied"})) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let flow = DeviceAuthClient::with_base(
            reqwest::Client::new(),
            &format!("http://{addr}"),
            Fingerprint::generate(),
        );
        let registered = RegisteredClient {
            client_id: "c".into(),
            client_secret: "s".into(),
            client_secret_expires_at: None,
        };
        let device = DeviceAuthorization {
            device_code: "d".into(),
            user_code: "u".into(),
            verification_uri: "v".into(),
            verification_uri_complete: None,
            expires_in: 60,
            interval: 1,
        };
        assert!(matches!(
            flow.poll_token(&registered, &device).await,
            Err(AuthError::AccessDenied)
        ));
    }
}
