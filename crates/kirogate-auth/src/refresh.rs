//! Debounced, per-refresh-token token rotation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::credentials::{AuthMethod, CredentialStore};
use crate::AuthError;

/// Refresh when the token expires within this window.
pub const EXPIRE_WINDOW: Duration = Duration::from_secs(5 * 60);
/// Minimum spacing between refresh attempts for one refresh token.
pub const REFRESH_DEBOUNCE: Duration = Duration::from_secs(30);

#[derive(Default)]
struct RefreshSlot {
    last_attempt: Option<Instant>,
}

/// Owns the per-refresh-token mutexes. Two concurrent callers sharing a
/// refresh token serialize here and the second observes the first's
/// result; distinct tokens refresh in parallel.
pub struct RefreshCoordinator {
    client: reqwest::Client,
    slots: DashMap<String, Arc<Mutex<RefreshSlot>>>,
    social_base: String,
    oidc_base: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    profile_arn: Option<String>,
}

impl RefreshCoordinator {
    pub fn new(client: reqwest::Client, region: &str) -> Self {
        Self {
            client,
            slots: DashMap::new(),
            social_base: format!("https://prod.{region}.auth.desktop.kiro.dev"),
            oidc_base: format!("https://oidc.{region}.amazonaws.com"),
        }
    }

    /// Override endpoints — tests point these at a local counter server.
    pub fn with_endpoints(
        client: reqwest::Client,
        social_base: impl Into<String>,
        oidc_base: impl Into<String>,
    ) -> Self {
        Self {
            client,
            slots: DashMap::new(),
            social_base: social_base.into(),
            oidc_base: oidc_base.into(),
        }
    }

    /// Return a usable access token, refreshing when the bundle expires
    /// within [`EXPIRE_WINDOW`].
    pub async fn ensure_fresh(&self, store: &CredentialStore) -> Result<String, AuthError> {
        let bundle = store.bundle().await;
        if bundle.seconds_to_expiry() > EXPIRE_WINDOW.as_secs() as i64 {
            return Ok(bundle.access_token);
        }

        let slot = self
            .slots
            .entry(bundle.refresh_token.clone())
            .or_insert_with(|| Arc::new(Mutex::new(RefreshSlot::default())))
            .clone();
        let mut slot = slot.lock().await;

        // A concurrent caller may have finished the refresh while we
        // waited on the slot.
        let bundle = store.bundle().await;
        let remaining = bundle.seconds_to_expiry();
        if remaining > EXPIRE_WINDOW.as_secs() as i64 {
            return Ok(bundle.access_token);
        }

        if let Some(at) = slot.last_attempt {
            if at.elapsed() < REFRESH_DEBOUNCE {
                debug!("refresh debounced");
                return if remaining > 0 {
                    Ok(bundle.access_token)
                } else {
                    Err(AuthError::TokenExpired)
                };
            }
        }
        slot.last_attempt = Some(Instant::now());

        info!(method = ?bundle.auth_method, "refreshing Kiro access token");

        let response = match bundle.auth_method {
            AuthMethod::Social => {
                self.client
                    .post(format!("{}/refreshToken", self.social_base))
                    .json(&json!({ "refreshToken": bundle.refresh_token }))
                    .send()
                    .await?
            }
            AuthMethod::IdC => {
                self.client
                    .post(format!("{}/token", self.oidc_base))
                    .json(&json!({
                        "refreshToken": bundle.refresh_token,
                        "clientId": bundle.client_id,
                        "clientSecret": bundle.client_secret,
                        "grantType": "refresh_token",
                    }))
                    .send()
                    .await?
            }
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            warn!(status, body = %body, "token refresh rejected");
            return Err(AuthError::RefreshFailed(format!("HTTP {status}: {body}")));
        }

        let parsed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| AuthError::RefreshFailed(format!("unparseable response: {e}")))?;

        let Some(access_token) = parsed.access_token else {
            return Err(AuthError::RefreshFailed(
                "response carried no accessToken".to_string(),
            ));
        };

        let expires_at = match (parsed.expires_in, parsed.expires_at) {
            (Some(secs), _) => Utc::now() + chrono::Duration::seconds(secs as i64),
            (None, Some(at)) => at,
            (None, None) => Utc::now() + chrono::Duration::hours(1),
        };

        let mut delta = json!({
            "accessToken": access_token,
            "expiresAt": expires_at,
        });
        if let Some(rt) = parsed.refresh_token {
            delta["refreshToken"] = json!(rt);
        }
        if let Some(arn) = parsed.profile_arn {
            delta["profileArn"] = json!(arn);
        }
        store.merge_write(delta).await?;

        debug!("access token refreshed");
        Ok(access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::TokenBundle;
    use axum::{routing::post, Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn expired_bundle(refresh_token: &str, dir: &std::path::Path) -> CredentialStore {
        let bundle = TokenBundle {
            access_token: "stale".into(),
            refresh_token: refresh_token.into(),
            expires_at: Some(Utc::now() - chrono::Duration::seconds(10)),
            client_id: None,
            client_secret: None,
            auth_method: AuthMethod::Social,
            profile_arn: None,
            region: "us-east-1".into(),
            provider: None,
        };
        CredentialStore::new(dir.join(format!("{refresh_token}.json")), bundle)
    }

    async fn spawn_refresh_server(hits: Arc<AtomicUsize>) -> String {
        let app = Router::new().route(
            "/refreshToken",
            post(move || {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!({
                        "accessToken": "fresh-token",
                        "expiresIn": 3600
                    }))
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
    async fn concurrent_same_token_refreshes_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = spawn_refresh_server(hits.clone()).await;
        let coordinator =
            RefreshCoordinator::with_endpoints(reqwest::Client::new(), base.clone(), base);
        let dir = tempfile::tempdir().unwrap();
        let store = expired_bundle("rt-shared", dir.path());

        let (a, b) = tokio::join!(
            coordinator.ensure_fresh(&store),
            coordinator.ensure_fresh(&store)
        );
        assert_eq!(a.unwrap(), "fresh-token");
        assert_eq!(b.unwrap(), "fresh-token");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_tokens_refresh_independently() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = spawn_refresh_server(hits.clone()).await;
        let coordinator =
            RefreshCoordinator::with_endpoints(reqwest::Client::new(), base.clone(), base);
        let dir = tempfile::tempdir().unwrap();
        let store_a = expired_bundle("rt-a", dir.path());
        let store_b = expired_bundle("rt-b", dir.path());

        let (a, b) = tokio::join!(
            coordinator.ensure_fresh(&store_a),
            coordinator.ensure_fresh(&store_b)
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fresh_token_skips_the_network() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = spawn_refresh_server(hits.clone()).await;
        let coordinator =
            RefreshCoordinator::with_endpoints(reqwest::Client::new(), base.clone(), base);
        let dir = tempfile::tempdir().unwrap();

        let bundle = TokenBundle {
            access_token: "still-good".into(),
            refresh_token: "rt".into(),
            expires_at: Some(Utc::now() + chrono::Duration::hours(2)),
            client_id: None,
            client_secret: None,
            auth_method: AuthMethod::Social,
            profile_arn: None,
            region: "us-east-1".into(),
            provider: None,
        };
        let store = CredentialStore::new(dir.path().join("c.json"), bundle);

        assert_eq!(coordinator.ensure_fresh(&store).await.unwrap(), "still-good");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn debounce_raises_token_expired_after_failed_attempt() {
        // server that always 500s
        let app = Router::new().route(
            "/refreshToken",
            post(|| async {
                (
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    "broken".to_string(),
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let base = format!("http://{addr}");

        let coordinator =
            RefreshCoordinator::with_endpoints(reqwest::Client::new(), base.clone(), base);
        let dir = tempfile::tempdir().unwrap();
        let store = expired_bundle("rt-x", dir.path());

        // first attempt hits the server and fails
        assert!(matches!(
            coordinator.ensure_fresh(&store).await,
            Err(AuthError::RefreshFailed(_))
        ));
        // second attempt inside the debounce window: token is already past
        // expiry, so the caller gets TokenExpired without a network call
        assert!(matches!(
            coordinator.ensure_fresh(&store).await,
            Err(AuthError::TokenExpired)
        ));
    }
}
