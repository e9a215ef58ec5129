use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tracing::warn;

use kirogate_core::GatewayError;

use crate::app::AppState;
use crate::error;

const USAGE_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Deserialize)]
pub struct UsageQuery {
    #[serde(default)]
    refresh: bool,
}

/// GET /usage[?refresh=true] — upstream usage limits, cached for five
/// minutes unless a refresh is forced.
pub async fn usage_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UsageQuery>,
) -> Response {
    if !query.refresh {
        if let Some((at, snapshot)) = state.usage_cache.read().await.clone() {
            if at.elapsed() < USAGE_CACHE_TTL {
                return Json(snapshot).into_response();
            }
        }
    }

    // Read through a healthy account, else the fallback credential. The
    // snapshot path avoids select() so usage checks don't skew rotation.
    let account = state
        .pool
        .snapshot()
        .await
        .into_iter()
        .find(|a| a.is_healthy && !a.is_disabled);

    let (store, account_uuid) = match &account {
        Some(a) => match state.store_for(&a.credential_ref) {
            Some(s) => (s, Some(a.uuid.clone())),
            None => {
                return error::into_response(GatewayError::Internal(
                    "account credentials unreadable".to_string(),
                ))
            }
        },
        None => match &state.fallback {
            Some(s) => (s.clone(), None),
            None => {
                return error::into_response(GatewayError::AuthExpired(
                    "no usable upstream account".to_string(),
                ))
            }
        },
    };

    let token = match state.refresher.ensure_fresh(&store).await {
        Ok(t) => t,
        Err(e) => return error::into_response(GatewayError::AuthExpired(e.to_string())),
    };
    let bundle = store.bundle().await;

    match state
        .upstream
        .get_usage_limits(&token, bundle.profile_arn.as_deref())
        .await
    {
        Ok(snapshot) => {
            if let Some(uuid) = account_uuid {
                state
                    .pool
                    .set_cached_identity(&uuid, snapshot.email.clone(), snapshot.user_id.clone())
                    .await;
            }
            *state.usage_cache.write().await = Some((Instant::now(), snapshot.clone()));
            Json(snapshot).into_response()
        }
        Err(e) => {
            warn!(error = %e, "usage limits fetch failed");
            let (_, gateway_error) = error::from_upstream(&e);
            error::into_response(gateway_error)
        }
    }
}
