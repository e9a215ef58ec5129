//! Periodic credential maintenance.
//!
//! Every `CRON_NEAR_MINUTES` the task walks the pool: bundles expiring
//! within the window are refreshed, and banned (but not disabled)
//! accounts get a one-token health probe. Each step fails soft — a broken
//! account never stalls the scan.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::app::AppState;
use crate::orchestrate::probe_account;

pub fn spawn(state: Arc<AppState>) {
    let near = Duration::from_secs(state.config.cron_near_minutes.max(1) * 60);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(near);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if !state.config.cron_refresh_token {
                continue;
            }
            run_scan(&state, near).await;
        }
    });
}

async fn run_scan(state: &Arc<AppState>, near: Duration) {
    debug!("refresh scan started");

    for account in state.pool.snapshot().await {
        if account.is_disabled {
            continue;
        }
        let Some(store) = state.store_for(&account.credential_ref) else {
            continue;
        };

        let expires_in = store.bundle().await.seconds_to_expiry();
        if expires_in < near.as_secs() as i64 {
            if let Err(e) = state.refresher.ensure_fresh(&store).await {
                warn!(uuid = %account.uuid, error = %e, "scheduled refresh failed");
            }
        }

        if !account.is_healthy {
            probe_account(state.clone(), &account.uuid).await;
        }
    }

    if let Some(store) = &state.fallback {
        if store.bundle().await.seconds_to_expiry() < near.as_secs() as i64 {
            if let Err(e) = state.refresher.ensure_fresh(store).await {
                warn!(error = %e, "fallback credential refresh failed");
            }
        }
    }

    debug!("refresh scan complete");
}
