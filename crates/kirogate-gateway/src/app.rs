use std::sync::Arc;
use std::time::Instant;

use axum::{
    routing::{get, post},
    Router,
};
use dashmap::DashMap;
use tokio::sync::RwLock;

use kirogate_auth::{CredentialStore, RefreshCoordinator};
use kirogate_core::config::GatewayConfig;
use kirogate_pool::AccountPool;
use kirogate_translate::prune::AiSummaryState;
use kirogate_upstream::usage::UsageSnapshot;
use kirogate_upstream::UpstreamClient;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub pool: AccountPool,
    pub refresher: RefreshCoordinator,
    pub upstream: Arc<UpstreamClient>,
    /// Credential stores keyed by credential ref, opened lazily so each
    /// file has exactly one writer-serializing store per process.
    pub stores: DashMap<String, Arc<CredentialStore>>,
    /// Globally configured bundle used when the pool has no candidate.
    pub fallback: Option<Arc<CredentialStore>>,
    /// Cached `/usage` snapshot with its fetch time.
    pub usage_cache: RwLock<Option<(Instant, UsageSnapshot)>>,
    pub ai_summary: AiSummaryState,
    pub started_at: Instant,
}

impl AppState {
    /// Store for a pooled account's credential file. `None` when the file
    /// is missing or unreadable — callers treat that as account failure.
    pub fn store_for(&self, credential_ref: &str) -> Option<Arc<CredentialStore>> {
        if let Some(existing) = self.stores.get(credential_ref) {
            return Some(existing.clone());
        }
        let store = Arc::new(CredentialStore::open(credential_ref)?);
        self.stores
            .insert(credential_ref.to_string(), store.clone());
        Some(store)
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/messages", post(crate::http::messages::messages_handler))
        .route("/health", get(crate::http::health::health_handler))
        .route("/stats", get(crate::http::stats::stats_handler))
        .route("/usage", get(crate::http::usage::usage_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
