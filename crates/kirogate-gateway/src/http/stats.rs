use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Serialize;
use serde_json::{json, Value};

use kirogate_pool::Account;

use crate::app::AppState;

#[derive(Serialize)]
struct AccountStats {
    uuid: String,
    state: kirogate_pool::AccountState,
    usage_count: u64,
    error_count: u32,
    last_used: Option<chrono::DateTime<chrono::Utc>>,
    last_error_message: Option<String>,
    not_supported_models: Vec<String>,
    cached_email: Option<String>,
}

impl From<Account> for AccountStats {
    fn from(a: Account) -> Self {
        Self {
            state: a.state(),
            uuid: a.uuid,
            usage_count: a.usage_count,
            error_count: a.error_count,
            last_used: a.last_used,
            last_error_message: a.last_error_message,
            not_supported_models: a.not_supported_models.into_iter().collect(),
            cached_email: a.cached_email,
        }
    }
}

/// GET /stats — pool counts plus per-account usage. Credential paths stay
/// server-side.
pub async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let counts = state.pool.counts().await;
    let accounts: Vec<AccountStats> = state
        .pool
        .snapshot()
        .await
        .into_iter()
        .map(AccountStats::from)
        .collect();
    Json(json!({
        "counts": counts,
        "accounts": accounts,
    }))
}
