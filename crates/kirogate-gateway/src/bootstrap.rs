//! Startup wiring: credential discovery, pool loading, state assembly.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::{info, warn};

use kirogate_auth::credentials::{bundle_from_base64, read_bundle};
use kirogate_auth::{CredentialStore, Fingerprint, RefreshCoordinator};
use kirogate_core::config::GatewayConfig;
use kirogate_pool::{Account, AccountPool, JsonFileRepo};
use kirogate_translate::prune::AiSummaryState;
use kirogate_upstream::UpstreamClient;

use crate::app::AppState;

/// Directory scanned for importable credential bundles.
const CREDS_DIR: &str = "configs/kiro";

pub async fn build_state(config: GatewayConfig) -> anyhow::Result<Arc<AppState>> {
    let fingerprint = Fingerprint::generate();
    let refresher = RefreshCoordinator::new(reqwest::Client::new(), &config.kiro_region);
    let upstream = Arc::new(UpstreamClient::new(
        &config.kiro_region,
        fingerprint,
        config.use_system_proxy_kiro,
        config.request_max_retries,
    ));

    let repo = Arc::new(JsonFileRepo::new(&config.account_pool_file_path));
    let pool = AccountPool::load(repo, config.max_error_count).await;

    // Register any credential files the pool does not know yet.
    for path in scan_credential_files(CREDS_DIR) {
        if read_bundle(Path::new(&path)).is_some() {
            pool.register(Account::new(&path)).await;
        }
    }

    let fallback = load_fallback_credential(&config);
    if fallback.is_none() && pool.counts().await.total == 0 {
        warn!(
            "no credentials found: set KIRO_OAUTH_CREDS_FILE_PATH, KIRO_OAUTH_CREDS_BASE64, \
             or place bundles under {CREDS_DIR}/"
        );
    }

    Ok(Arc::new(AppState {
        config,
        pool,
        refresher,
        upstream,
        stores: DashMap::new(),
        fallback,
        usage_cache: RwLock::new(None),
        ai_summary: AiSummaryState::new(),
        started_at: Instant::now(),
    }))
}

fn scan_credential_files(dir: &str) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    paths.sort();
    paths
}

fn load_fallback_credential(config: &GatewayConfig) -> Option<Arc<CredentialStore>> {
    if let Some(encoded) = &config.kiro_oauth_creds_base64 {
        match bundle_from_base64(encoded) {
            Ok(bundle) => {
                info!("fallback credential loaded from base64");
                let path = format!("{CREDS_DIR}/bootstrap.json");
                return Some(Arc::new(CredentialStore::new(path, bundle)));
            }
            Err(e) => warn!(error = %e, "KIRO_OAUTH_CREDS_BASE64 is not usable"),
        }
    }
    if let Some(path) = &config.kiro_oauth_creds_file_path {
        match CredentialStore::open(path) {
            Some(store) => {
                info!(path = %path, "fallback credential loaded from file");
                return Some(Arc::new(store));
            }
            None => warn!(path = %path, "KIRO_OAUTH_CREDS_FILE_PATH is not usable"),
        }
    }
    None
}
