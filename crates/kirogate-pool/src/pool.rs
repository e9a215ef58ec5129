//! Account selection and health bookkeeping.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::account::{Account, AccountState};
use crate::classify::{Classified, Disposition};
use crate::repo::AccountRepository;

/// Round-robin bucket key for requests without a model.
const DEFAULT_BUCKET: &str = "default";

#[derive(Debug, Clone, Serialize)]
pub struct PoolCounts {
    pub healthy: usize,
    pub checking: usize,
    pub banned: usize,
    pub total: usize,
}

pub struct AccountPool {
    accounts: RwLock<Vec<Account>>,
    /// Per-model rotation cursors.
    cursors: DashMap<String, AtomicUsize>,
    repo: Arc<dyn AccountRepository>,
    max_error_count: u32,
}

impl AccountPool {
    pub async fn load(repo: Arc<dyn AccountRepository>, max_error_count: u32) -> Self {
        let accounts = repo.load().await;
        info!(accounts = accounts.len(), "account pool loaded");
        Self {
            accounts: RwLock::new(accounts),
            cursors: DashMap::new(),
            repo,
            max_error_count,
        }
    }

    /// Register an account if its credential ref is not already pooled.
    pub async fn register(&self, account: Account) {
        let mut accounts = self.accounts.write().await;
        if accounts
            .iter()
            .any(|a| a.credential_ref == account.credential_ref)
        {
            return;
        }
        info!(uuid = %account.uuid, credential = %account.credential_ref, "account registered");
        accounts.push(account);
        self.repo.persist(accounts.clone()).await;
    }

    /// Round-robin selection over the healthy candidates for `model`.
    /// The chosen account's `lastUsed`/`usageCount` are bumped under the
    /// pool lock, so two concurrent selections never miss an increment.
    pub async fn select(&self, model: Option<&str>) -> Option<Account> {
        let bucket = model.unwrap_or(DEFAULT_BUCKET).to_string();
        let mut accounts = self.accounts.write().await;

        let candidates: Vec<usize> = accounts
            .iter()
            .enumerate()
            .filter(|(_, a)| a.accepts(model.unwrap_or("")))
            .map(|(i, _)| i)
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let cursor = self
            .cursors
            .entry(bucket)
            .or_insert_with(|| AtomicUsize::new(0));
        let pick = candidates[cursor.fetch_add(1, Ordering::Relaxed) % candidates.len()];

        let account = &mut accounts[pick];
        account.last_used = Some(Utc::now());
        account.usage_count += 1;
        let selected = account.clone();

        self.repo.persist(accounts.clone()).await;
        Some(selected)
    }

    /// Fold a classified failure into the account's counters:
    /// client faults and rate limits leave the account untouched, fatal
    /// errors flip it unhealthy immediately, the rest count toward the
    /// threshold.
    pub async fn record_failure(&self, uuid: &str, classified: &Classified) {
        match classified.disposition {
            Disposition::ClientFault | Disposition::RateLimited => return,
            _ => {}
        }

        let mut accounts = self.accounts.write().await;
        let Some(account) = accounts.iter_mut().find(|a| a.uuid == uuid) else {
            return;
        };

        account.error_count += 1;
        account.last_error_time = Some(Utc::now());
        account.last_error_message = Some(classified.message.clone());

        let fatal = classified.disposition == Disposition::Fatal;
        if fatal || account.error_count >= self.max_error_count {
            if account.is_healthy {
                warn!(
                    uuid = %account.uuid,
                    fatal,
                    errors = account.error_count,
                    error = %classified.message,
                    "account marked unhealthy"
                );
            }
            account.is_healthy = false;
        }

        self.repo.persist(accounts.clone()).await;
    }

    /// Model-specific rejection: remember the model so selection skips
    /// this account for it, without global health damage.
    pub async fn mark_model_unsupported(&self, uuid: &str, model: &str) {
        let mut accounts = self.accounts.write().await;
        if let Some(account) = accounts.iter_mut().find(|a| a.uuid == uuid) {
            account.not_supported_models.insert(model.to_string());
            self.repo.persist(accounts.clone()).await;
        }
    }

    /// Reset an account to clean health (manual action or probe success).
    pub async fn mark_healthy(&self, uuid: &str, probe_model: Option<&str>) {
        let mut accounts = self.accounts.write().await;
        let Some(account) = accounts.iter_mut().find(|a| a.uuid == uuid) else {
            return;
        };
        account.is_healthy = true;
        account.error_count = 0;
        account.last_error_time = None;
        account.last_error_message = None;
        account.last_health_check_time = Some(Utc::now());
        account.last_health_check_model = probe_model.map(str::to_string);
        info!(uuid = %account.uuid, "account marked healthy");
        self.repo.persist(accounts.clone()).await;
    }

    pub async fn set_cached_identity(&self, uuid: &str, email: Option<String>, user_id: Option<String>) {
        let mut accounts = self.accounts.write().await;
        if let Some(account) = accounts.iter_mut().find(|a| a.uuid == uuid) {
            if email.is_some() {
                account.cached_email = email;
            }
            if user_id.is_some() {
                account.cached_user_id = user_id;
            }
            self.repo.persist(accounts.clone()).await;
        }
    }

    pub async fn snapshot(&self) -> Vec<Account> {
        self.accounts.read().await.clone()
    }

    pub async fn counts(&self) -> PoolCounts {
        let accounts = self.accounts.read().await;
        let mut counts = PoolCounts {
            healthy: 0,
            checking: 0,
            banned: 0,
            total: accounts.len(),
        };
        for a in accounts.iter() {
            match a.state() {
                AccountState::Healthy => counts.healthy += 1,
                AccountState::Checking => counts.checking += 1,
                AccountState::Banned => counts.banned += 1,
            }
        }
        counts
    }

    pub async fn flush(&self) {
        self.repo.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify;
    use crate::repo::MemoryRepo;

    async fn pool_with(n: usize) -> AccountPool {
        let accounts: Vec<Account> = (0..n).map(|i| Account::new(format!("cred-{i}.json"))).collect();
        AccountPool::load(Arc::new(MemoryRepo::new(accounts)), 3).await
    }

    #[tokio::test]
    async fn round_robin_rotates_per_model() {
        let pool = pool_with(3).await;
        let first = pool.select(Some("m")).await.unwrap();
        let second = pool.select(Some("m")).await.unwrap();
        let third = pool.select(Some("m")).await.unwrap();
        let fourth = pool.select(Some("m")).await.unwrap();
        assert_ne!(first.uuid, second.uuid);
        assert_ne!(second.uuid, third.uuid);
        assert_eq!(first.uuid, fourth.uuid);
    }

    #[tokio::test]
    async fn selection_bumps_usage() {
        let pool = pool_with(1).await;
        pool.select(None).await.unwrap();
        pool.select(None).await.unwrap();
        let snap = pool.snapshot().await;
        assert_eq!(snap[0].usage_count, 2);
        assert!(snap[0].last_used.is_some());
    }

    #[tokio::test]
    async fn fatal_flips_unhealthy_and_next_select_skips() {
        let pool = pool_with(2).await;
        let first = pool.select(Some("m")).await.unwrap();

        pool.record_failure(&first.uuid, &classify(Some(403), "Forbidden"))
            .await;

        let snap = pool.snapshot().await;
        let failed = snap.iter().find(|a| a.uuid == first.uuid).unwrap();
        assert!(!failed.is_healthy);
        assert!(failed.error_count >= 1);
        assert!(failed.last_error_message.is_some());

        let second = pool.select(Some("m")).await.unwrap();
        assert_ne!(second.uuid, first.uuid);
    }

    #[tokio::test]
    async fn client_fault_and_rate_limit_leave_counters_alone() {
        let pool = pool_with(1).await;
        let a = pool.select(None).await.unwrap();
        pool.record_failure(&a.uuid, &classify(Some(400), "bad")).await;
        pool.record_failure(&a.uuid, &classify(Some(429), "slow")).await;
        let snap = pool.snapshot().await;
        assert_eq!(snap[0].error_count, 0);
        assert!(snap[0].is_healthy);
    }

    #[tokio::test]
    async fn error_threshold_flips_health() {
        let pool = pool_with(1).await;
        let a = pool.select(None).await.unwrap();
        for _ in 0..3 {
            pool.record_failure(&a.uuid, &classify(None, "mystery")).await;
        }
        let snap = pool.snapshot().await;
        assert!(!snap[0].is_healthy);
        assert_eq!(snap[0].error_count, 3);
    }

    #[tokio::test]
    async fn mark_healthy_resets_counters() {
        let pool = pool_with(1).await;
        let a = pool.select(None).await.unwrap();
        for _ in 0..3 {
            pool.record_failure(&a.uuid, &classify(None, "x")).await;
        }
        pool.mark_healthy(&a.uuid, Some("claude-sonnet-4-20250514")).await;
        let snap = pool.snapshot().await;
        assert!(snap[0].is_healthy);
        assert_eq!(snap[0].error_count, 0);
        assert!(snap[0].last_error_message.is_none());
        assert_eq!(
            snap[0].last_health_check_model.as_deref(),
            Some("claude-sonnet-4-20250514")
        );
    }

    #[tokio::test]
    async fn unsupported_model_gates_only_that_model() {
        let pool = pool_with(1).await;
        let a = pool.select(Some("model-a")).await.unwrap();
        pool.mark_model_unsupported(&a.uuid, "model-a").await;
        assert!(pool.select(Some("model-a")).await.is_none());
        assert!(pool.select(Some("model-b")).await.is_some());
    }

    #[tokio::test]
    async fn empty_pool_selects_nothing() {
        let pool = pool_with(0).await;
        assert!(pool.select(None).await.is_none());
    }

    #[tokio::test]
    async fn counts_reflect_states() {
        let pool = pool_with(3).await;
        let snap = pool.snapshot().await;
        pool.record_failure(&snap[0].uuid, &classify(Some(403), "forbidden")).await;
        pool.record_failure(&snap[1].uuid, &classify(None, "odd")).await;
        let counts = pool.counts().await;
        assert_eq!(counts.total, 3);
        assert_eq!(counts.banned, 1);
        assert_eq!(counts.checking, 1);
        assert_eq!(counts.healthy, 1);
    }
}
