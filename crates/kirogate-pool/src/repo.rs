//! Account persistence seam.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::account::Account;

#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn load(&self) -> Vec<Account>;
    /// Persist the whole pool. Implementations may debounce; writes must
    /// be atomic (readers never observe a torn file).
    async fn persist(&self, accounts: Vec<Account>);
    /// Force any debounced write to disk now.
    async fn flush(&self);
}

/// Keeps everything in memory — tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryRepo {
    seed: Mutex<Vec<Account>>,
}

impl MemoryRepo {
    pub fn new(seed: Vec<Account>) -> Self {
        Self {
            seed: Mutex::new(seed),
        }
    }
}

#[async_trait]
impl AccountRepository for MemoryRepo {
    async fn load(&self) -> Vec<Account> {
        self.seed.lock().await.clone()
    }

    async fn persist(&self, accounts: Vec<Account>) {
        *self.seed.lock().await = accounts;
    }

    async fn flush(&self) {}
}

struct JsonFileInner {
    path: PathBuf,
    debounce: Duration,
    pending: Mutex<Option<Vec<Account>>>,
    flush_scheduled: AtomicBool,
}

/// JSON-file repository with a debounced atomic writer: snapshots queue in
/// `pending`, one background task per burst sleeps out the debounce window
/// and writes the latest snapshot via temp-file + rename.
pub struct JsonFileRepo {
    inner: Arc<JsonFileInner>,
}

impl JsonFileRepo {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_debounce(path, Duration::from_secs(1))
    }

    pub fn with_debounce(path: impl Into<PathBuf>, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(JsonFileInner {
                path: path.into(),
                debounce,
                pending: Mutex::new(None),
                flush_scheduled: AtomicBool::new(false),
            }),
        }
    }

    fn write_atomic(path: &Path, accounts: &[Account]) {
        let json = match serde_json::to_string_pretty(accounts) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "cannot serialize account pool");
                return;
            }
        };
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        if let Err(e) = std::fs::create_dir_all(dir) {
            warn!(error = %e, "cannot create pool directory");
            return;
        }
        let tmp = match tempfile::NamedTempFile::new_in(dir) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "cannot create temp pool file");
                return;
            }
        };
        if let Err(e) = std::fs::write(tmp.path(), json) {
            warn!(error = %e, "cannot write temp pool file");
            return;
        }
        if let Err(e) = tmp.persist(path) {
            warn!(error = %e, "cannot replace pool file");
            return;
        }
        debug!(path = %path.display(), "account pool persisted");
    }

    async fn drain(inner: &JsonFileInner) {
        let snapshot = inner.pending.lock().await.take();
        if let Some(accounts) = snapshot {
            Self::write_atomic(&inner.path, &accounts);
        }
    }
}

#[async_trait]
impl AccountRepository for JsonFileRepo {
    async fn load(&self) -> Vec<Account> {
        let data = match std::fs::read_to_string(&self.inner.path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %self.inner.path.display(), error = %e, "cannot read pool file");
                return Vec::new();
            }
        };
        match serde_json::from_str(&data) {
            Ok(accounts) => accounts,
            Err(e) => {
                warn!(path = %self.inner.path.display(), error = %e, "pool file is not valid JSON");
                Vec::new()
            }
        }
    }

    async fn persist(&self, accounts: Vec<Account>) {
        *self.inner.pending.lock().await = Some(accounts);

        if self.inner.flush_scheduled.swap(true, Ordering::SeqCst) {
            return; // a writer is already sleeping out the window
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.debounce).await;
            inner.flush_scheduled.store(false, Ordering::SeqCst);
            JsonFileRepo::drain(&inner).await;
        });
    }

    async fn flush(&self) {
        Self::drain(&self.inner).await;
    }
}
