//! Credential bundles and their on-disk JSON files.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::AuthError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AuthMethod {
    #[default]
    #[serde(rename = "social")]
    Social,
    #[serde(rename = "idc", alias = "IdC")]
    IdC,
}

/// One persisted credential bundle. Field names match the JSON the Kiro
/// desktop client writes, so its files import unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBundle {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub auth_method: AuthMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl TokenBundle {
    /// Seconds until expiry; negative when already past. `None` expiry is
    /// treated as expired so a refresh gets attempted promptly.
    pub fn seconds_to_expiry(&self) -> i64 {
        match self.expires_at {
            Some(at) => (at - Utc::now()).num_seconds(),
            None => -1,
        }
    }
}

/// Read a bundle file. A missing or unparseable file is "absent", not an
/// error — the caller decides whether absence is fatal.
pub fn read_bundle(path: &Path) -> Option<TokenBundle> {
    let data = match std::fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read credential file");
            return None;
        }
    };
    match serde_json::from_str(&data) {
        Ok(bundle) => Some(bundle),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "credential file is not valid JSON, treating as absent");
            None
        }
    }
}

/// Decode a base64 bundle (the `KIRO_OAUTH_CREDS_BASE64` bootstrap path).
pub fn bundle_from_base64(encoded: &str) -> Result<TokenBundle, AuthError> {
    use base64::Engine;
    let raw = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| AuthError::Parse(format!("invalid base64 credentials: {e}")))?;
    serde_json::from_slice(&raw).map_err(|e| AuthError::Parse(format!("invalid credential JSON: {e}")))
}

/// One credential bundle bound to its file: the in-memory copy is the
/// overlay, writes merge the delta back into whatever the file holds.
pub struct CredentialStore {
    path: PathBuf,
    bundle: RwLock<TokenBundle>,
    /// Serializes writers for this path.
    write_lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>, bundle: TokenBundle) -> Self {
        Self {
            path: path.into(),
            bundle: RwLock::new(bundle),
            write_lock: Mutex::new(()),
        }
    }

    /// Open an existing credential file.
    pub fn open(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        let bundle = read_bundle(&path)?;
        Some(Self::new(path, bundle))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn bundle(&self) -> TokenBundle {
        self.bundle.read().await.clone()
    }

    /// Merge `delta` over the in-memory bundle and the file contents, then
    /// persist pretty-printed. Missing file is created; a corrupt file is
    /// replaced by the merged in-memory state.
    pub async fn merge_write(&self, delta: Value) -> Result<(), AuthError> {
        let _writer = self.write_lock.lock().await;

        let memory = self.bundle.read().await.clone();
        let mut disk: Value = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|d| serde_json::from_str(&d).ok())
            .unwrap_or_else(|| serde_json::to_value(&memory).unwrap_or(Value::Null));
        if !disk.is_object() {
            disk = Value::Object(Default::default());
        }

        if let (Value::Object(base), Value::Object(patch)) = (&mut disk, &delta) {
            for (k, v) in patch {
                base.insert(k.clone(), v.clone());
            }
        }

        // refresh the in-memory overlay from the merged document
        match serde_json::from_value::<TokenBundle>(disk.clone()) {
            Ok(merged) => *self.bundle.write().await = merged,
            Err(e) => {
                return Err(AuthError::Parse(format!(
                    "merged credential document is invalid: {e}"
                )))
            }
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let pretty = serde_json::to_string_pretty(&disk)
            .map_err(|e| AuthError::Parse(e.to_string()))?;
        std::fs::write(&self.path, pretty)?;
        debug!(path = %self.path.display(), "credential file updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bundle() -> TokenBundle {
        TokenBundle {
            access_token: "at-1".into(),
            refresh_token: "rt-1".into(),
            expires_at: Some(Utc::now()),
            client_id: None,
            client_secret: None,
            auth_method: AuthMethod::Social,
            profile_arn: None,
            region: "us-east-1".into(),
            provider: None,
        }
    }

    #[test]
    fn bundle_json_uses_camel_case() {
        let json = serde_json::to_string(&bundle()).unwrap();
        assert!(json.contains("\"accessToken\":\"at-1\""));
        assert!(json.contains("\"refreshToken\":\"rt-1\""));
        assert!(json.contains("\"authMethod\":\"social\""));
    }

    #[test]
    fn idc_alias_is_accepted() {
        let parsed: TokenBundle = serde_json::from_value(json!({
            "accessToken": "a",
            "refreshToken": "r",
            "authMethod": "IdC"
        }))
        .unwrap();
        assert_eq!(parsed.auth_method, AuthMethod::IdC);
        assert_eq!(parsed.region, "us-east-1");
    }

    #[test]
    fn unreadable_file_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        assert!(read_bundle(&path).is_none());
        std::fs::write(&path, "{ not json").unwrap();
        assert!(read_bundle(&path).is_none());
    }

    #[tokio::test]
    async fn merge_write_preserves_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        std::fs::write(
            &path,
            serde_json::to_string_pretty(&json!({
                "accessToken": "old",
                "refreshToken": "rt-1",
                "authMethod": "social",
                "customNote": "keep me"
            }))
            .unwrap(),
        )
        .unwrap();

        let store = CredentialStore::open(&path).unwrap();
        store
            .merge_write(json!({"accessToken": "new-token"}))
            .await
            .unwrap();

        let on_disk: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk["accessToken"], "new-token");
        assert_eq!(on_disk["customNote"], "keep me");
        assert_eq!(store.bundle().await.access_token, "new-token");
    }

    #[tokio::test]
    async fn merge_write_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("creds.json");
        let store = CredentialStore::new(&path, bundle());
        store.merge_write(json!({"accessToken": "fresh"})).await.unwrap();
        assert!(path.exists());
        assert_eq!(read_bundle(&path).unwrap().access_token, "fresh");
    }

    #[test]
    fn base64_bootstrap_round_trips() {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(serde_json::to_vec(&bundle()).unwrap());
        let decoded = bundle_from_base64(&encoded).unwrap();
        assert_eq!(decoded.access_token, "at-1");
        assert!(bundle_from_base64("!!!").is_err());
    }
}
