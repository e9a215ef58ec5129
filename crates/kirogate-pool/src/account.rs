//! Pool account model.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountState {
    /// Usable and clean: healthy, enabled, zero errors.
    Healthy,
    /// Usable but probationary: healthy with recent errors.
    Checking,
    /// Not selectable: unhealthy or disabled.
    Banned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub uuid: String,
    /// Path (or opaque id) of the credential bundle backing this account.
    pub credential_ref: String,
    #[serde(default = "bool_true")]
    pub is_healthy: bool,
    #[serde(default)]
    pub is_disabled: bool,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_check_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_check_model: Option<String>,
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub not_supported_models: HashSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_user_id: Option<String>,
}

fn bool_true() -> bool {
    true
}

impl Account {
    pub fn new(credential_ref: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            credential_ref: credential_ref.into(),
            is_healthy: true,
            is_disabled: false,
            usage_count: 0,
            error_count: 0,
            last_used: None,
            last_error_time: None,
            last_error_message: None,
            last_health_check_time: None,
            last_health_check_model: None,
            not_supported_models: HashSet::new(),
            cached_email: None,
            cached_user_id: None,
        }
    }

    pub fn state(&self) -> AccountState {
        if !self.is_healthy || self.is_disabled {
            AccountState::Banned
        } else if self.error_count > 0 {
            AccountState::Checking
        } else {
            AccountState::Healthy
        }
    }

    /// Selectable for `model`: healthy, enabled, and the model is not on
    /// the account's unsupported list.
    pub fn accepts(&self, model: &str) -> bool {
        self.is_healthy && !self.is_disabled && !self.not_supported_models.contains(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_derivation() {
        let mut a = Account::new("configs/kiro/a.json");
        assert_eq!(a.state(), AccountState::Healthy);

        a.error_count = 1;
        assert_eq!(a.state(), AccountState::Checking);

        a.is_healthy = false;
        assert_eq!(a.state(), AccountState::Banned);

        a.is_healthy = true;
        a.error_count = 0;
        a.is_disabled = true;
        assert_eq!(a.state(), AccountState::Banned);
    }

    #[test]
    fn model_support_gates_selection() {
        let mut a = Account::new("x");
        assert!(a.accepts("claude-sonnet-4-20250514"));
        a.not_supported_models
            .insert("claude-sonnet-4-20250514".to_string());
        assert!(!a.accepts("claude-sonnet-4-20250514"));
        assert!(a.accepts("claude-opus-4-20250514"));
    }

    #[test]
    fn serde_defaults_fill_missing_fields() {
        let a: Account = serde_json::from_str(
            r#"{"uuid":"u-1","credentialRef":"configs/kiro/a.json"}"#,
        )
        .unwrap();
        assert!(a.is_healthy);
        assert_eq!(a.error_count, 0);
        assert!(a.not_supported_models.is_empty());
    }
}
