use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_REGION: &str = "us-east-1";
/// Upstream model id used when the client's model is not in the mapping table.
pub const DEFAULT_UPSTREAM_MODEL: &str = "CLAUDE_SONNET_4_20250514_V1_0";
/// Model used for account health probes.
pub const DEFAULT_PROBE_MODEL: &str = "claude-sonnet-4-20250514";

/// Environment keys recognized as overrides. Anything else in the process
/// environment is ignored.
const ENV_KEYS: &[&str] = &[
    "required_api_key",
    "server_port",
    "host",
    "kiro_oauth_creds_file_path",
    "kiro_oauth_creds_base64",
    "account_pool_file_path",
    "max_error_count",
    "request_max_retries",
    "request_base_delay",
    "cron_near_minutes",
    "cron_refresh_token",
    "enable_thinking_by_default",
    "use_system_proxy_kiro",
    "enable_verbose_logging",
    "kiro_region",
    "health_check_model",
];

/// Top-level gateway configuration (kirogate.toml + env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Bearer token clients must present on `/v1/messages`. `None` disables
    /// the check (local use only).
    #[serde(default)]
    pub required_api_key: Option<String>,
    #[serde(default = "default_port")]
    pub server_port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Single-credential bootstrap: explicit bundle file path.
    #[serde(default)]
    pub kiro_oauth_creds_file_path: Option<String>,
    /// Single-credential bootstrap: base64-encoded bundle JSON.
    #[serde(default)]
    pub kiro_oauth_creds_base64: Option<String>,
    #[serde(default = "default_pool_path")]
    pub account_pool_file_path: String,
    /// Consecutive error threshold flipping an account unhealthy.
    #[serde(default = "default_max_error_count")]
    pub max_error_count: u32,
    #[serde(default = "default_max_retries")]
    pub request_max_retries: u32,
    /// Base backoff delay in milliseconds for 429/5xx/socket retries.
    #[serde(default = "default_base_delay")]
    pub request_base_delay: u64,
    /// Periodic refresh scan: refresh bundles expiring within this window.
    #[serde(default = "default_cron_near")]
    pub cron_near_minutes: u64,
    #[serde(default = "bool_true")]
    pub cron_refresh_token: bool,
    #[serde(default)]
    pub enable_thinking_by_default: bool,
    #[serde(default = "bool_true")]
    pub use_system_proxy_kiro: bool,
    #[serde(default)]
    pub enable_verbose_logging: bool,
    #[serde(default = "default_region")]
    pub kiro_region: String,
    #[serde(default = "default_probe_model")]
    pub health_check_model: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            required_api_key: None,
            server_port: DEFAULT_PORT,
            host: DEFAULT_HOST.to_string(),
            kiro_oauth_creds_file_path: None,
            kiro_oauth_creds_base64: None,
            account_pool_file_path: default_pool_path(),
            max_error_count: default_max_error_count(),
            request_max_retries: default_max_retries(),
            request_base_delay: default_base_delay(),
            cron_near_minutes: default_cron_near(),
            cron_refresh_token: true,
            enable_thinking_by_default: false,
            use_system_proxy_kiro: true,
            enable_verbose_logging: false,
            kiro_region: DEFAULT_REGION.to_string(),
            health_check_model: DEFAULT_PROBE_MODEL.to_string(),
        }
    }
}

impl GatewayConfig {
    /// Load config from a TOML file with flat env-var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. KIROGATE_CONFIG env var
    ///   3. ./kirogate.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("KIROGATE_CONFIG").ok())
            .unwrap_or_else(|| "kirogate.toml".to_string());

        let config: GatewayConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(
                Env::raw()
                    .map(|key| key.as_str().to_ascii_lowercase().into())
                    .only(ENV_KEYS),
            )
            .extract()
            .map_err(|e| crate::error::GatewayError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_host() -> String {
    DEFAULT_HOST.to_string()
}
fn default_pool_path() -> String {
    "configs/accounts.json".to_string()
}
fn default_max_error_count() -> u32 {
    3
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    1000
}
fn default_cron_near() -> u64 {
    5
}
fn default_region() -> String {
    DEFAULT_REGION.to_string()
}
fn default_probe_model() -> String {
    DEFAULT_PROBE_MODEL.to_string()
}
fn bool_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.server_port, 8080);
        assert_eq!(cfg.max_error_count, 3);
        assert_eq!(cfg.request_max_retries, 3);
        assert_eq!(cfg.request_base_delay, 1000);
        assert!(cfg.cron_refresh_token);
        assert!(!cfg.enable_thinking_by_default);
        assert_eq!(cfg.health_check_model, DEFAULT_PROBE_MODEL);
    }

    #[test]
    fn deserializes_partial_toml() {
        let cfg: GatewayConfig =
            toml::from_str("required_api_key = \"sk-test\"\nserver_port = 9090\n").unwrap();
        assert_eq!(cfg.required_api_key.as_deref(), Some("sk-test"));
        assert_eq!(cfg.server_port, 9090);
        assert_eq!(cfg.host, DEFAULT_HOST);
    }
}
