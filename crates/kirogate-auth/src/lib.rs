//! `kirogate-auth` — Kiro OAuth credential handling.
//!
//! Auth flow:
//!   1. A credential bundle (access + refresh token) arrives via device
//!      authorization, an explicit file path, or a base64 env bootstrap.
//!   2. [`credentials::CredentialStore`] owns one bundle: in-memory
//!      overlay over a JSON file, merge-then-write persistence.
//!   3. [`refresh::RefreshCoordinator`] keeps tokens fresh — per
//!      refresh-token mutual exclusion, a 5-minute expiry window, and a
//!      30-second attempt debounce.
//!   4. [`device`] runs the IAM Identity Center device-authorization
//!      bootstrap for new accounts.

pub mod credentials;
pub mod device;
pub mod fingerprint;
pub mod refresh;

pub use credentials::{AuthMethod, CredentialStore, TokenBundle};
pub use fingerprint::Fingerprint;
pub use refresh::RefreshCoordinator;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("token is expired and a refresh was attempted too recently")]
    TokenExpired,

    #[error("credential parse error: {0}")]
    Parse(String),

    #[error("credential file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device authorization failed: {0}")]
    DeviceFlow(String),

    #[error("device authorization denied by the user")]
    AccessDenied,

    #[error("device authorization code expired before approval")]
    DeviceCodeExpired,
}
