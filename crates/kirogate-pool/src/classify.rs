//! Upstream-failure classification and the retry decision.
//!
//! HTTP status decides first. The substring heuristics only run when no
//! status is available, and the result logs `string_heuristic = true` so
//! fragile decisions are visible in the field.

use std::time::Duration;

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The client's own fault — surface, leave the account alone.
    ClientFault,
    /// 429 — retry the same account with backoff, never mark unhealthy.
    RateLimited,
    /// Socket/DNS/5xx — retry with backoff, count on exhaustion.
    Transient,
    /// Forbidden / quota / suspended — flip unhealthy immediately.
    Fatal,
    /// Everything else — count toward the error threshold.
    Other,
}

#[derive(Debug, Clone)]
pub struct Classified {
    pub disposition: Disposition,
    pub status: Option<u16>,
    pub message: String,
    /// True when a substring match, not the HTTP status, decided.
    pub string_heuristic: bool,
}

const FATAL_PATTERNS: &[&str] = &[
    "suspended",
    "quota",
    "token is expired",
    "invalid token",
    "unauthorized",
    "forbidden",
];

const TRANSIENT_PATTERNS: &[&str] = &[
    "econnreset",
    "etimedout",
    "enotfound",
    "connection reset",
    "connection closed",
    "timed out",
    "dns error",
];

pub fn classify(status: Option<u16>, message: &str) -> Classified {
    let lower = message.to_lowercase();

    if let Some(code) = status {
        let disposition = match code {
            400 => Disposition::ClientFault,
            429 => Disposition::RateLimited,
            401 | 402 | 403 => Disposition::Fatal,
            500..=599 => Disposition::Transient,
            _ => {
                if FATAL_PATTERNS.iter().any(|p| lower.contains(p)) {
                    return string_decided(status, message, Disposition::Fatal);
                }
                Disposition::Other
            }
        };
        return Classified {
            disposition,
            status,
            message: message.to_string(),
            string_heuristic: false,
        };
    }

    if TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return string_decided(None, message, Disposition::Transient);
    }
    if FATAL_PATTERNS.iter().any(|p| lower.contains(p)) {
        return string_decided(None, message, Disposition::Fatal);
    }
    if lower.contains("bad request") {
        return string_decided(None, message, Disposition::ClientFault);
    }

    Classified {
        disposition: Disposition::Other,
        status: None,
        message: message.to_string(),
        string_heuristic: false,
    }
}

fn string_decided(status: Option<u16>, message: &str, disposition: Disposition) -> Classified {
    debug!(
        ?disposition,
        string_heuristic = true,
        "error classified by substring match"
    );
    Classified {
        disposition,
        status,
        message: message.to_string(),
        string_heuristic: true,
    }
}

/// What the orchestrator does next. Keeping this a pure function keeps the
/// request loop straight-line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    /// Shape into an Anthropic error and answer the client.
    SurfaceToClient,
    /// Retry the same account after the delay (429/5xx with budget left).
    RetrySameAccount { delay: Duration },
    /// Pick a different account and retry immediately.
    RetryOtherAccount,
}

pub fn decide(
    classified: &Classified,
    attempt: u32,
    max_retries: u32,
    base_delay: Duration,
) -> RetryAction {
    match classified.disposition {
        Disposition::ClientFault | Disposition::Fatal => RetryAction::SurfaceToClient,
        Disposition::RateLimited | Disposition::Transient => {
            if attempt < max_retries {
                RetryAction::RetrySameAccount {
                    delay: base_delay * 2u32.saturating_pow(attempt),
                }
            } else {
                RetryAction::SurfaceToClient
            }
        }
        Disposition::Other => {
            if attempt < max_retries {
                RetryAction::RetryOtherAccount
            } else {
                RetryAction::SurfaceToClient
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_driven_classification() {
        assert_eq!(classify(Some(400), "nope").disposition, Disposition::ClientFault);
        assert_eq!(classify(Some(429), "slow").disposition, Disposition::RateLimited);
        assert_eq!(classify(Some(403), "no").disposition, Disposition::Fatal);
        assert_eq!(classify(Some(402), "pay").disposition, Disposition::Fatal);
        assert_eq!(classify(Some(401), "who").disposition, Disposition::Fatal);
        assert_eq!(classify(Some(503), "later").disposition, Disposition::Transient);
        assert!(!classify(Some(403), "no").string_heuristic);
    }

    #[test]
    fn string_heuristics_are_last_resort_and_flagged() {
        let c = classify(None, "Your account is suspended");
        assert_eq!(c.disposition, Disposition::Fatal);
        assert!(c.string_heuristic);

        let c = classify(None, "read: connection reset by peer (ECONNRESET)");
        assert_eq!(c.disposition, Disposition::Transient);
        assert!(c.string_heuristic);

        let c = classify(None, "something odd happened");
        assert_eq!(c.disposition, Disposition::Other);
        assert!(!c.string_heuristic);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let c = classify(Some(429), "rate");
        let base = Duration::from_millis(1000);
        assert_eq!(
            decide(&c, 0, 3, base),
            RetryAction::RetrySameAccount {
                delay: Duration::from_millis(1000)
            }
        );
        assert_eq!(
            decide(&c, 2, 3, base),
            RetryAction::RetrySameAccount {
                delay: Duration::from_millis(4000)
            }
        );
        assert_eq!(decide(&c, 3, 3, base), RetryAction::SurfaceToClient);
    }

    #[test]
    fn fatal_and_client_fault_surface_immediately() {
        let base = Duration::from_millis(1000);
        assert_eq!(
            decide(&classify(Some(403), "no"), 0, 3, base),
            RetryAction::SurfaceToClient
        );
        assert_eq!(
            decide(&classify(Some(400), "bad"), 0, 3, base),
            RetryAction::SurfaceToClient
        );
    }

    #[test]
    fn unknown_errors_rotate_accounts() {
        let c = classify(None, "mystery");
        assert_eq!(
            decide(&c, 0, 3, Duration::from_millis(1000)),
            RetryAction::RetryOtherAccount
        );
        assert_eq!(
            decide(&c, 3, 3, Duration::from_millis(1000)),
            RetryAction::SurfaceToClient
        );
    }
}
