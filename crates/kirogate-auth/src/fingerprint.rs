//! Per-process request fingerprint.
//!
//! Registration and streaming calls carry a virtual MAC hash and
//! randomized version components so a fleet of gateways does not present
//! one uniform signature. The fingerprint is generated once per process
//! and stays stable for its lifetime.

use rand::Rng;
use sha2::{Digest, Sha256};

const OS_CHOICES: &[&str] = &["linux", "darwin", "windows"];
const NODE_VERSIONS: &[&str] = &["18.20.4", "20.11.1", "20.18.0", "22.9.0"];
const SDK_VERSIONS: &[&str] = &["3.658.0", "3.662.0", "3.679.0", "3.699.0"];
const KIRO_VERSIONS: &[&str] = &["0.1.25", "0.1.32", "0.2.2", "0.2.13"];

#[derive(Debug, Clone)]
pub struct Fingerprint {
    pub mac_hash: String,
    pub os: String,
    pub node_version: String,
    pub sdk_version: String,
    pub kiro_version: String,
}

fn pick<'a>(rng: &mut impl Rng, choices: &'a [&str]) -> &'a str {
    choices[rng.random_range(0..choices.len())]
}

impl Fingerprint {
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let mac: [u8; 6] = rng.random();
        let mac_hash = hex::encode(&Sha256::digest(mac)[..16]);
        Self {
            mac_hash,
            os: pick(&mut rng, OS_CHOICES).to_string(),
            node_version: pick(&mut rng, NODE_VERSIONS).to_string(),
            sdk_version: pick(&mut rng, SDK_VERSIONS).to_string(),
            kiro_version: pick(&mut rng, KIRO_VERSIONS).to_string(),
        }
    }

    /// `user-agent` header for upstream calls.
    pub fn user_agent(&self) -> String {
        format!(
            "aws-sdk-js/{sdk} ua/2.1 os/{os} lang/js md/nodejs#{node} api/codewhispererstreaming#{sdk} m/E",
            sdk = self.sdk_version,
            os = self.os,
            node = self.node_version,
        )
    }

    /// `x-amz-user-agent` header carrying the virtual MAC hash.
    pub fn amz_user_agent(&self) -> String {
        format!(
            "aws-sdk-js/{} KiroIDE-{}-{}",
            self.sdk_version, self.kiro_version, self.mac_hash
        )
    }

    /// Randomized OIDC client name for fleet-register dilution.
    pub fn client_name(&self) -> String {
        format!("kiro-{}-{}", self.kiro_version, &self.mac_hash[..8])
    }

    /// Random localhost redirect port in the unprivileged range.
    pub fn redirect_port(&self) -> u16 {
        let mut rng = rand::rng();
        rng.random_range(49152..=65535)
    }
}

/// Fresh invocation id per upstream attempt.
pub fn invocation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_well_formed() {
        let fp = Fingerprint::generate();
        assert_eq!(fp.mac_hash.len(), 32);
        assert!(fp.mac_hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(OS_CHOICES.contains(&fp.os.as_str()));
        assert!(fp.user_agent().contains(&fp.sdk_version));
        assert!(fp.amz_user_agent().contains(&fp.mac_hash));
        assert!(fp.client_name().starts_with("kiro-"));
    }

    #[test]
    fn redirect_port_is_unprivileged() {
        let fp = Fingerprint::generate();
        for _ in 0..16 {
            assert!(fp.redirect_port() >= 49152);
        }
    }

    #[test]
    fn invocation_ids_are_unique() {
        assert_ne!(invocation_id(), invocation_id());
    }
}
