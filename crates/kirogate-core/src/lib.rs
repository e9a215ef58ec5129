//! `kirogate-core` — shared foundation for the kirogate gateway.
//!
//! Holds the Anthropic Messages wire model, the gateway configuration
//! (TOML file + environment overrides), and the error taxonomy every other
//! crate maps into.

pub mod anthropic;
pub mod config;
pub mod error;

pub use error::{GatewayError, Result};
