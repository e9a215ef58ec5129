//! `kirogate-translate` — everything between the Anthropic Messages schema
//! and the CodeWhisperer `conversationState` schema.
//!
//! Pipeline order per request: [`sanitize`] → [`prune`] → [`builder`]
//! (which folds in the [`tools`] registry and [`models`] table). The
//! [`thinking`] splitter is used on the response path when thinking was
//! injected via prompt instructions rather than a native block.

pub mod builder;
pub mod conversation;
pub mod models;
pub mod prune;
pub mod sanitize;
pub mod thinking;
pub mod tokens;
pub mod tools;
