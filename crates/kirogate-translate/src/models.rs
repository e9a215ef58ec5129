//! Client → upstream model id mapping.
//!
//! The upstream's encodings are inconsistent on purpose — some ids are
//! SCREAMING_SNAKE with a `V1_0` suffix, some keep dots, one is just
//! `auto`. The table preserves them verbatim; do not "normalize".

const MODEL_TABLE: &[(&str, &str)] = &[
    ("claude-sonnet-4-20250514", "CLAUDE_SONNET_4_20250514_V1_0"),
    ("claude-sonnet-4-5-20250929", "CLAUDE_SONNET_4_5_20250929_V1_0"),
    ("claude-3-7-sonnet-20250219", "CLAUDE_3_7_SONNET_20250219_V1_0"),
    ("claude-opus-4-20250514", "CLAUDE_OPUS_4_20250514_V1_0"),
    ("claude-opus-4-1-20250805", "CLAUDE_OPUS_4_1_20250805_V1_0"),
    ("claude-3-5-haiku-20241022", "CLAUDE_3_5_HAIKU_20241022_V1_0"),
    ("claude-3.5-sonnet", "CLAUDE_3_7_SONNET_20250219_V1_0"),
    ("auto", "auto"),
];

/// Map a client model id to its upstream counterpart. Exact match first,
/// then a family prefix match (clients often send date-less aliases),
/// otherwise the configured default.
pub fn map_model(client_model: &str, default: &str) -> String {
    if let Some((_, upstream)) = MODEL_TABLE.iter().find(|(c, _)| *c == client_model) {
        return (*upstream).to_string();
    }
    if let Some((_, upstream)) = MODEL_TABLE
        .iter()
        .find(|(c, _)| client_model.starts_with(*c) || c.starts_with(client_model))
    {
        return (*upstream).to_string();
    }
    default.to_string()
}
