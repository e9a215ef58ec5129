//! Tool-schema registry — one canonical table, two derived views.
//!
//! The table maps client-side tool names and parameters onto the upstream
//! agent's vocabulary. Outbound, calls are renamed and fixed parameters
//! injected; inbound, the reverse rename is applied and upstream-only
//! parameters are stripped so clients never see them.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde_json::{Map, Value};

use kirogate_core::anthropic::ToolDefinition;

/// Hard upstream cap on tools per request.
pub const MAX_TOOLS: usize = 25;

/// Maximum forwarded description length.
pub const MAX_DESCRIPTION_LEN: usize = 500;

/// Anthropic builtin tool names — typed entries the upstream rejects.
const BUILTIN_TOOL_NAMES: &[&str] = &[
    "web_search",
    "computer",
    "bash",
    "str_replace_editor",
    "str_replace_based_edit_tool",
    "text_editor",
    "code_execution",
];

/// Parameters the upstream invents that must never reach the client.
const UPSTREAM_ONLY_PARAMS: &[&str] = &[
    "explanation",
    "ignoreWarning",
    "depth",
    "reason",
    "caseSensitive",
    "excludePattern",
    "includeIgnoredFiles",
    "raw",
    "raw_arguments",
    "value",
];

/// JSON-schema keywords the upstream rejects.
const FORBIDDEN_SCHEMA_KEYWORDS: &[&str] = &[
    "$schema",
    "$id",
    "$defs",
    "definitions",
    "examples",
    "allOf",
    "anyOf",
    "oneOf",
    "not",
    "if",
    "then",
    "else",
    "additionalItems",
    "unevaluatedItems",
    "unevaluatedProperties",
    "dependentSchemas",
    "dependentRequired",
];

#[derive(Debug, Clone, Copy)]
pub struct ToolMap {
    pub client_name: &'static str,
    pub upstream_name: &'static str,
    /// client param → upstream param
    pub params: &'static [(&'static str, &'static str)],
    /// upstream param → JSON literal, merged last on outbound calls
    pub fixed: &'static [(&'static str, &'static str)],
    /// Executed by the gateway after the main stream instead of being
    /// returned to the client as a pending call.
    pub server_side: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum Mapping {
    Map(ToolMap),
    Remove {
        client_name: &'static str,
        reason: &'static str,
    },
}

const fn map(
    client_name: &'static str,
    upstream_name: &'static str,
    params: &'static [(&'static str, &'static str)],
) -> Mapping {
    Mapping::Map(ToolMap {
        client_name,
        upstream_name,
        params,
        fixed: &[],
        server_side: false,
    })
}

/// The canonical table. Everything else in this module is a derived view.
const REGISTRY: &[Mapping] = &[
    map("Read", "readFile", &[("file_path", "path")]),
    map(
        "Write",
        "writeToFile",
        &[("file_path", "path"), ("content", "text")],
    ),
    map(
        "Edit",
        "strReplace",
        &[
            ("file_path", "path"),
            ("old_string", "oldStr"),
            ("new_string", "newStr"),
        ],
    ),
    map("Bash", "executeBash", &[("command", "command")]),
    Mapping::Map(ToolMap {
        client_name: "Glob",
        upstream_name: "fileSearch",
        params: &[("pattern", "queryName")],
        fixed: &[("maxResults", "100")],
        server_side: false,
    }),
    map(
        "Grep",
        "grepSearch",
        &[("pattern", "query"), ("path", "includePattern")],
    ),
    map("LS", "listDirectory", &[("path", "path")]),
    Mapping::Map(ToolMap {
        client_name: "WebSearch",
        upstream_name: "webSearch",
        params: &[("query", "query")],
        fixed: &[],
        server_side: true,
    }),
    map("TodoWrite", "manageTaskList", &[("todos", "taskList")]),
    Mapping::Remove {
        client_name: "WebFetch",
        reason: "no upstream counterpart",
    },
    Mapping::Remove {
        client_name: "NotebookEdit",
        reason: "no upstream counterpart",
    },
];

struct RegistryIndex {
    forward: HashMap<&'static str, &'static ToolMap>,
    reverse: HashMap<&'static str, &'static ToolMap>,
    removed: HashMap<&'static str, &'static str>,
}

fn index() -> &'static RegistryIndex {
    static INDEX: OnceLock<RegistryIndex> = OnceLock::new();
    INDEX.get_or_init(|| {
        let mut forward = HashMap::new();
        let mut reverse = HashMap::new();
        let mut removed = HashMap::new();
        for entry in REGISTRY {
            match entry {
                Mapping::Map(m) => {
                    forward.insert(m.client_name, m);
                    reverse.insert(m.upstream_name, m);
                }
                Mapping::Remove {
                    client_name,
                    reason,
                } => {
                    removed.insert(*client_name, *reason);
                }
            }
        }
        RegistryIndex {
            forward,
            reverse,
            removed,
        }
    })
}

pub fn is_removed(client_name: &str) -> bool {
    index().removed.contains_key(client_name)
}

pub fn is_builtin(tool: &ToolDefinition) -> bool {
    tool.tool_type.is_some() && BUILTIN_TOOL_NAMES.contains(&tool.name.as_str())
}

/// Upstream tool name for a client tool (identity when unregistered).
pub fn upstream_name(client_name: &str) -> &str {
    index()
        .forward
        .get(client_name)
        .map(|m| m.upstream_name)
        .unwrap_or(client_name)
}

/// Client tool name for an upstream tool (identity when unregistered).
pub fn client_name(upstream: &str) -> &str {
    index()
        .reverse
        .get(upstream)
        .map(|m| m.client_name)
        .unwrap_or(upstream)
}

pub fn is_server_side(upstream: &str) -> bool {
    index()
        .reverse
        .get(upstream)
        .map(|m| m.server_side)
        .unwrap_or(false)
}

/// Rewrite a tool-call input for the upstream: rename mapped parameters,
/// pass unmatched keys through, merge fixed parameters last. A missing
/// input becomes `{}` — the upstream rejects absent inputs outright.
pub fn map_outbound(client_tool: &str, input: &Value) -> (String, Value) {
    let obj = match input {
        Value::Object(m) => m.clone(),
        Value::Null => Map::new(),
        other => {
            // non-object inputs are wrapped so nothing is silently lost
            let mut m = Map::new();
            m.insert("value".to_string(), other.clone());
            m
        }
    };

    let Some(mapping) = index().forward.get(client_tool) else {
        return (client_tool.to_string(), Value::Object(obj));
    };

    let mut out = Map::new();
    for (key, value) in obj {
        let renamed = mapping
            .params
            .iter()
            .find(|(cc, _)| *cc == key)
            .map(|(_, up)| (*up).to_string())
            .unwrap_or(key);
        out.insert(renamed, value);
    }
    for (key, literal) in mapping.fixed {
        let value = serde_json::from_str(literal).unwrap_or(Value::String((*literal).to_string()));
        out.insert((*key).to_string(), value);
    }

    (mapping.upstream_name.to_string(), Value::Object(out))
}

/// Rewrite a tool-use input coming back from the upstream: reverse-rename
/// mapped parameters, drop injected fixed parameters, and strip the
/// upstream-only block list.
pub fn map_inbound(upstream_tool: &str, input: Value) -> (String, Value) {
    let mut obj = match input {
        Value::Object(m) => m,
        Value::Null => Map::new(),
        other => {
            let mut m = Map::new();
            m.insert("value".to_string(), other);
            m
        }
    };

    let mapping = index().reverse.get(upstream_tool).copied();

    if let Some(m) = mapping {
        for (key, _) in m.fixed {
            obj.remove(*key);
        }
    }
    for key in UPSTREAM_ONLY_PARAMS {
        obj.remove(*key);
    }

    let Some(m) = mapping else {
        return (upstream_tool.to_string(), Value::Object(obj));
    };

    let mut out = Map::new();
    for (key, value) in obj {
        let renamed = m
            .params
            .iter()
            .find(|(_, up)| *up == key)
            .map(|(cc, _)| (*cc).to_string())
            .unwrap_or(key);
        out.insert(renamed, value);
    }

    (m.client_name.to_string(), Value::Object(out))
}

/// Truncate a tool description for the upstream.
pub fn compress_description(description: &str) -> String {
    if description.chars().count() <= MAX_DESCRIPTION_LEN {
        return description.to_string();
    }
    let head: String = description.chars().take(MAX_DESCRIPTION_LEN).collect();
    format!("{head}...")
}

/// Strip schema keywords the upstream rejects. Recursion covers
/// `properties`, `items` (object or array form), and object-valued
/// `additionalProperties`; validation keywords survive untouched.
pub fn clean_schema(schema: &Value) -> Value {
    let Value::Object(obj) = schema else {
        return schema.clone();
    };

    let mut out = Map::new();
    for (key, value) in obj {
        if FORBIDDEN_SCHEMA_KEYWORDS.contains(&key.as_str()) {
            continue;
        }
        let cleaned = match key.as_str() {
            "properties" => {
                if let Value::Object(props) = value {
                    Value::Object(
                        props
                            .iter()
                            .map(|(name, sub)| (name.clone(), clean_schema(sub)))
                            .collect(),
                    )
                } else {
                    value.clone()
                }
            }
            "items" => match value {
                Value::Object(_) => clean_schema(value),
                Value::Array(arr) => Value::Array(arr.iter().map(clean_schema).collect()),
                other => other.clone(),
            },
            "additionalProperties" => match value {
                Value::Object(_) => clean_schema(value),
                other => other.clone(),
            },
            _ => value.clone(),
        };
        out.insert(key.clone(), cleaned);
    }
    Value::Object(out)
}

/// Rename schema property keys and `required` entries to the upstream
/// parameter names so definitions stay coherent with renamed calls.
pub fn rename_schema_params(client_tool: &str, schema: &Value) -> Value {
    let Some(mapping) = index().forward.get(client_tool) else {
        return schema.clone();
    };
    let Value::Object(obj) = schema else {
        return schema.clone();
    };

    let rename = |name: &str| -> String {
        mapping
            .params
            .iter()
            .find(|(cc, _)| *cc == name)
            .map(|(_, up)| (*up).to_string())
            .unwrap_or_else(|| name.to_string())
    };

    let mut out = obj.clone();
    if let Some(Value::Object(props)) = obj.get("properties") {
        out.insert(
            "properties".to_string(),
            Value::Object(
                props
                    .iter()
                    .map(|(name, sub)| (rename(name), sub.clone()))
                    .collect(),
            ),
        );
    }
    if let Some(Value::Array(required)) = obj.get("required") {
        out.insert(
            "required".to_string(),
            Value::Array(
                required
                    .iter()
                    .map(|v| match v.as_str() {
                        Some(name) => Value::String(rename(name)),
                        None => v.clone(),
                    })
                    .collect(),
            ),
        );
    }
    Value::Object(out)
}

/// Filter the client's tool list for forwarding: drop Anthropic builtins
/// and removed tools, keep the first [`MAX_TOOLS`] in registration order.
/// Returns the kept definitions; callers derive the kept-name set from it.
pub fn filter_client_tools(tools: &[ToolDefinition]) -> Vec<&ToolDefinition> {
    tools
        .iter()
        .filter(|t| !is_builtin(t) && !is_removed(&t.name))
        .take(MAX_TOOLS)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outbound_renames_and_injects_fixed() {
        let (name, input) = map_outbound("Glob", &json!({"pattern": "*.rs"}));
        assert_eq!(name, "fileSearch");
        assert_eq!(input, json!({"queryName": "*.rs", "maxResults": 100}));
    }

    #[test]
    fn outbound_null_input_becomes_empty_object() {
        let (_, input) = map_outbound("Bash", &Value::Null);
        assert_eq!(input, json!({}));
    }

    #[test]
    fn unmatched_keys_pass_through() {
        let (_, input) = map_outbound("Read", &json!({"file_path": "/x", "limit": 10}));
        assert_eq!(input, json!({"path": "/x", "limit": 10}));
    }

    #[test]
    fn inbound_reverses_and_strips_blocklist() {
        let (name, input) = map_inbound(
            "readFile",
            json!({"path": "/tmp/x", "explanation": "because", "raw": true}),
        );
        assert_eq!(name, "Read");
        assert_eq!(input, json!({"file_path": "/tmp/x"}));
    }

    #[test]
    fn inbound_strips_injected_fixed_params() {
        let (name, input) = map_inbound("fileSearch", json!({"queryName": "*.rs", "maxResults": 100}));
        assert_eq!(name, "Glob");
        assert_eq!(input, json!({"pattern": "*.rs"}));
    }

    #[test]
    fn round_trip_param_map_is_identity() {
        for (tool, input) in [
            ("Read", json!({"file_path": "/a/b"})),
            (
                "Edit",
                json!({"file_path": "/x", "old_string": "a", "new_string": "b"}),
            ),
            ("Grep", json!({"pattern": "fn main", "path": "src/"})),
            ("WebSearch", json!({"query": "rust codecs"})),
        ] {
            let (up_name, mapped) = map_outbound(tool, &input);
            let (back_name, back) = map_inbound(&up_name, mapped);
            assert_eq!(back_name, tool);
            assert_eq!(back, input, "tool {tool}");
        }
    }

    #[test]
    fn unregistered_tool_passes_through_both_ways() {
        let (name, input) = map_outbound("mcp__custom", &json!({"a": 1}));
        assert_eq!(name, "mcp__custom");
        let (back, out) = map_inbound(&name, input);
        assert_eq!(back, "mcp__custom");
        assert_eq!(out, json!({"a": 1}));
    }

    #[test]
    fn schema_cleansing_removes_forbidden_keywords_recursively() {
        let schema = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "required": ["q"],
            "properties": {
                "q": {"type": "string", "description": "query", "examples": ["x"]},
                "opts": {
                    "type": "object",
                    "oneOf": [{"type": "object"}],
                    "additionalProperties": {"type": "string", "$id": "nested"}
                }
            },
            "items": {"allOf": [{}], "type": "string"}
        });
        let cleaned = clean_schema(&schema);
        let rendered = serde_json::to_string(&cleaned).unwrap();
        for kw in FORBIDDEN_SCHEMA_KEYWORDS {
            assert!(
                !rendered.contains(&format!("\"{kw}\"")),
                "forbidden keyword {kw} survived"
            );
        }
        // validation keywords survive
        assert_eq!(cleaned["type"], "object");
        assert_eq!(cleaned["required"], json!(["q"]));
        assert_eq!(cleaned["properties"]["q"]["description"], "query");
    }

    #[test]
    fn description_compression_caps_at_500() {
        let long = "x".repeat(800);
        let compressed = compress_description(&long);
        assert_eq!(compressed.chars().count(), MAX_DESCRIPTION_LEN + 3);
        assert!(compressed.ends_with("..."));
        assert_eq!(compress_description("short"), "short");
    }

    #[test]
    fn builtin_tools_are_filtered_and_cap_is_25() {
        let mut tools: Vec<ToolDefinition> = (0..30)
            .map(|i| ToolDefinition {
                name: format!("tool_{i}"),
                tool_type: None,
                description: None,
                input_schema: Some(json!({"type": "object"})),
            })
            .collect();
        tools.push(ToolDefinition {
            name: "web_search".to_string(),
            tool_type: Some("web_search_20250305".to_string()),
            description: None,
            input_schema: None,
        });

        let kept = filter_client_tools(&tools);
        assert_eq!(kept.len(), MAX_TOOLS);
        assert!(kept.iter().all(|t| t.tool_type.is_none()));
        assert_eq!(kept[0].name, "tool_0");
        assert_eq!(kept[24].name, "tool_24");
    }

    #[test]
    fn schema_param_rename_tracks_the_call_map() {
        let schema = json!({
            "type": "object",
            "required": ["file_path"],
            "properties": {"file_path": {"type": "string"}, "limit": {"type": "integer"}}
        });
        let renamed = rename_schema_params("Read", &schema);
        assert!(renamed["properties"].get("path").is_some());
        assert!(renamed["properties"].get("file_path").is_none());
        assert_eq!(renamed["required"], json!(["path"]));
    }
}
