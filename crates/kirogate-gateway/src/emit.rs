//! Re-emission of upstream events in the Anthropic streaming grammar.
//!
//! One upstream stream maps to one Anthropic message: `message_start`,
//! an optional thinking block, a text block, sequential `tool_use` blocks
//! (inputs reassembled across frames), then `message_delta` with the stop
//! reason and locally counted output tokens, and `message_stop`. When
//! thinking was requested via prompt injection, text deltas pass through
//! the `<thinking>` fence splitter before routing.

use std::collections::HashMap;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use kirogate_protocol::events::CodeReference;
use kirogate_protocol::UpstreamEvent;
use kirogate_translate::thinking::{Piece, ThinkingSplitter};
use kirogate_translate::tokens::estimate_text;
use kirogate_translate::tools;

/// A client-facing streaming event: SSE name plus JSON payload.
#[derive(Debug, Clone, PartialEq)]
pub struct AnthropicEvent {
    pub name: &'static str,
    pub data: Value,
}

impl AnthropicEvent {
    fn new(name: &'static str, data: Value) -> Self {
        Self { name, data }
    }
}

pub struct EmitterConfig {
    pub message_id: String,
    /// Client-facing model id (echoed back, not the upstream encoding).
    pub model: String,
    pub thinking_injected: bool,
}

#[derive(Debug, Default)]
pub struct StreamSummary {
    pub emitted_tool_use: bool,
    pub output_tokens: u64,
    pub errored: bool,
}

#[derive(Clone, Copy, PartialEq)]
enum BlockKind {
    Thinking,
    Text,
}

struct PendingTool {
    name: String,
    input: String,
}

struct Emitter<'a> {
    out: &'a mpsc::Sender<AnthropicEvent>,
    next_index: usize,
    open: Option<(usize, BlockKind)>,
    output_tokens: u64,
    emitted_tool_use: bool,
    /// Receiver went away — stop producing.
    dead: bool,
}

impl<'a> Emitter<'a> {
    async fn send(&mut self, event: AnthropicEvent) {
        if self.dead {
            return;
        }
        if self.out.send(event).await.is_err() {
            self.dead = true;
        }
    }

    async fn open_block(&mut self, kind: BlockKind) -> usize {
        if let Some((index, open_kind)) = self.open {
            if open_kind == kind {
                return index;
            }
            self.close_block().await;
        }
        let index = self.next_index;
        self.next_index += 1;
        self.open = Some((index, kind));
        let block = match kind {
            BlockKind::Thinking => json!({"type": "thinking", "thinking": ""}),
            BlockKind::Text => json!({"type": "text", "text": ""}),
        };
        self.send(AnthropicEvent::new(
            "content_block_start",
            json!({"type": "content_block_start", "index": index, "content_block": block}),
        ))
        .await;
        index
    }

    async fn close_block(&mut self) {
        if let Some((index, _)) = self.open.take() {
            self.send(AnthropicEvent::new(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": index}),
            ))
            .await;
        }
    }

    async fn text_delta(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.output_tokens += estimate_text(text);
        let index = self.open_block(BlockKind::Text).await;
        self.send(AnthropicEvent::new(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": index,
                "delta": {"type": "text_delta", "text": text}
            }),
        ))
        .await;
    }

    async fn thinking_delta(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.output_tokens += estimate_text(text);
        let index = self.open_block(BlockKind::Thinking).await;
        self.send(AnthropicEvent::new(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": index,
                "delta": {"type": "thinking_delta", "thinking": text}
            }),
        ))
        .await;
    }

    async fn piece(&mut self, piece: Piece) {
        match piece {
            Piece::Text(t) => self.text_delta(&t).await,
            Piece::Thinking(t) => self.thinking_delta(&t).await,
        }
    }

    /// Emit one complete tool_use block: start, a single input_json_delta
    /// with the reverse-mapped input, stop.
    async fn tool_block(&mut self, id: &str, upstream_name: &str, input: Value) {
        self.close_block().await;
        let (client_name, mapped) = tools::map_inbound(upstream_name, input);
        let rendered = mapped.to_string();
        self.output_tokens += estimate_text(&rendered);

        let index = self.next_index;
        self.next_index += 1;
        self.send(AnthropicEvent::new(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": index,
                "content_block": {"type": "tool_use", "id": id, "name": client_name, "input": {}}
            }),
        ))
        .await;
        self.send(AnthropicEvent::new(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": index,
                "delta": {"type": "input_json_delta", "partial_json": rendered}
            }),
        ))
        .await;
        self.send(AnthropicEvent::new(
            "content_block_stop",
            json!({"type": "content_block_stop", "index": index}),
        ))
        .await;
        self.emitted_tool_use = true;
    }
}

/// Anthropic error type for an upstream exception code.
fn error_type_for(code: &str, message: &str) -> &'static str {
    let text = format!("{code} {message}").to_lowercase();
    if text.contains("throttl") || text.contains("rate") {
        "rate_limit_error"
    } else if text.contains("accessdenied") || text.contains("forbidden") {
        "permission_error"
    } else if text.contains("unauthorized") || text.contains("expiredtoken") || text.contains("token") {
        "authentication_error"
    } else {
        "api_error"
    }
}

/// Drive one upstream event stream to completion, emitting the Anthropic
/// sequence on `out`. `search_client` enables server-side `webSearch`
/// execution after the main stream.
pub async fn run_stream(
    rx: &mut mpsc::Receiver<UpstreamEvent>,
    cfg: &EmitterConfig,
    out: &mpsc::Sender<AnthropicEvent>,
    search_client: Option<&reqwest::Client>,
) -> StreamSummary {
    let mut emitter = Emitter {
        out,
        next_index: 0,
        open: None,
        output_tokens: 0,
        emitted_tool_use: false,
        dead: false,
    };

    emitter
        .send(AnthropicEvent::new(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": cfg.message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": cfg.model,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": 0, "output_tokens": 0}
                }
            }),
        ))
        .await;

    let mut splitter = cfg.thinking_injected.then(ThinkingSplitter::new);
    // toolUseId → accumulating call; Vec preserves arrival order
    let mut pending: HashMap<String, PendingTool> = HashMap::new();
    let mut searches: Vec<Value> = Vec::new();
    let mut code_refs: Vec<CodeReference> = Vec::new();
    let mut metering_usage: Option<f64> = None;
    let mut errored = false;

    while let Some(event) = rx.recv().await {
        if emitter.dead {
            break;
        }
        match event {
            UpstreamEvent::Content { content } => {
                if let Some(sp) = splitter.as_mut() {
                    for piece in sp.feed(&content) {
                        emitter.piece(piece).await;
                    }
                } else {
                    emitter.text_delta(&content).await;
                }
            }
            UpstreamEvent::Thinking { content } => {
                emitter.thinking_delta(&content).await;
            }
            UpstreamEvent::ToolUse {
                tool_use_id,
                name,
                input,
                stop,
            } => {
                let entry = pending.entry(tool_use_id.clone()).or_insert(PendingTool {
                    name,
                    input: String::new(),
                });
                entry.input.push_str(&input);
                if !stop {
                    continue;
                }
                let Some(tool) = pending.remove(&tool_use_id) else {
                    continue;
                };
                let parsed: Value = if tool.input.trim().is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&tool.input).unwrap_or_else(|e| {
                        warn!(tool = %tool.name, error = %e, "tool input did not parse, substituting empty object");
                        json!({})
                    })
                };
                if tools::is_server_side(&tool.name) {
                    debug!(tool = %tool.name, "queueing server-side tool execution");
                    searches.push(parsed);
                } else {
                    emitter.tool_block(&tool_use_id, &tool.name, parsed).await;
                }
            }
            UpstreamEvent::CodeReference(refs) => code_refs.extend(refs),
            UpstreamEvent::Metering { usage, .. } => metering_usage = Some(usage),
            UpstreamEvent::Metadata { conversation_id } => {
                debug!(conversation_id = %conversation_id, "upstream conversation metadata");
            }
            UpstreamEvent::Error { code, message } => {
                warn!(code = %code, message = %message, "upstream error event");
                emitter.close_block().await;
                emitter
                    .send(AnthropicEvent::new(
                        "error",
                        json!({
                            "type": "error",
                            "error": {"type": error_type_for(&code, &message), "message": message}
                        }),
                    ))
                    .await;
                errored = true;
                break;
            }
        }
    }

    if !errored {
        // flush any half-buffered fence state
        if let Some(sp) = splitter.take() {
            for piece in sp.finish() {
                emitter.piece(piece).await;
            }
        }

        // partially accumulated calls whose input never terminated are
        // discarded, not emitted
        if !pending.is_empty() {
            debug!(count = pending.len(), "discarding unterminated tool calls");
        }

        if let Some(client) = search_client {
            for input in searches.drain(..) {
                let query = input.get("query").and_then(Value::as_str).unwrap_or_default();
                if query.is_empty() {
                    continue;
                }
                match kirogate_upstream::websearch::execute_web_search(client, query, None).await {
                    Ok(results) => {
                        emitter.close_block().await;
                        emitter.text_delta(&results).await;
                    }
                    Err(e) => warn!(error = %e, "server-side web search failed"),
                }
            }
        }

        emitter.close_block().await;

        if !code_refs.is_empty() {
            let items: Vec<Value> = code_refs
                .iter()
                .map(|r| {
                    json!({
                        "license": r.license_name,
                        "repository": r.repository,
                        "url": r.url,
                        "recommendationContentSpan": r
                            .recommendation_content_span
                            .as_ref()
                            .map(|s| json!({"start": s.start, "end": s.end})),
                    })
                })
                .collect();
            emitter
                .send(AnthropicEvent::new(
                    "code_references",
                    json!({"type": "code_references", "references": items}),
                ))
                .await;
        }

        let mut output_tokens = emitter.output_tokens;
        if output_tokens == 0 {
            if let Some(usage) = metering_usage {
                output_tokens = (usage * 1000.0).round() as u64;
            }
        }
        emitter.output_tokens = output_tokens;

        let stop_reason = if emitter.emitted_tool_use {
            "tool_use"
        } else {
            "end_turn"
        };
        emitter
            .send(AnthropicEvent::new(
                "message_delta",
                json!({
                    "type": "message_delta",
                    "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                    "usage": {"output_tokens": output_tokens}
                }),
            ))
            .await;
    }

    emitter
        .send(AnthropicEvent::new("message_stop", json!({"type": "message_stop"})))
        .await;

    StreamSummary {
        emitted_tool_use: emitter.emitted_tool_use,
        output_tokens: emitter.output_tokens,
        errored,
    }
}

/// Fold a finished event sequence into a buffered Anthropic Messages
/// response body (the non-streaming path).
pub fn collect_response(events: &[AnthropicEvent]) -> Value {
    let mut id = String::new();
    let mut model = String::new();
    let mut content: Vec<Value> = Vec::new();
    let mut stop_reason = Value::Null;
    let mut output_tokens = 0u64;
    // index → position in `content`
    let mut positions: HashMap<u64, usize> = HashMap::new();

    for event in events {
        let data = &event.data;
        match event.name {
            "message_start" => {
                id = data["message"]["id"].as_str().unwrap_or_default().to_string();
                model = data["message"]["model"].as_str().unwrap_or_default().to_string();
            }
            "content_block_start" => {
                let index = data["index"].as_u64().unwrap_or(0);
                positions.insert(index, content.len());
                content.push(data["content_block"].clone());
            }
            "content_block_delta" => {
                let index = data["index"].as_u64().unwrap_or(0);
                let Some(&pos) = positions.get(&index) else { continue };
                let block = &mut content[pos];
                match data["delta"]["type"].as_str() {
                    Some("text_delta") => {
                        if let (Some(existing), Some(add)) =
                            (block["text"].as_str(), data["delta"]["text"].as_str())
                        {
                            block["text"] = json!(format!("{existing}{add}"));
                        }
                    }
                    Some("thinking_delta") => {
                        if let (Some(existing), Some(add)) =
                            (block["thinking"].as_str(), data["delta"]["thinking"].as_str())
                        {
                            block["thinking"] = json!(format!("{existing}{add}"));
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(partial) = data["delta"]["partial_json"].as_str() {
                            block["input"] =
                                serde_json::from_str(partial).unwrap_or_else(|_| json!({}));
                        }
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                stop_reason = data["delta"]["stop_reason"].clone();
                output_tokens = data["usage"]["output_tokens"].as_u64().unwrap_or(0);
            }
            "error" => return data.clone(),
            _ => {}
        }
    }

    json!({
        "id": id,
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": null,
        "usage": {"input_tokens": 0, "output_tokens": output_tokens}
    })
}
