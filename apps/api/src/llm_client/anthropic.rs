//! Anthropic Messages API adapter.
//!
//! Streaming uses typed SSE events: `message_start` carries input usage,
//! `content_block_start`/`content_block_delta`/`content_block_stop` carry text
//! and `tool_use` blocks (tool input arrives as `input_json_delta` fragments),
//! `message_delta` carries output usage and `message_stop` ends the message.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::sse::{SseFrame, SseFramer};
use super::{
    send_with_retry, LlmError, LlmProvider, ProviderEvent, ProviderKind, ProviderStream,
    RetryPolicy, RoundTripRequest, TokenSource, TokenUsage, ToolCall, ToolDeclaration, Turn,
    EVENT_CHANNEL_CAPACITY,
};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    retry: RetryPolicy,
}

impl AnthropicAdapter {
    pub fn new(client: reqwest::Client, api_key: String) -> Self {
        Self {
            client,
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl LlmProvider for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn stream_round_trip(
        &self,
        request: &RoundTripRequest<'_>,
    ) -> Result<ProviderStream, LlmError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = build_request_body(request);

        debug!(
            provider = "anthropic",
            model = %request.model,
            turns = request.turns.len(),
            "Sending streaming request"
        );

        let response = send_with_retry(&self.retry, || {
            self.client
                .post(&url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .header("accept", "text/event-stream")
                .json(&body)
        })
        .await?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut framer = SseFramer::new();
            let mut parser = AnthropicStreamParser::default();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(LlmError::Stream(e.to_string()))).await;
                        return;
                    }
                };
                for frame in framer.push(&chunk) {
                    if !forward(&tx, parser.handle(&frame)).await {
                        return;
                    }
                }
                if parser.is_finished() {
                    return;
                }
            }

            if let Some(frame) = framer.finish() {
                if !forward(&tx, parser.handle(&frame)).await {
                    return;
                }
            }
            if let Err(e) = parser.finish() {
                let _ = tx.send(Err(e)).await;
            }
        });

        Ok(rx)
    }
}

/// Sends parsed events downstream. Returns false when the stream must stop,
/// either because of an error or because the receiver is gone.
pub(super) async fn forward(
    tx: &mpsc::Sender<Result<ProviderEvent, LlmError>>,
    parsed: Result<Vec<ProviderEvent>, LlmError>,
) -> bool {
    match parsed {
        Ok(events) => {
            for event in events {
                if tx.send(Ok(event)).await.is_err() {
                    return false;
                }
            }
            true
        }
        Err(e) => {
            let _ = tx.send(Err(e)).await;
            false
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Request rendering
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    source_type: &'static str,
    media_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct AnthropicTool<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: &'a Value,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

fn build_request_body<'a>(request: &'a RoundTripRequest<'a>) -> AnthropicRequest<'a> {
    AnthropicRequest {
        model: request.model,
        max_tokens: request.max_tokens,
        system: request.system,
        messages: request.turns.iter().map(to_message).collect(),
        tools: request.tools.iter().map(to_tool).collect(),
        temperature: request.temperature,
        stream: true,
    }
}

fn to_tool(tool: &ToolDeclaration) -> AnthropicTool<'_> {
    AnthropicTool {
        name: tool.name,
        description: tool.description,
        input_schema: &tool.parameters,
    }
}

fn to_message(turn: &Turn) -> AnthropicMessage {
    match turn {
        Turn::User { text, image } => {
            let mut content = Vec::new();
            if let Some(image) = image {
                content.push(ContentBlock::Image {
                    source: ImageSource {
                        source_type: "base64",
                        media_type: image.media_type.clone(),
                        data: image.data.clone(),
                    },
                });
            }
            content.push(ContentBlock::Text { text: text.clone() });
            AnthropicMessage {
                role: "user",
                content,
            }
        }
        Turn::Assistant { text, tool_calls } => {
            let mut content = Vec::new();
            if !text.is_empty() {
                content.push(ContentBlock::Text { text: text.clone() });
            }
            for call in tool_calls {
                content.push(ContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.args.clone(),
                });
            }
            AnthropicMessage {
                role: "assistant",
                content,
            }
        }
        // Results go back in a single user message, in the order the calls were made.
        Turn::ToolResults(results) => AnthropicMessage {
            role: "user",
            content: results
                .iter()
                .map(|r| ContentBlock::ToolResult {
                    tool_use_id: r.call_id.clone(),
                    content: r.content.to_string(),
                })
                .collect(),
        },
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Stream parsing
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct PendingToolUse {
    id: String,
    name: String,
    partial_json: String,
}

/// Per-round-trip parser state. Tool input fragments are buffered per block
/// index and only parsed when the block stops.
#[derive(Debug, Default)]
pub struct AnthropicStreamParser {
    tool_blocks: BTreeMap<u64, PendingToolUse>,
    input_tokens: u32,
    output_tokens: u32,
    finished: bool,
}

impl AnthropicStreamParser {
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn handle(&mut self, frame: &SseFrame) -> Result<Vec<ProviderEvent>, LlmError> {
        let data = frame.data.trim();
        if data.is_empty() {
            return Ok(Vec::new());
        }

        let event: Value = serde_json::from_str(data)
            .map_err(|e| LlmError::MalformedFrame(format!("invalid JSON in Anthropic event: {e}")))?;
        let event_type = event["type"].as_str().unwrap_or_default();
        trace!(event_type, "Anthropic stream event");

        let mut out = Vec::new();
        match event_type {
            "message_start" => {
                let usage = &event["message"]["usage"];
                self.input_tokens = usage["input_tokens"].as_u64().unwrap_or(0) as u32;
                self.output_tokens = usage["output_tokens"].as_u64().unwrap_or(0) as u32;
            }
            "content_block_start" => {
                let index = block_index(&event)?;
                let block = &event["content_block"];
                match block["type"].as_str() {
                    Some("tool_use") => {
                        self.tool_blocks.insert(
                            index,
                            PendingToolUse {
                                id: block["id"].as_str().unwrap_or_default().to_string(),
                                name: block["name"].as_str().unwrap_or_default().to_string(),
                                partial_json: String::new(),
                            },
                        );
                    }
                    Some("text") => {
                        if let Some(text) = block["text"].as_str().filter(|t| !t.is_empty()) {
                            out.push(ProviderEvent::TextDelta(text.to_string()));
                        }
                    }
                    _ => {}
                }
            }
            "content_block_delta" => {
                let index = block_index(&event)?;
                let delta = &event["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        if let Some(text) = delta["text"].as_str() {
                            out.push(ProviderEvent::TextDelta(text.to_string()));
                        }
                    }
                    Some("input_json_delta") => {
                        let pending = self.tool_blocks.get_mut(&index).ok_or_else(|| {
                            LlmError::MalformedFrame(format!(
                                "input_json_delta for unknown block {index}"
                            ))
                        })?;
                        pending
                            .partial_json
                            .push_str(delta["partial_json"].as_str().unwrap_or_default());
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                let index = block_index(&event)?;
                if let Some(pending) = self.tool_blocks.remove(&index) {
                    out.push(ProviderEvent::ToolCall(finalize_tool_use(pending)?));
                }
            }
            "message_delta" => {
                let usage = &event["usage"];
                if let Some(output) = usage["output_tokens"].as_u64() {
                    self.output_tokens = output as u32;
                }
                if let Some(input) = usage["input_tokens"].as_u64() {
                    self.input_tokens = input as u32;
                }
            }
            "message_stop" => {
                if !self.tool_blocks.is_empty() {
                    return Err(LlmError::MalformedFrame(
                        "message ended with an unterminated tool_use block".to_string(),
                    ));
                }
                self.finished = true;
                out.push(ProviderEvent::Usage(TokenUsage {
                    input_tokens: self.input_tokens,
                    output_tokens: self.output_tokens,
                    source: TokenSource::Provider,
                }));
                out.push(ProviderEvent::Done);
            }
            "error" => {
                let message = event["error"]["message"]
                    .as_str()
                    .unwrap_or("unknown streaming error");
                return Err(LlmError::Stream(message.to_string()));
            }
            _ => {}
        }

        Ok(out)
    }

    /// Called when the body ends. A body that ends before `message_stop` is truncated.
    pub fn finish(&mut self) -> Result<(), LlmError> {
        if self.finished {
            Ok(())
        } else {
            Err(LlmError::Stream(
                "Anthropic stream ended before message_stop".to_string(),
            ))
        }
    }
}

fn block_index(event: &Value) -> Result<u64, LlmError> {
    event["index"]
        .as_u64()
        .ok_or_else(|| LlmError::MalformedFrame("content block event without index".to_string()))
}

fn finalize_tool_use(pending: PendingToolUse) -> Result<ToolCall, LlmError> {
    let args = if pending.partial_json.trim().is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_str(&pending.partial_json).map_err(|e| {
            LlmError::MalformedFrame(format!(
                "tool input for '{}' is not valid JSON: {e}",
                pending.name
            ))
        })?
    };
    Ok(ToolCall {
        id: pending.id,
        name: pending.name,
        args,
    })
}
