//! Google Gemini `streamGenerateContent` adapter.
//!
//! Every SSE frame is a full `GenerateContentResponse` chunk. Text and
//! `functionCall` parts arrive whole under `candidates[0].content.parts[]`;
//! there is no partial-JSON accumulation. The body carries no terminal
//! marker, so completion is the end of the HTTP body.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use super::anthropic::forward;
use super::sse::{SseFrame, SseFramer};
use super::{
    estimate_tokens, send_with_retry, LlmError, LlmProvider, ProviderEvent, ProviderKind,
    ProviderStream, RetryPolicy, RoundTripRequest, TokenSource, TokenUsage, ToolCall, Turn,
    EVENT_CHANNEL_CAPACITY,
};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Finish reasons that mean the vendor withheld or cut the answer.
const BLOCKING_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "OTHER",
    "RECITATION",
    "BLOCKLIST",
    "PROHIBITED_CONTENT",
];

pub struct GoogleAdapter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    retry: RetryPolicy,
}

impl GoogleAdapter {
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
impl LlmProvider for GoogleAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    async fn stream_round_trip(
        &self,
        request: &RoundTripRequest<'_>,
    ) -> Result<ProviderStream, LlmError> {
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url, request.model
        );
        let body = build_request_body(request);
        let prompt_chars = request.prompt_chars();

        debug!(
            provider = "google",
            model = %request.model,
            turns = request.turns.len(),
            "Sending streaming request"
        );

        let response = send_with_retry(&self.retry, || {
            self.client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .header("content-type", "application/json")
                .json(&body)
        })
        .await?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut framer = SseFramer::new();
            let mut parser = GoogleStreamParser::new(prompt_chars);

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
            }

            if let Some(frame) = framer.finish() {
                if !forward(&tx, parser.handle(&frame)).await {
                    return;
                }
            }
            forward(&tx, Ok(parser.finish())).await;
        });

        Ok(rx)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Request rendering
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineDataPayload,
    },
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: FunctionCallPayload,
    },
    FunctionResponse {
        #[serde(rename = "functionResponse")]
        function_response: FunctionResponsePayload,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineDataPayload {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct FunctionCallPayload {
    name: String,
    args: Value,
}

#[derive(Debug, Serialize)]
struct FunctionResponsePayload {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    system_instruction: SystemInstruction,
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    generation_config: GenerationConfig,
}

fn build_request_body(request: &RoundTripRequest<'_>) -> GenerateContentRequest {
    let tools = if request.tools.is_empty() {
        Vec::new()
    } else {
        let declarations: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })
            })
            .collect();
        vec![json!({ "functionDeclarations": declarations })]
    };

    GenerateContentRequest {
        system_instruction: SystemInstruction {
            parts: vec![Part::Text {
                text: request.system.to_string(),
            }],
        },
        contents: request.turns.iter().map(to_content).collect(),
        tools,
        generation_config: GenerationConfig {
            max_output_tokens: request.max_tokens,
            temperature: request.temperature,
        },
    }
}

fn to_content(turn: &Turn) -> Content {
    match turn {
        Turn::User { text, image } => {
            let mut parts = Vec::new();
            if let Some(image) = image {
                parts.push(Part::InlineData {
                    inline_data: InlineDataPayload {
                        mime_type: image.media_type.clone(),
                        data: image.data.clone(),
                    },
                });
            }
            parts.push(Part::Text { text: text.clone() });
            Content { role: "user", parts }
        }
        Turn::Assistant { text, tool_calls } => {
            let mut parts = Vec::new();
            if !text.is_empty() {
                parts.push(Part::Text { text: text.clone() });
            }
            for call in tool_calls {
                parts.push(Part::FunctionCall {
                    function_call: FunctionCallPayload {
                        name: call.name.clone(),
                        args: call.args.clone(),
                    },
                });
            }
            Content {
                role: "model",
                parts,
            }
        }
        // Gemini correlates responses to calls by name and position, so order is preserved.
        Turn::ToolResults(results) => Content {
            role: "user",
            parts: results
                .iter()
                .map(|r| Part::FunctionResponse {
                    function_response: FunctionResponsePayload {
                        name: r.name.clone(),
                        response: json!({ "result": r.content }),
                    },
                })
                .collect(),
        },
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Stream parsing
// ────────────────────────────────────────────────────────────────────────────

/// Per-round-trip parser. Counts characters so usage can be estimated when the
/// vendor sends no `usageMetadata`.
#[derive(Debug)]
pub struct GoogleStreamParser {
    prompt_chars: usize,
    output_chars: usize,
    call_seq: usize,
    reported: Option<(u32, u32)>,
}

impl GoogleStreamParser {
    pub fn new(prompt_chars: usize) -> Self {
        Self {
            prompt_chars,
            output_chars: 0,
            call_seq: 0,
            reported: None,
        }
    }

    pub fn handle(&mut self, frame: &SseFrame) -> Result<Vec<ProviderEvent>, LlmError> {
        let data = frame.data.trim();
        if data.is_empty() {
            return Ok(Vec::new());
        }

        let chunk: Value = serde_json::from_str(data)
            .map_err(|e| LlmError::MalformedFrame(format!("invalid JSON in Gemini chunk: {e}")))?;

        if let Some(error) = chunk.get("error") {
            let message = error["message"].as_str().unwrap_or("unknown streaming error");
            return Err(LlmError::Stream(message.to_string()));
        }

        if let Some(usage) = chunk.get("usageMetadata") {
            let input = usage["promptTokenCount"].as_u64();
            let output = usage["candidatesTokenCount"].as_u64();
            if let (Some(input), Some(output)) = (input, output) {
                self.reported = Some((input as u32, output as u32));
            }
        }

        let candidate = match chunk["candidates"].as_array().and_then(|c| c.first()) {
            Some(candidate) => candidate,
            None => {
                if let Some(reason) = chunk["promptFeedback"]["blockReason"].as_str() {
                    return Err(LlmError::Blocked(format!("prompt blocked ({reason})")));
                }
                return Ok(Vec::new());
            }
        };

        let mut out = Vec::new();
        if let Some(parts) = candidate["content"]["parts"].as_array() {
            for part in parts {
                if let Some(text) = part["text"].as_str() {
                    if !text.is_empty() {
                        self.output_chars += text.chars().count();
                        out.push(ProviderEvent::TextDelta(text.to_string()));
                    }
                } else if let Some(call) = part.get("functionCall") {
                    out.push(ProviderEvent::ToolCall(self.tool_call(call)?));
                }
            }
        }

        if let Some(reason) = candidate["finishReason"].as_str() {
            if BLOCKING_FINISH_REASONS.contains(&reason) {
                return Err(LlmError::Blocked(format!(
                    "response stopped with finishReason {reason}"
                )));
            }
        }

        Ok(out)
    }

    fn tool_call(&mut self, call: &Value) -> Result<ToolCall, LlmError> {
        let name = call["name"]
            .as_str()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| LlmError::MalformedFrame("functionCall without name".to_string()))?;
        let args = match &call["args"] {
            Value::Null => json!({}),
            args @ Value::Object(_) => args.clone(),
            other => {
                return Err(LlmError::MalformedFrame(format!(
                    "functionCall '{name}' args must be an object, got {other}"
                )))
            }
        };
        self.call_seq += 1;
        self.output_chars += name.len() + args.to_string().chars().count();
        Ok(ToolCall {
            id: format!("call_{}_{}", self.call_seq, name),
            name: name.to_string(),
            args,
        })
    }

    /// Emits usage and the terminal event once the body has ended.
    pub fn finish(&mut self) -> Vec<ProviderEvent> {
        let usage = match self.reported {
            Some((input_tokens, output_tokens)) => TokenUsage {
                input_tokens,
                output_tokens,
                source: TokenSource::Provider,
            },
            None => TokenUsage {
                input_tokens: estimate_tokens(self.prompt_chars),
                output_tokens: estimate_tokens(self.output_chars),
                source: TokenSource::Estimated,
            },
        };
        vec![ProviderEvent::Usage(usage), ProviderEvent::Done]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::{collect_round_trip, ImagePart, ToolDeclaration, ToolResult};
    use std::time::Duration;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn parse_all(stream: &str, prompt_chars: usize) -> Result<Vec<ProviderEvent>, LlmError> {
        let mut framer = SseFramer::new();
        let mut parser = GoogleStreamParser::new(prompt_chars);
        let mut events = Vec::new();
        for frame in framer.push(stream.as_bytes()) {
            events.extend(parser.handle(&frame)?);
        }
        events.extend(parser.finish());
        Ok(events)
    }

    #[test]
    fn test_parser_emits_text_and_whole_function_calls() {
        let stream = concat!(
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Checking\"}]}}]}\n\n",
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[",
            "{\"functionCall\":{\"name\":\"search_candidates\",\"args\":{\"query\":\"rust\"}}},",
            "{\"functionCall\":{\"name\":\"get_organization_stats\"}}]},\"finishReason\":\"STOP\"}]}\n\n",
        );
        let events = parse_all(stream, 40).unwrap();
        assert_eq!(events[0], ProviderEvent::TextDelta("Checking".into()));
        match (&events[1], &events[2]) {
            (ProviderEvent::ToolCall(a), ProviderEvent::ToolCall(b)) => {
                assert_eq!(a.name, "search_candidates");
                assert_eq!(a.args, json!({"query": "rust"}));
                assert_eq!(b.name, "get_organization_stats");
                assert_eq!(b.args, json!({}));
                assert_ne!(a.id, b.id);
            }
            other => panic!("expected two tool calls, got {other:?}"),
        }
        assert_eq!(events.last(), Some(&ProviderEvent::Done));
    }

    #[test]
    fn test_parser_estimates_usage_from_characters() {
        let stream =
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"You have 3 active vacancies\"}]},\"finishReason\":\"STOP\"}]}\n\n";
        let events = parse_all(stream, 401).unwrap();
        assert_eq!(
            events[1],
            ProviderEvent::Usage(TokenUsage {
                input_tokens: 101,
                output_tokens: 7,
                source: TokenSource::Estimated,
            })
        );
    }

    #[test]
    fn test_parser_prefers_reported_usage_metadata() {
        let stream = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"ok\"}]}}],\"usageMetadata\":{\"promptTokenCount\":50,\"candidatesTokenCount\":3,\"totalTokenCount\":53}}\n\n";
        let events = parse_all(stream, 10_000).unwrap();
        assert_eq!(
            events[1],
            ProviderEvent::Usage(TokenUsage {
                input_tokens: 50,
                output_tokens: 3,
                source: TokenSource::Provider,
            })
        );
    }

    #[test]
    fn test_parser_fails_on_safety_finish_reason() {
        let stream = "data: {\"candidates\":[{\"content\":{\"parts\":[]},\"finishReason\":\"SAFETY\"}]}\n\n";
        assert!(matches!(parse_all(stream, 0), Err(LlmError::Blocked(_))));
    }

    #[test]
    fn test_parser_fails_on_other_finish_reason() {
        let stream = "data: {\"candidates\":[{\"finishReason\":\"OTHER\"}]}\n\n";
        assert!(matches!(parse_all(stream, 0), Err(LlmError::Blocked(_))));
    }

    #[test]
    fn test_parser_fails_on_prompt_block_reason() {
        let stream = "data: {\"candidates\":[],\"promptFeedback\":{\"blockReason\":\"SAFETY\"}}\n\n";
        match parse_all(stream, 0) {
            Err(LlmError::Blocked(msg)) => assert!(msg.contains("SAFETY")),
            other => panic!("expected blocked error, got {other:?}"),
        }
    }

    #[test]
    fn test_request_body_uses_model_role_and_function_responses() {
        let turns = vec![
            Turn::User {
                text: "Analyze this image.".into(),
                image: Some(ImagePart {
                    media_type: "image/jpeg".into(),
                    data: "/9j/".into(),
                }),
            },
            Turn::Assistant {
                text: "One moment".into(),
                tool_calls: vec![ToolCall {
                    id: "call_1_list_vacancies".into(),
                    name: "list_vacancies".into(),
                    args: json!({"status": "active"}),
                }],
            },
            Turn::ToolResults(vec![ToolResult {
                call_id: "call_1_list_vacancies".into(),
                name: "list_vacancies".into(),
                content: json!([]),
            }]),
        ];
        let tools = vec![ToolDeclaration {
            name: "list_vacancies",
            description: "List vacancies",
            parameters: json!({"type": "object", "properties": {}}),
        }];
        let request = RoundTripRequest {
            model: "gemini-2.5-flash",
            system: "sys",
            turns: &turns,
            tools: &tools,
            max_tokens: 2048,
            temperature: Some(0.3),
        };

        let body = serde_json::to_value(build_request_body(&request)).unwrap();
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], json!("sys"));
        assert_eq!(body["generationConfig"]["maxOutputTokens"], json!(2048));
        assert_eq!(
            body["tools"][0]["functionDeclarations"][0]["name"],
            json!("list_vacancies")
        );
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents[0]["parts"][0]["inlineData"]["mimeType"], json!("image/jpeg"));
        assert_eq!(contents[1]["role"], json!("model"));
        assert_eq!(contents[1]["parts"][1]["functionCall"]["name"], json!("list_vacancies"));
        assert_eq!(
            contents[2]["parts"][0]["functionResponse"]["response"]["result"],
            json!([])
        );
    }

    #[tokio::test]
    async fn test_adapter_streams_against_mock_server() {
        let server = MockServer::start().await;
        let body = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"You have \"}]}}]}\r\n\r\n\
data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"3 active vacancies\"}]},\"finishReason\":\"STOP\"}]}\r\n\r\n";
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.5-flash:streamGenerateContent"))
            .and(query_param("alt", "sse"))
            .and(header("x-goog-api-key", "g-key"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(body.as_bytes().to_vec(), "text/event-stream"),
            )
            .mount(&server)
            .await;

        let adapter = GoogleAdapter::new(reqwest::Client::new(), "g-key".into())
            .with_base_url(&server.uri())
            .with_retry(RetryPolicy {
                max_attempts: 1,
                base_delay: Duration::from_millis(1),
            });
        let turns = vec![Turn::user("List active vacancies")];
        let request = RoundTripRequest {
            model: "gemini-2.5-flash",
            system: "system prompt",
            turns: &turns,
            tools: &[],
            max_tokens: 512,
            temperature: None,
        };

        let stream = adapter.stream_round_trip(&request).await.unwrap();
        let output = collect_round_trip(stream).await.unwrap();
        assert_eq!(output.text, "You have 3 active vacancies");
        assert_eq!(output.usage.source, TokenSource::Estimated);
        assert_eq!(output.usage.output_tokens, 7);
    }
}
