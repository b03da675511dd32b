/// LLM client: the single point of entry for all model vendor calls.
///
/// ARCHITECTURAL RULE: No other module may call a vendor API directly.
/// All LLM interactions MUST go through an `LlmProvider` obtained from `LlmClient`.
///
/// Two vendors are supported, each behind its own adapter that normalizes the
/// vendor's streaming wire format into a sequence of `ProviderEvent`s.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub mod anthropic;
pub mod google;
pub mod prompts;
pub mod sse;

use crate::config::Config;
use anthropic::AnthropicAdapter;
use google::GoogleAdapter;

const MAX_RETRIES: u32 = 3;
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Rate limited after {retries} retries")]
    RateLimited { retries: u32 },

    #[error("LLM returned empty content")]
    EmptyContent,

    #[error("Response blocked by provider: {0}")]
    Blocked(String),

    #[error("Malformed stream frame: {0}")]
    MalformedFrame(String),

    #[error("Provider stream error: {0}")]
    Stream(String),

    #[error("No API key configured for provider '{0}'")]
    NotConfigured(ProviderKind),
}

// ────────────────────────────────────────────────────────────────────────────
// Normalized conversation model
// ────────────────────────────────────────────────────────────────────────────

/// Vendor selected by an operation's stored configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    Google,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Google => "google",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Some(ProviderKind::Anthropic),
            "google" | "gemini" => Some(ProviderKind::Google),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inline image handed to the model as a multimodal part.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePart {
    pub media_type: String,
    /// Standard base64, no data-URL prefix.
    pub data: String,
}

/// A model-initiated tool invocation. Ephemeral: lives for one round-trip.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCall {
    /// Vendor correlation id (Anthropic `tool_use.id`; synthesized for Google).
    pub id: String,
    pub name: String,
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    pub content: Value,
}

/// One entry of the provider-neutral history. Each adapter renders these into
/// its own wire shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Turn {
    User {
        text: String,
        image: Option<ImagePart>,
    },
    Assistant {
        text: String,
        tool_calls: Vec<ToolCall>,
    },
    ToolResults(Vec<ToolResult>),
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Turn::User {
            text: text.into(),
            image: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Turn::Assistant {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }

    /// Characters of plain text carried by this turn, used for token estimates.
    pub fn text_len(&self) -> usize {
        match self {
            Turn::User { text, .. } => text.chars().count(),
            Turn::Assistant { text, tool_calls } => {
                text.chars().count()
                    + tool_calls
                        .iter()
                        .map(|c| c.name.len() + c.args.to_string().chars().count())
                        .sum::<usize>()
            }
            Turn::ToolResults(results) => results
                .iter()
                .map(|r| r.content.to_string().chars().count())
                .sum(),
        }
    }
}

/// Declaration of a tool the model may call. `parameters` is a JSON-schema object.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDeclaration {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

/// Everything an adapter needs for one streaming call.
#[derive(Debug, Clone)]
pub struct RoundTripRequest<'a> {
    pub model: &'a str,
    pub system: &'a str,
    pub turns: &'a [Turn],
    pub tools: &'a [ToolDeclaration],
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

impl RoundTripRequest<'_> {
    /// Characters of prompt text sent in this request.
    pub fn prompt_chars(&self) -> usize {
        self.system.chars().count() + self.turns.iter().map(Turn::text_len).sum::<usize>()
    }
}

/// Where a token count came from. Vendor-reported counts are exact; estimated
/// ones come from the `ceil(chars / 4)` heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenSource {
    #[default]
    Provider,
    Estimated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub source: TokenSource,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }

    /// Adds another round-trip's usage. Once any part is estimated the sum is too.
    pub fn accumulate(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        if other.source == TokenSource::Estimated {
            self.source = TokenSource::Estimated;
        }
    }
}

/// `ceil(chars / 4)`: the heuristic used when the vendor reports no usage.
pub fn estimate_tokens(chars: usize) -> u32 {
    chars.div_ceil(4) as u32
}

/// Normalized event emitted by every adapter for one round-trip.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    TextDelta(String),
    ToolCall(ToolCall),
    Usage(TokenUsage),
    Done,
}

pub type ProviderStream = mpsc::Receiver<Result<ProviderEvent, LlmError>>;

/// A vendor adapter. Stateless per round-trip: each call is one HTTP stream.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn stream_round_trip(
        &self,
        request: &RoundTripRequest<'_>,
    ) -> Result<ProviderStream, LlmError>;
}

/// Aggregated output of one round-trip, for callers that don't need deltas.
#[derive(Debug, Default)]
pub struct RoundTripOutput {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
}

/// Drains a provider stream into a single `RoundTripOutput`.
pub async fn collect_round_trip(mut stream: ProviderStream) -> Result<RoundTripOutput, LlmError> {
    let mut output = RoundTripOutput::default();
    while let Some(event) = stream.recv().await {
        match event? {
            ProviderEvent::TextDelta(delta) => output.text.push_str(&delta),
            ProviderEvent::ToolCall(call) => output.tool_calls.push(call),
            ProviderEvent::Usage(usage) => output.usage = usage,
            ProviderEvent::Done => return Ok(output),
        }
    }
    Err(LlmError::Stream(
        "provider stream closed without completion".to_string(),
    ))
}

// ────────────────────────────────────────────────────────────────────────────
// Client
// ────────────────────────────────────────────────────────────────────────────

/// Resolves the adapter for a vendor. `LlmClient` is the production source;
/// orchestrator tests substitute scripted providers.
pub trait ProviderSource: Send + Sync {
    fn provider(&self, kind: ProviderKind) -> Result<Arc<dyn LlmProvider>, LlmError>;
}

/// Holds one adapter per configured vendor. Cheap to clone.
#[derive(Clone)]
pub struct LlmClient {
    anthropic: Option<Arc<AnthropicAdapter>>,
    google: Option<Arc<GoogleAdapter>>,
}

impl LlmClient {
    pub fn from_config(config: &Config) -> Result<Self, LlmError> {
        let http = build_http_client()?;
        let anthropic = config.anthropic_api_key.as_ref().map(|key| {
            Arc::new(
                AnthropicAdapter::new(http.clone(), key.clone())
                    .with_base_url(&config.anthropic_base_url),
            )
        });
        let google = config.google_api_key.as_ref().map(|key| {
            Arc::new(
                GoogleAdapter::new(http.clone(), key.clone()).with_base_url(&config.google_base_url),
            )
        });
        Ok(Self { anthropic, google })
    }

    /// Returns the adapter for `kind`, or `NotConfigured` when its key is absent.
    pub fn provider(&self, kind: ProviderKind) -> Result<Arc<dyn LlmProvider>, LlmError> {
        match kind {
            ProviderKind::Anthropic => self
                .anthropic
                .clone()
                .map(|a| a as Arc<dyn LlmProvider>)
                .ok_or(LlmError::NotConfigured(kind)),
            ProviderKind::Google => self
                .google
                .clone()
                .map(|g| g as Arc<dyn LlmProvider>)
                .ok_or(LlmError::NotConfigured(kind)),
        }
    }

    pub fn configured(&self) -> Vec<ProviderKind> {
        let mut kinds = Vec::new();
        if self.anthropic.is_some() {
            kinds.push(ProviderKind::Anthropic);
        }
        if self.google.is_some() {
            kinds.push(ProviderKind::Google);
        }
        kinds
    }
}

impl ProviderSource for LlmClient {
    fn provider(&self, kind: ProviderKind) -> Result<Arc<dyn LlmProvider>, LlmError> {
        LlmClient::provider(self, kind)
    }
}

/// Connect timeout only: streaming responses may legitimately run for minutes,
/// so the overall deadline is owned by the caller.
fn build_http_client() -> Result<reqwest::Client, LlmError> {
    Ok(reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(15))
        .build()?)
}

// ────────────────────────────────────────────────────────────────────────────
// Connection establishment with retry
// ────────────────────────────────────────────────────────────────────────────

/// Backoff policy applied before any byte of a response has been streamed.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RETRIES,
            base_delay: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

/// Sends a request built by `build`, retrying on 429 and 5xx with exponential
/// backoff (base, 2×base, ...). Returns the first successful response.
pub(crate) async fn send_with_retry<F>(
    policy: &RetryPolicy,
    mut build: F,
) -> Result<reqwest::Response, LlmError>
where
    F: FnMut() -> reqwest::RequestBuilder,
{
    let mut last_error: Option<LlmError> = None;

    for attempt in 0..policy.max_attempts {
        if attempt > 0 {
            let delay = policy.base_delay * (1 << (attempt - 1));
            warn!(
                "LLM call attempt {} failed, retrying after {}ms...",
                attempt,
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
        }

        let response = match build().send().await {
            Ok(r) => r,
            Err(e) => {
                last_error = Some(LlmError::Http(e));
                continue;
            }
        };

        let status = response.status();

        if status.as_u16() == 429 || status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            warn!("LLM API returned {}: {}", status, body);
            last_error = Some(LlmError::Api {
                status: status.as_u16(),
                message: error_message(body),
            });
            continue;
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message: error_message(body),
            });
        }

        debug!("LLM stream opened with status {}", status);
        return Ok(response);
    }

    Err(last_error.unwrap_or(LlmError::RateLimited {
        retries: policy.max_attempts,
    }))
}

/// Both vendors wrap errors as `{"error": {"message": ...}}`.
fn error_message(body: String) -> String {
    serde_json::from_str::<ApiErrorEnvelope>(&body)
        .map(|e| e.error.message)
        .unwrap_or(body)
}

/// Strips ```json ... ``` or ``` ... ``` code fences from LLM output.
pub fn strip_json_fences(text: &str) -> &str {
    let text = text.trim();
    if let Some(stripped) = text.strip_prefix("```json") {
        stripped
            .trim_start()
            .strip_suffix("```")
            .map(|s| s.trim())
            .unwrap_or(stripped.trim_start())
    } else if let Some(stripped) = text.strip_prefix("```") {
        stripped
            .trim_start()
            .strip_suffix("```")
            .map(|s| s.trim())
            .unwrap_or(stripped.trim_start())
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_json_fences_with_json_tag() {
        let input = "```json\n{\"key\": \"value\"}\n```";
        assert_eq!(strip_json_fences(input), "{\"key\": \"value\"}");
    }

    #[test]
    fn test_strip_json_fences_without_tag() {
        let input = "```\n{\"key\": \"value\"}\n```";
        assert_eq!(strip_json_fences(input), "{\"key\": \"value\"}");
    }

    #[test]
    fn test_strip_json_fences_no_fences() {
        let input = "{\"key\": \"value\"}";
        assert_eq!(strip_json_fences(input), "{\"key\": \"value\"}");
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(0), 0);
        assert_eq!(estimate_tokens(1), 1);
        assert_eq!(estimate_tokens(4), 1);
        assert_eq!(estimate_tokens(5), 2);
        assert_eq!(estimate_tokens(400), 100);
    }

    #[test]
    fn test_usage_accumulate_marks_estimated() {
        let mut total = TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
            source: TokenSource::Provider,
        };
        total.accumulate(TokenUsage {
            input_tokens: 3,
            output_tokens: 2,
            source: TokenSource::Estimated,
        });
        assert_eq!(total.input_tokens, 13);
        assert_eq!(total.output_tokens, 7);
        assert_eq!(total.total(), 20);
        assert_eq!(total.source, TokenSource::Estimated);
    }

    #[test]
    fn test_provider_kind_parse_aliases() {
        assert_eq!(ProviderKind::parse("Anthropic"), Some(ProviderKind::Anthropic));
        assert_eq!(ProviderKind::parse("claude"), Some(ProviderKind::Anthropic));
        assert_eq!(ProviderKind::parse(" gemini "), Some(ProviderKind::Google));
        assert_eq!(ProviderKind::parse("openai"), None);
    }

    #[test]
    fn test_error_message_unwraps_envelope() {
        let body = r#"{"error": {"type": "overloaded_error", "message": "Overloaded"}}"#;
        assert_eq!(error_message(body.to_string()), "Overloaded");
        assert_eq!(error_message("plain".to_string()), "plain");
    }

    #[tokio::test]
    async fn test_collect_round_trip_aggregates_events() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(Ok(ProviderEvent::TextDelta("Hel".into()))).await.unwrap();
        tx.send(Ok(ProviderEvent::TextDelta("lo".into()))).await.unwrap();
        tx.send(Ok(ProviderEvent::Usage(TokenUsage {
            input_tokens: 7,
            output_tokens: 2,
            source: TokenSource::Provider,
        })))
        .await
        .unwrap();
        tx.send(Ok(ProviderEvent::Done)).await.unwrap();

        let output = collect_round_trip(rx).await.unwrap();
        assert_eq!(output.text, "Hello");
        assert!(output.tool_calls.is_empty());
        assert_eq!(output.usage.total(), 9);
    }

    #[tokio::test]
    async fn test_collect_round_trip_fails_without_done() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(Ok(ProviderEvent::TextDelta("partial".into())))
            .await
            .unwrap();
        drop(tx);
        assert!(matches!(
            collect_round_trip(rx).await,
            Err(LlmError::Stream(_))
        ));
    }
}
