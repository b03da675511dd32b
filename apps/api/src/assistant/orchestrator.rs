//! The assistant turn: assemble the prompt, drive provider round-trips and
//! tool dispatch until the model answers in plain text, then settle.
//!
//! Streaming contract: exactly one terminal frame per turn. Success ends with
//! `[DONE]`; failure with a single `{"error"}` frame and no `[DONE]`.
//! Persistence sees one message pair and one usage record regardless of how
//! many tool round-trips happened.
use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::attachment::{self, AttachmentContent, AttachmentSource};
use super::prompt;
use super::request::AssistantTurn;
use super::stream::StreamFrame;
use super::tools::{self, ToolDispatcher, ToolError};
use crate::config::AssistantLimits;
use crate::errors::AppError;
use crate::llm_client::{LlmError, ProviderEvent, RoundTripRequest, TokenUsage, Turn};
use crate::models::conversation::MessagePair;
use crate::models::operation::AI_ASSISTANT;
use crate::models::usage::UsageRecord;
use crate::operations::{AiServices, OperationError, ResolvedOperation};

#[derive(Debug, Error)]
pub enum AssistantError {
    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error("context lookup failed: {0}")]
    Context(String),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("tool-call limit exceeded after {0} round-trips")]
    RoundTripLimit(u32),

    #[error("assistant turn timed out after {0}s")]
    Timeout(u64),

    #[error("client disconnected")]
    ClientGone,
}

impl AssistantError {
    fn kind(&self) -> &'static str {
        match self {
            AssistantError::Operation(_) => "configuration",
            AssistantError::Context(_) => "context",
            AssistantError::Llm(_) => "provider",
            AssistantError::Tool(_) => "tool",
            AssistantError::RoundTripLimit(_) => "round_trip_limit",
            AssistantError::Timeout(_) => "timeout",
            AssistantError::ClientGone => "client_disconnected",
        }
    }
}

impl From<AssistantError> for AppError {
    fn from(e: AssistantError) -> Self {
        match e {
            AssistantError::Operation(e) => e.into(),
            AssistantError::Llm(e) => AppError::Llm(e.to_string()),
            other => AppError::Internal(anyhow::anyhow!(other.to_string())),
        }
    }
}

/// A validated turn whose configuration and provider are resolved.
pub struct PreparedTurn {
    pub turn: AssistantTurn,
    pub operation: ResolvedOperation,
}

#[derive(Debug, Default, Clone, Copy)]
struct TurnStats {
    round_trips: u32,
    tool_calls: usize,
    attachment_used: bool,
}

struct Reply {
    user_content: String,
    text: String,
}

#[derive(Clone)]
pub struct Orchestrator {
    pub services: AiServices,
    pub attachments: Arc<dyn AttachmentSource>,
    pub limits: AssistantLimits,
}

impl Orchestrator {
    /// Resolves the `ai_assistant` configuration before any stream opens.
    /// A failure is logged as a failed invocation and returned.
    pub async fn prepare(&self, turn: AssistantTurn) -> Result<PreparedTurn, AssistantError> {
        match self.services.resolve(AI_ASSISTANT).await {
            Ok(operation) => Ok(PreparedTurn { turn, operation }),
            Err(e) => {
                error!(
                    organization_id = %turn.organization_id,
                    "Assistant configuration unavailable: {e}"
                );
                let record = UsageRecord::failure(
                    turn.organization_id,
                    Some(turn.hr_specialist_id),
                    AI_ASSISTANT,
                    None,
                    None,
                    TokenUsage::default(),
                    &e.to_string(),
                    json!({ "error_kind": "configuration" }),
                );
                self.services.settle(record).await;
                Err(e.into())
            }
        }
    }

    /// Runs the turn to completion, writing frames to `frames`. Never fails:
    /// every outcome ends in a terminal frame (if the client is still there)
    /// and a usage record.
    pub async fn run(&self, prepared: PreparedTurn, frames: mpsc::Sender<StreamFrame>) {
        let PreparedTurn { turn, operation } = prepared;
        let mut usage = TokenUsage::default();
        let mut stats = TurnStats::default();

        info!(
            organization_id = %turn.organization_id,
            conversation_id = ?turn.conversation_id,
            provider = %operation.config.provider,
            model = %operation.config.model,
            "Assistant turn started"
        );

        let deadline = self.limits.turn_timeout;
        let outcome = tokio::time::timeout(
            deadline,
            self.drive(&turn, &operation, &frames, &mut usage, &mut stats),
        )
        .await
        .unwrap_or(Err(AssistantError::Timeout(deadline.as_secs())));

        match outcome {
            Ok(reply) => self.finalize(&turn, &operation, reply, usage, stats, frames).await,
            Err(e) => self.fail(&turn, &operation, e, usage, stats, frames).await,
        }
    }

    async fn drive(
        &self,
        turn: &AssistantTurn,
        operation: &ResolvedOperation,
        frames: &mpsc::Sender<StreamFrame>,
        usage: &mut TokenUsage,
        stats: &mut TurnStats,
    ) -> Result<Reply, AssistantError> {
        let org = turn.organization_id;

        // ASSEMBLING_PROMPT
        let snapshot = self
            .services
            .data
            .context_snapshot(org, turn.context_type, turn.context_entity_id)
            .await
            .map_err(|e| AssistantError::Context(format!("{e:#}")))?;
        let attachment = self.load_attachment(turn).await;
        stats.attachment_used = attachment.is_some();

        let config = &operation.config;
        let system = prompt::system_prompt(
            &config.system_prompt,
            &snapshot,
            turn,
            attachment.as_ref(),
            chrono::Utc::now().date_naive(),
        );
        let (user_turn, user_content) = prompt::user_turn(turn, attachment.as_ref());
        let mut turns = prompt::history_turns(&turn.history);
        turns.push(user_turn);

        let declarations = tools::declarations();
        let dispatcher = ToolDispatcher::new(self.services.data.clone(), org);
        let mut text = String::new();

        loop {
            stats.round_trips += 1;
            debug!(organization_id = %org, round_trip = stats.round_trips, "Streaming round-trip");

            // STREAMING_ROUND_TRIP
            let request = RoundTripRequest {
                model: &config.model,
                system: &system,
                turns: &turns,
                tools: &declarations,
                max_tokens: config.max_tokens,
                temperature: config.temperature,
            };
            let mut events = operation.provider.stream_round_trip(&request).await?;

            let mut round_text = String::new();
            let mut calls = Vec::new();
            let mut completed = false;
            while let Some(event) = events.recv().await {
                match event? {
                    ProviderEvent::TextDelta(delta) => {
                        round_text.push_str(&delta);
                        frames
                            .send(StreamFrame::Text(delta))
                            .await
                            .map_err(|_| AssistantError::ClientGone)?;
                    }
                    ProviderEvent::ToolCall(call) => calls.push(call),
                    ProviderEvent::Usage(round_usage) => usage.accumulate(round_usage),
                    ProviderEvent::Done => {
                        completed = true;
                        break;
                    }
                }
            }
            if !completed {
                return Err(LlmError::Stream("provider stream closed without completion".into()).into());
            }
            text.push_str(&round_text);

            if calls.is_empty() {
                if text.trim().is_empty() {
                    return Err(LlmError::EmptyContent.into());
                }
                return Ok(Reply { user_content, text });
            }

            // Results would need another round-trip the cap does not allow.
            if stats.round_trips >= self.limits.max_round_trips {
                return Err(AssistantError::RoundTripLimit(stats.round_trips));
            }

            // DISPATCHING_TOOLS
            stats.tool_calls += calls.len();
            info!(
                organization_id = %org,
                round_trip = stats.round_trips,
                tools = ?calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                "Model requested tools"
            );
            let results = dispatcher.dispatch_all(&calls).await?;
            turns.push(Turn::Assistant {
                text: round_text,
                tool_calls: calls,
            });
            turns.push(Turn::ToolResults(results));
        }
    }

    /// Attachment problems never fail the turn.
    async fn load_attachment(&self, turn: &AssistantTurn) -> Option<AttachmentContent> {
        let descriptor = turn.attachment.as_ref()?;
        match attachment::ingest(self.attachments.as_ref(), descriptor).await {
            Ok(content) => {
                debug!(url = %descriptor.url, kind = content.kind(), "Attachment ingested");
                Some(content)
            }
            Err(e) => {
                warn!(url = %descriptor.url, "Attachment ignored: {e}");
                None
            }
        }
    }

    async fn finalize(
        &self,
        turn: &AssistantTurn,
        operation: &ResolvedOperation,
        reply: Reply,
        usage: TokenUsage,
        stats: TurnStats,
        frames: mpsc::Sender<StreamFrame>,
    ) {
        let org = turn.organization_id;
        let total = i64::from(usage.total());

        match turn.conversation_id {
            Some(conversation_id) => {
                let pair = MessagePair {
                    organization_id: org,
                    conversation_id,
                    user_content: reply.user_content,
                    attachment: turn.attachment.clone(),
                    assistant_content: reply.text,
                    tokens_used: total,
                };
                if let Err(e) = self.services.ledger.append_message_pair(&pair).await {
                    warn!(organization_id = %org, %conversation_id, "Message persistence failed: {e:#}");
                }
            }
            None => debug!(organization_id = %org, "No conversation id; messages not persisted"),
        }

        let record = UsageRecord::success(
            org,
            Some(turn.hr_specialist_id),
            AI_ASSISTANT,
            operation.config.provider.as_str(),
            &operation.config.model,
            usage,
            metadata(turn, operation, usage, stats, None),
        );

        let _ = frames.send(StreamFrame::Done).await;
        drop(frames);
        info!(
            organization_id = %org,
            round_trips = stats.round_trips,
            tool_calls = stats.tool_calls,
            total_tokens = total,
            "Assistant turn completed"
        );

        self.services.settle(record).await;
    }

    async fn fail(
        &self,
        turn: &AssistantTurn,
        operation: &ResolvedOperation,
        err: AssistantError,
        usage: TokenUsage,
        stats: TurnStats,
        frames: mpsc::Sender<StreamFrame>,
    ) {
        error!(
            organization_id = %turn.organization_id,
            round_trips = stats.round_trips,
            error_kind = err.kind(),
            "Assistant turn failed: {err}"
        );
        if !matches!(err, AssistantError::ClientGone) {
            let _ = frames.send(StreamFrame::Error(err.to_string())).await;
        }
        drop(frames);

        let record = UsageRecord::failure(
            turn.organization_id,
            Some(turn.hr_specialist_id),
            AI_ASSISTANT,
            Some(operation.config.provider.as_str()),
            Some(&operation.config.model),
            usage,
            &err.to_string(),
            metadata(turn, operation, usage, stats, Some(err.kind())),
        );
        self.services.settle(record).await;
    }
}

fn metadata(
    turn: &AssistantTurn,
    operation: &ResolvedOperation,
    usage: TokenUsage,
    stats: TurnStats,
    error_kind: Option<&str>,
) -> Value {
    json!({
        "provider": operation.config.provider,
        "conversation_id": turn.conversation_id,
        "context_type": turn.context_type,
        "context_entity_id": turn.context_entity_id,
        "round_trips": stats.round_trips,
        "tool_calls": stats.tool_calls,
        "has_attachment": turn.attachment.is_some(),
        "attachment_used": stats.attachment_used,
        "token_count_source": usage.source,
        "error_kind": error_kind,
    })
}
