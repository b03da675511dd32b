use serde_json::Value;
use uuid::Uuid;

use crate::llm_client::{TokenSource, TokenUsage};

/// One row of the AI operation log. Exactly one is written per invocation,
/// successful or not.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub organization_id: Uuid,
    pub hr_specialist_id: Option<Uuid>,
    pub operation_type: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    /// Heuristic counts are flagged so they can be reported apart from exact ones.
    pub tokens_estimated: bool,
    pub success: bool,
    pub error_message: Option<String>,
    pub metadata: Value,
}

impl UsageRecord {
    pub fn total_tokens(&self) -> i64 {
        self.input_tokens + self.output_tokens
    }

    pub fn success(
        organization_id: Uuid,
        hr_specialist_id: Option<Uuid>,
        operation_type: &str,
        provider: &str,
        model: &str,
        usage: TokenUsage,
        metadata: Value,
    ) -> Self {
        Self {
            organization_id,
            hr_specialist_id,
            operation_type: operation_type.to_string(),
            provider: Some(provider.to_string()),
            model: Some(model.to_string()),
            input_tokens: usage.input_tokens as i64,
            output_tokens: usage.output_tokens as i64,
            tokens_estimated: usage.source == TokenSource::Estimated,
            success: true,
            error_message: None,
            metadata,
        }
    }

    /// A failed invocation. `usage` carries whatever was observed before the
    /// failure (zero when nothing reached the provider).
    pub fn failure(
        organization_id: Uuid,
        hr_specialist_id: Option<Uuid>,
        operation_type: &str,
        provider: Option<&str>,
        model: Option<&str>,
        usage: TokenUsage,
        error: &str,
        metadata: Value,
    ) -> Self {
        Self {
            organization_id,
            hr_specialist_id,
            operation_type: operation_type.to_string(),
            provider: provider.map(str::to_string),
            model: model.map(str::to_string),
            input_tokens: usage.input_tokens as i64,
            output_tokens: usage.output_tokens as i64,
            tokens_estimated: usage.source == TokenSource::Estimated,
            success: false,
            error_message: Some(error.to_string()),
            metadata,
        }
    }
}
