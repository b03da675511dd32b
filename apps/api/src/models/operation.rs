use sqlx::FromRow;

use crate::llm_client::ProviderKind;

/// Operation type keys selecting a stored prompt template + model.
pub const AI_ASSISTANT: &str = "ai_assistant";
pub const DOCUMENT_GENERATION: &str = "document_generation";
pub const FULL_ANALYSIS: &str = "full_analysis";
pub const CANDIDATE_COMPARISON: &str = "candidate_comparison";
pub const IDEAL_PROFILE: &str = "ideal_profile_generation";

#[derive(Debug, Clone, FromRow)]
pub struct OperationConfigRow {
    pub operation_type: String,
    pub provider: String,
    pub model: String,
    pub system_prompt: String,
    pub max_tokens: i32,
    pub temperature: Option<f32>,
}

/// Validated model/prompt configuration for one operation type.
#[derive(Debug, Clone)]
pub struct OperationConfig {
    pub operation_type: String,
    pub provider: ProviderKind,
    pub model: String,
    pub system_prompt: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

impl TryFrom<OperationConfigRow> for OperationConfig {
    type Error = String;

    fn try_from(row: OperationConfigRow) -> Result<Self, Self::Error> {
        let provider = ProviderKind::parse(&row.provider).ok_or_else(|| {
            format!(
                "operation '{}' names unknown provider '{}'",
                row.operation_type, row.provider
            )
        })?;
        if row.model.trim().is_empty() {
            return Err(format!("operation '{}' has no model", row.operation_type));
        }
        if row.system_prompt.trim().is_empty() {
            return Err(format!(
                "operation '{}' has an empty prompt template",
                row.operation_type
            ));
        }
        Ok(OperationConfig {
            operation_type: row.operation_type,
            provider,
            model: row.model,
            system_prompt: row.system_prompt,
            max_tokens: u32::try_from(row.max_tokens).unwrap_or(0).max(256),
            temperature: row.temperature,
        })
    }
}
