use serde::Deserialize;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::conversation::{AttachmentDescriptor, ContextType, HistoryMessage};

pub const DEFAULT_LANGUAGE: &str = "en";

/// Body of `POST /api/v1/ai/assistant`, as sent by the client. Identifiers
/// stay strings here so a bad value yields our validation error rather than
/// a generic extractor rejection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssistantRequest {
    pub organization_id: Option<String>,
    pub hr_specialist_id: Option<String>,
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub history: Vec<HistoryMessage>,
    pub context_type: Option<String>,
    pub context_entity_id: Option<String>,
    pub language: Option<String>,
    pub attachment_url: Option<String>,
    pub attachment_name: Option<String>,
    pub attachment_type: Option<String>,
}

/// A request that passed validation.
#[derive(Debug, Clone)]
pub struct AssistantTurn {
    pub organization_id: Uuid,
    pub hr_specialist_id: Uuid,
    /// Absent means there is nothing to persist the messages against.
    pub conversation_id: Option<Uuid>,
    /// Trimmed; may be empty when an attachment is present.
    pub message: String,
    pub history: Vec<HistoryMessage>,
    pub context_type: ContextType,
    pub context_entity_id: Option<Uuid>,
    pub language: String,
    pub attachment: Option<AttachmentDescriptor>,
}

impl AssistantRequest {
    /// Runs before any external call; nothing has side effects yet.
    pub fn validate(self) -> Result<AssistantTurn, AppError> {
        let organization_id = required_uuid("organization_id", self.organization_id.as_deref())?;
        let hr_specialist_id = required_uuid("hr_specialist_id", self.hr_specialist_id.as_deref())?;
        let conversation_id = optional_uuid("conversation_id", self.conversation_id.as_deref())?;
        let context_entity_id =
            optional_uuid("context_entity_id", self.context_entity_id.as_deref())?;

        let context_type = match non_blank(self.context_type.as_deref()) {
            None | Some("global") => ContextType::Global,
            Some("candidate") => ContextType::Candidate,
            Some("vacancy") => ContextType::Vacancy,
            Some(other) => {
                return Err(AppError::Validation(format!(
                    "context_type '{other}' is not supported"
                )))
            }
        };

        let attachment = non_blank(self.attachment_url.as_deref()).map(|url| AttachmentDescriptor {
            url: url.to_string(),
            name: non_blank(self.attachment_name.as_deref()).map(str::to_string),
            mime_type: non_blank(self.attachment_type.as_deref()).map(str::to_string),
        });

        let message = self.message.trim().to_string();
        if message.is_empty() && attachment.is_none() {
            return Err(AppError::Validation(
                "message is required unless an attachment is provided".to_string(),
            ));
        }

        Ok(AssistantTurn {
            organization_id,
            hr_specialist_id,
            conversation_id,
            message,
            history: self
                .history
                .into_iter()
                .filter(|m| !m.content.trim().is_empty())
                .collect(),
            context_type,
            context_entity_id,
            language: non_blank(self.language.as_deref())
                .unwrap_or(DEFAULT_LANGUAGE)
                .to_string(),
            attachment,
        })
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

pub(crate) fn required_uuid(field: &str, value: Option<&str>) -> Result<Uuid, AppError> {
    optional_uuid(field, value)?.ok_or_else(|| AppError::Validation(format!("{field} is required")))
}

pub(crate) fn optional_uuid(field: &str, value: Option<&str>) -> Result<Option<Uuid>, AppError> {
    non_blank(value)
        .map(|v| {
            Uuid::parse_str(v)
                .map_err(|_| AppError::Validation(format!("{field} must be a UUID")))
        })
        .transpose()
}
