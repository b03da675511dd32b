use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a conversation is scoped to. `Global` conversations see organization-wide
/// data; the others focus on one candidate or vacancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    #[default]
    Global,
    Candidate,
    Vacancy,
}

impl ContextType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextType::Global => "global",
            ContextType::Candidate => "candidate",
            ContextType::Vacancy => "vacancy",
        }
    }

    pub fn is_entity_scoped(&self) -> bool {
        !matches!(self, ContextType::Global)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// A prior turn supplied by the caller (already truncated client-side).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: MessageRole,
    pub content: String,
}

/// Descriptor stored alongside the user message when a file was attached.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    pub url: String,
    pub name: Option<String>,
    pub mime_type: Option<String>,
}

/// The user + assistant messages appended by one successful assistant turn.
/// Written in a single statement so both rows land or neither does.
#[derive(Debug, Clone)]
pub struct MessagePair {
    /// The verified caller's organization; the insert only matches its conversations.
    pub organization_id: Uuid,
    pub conversation_id: Uuid,
    pub user_content: String,
    pub attachment: Option<AttachmentDescriptor>,
    pub assistant_content: String,
    pub tokens_used: i64,
}
