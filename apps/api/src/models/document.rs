use serde_json::Value;
use uuid::Uuid;

/// Output of a single-shot generation, upserted by
/// `(organization_id, operation_type, subject_key)`.
#[derive(Debug, Clone)]
pub struct GeneratedDocument {
    pub organization_id: Uuid,
    pub hr_specialist_id: Uuid,
    pub operation_type: String,
    /// Stable identity of what the document is about, e.g. `candidate:<id>|vacancy:<id>`.
    pub subject_key: String,
    pub candidate_id: Option<Uuid>,
    pub vacancy_id: Option<Uuid>,
    pub content: String,
    pub structured: Option<Value>,
    pub model: String,
    pub tokens_used: i64,
    pub language: String,
}
