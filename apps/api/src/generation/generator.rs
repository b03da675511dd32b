//! Single-shot generation: the assistant pipeline without the tool loop and
//! without streaming.
//!
//! Flow: validate → resolve config → load subject data (caller-scoped) →
//!       one provider round-trip → parse output → upsert document → settle.
//!
//! Documents are upserted by `(organization, operation, subject)`, so running
//! the same job twice replaces the earlier result instead of duplicating it.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::assistant::request::{optional_uuid, required_uuid, DEFAULT_LANGUAGE};
use crate::errors::AppError;
use crate::generation::prompts::{
    fallback, CANDIDATE_COMPARISON_TASK, DOCUMENT_GENERATION_TASK, FULL_ANALYSIS_TASK,
    GENERATION_USER_TEMPLATE, IDEAL_PROFILE_TASK,
};
use crate::llm_client::prompts::{
    interpolate, render_value, GROUNDING_INSTRUCTION, JSON_ONLY_INSTRUCTION, LANGUAGE_INSTRUCTION,
};
use crate::llm_client::{
    collect_round_trip, strip_json_fences, LlmError, RoundTripRequest, TokenSource, TokenUsage,
    Turn,
};
use crate::models::document::GeneratedDocument;
use crate::models::operation::{
    CANDIDATE_COMPARISON, DOCUMENT_GENERATION, FULL_ANALYSIS, IDEAL_PROFILE,
};
use crate::models::usage::UsageRecord;
use crate::operations::{AiServices, ResolvedOperation};
use crate::store::ScopedData;

/// Upper bound on candidates in one comparison.
const MAX_COMPARED_CANDIDATES: usize = 5;

// ────────────────────────────────────────────────────────────────────────────
// Data models
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    DocumentGeneration,
    FullAnalysis,
    CandidateComparison,
    IdealProfile,
}

impl Operation {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "document_generation" => Some(Operation::DocumentGeneration),
            "full_analysis" => Some(Operation::FullAnalysis),
            "candidate_comparison" | "comparison" => Some(Operation::CandidateComparison),
            "ideal_profile" | "ideal_profile_generation" => Some(Operation::IdealProfile),
            _ => None,
        }
    }

    /// Key of the stored config row.
    pub fn operation_type(&self) -> &'static str {
        match self {
            Operation::DocumentGeneration => DOCUMENT_GENERATION,
            Operation::FullAnalysis => FULL_ANALYSIS,
            Operation::CandidateComparison => CANDIDATE_COMPARISON,
            Operation::IdealProfile => IDEAL_PROFILE,
        }
    }

    fn task(&self) -> &'static str {
        match self {
            Operation::DocumentGeneration => DOCUMENT_GENERATION_TASK,
            Operation::FullAnalysis => FULL_ANALYSIS_TASK,
            Operation::CandidateComparison => CANDIDATE_COMPARISON_TASK,
            Operation::IdealProfile => IDEAL_PROFILE_TASK,
        }
    }

    /// Structured operations must answer with a JSON object.
    fn is_structured(&self) -> bool {
        matches!(self, Operation::IdealProfile)
    }
}

/// What a generated document is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    Candidate {
        candidate_id: Uuid,
        vacancy_id: Option<Uuid>,
    },
    /// Sorted and deduplicated.
    Comparison {
        candidate_ids: Vec<Uuid>,
        vacancy_id: Option<Uuid>,
    },
    Vacancy {
        vacancy_id: Uuid,
    },
}

impl Subject {
    /// Stable identity used as the document upsert key.
    pub fn key(&self) -> String {
        let vacancy_suffix = |v: &Option<Uuid>| v.map(|v| format!("|vacancy:{v}")).unwrap_or_default();
        match self {
            Subject::Candidate {
                candidate_id,
                vacancy_id,
            } => format!("candidate:{candidate_id}{}", vacancy_suffix(vacancy_id)),
            Subject::Comparison {
                candidate_ids,
                vacancy_id,
            } => format!(
                "candidates:{}{}",
                candidate_ids
                    .iter()
                    .map(Uuid::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
                vacancy_suffix(vacancy_id)
            ),
            Subject::Vacancy { vacancy_id } => format!("vacancy:{vacancy_id}"),
        }
    }

    fn candidate_id(&self) -> Option<Uuid> {
        match self {
            Subject::Candidate { candidate_id, .. } => Some(*candidate_id),
            _ => None,
        }
    }

    fn vacancy_id(&self) -> Option<Uuid> {
        match self {
            Subject::Candidate { vacancy_id, .. } | Subject::Comparison { vacancy_id, .. } => {
                *vacancy_id
            }
            Subject::Vacancy { vacancy_id } => Some(*vacancy_id),
        }
    }
}

/// Body of `POST /api/v1/ai/generate`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateRequest {
    pub organization_id: Option<String>,
    pub hr_specialist_id: Option<String>,
    pub operation: Option<String>,
    pub candidate_id: Option<String>,
    #[serde(default)]
    pub candidate_ids: Vec<String>,
    pub vacancy_id: Option<String>,
    pub language: Option<String>,
    pub instructions: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub organization_id: Uuid,
    pub hr_specialist_id: Uuid,
    pub operation: Operation,
    pub subject: Subject,
    pub language: String,
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateResponse {
    /// Absent when the generation succeeded but could not be stored.
    pub document_id: Option<Uuid>,
    pub operation: Operation,
    pub content: String,
    pub structured: Option<Value>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub token_count_source: TokenSource,
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("{0} not found")]
    SubjectNotFound(String),

    #[error("subject lookup failed: {0}")]
    Context(String),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("model output is not a JSON object: {0}")]
    InvalidOutput(String),
}

impl From<GenerationError> for AppError {
    fn from(e: GenerationError) -> Self {
        match e {
            GenerationError::SubjectNotFound(what) => AppError::NotFound(format!("{what} not found")),
            GenerationError::Context(msg) => AppError::Internal(anyhow::anyhow!(msg)),
            GenerationError::Llm(e) => AppError::Llm(e.to_string()),
            GenerationError::InvalidOutput(msg) => AppError::Llm(msg),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Validation
// ────────────────────────────────────────────────────────────────────────────

impl GenerateRequest {
    pub fn validate(self) -> Result<GenerationJob, AppError> {
        let organization_id = required_uuid("organization_id", self.organization_id.as_deref())?;
        let hr_specialist_id = required_uuid("hr_specialist_id", self.hr_specialist_id.as_deref())?;
        let operation = self
            .operation
            .as_deref()
            .and_then(Operation::parse)
            .ok_or_else(|| {
                AppError::Validation(
                    "operation must be one of document_generation, full_analysis, \
                     candidate_comparison, ideal_profile"
                        .to_string(),
                )
            })?;
        let vacancy_id = optional_uuid("vacancy_id", self.vacancy_id.as_deref())?;

        let subject = match operation {
            Operation::DocumentGeneration | Operation::FullAnalysis => Subject::Candidate {
                candidate_id: required_uuid("candidate_id", self.candidate_id.as_deref())?,
                vacancy_id,
            },
            Operation::CandidateComparison => {
                let mut ids = BTreeSet::new();
                for raw in &self.candidate_ids {
                    if let Some(id) = optional_uuid("candidate_ids", Some(raw))? {
                        ids.insert(id);
                    }
                }
                if ids.len() < 2 {
                    return Err(AppError::Validation(
                        "candidate_comparison needs at least two distinct candidate_ids".to_string(),
                    ));
                }
                if ids.len() > MAX_COMPARED_CANDIDATES {
                    return Err(AppError::Validation(format!(
                        "at most {MAX_COMPARED_CANDIDATES} candidates can be compared"
                    )));
                }
                Subject::Comparison {
                    candidate_ids: ids.into_iter().collect(),
                    vacancy_id,
                }
            }
            Operation::IdealProfile => Subject::Vacancy {
                vacancy_id: vacancy_id
                    .ok_or_else(|| AppError::Validation("vacancy_id is required".to_string()))?,
            },
        };

        Ok(GenerationJob {
            organization_id,
            hr_specialist_id,
            operation,
            subject,
            language: self
                .language
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
            instructions: self
                .instructions
                .map(|i| i.trim().to_string())
                .filter(|i| !i.is_empty()),
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Pipeline
// ────────────────────────────────────────────────────────────────────────────

/// Runs one single-shot job. Writes exactly one usage record, success or not.
pub async fn generate(services: &AiServices, job: GenerationJob) -> Result<GenerateResponse, AppError> {
    let operation_type = job.operation.operation_type();

    let resolved = match services.resolve(operation_type).await {
        Ok(resolved) => resolved,
        Err(e) => {
            warn!(organization_id = %job.organization_id, operation_type, "Generation config unavailable: {e}");
            services
                .settle(failure_record(&job, None, TokenUsage::default(), &e.to_string()))
                .await;
            return Err(e.into());
        }
    };

    info!(
        organization_id = %job.organization_id,
        operation_type,
        subject = %job.subject.key(),
        model = %resolved.config.model,
        "Single-shot generation started"
    );

    let mut usage = TokenUsage::default();
    let (content, structured) = match run(services.data.as_ref(), &job, &resolved, &mut usage).await {
        Ok(output) => output,
        Err(e) => {
            warn!(organization_id = %job.organization_id, operation_type, "Generation failed: {e}");
            services
                .settle(failure_record(&job, Some(&resolved), usage, &e.to_string()))
                .await;
            return Err(e.into());
        }
    };

    let document = GeneratedDocument {
        organization_id: job.organization_id,
        hr_specialist_id: job.hr_specialist_id,
        operation_type: operation_type.to_string(),
        subject_key: job.subject.key(),
        candidate_id: job.subject.candidate_id(),
        vacancy_id: job.subject.vacancy_id(),
        content: content.clone(),
        structured: structured.clone(),
        model: resolved.config.model.clone(),
        tokens_used: i64::from(usage.total()),
        language: job.language.clone(),
    };
    let document_id = match services.ledger.upsert_document(&document).await {
        Ok(id) => Some(id),
        Err(e) => {
            warn!(organization_id = %job.organization_id, operation_type, "Document upsert failed: {e:#}");
            None
        }
    };

    services
        .settle(UsageRecord::success(
            job.organization_id,
            Some(job.hr_specialist_id),
            operation_type,
            resolved.config.provider.as_str(),
            &resolved.config.model,
            usage,
            json!({
                "provider": resolved.config.provider,
                "subject_key": document.subject_key,
                "document_id": document_id,
                "token_count_source": usage.source,
            }),
        ))
        .await;

    info!(organization_id = %job.organization_id, operation_type, total_tokens = usage.total(), "Single-shot generation completed");

    Ok(GenerateResponse {
        document_id,
        operation: job.operation,
        content,
        structured,
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        token_count_source: usage.source,
    })
}

async fn run(
    data: &dyn ScopedData,
    job: &GenerationJob,
    resolved: &ResolvedOperation,
    usage: &mut TokenUsage,
) -> Result<(String, Option<Value>), GenerationError> {
    let subject = load_subject(data, job).await?;
    let (system, user) = build_prompts(&resolved.config.system_prompt, job, &subject);
    let turns = [Turn::user(user)];

    let request = RoundTripRequest {
        model: &resolved.config.model,
        system: &system,
        turns: &turns,
        tools: &[],
        max_tokens: resolved.config.max_tokens,
        temperature: resolved.config.temperature,
    };
    let output = collect_round_trip(resolved.provider.stream_round_trip(&request).await?).await?;
    *usage = output.usage;

    let text = output.text.trim().to_string();
    if text.is_empty() {
        return Err(LlmError::EmptyContent.into());
    }
    if !job.operation.is_structured() {
        return Ok((text, None));
    }

    let cleaned = strip_json_fences(&text);
    match serde_json::from_str::<Value>(cleaned) {
        Ok(value @ Value::Object(_)) => Ok((cleaned.to_string(), Some(value))),
        Ok(_) => Err(GenerationError::InvalidOutput("expected an object".to_string())),
        Err(e) => Err(GenerationError::InvalidOutput(e.to_string())),
    }
}

/// Caller-scoped reads of everything the document is about.
async fn load_subject(data: &dyn ScopedData, job: &GenerationJob) -> Result<Value, GenerationError> {
    let org = job.organization_id;
    let lookup = |e: anyhow::Error| GenerationError::Context(format!("{e:#}"));

    let mut subject = serde_json::Map::new();
    match &job.subject {
        Subject::Candidate { candidate_id, .. } => {
            let candidate = data.candidate_details(org, *candidate_id).await.map_err(lookup)?;
            subject.insert("candidate".into(), found(candidate, || format!("candidate {candidate_id}"))?);
        }
        Subject::Comparison { candidate_ids, .. } => {
            let mut candidates = Vec::with_capacity(candidate_ids.len());
            for id in candidate_ids {
                let candidate = data.candidate_details(org, *id).await.map_err(lookup)?;
                candidates.push(found(candidate, || format!("candidate {id}"))?);
            }
            subject.insert("candidates".into(), Value::Array(candidates));
        }
        Subject::Vacancy { .. } => {}
    }
    if let Some(vacancy_id) = job.subject.vacancy_id() {
        let vacancy = data.vacancy_details(org, vacancy_id).await.map_err(lookup)?;
        subject.insert("vacancy".into(), found(vacancy, || format!("vacancy {vacancy_id}"))?);
    }
    Ok(Value::Object(subject))
}

/// RLS hides other organizations' rows, so "not found" covers "not yours".
fn found(value: Value, what: impl FnOnce() -> String) -> Result<Value, GenerationError> {
    if value.is_null() {
        Err(GenerationError::SubjectNotFound(what()))
    } else {
        Ok(value)
    }
}

/// Returns `(system, user)` prompt text.
fn build_prompts(template: &str, job: &GenerationJob, subject: &Value) -> (String, String) {
    let mut values: HashMap<&str, String> = HashMap::new();
    values.insert("language", job.language.clone());
    values.insert("operation", job.operation.operation_type().to_string());
    values.insert("current_date", chrono::Utc::now().date_naive().format("%Y-%m-%d").to_string());
    values.insert("task", job.operation.task().to_string());
    values.insert("subject", render_value(subject));
    for key in ["candidate", "candidates", "vacancy"] {
        if let Some(value) = subject.get(key) {
            values.insert(key, render_value(value));
        }
    }
    if let Some(instructions) = &job.instructions {
        values.insert("instructions", instructions.clone());
    }

    let mut system = format!("{template}\n\n{GROUNDING_INSTRUCTION}\n{LANGUAGE_INSTRUCTION}");
    if job.operation.is_structured() {
        system.push_str("\n\n");
        system.push_str(JSON_ONLY_INSTRUCTION);
    }
    (
        interpolate(&system, &values, fallback),
        interpolate(GENERATION_USER_TEMPLATE, &values, fallback),
    )
}

fn failure_record(
    job: &GenerationJob,
    resolved: Option<&ResolvedOperation>,
    usage: TokenUsage,
    error: &str,
) -> UsageRecord {
    UsageRecord::failure(
        job.organization_id,
        Some(job.hr_specialist_id),
        job.operation.operation_type(),
        resolved.map(|r| r.config.provider.as_str()),
        resolved.map(|r| r.config.model.as_str()),
        usage,
        error,
        json!({
            "subject_key": job.subject.key(),
            "token_count_source": usage.source,
        }),
    )
}
