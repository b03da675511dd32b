//! The fixed tool set exposed to the model and its dispatcher.
//!
//! Every call is executed against the organization of the request, never one
//! named in the model's arguments.
use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::llm_client::{ToolCall, ToolDeclaration, ToolResult};
use crate::store::ScopedData;

pub const SEARCH_CANDIDATES: &str = "search_candidates";
pub const GET_CANDIDATE_DETAILS: &str = "get_candidate_details";
pub const GET_VACANCY_DETAILS: &str = "get_vacancy_details";
pub const LIST_VACANCIES: &str = "list_vacancies";
pub const GET_ORGANIZATION_STATS: &str = "get_organization_stats";

const DEFAULT_VACANCY_STATUS: &str = "active";

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("model requested unknown tool '{0}'")]
    UnknownTool(String),

    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("tool '{tool}' failed: {message}")]
    Data { tool: String, message: String },
}

pub fn declarations() -> Vec<ToolDeclaration> {
    vec![
        ToolDeclaration {
            name: SEARCH_CANDIDATES,
            description: "Search the organization's candidates by free text (name, skill, \
                position). Optionally filter by funnel status.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Free-text search"},
                    "status": {
                        "type": "string",
                        "description": "Funnel status filter, e.g. new, testing, interview, offer, hired, rejected"
                    }
                },
                "required": ["query"]
            }),
        },
        ToolDeclaration {
            name: GET_CANDIDATE_DETAILS,
            description: "Full candidate profile: skills, all psychometric test results \
                and interview transcripts.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "candidate_id": {"type": "string", "description": "Candidate UUID"}
                },
                "required": ["candidate_id"]
            }),
        },
        ToolDeclaration {
            name: GET_VACANCY_DETAILS,
            description: "Vacancy requirements and its ideal psychometric profile.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "vacancy_id": {"type": "string", "description": "Vacancy UUID"}
                },
                "required": ["vacancy_id"]
            }),
        },
        ToolDeclaration {
            name: LIST_VACANCIES,
            description: "List the organization's vacancies. Defaults to active ones.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "status": {
                        "type": "string",
                        "description": "Vacancy status filter (active, paused, closed). Default: active"
                    }
                }
            }),
        },
        ToolDeclaration {
            name: GET_ORGANIZATION_STATS,
            description: "Hiring funnel statistics and the remaining AI token balance.",
            parameters: json!({"type": "object", "properties": {}}),
        },
    ]
}

/// Executes tool calls for one organization.
pub struct ToolDispatcher {
    data: Arc<dyn ScopedData>,
    organization_id: Uuid,
}

impl ToolDispatcher {
    pub fn new(data: Arc<dyn ScopedData>, organization_id: Uuid) -> Self {
        Self {
            data,
            organization_id,
        }
    }

    pub async fn dispatch(&self, call: &ToolCall) -> Result<Value, ToolError> {
        let org = self.organization_id;
        debug!(tool = %call.name, args = %call.args, "Dispatching tool call");

        let result = match call.name.as_str() {
            SEARCH_CANDIDATES => {
                let query = optional_str(call, "query")?.unwrap_or_default();
                let status = optional_str(call, "status")?;
                self.data.search_candidates(org, query, status).await
            }
            GET_CANDIDATE_DETAILS => {
                let id = required_uuid(call, "candidate_id")?;
                self.data.candidate_details(org, id).await
            }
            GET_VACANCY_DETAILS => {
                let id = required_uuid(call, "vacancy_id")?;
                self.data.vacancy_details(org, id).await
            }
            LIST_VACANCIES => {
                let status = optional_str(call, "status")?.unwrap_or(DEFAULT_VACANCY_STATUS);
                self.data.list_vacancies(org, status).await
            }
            GET_ORGANIZATION_STATS => self.data.organization_stats(org).await,
            other => return Err(ToolError::UnknownTool(other.to_string())),
        };

        result.map_err(|e| ToolError::Data {
            tool: call.name.clone(),
            message: format!("{e:#}"),
        })
    }

    /// Runs calls one after another in emitted order. The first failure
    /// aborts the rest; nothing is retried.
    pub async fn dispatch_all(&self, calls: &[ToolCall]) -> Result<Vec<ToolResult>, ToolError> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            let content = self.dispatch(call).await?;
            info!(tool = %call.name, organization_id = %self.organization_id, "Tool call completed");
            results.push(ToolResult {
                call_id: call.id.clone(),
                name: call.name.clone(),
                content,
            });
        }
        Ok(results)
    }
}

fn invalid(call: &ToolCall, reason: impl Into<String>) -> ToolError {
    ToolError::InvalidArguments {
        tool: call.name.clone(),
        reason: reason.into(),
    }
}

fn optional_str<'a>(call: &'a ToolCall, field: &str) -> Result<Option<&'a str>, ToolError> {
    match call.args.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim())),
        Some(_) => Err(invalid(call, format!("'{field}' must be a string"))),
    }
}

fn required_uuid(call: &ToolCall, field: &str) -> Result<Uuid, ToolError> {
    let raw = optional_str(call, field)?.ok_or_else(|| invalid(call, format!("'{field}' is required")))?;
    Uuid::parse_str(raw).map_err(|_| invalid(call, format!("'{field}' must be a UUID")))
}
