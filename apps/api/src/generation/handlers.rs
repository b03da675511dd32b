//! Axum route handlers for the single-shot generation API.

use axum::{extract::State, Json};

use crate::auth::Caller;
use crate::errors::AppError;
use crate::generation::generator::{generate, GenerateRequest, GenerateResponse};
use crate::state::AppState;

/// POST /api/v1/ai/generate
///
/// Runs one generation operation (document, full analysis, comparison or
/// ideal profile) and returns the stored result.
pub async fn handle_generate(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, AppError> {
    let job = request.validate()?;
    let services = state.ai_services(&caller);
    services
        .authorize(&caller, job.organization_id, job.hr_specialist_id, None)
        .await?;
    let response = generate(&services, job).await?;
    Ok(Json(response))
}
