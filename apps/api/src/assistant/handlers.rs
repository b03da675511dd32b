use std::convert::Infallible;

use axum::{
    extract::State,
    response::sse::{Event, Sse},
    Json,
};
use futures::Stream;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::assistant::orchestrator::Orchestrator;
use crate::assistant::request::AssistantRequest;
use crate::assistant::stream::{sse_body, StreamFrame};
use crate::auth::Caller;
use crate::errors::AppError;
use crate::state::AppState;

/// Frames buffered between the orchestrator and a slow client.
const FRAME_BUFFER: usize = 128;

/// POST /api/v1/ai/assistant
///
/// Validation, authorization and configuration errors return a JSON error
/// before the stream opens. Anything later arrives in-band as an `{"error"}` frame.
pub async fn handle_assistant(
    State(state): State<AppState>,
    caller: Caller,
    Json(req): Json<AssistantRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let turn = req.validate()?;
    let services = state.ai_services(&caller);
    services
        .authorize(
            &caller,
            turn.organization_id,
            turn.hr_specialist_id,
            turn.conversation_id,
        )
        .await?;

    let orchestrator = Orchestrator {
        services,
        attachments: state.attachments.clone(),
        limits: state.config.assistant,
    };
    let prepared = orchestrator.prepare(turn).await?;

    let (tx, rx) = mpsc::channel::<StreamFrame>(FRAME_BUFFER);
    let span = tracing::info_span!("assistant_turn", user_id = %caller.user_id);
    tokio::spawn(async move { orchestrator.run(prepared, tx).await }.instrument(span));

    Ok(sse_body(rx))
}
