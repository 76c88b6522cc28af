use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Json;
use axum::Router;

use crate::error::AppError;
use crate::models::event::{EventEnvelope, EventOutcome};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/events", post(ingest_event))
}

/// Hands one envelope to its shard and waits until the shard has applied it.
/// Matching happens afterwards; confirmed assignments arrive over `/ws`.
async fn ingest_event(
    State(state): State<Arc<AppState>>,
    Json(envelope): Json<EventEnvelope>,
) -> Result<(StatusCode, Json<EventOutcome>), AppError> {
    let outcome = state.router.submit(envelope).await?;
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}
