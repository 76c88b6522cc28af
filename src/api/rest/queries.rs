use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::Json;
use axum::Router;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::assignment::AssignmentNotice;
use crate::models::driver::Driver;
use crate::models::request::RideRequest;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/requests/:id", get(get_request))
        .route("/drivers/:id", get(get_driver))
        .route("/assignments", get(list_assignments))
}

async fn get_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<RideRequest>, AppError> {
    Ok(Json(state.router.request(&id).await?))
}

async fn get_driver(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Driver>, AppError> {
    Ok(Json(state.router.driver(&id).await?))
}

async fn list_assignments(State(state): State<Arc<AppState>>) -> Json<Vec<AssignmentNotice>> {
    let mut assignments: Vec<AssignmentNotice> = state
        .assignments
        .iter()
        .map(|entry| entry.value().clone())
        .collect();
    assignments.sort_by_key(|notice| notice.assigned_at);

    Json(assignments)
}
