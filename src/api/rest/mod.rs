pub mod events;
pub mod queries;
pub mod ws;

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use axum::Router;
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::engine::dispatch_state::StateCounts;
use crate::error::AppError;
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(events::router())
        .merge(queries::router())
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[derive(Serialize)]
struct ShardHealth {
    shard: String,
    #[serde(flatten)]
    counts: StateCounts,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    assignments: usize,
    shards: Vec<ShardHealth>,
}

async fn health(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>, AppError> {
    let shards = state
        .router
        .counts()
        .await?
        .into_iter()
        .map(|(shard, counts)| ShardHealth { shard, counts })
        .collect();

    Ok(Json(HealthResponse {
        status: "ok",
        assignments: state.assignments.len(),
        shards,
    }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err).into_response(),
    }
}
