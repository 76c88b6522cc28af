use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::estimator::EstimateError;

/// Conditions raised inside a shard. Only `InvariantViolation` is an operator
/// alert; everything else is recovered locally.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DispatchError {
    #[error("cost estimator failure, using straight-line fallback: {0}")]
    TransientEstimatorFailure(#[from] EstimateError),

    #[error("no candidate driver for request {request_id}")]
    NoCandidateFound { request_id: Uuid },

    #[error("invariant violation on {entity}: {detail}")]
    InvariantViolation { entity: String, detail: String },

    #[error("batch of {batch} requests exceeds exact solver limit {limit}")]
    CapacityExceeded { batch: usize, limit: usize },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate or out-of-order event from {source_id}: sequence {sequence} <= {last_seen}")]
    DuplicateEvent {
        source_id: String,
        sequence: u64,
        last_seen: u64,
    },

    #[error("shard unavailable: {0}")]
    ShardUnavailable(String),
}

impl DispatchError {
    pub fn invariant(entity: impl std::fmt::Display, detail: impl Into<String>) -> Self {
        DispatchError::InvariantViolation {
            entity: entity.to_string(),
            detail: detail.into(),
        }
    }

    pub fn is_operator_alert(&self) -> bool {
        matches!(self, DispatchError::InvariantViolation { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            DispatchError::TransientEstimatorFailure(_) => "estimator_failure",
            DispatchError::NoCandidateFound { .. } => "no_candidate",
            DispatchError::InvariantViolation { .. } => "invariant_violation",
            DispatchError::CapacityExceeded { .. } => "capacity_exceeded",
            DispatchError::NotFound(_) => "not_found",
            DispatchError::DuplicateEvent { .. } => "duplicate",
            DispatchError::ShardUnavailable(_) => "shard_unavailable",
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::NotFound(msg) => AppError::NotFound(msg),
            DispatchError::ShardUnavailable(msg) => AppError::Unavailable(msg),
            other @ (DispatchError::InvariantViolation { .. }
            | DispatchError::DuplicateEvent { .. }) => AppError::Conflict(other.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}
