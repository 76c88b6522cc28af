use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AssignmentStatus {
    Proposed,
    Confirmed,
    Cancelled,
    Completed,
}

impl AssignmentStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, AssignmentStatus::Proposed | AssignmentStatus::Confirmed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub pickup_minutes: f64,
    pub fairness_score: f64,
    pub cost: f64,
    /// The pickup estimate came from the straight-line fallback.
    pub degraded_estimate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Uuid,
    pub request_id: Uuid,
    pub driver_id: Uuid,
    pub estimated_pickup_minutes: f64,
    pub estimated_trip_cost: f64,
    pub score_breakdown: ScoreBreakdown,
    pub status: AssignmentStatus,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// What downstream delivery sees, once per confirmed assignment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssignmentNotice {
    pub assignment_id: Uuid,
    pub request_id: Uuid,
    pub driver_id: Uuid,
    pub estimated_pickup_minutes: f64,
    pub estimated_trip_cost: f64,
    pub assigned_at: DateTime<Utc>,
}
