use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::driver::{GeoPoint, VehicleClass};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Matched,
    EnRoute,
    Completed,
    Cancelled,
    Expired,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Cancelled | RequestStatus::Expired
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideRequest {
    pub id: Uuid,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub requested_at: DateTime<Utc>,
    pub status: RequestStatus,
    /// Only drivers of this class are candidates when set.
    pub vehicle_class: Option<VehicleClass>,
    pub active_assignment: Option<Uuid>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl RideRequest {
    pub fn new(
        id: Uuid,
        pickup: GeoPoint,
        dropoff: GeoPoint,
        vehicle_class: Option<VehicleClass>,
        requested_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            pickup,
            dropoff,
            requested_at,
            status: RequestStatus::Pending,
            vehicle_class,
            active_assignment: None,
            closed_at: None,
        }
    }
}
