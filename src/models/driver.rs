use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum VehicleClass {
    Economy,
    Comfort,
    Xl,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DriverStatus {
    Offline,
    Available,
    Assigned,
    Busy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Driver {
    pub id: Uuid,
    pub location: GeoPoint,
    pub status: DriverStatus,
    pub vehicle_class: VehicleClass,
    pub last_location_update: DateTime<Utc>,
    /// Total seconds spent Available, summed over every idle stretch.
    pub idle_seconds: f64,
    pub assignment_count: u64,
    /// Start of the current idle stretch while Available.
    pub available_since: Option<DateTime<Utc>>,
    pub active_assignment: Option<Uuid>,
}

impl Driver {
    pub fn new(
        id: Uuid,
        location: GeoPoint,
        vehicle_class: VehicleClass,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            location,
            status: DriverStatus::Offline,
            vehicle_class,
            last_location_update: at,
            idle_seconds: 0.0,
            assignment_count: 0,
            available_since: None,
            active_assignment: None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.status != DriverStatus::Offline
    }
}
