use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::driver::{GeoPoint, VehicleClass};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DispatchEvent {
    RequestArrived {
        request_id: Uuid,
        pickup: GeoPoint,
        dropoff: GeoPoint,
        #[serde(default)]
        vehicle_class: Option<VehicleClass>,
        requested_at: DateTime<Utc>,
    },
    RequestCancelled {
        request_id: Uuid,
        at: DateTime<Utc>,
    },
    DriverLocationUpdate {
        driver_id: Uuid,
        location: GeoPoint,
        at: DateTime<Utc>,
    },
    DriverWentOnline {
        driver_id: Uuid,
        location: GeoPoint,
        vehicle_class: VehicleClass,
        at: DateTime<Utc>,
    },
    DriverWentOffline {
        driver_id: Uuid,
        at: DateTime<Utc>,
    },
    PickupConfirmed {
        request_id: Uuid,
        at: DateTime<Utc>,
    },
    TripCompleted {
        request_id: Uuid,
        at: DateTime<Utc>,
    },
    TimerTick {
        at: DateTime<Utc>,
    },
}

impl DispatchEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchEvent::RequestArrived { .. } => "request_arrived",
            DispatchEvent::RequestCancelled { .. } => "request_cancelled",
            DispatchEvent::DriverLocationUpdate { .. } => "driver_location_update",
            DispatchEvent::DriverWentOnline { .. } => "driver_went_online",
            DispatchEvent::DriverWentOffline { .. } => "driver_went_offline",
            DispatchEvent::PickupConfirmed { .. } => "pickup_confirmed",
            DispatchEvent::TripCompleted { .. } => "trip_completed",
            DispatchEvent::TimerTick { .. } => "timer_tick",
        }
    }
}

/// An event as it crosses the ingestion boundary. `sequence` is monotonic per
/// `source` and is what lets a shard spot replays and reordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub source: String,
    pub sequence: u64,
    pub event: DispatchEvent,
}

impl EventEnvelope {
    pub fn new(source: impl Into<String>, sequence: u64, event: DispatchEvent) -> Self {
        Self {
            source: source.into(),
            sequence,
            event,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PassTrigger {
    /// A driver became Available while requests are waiting.
    IdleCapacity,
    /// The Pending pool reached the batch trigger size.
    Backpressure,
    Window,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EventOutcome {
    Applied { trigger: Option<PassTrigger> },
    Ignored { reason: String },
}

impl EventOutcome {
    pub fn applied() -> Self {
        EventOutcome::Applied { trigger: None }
    }

    pub fn trigger(&self) -> Option<PassTrigger> {
        match self {
            EventOutcome::Applied { trigger } => *trigger,
            EventOutcome::Ignored { .. } => None,
        }
    }
}
