//! Travel-time capability consumed at decision time.
//!
//! The dispatch core never routes over a road graph itself. It asks a
//! [`CostEstimator`] for duration and distance, and degrades to a straight-line
//! estimate when the estimator is unavailable.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geo::haversine_km;
use crate::models::driver::GeoPoint;

pub const DEFAULT_AVERAGE_SPEED_KMH: f64 = 30.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RouteEstimate {
    pub duration_minutes: f64,
    pub distance_km: f64,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EstimateError {
    #[error("estimator unavailable: {0}")]
    Unavailable(String),

    #[error("invalid location: {0}")]
    InvalidLocation(String),
}

/// Implementations must be `Send + Sync`; shards share one estimator.
pub trait CostEstimator: Send + Sync {
    fn estimate(&self, origin: &GeoPoint, destination: &GeoPoint)
    -> Result<RouteEstimate, EstimateError>;
}

/// Great-circle distance at a constant average speed.
#[derive(Debug, Clone, Copy)]
pub struct StraightLineEstimator {
    average_speed_kmh: f64,
}

impl StraightLineEstimator {
    pub fn new(average_speed_kmh: f64) -> Self {
        Self { average_speed_kmh }
    }

    pub fn straight_line(&self, origin: &GeoPoint, destination: &GeoPoint) -> RouteEstimate {
        let distance_km = haversine_km(origin, destination);
        RouteEstimate {
            duration_minutes: distance_km / self.average_speed_kmh * 60.0,
            distance_km,
        }
    }
}

impl Default for StraightLineEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_AVERAGE_SPEED_KMH)
    }
}

impl CostEstimator for StraightLineEstimator {
    fn estimate(
        &self,
        origin: &GeoPoint,
        destination: &GeoPoint,
    ) -> Result<RouteEstimate, EstimateError> {
        if !origin.is_valid() {
            return Err(EstimateError::InvalidLocation(format!("{origin:?}")));
        }
        if !destination.is_valid() {
            return Err(EstimateError::InvalidLocation(format!("{destination:?}")));
        }
        Ok(self.straight_line(origin, destination))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Estimated {
    pub route: RouteEstimate,
    /// Set when `route` is the straight-line fallback.
    pub fallback_cause: Option<EstimateError>,
}

impl Estimated {
    pub fn degraded(&self) -> bool {
        self.fallback_cause.is_some()
    }
}

/// `Unavailable` falls back to `fallback`; `InvalidLocation` is returned so the
/// caller can drop the pair.
pub fn estimate_or_fallback(
    estimator: &dyn CostEstimator,
    fallback: &StraightLineEstimator,
    origin: &GeoPoint,
    destination: &GeoPoint,
) -> Result<Estimated, EstimateError> {
    match estimator.estimate(origin, destination) {
        Ok(route) => Ok(Estimated {
            route,
            fallback_cause: None,
        }),
        Err(EstimateError::Unavailable(reason)) => {
            tracing::debug!(%reason, "cost estimator unavailable; using straight-line estimate");
            Ok(Estimated {
                route: fallback.straight_line(origin, destination),
                fallback_cause: Some(EstimateError::Unavailable(reason)),
            })
        }
        Err(err) => Err(err),
    }
}
