use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::engine::dispatch_state::{MatchSnapshot, PendingView};
use crate::engine::scoring::{compute_breakdown, search_radius_km};
use crate::engine::solver::{solve, Edge, MatchProblem, SolverKind};
use crate::error::DispatchError;
use crate::estimator::{estimate_or_fallback, CostEstimator, EstimateError, StraightLineEstimator};
use crate::models::assignment::ScoreBreakdown;

/// One winning pair, ready to be applied to the state as a Proposed
/// assignment.
#[derive(Debug, Clone)]
pub struct Proposal {
    pub request_id: Uuid,
    pub driver_id: Uuid,
    pub estimated_trip_cost: f64,
    pub breakdown: ScoreBreakdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchReport {
    pub solver: SolverKind,
    pub batch_size: usize,
    pub candidate_pairs: usize,
    pub estimator_fallbacks: usize,
    pub invalid_pairs: usize,
    /// Recoverable conditions hit during the pass. None of them stop matching.
    #[serde(skip)]
    pub issues: Vec<DispatchError>,
}

impl MatchReport {
    /// Issue count per error label, for logging.
    pub fn issue_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for issue in &self.issues {
            *counts.entry(issue.label()).or_insert(0) += 1;
        }
        counts
    }
}

#[derive(Debug, Clone)]
pub struct MatchPlan {
    pub proposals: Vec<Proposal>,
    /// Pending requests that did not win a driver this round.
    pub unmatched: Vec<Uuid>,
    pub report: MatchReport,
}

pub struct MatchEngine {
    estimator: Arc<dyn CostEstimator>,
    fallback: StraightLineEstimator,
    fairness_weight: f64,
    base_radius_km: f64,
    radius_step_km: f64,
    window_seconds: f64,
    candidates_per_request: usize,
    max_exact_batch: usize,
    stale_after: Duration,
}

impl MatchEngine {
    pub fn new(config: &DispatchConfig, estimator: Arc<dyn CostEstimator>) -> Self {
        Self {
            estimator,
            fallback: StraightLineEstimator::new(config.average_speed_kmh),
            fairness_weight: config.fairness_weight,
            base_radius_km: config.max_search_radius_km,
            radius_step_km: config.radius_expansion_step_km,
            window_seconds: config.matching_window_seconds,
            candidates_per_request: config.max_candidates_per_request,
            max_exact_batch: config.max_exact_match_batch_size,
            stale_after: Duration::milliseconds(
                (config.driver_stale_after_seconds * 1000.0) as i64,
            ),
        }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Radius used for `request` at the snapshot instant.
    pub fn radius_for(&self, request: &PendingView, snapshot: &MatchSnapshot<'_>) -> f64 {
        search_radius_km(
            self.base_radius_km,
            self.radius_step_km,
            self.window_seconds,
            request.waited_seconds(snapshot.taken_at),
        )
    }

    pub fn plan(&self, snapshot: &MatchSnapshot<'_>) -> MatchPlan {
        let mut problem = MatchProblem {
            requests: snapshot.pending.len(),
            ..MatchProblem::default()
        };
        let mut driver_slots: HashMap<Uuid, usize> = HashMap::new();
        let mut driver_ids: Vec<Uuid> = Vec::new();
        let mut breakdowns: Vec<ScoreBreakdown> = Vec::new();
        let mut issues = Vec::new();
        let mut fallbacks = 0;
        let mut invalid_pairs = 0;

        for (request_idx, request) in snapshot.pending.iter().enumerate() {
            let radius = self.radius_for(request, snapshot);
            let nearby = snapshot.geo.query_nearby_where(
                &request.pickup,
                radius,
                self.candidates_per_request,
                |id| {
                    snapshot.drivers.get(id).is_some_and(|driver| {
                        request
                            .vehicle_class
                            .is_none_or(|class| class == driver.vehicle_class)
                    })
                },
            );

            if nearby.is_empty() {
                debug!(
                    request_id = %request.id,
                    radius_km = radius,
                    "no candidate drivers in range"
                );
                issues.push(DispatchError::NoCandidateFound {
                    request_id: request.id,
                });
                continue;
            }

            for (driver_id, _distance_km) in nearby {
                let Some(driver) = snapshot.drivers.get(&driver_id) else {
                    continue;
                };

                let estimated = match estimate_or_fallback(
                    self.estimator.as_ref(),
                    &self.fallback,
                    &driver.location,
                    &request.pickup,
                ) {
                    Ok(estimated) => estimated,
                    Err(err) => {
                        warn!(
                            request_id = %request.id,
                            driver_id = %driver_id,
                            error = %err,
                            "dropping candidate pair"
                        );
                        invalid_pairs += 1;
                        continue;
                    }
                };
                if let Some(cause) = estimated.fallback_cause.clone() {
                    fallbacks += 1;
                    issues.push(DispatchError::TransientEstimatorFailure(cause));
                }

                let breakdown = compute_breakdown(
                    estimated.route.duration_minutes,
                    driver.fairness_score,
                    self.fairness_weight,
                    estimated.degraded(),
                );

                let driver_idx = *driver_slots.entry(driver_id).or_insert_with(|| {
                    driver_ids.push(driver_id);
                    driver_ids.len() - 1
                });

                problem.edges.push(Edge {
                    request: request_idx,
                    driver: driver_idx,
                    cost: breakdown.cost,
                });
                breakdowns.push(breakdown);
            }
        }
        problem.drivers = driver_ids.len();

        let solution = solve(&problem, self.max_exact_batch);
        if let Some((batch, limit)) = solution.exact_limit_exceeded {
            let err = DispatchError::CapacityExceeded { batch, limit };
            warn!(error = %err, "falling back to greedy solver");
            issues.push(err);
        }

        let mut matched = vec![false; snapshot.pending.len()];
        let mut proposals = Vec::with_capacity(solution.chosen.len());
        for edge_idx in &solution.chosen {
            let edge = problem.edges[*edge_idx];
            let request = &snapshot.pending[edge.request];
            matched[edge.request] = true;

            let (trip_cost, cause) = self.trip_cost(request);
            if let Some(cause) = cause {
                fallbacks += 1;
                issues.push(DispatchError::TransientEstimatorFailure(cause));
            }

            proposals.push(Proposal {
                request_id: request.id,
                driver_id: driver_ids[edge.driver],
                estimated_trip_cost: trip_cost,
                breakdown: breakdowns[*edge_idx].clone(),
            });
        }

        let unmatched = snapshot
            .pending
            .iter()
            .zip(&matched)
            .filter(|(_, matched)| !**matched)
            .map(|(request, _)| request.id)
            .collect();

        let batch_size = problem
            .edges
            .iter()
            .map(|edge| edge.request)
            .collect::<std::collections::HashSet<_>>()
            .len();

        MatchPlan {
            proposals,
            unmatched,
            report: MatchReport {
                solver: solution.solver,
                batch_size,
                candidate_pairs: problem.edges.len(),
                estimator_fallbacks: fallbacks,
                invalid_pairs,
                issues,
            },
        }
    }

    /// Estimated pickup-to-dropoff minutes. An unusable dropoff is priced by
    /// straight line rather than blocking the match.
    fn trip_cost(&self, request: &PendingView) -> (f64, Option<EstimateError>) {
        match estimate_or_fallback(
            self.estimator.as_ref(),
            &self.fallback,
            &request.pickup,
            &request.dropoff,
        ) {
            Ok(estimated) => (estimated.route.duration_minutes, estimated.fallback_cause),
            Err(err) => {
                warn!(
                    request_id = %request.id,
                    error = %err,
                    "trip estimate failed; using straight line"
                );
                let straight = self.fallback.straight_line(&request.pickup, &request.dropoff);
                (straight.duration_minutes, Some(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use chrono::{DateTime, Duration, TimeZone, Utc};
    use uuid::Uuid;

    use super::MatchEngine;
    use crate::config::DispatchConfig;
    use crate::engine::dispatch_state::DispatchState;
    use crate::error::DispatchError;
    use crate::estimator::{CostEstimator, EstimateError, RouteEstimate, StraightLineEstimator};
    use crate::models::driver::{GeoPoint, VehicleClass};
    use crate::models::request::RideRequest;

    fn t(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap() + Duration::seconds(seconds)
    }

    struct Unavailable;

    impl CostEstimator for Unavailable {
        fn estimate(&self, _: &GeoPoint, _: &GeoPoint) -> Result<RouteEstimate, EstimateError> {
            Err(EstimateError::Unavailable("offline".to_string()))
        }
    }

    /// Fixed pickup minutes per driver position, keyed by longitude.
    struct Table(HashMap<u64, f64>);

    impl CostEstimator for Table {
        fn estimate(
            &self,
            origin: &GeoPoint,
            _: &GeoPoint,
        ) -> Result<RouteEstimate, EstimateError> {
            self.0
                .get(&origin.lng.to_bits())
                .map(|minutes| RouteEstimate {
                    duration_minutes: *minutes,
                    distance_km: *minutes,
                })
                .ok_or_else(|| EstimateError::InvalidLocation(format!("{origin:?}")))
        }
    }

    fn config() -> DispatchConfig {
        DispatchConfig {
            fairness_weight: 0.0,
            ..DispatchConfig::default()
        }
    }

    fn online(state: &mut DispatchState, driver: Uuid, location: GeoPoint) {
        state
            .driver_online(driver, location, VehicleClass::Economy, t(0))
            .unwrap();
    }

    fn request(seed: u128, pickup: GeoPoint, at: DateTime<Utc>) -> RideRequest {
        RideRequest::new(
            Uuid::from_u128(seed),
            pickup,
            GeoPoint::new(pickup.lat + 0.01, pickup.lng),
            None,
            at,
        )
    }

    #[test]
    fn nearest_driver_wins_without_fairness() {
        let config = config();
        let mut state = DispatchState::new(&config);
        let near = Uuid::from_u128(1);
        let far = Uuid::from_u128(2);
        online(&mut state, near, GeoPoint::new(52.520, 13.401));
        online(&mut state, far, GeoPoint::new(52.520, 13.420));
        state.add_request(request(10, GeoPoint::new(52.520, 13.400), t(0))).unwrap();

        let engine = MatchEngine::new(&config, Arc::new(StraightLineEstimator::default()));
        let plan = engine.plan(&state.snapshot(t(1), engine.stale_after()));

        assert_eq!(plan.proposals.len(), 1);
        assert_eq!(plan.proposals[0].driver_id, near);
        assert!(plan.unmatched.is_empty());
    }

    #[test]
    fn out_of_range_requests_stay_unmatched() {
        let config = config();
        let mut state = DispatchState::new(&config);
        online(&mut state, Uuid::from_u128(1), GeoPoint::new(53.0, 13.4));
        state.add_request(request(10, GeoPoint::new(52.52, 13.4), t(0))).unwrap();

        let engine = MatchEngine::new(&config, Arc::new(StraightLineEstimator::default()));
        let plan = engine.plan(&state.snapshot(t(1), engine.stale_after()));

        assert!(plan.proposals.is_empty());
        assert_eq!(plan.unmatched, vec![Uuid::from_u128(10)]);
        assert_eq!(
            plan.report.issues,
            vec![DispatchError::NoCandidateFound {
                request_id: Uuid::from_u128(10)
            }]
        );
    }

    #[test]
    fn vehicle_class_preference_filters_candidates() {
        let config = config();
        let mut state = DispatchState::new(&config);
        let economy = Uuid::from_u128(1);
        let xl = Uuid::from_u128(2);
        online(&mut state, economy, GeoPoint::new(52.520, 13.401));
        state.driver_online(xl, GeoPoint::new(52.520, 13.410), VehicleClass::Xl, t(0)).unwrap();

        let mut wants_xl = request(10, GeoPoint::new(52.520, 13.400), t(0));
        wants_xl.vehicle_class = Some(VehicleClass::Xl);
        state.add_request(wants_xl).unwrap();

        let engine = MatchEngine::new(&config, Arc::new(StraightLineEstimator::default()));
        let plan = engine.plan(&state.snapshot(t(1), engine.stale_after()));

        assert_eq!(plan.proposals[0].driver_id, xl);
    }

    #[test]
    fn estimator_outage_degrades_instead_of_failing() {
        let config = config();
        let mut state = DispatchState::new(&config);
        online(&mut state, Uuid::from_u128(1), GeoPoint::new(52.520, 13.401));
        state.add_request(request(10, GeoPoint::new(52.520, 13.400), t(0))).unwrap();

        let engine = MatchEngine::new(&config, Arc::new(Unavailable));
        let plan = engine.plan(&state.snapshot(t(1), engine.stale_after()));

        assert_eq!(plan.proposals.len(), 1);
        assert!(plan.proposals[0].breakdown.degraded_estimate);
        assert_eq!(plan.report.estimator_fallbacks, 2);
        assert!(plan
            .report
            .issues
            .iter()
            .all(|issue| matches!(issue, DispatchError::TransientEstimatorFailure(_))));
        assert_eq!(plan.report.issue_counts().get("estimator_failure"), Some(&2));
    }

    #[test]
    fn invalid_pairs_are_skipped() {
        let config = config();
        let mut state = DispatchState::new(&config);
        let known = Uuid::from_u128(1);
        let unknown = Uuid::from_u128(2);
        online(&mut state, known, GeoPoint::new(52.520, 13.405));
        online(&mut state, unknown, GeoPoint::new(52.520, 13.401));
        state.add_request(request(10, GeoPoint::new(52.520, 13.400), t(0))).unwrap();

        let table = Table(HashMap::from([
            (13.405_f64.to_bits(), 4.0),
            (13.400_f64.to_bits(), 10.0),
        ]));
        let engine = MatchEngine::new(&config, Arc::new(table));
        let plan = engine.plan(&state.snapshot(t(1), engine.stale_after()));

        assert_eq!(plan.report.invalid_pairs, 1);
        assert_eq!(plan.proposals[0].driver_id, known);
    }

    #[test]
    fn radius_expands_with_wait_time() {
        let config = DispatchConfig {
            max_search_radius_km: 1.0,
            radius_expansion_step_km: 1.0,
            matching_window_seconds: 2.0,
            ..config()
        };
        let mut state = DispatchState::new(&config);
        let driver = Uuid::from_u128(1);
        // Roughly 2.2 km east of the pickup.
        online(&mut state, driver, GeoPoint::new(52.520, 13.433));
        state.add_request(request(10, GeoPoint::new(52.520, 13.400), t(0))).unwrap();

        let engine = MatchEngine::new(&config, Arc::new(StraightLineEstimator::default()));

        let early = engine.plan(&state.snapshot(t(0), engine.stale_after()));
        assert!(early.proposals.is_empty());

        state.update_driver_location(driver, GeoPoint::new(52.520, 13.433), t(4)).unwrap();
        let later = engine.plan(&state.snapshot(t(4), engine.stale_after()));
        assert_eq!(later.proposals.len(), 1);
    }
}
