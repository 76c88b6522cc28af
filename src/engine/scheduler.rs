//! Applies events to one shard's [`DispatchState`] in arrival order and runs
//! the matching cycle.
//!
//! A cycle is split in two so the async shard can apply events that queued
//! during the solve before anything is confirmed:
//! [`Scheduler::propose`] sweeps expiries, solves against a snapshot and
//! applies Proposed assignments; [`Scheduler::confirm`] confirms whatever
//! proposals survived and returns the notices to publish.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::engine::dispatch_state::{DispatchState, DriverHandoff};
use crate::engine::matching::{MatchEngine, MatchReport};
use crate::error::DispatchError;
use crate::estimator::CostEstimator;
use crate::models::assignment::AssignmentNotice;
use crate::models::driver::DriverStatus;
use crate::models::event::{DispatchEvent, EventEnvelope, EventOutcome, PassTrigger};
use crate::models::request::RideRequest;

/// Last sequence number seen per event source.
#[derive(Debug, Clone, Default)]
pub struct SequenceGuard {
    last_seen: HashMap<String, u64>,
}

impl SequenceGuard {
    /// Records `sequence` for `source`, rejecting replays and reordering.
    pub fn admit(&mut self, source: &str, sequence: u64) -> Result<(), DispatchError> {
        match self.last_seen.get_mut(source) {
            Some(last) if sequence <= *last => Err(DispatchError::DuplicateEvent {
                source_id: source.to_string(),
                sequence,
                last_seen: *last,
            }),
            Some(last) => {
                *last = sequence;
                Ok(())
            }
            None => {
                self.last_seen.insert(source.to_string(), sequence);
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub expired: Vec<Uuid>,
    /// Archived requests dropped after the retention period.
    pub pruned: Vec<Uuid>,
    pub proposed: Vec<Uuid>,
    pub rejected_proposals: usize,
    pub solve_seconds: f64,
    pub pending_after: usize,
    pub matching: Option<MatchReport>,
}

pub struct Scheduler {
    config: DispatchConfig,
    state: DispatchState,
    engine: MatchEngine,
    sequences: SequenceGuard,
    max_wait: Duration,
}

impl Scheduler {
    pub fn new(config: DispatchConfig, estimator: Arc<dyn CostEstimator>) -> Self {
        let state = DispatchState::new(&config);
        let engine = MatchEngine::new(&config, estimator);
        let max_wait =
            Duration::milliseconds((config.max_wait_before_expiry_seconds * 1000.0) as i64);

        Self {
            config,
            state,
            engine,
            sequences: SequenceGuard::default(),
            max_wait,
        }
    }

    pub fn state(&self) -> &DispatchState {
        &self.state
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Admits and applies one envelope. Rejected events leave the state
    /// untouched; the caller decides how loudly to report them.
    pub fn handle(
        &mut self,
        envelope: &EventEnvelope,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome, DispatchError> {
        self.sequences.admit(&envelope.source, envelope.sequence)?;
        self.apply(&envelope.event, now)
    }

    /// Applies an event that needs no sequence check (internal ticks and
    /// hand-offs between shards).
    pub fn apply(
        &mut self,
        event: &DispatchEvent,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome, DispatchError> {
        match event {
            DispatchEvent::RequestArrived {
                request_id,
                pickup,
                dropoff,
                vehicle_class,
                requested_at,
            } => {
                if !pickup.is_valid() || !dropoff.is_valid() {
                    return Ok(EventOutcome::Ignored {
                        reason: "invalid coordinates".to_string(),
                    });
                }
                self.state.add_request(RideRequest::new(
                    *request_id,
                    *pickup,
                    *dropoff,
                    *vehicle_class,
                    *requested_at,
                ))?;
                info!(request_id = %request_id, "request arrived");

                let trigger = (self.state.pending_count() >= self.config.match_batch_trigger_size)
                    .then_some(PassTrigger::Backpressure);
                Ok(EventOutcome::Applied { trigger })
            }
            DispatchEvent::RequestCancelled { request_id, at } => {
                let cancellation = self.state.cancel_request(*request_id, *at)?;
                info!(
                    request_id = %request_id,
                    freed_driver = ?cancellation.freed_driver,
                    reverted = cancellation.reverted_assignment.is_some(),
                    "request cancelled"
                );
                Ok(self.capacity_outcome(cancellation.freed_driver.is_some()))
            }
            DispatchEvent::DriverLocationUpdate {
                driver_id,
                location,
                at,
            } => {
                if !location.is_valid() {
                    return Ok(EventOutcome::Ignored {
                        reason: "invalid coordinates".to_string(),
                    });
                }
                if self.state.update_driver_location(*driver_id, *location, *at)? {
                    Ok(EventOutcome::applied())
                } else {
                    debug!(driver_id = %driver_id, at = %at, "stale location update ignored");
                    Ok(EventOutcome::Ignored {
                        reason: "location update not newer than last recorded".to_string(),
                    })
                }
            }
            DispatchEvent::DriverWentOnline {
                driver_id,
                location,
                vehicle_class,
                at,
            } => {
                if !location.is_valid() {
                    return Ok(EventOutcome::Ignored {
                        reason: "invalid coordinates".to_string(),
                    });
                }
                self.state
                    .driver_online(*driver_id, *location, *vehicle_class, *at)?;
                info!(driver_id = %driver_id, "driver online");
                Ok(self.capacity_outcome(true))
            }
            DispatchEvent::DriverWentOffline { driver_id, at } => {
                let requeued = self.state.driver_offline(*driver_id, *at)?;
                info!(driver_id = %driver_id, requeued = ?requeued, "driver offline");
                Ok(EventOutcome::applied())
            }
            DispatchEvent::PickupConfirmed { request_id, at } => {
                self.state.confirm_pickup(*request_id, *at)?;
                info!(request_id = %request_id, "pickup confirmed");
                Ok(EventOutcome::applied())
            }
            DispatchEvent::TripCompleted { request_id, at } => {
                let driver_id = self.state.complete_trip(*request_id, *at)?;
                info!(request_id = %request_id, driver_id = %driver_id, "trip completed");
                Ok(self.capacity_outcome(true))
            }
            DispatchEvent::TimerTick { .. } => Ok(EventOutcome::Applied {
                trigger: Some(PassTrigger::Window),
            }),
        }
    }

    /// Expiry sweep, then solve and apply proposals.
    pub fn propose(&mut self, now: DateTime<Utc>) -> CycleReport {
        let expired = self.expire_overdue(now);

        let retention =
            Duration::milliseconds((self.config.archive_retention_seconds * 1000.0) as i64);
        let pruned = self.state.prune_archive(now - retention);
        if !pruned.is_empty() {
            debug!(pruned = pruned.len(), "archived requests pruned");
        }

        if self.state.pending_count() == 0 {
            return CycleReport {
                expired,
                pruned,
                proposed: Vec::new(),
                rejected_proposals: 0,
                solve_seconds: 0.0,
                pending_after: 0,
                matching: None,
            };
        }

        let started = Instant::now();
        let plan = {
            let snapshot = self.state.snapshot(now, self.engine.stale_after());
            self.engine.plan(&snapshot)
        };
        let solve_seconds = started.elapsed().as_secs_f64();

        let mut proposed = Vec::with_capacity(plan.proposals.len());
        let mut rejected = 0;
        for proposal in plan.proposals {
            match self.state.propose(
                proposal.request_id,
                proposal.driver_id,
                proposal.estimated_trip_cost,
                proposal.breakdown,
                now,
            ) {
                Ok(assignment) => {
                    debug!(
                        assignment_id = %assignment.id,
                        request_id = %assignment.request_id,
                        driver_id = %assignment.driver_id,
                        cost = assignment.score_breakdown.cost,
                        "assignment proposed"
                    );
                    proposed.push(assignment.id);
                }
                Err(err) => {
                    rejected += 1;
                    report_rejection(&err, "proposal");
                }
            }
        }

        CycleReport {
            expired,
            pruned,
            proposed,
            rejected_proposals: rejected,
            solve_seconds,
            pending_after: self.state.pending_count(),
            matching: Some(plan.report),
        }
    }

    /// Confirms every surviving proposal, oldest first.
    pub fn confirm(&mut self, now: DateTime<Utc>) -> Vec<AssignmentNotice> {
        let mut notices = Vec::new();
        for assignment_id in self.state.proposed_assignment_ids() {
            match self.state.confirm(assignment_id, now) {
                Ok(notice) => {
                    info!(
                        assignment_id = %notice.assignment_id,
                        request_id = %notice.request_id,
                        driver_id = %notice.driver_id,
                        pickup_minutes = notice.estimated_pickup_minutes,
                        "assignment confirmed"
                    );
                    notices.push(notice);
                }
                Err(err) => report_rejection(&err, "confirmation"),
            }
        }
        notices
    }

    pub fn run_cycle(&mut self, now: DateTime<Utc>) -> (CycleReport, Vec<AssignmentNotice>) {
        let report = self.propose(now);
        let notices = self.confirm(now);
        (report, notices)
    }

    /// `handle` followed by a cycle when the event asks for one.
    pub fn process(
        &mut self,
        envelope: &EventEnvelope,
        now: DateTime<Utc>,
    ) -> Result<Vec<AssignmentNotice>, DispatchError> {
        let outcome = self.handle(envelope, now)?;
        if outcome.trigger().is_some() {
            return Ok(self.run_cycle(now).1);
        }
        Ok(Vec::new())
    }

    /// Releases an unbound driver so another shard can adopt it.
    pub fn hand_off_driver(
        &mut self,
        driver_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<DriverHandoff>, DispatchError> {
        self.state.hand_off_driver(driver_id, now)
    }

    /// Takes over a driver from another shard. Returns a pass trigger when the
    /// driver arrives Available while requests are waiting here.
    pub fn adopt_driver(
        &mut self,
        handoff: DriverHandoff,
        now: DateTime<Utc>,
    ) -> Result<EventOutcome, DispatchError> {
        let available = handoff.driver.status == DriverStatus::Available;
        self.state.adopt_driver(handoff, now)?;
        Ok(self.capacity_outcome(available))
    }

    fn expire_overdue(&mut self, now: DateTime<Utc>) -> Vec<Uuid> {
        let overdue: Vec<Uuid> = self
            .state
            .pending_ids()
            .into_iter()
            .filter(|id| {
                self.state
                    .request(id)
                    .is_some_and(|r| now - r.requested_at >= self.max_wait)
            })
            .collect();

        let mut expired = Vec::with_capacity(overdue.len());
        for request_id in overdue {
            match self.state.expire_request(request_id, now) {
                Ok(()) => {
                    warn!(request_id = %request_id, "request expired without a match");
                    expired.push(request_id);
                }
                Err(err) => report_rejection(&err, "expiry"),
            }
        }
        expired
    }

    fn capacity_outcome(&self, freed: bool) -> EventOutcome {
        let trigger =
            (freed && self.state.pending_count() > 0).then_some(PassTrigger::IdleCapacity);
        EventOutcome::Applied { trigger }
    }
}

pub fn report_rejection(err: &DispatchError, context: &str) {
    if err.is_operator_alert() {
        error!(error = %err, context, "invariant violation; event rejected");
    } else if matches!(err, DispatchError::DuplicateEvent { .. }) {
        debug!(error = %err, context, "duplicate event ignored");
    } else {
        warn!(error = %err, context, "event not applied");
    }
}
