//! Authoritative model of requests, drivers and assignments for one shard.
//!
//! Every transition goes through a method on [`DispatchState`]. Each method
//! validates the whole transition before touching anything, so a rejected
//! event leaves the state exactly as it was.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::engine::fairness::{FairnessLedger, FairnessPolicy, FairnessTracker};
use crate::error::DispatchError;
use crate::geo::GeoIndex;
use crate::models::assignment::{Assignment, AssignmentNotice, AssignmentStatus, ScoreBreakdown};
use crate::models::driver::{Driver, DriverStatus, GeoPoint, VehicleClass};
use crate::models::request::{RequestStatus, RideRequest};

const AUDIT_CAPACITY: usize = 4_096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntityKind {
    Request,
    Driver,
    Assignment,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub kind: EntityKind,
    pub id: Uuid,
    pub from: String,
    pub to: String,
    pub reason: &'static str,
}

/// What a cancellation released, if anything.
#[derive(Debug, Clone, PartialEq)]
pub struct Cancellation {
    pub freed_driver: Option<Uuid>,
    pub reverted_assignment: Option<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StateCounts {
    pub pending_requests: usize,
    pub active_requests: usize,
    pub archived_requests: usize,
    pub online_drivers: usize,
    pub available_drivers: usize,
    pub active_assignments: usize,
}

/// A driver leaving this shard with the history it needs to resume in
/// another one.
#[derive(Debug, Clone)]
pub struct DriverHandoff {
    pub driver: Driver,
    pub fairness: FairnessLedger,
}

/// Frozen view of a Pending request handed to the matcher.
#[derive(Debug, Clone)]
pub struct PendingView {
    pub id: Uuid,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub requested_at: DateTime<Utc>,
    pub vehicle_class: Option<VehicleClass>,
}

impl PendingView {
    pub fn waited_seconds(&self, now: DateTime<Utc>) -> f64 {
        (now - self.requested_at).num_milliseconds().max(0) as f64 / 1000.0
    }
}

#[derive(Debug, Clone)]
pub struct DriverView {
    pub id: Uuid,
    pub location: GeoPoint,
    pub vehicle_class: VehicleClass,
    pub fairness_score: f64,
}

/// Pending and Available pools as of `taken_at`. Borrowing the geo index ties
/// the snapshot's lifetime to an immutable borrow of the state, so nothing can
/// mutate the pools while a solve is looking at them.
#[derive(Debug)]
pub struct MatchSnapshot<'a> {
    pub taken_at: DateTime<Utc>,
    /// Oldest request first.
    pub pending: Vec<PendingView>,
    pub drivers: HashMap<Uuid, DriverView>,
    pub geo: &'a GeoIndex,
}

#[derive(Debug, Clone)]
pub struct DispatchState {
    requests: HashMap<Uuid, RideRequest>,
    archived_requests: HashMap<Uuid, RideRequest>,
    drivers: HashMap<Uuid, Driver>,
    assignments: HashMap<Uuid, Assignment>,
    archived_assignments: HashMap<Uuid, Assignment>,
    geo: GeoIndex,
    fairness: FairnessTracker,
    audit: VecDeque<AuditEntry>,
}

impl DispatchState {
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            requests: HashMap::new(),
            archived_requests: HashMap::new(),
            drivers: HashMap::new(),
            assignments: HashMap::new(),
            archived_assignments: HashMap::new(),
            geo: GeoIndex::new(config.geo_cell_degrees),
            fairness: FairnessTracker::new(FairnessPolicy::from_config(config)),
            audit: VecDeque::new(),
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn request(&self, id: &Uuid) -> Option<&RideRequest> {
        self.requests
            .get(id)
            .or_else(|| self.archived_requests.get(id))
    }

    pub fn driver(&self, id: &Uuid) -> Option<&Driver> {
        self.drivers.get(id)
    }

    pub fn assignment(&self, id: &Uuid) -> Option<&Assignment> {
        self.assignments
            .get(id)
            .or_else(|| self.archived_assignments.get(id))
    }

    /// Every assignment ever made for `request_id`, reverted ones included.
    pub fn assignment_history(&self, request_id: &Uuid) -> Vec<&Assignment> {
        self.assignments
            .values()
            .chain(self.archived_assignments.values())
            .filter(|a| a.request_id == *request_id)
            .collect()
    }

    pub fn archived_requests(&self) -> impl Iterator<Item = &RideRequest> {
        self.archived_requests.values()
    }

    pub fn pending_count(&self) -> usize {
        self.requests
            .values()
            .filter(|r| r.status == RequestStatus::Pending)
            .count()
    }

    pub fn pending_ids(&self) -> Vec<Uuid> {
        let mut pending: Vec<&RideRequest> = self
            .requests
            .values()
            .filter(|r| r.status == RequestStatus::Pending)
            .collect();
        pending.sort_by(|a, b| a.requested_at.cmp(&b.requested_at).then(a.id.cmp(&b.id)));
        pending.into_iter().map(|r| r.id).collect()
    }

    pub fn proposed_assignment_ids(&self) -> Vec<Uuid> {
        let mut proposed: Vec<&Assignment> = self
            .assignments
            .values()
            .filter(|a| a.status == AssignmentStatus::Proposed)
            .collect();
        proposed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        proposed.into_iter().map(|a| a.id).collect()
    }

    pub fn counts(&self) -> StateCounts {
        StateCounts {
            pending_requests: self.pending_count(),
            active_requests: self.requests.len(),
            archived_requests: self.archived_requests.len(),
            online_drivers: self.drivers.values().filter(|d| d.is_online()).count(),
            available_drivers: self
                .drivers
                .values()
                .filter(|d| d.status == DriverStatus::Available)
                .count(),
            active_assignments: self.assignments.len(),
        }
    }

    pub fn geo(&self) -> &GeoIndex {
        &self.geo
    }

    pub fn fairness(&self) -> &FairnessTracker {
        &self.fairness
    }

    /// Most recent transitions, oldest first.
    pub fn audit(&self) -> impl Iterator<Item = &AuditEntry> {
        self.audit.iter()
    }

    /// Available drivers whose position is fresher than `stale_after`.
    pub fn snapshot(&self, now: DateTime<Utc>, stale_after: Duration) -> MatchSnapshot<'_> {
        let mut pending: Vec<PendingView> = self
            .requests
            .values()
            .filter(|r| r.status == RequestStatus::Pending)
            .map(|r| PendingView {
                id: r.id,
                pickup: r.pickup,
                dropoff: r.dropoff,
                requested_at: r.requested_at,
                vehicle_class: r.vehicle_class,
            })
            .collect();
        pending.sort_by(|a, b| a.requested_at.cmp(&b.requested_at).then(a.id.cmp(&b.id)));

        let drivers = self
            .drivers
            .values()
            .filter(|d| d.status == DriverStatus::Available)
            .filter(|d| now - d.last_location_update <= stale_after)
            .map(|d| {
                (
                    d.id,
                    DriverView {
                        id: d.id,
                        location: d.location,
                        vehicle_class: d.vehicle_class,
                        fairness_score: self.fairness.score(&d.id, now),
                    },
                )
            })
            .collect();

        MatchSnapshot {
            taken_at: now,
            pending,
            drivers,
            geo: &self.geo,
        }
    }

    // ------------------------------------------------------------------
    // Driver transitions
    // ------------------------------------------------------------------

    /// Offline -> Available. Unknown drivers are registered on the way.
    pub fn driver_online(
        &mut self,
        driver_id: Uuid,
        location: GeoPoint,
        vehicle_class: VehicleClass,
        at: DateTime<Utc>,
    ) -> Result<(), DispatchError> {
        if let Some(driver) = self.drivers.get(&driver_id) {
            if driver.status != DriverStatus::Offline {
                return Err(DispatchError::invariant(
                    format!("driver {driver_id}"),
                    format!("cannot go online from {:?}", driver.status),
                ));
            }
        } else {
            self.drivers
                .insert(driver_id, Driver::new(driver_id, location, vehicle_class, at));
        }

        let driver = self
            .drivers
            .get_mut(&driver_id)
            .ok_or_else(|| DispatchError::NotFound(format!("driver {driver_id}")))?;
        if at >= driver.last_location_update {
            driver.location = location;
            driver.last_location_update = at;
        }
        driver.vehicle_class = vehicle_class;
        driver.status = DriverStatus::Available;
        driver.available_since = Some(at);
        let position = driver.location;

        self.geo.insert(driver_id, position);
        self.fairness.mark_available(driver_id, at);
        self.record(
            at,
            EntityKind::Driver,
            driver_id,
            DriverStatus::Offline,
            DriverStatus::Available,
            "went_online",
        );
        Ok(())
    }

    /// Available -> Offline, or the compensating path for a driver holding a
    /// proposal that was never confirmed. Returns the request put back into
    /// the Pending pool, if any.
    pub fn driver_offline(
        &mut self,
        driver_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<Uuid>, DispatchError> {
        let driver = self
            .drivers
            .get(&driver_id)
            .ok_or_else(|| DispatchError::NotFound(format!("driver {driver_id}")))?;

        let (status, active) = (driver.status, driver.active_assignment);

        let requeued = match status {
            DriverStatus::Available => None,
            DriverStatus::Assigned => {
                let assignment_id = active.ok_or_else(|| {
                    DispatchError::invariant(
                        format!("driver {driver_id}"),
                        "assigned without assignment",
                    )
                })?;
                let assignment = self.assignments.get(&assignment_id).ok_or_else(|| {
                    DispatchError::invariant(
                        format!("driver {driver_id}"),
                        format!("dangling assignment {assignment_id}"),
                    )
                })?;
                if assignment.status != AssignmentStatus::Proposed {
                    return Err(DispatchError::invariant(
                        format!("driver {driver_id}"),
                        "cannot go offline holding a confirmed assignment",
                    ));
                }
                let request_id = assignment.request_id;
                self.revert_proposal(assignment_id, at, "driver_offline")?;
                Some(request_id)
            }
            status => {
                return Err(DispatchError::invariant(
                    format!("driver {driver_id}"),
                    format!("cannot go offline from {status:?}"),
                ));
            }
        };

        let driver = self
            .drivers
            .get_mut(&driver_id)
            .ok_or_else(|| DispatchError::NotFound(format!("driver {driver_id}")))?;
        close_idle_stretch(driver, at);
        driver.status = DriverStatus::Offline;

        self.geo.remove(&driver_id);
        self.fairness.mark_unavailable(driver_id);
        self.record(
            at,
            EntityKind::Driver,
            driver_id,
            DriverStatus::Available,
            DriverStatus::Offline,
            "went_offline",
        );
        Ok(requeued)
    }

    /// Returns false (and changes nothing) for an update that is not newer
    /// than the last one recorded.
    pub fn update_driver_location(
        &mut self,
        driver_id: Uuid,
        location: GeoPoint,
        at: DateTime<Utc>,
    ) -> Result<bool, DispatchError> {
        let driver = self
            .drivers
            .get_mut(&driver_id)
            .ok_or_else(|| DispatchError::NotFound(format!("driver {driver_id}")))?;

        if at <= driver.last_location_update {
            return Ok(false);
        }

        if driver.is_online() && !self.geo.update(driver_id, location) {
            return Err(DispatchError::invariant(
                format!("driver {driver_id}"),
                "online but missing from the geo index",
            ));
        }
        driver.location = location;
        driver.last_location_update = at;
        Ok(true)
    }

    /// Removes an Offline or Available driver so another shard can adopt it.
    /// A driver bound to an assignment stays put and `None` is returned.
    pub fn hand_off_driver(
        &mut self,
        driver_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<DriverHandoff>, DispatchError> {
        let driver = self
            .drivers
            .get(&driver_id)
            .ok_or_else(|| DispatchError::NotFound(format!("driver {driver_id}")))?;
        let status = driver.status;
        if !matches!(status, DriverStatus::Offline | DriverStatus::Available) {
            return Ok(None);
        }

        let driver = self
            .drivers
            .remove(&driver_id)
            .ok_or_else(|| DispatchError::NotFound(format!("driver {driver_id}")))?;
        self.geo.remove(&driver_id);
        let fairness = self.fairness.take(&driver_id);
        self.record(at, EntityKind::Driver, driver_id, status, "HandedOff", "handed_off");
        Ok(Some(DriverHandoff { driver, fairness }))
    }

    /// Takes over a driver released by another shard's `hand_off_driver`,
    /// counters and fairness history included.
    pub fn adopt_driver(
        &mut self,
        handoff: DriverHandoff,
        at: DateTime<Utc>,
    ) -> Result<(), DispatchError> {
        let DriverHandoff { driver, fairness } = handoff;
        let driver_id = driver.id;
        if self.drivers.contains_key(&driver_id) {
            return Err(DispatchError::invariant(
                format!("driver {driver_id}"),
                "adopted by a shard that already holds it",
            ));
        }
        if driver.active_assignment.is_some()
            || !matches!(driver.status, DriverStatus::Offline | DriverStatus::Available)
        {
            return Err(DispatchError::invariant(
                format!("driver {driver_id}"),
                format!("cannot adopt from {:?}", driver.status),
            ));
        }

        let status = driver.status;
        if driver.is_online() {
            self.geo.insert(driver_id, driver.location);
        }
        self.fairness.restore(driver_id, fairness);
        self.drivers.insert(driver_id, driver);
        self.record(at, EntityKind::Driver, driver_id, "HandedOff", status, "adopted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Request transitions
    // ------------------------------------------------------------------

    pub fn add_request(&mut self, request: RideRequest) -> Result<(), DispatchError> {
        if self.request(&request.id).is_some() {
            return Err(DispatchError::invariant(
                format!("request {}", request.id),
                "request id already known",
            ));
        }
        if request.status != RequestStatus::Pending {
            return Err(DispatchError::invariant(
                format!("request {}", request.id),
                format!("new requests must be Pending, got {:?}", request.status),
            ));
        }

        self.audit_push(AuditEntry {
            at: request.requested_at,
            kind: EntityKind::Request,
            id: request.id,
            from: "None".to_string(),
            to: "Pending".to_string(),
            reason: "arrived",
        });
        self.requests.insert(request.id, request);
        Ok(())
    }

    /// Any non-terminal request can be cancelled. A bound driver goes back to
    /// Available; the request itself is not re-queued.
    pub fn cancel_request(
        &mut self,
        request_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Cancellation, DispatchError> {
        let request = self.active_request(&request_id)?;
        let (from, active) = (request.status, request.active_assignment);

        let mut cancellation = Cancellation {
            freed_driver: None,
            reverted_assignment: None,
        };

        if let Some(assignment_id) = active {
            let assignment = self.assignments.get(&assignment_id).ok_or_else(|| {
                DispatchError::invariant(
                    format!("request {request_id}"),
                    format!("dangling assignment {assignment_id}"),
                )
            })?;
            let (driver_id, created_at) = (assignment.driver_id, assignment.created_at);
            let was_proposed = assignment.status == AssignmentStatus::Proposed;

            self.close_assignment(
                assignment_id,
                AssignmentStatus::Cancelled,
                at,
                "request_cancelled",
            )?;
            if was_proposed {
                self.fairness.revoke_assignment(driver_id, created_at);
                if let Some(driver) = self.drivers.get_mut(&driver_id) {
                    driver.assignment_count = driver.assignment_count.saturating_sub(1);
                }
                cancellation.reverted_assignment = Some(assignment_id);
            }
            self.release_driver(driver_id, at, "request_cancelled")?;
            cancellation.freed_driver = Some(driver_id);
        }

        self.close_request(request_id, RequestStatus::Cancelled, at, "cancelled")?;
        tracing::debug!(request_id = %request_id, from = ?from, "request cancelled");
        Ok(cancellation)
    }

    pub fn expire_request(
        &mut self,
        request_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), DispatchError> {
        let request = self.active_request(&request_id)?;
        if request.status != RequestStatus::Pending {
            return Err(DispatchError::invariant(
                format!("request {request_id}"),
                format!("cannot expire from {:?}", request.status),
            ));
        }
        self.close_request(request_id, RequestStatus::Expired, at, "wait_timeout")
    }

    /// Binds a Pending request to an Available driver as one step.
    pub fn propose(
        &mut self,
        request_id: Uuid,
        driver_id: Uuid,
        estimated_trip_cost: f64,
        breakdown: ScoreBreakdown,
        at: DateTime<Utc>,
    ) -> Result<Assignment, DispatchError> {
        let request = self.active_request(&request_id)?;
        if request.status != RequestStatus::Pending {
            return Err(DispatchError::invariant(
                format!("request {request_id}"),
                format!("cannot match from {:?}", request.status),
            ));
        }
        let driver = self
            .drivers
            .get(&driver_id)
            .ok_or_else(|| DispatchError::NotFound(format!("driver {driver_id}")))?;
        if driver.status != DriverStatus::Available {
            return Err(DispatchError::invariant(
                format!("driver {driver_id}"),
                format!("cannot be assigned from {:?}", driver.status),
            ));
        }

        let assignment = Assignment {
            id: Uuid::new_v4(),
            request_id,
            driver_id,
            estimated_pickup_minutes: breakdown.pickup_minutes,
            estimated_trip_cost,
            score_breakdown: breakdown,
            status: AssignmentStatus::Proposed,
            created_at: at,
            confirmed_at: None,
            closed_at: None,
        };

        if let Some(request) = self.requests.get_mut(&request_id) {
            request.status = RequestStatus::Matched;
            request.active_assignment = Some(assignment.id);
        }
        if let Some(driver) = self.drivers.get_mut(&driver_id) {
            close_idle_stretch(driver, at);
            driver.status = DriverStatus::Assigned;
            driver.active_assignment = Some(assignment.id);
            driver.assignment_count += 1;
        }
        self.fairness.record_assignment(driver_id, at);
        self.assignments.insert(assignment.id, assignment.clone());

        self.record(
            at,
            EntityKind::Request,
            request_id,
            RequestStatus::Pending,
            RequestStatus::Matched,
            "matched",
        );
        self.record(
            at,
            EntityKind::Driver,
            driver_id,
            DriverStatus::Available,
            DriverStatus::Assigned,
            "matched",
        );
        self.record(
            at,
            EntityKind::Assignment,
            assignment.id,
            "None",
            AssignmentStatus::Proposed,
            "proposed",
        );
        Ok(assignment)
    }

    /// Proposed -> Confirmed. The returned notice is the one and only
    /// downstream emission for this assignment.
    pub fn confirm(
        &mut self,
        assignment_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<AssignmentNotice, DispatchError> {
        let assignment = self
            .assignments
            .get_mut(&assignment_id)
            .ok_or_else(|| DispatchError::NotFound(format!("assignment {assignment_id}")))?;
        if assignment.status != AssignmentStatus::Proposed {
            return Err(DispatchError::invariant(
                format!("assignment {assignment_id}"),
                format!("cannot confirm from {:?}", assignment.status),
            ));
        }

        assignment.status = AssignmentStatus::Confirmed;
        assignment.confirmed_at = Some(at);
        let notice = AssignmentNotice {
            assignment_id,
            request_id: assignment.request_id,
            driver_id: assignment.driver_id,
            estimated_pickup_minutes: assignment.estimated_pickup_minutes,
            estimated_trip_cost: assignment.estimated_trip_cost,
            assigned_at: at,
        };

        self.record(
            at,
            EntityKind::Assignment,
            assignment_id,
            AssignmentStatus::Proposed,
            AssignmentStatus::Confirmed,
            "confirmed",
        );
        Ok(notice)
    }

    /// Matched -> EnRoute and Assigned -> Busy.
    pub fn confirm_pickup(
        &mut self,
        request_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), DispatchError> {
        let request = self.active_request(&request_id)?;
        if request.status != RequestStatus::Matched {
            return Err(DispatchError::invariant(
                format!("request {request_id}"),
                format!("pickup from {:?}", request.status),
            ));
        }
        let assignment = self.bound_assignment(request)?;
        if assignment.status != AssignmentStatus::Confirmed {
            return Err(DispatchError::invariant(
                format!("request {request_id}"),
                format!("pickup before confirmation ({:?})", assignment.status),
            ));
        }
        let driver_id = assignment.driver_id;
        match self.drivers.get(&driver_id).map(|d| d.status) {
            Some(DriverStatus::Assigned) => {}
            other => {
                return Err(DispatchError::invariant(
                    format!("driver {driver_id}"),
                    format!("pickup with driver in {other:?}"),
                ));
            }
        }

        if let Some(request) = self.requests.get_mut(&request_id) {
            request.status = RequestStatus::EnRoute;
        }
        if let Some(driver) = self.drivers.get_mut(&driver_id) {
            driver.status = DriverStatus::Busy;
        }
        self.record(
            at,
            EntityKind::Request,
            request_id,
            RequestStatus::Matched,
            RequestStatus::EnRoute,
            "picked_up",
        );
        self.record(
            at,
            EntityKind::Driver,
            driver_id,
            DriverStatus::Assigned,
            DriverStatus::Busy,
            "picked_up",
        );
        Ok(())
    }

    /// EnRoute -> Completed; the driver returns to the pool. Returns the
    /// driver id.
    pub fn complete_trip(
        &mut self,
        request_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Uuid, DispatchError> {
        let request = self.active_request(&request_id)?;
        if request.status != RequestStatus::EnRoute {
            return Err(DispatchError::invariant(
                format!("request {request_id}"),
                format!("cannot complete from {:?}", request.status),
            ));
        }
        let assignment = self.bound_assignment(request)?;
        let (assignment_id, driver_id) = (assignment.id, assignment.driver_id);

        self.close_assignment(assignment_id, AssignmentStatus::Completed, at, "trip_completed")?;
        self.release_driver(driver_id, at, "trip_completed")?;
        self.close_request(request_id, RequestStatus::Completed, at, "trip_completed")?;
        Ok(driver_id)
    }

    /// Drops archived requests (and their assignments) closed before
    /// `cutoff`, returning the dropped request ids.
    pub fn prune_archive(&mut self, cutoff: DateTime<Utc>) -> Vec<Uuid> {
        let pruned: Vec<Uuid> = self
            .archived_requests
            .values()
            .filter(|r| r.closed_at.is_some_and(|closed| closed < cutoff))
            .map(|r| r.id)
            .collect();
        for id in &pruned {
            self.archived_requests.remove(id);
        }
        let archived_requests = &self.archived_requests;
        let active_requests = &self.requests;
        self.archived_assignments.retain(|_, a| {
            archived_requests.contains_key(&a.request_id)
                || active_requests.contains_key(&a.request_id)
        });
        pruned
    }

    // ------------------------------------------------------------------
    // Invariants
    // ------------------------------------------------------------------

    pub fn check_invariants(&self) -> Result<(), DispatchError> {
        let mut drivers_bound: HashMap<Uuid, Uuid> = HashMap::new();
        let mut requests_bound: HashMap<Uuid, Uuid> = HashMap::new();

        for assignment in self.assignments.values() {
            if !assignment.status.is_active() {
                return Err(DispatchError::invariant(
                    format!("assignment {}", assignment.id),
                    "closed assignment kept as active",
                ));
            }
            if drivers_bound.insert(assignment.driver_id, assignment.id).is_some() {
                return Err(DispatchError::invariant(
                    format!("driver {}", assignment.driver_id),
                    "bound to two active assignments",
                ));
            }
            if requests_bound.insert(assignment.request_id, assignment.id).is_some() {
                return Err(DispatchError::invariant(
                    format!("request {}", assignment.request_id),
                    "bound to two active assignments",
                ));
            }
        }

        for request in self.requests.values() {
            let bound = requests_bound.get(&request.id).copied();
            match request.status {
                RequestStatus::Matched | RequestStatus::EnRoute => {
                    if bound.is_none() || request.active_assignment != bound {
                        return Err(DispatchError::invariant(
                            format!("request {}", request.id),
                            format!("{:?} without its active assignment", request.status),
                        ));
                    }
                }
                RequestStatus::Pending => {
                    if bound.is_some() || request.active_assignment.is_some() {
                        return Err(DispatchError::invariant(
                            format!("request {}", request.id),
                            "Pending but bound",
                        ));
                    }
                }
                status => {
                    return Err(DispatchError::invariant(
                        format!("request {}", request.id),
                        format!("terminal {status:?} request left active"),
                    ));
                }
            }
        }

        for request in self.archived_requests.values() {
            if !request.status.is_terminal() {
                return Err(DispatchError::invariant(
                    format!("request {}", request.id),
                    format!("archived while {:?}", request.status),
                ));
            }
            if requests_bound.contains_key(&request.id) || request.active_assignment.is_some() {
                return Err(DispatchError::invariant(
                    format!("request {}", request.id),
                    "archived request still bound",
                ));
            }
        }

        for driver in self.drivers.values() {
            let bound = drivers_bound.get(&driver.id).copied();
            match driver.status {
                DriverStatus::Assigned | DriverStatus::Busy => {
                    if bound.is_none() || driver.active_assignment != bound {
                        return Err(DispatchError::invariant(
                            format!("driver {}", driver.id),
                            format!("{:?} without its active assignment", driver.status),
                        ));
                    }
                }
                DriverStatus::Available | DriverStatus::Offline => {
                    if bound.is_some() || driver.active_assignment.is_some() {
                        return Err(DispatchError::invariant(
                            format!("driver {}", driver.id),
                            format!("{:?} but bound", driver.status),
                        ));
                    }
                }
            }
            if driver.is_online() != self.geo.contains(&driver.id) {
                return Err(DispatchError::invariant(
                    format!("driver {}", driver.id),
                    "geo index out of sync with driver status",
                ));
            }
        }

        for assignment in self.assignments.values() {
            let request = self.requests.get(&assignment.request_id);
            let driver = self.drivers.get(&assignment.driver_id);
            let (Some(request), Some(driver)) = (request, driver) else {
                return Err(DispatchError::invariant(
                    format!("assignment {}", assignment.id),
                    "references a missing request or driver",
                ));
            };
            let coherent = matches!(
                (assignment.status, request.status, driver.status),
                (AssignmentStatus::Proposed, RequestStatus::Matched, DriverStatus::Assigned)
                    | (AssignmentStatus::Confirmed, RequestStatus::Matched, DriverStatus::Assigned)
                    | (AssignmentStatus::Confirmed, RequestStatus::EnRoute, DriverStatus::Busy)
            );
            if !coherent {
                return Err(DispatchError::invariant(
                    format!("assignment {}", assignment.id),
                    format!(
                        "{:?} with request {:?} and driver {:?}",
                        assignment.status, request.status, driver.status
                    ),
                ));
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn active_request(&self, request_id: &Uuid) -> Result<&RideRequest, DispatchError> {
        if let Some(request) = self.requests.get(request_id) {
            return Ok(request);
        }
        match self.archived_requests.get(request_id) {
            Some(archived) => Err(DispatchError::invariant(
                format!("request {request_id}"),
                format!("already terminal ({:?})", archived.status),
            )),
            None => Err(DispatchError::NotFound(format!("request {request_id}"))),
        }
    }

    fn bound_assignment(&self, request: &RideRequest) -> Result<&Assignment, DispatchError> {
        request
            .active_assignment
            .and_then(|id| self.assignments.get(&id))
            .ok_or_else(|| {
                DispatchError::invariant(
                    format!("request {}", request.id),
                    "missing active assignment",
                )
            })
    }

    /// Compensating transition for a proposal overtaken by a later event: the
    /// assignment is cancelled, the request goes back to Pending and the driver
    /// back to Available.
    fn revert_proposal(
        &mut self,
        assignment_id: Uuid,
        at: DateTime<Utc>,
        reason: &'static str,
    ) -> Result<(), DispatchError> {
        let assignment = self.assignments.get(&assignment_id).ok_or_else(|| {
            DispatchError::NotFound(format!("assignment {assignment_id}"))
        })?;
        let (request_id, driver_id, created_at) =
            (assignment.request_id, assignment.driver_id, assignment.created_at);

        self.close_assignment(assignment_id, AssignmentStatus::Cancelled, at, reason)?;
        self.fairness.revoke_assignment(driver_id, created_at);
        if let Some(driver) = self.drivers.get_mut(&driver_id) {
            driver.assignment_count = driver.assignment_count.saturating_sub(1);
        }
        self.release_driver(driver_id, at, reason)?;

        if let Some(request) = self.requests.get_mut(&request_id) {
            request.status = RequestStatus::Pending;
            request.active_assignment = None;
        }
        self.record(
            at,
            EntityKind::Request,
            request_id,
            RequestStatus::Matched,
            RequestStatus::Pending,
            reason,
        );
        Ok(())
    }

    fn close_assignment(
        &mut self,
        assignment_id: Uuid,
        status: AssignmentStatus,
        at: DateTime<Utc>,
        reason: &'static str,
    ) -> Result<(), DispatchError> {
        let mut assignment = self.assignments.remove(&assignment_id).ok_or_else(|| {
            DispatchError::NotFound(format!("assignment {assignment_id}"))
        })?;
        let from = assignment.status;
        assignment.status = status;
        assignment.closed_at = Some(at);

        if let Some(request) = self.requests.get_mut(&assignment.request_id) {
            request.active_assignment = None;
        }
        if let Some(driver) = self.drivers.get_mut(&assignment.driver_id) {
            driver.active_assignment = None;
        }
        self.archived_assignments.insert(assignment_id, assignment);
        self.record(at, EntityKind::Assignment, assignment_id, from, status, reason);
        Ok(())
    }

    fn release_driver(
        &mut self,
        driver_id: Uuid,
        at: DateTime<Utc>,
        reason: &'static str,
    ) -> Result<(), DispatchError> {
        let driver = self
            .drivers
            .get_mut(&driver_id)
            .ok_or_else(|| DispatchError::NotFound(format!("driver {driver_id}")))?;
        let from = driver.status;
        driver.status = DriverStatus::Available;
        driver.active_assignment = None;
        driver.available_since = Some(at);
        let position = driver.location;

        self.geo.insert(driver_id, position);
        self.fairness.mark_available(driver_id, at);
        self.record(at, EntityKind::Driver, driver_id, from, DriverStatus::Available, reason);
        Ok(())
    }

    fn close_request(
        &mut self,
        request_id: Uuid,
        status: RequestStatus,
        at: DateTime<Utc>,
        reason: &'static str,
    ) -> Result<(), DispatchError> {
        let mut request = self
            .requests
            .remove(&request_id)
            .ok_or_else(|| DispatchError::NotFound(format!("request {request_id}")))?;
        let from = request.status;
        request.status = status;
        request.active_assignment = None;
        request.closed_at = Some(at);
        self.archived_requests.insert(request_id, request);
        self.record(at, EntityKind::Request, request_id, from, status, reason);
        Ok(())
    }

    fn record(
        &mut self,
        at: DateTime<Utc>,
        kind: EntityKind,
        id: Uuid,
        from: impl std::fmt::Debug,
        to: impl std::fmt::Debug,
        reason: &'static str,
    ) {
        self.audit_push(AuditEntry {
            at,
            kind,
            id,
            from: strip_quotes(format!("{from:?}")),
            to: strip_quotes(format!("{to:?}")),
            reason,
        });
    }

    fn audit_push(&mut self, entry: AuditEntry) {
        if self.audit.len() == AUDIT_CAPACITY {
            self.audit.pop_front();
        }
        self.audit.push_back(entry);
    }
}

fn close_idle_stretch(driver: &mut Driver, at: DateTime<Utc>) {
    if let Some(since) = driver.available_since.take() {
        driver.idle_seconds += (at - since).num_milliseconds().max(0) as f64 / 1000.0;
    }
}

fn strip_quotes(raw: String) -> String {
    raw.trim_matches('"').to_string()
}
