//! Routes events to the shard that owns the entity they touch.
//!
//! Requests are homed by their pickup cell for their whole life. Drivers
//! follow their position: when an unbound driver comes online or reports a
//! location in another cell, its old shard hands it off and the new one
//! adopts it with counters and fairness history intact. Events that carry
//! only an id are resolved through the home directories.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::engine::dispatch_state::StateCounts;
use crate::engine::scheduler::Scheduler;
use crate::engine::shard::{
    shard_label, spawn_shard, ShardCommand, ShardContext, ShardHandle, ShardKey,
};
use crate::error::DispatchError;
use crate::estimator::CostEstimator;
use crate::geo::grid_cell;
use crate::models::driver::{Driver, GeoPoint};
use crate::models::event::{DispatchEvent, EventEnvelope, EventOutcome, PassTrigger};
use crate::models::request::RideRequest;

pub struct ShardRouter {
    dispatch: DispatchConfig,
    shard_cell_degrees: f64,
    queue_size: usize,
    estimator: Arc<dyn CostEstimator>,
    ctx: ShardContext,
    shards: DashMap<ShardKey, ShardHandle>,
    driver_home: DashMap<Uuid, ShardKey>,
}

impl ShardRouter {
    pub fn new(
        dispatch: DispatchConfig,
        shard_cell_degrees: f64,
        queue_size: usize,
        estimator: Arc<dyn CostEstimator>,
        ctx: ShardContext,
    ) -> Self {
        Self {
            dispatch,
            shard_cell_degrees,
            queue_size,
            estimator,
            ctx,
            shards: DashMap::new(),
            driver_home: DashMap::new(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_for(&self, point: &GeoPoint) -> ShardKey {
        grid_cell(point, self.shard_cell_degrees)
    }

    pub async fn submit(&self, envelope: EventEnvelope) -> Result<EventOutcome, DispatchError> {
        match &envelope.event {
            DispatchEvent::RequestArrived {
                request_id, pickup, ..
            } => {
                if !pickup.is_valid() {
                    return Ok(invalid_coordinates());
                }
                let request_id = *request_id;
                let home = self.ctx.request_home.get(&request_id).map(|entry| *entry.value());
                let key = home.unwrap_or_else(|| self.shard_for(pickup));

                let result = self.shard(key).submit(envelope).await;
                if home.is_none() && matches!(result, Ok(EventOutcome::Applied { .. })) {
                    self.ctx.request_home.insert(request_id, key);
                }
                result
            }
            DispatchEvent::RequestCancelled { request_id, .. }
            | DispatchEvent::PickupConfirmed { request_id, .. }
            | DispatchEvent::TripCompleted { request_id, .. } => {
                let key = self.request_home(request_id)?;
                self.shard(key).submit(envelope).await
            }
            DispatchEvent::DriverWentOnline {
                driver_id, location, ..
            } => {
                if !location.is_valid() {
                    return Ok(invalid_coordinates());
                }
                let driver_id = *driver_id;
                let target = self.shard_for(location);
                let home = self.driver_home.get(&driver_id).map(|entry| *entry.value());

                // A bound driver stays home, where the event gets rejected.
                let key = match home {
                    Some(previous) if previous != target => {
                        if self.move_driver(driver_id, previous, target).await? {
                            target
                        } else {
                            previous
                        }
                    }
                    _ => target,
                };

                let result = self.shard(key).submit(envelope).await;
                if home.is_none() && matches!(result, Ok(EventOutcome::Applied { .. })) {
                    self.driver_home.insert(driver_id, key);
                }
                result
            }
            DispatchEvent::DriverLocationUpdate {
                driver_id, location, ..
            } => {
                let (driver_id, location) = (*driver_id, *location);
                let home = self.driver_home(&driver_id)?;
                let outcome = self.shard(home).submit(envelope).await?;

                if matches!(outcome, EventOutcome::Applied { .. }) && location.is_valid() {
                    let target = self.shard_for(&location);
                    if target != home {
                        self.move_driver(driver_id, home, target).await?;
                    }
                }
                Ok(outcome)
            }
            DispatchEvent::DriverWentOffline { driver_id, .. } => {
                let key = self.driver_home(driver_id)?;
                self.shard(key).submit(envelope).await
            }
            DispatchEvent::TimerTick { .. } => {
                let handles: Vec<ShardHandle> =
                    self.shards.iter().map(|entry| entry.value().clone()).collect();
                debug!(shards = handles.len(), "timer tick fanned out");
                for handle in handles {
                    handle.send(ShardCommand::Tick).await?;
                }
                Ok(EventOutcome::Applied {
                    trigger: Some(PassTrigger::Window),
                })
            }
        }
    }

    pub async fn request(&self, request_id: &Uuid) -> Result<RideRequest, DispatchError> {
        let key = self.request_home(request_id)?;
        self.shard(key)
            .request(*request_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("request {request_id}")))
    }

    pub async fn driver(&self, driver_id: &Uuid) -> Result<Driver, DispatchError> {
        let key = self.driver_home(driver_id)?;
        self.shard(key)
            .driver(*driver_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("driver {driver_id}")))
    }

    /// Per-shard entity counts, ordered by shard key.
    pub async fn counts(&self) -> Result<Vec<(String, StateCounts)>, DispatchError> {
        let mut handles: Vec<ShardHandle> =
            self.shards.iter().map(|entry| entry.value().clone()).collect();
        handles.sort_by_key(|handle| handle.key);

        let mut counts = Vec::with_capacity(handles.len());
        for handle in handles {
            counts.push((shard_label(&handle.key), handle.counts().await?));
        }
        Ok(counts)
    }

    /// Hands an unbound driver from `from` to `to`. Returns false, leaving
    /// everything in place, when the driver holds an assignment.
    async fn move_driver(
        &self,
        driver_id: Uuid,
        from: ShardKey,
        to: ShardKey,
    ) -> Result<bool, DispatchError> {
        let Some(handoff) = self.shard(from).hand_off_driver(driver_id).await? else {
            debug!(driver_id = %driver_id, "bound driver keeps its shard");
            return Ok(false);
        };
        self.shard(to).adopt_driver(handoff).await?;
        self.driver_home.insert(driver_id, to);
        info!(
            driver_id = %driver_id,
            from = %shard_label(&from),
            to = %shard_label(&to),
            "driver re-homed"
        );
        Ok(true)
    }

    fn request_home(&self, request_id: &Uuid) -> Result<ShardKey, DispatchError> {
        self.ctx
            .request_home
            .get(request_id)
            .map(|entry| *entry.value())
            .ok_or_else(|| DispatchError::NotFound(format!("request {request_id}")))
    }

    fn driver_home(&self, driver_id: &Uuid) -> Result<ShardKey, DispatchError> {
        self.driver_home
            .get(driver_id)
            .map(|entry| *entry.value())
            .ok_or_else(|| DispatchError::NotFound(format!("driver {driver_id}")))
    }

    /// Returns the shard for `key`, spawning it on first use.
    fn shard(&self, key: ShardKey) -> ShardHandle {
        self.shards
            .entry(key)
            .or_insert_with(|| {
                info!(shard = %shard_label(&key), "spawning shard");
                let scheduler = Scheduler::new(self.dispatch.clone(), self.estimator.clone());
                spawn_shard(key, scheduler, self.queue_size, self.ctx.clone())
            })
            .clone()
    }
}

fn invalid_coordinates() -> EventOutcome {
    EventOutcome::Ignored {
        reason: "invalid coordinates".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use chrono::{DateTime, Duration, Utc};
    use dashmap::DashMap;
    use tokio::sync::broadcast;
    use uuid::Uuid;

    use super::ShardRouter;
    use crate::config::DispatchConfig;
    use crate::engine::shard::ShardContext;
    use crate::error::DispatchError;
    use crate::estimator::StraightLineEstimator;
    use crate::models::assignment::AssignmentNotice;
    use crate::models::driver::{DriverStatus, GeoPoint, VehicleClass};
    use crate::models::event::{DispatchEvent, EventEnvelope, EventOutcome};
    use crate::models::request::RequestStatus;
    use crate::observability::metrics::Metrics;

    fn router() -> (ShardRouter, broadcast::Receiver<AssignmentNotice>) {
        let (tx, rx) = broadcast::channel(16);
        let ctx = ShardContext {
            metrics: Metrics::new(),
            assignment_events_tx: tx,
            confirmed: Arc::new(DashMap::new()),
            request_home: Arc::new(DashMap::new()),
        };
        let router = ShardRouter::new(
            DispatchConfig::default(),
            0.5,
            64,
            Arc::new(StraightLineEstimator::default()),
            ctx,
        );
        (router, rx)
    }

    async fn send(router: &ShardRouter, sequence: u64, event: DispatchEvent) -> EventOutcome {
        router
            .submit(EventEnvelope::new("fleet", sequence, event))
            .await
            .unwrap()
    }

    async fn next_notice(rx: &mut broadcast::Receiver<AssignmentNotice>) -> AssignmentNotice {
        tokio::time::timeout(StdDuration::from_secs(5), rx.recv())
            .await
            .expect("assignment confirmed in time")
            .unwrap()
    }

    fn online(driver_id: Uuid, location: GeoPoint, at: DateTime<Utc>) -> DispatchEvent {
        DispatchEvent::DriverWentOnline {
            driver_id,
            location,
            vehicle_class: VehicleClass::Economy,
            at,
        }
    }

    fn arrived(request_id: Uuid, pickup: GeoPoint, at: DateTime<Utc>) -> DispatchEvent {
        DispatchEvent::RequestArrived {
            request_id,
            pickup,
            dropoff: GeoPoint::new(pickup.lat + 0.01, pickup.lng),
            vehicle_class: None,
            requested_at: at,
        }
    }

    #[tokio::test]
    async fn id_only_events_for_unknown_entities_are_not_found() {
        let (router, _) = router();
        let offline = DispatchEvent::DriverWentOffline {
            driver_id: Uuid::new_v4(),
            at: Utc::now(),
        };

        let err = router
            .submit(EventEnvelope::new("fleet", 1, offline))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::NotFound(_)));
        assert_eq!(router.shard_count(), 0);
    }

    #[tokio::test]
    async fn shards_are_spawned_per_cell_on_first_use() {
        let (router, _) = router();
        for (seq, lat) in [(1, 52.52), (2, 52.53), (3, 48.14)] {
            let location = GeoPoint::new(lat, 13.4);
            let outcome = send(&router, seq, online(Uuid::new_v4(), location, Utc::now())).await;
            assert!(matches!(outcome, EventOutcome::Applied { .. }));
        }

        assert_eq!(router.shard_count(), 2);
        let counts = router.counts().await.unwrap();
        let online: usize = counts.iter().map(|(_, c)| c.online_drivers).sum();
        assert_eq!(online, 3);
    }

    #[tokio::test]
    async fn driver_crossing_a_cell_line_is_matched_in_the_new_cell() {
        let (router, mut rx) = router();
        let t0 = Utc::now();
        let driver = Uuid::new_v4();
        let request = Uuid::new_v4();

        send(&router, 1, online(driver, GeoPoint::new(52.52, 13.01), t0)).await;
        let moved = DispatchEvent::DriverLocationUpdate {
            driver_id: driver,
            location: GeoPoint::new(52.52, 12.99),
            at: t0 + Duration::seconds(1),
        };
        send(&router, 2, moved).await;
        send(&router, 3, arrived(request, GeoPoint::new(52.5201, 12.9901), t0)).await;
        send(&router, 4, DispatchEvent::TimerTick { at: Utc::now() }).await;

        let notice = next_notice(&mut rx).await;
        assert_eq!(notice.request_id, request);
        assert_eq!(notice.driver_id, driver);
        assert_eq!(router.request(&request).await.unwrap().status, RequestStatus::Matched);

        let counts = router.counts().await.unwrap();
        let old_cell = counts.iter().find(|(label, _)| label == "105:26").unwrap();
        assert_eq!(old_cell.1.online_drivers, 0);
    }

    #[tokio::test]
    async fn rehomed_driver_keeps_its_assignment_count() {
        let (router, mut rx) = router();
        let t0 = Utc::now();
        let driver = Uuid::new_v4();
        let request = Uuid::new_v4();

        send(&router, 1, arrived(request, GeoPoint::new(52.5201, 13.0101), t0)).await;
        send(&router, 2, online(driver, GeoPoint::new(52.52, 13.01), t0)).await;
        next_notice(&mut rx).await;
        let pickup = DispatchEvent::PickupConfirmed {
            request_id: request,
            at: Utc::now(),
        };
        send(&router, 3, pickup).await;
        let done = DispatchEvent::TripCompleted {
            request_id: request,
            at: Utc::now(),
        };
        send(&router, 4, done).await;

        let moved = DispatchEvent::DriverLocationUpdate {
            driver_id: driver,
            location: GeoPoint::new(52.52, 12.99),
            at: t0 + Duration::seconds(60),
        };
        send(&router, 5, moved).await;

        let stored = router.driver(&driver).await.unwrap();
        assert_eq!(stored.status, DriverStatus::Available);
        assert_eq!(stored.assignment_count, 1);
        assert_eq!(stored.location, GeoPoint::new(52.52, 12.99));

        let counts = router.counts().await.unwrap();
        let online: Vec<(&str, usize)> = counts
            .iter()
            .map(|(label, c)| (label.as_str(), c.online_drivers))
            .collect();
        assert_eq!(online, vec![("105:25", 1), ("105:26", 0)]);
    }

    #[tokio::test]
    async fn bound_driver_reporting_from_another_cell_stays_home() {
        let (router, mut rx) = router();
        let t0 = Utc::now();
        let driver = Uuid::new_v4();
        let request = Uuid::new_v4();

        send(&router, 1, arrived(request, GeoPoint::new(52.5201, 13.0101), t0)).await;
        send(&router, 2, online(driver, GeoPoint::new(52.52, 13.01), t0)).await;
        next_notice(&mut rx).await;

        let moved = DispatchEvent::DriverLocationUpdate {
            driver_id: driver,
            location: GeoPoint::new(52.52, 12.99),
            at: t0 + Duration::seconds(30),
        };
        send(&router, 3, moved).await;

        assert_eq!(router.shard_count(), 1);
        let stored = router.driver(&driver).await.unwrap();
        assert_eq!(stored.status, DriverStatus::Assigned);
        assert_eq!(stored.location, GeoPoint::new(52.52, 12.99));
    }
}
