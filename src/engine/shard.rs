//! One geographic shard: a tokio task that owns a [`Scheduler`] outright.
//!
//! Commands arrive over a bounded mpsc channel and are applied one at a time,
//! which serializes every mutation inside the shard. The matching window is a
//! `tokio::time::interval`; it is the only thing the task waits on besides its
//! inbox.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::dispatch_state::{DriverHandoff, StateCounts};
use crate::engine::scheduler::{report_rejection, CycleReport, Scheduler};
use crate::error::DispatchError;
use crate::models::assignment::AssignmentNotice;
use crate::models::driver::Driver;
use crate::models::event::{EventEnvelope, EventOutcome, PassTrigger};
use crate::models::request::RideRequest;
use crate::observability::metrics::Metrics;

/// Coarse grid cell that owns everything homed inside it.
pub type ShardKey = (i32, i32);

pub fn shard_label(key: &ShardKey) -> String {
    format!("{}:{}", key.0, key.1)
}

pub type Reply<T> = oneshot::Sender<T>;

pub enum ShardCommand {
    Event {
        envelope: EventEnvelope,
        reply: Option<Reply<Result<EventOutcome, DispatchError>>>,
    },
    Tick,
    HandOffDriver {
        driver_id: Uuid,
        reply: Reply<Result<Option<DriverHandoff>, DispatchError>>,
    },
    AdoptDriver {
        handoff: DriverHandoff,
        reply: Reply<Result<EventOutcome, DispatchError>>,
    },
    GetRequest {
        request_id: Uuid,
        reply: Reply<Option<RideRequest>>,
    },
    GetDriver {
        driver_id: Uuid,
        reply: Reply<Option<Driver>>,
    },
    Counts {
        reply: Reply<StateCounts>,
    },
}

/// Shared sinks every shard writes into.
#[derive(Clone)]
pub struct ShardContext {
    pub metrics: Metrics,
    pub assignment_events_tx: broadcast::Sender<AssignmentNotice>,
    pub confirmed: Arc<DashMap<Uuid, AssignmentNotice>>,
    pub request_home: Arc<DashMap<Uuid, ShardKey>>,
}

#[derive(Clone)]
pub struct ShardHandle {
    pub key: ShardKey,
    tx: mpsc::Sender<ShardCommand>,
}

impl ShardHandle {
    pub async fn send(&self, command: ShardCommand) -> Result<(), DispatchError> {
        self.tx.send(command).await.map_err(|err| {
            DispatchError::ShardUnavailable(format!(
                "shard {} inbox closed: {err}",
                shard_label(&self.key)
            ))
        })
    }

    pub async fn submit(&self, envelope: EventEnvelope) -> Result<EventOutcome, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.send(ShardCommand::Event {
            envelope,
            reply: Some(reply),
        })
        .await?;
        self.await_reply(rx).await?
    }

    /// `None` when the driver is bound to an assignment and has to stay.
    pub async fn hand_off_driver(
        &self,
        driver_id: Uuid,
    ) -> Result<Option<DriverHandoff>, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.send(ShardCommand::HandOffDriver { driver_id, reply }).await?;
        self.await_reply(rx).await?
    }

    pub async fn adopt_driver(
        &self,
        handoff: DriverHandoff,
    ) -> Result<EventOutcome, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.send(ShardCommand::AdoptDriver { handoff, reply }).await?;
        self.await_reply(rx).await?
    }

    pub async fn request(&self, request_id: Uuid) -> Result<Option<RideRequest>, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.send(ShardCommand::GetRequest { request_id, reply }).await?;
        self.await_reply(rx).await
    }

    pub async fn driver(&self, driver_id: Uuid) -> Result<Option<Driver>, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.send(ShardCommand::GetDriver { driver_id, reply }).await?;
        self.await_reply(rx).await
    }

    pub async fn counts(&self) -> Result<StateCounts, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.send(ShardCommand::Counts { reply }).await?;
        self.await_reply(rx).await
    }

    async fn await_reply<T>(&self, rx: oneshot::Receiver<T>) -> Result<T, DispatchError> {
        rx.await.map_err(|_| {
            DispatchError::ShardUnavailable(format!(
                "shard {} dropped the reply",
                shard_label(&self.key)
            ))
        })
    }
}

pub fn spawn_shard(
    key: ShardKey,
    scheduler: Scheduler,
    queue_size: usize,
    ctx: ShardContext,
) -> ShardHandle {
    let (tx, rx) = mpsc::channel(queue_size);
    let worker = ShardWorker {
        label: shard_label(&key),
        scheduler,
        ctx,
    };
    tokio::spawn(worker.run(rx));
    ShardHandle { key, tx }
}

/// Applies the messages queued at call time and no more. Anything sent while
/// draining waits for the next turn of the loop.
fn drain_queued<T>(rx: &mut mpsc::Receiver<T>, mut apply: impl FnMut(T)) -> usize {
    let queued = rx.len();
    let mut applied = 0;
    while applied < queued {
        let Ok(message) = rx.try_recv() else { break };
        apply(message);
        applied += 1;
    }
    applied
}

struct ShardWorker {
    label: String,
    scheduler: Scheduler,
    ctx: ShardContext,
}

impl ShardWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<ShardCommand>) {
        let window = StdDuration::from_secs_f64(self.scheduler.config().matching_window_seconds);
        let mut ticker = interval(window);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(shard = %self.label, window_seconds = window.as_secs_f64(), "shard started");

        loop {
            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else { break };
                    if let Some(trigger) = self.on_command(command) {
                        self.cycle(trigger, &mut rx);
                    }
                }
                _ = ticker.tick() => self.cycle(PassTrigger::Window, &mut rx),
            }
        }

        warn!(shard = %self.label, "shard stopped: inbox closed");
    }

    /// Applies one command and returns the pass it asks for, if any.
    fn on_command(&mut self, command: ShardCommand) -> Option<PassTrigger> {
        match command {
            ShardCommand::Event { envelope, reply } => {
                let kind = envelope.event.kind();
                let result = self.scheduler.handle(&envelope, Utc::now());

                let outcome_label = match &result {
                    Ok(EventOutcome::Applied { .. }) => "applied",
                    Ok(EventOutcome::Ignored { .. }) => "ignored",
                    Err(err) => err.label(),
                };
                self.ctx
                    .metrics
                    .events_total
                    .with_label_values(&[kind, outcome_label])
                    .inc();

                let trigger = match &result {
                    Ok(outcome) => outcome.trigger(),
                    Err(err) => {
                        if err.is_operator_alert() {
                            self.ctx.metrics.invariant_violations_total.inc();
                        }
                        report_rejection(err, kind);
                        None
                    }
                };

                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
                trigger
            }
            ShardCommand::Tick => Some(PassTrigger::Window),
            ShardCommand::HandOffDriver { driver_id, reply } => {
                let result = self.scheduler.hand_off_driver(driver_id, Utc::now());
                if let Ok(Some(_)) = &result {
                    info!(shard = %self.label, driver_id = %driver_id, "driver handed off");
                }
                let _ = reply.send(result);
                None
            }
            ShardCommand::AdoptDriver { handoff, reply } => {
                let driver_id = handoff.driver.id;
                let result = self.scheduler.adopt_driver(handoff, Utc::now());
                let trigger = match &result {
                    Ok(outcome) => {
                        info!(shard = %self.label, driver_id = %driver_id, "driver adopted");
                        outcome.trigger()
                    }
                    Err(err) => {
                        if err.is_operator_alert() {
                            self.ctx.metrics.invariant_violations_total.inc();
                        }
                        report_rejection(err, "adopt_driver");
                        None
                    }
                };
                let _ = reply.send(result);
                trigger
            }
            ShardCommand::GetRequest { request_id, reply } => {
                let _ = reply.send(self.scheduler.state().request(&request_id).cloned());
                None
            }
            ShardCommand::GetDriver { driver_id, reply } => {
                let _ = reply.send(self.scheduler.state().driver(&driver_id).cloned());
                None
            }
            ShardCommand::Counts { reply } => {
                let _ = reply.send(self.scheduler.state().counts());
                None
            }
        }
    }

    /// Propose against a snapshot, apply whatever queued meanwhile, then
    /// confirm the proposals that survived.
    fn cycle(&mut self, trigger: PassTrigger, rx: &mut mpsc::Receiver<ShardCommand>) {
        let report = self.scheduler.propose(Utc::now());
        self.record_cycle(trigger, &report);

        let mut rerun = None;
        drain_queued(rx, |command| {
            if let Some(next) = self.on_command(command) {
                rerun = Some(next);
            }
        });

        let notices = self.scheduler.confirm(Utc::now());
        let reverted = report.proposed.len().saturating_sub(notices.len());
        if reverted > 0 {
            self.ctx
                .metrics
                .assignments_total
                .with_label_values(&["reverted"])
                .inc_by(reverted as u64);
        }
        self.publish(notices);

        self.ctx
            .metrics
            .pending_requests
            .with_label_values(&[self.label.as_str()])
            .set(self.scheduler.state().pending_count() as i64);

        if let Some(next) = rerun {
            debug!(shard = %self.label, trigger = ?next, "re-running cycle for queued events");
            let report = self.scheduler.propose(Utc::now());
            self.record_cycle(next, &report);
            let notices = self.scheduler.confirm(Utc::now());
            self.publish(notices);
        }
    }

    fn record_cycle(&self, trigger: PassTrigger, report: &CycleReport) {
        let metrics = &self.ctx.metrics;

        for request_id in &report.pruned {
            self.ctx.request_home.remove(request_id);
        }
        if !report.expired.is_empty() {
            metrics
                .requests_expired_total
                .inc_by(report.expired.len() as u64);
        }
        if report.rejected_proposals > 0 {
            metrics
                .assignments_total
                .with_label_values(&["rejected"])
                .inc_by(report.rejected_proposals as u64);
        }
        if !report.proposed.is_empty() {
            metrics
                .assignments_total
                .with_label_values(&["proposed"])
                .inc_by(report.proposed.len() as u64);
        }

        if let Some(matching) = &report.matching {
            metrics
                .match_pass_latency_seconds
                .with_label_values(&[matching.solver.label()])
                .observe(report.solve_seconds);
            if matching.estimator_fallbacks > 0 {
                metrics
                    .estimator_fallbacks_total
                    .inc_by(matching.estimator_fallbacks as u64);
            }
            debug!(
                shard = %self.label,
                trigger = ?trigger,
                solver = matching.solver.label(),
                batch = matching.batch_size,
                proposed = report.proposed.len(),
                pending = report.pending_after,
                issues = ?matching.issue_counts(),
                "match pass finished"
            );
        }
    }

    fn publish(&self, notices: Vec<AssignmentNotice>) {
        if notices.is_empty() {
            return;
        }
        self.ctx
            .metrics
            .assignments_total
            .with_label_values(&["confirmed"])
            .inc_by(notices.len() as u64);

        for notice in notices {
            self.ctx.confirmed.insert(notice.assignment_id, notice.clone());
            let _ = self.ctx.assignment_events_tx.send(notice);
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::drain_queued;

    #[tokio::test]
    async fn drain_stops_at_what_was_queued() {
        let (tx, mut rx) = mpsc::channel(16);
        for n in 0..3 {
            tx.send(n).await.unwrap();
        }

        let mut seen = Vec::new();
        let applied = drain_queued(&mut rx, |n| {
            seen.push(n);
            tx.try_send(n + 10).unwrap();
        });

        assert_eq!(applied, 3);
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(rx.len(), 3);
    }
}
