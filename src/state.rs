use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::Config;
use crate::engine::router::ShardRouter;
use crate::engine::shard::ShardContext;
use crate::estimator::CostEstimator;
use crate::models::assignment::AssignmentNotice;
use crate::observability::metrics::Metrics;

pub struct AppState {
    pub router: ShardRouter,
    /// Every confirmed assignment, keyed by assignment id.
    pub assignments: Arc<DashMap<Uuid, AssignmentNotice>>,
    pub assignment_events_tx: broadcast::Sender<AssignmentNotice>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: &Config, estimator: Arc<dyn CostEstimator>) -> Self {
        let (assignment_events_tx, _unused_rx) = broadcast::channel(config.event_buffer_size);
        let assignments = Arc::new(DashMap::new());
        let metrics = Metrics::new();

        let ctx = ShardContext {
            metrics: metrics.clone(),
            assignment_events_tx: assignment_events_tx.clone(),
            confirmed: assignments.clone(),
            request_home: Arc::new(DashMap::new()),
        };
        let router = ShardRouter::new(
            config.dispatch.clone(),
            config.shard_cell_degrees,
            config.event_queue_size,
            estimator,
            ctx,
        );

        Self {
            router,
            assignments,
            assignment_events_tx,
            metrics,
        }
    }
}
