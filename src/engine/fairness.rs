//! Per-driver fairness accounting.
//!
//! A driver's score grows with the current idle stretch (saturating towards
//! `idle_credit_minutes` with half-life `idle_half_life`) and shrinks with the
//! number of assignments inside the rolling window. Scores are in
//! minute-equivalents so they trade directly against pickup time.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::config::DispatchConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FairnessPolicy {
    pub window: Duration,
    pub idle_half_life_seconds: f64,
    pub idle_credit_minutes: f64,
    pub recency_bonus_minutes: f64,
}

impl FairnessPolicy {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            window: Duration::milliseconds((config.fairness_window_seconds * 1000.0) as i64),
            idle_half_life_seconds: config.fairness_idle_half_life_seconds,
            idle_credit_minutes: config.fairness_idle_credit_minutes,
            recency_bonus_minutes: config.fairness_recency_bonus_minutes,
        }
    }
}

/// One driver's fairness history. Travels with the driver when it changes
/// shards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FairnessLedger {
    idle_since: Option<DateTime<Utc>>,
    recent: VecDeque<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct FairnessTracker {
    policy: FairnessPolicy,
    ledgers: HashMap<Uuid, FairnessLedger>,
}

impl FairnessTracker {
    pub fn new(policy: FairnessPolicy) -> Self {
        Self {
            policy,
            ledgers: HashMap::new(),
        }
    }

    /// Starts an idle stretch unless one is already running.
    pub fn mark_available(&mut self, driver_id: Uuid, at: DateTime<Utc>) {
        let ledger = self.ledgers.entry(driver_id).or_default();
        ledger.idle_since.get_or_insert(at);
    }

    pub fn mark_unavailable(&mut self, driver_id: Uuid) {
        if let Some(ledger) = self.ledgers.get_mut(&driver_id) {
            ledger.idle_since = None;
        }
    }

    pub fn record_assignment(&mut self, driver_id: Uuid, at: DateTime<Utc>) {
        let window = self.policy.window;
        let ledger = self.ledgers.entry(driver_id).or_default();
        ledger.idle_since = None;
        ledger.recent.push_back(at);
        prune(&mut ledger.recent, at, window);
    }

    /// Undo of `record_assignment` for a proposal that never got confirmed.
    pub fn revoke_assignment(&mut self, driver_id: Uuid, at: DateTime<Utc>) {
        if let Some(ledger) = self.ledgers.get_mut(&driver_id) {
            if let Some(pos) = ledger.recent.iter().rposition(|t| *t == at) {
                ledger.recent.remove(pos);
            }
        }
    }

    /// Removes and returns the ledger so another tracker can `restore` it.
    pub fn take(&mut self, driver_id: &Uuid) -> FairnessLedger {
        self.ledgers.remove(driver_id).unwrap_or_default()
    }

    pub fn restore(&mut self, driver_id: Uuid, ledger: FairnessLedger) {
        self.ledgers.insert(driver_id, ledger);
    }

    pub fn recent_assignments(&self, driver_id: &Uuid, now: DateTime<Utc>) -> usize {
        self.ledgers.get(driver_id).map_or(0, |ledger| {
            ledger
                .recent
                .iter()
                .filter(|t| now - **t <= self.policy.window)
                .count()
        })
    }

    pub fn idle_seconds(&self, driver_id: &Uuid, now: DateTime<Utc>) -> f64 {
        self.ledgers
            .get(driver_id)
            .and_then(|ledger| ledger.idle_since)
            .map_or(0.0, |since| {
                (now - since).num_milliseconds().max(0) as f64 / 1000.0
            })
    }

    /// Higher means more deserving of the next match.
    pub fn score(&self, driver_id: &Uuid, now: DateTime<Utc>) -> f64 {
        let idle = self.idle_seconds(driver_id, now);
        let idle_component = self.policy.idle_credit_minutes
            * (1.0 - 0.5_f64.powf(idle / self.policy.idle_half_life_seconds));
        let recent = self.recent_assignments(driver_id, now) as f64;
        let recency_component = self.policy.recency_bonus_minutes / (1.0 + recent);

        idle_component + recency_component
    }
}

fn prune(recent: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) {
    while let Some(front) = recent.front() {
        if now - *front > window {
            recent.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use uuid::Uuid;

    use super::{FairnessPolicy, FairnessTracker};

    fn policy() -> FairnessPolicy {
        FairnessPolicy {
            window: Duration::minutes(60),
            idle_half_life_seconds: 600.0,
            idle_credit_minutes: 10.0,
            recency_bonus_minutes: 5.0,
        }
    }

    #[test]
    fn idle_credit_grows_and_saturates() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
        let driver = Uuid::from_u128(1);
        let mut tracker = FairnessTracker::new(policy());
        tracker.mark_available(driver, t0);

        let fresh = tracker.score(&driver, t0);
        let half = tracker.score(&driver, t0 + Duration::minutes(10));
        let long = tracker.score(&driver, t0 + Duration::hours(10));

        assert!((fresh - 5.0).abs() < 1e-9);
        assert!((half - 10.0).abs() < 1e-9);
        assert!(long < 15.0 + 1e-9 && long > half);
    }

    #[test]
    fn assignments_reset_idle_and_lower_score() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
        let busy = Uuid::from_u128(1);
        let idle = Uuid::from_u128(2);
        let mut tracker = FairnessTracker::new(policy());
        tracker.mark_available(busy, t0);
        tracker.mark_available(idle, t0);

        tracker.record_assignment(busy, t0 + Duration::minutes(5));
        tracker.mark_available(busy, t0 + Duration::minutes(5));

        let now = t0 + Duration::minutes(5);
        assert_eq!(tracker.recent_assignments(&busy, now), 1);
        assert!(tracker.score(&idle, now) > tracker.score(&busy, now));
    }

    #[test]
    fn rolling_window_forgets_old_assignments() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
        let driver = Uuid::from_u128(1);
        let mut tracker = FairnessTracker::new(policy());

        tracker.record_assignment(driver, t0);
        assert_eq!(tracker.recent_assignments(&driver, t0 + Duration::minutes(30)), 1);
        assert_eq!(tracker.recent_assignments(&driver, t0 + Duration::minutes(61)), 0);
    }

    #[test]
    fn ledger_moves_between_trackers_intact() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
        let driver = Uuid::from_u128(1);
        let mut from = FairnessTracker::new(policy());
        let mut to = FairnessTracker::new(policy());

        from.record_assignment(driver, t0);
        from.mark_available(driver, t0 + Duration::minutes(5));
        let now = t0 + Duration::minutes(15);
        let before = from.score(&driver, now);

        let ledger = from.take(&driver);
        to.restore(driver, ledger);

        assert_eq!(from.recent_assignments(&driver, now), 0);
        assert_eq!(to.recent_assignments(&driver, now), 1);
        assert!((to.score(&driver, now) - before).abs() < 1e-9);
    }

    #[test]
    fn revoked_assignment_no_longer_counts() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
        let driver = Uuid::from_u128(1);
        let mut tracker = FairnessTracker::new(policy());

        tracker.record_assignment(driver, t0);
        tracker.revoke_assignment(driver, t0);
        assert_eq!(tracker.recent_assignments(&driver, t0), 0);
    }
}
