use crate::models::assignment::ScoreBreakdown;

/// Keeps exact-solver weights inside i64 after scaling.
const COST_CLAMP_MINUTES: f64 = 100_000.0;

/// Lower is better. `fairness_weight` blends pickup minutes against the
/// driver's fairness score: 0 is pure pickup-time, 1 is pure rotation.
pub fn composite_cost(pickup_minutes: f64, fairness_score: f64, fairness_weight: f64) -> f64 {
    let weight = fairness_weight.clamp(0.0, 1.0);
    let cost = (1.0 - weight) * pickup_minutes - weight * fairness_score;
    cost.clamp(-COST_CLAMP_MINUTES, COST_CLAMP_MINUTES)
}

pub fn compute_breakdown(
    pickup_minutes: f64,
    fairness_score: f64,
    fairness_weight: f64,
    degraded_estimate: bool,
) -> ScoreBreakdown {
    ScoreBreakdown {
        pickup_minutes,
        fairness_score,
        cost: composite_cost(pickup_minutes, fairness_score, fairness_weight),
        degraded_estimate,
    }
}

/// Search radius after `waited_seconds` in the Pending pool: one expansion
/// step per elapsed matching window.
pub fn search_radius_km(
    base_radius_km: f64,
    expansion_step_km: f64,
    window_seconds: f64,
    waited_seconds: f64,
) -> f64 {
    let windows = (waited_seconds.max(0.0) / window_seconds).floor();
    base_radius_km + expansion_step_km * windows
}

#[cfg(test)]
mod tests {
    use super::{composite_cost, search_radius_km};

    #[test]
    fn zero_weight_is_pure_pickup_time() {
        assert_eq!(composite_cost(2.0, 0.0, 0.0), 2.0);
        assert_eq!(composite_cost(3.0, 5.0, 0.0), 3.0);
    }

    #[test]
    fn full_weight_prefers_the_more_deserving_driver() {
        let near_but_busy = composite_cost(2.0, 0.0, 1.0);
        let far_but_idle = composite_cost(3.0, 5.0, 1.0);
        assert!(far_but_idle < near_but_busy);
    }

    #[test]
    fn closer_driver_wins_when_fairness_is_equal() {
        let near = composite_cost(2.0, 4.0, 0.5);
        let far = composite_cost(3.0, 4.0, 0.5);
        assert!(near < far);
    }

    #[test]
    fn radius_grows_one_step_per_window() {
        assert_eq!(search_radius_km(3.0, 1.0, 2.0, 0.0), 3.0);
        assert_eq!(search_radius_km(3.0, 1.0, 2.0, 1.9), 3.0);
        assert_eq!(search_radius_km(3.0, 1.0, 2.0, 2.0), 4.0);
        assert_eq!(search_radius_km(3.0, 1.0, 2.0, 9.0), 7.0);
    }
}
