use std::env;

use crate::error::AppError;

/// Upper bound for every duration knob (one year).
pub const MAX_DURATION_SECONDS: f64 = 365.0 * 24.0 * 3_600.0;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub event_queue_size: usize,
    pub event_buffer_size: usize,
    pub shard_cell_degrees: f64,
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

/// Tunables of the matching core. Durations are seconds, radii kilometres.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    pub matching_window_seconds: f64,
    pub max_search_radius_km: f64,
    pub radius_expansion_step_km: f64,
    pub max_wait_before_expiry_seconds: f64,
    /// 0 reduces to pure pickup-time minimisation, 1 to pure fairness rotation.
    pub fairness_weight: f64,
    pub max_exact_match_batch_size: usize,
    pub match_batch_trigger_size: usize,
    pub max_candidates_per_request: usize,
    pub driver_stale_after_seconds: f64,
    pub fairness_window_seconds: f64,
    pub fairness_idle_half_life_seconds: f64,
    pub fairness_idle_credit_minutes: f64,
    pub fairness_recency_bonus_minutes: f64,
    pub average_speed_kmh: f64,
    pub geo_cell_degrees: f64,
    /// How long terminal requests stay queryable before they are dropped.
    pub archive_retention_seconds: f64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            matching_window_seconds: 2.0,
            max_search_radius_km: 3.0,
            radius_expansion_step_km: 1.0,
            max_wait_before_expiry_seconds: 300.0,
            fairness_weight: 0.2,
            max_exact_match_batch_size: 64,
            match_batch_trigger_size: 128,
            max_candidates_per_request: 8,
            driver_stale_after_seconds: 60.0,
            fairness_window_seconds: 3_600.0,
            fairness_idle_half_life_seconds: 600.0,
            fairness_idle_credit_minutes: 10.0,
            fairness_recency_bonus_minutes: 5.0,
            average_speed_kmh: 30.0,
            geo_cell_degrees: 0.01,
            archive_retention_seconds: 3_600.0,
        }
    }
}

impl DispatchConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();

        let config = Self {
            matching_window_seconds: parse_or_default(
                "MATCHING_WINDOW_SECONDS",
                defaults.matching_window_seconds,
            )?,
            max_search_radius_km: parse_or_default(
                "MAX_SEARCH_RADIUS_KM",
                defaults.max_search_radius_km,
            )?,
            radius_expansion_step_km: parse_or_default(
                "RADIUS_EXPANSION_STEP_KM",
                defaults.radius_expansion_step_km,
            )?,
            max_wait_before_expiry_seconds: parse_or_default(
                "MAX_WAIT_BEFORE_EXPIRY_SECONDS",
                defaults.max_wait_before_expiry_seconds,
            )?,
            fairness_weight: parse_or_default("FAIRNESS_WEIGHT", defaults.fairness_weight)?,
            max_exact_match_batch_size: parse_or_default(
                "MAX_EXACT_MATCH_BATCH_SIZE",
                defaults.max_exact_match_batch_size,
            )?,
            match_batch_trigger_size: parse_or_default(
                "MATCH_BATCH_TRIGGER_SIZE",
                defaults.match_batch_trigger_size,
            )?,
            max_candidates_per_request: parse_or_default(
                "MAX_CANDIDATES_PER_REQUEST",
                defaults.max_candidates_per_request,
            )?,
            driver_stale_after_seconds: parse_or_default(
                "DRIVER_STALE_AFTER_SECONDS",
                defaults.driver_stale_after_seconds,
            )?,
            fairness_window_seconds: parse_or_default(
                "FAIRNESS_WINDOW_SECONDS",
                defaults.fairness_window_seconds,
            )?,
            fairness_idle_half_life_seconds: parse_or_default(
                "FAIRNESS_IDLE_HALF_LIFE_SECONDS",
                defaults.fairness_idle_half_life_seconds,
            )?,
            fairness_idle_credit_minutes: parse_or_default(
                "FAIRNESS_IDLE_CREDIT_MINUTES",
                defaults.fairness_idle_credit_minutes,
            )?,
            fairness_recency_bonus_minutes: parse_or_default(
                "FAIRNESS_RECENCY_BONUS_MINUTES",
                defaults.fairness_recency_bonus_minutes,
            )?,
            average_speed_kmh: parse_or_default("AVERAGE_SPEED_KMH", defaults.average_speed_kmh)?,
            geo_cell_degrees: parse_or_default("GEO_CELL_DEGREES", defaults.geo_cell_degrees)?,
            archive_retention_seconds: parse_or_default(
                "ARCHIVE_RETENTION_SECONDS",
                defaults.archive_retention_seconds,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if !(0.0..=1.0).contains(&self.fairness_weight) {
            return Err(AppError::BadRequest(format!(
                "fairness_weight must be within [0, 1], got {}",
                self.fairness_weight
            )));
        }

        let durations = [
            ("matching_window_seconds", self.matching_window_seconds),
            ("max_wait_before_expiry_seconds", self.max_wait_before_expiry_seconds),
            ("fairness_window_seconds", self.fairness_window_seconds),
            ("fairness_idle_half_life_seconds", self.fairness_idle_half_life_seconds),
            ("driver_stale_after_seconds", self.driver_stale_after_seconds),
            ("archive_retention_seconds", self.archive_retention_seconds),
        ];
        let positive = [
            ("max_search_radius_km", self.max_search_radius_km),
            ("average_speed_kmh", self.average_speed_kmh),
            ("geo_cell_degrees", self.geo_cell_degrees),
        ];
        for (name, value) in durations.into_iter().chain(positive) {
            if !(value.is_finite() && value > 0.0) {
                return Err(AppError::BadRequest(format!("{name} must be > 0, got {value}")));
            }
        }
        for (name, value) in durations {
            if value > MAX_DURATION_SECONDS {
                return Err(AppError::BadRequest(format!(
                    "{name} must be at most {MAX_DURATION_SECONDS} seconds, got {value}"
                )));
            }
        }

        if self.radius_expansion_step_km < 0.0 {
            return Err(AppError::BadRequest(
                "radius_expansion_step_km cannot be negative".to_string(),
            ));
        }
        if self.max_candidates_per_request == 0 {
            return Err(AppError::BadRequest(
                "max_candidates_per_request must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
            event_queue_size: 1024,
            event_buffer_size: 1024,
            shard_cell_degrees: 0.5,
            dispatch: DispatchConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let log_format = match env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        };

        let shard_cell_degrees: f64 = parse_or_default("SHARD_CELL_DEGREES", 0.5)?;
        if !(shard_cell_degrees.is_finite() && shard_cell_degrees > 0.0) {
            return Err(AppError::BadRequest(format!(
                "SHARD_CELL_DEGREES must be > 0, got {shard_cell_degrees}"
            )));
        }

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format,
            event_queue_size: parse_or_default("EVENT_QUEUE_SIZE", 1024)?,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            shard_cell_degrees,
            dispatch: DispatchConfig::from_env()?,
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
