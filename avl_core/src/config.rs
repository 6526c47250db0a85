//! Runtime configuration for the AVL core.
//!
//! Every tunable the matchers, generators and supervisor read lives in
//! [`CoreConfig`]. The core never owns persistence of these values: it reads
//! them through an injected [`ConfigProvider`], which may swap in a new
//! snapshot at any time (hot reload). Operations fetch the current snapshot
//! once at their start so a reload never tears a single report.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

// ============================================================================
// GENERATOR SELECTION
// ============================================================================

/// Which arrival/departure generator to compose at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ArrivalDepartureGeneratorKind {
    #[default]
    Default,
    /// Never emit arrivals/departures (matching-only deployments)
    Disabled,
}

/// Which prediction generator to compose at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PredictionGeneratorKind {
    #[default]
    Default,
    Disabled,
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// All documented tunables. Distances are meters, times seconds unless the
/// field name says otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    // === Spatial matching ===
    /// How far a fix may be from a segment and still match (default: 60)
    pub max_distance_from_segment: f64,

    /// Same gate when auto-assigning or matching to a route (default: 60)
    pub max_distance_from_segment_for_auto_assigning: f64,

    /// Allowed heading disagreement in degrees (default: 360 = disabled)
    pub max_heading_offset_from_segment: f32,

    /// Blocks matched initially must not be this close to their end (default: 250)
    pub distance_from_end_of_block_for_initial_matching: f64,

    /// Within this of the last stop an end-of-block match is added (default: 250)
    pub distance_from_last_stop_for_end_matching: f64,

    /// Fixes this far apart are needed to judge direction without heading (default: 100)
    pub distance_between_avls_for_initial_matching_without_heading: f64,

    /// Max plausible vehicle speed for the rematch look-ahead (default: 31.3 m/s)
    pub max_avl_speed: f64,

    /// Look-ahead = speed * factor * elapsed + slack (default: 1.2)
    pub avl_speed_margin_factor: f64,

    /// Constant term of the look-ahead window (default: 200)
    pub rematch_distance_slack: f64,

    /// Hard cap on stop paths searched ahead of the previous match (default: 999)
    pub max_stop_paths_ahead: i32,

    // === Layovers and deadheading ===
    /// How far from a layover stop a vehicle may be and still match it (default: 2000)
    pub layover_distance: f64,

    /// Layover candidate allowance relative to previous stop distance (default: 1.5)
    pub layover_deadhead_multiplier: f64,

    /// Within this of a layover the next path gives the display heading (default: 200)
    pub layover_heading_radius: f64,

    /// Boundary between short and long deadhead legs (default: 1000)
    pub deadheading_short_versus_long_distance: f64,

    /// m/s (default: 4.0)
    pub short_distance_deadheading_speed: f64,

    /// m/s (default: 10.0)
    pub long_distance_deadheading_speed: f64,

    /// Distance past a layover that counts as an early departure (default: 180)
    pub distance_from_layover_for_early_departure: f64,

    /// How early a layover departure may be and still be preferred (default: 300)
    pub allowable_early_time_for_early_departure_secs: i64,

    // === Stops ===
    /// Default "just before stop" threshold (default: 50)
    pub before_stop_distance: f64,

    /// Default "just after stop" threshold (default: 50)
    pub after_stop_distance: f64,

    /// Mandated driver break at wait stops (default: 0)
    pub default_break_time_secs: i64,

    // === Temporal matching ===
    pub allowable_early_secs: i64,
    pub allowable_late_secs: i64,
    pub allowable_early_secs_for_initial_matching: i64,
    pub allowable_late_secs_for_initial_matching: i64,

    /// Trips become candidates this long before they start (default: 3600)
    pub allowable_early_for_layover_secs: i64,

    /// Being early counts this many times worse than late (default: 3.0)
    pub early_to_late_ratio: f64,

    /// Only the hinted trip may match (default: false)
    pub strict_trip_assignment_match: bool,

    // === Assignment ===
    /// Bad matches tolerated before unassigning (default: 2)
    pub allowable_number_of_bad_matches: u32,

    /// Reports with a stale assignment tolerated before giving up (default: 0)
    pub allowable_bad_assignments: u32,

    /// One vehicle per block (default: true)
    pub exclusive_block_assignments: bool,

    /// Skip inactive blocks when matching to a route (default: true)
    pub ignore_inactive_blocks: bool,

    /// Route matches must be this far from trip terminals (default: 100)
    pub terminal_distance_for_route_matching: f64,

    /// Incumbent keeps a block if newcomer is farther than this (default: 10000)
    pub max_distance_for_assignment_grab: f64,

    /// Match farther than this from the fix raises an AVL conflict (default: 500)
    pub max_match_distance_from_avl_record: f64,

    pub time_for_determining_no_progress_secs: i64,
    pub min_distance_for_no_progress: f64,
    pub time_for_determining_delayed_secs: i64,
    pub min_distance_for_delayed: f64,

    /// Adherence lateness at a terminal that raises an event (default: 60)
    pub allowable_late_at_terminal_for_logging_event: i64,
    pub allowable_early_departure_time_for_logging_event: i64,
    pub allowable_late_departure_time_for_logging_event: i64,

    // === History ===
    pub match_history_max_size: usize,
    pub avl_history_max_size: usize,

    // === Arrivals / departures ===
    pub arrival_departure_generator: ArrivalDepartureGeneratorKind,

    /// A jump of at least this many stops is suspicious (default: 4)
    pub min_stops_for_too_many_stops: i32,

    /// ... when it exceeds one stop per this many seconds (default: 15)
    pub seconds_per_stop_for_too_many_stops: f64,

    /// Never infer events across more stops than this (default: 12)
    pub max_stops_between_matches: i32,

    /// Stops that may be back-filled on a first match (default: 1)
    pub max_stops_when_no_previous_match: i32,

    /// Events further than this from their AVL time are dropped (default: 86400)
    pub allowable_difference_between_avl_time_secs: i64,

    /// Dwell longer than this is implausible (default: 14400)
    pub max_dwell_time_secs: i64,

    // === Predictions ===
    pub prediction_generator: PredictionGeneratorKind,

    /// Prediction horizon (default: 2700)
    pub max_predictions_time_secs: i64,

    /// Predictions beyond this are not handed to the store (default: 1800)
    pub max_prediction_time_for_db_secs: i64,

    pub terminate_predictions_at_trip_end: bool,
    pub use_arrival_preds_for_normal_stops: bool,
    pub use_exact_sched_time_for_wait_stops: bool,

    /// Lateness past which later trips' predictions are uncertain (default: i32::MAX)
    pub max_late_cutoff_preds_for_next_trips_secs: i64,

    // === Timeouts ===
    pub allowable_no_avl_secs: i64,
    pub allowable_no_avl_after_sched_depart_secs: i64,
    pub timeout_polling_rate_secs: u64,
    pub sched_based_before_start_minutes: i64,
    pub sched_based_after_start_minutes: i64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_distance_from_segment: 60.0,
            max_distance_from_segment_for_auto_assigning: 60.0,
            max_heading_offset_from_segment: 360.0,
            distance_from_end_of_block_for_initial_matching: 250.0,
            distance_from_last_stop_for_end_matching: 250.0,
            distance_between_avls_for_initial_matching_without_heading: 100.0,
            max_avl_speed: 31.3, // ~70 mph
            avl_speed_margin_factor: 1.2,
            rematch_distance_slack: 200.0,
            max_stop_paths_ahead: 999,

            layover_distance: 2000.0,
            layover_deadhead_multiplier: 1.5,
            layover_heading_radius: 200.0,
            deadheading_short_versus_long_distance: 1000.0,
            short_distance_deadheading_speed: 4.0, // ~8 mph
            long_distance_deadheading_speed: 10.0, // ~20 mph
            distance_from_layover_for_early_departure: 180.0,
            allowable_early_time_for_early_departure_secs: 5 * 60,

            before_stop_distance: 50.0,
            after_stop_distance: 50.0,
            default_break_time_secs: 0,

            allowable_early_secs: 15 * 60,
            allowable_late_secs: 90 * 60,
            allowable_early_secs_for_initial_matching: 10 * 60,
            allowable_late_secs_for_initial_matching: 20 * 60,
            allowable_early_for_layover_secs: 60 * 60,
            early_to_late_ratio: 3.0,
            strict_trip_assignment_match: false,

            allowable_number_of_bad_matches: 2,
            allowable_bad_assignments: 0,
            exclusive_block_assignments: true,
            ignore_inactive_blocks: true,
            terminal_distance_for_route_matching: 100.0,
            max_distance_for_assignment_grab: 10_000.0,
            max_match_distance_from_avl_record: 500.0,
            time_for_determining_no_progress_secs: 8 * 60,
            min_distance_for_no_progress: 60.0,
            time_for_determining_delayed_secs: 4 * 60,
            min_distance_for_delayed: 60.0,
            allowable_late_at_terminal_for_logging_event: 60,
            allowable_early_departure_time_for_logging_event: 60,
            allowable_late_departure_time_for_logging_event: 4 * 60,

            match_history_max_size: 20,
            avl_history_max_size: 20,

            arrival_departure_generator: ArrivalDepartureGeneratorKind::Default,
            min_stops_for_too_many_stops: 4,
            seconds_per_stop_for_too_many_stops: 15.0,
            max_stops_between_matches: 12,
            max_stops_when_no_previous_match: 1,
            allowable_difference_between_avl_time_secs: 24 * 60 * 60,
            max_dwell_time_secs: 4 * 60 * 60,

            prediction_generator: PredictionGeneratorKind::Default,
            max_predictions_time_secs: 45 * 60,
            max_prediction_time_for_db_secs: 30 * 60,
            terminate_predictions_at_trip_end: false,
            use_arrival_preds_for_normal_stops: true,
            use_exact_sched_time_for_wait_stops: true,
            max_late_cutoff_preds_for_next_trips_secs: i32::MAX as i64,

            allowable_no_avl_secs: 6 * 60,
            allowable_no_avl_after_sched_depart_secs: 6 * 60,
            timeout_polling_rate_secs: 30,
            sched_based_before_start_minutes: 60,
            sched_based_after_start_minutes: 8,
        }
    }
}

impl CoreConfig {
    /// Parses a JSON document; absent keys keep their defaults.
    pub fn from_json(json: &str) -> CoreResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values that would make the matchers misbehave.
    pub fn validate(&self) -> CoreResult<()> {
        if self.match_history_max_size < 2 || self.avl_history_max_size < 2 {
            return Err(CoreError::Config(
                "history sizes must be at least 2".to_string(),
            ));
        }
        if self.early_to_late_ratio <= 0.0 {
            return Err(CoreError::Config("early_to_late_ratio must be positive".to_string()));
        }
        if self.seconds_per_stop_for_too_many_stops <= 0.0 {
            return Err(CoreError::Config(
                "seconds_per_stop_for_too_many_stops must be positive".to_string(),
            ));
        }
        if self.short_distance_deadheading_speed <= 0.0 || self.long_distance_deadheading_speed <= 0.0 {
            return Err(CoreError::Config("deadheading speeds must be positive".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// PROVIDERS
// ============================================================================

/// Source of the current configuration snapshot.
pub trait ConfigProvider: Send + Sync {
    fn current(&self) -> Arc<CoreConfig>;
}

/// Fixed configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticConfig(Arc<CoreConfig>);

impl StaticConfig {
    pub fn new(config: CoreConfig) -> Self {
        Self(Arc::new(config))
    }
}

impl ConfigProvider for StaticConfig {
    fn current(&self) -> Arc<CoreConfig> {
        Arc::clone(&self.0)
    }
}

/// Hot-reloadable configuration; readers keep whatever snapshot they took.
#[derive(Debug, Default)]
pub struct ReloadableConfig {
    inner: RwLock<Arc<CoreConfig>>,
}

impl ReloadableConfig {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            inner: RwLock::new(Arc::new(config)),
        }
    }

    /// Atomically replaces the active configuration.
    pub fn reload(&self, config: CoreConfig) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(config);
        tracing::info!("configuration reloaded");
    }

    /// Parses and applies a JSON document. Leaves the old config on error.
    pub fn reload_from_json(&self, json: &str) -> CoreResult<()> {
        let config = CoreConfig::from_json(json)?;
        self.reload(config);
        Ok(())
    }
}

impl ConfigProvider for ReloadableConfig {
    fn current(&self) -> Arc<CoreConfig> {
        Arc::clone(&self.inner.read().unwrap_or_else(|e| e.into_inner()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_documented_values() {
        let c = CoreConfig::default();
        assert_eq!(c.max_distance_from_segment, 60.0);
        assert_eq!(c.allowable_early_secs, 900);
        assert_eq!(c.allowable_late_secs, 5400);
        assert_eq!(c.seconds_per_stop_for_too_many_stops, 15.0);
        assert_eq!(c.layover_deadhead_multiplier, 1.5);
        assert_eq!(c.layover_heading_radius, 200.0);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let c = CoreConfig::from_json(r#"{"max_distance_from_segment": 80.0,
            "prediction_generator": "disabled"}"#)
            .unwrap();
        assert_eq!(c.max_distance_from_segment, 80.0);
        assert_eq!(c.prediction_generator, PredictionGeneratorKind::Disabled);
        assert_eq!(c.layover_distance, 2000.0);
    }

    #[test]
    fn test_invalid_json_rejected() {
        assert!(CoreConfig::from_json(r#"{"match_history_max_size": 1}"#).is_err());
        assert!(CoreConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_reloadable_config_swaps_snapshot() {
        let provider = ReloadableConfig::new(CoreConfig::default());
        let before = provider.current();

        provider
            .reload_from_json(r#"{"allowable_late_secs": 60}"#)
            .unwrap();

        // Old snapshot is untouched, new readers see the update
        assert_eq!(before.allowable_late_secs, 5400);
        assert_eq!(provider.current().allowable_late_secs, 60);

        // A bad document leaves the active config alone
        assert!(provider.reload_from_json("{").is_err());
        assert_eq!(provider.current().allowable_late_secs, 60);
    }
}
