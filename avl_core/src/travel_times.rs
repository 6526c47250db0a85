//! Travel time model.
//!
//! Expected travel time between two positions on the same block, built from
//! the per-stop-path travel and dwell times carried by the reference data.
//! Every computation here is a pure function of its inputs: the same two
//! matches against the same snapshot always produce the same duration.

use crate::config::{ConfigProvider, CoreConfig};
use crate::geo::Location;
use crate::indices::Indices;
use crate::reference::TravelTimesForStopPath;
use crate::spatial_match::SpatialMatch;
use std::sync::Arc;
use tracing::{debug, warn};

/// Where a match falls within the equal-length travel time pieces of its path.
struct PartialPath {
    index: usize,
    fraction: f64,
}

pub struct TravelTimes {
    config: Arc<dyn ConfigProvider>,
}

impl TravelTimes {
    pub fn new(config: Arc<dyn ConfigProvider>) -> Self {
        Self { config }
    }

    // ========================================================================
    // Deadheading estimates
    // ========================================================================

    /// Rough straight-line travel time (msec): slow for the first stretch,
    /// faster beyond it.
    pub fn crow_flies_msecs(&self, distance: f64) -> i64 {
        crow_flies_msecs(&self.config.current(), distance)
    }

    /// Time to drive from the stop before a layover to `new_loc`. Zero when
    /// the match is not at a layover or the layover opens the block.
    pub fn from_layover_arrival_to_new_loc(&self, layover_match: &SpatialMatch, new_loc: &Location) -> i64 {
        if !layover_match.is_layover() {
            return 0;
        }
        let Some(previous) = layover_match.match_at_previous_stop() else {
            return 0;
        };
        let Some(path) = previous.stop_path() else {
            return 0;
        };
        self.crow_flies_msecs(path.end_location().distance(new_loc))
    }

    // ========================================================================
    // Partial stop paths
    // ========================================================================

    fn partial_path(m: &SpatialMatch) -> Option<(PartialPath, &TravelTimesForStopPath)> {
        let tt = m.trip()?.travel_times(m.stop_path_index())?;
        let n = tt.num_segments();
        if n == 0 {
            return None;
        }
        let length = m.stop_path().map(|p| p.length).unwrap_or(0.0);
        if length <= 0.0 {
            return Some((PartialPath { index: n - 1, fraction: 1.0 }, tt));
        }
        let piece = length / n as f64;
        let along = m.distance_along_stop_path();
        let index = ((along / piece).max(0.0) as usize).min(n - 1);
        let fraction = ((along - index as f64 * piece) / piece).clamp(0.0, 1.0);
        Some((PartialPath { index, fraction }, tt))
    }

    /// Remaining travel time from the match to the end of its stop path.
    pub fn from_match_to_end_of_stop_path(&self, m: &SpatialMatch) -> i64 {
        let Some((partial, tt)) = Self::partial_path(m) else {
            return 0;
        };
        let in_piece = (tt.segment_msecs(partial.index) as f64 * (1.0 - partial.fraction)) as i64;
        let rest: i64 = (partial.index + 1..tt.num_segments()).map(|i| tt.segment_msecs(i)).sum();
        in_piece + rest
    }

    /// Travel time from the start of the match's stop path up to the match.
    pub fn from_beginning_of_stop_path_to_match(&self, m: &SpatialMatch) -> i64 {
        let Some((partial, tt)) = Self::partial_path(m) else {
            return 0;
        };
        let before: i64 = (0..partial.index).map(|i| tt.segment_msecs(i)).sum();
        before + (tt.segment_msecs(partial.index) as f64 * partial.fraction) as i64
    }

    pub fn for_stop_path(&self, indices: &Indices) -> i64 {
        indices.travel_time_for_path()
    }

    pub fn stop_time_for_stop_path(&self, indices: &Indices) -> i64 {
        indices.stop_time_for_path()
    }

    // ========================================================================
    // Between matches
    // ========================================================================

    /// Expected msec to get from `m1` to `m2` when departing `m1` at
    /// `epoch_ms`. Wait stops along the way stretch the time to their
    /// scheduled departure.
    pub fn between_matches(&self, vehicle_id: &str, epoch_ms: i64, m1: &SpatialMatch, m2: &SpatialMatch) -> i64 {
        let block = m1.block();
        let time_of_day = block.clock.seconds_into_day(epoch_ms);
        let mut indices = m1.indices().clone();
        let end = m2.indices();

        if !block.no_schedule() && m2.less_than(m1) {
            warn!(vehicle_id, ?m1, ?m2, "second match precedes first, travel time is 0");
            return 0;
        }

        let mut msecs = self.from_match_to_end_of_stop_path(m1);
        if indices.equal_stop_path(end) {
            msecs -= self.for_stop_path(&indices);
        } else {
            msecs += indices.stop_time_for_path();
        }
        if indices != *end && indices.is_wait_stop() {
            msecs = adjust_for_wait_stop(time_of_day, msecs, &indices);
        }

        let loop_same_path = block.no_schedule()
            && indices.stop_path_index() == end.stop_path_index()
            && m1.distance_along_stop_path() < m2.distance_along_stop_path();
        if !loop_same_path {
            indices = indices.increment_stop_path(epoch_ms);
            while indices.is_earlier_stop_path_than(end) && !indices.past_end_of_block(epoch_ms) {
                msecs += self.for_stop_path(&indices) + indices.stop_time_for_path();
                if indices.is_wait_stop() {
                    msecs = adjust_for_wait_stop(time_of_day, msecs, &indices);
                }
                indices = indices.increment_stop_path(epoch_ms);
            }
        }

        msecs += self.from_beginning_of_stop_path_to_match(m2);
        debug!(vehicle_id, travel_msecs = msecs, "travel time between matches");
        msecs
    }

    /// Scheduled departure (epoch ms) at a wait stop, closest to `reference_ms`.
    pub fn scheduled_departure_time(&self, indices: &Indices, reference_ms: i64) -> Option<i64> {
        if !indices.is_wait_stop() {
            warn!(?indices, "scheduled departure requested for a stop that is not a wait stop");
            return None;
        }
        let dep = indices.schedule_time()?.departure_secs?;
        Some(indices.block().clock.epoch_time(dep, reference_ms))
    }
}

/// Departing `time_of_day` with `msecs` of travel, a wait stop's scheduled
/// departure is a floor on the elapsed time.
fn adjust_for_wait_stop(time_of_day: i32, msecs: i64, indices: &Indices) -> i64 {
    match indices.schedule_time().and_then(|s| s.departure_secs) {
        Some(dep) if time_of_day as i64 * 1000 + msecs < dep as i64 * 1000 => (dep - time_of_day) as i64 * 1000,
        _ => msecs,
    }
}

pub(crate) fn crow_flies_msecs(config: &CoreConfig, distance: f64) -> i64 {
    let short_limit = config.deadheading_short_versus_long_distance;
    let (short, long) = if distance > short_limit {
        (short_limit, distance - short_limit)
    } else {
        (distance, 0.0)
    };
    let secs = short / config.short_distance_deadheading_speed + long / config.long_distance_deadheading_speed;
    (secs * 1000.0) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticConfig;
    use crate::indices::tests::{straight_trip, two_trip_block};
    use crate::reference::Block;
    use crate::service_time::ServiceClock;
    use proptest::prelude::*;

    // 2024-01-01 00:00 UTC
    const DAY: i64 = 1_704_067_200_000;

    fn tt() -> TravelTimes {
        TravelTimes::new(Arc::new(StaticConfig::default()))
    }

    /// Segment lengths carry float noise, so truncated msec values may be off by one.
    fn assert_msecs(actual: i64, expected: i64) {
        assert!((actual - expected).abs() <= 1, "{} != {}", actual, expected);
    }

    fn m(block: &Arc<Block>, trip: i32, sp: i32, seg: i32, along: f64) -> SpatialMatch {
        SpatialMatch::new(DAY, Indices::new(block.clone(), trip, sp, seg).unwrap(), 0.0, along)
    }

    #[test]
    fn test_crow_flies() {
        let t = tt();
        assert_eq!(t.crow_flies_msecs(400.0), 100_000);
        // 1000m at 4 m/s plus 1000m at 10 m/s
        assert_eq!(t.crow_flies_msecs(2000.0), 350_000);
    }

    #[test]
    fn test_partial_path_times() {
        let block = two_trip_block();
        let t = tt();
        // Path 1: 200m, one 60s travel time piece; 50m in is a quarter
        let quarter = m(&block, 0, 1, 0, 50.0);
        assert_msecs(t.from_beginning_of_stop_path_to_match(&quarter), 15_000);
        assert_msecs(t.from_match_to_end_of_stop_path(&quarter), 45_000);
    }

    #[test]
    fn test_same_stop_path() {
        let block = two_trip_block();
        let t = tt();
        let a = m(&block, 0, 2, 0, 0.0);
        let b = m(&block, 0, 2, 1, 50.0);
        // 150m of a 300m path with 60s travel
        assert_msecs(t.between_matches("v", DAY, &a, &b), 30_000);
    }

    #[test]
    fn test_across_stop_paths() {
        let block = two_trip_block();
        let t = tt();
        let a = m(&block, 0, 1, 0, 100.0);
        let b = m(&block, 0, 2, 1, 50.0);
        // 30s left on path 1, 30s into path 2
        let when = DAY + 7 * 3_600_000;
        assert_msecs(t.between_matches("v", when, &a, &b), 60_000);
    }

    #[test]
    fn test_backwards_is_zero() {
        let block = two_trip_block();
        let t = tt();
        let a = m(&block, 0, 2, 1, 50.0);
        let b = m(&block, 0, 1, 0, 100.0);
        assert_eq!(t.between_matches("v", DAY, &a, &b), 0);
    }

    #[test]
    fn test_wait_stop_stretches_to_departure() {
        let block = two_trip_block();
        let t = tt();
        // From mid trip 1 (08:01) into trip 2, which departs its layover at 09:00
        let a = m(&block, 0, 2, 1, 50.0);
        let b = m(&block, 1, 1, 0, 0.0);
        let departing = DAY + (8 * 3600 + 60) * 1000;
        let expected = (9 * 3600 - (8 * 3600 + 60)) as i64 * 1000;
        assert_eq!(t.between_matches("v", departing, &a, &b), expected);
    }

    #[test]
    fn test_scheduled_departure_time() {
        let block = two_trip_block();
        let t = tt();
        let layover = Indices::new(block.clone(), 1, 0, 0).unwrap();
        assert_eq!(t.scheduled_departure_time(&layover, DAY), Some(DAY + 9 * 3_600_000));
        let not_wait = Indices::new(block, 1, 1, 0).unwrap();
        assert_eq!(t.scheduled_departure_time(&not_wait, DAY), None);
    }

    #[test]
    fn test_layover_to_new_location() {
        let block = two_trip_block();
        let t = tt();
        let layover = m(&block, 1, 0, 0, 0.0);
        let end_of_t1 = block.trips[0].stop_paths[2].end_location();
        let away = end_of_t1.offset(0.0, 400.0);
        let msecs = t.from_layover_arrival_to_new_loc(&layover, &away);
        assert!((msecs - 100_000).abs() < 500);
        assert_eq!(t.from_layover_arrival_to_new_loc(&m(&block, 0, 1, 0, 10.0), &away), 0);
    }

    #[test]
    fn test_loop_block_same_path_ahead() {
        let trip = Arc::new(straight_trip("loop", 8 * 3600, &[1, 2, 2], true));
        let block = Arc::new(Block::new("lb", "svc", vec![trip], ServiceClock::new(0)).unwrap());
        let t = tt();
        let a = m(&block, 0, 2, 0, 50.0);
        let b = m(&block, 0, 2, 1, 50.0);
        assert_msecs(t.between_matches("v", DAY + 8 * 3_600_000, &a, &b), 30_000);
    }

    proptest! {
        #[test]
        fn prop_travel_time_is_pure(along1 in 0.0f64..100.0, along2 in 0.0f64..100.0, seg2 in 0i32..3) {
            let block = two_trip_block();
            let t = tt();
            let a = m(&block, 0, 1, 0, along1);
            let b = m(&block, 0, 2, seg2, along2);
            let first = t.between_matches("v", DAY, &a, &b);
            let second = t.between_matches("v", DAY, &a, &b);
            prop_assert_eq!(first, second);
            prop_assert!(first >= 0);
        }
    }
}
