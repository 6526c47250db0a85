//! Temporal matcher: picks the best spatial candidate by timing.
//!
//! Re-matching compares expected travel time since the previous match with
//! the elapsed time between fixes. Initial matching compares expected time
//! into the trip with the time since the trip's scheduled start.

use crate::avl_report::{AssignmentType, AvlReport};
use crate::config::{ConfigProvider, CoreConfig};
use crate::indices::Indices;
use crate::reference::Block;
use crate::service_time::{MS_PER_DAY, MS_PER_SEC};
use crate::spatial_match::SpatialMatch;
use crate::temporal::{TemporalDifference, TemporalMatch};
use crate::travel_times::TravelTimes;
use std::sync::Arc;
use tracing::{debug, warn};

/// Expected travel below this is too short to judge bounds on.
const MIN_TRAVEL_FOR_BOUNDS_MSECS: i64 = 2 * 60 * 1000;

pub struct TemporalMatcher {
    config: Arc<dyn ConfigProvider>,
    travel_times: Arc<TravelTimes>,
}

/// True if the report carries a trip hint naming `trip_id`.
pub fn trip_matches_assignment(report: &AvlReport, trip_id: &str) -> bool {
    matches!(&report.assignment, Some(a) if a.kind == AssignmentType::Trip && a.id == trip_id)
}

impl TemporalMatcher {
    pub fn new(config: Arc<dyn ConfigProvider>, travel_times: Arc<TravelTimes>) -> Self {
        Self { config, travel_times }
    }

    // ========================================================================
    // Re-match mode
    // ========================================================================

    /// Already at the layover: on time until the scheduled departure, late
    /// after it.
    fn difference_for_layover(&self, report: &AvlReport, candidate: &SpatialMatch, expected_msecs: i64) -> TemporalDifference {
        if expected_msecs != 0 {
            return TemporalDifference::ON_TIME;
        }
        match candidate.scheduled_wait_stop_time() {
            Some(departure) if report.time_ms > departure => {
                debug!(vehicle_id = %report.vehicle_id, "at layover past scheduled departure");
                TemporalDifference::new(departure - report.time_ms)
            }
            _ => TemporalDifference::ON_TIME,
        }
    }

    /// A vehicle still matching its layover after departure time while
    /// drifting away from it is really on the next path.
    fn is_problematic_layover(previous: &SpatialMatch, candidates: &[SpatialMatch], idx: usize) -> bool {
        let candidate = &candidates[idx];
        if !previous.is_layover() || !previous.indices().equal_stop_path(candidate.indices()) {
            return false;
        }
        match candidate.scheduled_wait_stop_time() {
            Some(departure) if candidate.avl_time_ms() >= departure => {}
            _ => return false,
        }
        if candidate.distance_to_segment() <= previous.distance_to_segment() {
            return false;
        }
        candidates[idx + 1..].iter().any(|m| !m.is_layover())
    }

    fn current_match_is_better(
        config: &CoreConfig,
        best: Option<&TemporalMatch>,
        candidate: &SpatialMatch,
        difference: Option<TemporalDifference>,
    ) -> bool {
        let Some(difference) = difference else {
            return false;
        };
        let Some(best) = best else {
            return true;
        };
        if difference.better_than_or_equal_to(Some(&best.temporal_difference()), config) {
            return true;
        }
        // Left the layover a little early: still prefer the match past it
        best.is_layover()
            && candidate.distance_from_beginning_of_trip() > config.distance_from_layover_for_early_departure
            && difference.early() >= 0
            && difference.early() < config.allowable_early_time_for_early_departure_secs * MS_PER_SEC
    }

    /// Best candidate for an already assigned vehicle. Candidates must be
    /// ordered by position; the search stops once deviations start to grow.
    pub fn best_temporal_match(
        &self,
        report: &AvlReport,
        previous: &SpatialMatch,
        previous_avl_time_ms: i64,
        candidates: &[SpatialMatch],
        trip_id_only: bool,
    ) -> Option<TemporalMatch> {
        let config = self.config.current();
        let vehicle_id = report.vehicle_id.as_str();
        let elapsed = report.time_ms - previous_avl_time_ms;

        if let [only] = candidates {
            if only.block().no_schedule() {
                return Some(TemporalMatch::new(only.clone(), TemporalDifference::ON_TIME));
            }
        }

        let mut best: Option<TemporalMatch> = None;
        for (idx, candidate) in candidates.iter().enumerate() {
            if trip_id_only && !candidate.trip().map(|t| trip_matches_assignment(report, &t.id)).unwrap_or(false) {
                continue;
            }
            if Self::is_problematic_layover(previous, candidates, idx) {
                warn!(vehicle_id, ?candidate, "ignoring layover match the vehicle has left");
                continue;
            }

            let mut expected = self
                .travel_times
                .between_matches(vehicle_id, previous_avl_time_ms, previous, candidate);
            if candidate.is_layover() && !previous.indices().equal_stop_path(candidate.indices()) {
                expected += self.travel_times.from_layover_arrival_to_new_loc(candidate, &report.location);
            }

            let mut difference = if !candidate.is_layover() || elapsed <= expected {
                Some(TemporalDifference::new(expected - elapsed))
            } else {
                Some(self.difference_for_layover(report, candidate, expected))
            };
            if let Some(d) = difference {
                if expected > MIN_TRAVEL_FOR_BOUNDS_MSECS && !d.is_within_bounds(&config) {
                    debug!(vehicle_id, difference = %d, "temporal match outside bounds");
                    difference = None;
                }
            }
            debug!(vehicle_id, ?candidate, expected, elapsed, ?difference, "examined candidate");

            if Self::current_match_is_better(&config, best.as_ref(), candidate, difference) {
                if let Some(d) = difference {
                    best = Some(TemporalMatch::new(candidate.clone(), d));
                }
            } else if best.is_some() {
                break;
            }
        }
        debug!(vehicle_id, ?best, "best temporal match");
        best
    }

    // ========================================================================
    // Initial assignment mode
    // ========================================================================

    /// Deviation of a candidate from the schedule, `None` when outside the
    /// initial-matching bounds. Layovers other than the first candidate are
    /// penalized so mid-trip matches win.
    pub fn how_far_off_scheduled_time(
        &self,
        vehicle_id: &str,
        avl_time_ms: i64,
        candidate: &SpatialMatch,
        is_first: bool,
    ) -> Option<TemporalDifference> {
        let config = self.config.current();
        let trip = candidate.trip()?;
        if trip.no_schedule {
            return Some(TemporalDifference::ON_TIME);
        }
        let block = candidate.block();
        let beginning = SpatialMatch::new(0, Indices::start_of_trip(Arc::clone(block), candidate.trip_index()).ok()?, 0.0, 0.0);
        let trip_start_ms = block.clock.epoch_time(trip.start_time_secs, avl_time_ms);
        let travel = self.travel_times.between_matches(vehicle_id, trip_start_ms, &beginning, candidate);

        let expected_into_day = trip.start_time_secs as i64 * MS_PER_SEC + travel;
        let avl_into_day = block.clock.msecs_into_day(avl_time_ms);
        let early = expected_into_day - avl_into_day;

        let mut delta = TemporalDifference::new(early);
        for wrapped in [early - MS_PER_DAY, early + MS_PER_DAY] {
            let d = TemporalDifference::new(wrapped);
            if d.better_than(Some(&delta), &config) {
                delta = d;
            }
        }

        if !delta.is_within_bounds_for_initial_matching(&config) {
            debug!(vehicle_id, %delta, ?candidate, "not within initial matching bounds");
            return None;
        }
        if candidate.is_layover() && !is_first {
            delta = delta.penalized(config.allowable_late_secs_for_initial_matching * MS_PER_SEC);
        }
        Some(delta)
    }

    /// Best candidate by schedule deviation, for a vehicle with no previous match.
    pub fn best_temporal_match_compared_to_schedule(
        &self,
        report: &AvlReport,
        candidates: &[SpatialMatch],
        trip_id_only: bool,
    ) -> Option<TemporalMatch> {
        let config = self.config.current();
        if let [only] = candidates {
            if only.block().no_schedule() {
                return Some(TemporalMatch::new(only.clone(), TemporalDifference::ON_TIME));
            }
        }

        let mut best: Option<TemporalMatch> = None;
        for (i, candidate) in candidates.iter().enumerate() {
            if trip_id_only && !candidate.trip().map(|t| trip_matches_assignment(report, &t.id)).unwrap_or(false) {
                continue;
            }
            let Some(d) = self.how_far_off_scheduled_time(report.vehicle_id.as_str(), report.time_ms, candidate, i == 0) else {
                continue;
            };
            if best.as_ref().map_or(true, |b| d.better_than(Some(&b.temporal_difference()), &config)) {
                best = Some(TemporalMatch::new(candidate.clone(), d));
            }
        }
        debug!(vehicle_id = %report.vehicle_id, ?best, "best match compared to schedule");
        best
    }

    // ========================================================================
    // Deadheading to a layover
    // ========================================================================

    /// True if the vehicle can drive to the start of the trip before it is
    /// scheduled to leave.
    pub fn can_deadhead_to_beginning_of_trip_in_time(&self, report: &AvlReport, block: &Block, trip_index: i32) -> bool {
        let Some(trip) = block.trip(trip_index) else {
            return false;
        };
        let trip_start_ms = block.clock.epoch_time(trip.start_time_secs, report.time_ms);
        if report.time_ms >= trip_start_ms {
            return false;
        }
        let available = trip_start_ms - report.time_ms;
        let Some(first_stop) = trip.stop_path(0) else {
            return false;
        };
        let distance = report.location.distance(&first_stop.end_location());
        let needed = self.travel_times.crow_flies_msecs(distance);
        debug!(vehicle_id = %report.vehicle_id, trip_id = %trip.id, available, needed, "deadhead check");
        needed < available
    }

    /// First of the trips whose layover the vehicle can reach in time.
    pub fn match_to_layover_stop_even_if_off_route(&self, report: &AvlReport, block: &Block, trip_indices: &[i32]) -> Option<i32> {
        trip_indices
            .iter()
            .copied()
            .find(|&i| self.can_deadhead_to_beginning_of_trip_in_time(report, block, i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avl_report::Assignment;
    use crate::config::StaticConfig;
    use crate::geo::Location;
    use crate::indices::tests::{straight_trip, two_trip_block};
    use crate::service_time::ServiceClock;
    use crate::spatial_matcher::{MatchingType, SpatialMatcher};
    use proptest::prelude::*;

    const DAY: i64 = 1_704_067_200_000;
    const EIGHT_AM: i64 = DAY + 8 * 3_600_000;

    fn services() -> (TemporalMatcher, SpatialMatcher) {
        let config: Arc<dyn ConfigProvider> = Arc::new(StaticConfig::default());
        let tt = Arc::new(TravelTimes::new(Arc::clone(&config)));
        (TemporalMatcher::new(Arc::clone(&config), tt), SpatialMatcher::new(config))
    }

    fn report_at(east: f64, north: f64, time_ms: i64) -> AvlReport {
        AvlReport::new("v1", time_ms, Location::new(37.0, -122.0).offset(east, north))
    }

    fn at(block: &Arc<Block>, trip: i32, sp: i32, seg: i32, along: f64, time_ms: i64) -> SpatialMatch {
        SpatialMatch::new(time_ms, Indices::new(block.clone(), trip, sp, seg).unwrap(), 1.0, along)
    }

    #[test]
    fn test_rematch_on_model_is_on_time() {
        let block = two_trip_block();
        let (tm, sm) = services();
        let previous = at(&block, 0, 1, 0, 0.0, EIGHT_AM);
        // 150m into a 200m, 60s path
        let report = report_at(150.0, 3.0, EIGHT_AM + 45_000);
        let candidates = sm.rematch(&report, &previous, EIGHT_AM);
        let best = tm.best_temporal_match(&report, &previous, EIGHT_AM, &candidates, false).unwrap();
        assert_eq!((best.stop_path_index(), best.segment_index()), (1, 1));
        assert!(best.temporal_difference().msecs().abs() <= 1);
    }

    #[test]
    fn test_layover_on_time_until_departure() {
        let block = two_trip_block();
        let (tm, _) = services();
        let previous = at(&block, 1, 0, 0, 0.0, EIGHT_AM + 30 * 60_000);
        let waiting = EIGHT_AM + 40 * 60_000;
        let candidate = at(&block, 1, 0, 0, 0.0, waiting);
        let report = report_at(0.0, 0.0, waiting);
        let best = tm
            .best_temporal_match(&report, &previous, previous.avl_time_ms(), &[candidate], false)
            .unwrap();
        assert_eq!(best.temporal_difference(), TemporalDifference::ON_TIME);

        // Five minutes past the 09:00 departure and still sitting there
        let late = EIGHT_AM + 65 * 60_000;
        let candidate = at(&block, 1, 0, 0, 0.0, late);
        let report = report_at(0.0, 0.0, late);
        let best = tm
            .best_temporal_match(&report, &previous, previous.avl_time_ms(), &[candidate], false)
            .unwrap();
        assert_eq!(best.temporal_difference().msecs(), -300_000);
    }

    #[test]
    fn test_initial_match_prefers_mid_trip() {
        let block = two_trip_block();
        let (tm, sm) = services();
        let report = report_at(150.0, 5.0, EIGHT_AM + 45_000);
        let candidates = sm.spatial_matches(&report, &block, &[0], MatchingType::Standard);
        assert!(candidates[0].is_layover());
        let best = tm.best_temporal_match_compared_to_schedule(&report, &candidates, false).unwrap();
        assert!(!best.is_layover());
        assert!(best.temporal_difference().msecs().abs() <= 1);
    }

    #[test]
    fn test_initial_match_out_of_bounds() {
        let block = two_trip_block();
        let (tm, sm) = services();
        // Three hours before the block starts
        let report = report_at(150.0, 5.0, EIGHT_AM - 3 * 3_600_000);
        let candidates = sm.spatial_matches(&report, &block, &[0], MatchingType::Standard);
        assert!(tm.best_temporal_match_compared_to_schedule(&report, &candidates, false).is_none());
    }

    #[test]
    fn test_initial_match_wraps_midnight() {
        let trip = Arc::new(straight_trip("late", 23 * 3600 + 59 * 60, &[1, 2, 3], false));
        let block = Arc::new(Block::new("night", "svc", vec![trip], ServiceClock::new(0)).unwrap());
        let (tm, _) = services();
        let after_midnight = DAY + 86_400_000 + 30_000;
        let m = at(&block, 0, 1, 1, 50.0, after_midnight);
        let d = tm.how_far_off_scheduled_time("v1", after_midnight, &m, true).unwrap();
        // Expected at 23:59:45, seen at 00:00:30
        assert!((d.msecs() + 45_000).abs() <= 1);
    }

    #[test]
    fn test_trip_id_only() {
        let block = two_trip_block();
        let (tm, sm) = services();
        let report = report_at(150.0, 5.0, EIGHT_AM + 45_000).with_assignment(Assignment::trip("t2"));
        let candidates = sm.spatial_matches(&report, &block, &[0, 1], MatchingType::Standard);
        let strict = tm.best_temporal_match_compared_to_schedule(&report, &candidates, true);
        // Trip t2 runs an hour later, far outside the initial bounds
        assert!(strict.is_none());
        let lenient = tm.best_temporal_match_compared_to_schedule(&report, &candidates, false).unwrap();
        assert_eq!(lenient.trip().unwrap().id, "t1");
    }

    #[test]
    fn test_single_frequency_candidate_accepted() {
        let trip = Arc::new(straight_trip("loop", 8 * 3600, &[1, 2], true));
        let block = Arc::new(Block::new("lb", "svc", vec![trip], ServiceClock::new(0)).unwrap());
        let (tm, _) = services();
        let m = at(&block, 0, 1, 0, 10.0, EIGHT_AM);
        let report = report_at(10.0, 0.0, EIGHT_AM + 10 * 3_600_000);
        let best = tm.best_temporal_match_compared_to_schedule(&report, &[m], false).unwrap();
        assert_eq!(best.temporal_difference(), TemporalDifference::ON_TIME);
    }

    #[test]
    fn test_deadhead_to_layover() {
        let block = two_trip_block();
        let (tm, _) = services();
        // 08:30, a kilometer from the terminal: trip 1 has left, trip 2 leaves at 09:00
        let report = report_at(0.0, 1000.0, EIGHT_AM + 30 * 60_000);
        assert!(!tm.can_deadhead_to_beginning_of_trip_in_time(&report, &block, 0));
        assert_eq!(tm.match_to_layover_stop_even_if_off_route(&report, &block, &[0, 1]), Some(1));

        // 08:59:30 is too late to cover the kilometer
        let report = report_at(0.0, 1000.0, EIGHT_AM + 59 * 60_000 + 30_000);
        assert_eq!(tm.match_to_layover_stop_even_if_off_route(&report, &block, &[0, 1]), None);
    }

    proptest! {
        #[test]
        fn prop_zero_noise_rematch_selects_nearest(start in 0.0f64..60.0, advance in 20.0f64..120.0) {
            let block = two_trip_block();
            let (tm, sm) = services();
            // Both positions inside path 1 (0..200m east)
            let previous = at(&block, 0, 1, 0, start, EIGHT_AM);
            let target = start + advance;
            let seg = if target < 100.0 { 0 } else { 1 };
            let target_match = at(&block, 0, 1, seg, target - 100.0 * seg as f64, EIGHT_AM);
            let expected = TravelTimes::new(Arc::new(StaticConfig::default()))
                .between_matches("v1", EIGHT_AM, &previous, &target_match);
            let report = report_at(target, 0.0, EIGHT_AM + expected);
            let candidates = sm.rematch(&report, &previous, EIGHT_AM);
            let best = tm.best_temporal_match(&report, &previous, EIGHT_AM, &candidates, false).unwrap();
            prop_assert!(!best.is_layover());
            prop_assert_eq!(best.stop_path_index(), 1);
            prop_assert!(best.temporal_difference().msecs().abs() <= 2);
        }
    }
}
