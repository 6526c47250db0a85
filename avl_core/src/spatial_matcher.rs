//! Spatial matcher.
//!
//! Walks the cursor segment by segment and records local minima of the
//! distance between a fix and the path. A minimum becomes a candidate when it
//! is close enough to the path and the heading agrees (headings are ignored at
//! stops and layovers). Layovers the vehicle could plausibly be sitting at are
//! always candidates, however far the vehicle is from the path.

use crate::avl_report::AvlReport;
use crate::config::{ConfigProvider, CoreConfig};
use crate::indices::Indices;
use crate::reference::Block;
use crate::spatial_match::SpatialMatch;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Which distance gate applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchingType {
    Standard,
    AutoAssigning,
}

/// State of one walk along the path.
struct Search<'a> {
    report: &'a AvlReport,
    config: &'a CoreConfig,
    kind: MatchingType,
    /// Rematches never go back before this
    start: Option<&'a SpatialMatch>,
    previous_distance: f64,
    potential: Option<SpatialMatch>,
    smallest: Option<SpatialMatch>,
    matches: Vec<SpatialMatch>,
}

impl<'a> Search<'a> {
    fn new(report: &'a AvlReport, config: &'a CoreConfig, kind: MatchingType) -> Self {
        Self {
            report,
            config,
            kind,
            start: None,
            previous_distance: f64::MAX,
            potential: None,
            smallest: None,
            matches: Vec::new(),
        }
    }

    fn max_distance(&self, indices: &Indices) -> f64 {
        if let Some(d) = indices.stop_path().and_then(|p| p.max_distance) {
            return d;
        }
        match self.kind {
            MatchingType::AutoAssigning => self.config.max_distance_from_segment_for_auto_assigning,
            MatchingType::Standard => indices
                .trip()
                .and_then(|t| t.max_distance_from_segment)
                .unwrap_or(self.config.max_distance_from_segment),
        }
    }

    /// A layover is plausible if the vehicle is within the deadhead allowance
    /// of it. The first layover of a block has no previous stop to measure
    /// from and is always plausible.
    fn within_allowable_distance_of_layover(&self, indices: &Indices) -> bool {
        let Some(layover) = indices.stop_path() else {
            return false;
        };
        let Some(previous) = indices.previous_stop_path(1) else {
            return true;
        };
        let layover_loc = layover.end_location();
        let to_layover = self.report.location.distance(&layover_loc);
        let between_stops = layover_loc.distance(&previous.end_location());
        let allowable = (between_stops * self.config.layover_deadhead_multiplier).max(self.config.layover_distance);
        if to_layover >= allowable {
            debug!(
                vehicle_id = %self.report.vehicle_id,
                to_layover, allowable, "layover too far away to be plausible"
            );
        }
        to_layover < allowable
    }

    fn process(&mut self, indices: &Indices) {
        let Some(segment) = indices.segment() else {
            return;
        };
        let projection = segment.project(&self.report.location);
        let distance = projection.distance;
        let mut along = projection.along;
        let at_layover = indices.is_layover();

        if let Some(start) = self.start {
            if indices.less_than(start.indices()) && !start.indices().at_end_of_trip() {
                warn!(vehicle_id = %self.report.vehicle_id, ?indices, "segment before start of search");
                return;
            }
            if indices == start.indices() && along < start.distance_along_segment() {
                along = start.distance_along_segment();
                self.potential = None;
            }
        }
        if at_layover {
            along = segment.length;
        }

        let m = SpatialMatch::new(self.report.time_ms, indices.clone(), distance, along);

        if distance < self.previous_distance {
            let heading_ok = at_layover
                || m.at_stop().is_some()
                || segment.heading_ok(self.report.heading, self.config.max_heading_offset_from_segment);
            let distance_ok = distance < self.max_distance(indices);
            if heading_ok && distance_ok {
                self.potential = Some(m.clone());
            }
        } else if let Some(potential) = self.potential.take() {
            self.matches.push(potential);
        }
        self.previous_distance = distance;

        if at_layover && self.within_allowable_distance_of_layover(indices) {
            self.matches.push(m.clone());
        }

        if self.smallest.as_ref().map_or(true, |s| distance < s.distance_to_segment()) {
            self.smallest = Some(m);
        }
    }

    fn finish(mut self) -> (Vec<SpatialMatch>, Option<SpatialMatch>) {
        if let Some(potential) = self.potential.take() {
            self.matches.push(potential);
        }
        (self.matches, self.smallest)
    }
}

pub struct SpatialMatcher {
    config: Arc<dyn ConfigProvider>,
}

impl SpatialMatcher {
    pub fn new(config: Arc<dyn ConfigProvider>) -> Self {
        Self { config }
    }

    /// Candidates along one whole trip.
    pub fn spatial_matches_for_trip(
        &self,
        report: &AvlReport,
        block: &Arc<Block>,
        trip_index: i32,
        kind: MatchingType,
    ) -> Vec<SpatialMatch> {
        let config = self.config.current();
        let Ok(mut indices) = Indices::start_of_trip(Arc::clone(block), trip_index) else {
            return Vec::new();
        };
        let mut search = Search::new(report, &config, kind);
        loop {
            search.process(&indices);
            indices = indices.increment(report.time_ms);
            if indices.at_beginning_of_trip() || indices.trip_index() != trip_index {
                break;
            }
        }
        search.finish().0
    }

    /// Candidates across the given trips of a block, ordered by trip then
    /// position. Trips sharing a pattern reuse the first trip's matches.
    /// Matches too close to the end of a scheduled block are dropped.
    pub fn spatial_matches(
        &self,
        report: &AvlReport,
        block: &Arc<Block>,
        trip_indices: &[i32],
        kind: MatchingType,
    ) -> Vec<SpatialMatch> {
        let config = self.config.current();
        let mut all: Vec<SpatialMatch> = Vec::new();
        let mut patterns_covered: HashSet<&str> = HashSet::new();

        for &trip_index in trip_indices {
            let Some(trip) = block.trip(trip_index) else {
                continue;
            };
            if patterns_covered.contains(trip.pattern_id.as_str()) {
                let source_trip = all
                    .iter()
                    .find(|m| m.trip().map(|t| t.pattern_id == trip.pattern_id).unwrap_or(false))
                    .map(|m| m.trip_index());
                let copies: Vec<SpatialMatch> = all
                    .iter()
                    .filter(|m| Some(m.trip_index()) == source_trip)
                    .map(|m| m.for_trip(trip_index))
                    .collect();
                all.extend(copies);
            } else {
                all.extend(self.spatial_matches_for_trip(report, block, trip_index, kind));
                patterns_covered.insert(trip.pattern_id.as_str());
            }
        }

        if !block.no_schedule() {
            let limit = config.distance_from_end_of_block_for_initial_matching;
            all.retain(|m| !(m.is_last_trip_of_block() && m.within_distance_of_end_of_trip(limit)));
        }
        debug!(vehicle_id = %report.vehicle_id, block_id = %block.id, candidates = all.len(), "spatial matches for block");
        all
    }

    /// Auto-assignment never trusts layover matches.
    pub fn spatial_matches_for_auto_assigning(
        &self,
        report: &AvlReport,
        block: &Arc<Block>,
        trip_indices: &[i32],
    ) -> Vec<SpatialMatch> {
        let mut matches = self.spatial_matches(report, block, trip_indices, MatchingType::AutoAssigning);
        matches.retain(|m| !m.is_layover());
        matches
    }

    /// Candidates ahead of `previous`, looking only as far as the vehicle
    /// could plausibly have driven since `previous_avl_time_ms`.
    pub fn rematch(&self, report: &AvlReport, previous: &SpatialMatch, previous_avl_time_ms: i64) -> Vec<SpatialMatch> {
        let config = self.config.current();
        let elapsed_secs = (report.time_ms - previous_avl_time_ms).max(0) as f64 / 1000.0;
        let max_speed = previous
            .stop_path()
            .and_then(|p| p.max_speed)
            .unwrap_or(config.max_avl_speed);
        let window = max_speed * config.avl_speed_margin_factor * elapsed_secs + config.rematch_distance_slack;

        let mut search = Search::new(report, &config, MatchingType::Standard);
        search.start = Some(previous);
        let at_layover = previous.is_layover();
        let mut searched = -previous.distance_along_segment();
        let mut indices = previous.indices().clone();
        while !indices.past_end_of_block(report.time_ms)
            && (at_layover || searched < window)
            && (indices.stop_path_index() - previous.stop_path_index()).abs() <= config.max_stop_paths_ahead
        {
            search.process(&indices);
            searched += indices.segment().map(|s| s.length).unwrap_or(0.0);
            indices = indices.increment(report.time_ms);
        }
        let (mut matches, smallest) = search.finish();

        if matches.is_empty() {
            warn!(
                vehicle_id = %report.vehicle_id,
                ?previous,
                closest = ?smallest.map(|s| s.distance_to_segment()),
                "no spatial matches within allowable distance"
            );
        }

        // Vehicles often never report right at the last stop
        let block = previous.block();
        if !block.no_schedule()
            && previous.is_last_trip_of_block()
            && previous.within_distance_of_end_of_trip(config.distance_from_last_stop_for_end_matching)
        {
            if let Some(trip) = previous.trip() {
                let end = previous.indices().at_end_of(trip.num_stop_paths() - 1);
                if let Some(seg) = end.segment() {
                    let length = seg.length;
                    matches.push(SpatialMatch::new(report.time_ms, end, f64::NAN, length));
                }
            }
        }
        matches
    }

    /// With no heading on the fix, direction of travel must come from an
    /// earlier fix. `previous_report` should be the most recent earlier fix
    /// far enough away to show movement. True means the candidate cannot be
    /// trusted.
    pub fn problem_match_due_to_lack_of_heading(
        &self,
        candidate: &SpatialMatch,
        report: &AvlReport,
        previous_report: Option<&AvlReport>,
        kind: MatchingType,
    ) -> bool {
        if candidate.is_layover() || report.heading.is_some() {
            return false;
        }
        let Some(previous_report) = previous_report else {
            return true;
        };
        let earlier = self.spatial_matches_for_trip(previous_report, candidate.block(), candidate.trip_index(), kind);
        match earlier.iter().find(|m| !m.is_layover()) {
            Some(previous_match) => !previous_match.less_than_or_equal_to(candidate),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticConfig;
    use crate::geo::Location;
    use crate::indices::tests::two_trip_block;
    use proptest::prelude::*;

    const T0: i64 = 1_704_067_200_000 + 8 * 3_600_000;

    fn matcher() -> SpatialMatcher {
        SpatialMatcher::new(Arc::new(StaticConfig::default()))
    }

    fn report_at(east: f64, north: f64, time_ms: i64) -> AvlReport {
        AvlReport::new("v1", time_ms, Location::new(37.0, -122.0).offset(east, north))
    }

    fn positions(matches: &[SpatialMatch]) -> Vec<(i32, i32, i32)> {
        matches
            .iter()
            .map(|m| (m.trip_index(), m.stop_path_index(), m.segment_index()))
            .collect()
    }

    #[test]
    fn test_local_minimum_on_trip() {
        let block = two_trip_block();
        let matches = matcher().spatial_matches_for_trip(&report_at(150.0, 10.0, T0), &block, 0, MatchingType::Standard);
        // First layover of the block plus the closest segment
        assert_eq!(positions(&matches), vec![(0, 0, 0), (0, 1, 1)]);
        assert!(matches[0].is_layover());
        assert!((matches[1].distance_along_segment() - 50.0).abs() < 0.1);
        assert!((matches[1].distance_to_segment() - 10.0).abs() < 0.1);
    }

    #[test]
    fn test_far_fix_only_matches_layover() {
        let block = two_trip_block();
        let matches = matcher().spatial_matches_for_trip(&report_at(150.0, 500.0, T0), &block, 0, MatchingType::Standard);
        assert_eq!(positions(&matches), vec![(0, 0, 0)]);
    }

    #[test]
    fn test_shared_pattern_reuses_matches() {
        let block = two_trip_block();
        let matches = matcher().spatial_matches(&report_at(150.0, 10.0, T0), &block, &[0, 1], MatchingType::Standard);
        assert_eq!(positions(&matches), vec![(0, 0, 0), (0, 1, 1), (1, 0, 0), (1, 1, 1)]);
    }

    #[test]
    fn test_near_end_of_block_dropped() {
        let block = two_trip_block();
        // 450m along a 500m trip, on the last trip of the block
        let matches = matcher().spatial_matches(&report_at(450.0, 5.0, T0), &block, &[1], MatchingType::Standard);
        assert!(matches.iter().all(|m| m.is_layover()));
    }

    #[test]
    fn test_auto_assigning_drops_layovers() {
        let block = two_trip_block();
        let matches = matcher().spatial_matches_for_auto_assigning(&report_at(150.0, 10.0, T0), &block, &[0]);
        assert_eq!(positions(&matches), vec![(0, 1, 1)]);
    }

    #[test]
    fn test_rematch_window_is_bounded() {
        let block = two_trip_block();
        let previous = SpatialMatch::new(T0, Indices::new(block, 0, 1, 0).unwrap(), 1.0, 50.0);
        let matches = matcher().rematch(&report_at(150.0, 10.0, T0 + 1000), &previous, T0);
        assert_eq!(positions(&matches), vec![(0, 1, 1)]);
    }

    #[test]
    fn test_rematch_never_goes_backwards() {
        let block = two_trip_block();
        let previous = SpatialMatch::new(T0, Indices::new(block, 0, 1, 1).unwrap(), 1.0, 80.0);
        // Fix slightly behind the previous match
        let matches = matcher().rematch(&report_at(150.0, 5.0, T0 + 1000), &previous, T0);
        assert!(!matches.is_empty());
        assert!(matches.iter().all(|m| previous.less_than_or_equal_to(m)));
        assert!((matches[0].distance_along_segment() - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_rematch_adds_end_of_block_match() {
        let block = two_trip_block();
        let previous = SpatialMatch::new(T0, Indices::new(block, 1, 2, 1).unwrap(), 1.0, 50.0);
        let matches = matcher().rematch(&report_at(400.0, 300.0, T0 + 1000), &previous, T0);
        let last = matches.last().unwrap();
        assert_eq!((last.trip_index(), last.stop_path_index(), last.segment_index()), (1, 2, 2));
        assert!(last.distance_to_segment().is_nan());
    }

    #[test]
    fn test_heading_gate() {
        let block = two_trip_block();
        let config = CoreConfig {
            max_heading_offset_from_segment: 45.0,
            ..CoreConfig::default()
        };
        let m = SpatialMatcher::new(Arc::new(StaticConfig::new(config)));
        // Path runs east; a westbound fix mid segment is not a candidate
        let westbound = report_at(350.0, 5.0, T0).with_heading(270.0);
        let matches = m.spatial_matches_for_trip(&westbound, &block, 0, MatchingType::Standard);
        assert!(matches.iter().all(|m| m.is_layover()));
        let eastbound = report_at(350.0, 5.0, T0).with_heading(90.0);
        let matches = m.spatial_matches_for_trip(&eastbound, &block, 0, MatchingType::Standard);
        assert!(matches.iter().any(|m| !m.is_layover()));
    }

    #[test]
    fn test_missing_heading_needs_forward_progress() {
        let block = two_trip_block();
        let m = matcher();
        let current = report_at(150.0, 5.0, T0);
        let candidate = m
            .spatial_matches_for_trip(&current, &block, 0, MatchingType::Standard)
            .into_iter()
            .find(|c| !c.is_layover())
            .unwrap();

        let behind = report_at(50.0, 5.0, T0 - 10_000);
        assert!(!m.problem_match_due_to_lack_of_heading(&candidate, &current, Some(&behind), MatchingType::Standard));
        let ahead = report_at(180.0, 5.0, T0 - 10_000);
        assert!(m.problem_match_due_to_lack_of_heading(&candidate, &current, Some(&ahead), MatchingType::Standard));
        assert!(m.problem_match_due_to_lack_of_heading(&candidate, &current, None, MatchingType::Standard));

        let with_heading = current.clone().with_heading(90.0);
        assert!(!m.problem_match_due_to_lack_of_heading(&candidate, &with_heading, None, MatchingType::Standard));
    }

    proptest! {
        #[test]
        fn prop_non_layover_candidates_within_max_distance(east in 0.0f64..500.0, north in -200.0f64..200.0) {
            let block = two_trip_block();
            let matches = matcher().spatial_matches(&report_at(east, north, T0), &block, &[0, 1], MatchingType::Standard);
            for m in matches.iter().filter(|m| !m.is_layover()) {
                prop_assert!(m.distance_to_segment() < CoreConfig::default().max_distance_from_segment);
            }
        }
    }
}
