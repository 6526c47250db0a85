//! Spatial match: where along the assignment a report was matched.
//!
//! A `SpatialMatch` is immutable. Adjusting it to a stop boundary, or
//! transferring it to another trip sharing the same pattern, builds a copy.

use crate::geo::{Location, Segment};
use crate::indices::Indices;
use crate::reference::{Block, StopPath, Trip};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// AT-STOP INFO
// ============================================================================

/// The stop a match is snapped to: the end of the identified stop path.
#[derive(Clone, PartialEq)]
pub struct AtStop {
    indices: Indices,
}

impl AtStop {
    fn new(indices: &Indices) -> Self {
        let stop_path_index = indices.stop_path_index();
        Self {
            indices: indices.at_end_of(stop_path_index),
        }
    }

    /// Indices at the last segment of the stop path ending at this stop.
    pub fn indices(&self) -> &Indices {
        &self.indices
    }

    pub fn trip_index(&self) -> i32 {
        self.indices.trip_index()
    }

    pub fn stop_path_index(&self) -> i32 {
        self.indices.stop_path_index()
    }

    pub fn trip(&self) -> Option<&Arc<Trip>> {
        self.indices.trip()
    }

    pub fn stop_path(&self) -> Option<&Arc<StopPath>> {
        self.indices.stop_path()
    }

    pub fn stop_id(&self) -> &str {
        self.stop_path().map(|p| p.stop_id.as_str()).unwrap_or("")
    }

    pub fn is_wait_stop(&self) -> bool {
        self.indices.is_wait_stop()
    }

    pub fn at_end_of_block(&self) -> bool {
        self.indices.at_end_of_block()
    }
}

impl fmt::Debug for AtStop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AtStop[stop={}, trip={}, sp={}]", self.stop_id(), self.trip_index(), self.stop_path_index())
    }
}

// ============================================================================
// SPATIAL MATCH
// ============================================================================

#[derive(Clone)]
pub struct SpatialMatch {
    avl_time_ms: i64,
    indices: Indices,
    /// NaN for synthetic matches not derived from a fix
    distance_to_segment: f64,
    distance_along_segment: f64,
    at_stop: Option<AtStop>,
    predicted_location: Location,
}

impl SpatialMatch {
    pub fn new(avl_time_ms: i64, indices: Indices, distance_to_segment: f64, distance_along_segment: f64) -> Self {
        let predicted_location = location_for(&indices, distance_along_segment);
        let mut m = Self {
            avl_time_ms,
            indices,
            distance_to_segment,
            distance_along_segment,
            at_stop: None,
            predicted_location,
        };
        m.at_stop = m.determine_at_stop();
        m
    }

    /// Synthetic match at the end of the stop path `indices` points into.
    fn at_end_of_path(avl_time_ms: i64, indices: &Indices) -> Self {
        let end = indices.at_end_of(indices.stop_path_index());
        let along = end.segment().map(|s| s.length).unwrap_or(f64::NAN);
        Self::new(avl_time_ms, end, f64::NAN, along)
    }

    /// Copy at new indices; keeps the at-stop info and distance to segment.
    #[must_use]
    pub fn with_indices(&self, indices: Indices, distance_along_segment: f64) -> Self {
        Self {
            avl_time_ms: self.avl_time_ms,
            predicted_location: location_for(&indices, distance_along_segment),
            indices,
            distance_to_segment: self.distance_to_segment,
            distance_along_segment,
            at_stop: self.at_stop.clone(),
        }
    }

    /// Copy onto another trip of the same block that shares this trip's pattern.
    #[must_use]
    pub fn for_trip(&self, trip_index: i32) -> Self {
        let at_stop = self.at_stop.as_ref().map(|a| {
            AtStop::new(&self.indices.with_trip(trip_index).at(a.stop_path_index(), 0))
        });
        Self {
            avl_time_ms: self.avl_time_ms,
            indices: self.indices.with_trip(trip_index),
            distance_to_segment: self.distance_to_segment,
            distance_along_segment: self.distance_along_segment,
            at_stop,
            predicted_location: self.predicted_location,
        }
    }

    /// Near the end of this path (or the whole path is a layover): at this
    /// path's stop. Near the start of this path: at the previous path's stop.
    fn determine_at_stop(&self) -> Option<AtStop> {
        let path = self.stop_path()?;
        if path.layover || self.distance_remaining_in_stop_path() < path.before_stop_distance {
            return Some(AtStop::new(&self.indices));
        }
        let previous = self.indices.decrement_stop_path();
        if previous.before_beginning_of_block() {
            return None;
        }
        match previous.stop_path() {
            Some(prev_path) if self.distance_along_stop_path() < prev_path.after_stop_distance => {
                Some(AtStop::new(&previous))
            }
            _ => None,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn avl_time_ms(&self) -> i64 {
        self.avl_time_ms
    }

    pub fn indices(&self) -> &Indices {
        &self.indices
    }

    pub fn block(&self) -> &Arc<Block> {
        self.indices.block()
    }

    pub fn trip(&self) -> Option<&Arc<Trip>> {
        self.indices.trip()
    }

    pub fn trip_index(&self) -> i32 {
        self.indices.trip_index()
    }

    pub fn stop_path_index(&self) -> i32 {
        self.indices.stop_path_index()
    }

    pub fn segment_index(&self) -> i32 {
        self.indices.segment_index()
    }

    pub fn stop_path(&self) -> Option<&Arc<StopPath>> {
        self.indices.stop_path()
    }

    pub fn segment(&self) -> Option<&Segment> {
        self.indices.segment()
    }

    pub fn distance_to_segment(&self) -> f64 {
        self.distance_to_segment
    }

    pub fn distance_along_segment(&self) -> f64 {
        self.distance_along_segment
    }

    pub fn at_stop(&self) -> Option<&AtStop> {
        self.at_stop.as_ref()
    }

    pub fn predicted_location(&self) -> Location {
        self.predicted_location
    }

    pub fn distance_along_stop_path(&self) -> f64 {
        let before = self
            .stop_path()
            .map(|p| p.length_before_segment(self.segment_index()))
            .unwrap_or(0.0);
        before + self.distance_along_segment
    }

    pub fn distance_remaining_in_stop_path(&self) -> f64 {
        let length = self.stop_path().map(|p| p.length).unwrap_or(0.0);
        length - self.distance_along_stop_path()
    }

    // ========================================================================
    // Trip position
    // ========================================================================

    /// Distance from the first terminal of the trip.
    pub fn distance_from_beginning_of_trip(&self) -> f64 {
        let Some(trip) = self.trip() else {
            return 0.0;
        };
        let sp = self.stop_path_index();
        let mut distance: f64 = (1..sp)
            .filter_map(|i| trip.stop_path(i))
            .map(|p| p.length)
            .sum();
        if sp != 0 {
            distance += self.distance_along_stop_path();
        }
        distance
    }

    /// At least `distance` from both terminals of the trip.
    pub fn away_from_terminals(&self, distance: f64) -> bool {
        let from_start = self.distance_from_beginning_of_trip();
        if from_start < distance {
            return false;
        }
        let length = self.trip().map(|t| t.length()).unwrap_or(0.0);
        length - from_start >= distance
    }

    pub fn within_distance_of_end_of_trip(&self, distance: f64) -> bool {
        let length = self.trip().map(|t| t.length()).unwrap_or(0.0);
        length - self.distance_from_beginning_of_trip() < distance
    }

    pub fn is_last_trip_of_block(&self) -> bool {
        self.trip_index() == self.block().num_trips() - 1
    }

    /// Layover path; looping blocks never have layovers.
    pub fn is_layover(&self) -> bool {
        !self.block().no_schedule() && self.stop_path().map(|p| p.layover).unwrap_or(false)
    }

    pub fn is_wait_stop(&self) -> bool {
        self.stop_path().map(|p| p.is_wait_stop()).unwrap_or(false)
    }

    /// Scheduled departure of the wait stop ending this path, as epoch ms.
    pub fn scheduled_wait_stop_time(&self) -> Option<i64> {
        if !self.is_wait_stop() {
            return None;
        }
        let dep = self.indices.schedule_time()?.departure_secs?;
        Some(self.block().clock.epoch_time(dep, self.avl_time_ms))
    }

    // ========================================================================
    // Stop adjustments
    // ========================================================================

    /// Snapped to the stop at the end of this path.
    pub fn at_end_of_path_stop(&self) -> bool {
        matches!(&self.at_stop, Some(a) if a.trip_index() == self.trip_index()
            && a.stop_path_index() == self.stop_path_index())
    }

    /// Snapped to the stop at the start of this path.
    pub fn at_beginning_of_path_stop(&self) -> bool {
        matches!(&self.at_stop, Some(a) if a.trip_index() == self.trip_index()
            && a.stop_path_index() != self.stop_path_index())
    }

    /// Match moved exactly onto the stop it is snapped to (end of that path).
    pub fn match_adjusted_to_end_of_path(&self) -> Option<Self> {
        self.at_stop.as_ref()?;
        let indices = if self.at_end_of_path_stop() {
            self.indices.clone()
        } else {
            self.indices.decrement_stop_path()
        };
        let end = indices.at_end_of(indices.stop_path_index());
        let along = end.segment()?.length;
        Some(self.with_indices(end, along))
    }

    /// Match moved to the start of the path leaving the stop it is snapped to.
    pub fn match_adjusted_to_beginning_of_path(&self) -> Option<Self> {
        self.at_stop.as_ref()?;
        let indices = if self.at_beginning_of_path_stop() {
            self.indices.clone()
        } else {
            self.indices.increment_stop_path(self.avl_time_ms)
        };
        let start = indices.at(indices.stop_path_index(), 0);
        Some(self.with_indices(start, 0.0))
    }

    /// Match at the next stop (on this trip) that has a schedule time.
    pub fn match_at_next_stop_with_schedule_time(&self) -> Option<Self> {
        let trip = self.trip()?;
        let sp = (self.stop_path_index()..trip.num_stop_paths())
            .find(|&i| trip.schedule_time(i).and_then(|s| s.time()).is_some())?;
        let end = self.indices.at_end_of(sp);
        let along = end.segment()?.length;
        Some(self.with_indices(end, along))
    }

    fn match_after_stop_if_at_stop(&self) -> Self {
        if !self.at_end_of_path_stop() {
            return self.clone();
        }
        let next = self.indices.increment_stop_path(self.avl_time_ms);
        self.with_indices(next, 0.0)
    }

    /// Synthetic match just before the next stop, skipping the stop this
    /// match is sitting just before.
    pub fn match_at_just_before_next_stop(&self) -> Self {
        let m = self.match_after_stop_if_at_stop();
        Self::at_end_of_path(0, m.indices())
    }

    /// If just after a stop, the match at the end of the previous path.
    pub fn match_before_stop_if_at_stop(&self) -> Self {
        if !self.at_beginning_of_path_stop() {
            return self.clone();
        }
        let prev = self.indices.decrement_stop_path();
        let along = prev.segment().map(|s| s.length).unwrap_or(f64::NAN);
        self.with_indices(prev, along)
    }

    /// Synthetic match at the previous stop, `None` at the start of the block.
    pub fn match_at_previous_stop(&self) -> Option<Self> {
        let indices = self.match_before_stop_if_at_stop().indices().decrement_stop_path();
        if indices.before_beginning_of_block() {
            return None;
        }
        Some(Self::at_end_of_path(0, &indices))
    }

    // ========================================================================
    // Relations between matches
    // ========================================================================

    /// Path distance from this match forward to `other`.
    pub fn distance_between_matches(&self, other: &SpatialMatch) -> f64 {
        if self.indices.equal_stop_path(&other.indices) {
            return other.distance_along_stop_path() - self.distance_along_stop_path();
        }
        let mut distance = self.distance_remaining_in_stop_path();
        let mut indices = self.indices.increment_stop_path(self.avl_time_ms);
        while indices.is_earlier_stop_path_than(&other.indices) && !indices.past_end_of_block(self.avl_time_ms) {
            distance += indices.stop_path().map(|p| p.length).unwrap_or(0.0);
            indices = indices.increment_stop_path(self.avl_time_ms);
        }
        distance + other.distance_along_stop_path()
    }

    /// True if a wait stop lies between this match and `other` (or this
    /// match is at one).
    pub fn traversed_wait_stop(&self, other: &SpatialMatch) -> bool {
        if self.at_stop.as_ref().map(|a| a.is_wait_stop()).unwrap_or(false) {
            return true;
        }
        let mut indices = self.indices.clone();
        while indices.is_earlier_stop_path_than(&other.indices) && !indices.past_end_of_block(self.avl_time_ms) {
            if indices.is_wait_stop() {
                return true;
            }
            indices = indices.increment_stop_path(self.avl_time_ms);
        }
        false
    }

    pub fn less_than(&self, other: &SpatialMatch) -> bool {
        if self.indices == other.indices {
            return self.distance_along_segment < other.distance_along_segment;
        }
        self.indices.less_than(&other.indices)
    }

    pub fn less_than_or_equal_to(&self, other: &SpatialMatch) -> bool {
        if self.indices == other.indices {
            return self.distance_along_segment <= other.distance_along_segment;
        }
        self.indices.less_than(&other.indices)
    }

    /// Stop paths crossed going from `m1` to `m2` on the same block.
    pub fn number_stops_between_matches(m1: &SpatialMatch, m2: &SpatialMatch) -> i32 {
        let block = m1.block();
        let mut stops = m2.stop_path_index() - m1.stop_path_index();
        for trip_index in m1.trip_index()..m2.trip_index() {
            stops += block.num_stop_paths(trip_index);
        }
        stops
    }
}

fn location_for(indices: &Indices, distance_along_segment: f64) -> Location {
    indices
        .segment()
        .map(|s| s.location_along(distance_along_segment))
        .unwrap_or(Location::new(f64::NAN, f64::NAN))
}

impl fmt::Debug for SpatialMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SpatialMatch[{:?}, distToSeg={:.1}, distAlongSeg={:.1}, atStop={:?}]",
            self.indices, self.distance_to_segment, self.distance_along_segment, self.at_stop
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indices::tests::two_trip_block;
    use approx::assert_relative_eq;

    fn m(trip: i32, sp: i32, seg: i32, along: f64) -> SpatialMatch {
        let indices = Indices::new(two_trip_block(), trip, sp, seg).unwrap();
        SpatialMatch::new(1000, indices, 5.0, along)
    }

    #[test]
    fn test_at_stop_near_end_of_path() {
        // Path 1 has two 100m segments; 30m remaining is within 50m
        let near_end = m(0, 1, 1, 70.0);
        let at = near_end.at_stop().unwrap();
        assert_eq!(at.stop_path_index(), 1);
        assert!(near_end.at_end_of_path_stop());
        assert!(!near_end.at_beginning_of_path_stop());
    }

    #[test]
    fn test_at_stop_just_after_previous() {
        let just_after = m(0, 2, 0, 20.0);
        let at = just_after.at_stop().unwrap();
        assert_eq!(at.stop_path_index(), 1);
        assert!(just_after.at_beginning_of_path_stop());
    }

    #[test]
    fn test_not_at_stop_mid_path() {
        assert!(m(0, 2, 1, 50.0).at_stop().is_none());
    }

    #[test]
    fn test_layover_path_always_at_stop() {
        let layover = m(1, 0, 0, 0.0);
        assert!(layover.is_layover());
        assert_eq!(layover.at_stop().unwrap().stop_path_index(), 0);
        assert_eq!(layover.at_stop().unwrap().stop_id(), "s0");
    }

    #[test]
    fn test_distance_from_beginning_of_trip() {
        // Path 1 is 200m; 50m into path 2
        let mid = m(0, 2, 0, 50.0);
        assert_relative_eq!(mid.distance_from_beginning_of_trip(), 250.0, epsilon = 1e-6);
        assert!(mid.away_from_terminals(100.0));
        // Trip length is 500m, so 250m from the end
        assert!(!mid.away_from_terminals(300.0));
        assert!(mid.within_distance_of_end_of_trip(300.0));
    }

    #[test]
    fn test_adjust_to_end_and_beginning() {
        let just_after = m(0, 2, 0, 20.0);
        let end = just_after.match_adjusted_to_end_of_path().unwrap();
        assert_eq!((end.stop_path_index(), end.segment_index()), (1, 1));
        assert_relative_eq!(end.distance_remaining_in_stop_path(), 0.0, epsilon = 1e-6);

        let near_end = m(0, 1, 1, 70.0);
        let begin = near_end.match_adjusted_to_beginning_of_path().unwrap();
        assert_eq!((begin.stop_path_index(), begin.segment_index()), (2, 0));
        assert_eq!(begin.distance_along_segment(), 0.0);

        assert!(m(0, 2, 1, 50.0).match_adjusted_to_end_of_path().is_none());
    }

    #[test]
    fn test_just_before_next_stop_skips_current_stop() {
        let near_end = m(0, 1, 1, 70.0);
        let next = near_end.match_at_just_before_next_stop();
        assert_eq!((next.stop_path_index(), next.segment_index()), (2, 2));
        assert!(next.distance_to_segment().is_nan());

        let mid = m(0, 2, 1, 50.0);
        let next = mid.match_at_just_before_next_stop();
        assert_eq!((next.stop_path_index(), next.segment_index()), (2, 2));
    }

    #[test]
    fn test_previous_stop() {
        assert!(m(0, 0, 0, 0.0).match_at_previous_stop().is_none());
        let prev = m(1, 0, 0, 0.0).match_at_previous_stop().unwrap();
        assert_eq!((prev.trip_index(), prev.stop_path_index()), (0, 2));
    }

    #[test]
    fn test_distance_between_and_stop_counts() {
        let a = m(0, 1, 0, 50.0);
        let b = m(0, 2, 1, 50.0);
        // 150 left in path 1, then 150 into path 2
        assert_relative_eq!(a.distance_between_matches(&b), 300.0, epsilon = 1e-6);
        assert_eq!(SpatialMatch::number_stops_between_matches(&a, &b), 1);

        let c = m(1, 1, 0, 10.0);
        assert_eq!(SpatialMatch::number_stops_between_matches(&a, &c), 3);
        assert!(a.less_than(&b));
        assert!(!b.less_than(&a));
        assert!(a.less_than_or_equal_to(&a));
    }

    #[test]
    fn test_traversed_wait_stop() {
        // Trip 2 starts with a layover (wait stop)
        let a = m(0, 2, 1, 50.0);
        let b = m(1, 1, 0, 50.0);
        assert!(a.traversed_wait_stop(&b));
        let c = m(0, 2, 2, 10.0);
        assert!(!a.traversed_wait_stop(&c));
    }

    #[test]
    fn test_for_trip_moves_at_stop() {
        let near_end = m(0, 1, 1, 70.0);
        let copy = near_end.for_trip(1);
        assert_eq!(copy.trip_index(), 1);
        assert_eq!(copy.at_stop().unwrap().trip_index(), 1);
        assert_eq!(copy.at_stop().unwrap().stop_path_index(), 1);
    }
}
