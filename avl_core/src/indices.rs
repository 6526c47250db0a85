//! Position cursor: (block, trip, stop path, segment).
//!
//! `Indices` is a value type. Every "move" returns a new cursor, so a cursor
//! held by one match can never be advanced out from under it by another.
//!
//! Indices are signed so "before the beginning of the block" (trip -1) is
//! representable. For no-schedule (looping) blocks, ordering between cursors
//! is only meaningful within one pass around the loop: `is_earlier_stop_path_than`
//! degrades to "different stop path" there.

use crate::error::{CoreError, CoreResult};
use crate::geo::Segment;
use crate::reference::{Block, ScheduleTime, StopPath, Trip};
use std::fmt;
use std::sync::Arc;

#[derive(Clone)]
pub struct Indices {
    block: Arc<Block>,
    trip_index: i32,
    stop_path_index: i32,
    segment_index: i32,
}

impl Indices {
    /// Validated constructor.
    pub fn new(block: Arc<Block>, trip_index: i32, stop_path_index: i32, segment_index: i32) -> CoreResult<Self> {
        let trip = block.trip(trip_index).ok_or_else(|| {
            CoreError::out_of_range("trip", trip_index, block.trips.len(), format!("block {}", block.id))
        })?;
        let path = trip.stop_path(stop_path_index).ok_or_else(|| {
            CoreError::out_of_range("stop path", stop_path_index, trip.stop_paths.len(), format!("trip {}", trip.id))
        })?;
        if path.segment(segment_index).is_none() {
            return Err(CoreError::out_of_range(
                "segment",
                segment_index,
                path.segments.len(),
                format!("stop path {} of trip {}", path.id, trip.id),
            ));
        }
        Ok(Self::unchecked(block, trip_index, stop_path_index, segment_index))
    }

    /// Cursor at the very start of a trip.
    pub fn start_of_trip(block: Arc<Block>, trip_index: i32) -> CoreResult<Self> {
        Self::new(block, trip_index, 0, 0)
    }

    pub(crate) fn unchecked(block: Arc<Block>, trip_index: i32, stop_path_index: i32, segment_index: i32) -> Self {
        Self {
            block,
            trip_index,
            stop_path_index,
            segment_index,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn block(&self) -> &Arc<Block> {
        &self.block
    }

    pub fn trip_index(&self) -> i32 {
        self.trip_index
    }

    pub fn stop_path_index(&self) -> i32 {
        self.stop_path_index
    }

    pub fn segment_index(&self) -> i32 {
        self.segment_index
    }

    pub fn trip(&self) -> Option<&Arc<Trip>> {
        self.block.trip(self.trip_index)
    }

    pub fn stop_path(&self) -> Option<&Arc<StopPath>> {
        self.trip().and_then(|t| t.stop_path(self.stop_path_index))
    }

    pub fn segment(&self) -> Option<&Segment> {
        self.stop_path().and_then(|p| p.segment(self.segment_index))
    }

    pub fn schedule_time(&self) -> Option<ScheduleTime> {
        self.trip().and_then(|t| t.schedule_time(self.stop_path_index))
    }

    /// Expected dwell at the stop ending this path (msec).
    pub fn stop_time_for_path(&self) -> i64 {
        self.trip()
            .and_then(|t| t.travel_times(self.stop_path_index))
            .map(|tt| tt.stop_time_msecs as i64)
            .unwrap_or(0)
    }

    /// Expected travel time across this whole path (msec).
    pub fn travel_time_for_path(&self) -> i64 {
        self.trip()
            .and_then(|t| t.travel_times(self.stop_path_index))
            .map(|tt| tt.travel_time_msecs())
            .unwrap_or(0)
    }

    fn secs_into_day(&self, epoch_ms: i64) -> i32 {
        self.block.clock.seconds_into_day(epoch_ms)
    }

    // ========================================================================
    // Movement
    // ========================================================================

    /// Rolls a stop path index past the end of a trip into the next trip.
    /// Looping blocks only advance the trip once the current trip has ended.
    fn roll_over_trip(&mut self, epoch_ms: i64) {
        if self.stop_path_index >= self.block.num_stop_paths(self.trip_index) {
            self.stop_path_index = 0;
            if self.block.no_schedule() {
                let ended = self
                    .trip()
                    .map(|t| self.secs_into_day(epoch_ms) > t.end_time_secs)
                    .unwrap_or(true);
                if ended {
                    self.trip_index += 1;
                }
            } else {
                self.trip_index += 1;
            }
        }
    }

    /// Next segment, rolling over stop paths and trips.
    #[must_use]
    pub fn increment(&self, epoch_ms: i64) -> Self {
        let mut next = self.clone();
        next.segment_index += 1;
        if next.segment_index >= next.block.num_segments(next.trip_index, next.stop_path_index) {
            next.segment_index = 0;
            next.stop_path_index += 1;
            next.roll_over_trip(epoch_ms);
        }
        next
    }

    /// First segment of the next stop path.
    #[must_use]
    pub fn increment_stop_path(&self, epoch_ms: i64) -> Self {
        let mut next = self.clone();
        next.stop_path_index += 1;
        next.roll_over_trip(epoch_ms);
        next.segment_index = 0;
        next
    }

    /// Previous segment. Looping blocks wrap to the end of the same trip.
    #[must_use]
    pub fn decrement(&self) -> Self {
        let mut prev = self.clone();
        prev.segment_index -= 1;
        if prev.segment_index < 0 {
            prev.stop_path_index -= 1;
            if prev.stop_path_index < 0 {
                if !prev.block.no_schedule() {
                    prev.trip_index -= 1;
                }
                if prev.trip_index >= 0 {
                    prev.stop_path_index = prev.block.num_stop_paths(prev.trip_index) - 1;
                }
            }
            if prev.trip_index >= 0 {
                prev.segment_index = prev.block.num_segments(prev.trip_index, prev.stop_path_index) - 1;
            }
        }
        prev
    }

    /// Last segment of the previous stop path.
    #[must_use]
    pub fn decrement_stop_path(&self) -> Self {
        let mut prev = self.clone();
        prev.stop_path_index -= 1;
        if prev.stop_path_index < 0 {
            if !prev.block.no_schedule() {
                prev.trip_index -= 1;
            }
            if prev.trip_index >= 0 {
                prev.stop_path_index = prev.block.num_stop_paths(prev.trip_index) - 1;
            }
        }
        prev.segment_index = prev.block.num_segments(prev.trip_index, prev.stop_path_index) - 1;
        prev
    }

    /// Stop path `count` paths back, `None` before the start of the block.
    pub fn previous_stop_path(&self, count: u32) -> Option<Arc<StopPath>> {
        let mut trip_index = self.trip_index;
        let mut sp_index = self.stop_path_index;
        for _ in 0..count {
            sp_index -= 1;
            if sp_index < 0 {
                if !self.block.no_schedule() {
                    trip_index -= 1;
                }
                if trip_index < 0 {
                    return None;
                }
                sp_index = self.block.num_stop_paths(trip_index) - 1;
            }
        }
        self.block.trip(trip_index)?.stop_path(sp_index).cloned()
    }

    /// Copy pointing at another trip of the same block.
    #[must_use]
    pub fn with_trip(&self, trip_index: i32) -> Self {
        Self::unchecked(Arc::clone(&self.block), trip_index, self.stop_path_index, self.segment_index)
    }

    /// Copy pointing at a specific segment of the current trip.
    #[must_use]
    pub fn at(&self, stop_path_index: i32, segment_index: i32) -> Self {
        Self::unchecked(Arc::clone(&self.block), self.trip_index, stop_path_index, segment_index)
    }

    /// Copy pointing at the last segment of the given stop path.
    #[must_use]
    pub fn at_end_of(&self, stop_path_index: i32) -> Self {
        let seg = self.block.num_segments(self.trip_index, stop_path_index) - 1;
        self.at(stop_path_index, seg)
    }

    // ========================================================================
    // Terminal states
    // ========================================================================

    pub fn past_end_of_block(&self, epoch_ms: i64) -> bool {
        match self.trip() {
            None => true,
            Some(trip) if trip.no_schedule => self.secs_into_day(epoch_ms) > trip.end_time_secs,
            Some(_) => self.trip_index >= self.block.num_trips(),
        }
    }

    pub fn at_end_of_block(&self) -> bool {
        self.trip_index == self.block.num_trips() - 1
            && self.stop_path_index == self.block.num_stop_paths(self.trip_index) - 1
            && self.segment_index == self.block.num_segments(self.trip_index, self.stop_path_index) - 1
    }

    pub fn before_beginning_of_block(&self) -> bool {
        self.trip_index < 0
    }

    pub fn at_beginning_of_trip(&self) -> bool {
        self.stop_path_index == 0 && self.segment_index == 0
    }

    pub fn at_end_of_trip(&self) -> bool {
        self.stop_path_index == self.block.num_stop_paths(self.trip_index) - 1
    }

    pub fn at_end_of_stop_path(&self) -> bool {
        self.segment_index == self.block.num_segments(self.trip_index, self.stop_path_index) - 1
    }

    /// At the end of a layover path.
    pub fn is_layover(&self) -> bool {
        self.at_end_of_stop_path() && self.stop_path().map(|p| p.layover).unwrap_or(false)
    }

    /// Path ends at a wait stop (layovers included).
    pub fn is_wait_stop(&self) -> bool {
        self.stop_path().map(|p| p.is_wait_stop()).unwrap_or(false)
    }

    // ========================================================================
    // Ordering
    // ========================================================================

    pub fn less_than(&self, other: &Indices) -> bool {
        (self.trip_index, self.stop_path_index, self.segment_index)
            < (other.trip_index, other.stop_path_index, other.segment_index)
    }

    pub fn is_earlier_stop_path_than(&self, other: &Indices) -> bool {
        if self.block.no_schedule() {
            self.stop_path_index != other.stop_path_index
        } else {
            (self.trip_index, self.stop_path_index) < (other.trip_index, other.stop_path_index)
        }
    }

    /// Same block, trip and stop path (segment may differ).
    pub fn equal_stop_path(&self, other: &Indices) -> bool {
        self.block.same_block(&other.block)
            && self.trip_index == other.trip_index
            && self.stop_path_index == other.stop_path_index
    }
}

impl PartialEq for Indices {
    fn eq(&self, other: &Self) -> bool {
        self.equal_stop_path(other) && self.segment_index == other.segment_index
    }
}

impl fmt::Debug for Indices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Indices[block={}, trip={}, sp={}, seg={}]",
            self.block.id, self.trip_index, self.stop_path_index, self.segment_index
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::geo::Location;
    use crate::reference::TravelTimesForStopPath;
    use crate::service_time::ServiceClock;
    use proptest::prelude::*;

    /// Builds a trip of straight eastward stop paths with the given number of
    /// segments each. Path 0 is a single-point layover stub.
    pub(crate) fn straight_trip(id: &str, start_secs: i32, segs_per_path: &[usize], no_schedule: bool) -> Trip {
        let origin = Location::new(37.0, -122.0);
        let mut x = 0.0;
        let mut stop_paths = Vec::new();
        let mut schedule_times = Vec::new();
        let mut travel_times = Vec::new();
        for (i, &n) in segs_per_path.iter().enumerate() {
            let points: Vec<Location> = if i == 0 {
                vec![origin]
            } else {
                (0..=n).map(|k| origin.offset(x + k as f64 * 100.0, 0.0)).collect()
            };
            if i > 0 {
                x += n as f64 * 100.0;
            }
            let path = StopPath::new(format!("{}_{}", id, i), format!("s{}", i), &points)
                .unwrap()
                .with_layover(i == 0);
            stop_paths.push(Arc::new(path));
            schedule_times.push(if no_schedule {
                None
            } else {
                Some(ScheduleTime {
                    arrival_secs: Some(start_secs + 60 * i as i32),
                    departure_secs: Some(start_secs + 60 * i as i32),
                })
            });
            travel_times.push(TravelTimesForStopPath::new(vec![if i == 0 { 0 } else { 60_000 }], 0));
        }
        let n = segs_per_path.len() as i32;
        Trip {
            id: id.to_string(),
            route_id: "r1".to_string(),
            direction_id: None,
            block_id: "b1".to_string(),
            service_id: "svc".to_string(),
            pattern_id: "p1".to_string(),
            start_time_secs: start_secs,
            end_time_secs: start_secs + 60 * (n - 1),
            no_schedule,
            stop_paths,
            schedule_times,
            travel_times,
            max_distance_from_segment: None,
        }
    }

    pub(crate) fn two_trip_block() -> Arc<Block> {
        let trips = vec![
            Arc::new(straight_trip("t1", 8 * 3600, &[1, 2, 3], false)),
            Arc::new(straight_trip("t2", 9 * 3600, &[1, 2, 3], false)),
        ];
        Arc::new(Block::new("b1", "svc", trips, ServiceClock::new(0)).unwrap())
    }

    #[test]
    fn test_new_validates_ranges() {
        let block = two_trip_block();
        assert!(Indices::new(block.clone(), 0, 2, 2).is_ok());
        assert!(matches!(
            Indices::new(block.clone(), 2, 0, 0),
            Err(CoreError::IndexOutOfRange { what: "trip", .. })
        ));
        assert!(matches!(
            Indices::new(block.clone(), 0, 3, 0),
            Err(CoreError::IndexOutOfRange { what: "stop path", .. })
        ));
        assert!(matches!(
            Indices::new(block, 0, 1, 2),
            Err(CoreError::IndexOutOfRange { what: "segment", .. })
        ));
    }

    #[test]
    fn test_increment_rolls_over() {
        let block = two_trip_block();
        let i = Indices::new(block, 0, 2, 2).unwrap();
        let next = i.increment(0);
        assert_eq!((next.trip_index(), next.stop_path_index(), next.segment_index()), (1, 0, 0));
        // Original untouched
        assert_eq!(i.segment_index(), 2);
    }

    #[test]
    fn test_past_end_of_block() {
        let block = two_trip_block();
        let last = Indices::new(block, 1, 2, 2).unwrap();
        assert!(last.at_end_of_block());
        assert!(!last.past_end_of_block(0));
        assert!(last.increment(0).past_end_of_block(0));
        assert!(last.increment_stop_path(0).past_end_of_block(0));
    }

    #[test]
    fn test_decrement_to_before_beginning() {
        let block = two_trip_block();
        let first = Indices::new(block, 0, 0, 0).unwrap();
        assert!(first.decrement().before_beginning_of_block());
        assert!(first.decrement_stop_path().before_beginning_of_block());
        assert!(first.previous_stop_path(1).is_none());
    }

    #[test]
    fn test_decrement_stop_path_lands_on_last_segment() {
        let block = two_trip_block();
        let i = Indices::new(block, 1, 0, 0).unwrap();
        let prev = i.decrement_stop_path();
        assert_eq!((prev.trip_index(), prev.stop_path_index(), prev.segment_index()), (0, 2, 2));
        assert_eq!(i.previous_stop_path(1).unwrap().id, "t1_2");
    }

    #[test]
    fn test_no_schedule_loops_within_trip() {
        let trip = Arc::new(straight_trip("loop", 8 * 3600, &[1, 2], true));
        let block = Arc::new(Block::new("loop_b", "svc", vec![trip], ServiceClock::new(0)).unwrap());
        let end = Indices::new(block.clone(), 0, 1, 1).unwrap();

        // Before the trip end time the loop wraps to the start of the same trip
        let during = 8 * 3600 * 1000 - 1000;
        let wrapped = end.increment_stop_path(during);
        assert_eq!((wrapped.trip_index(), wrapped.stop_path_index()), (0, 0));
        assert!(!wrapped.past_end_of_block(during));

        // After it the cursor falls off the block
        let after = 9 * 3600 * 1000;
        assert!(end.increment_stop_path(after).past_end_of_block(after));

        // Ordering degrades to stop-path identity
        let a = Indices::new(block.clone(), 0, 1, 0).unwrap();
        let b = Indices::new(block, 0, 0, 0).unwrap();
        assert!(a.is_earlier_stop_path_than(&b));
        assert!(b.is_earlier_stop_path_than(&a));
        assert!(!a.is_earlier_stop_path_than(&a));
    }

    #[test]
    fn test_layover_and_wait_stop() {
        let block = two_trip_block();
        let at_layover = Indices::new(block.clone(), 1, 0, 0).unwrap();
        assert!(at_layover.is_layover());
        assert!(at_layover.is_wait_stop());
        let mid = Indices::new(block, 1, 2, 0).unwrap();
        assert!(!mid.is_layover());
        assert!(mid.at_end_of_trip());
        assert!(!mid.at_end_of_stop_path());
    }

    proptest! {
        #[test]
        fn prop_increment_then_decrement_is_identity(trip in 0i32..2, sp in 0i32..3, seg_seed in 0i32..3) {
            let block = two_trip_block();
            let seg = seg_seed.min(block.num_segments(trip, sp) - 1);
            let i = Indices::new(block, trip, sp, seg).unwrap();
            prop_assume!(!i.at_end_of_block());
            let back = i.increment(0).decrement();
            prop_assert_eq!(back, i);
        }

        #[test]
        fn prop_increment_is_strictly_later(trip in 0i32..2, sp in 0i32..3) {
            let block = two_trip_block();
            let i = Indices::new(block, trip, sp, 0).unwrap();
            prop_assert!(i.less_than(&i.increment(0)));
            prop_assert!(i.is_earlier_stop_path_than(&i.increment_stop_path(0)));
        }
    }
}
