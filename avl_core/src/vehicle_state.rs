//! Per-vehicle state.
//!
//! One `VehicleState` exists per vehicle id for the life of the process and
//! is only ever touched while holding that vehicle's lock (see
//! [`crate::vehicle_manager`]). Histories are fixed-capacity ring buffers,
//! most recent first; when full the oldest entry is evicted.

use crate::avl_report::{AssignmentType, AvlReport, VehicleId};
use crate::events::{ArrivalDeparture, Prediction};
use crate::reference::{Block, ReferenceSnapshot, Trip};
use crate::temporal::{TemporalDifference, TemporalMatch};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

/// Reassigning a vehicle to the block it just lost within this window is
/// treated as suspicious.
const NEWLY_ASSIGNED_WINDOW_MS: i64 = 20 * 60 * 1000;

/// A grabbed or terminated assignment stays problematic this long.
const PROBLEMATIC_ASSIGNMENT_WINDOW_MS: i64 = 2 * 60 * 60 * 1000;

/// Fixes older than this are not used to judge direction of travel.
const MAX_PREVIOUS_REPORT_AGE_MS: i64 = 20 * 60 * 1000;

/// GPS headings older than this are not used for display.
const MAX_HEADING_AGE_MS: i64 = 2 * 60 * 1000;

// ============================================================================
// ASSIGNMENT METHOD
// ============================================================================

/// How the current assignment (or lack of one) came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockAssignmentMethod {
    AvlFeedBlockAssignment,
    AvlFeedRouteAssignment,
    AvlFeedTripAssignment,
    AutoAssigner,
    /// Another vehicle took the block
    AssignmentGrabbed,
    /// Given up on after too many bad matches
    AssignmentTerminated,
    VehicleTimedOut,
    EndOfBlock,
    #[default]
    Unassigned,
}

impl BlockAssignmentMethod {
    pub fn for_assignment(kind: AssignmentType) -> Self {
        match kind {
            AssignmentType::Block | AssignmentType::Previous => Self::AvlFeedBlockAssignment,
            AssignmentType::Route => Self::AvlFeedRouteAssignment,
            AssignmentType::Trip => Self::AvlFeedTripAssignment,
        }
    }
}

impl fmt::Display for BlockAssignmentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ============================================================================
// RING BUFFER
// ============================================================================

/// Bounded most-recent-first history.
#[derive(Debug, Clone)]
pub struct History<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> History<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Adds at the front, evicting from the back when full.
    pub fn push(&mut self, item: T) {
        self.items.push_front(item);
        while self.items.len() > self.capacity {
            self.items.pop_back();
        }
    }

    /// Capacity changes (config reload) take effect on the next push.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    /// 0 is the most recent.
    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn latest(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

// ============================================================================
// VEHICLE STATE
// ============================================================================

pub struct VehicleState {
    vehicle_id: VehicleId,
    block: Option<Arc<Block>>,
    assignment_method: BlockAssignmentMethod,
    assignment_id: Option<String>,
    assignment_time_ms: Option<i64>,
    predictable: bool,

    /// `None` entries record that the vehicle was unmatched at that point
    matches: History<Option<TemporalMatch>>,
    reports: History<AvlReport>,

    bad_matches: u32,
    bad_assignments_in_a_row: u32,

    previous_block_before_unassigned: Option<Arc<Block>>,
    unassigned_time_ms: Option<i64>,

    /// Arrival computed ahead of its AVL time, held until the next departure
    arrival_to_store: Option<ArrivalDeparture>,
    last_arrival_time_ms: i64,
    last_arrival_stop_path_index: i32,
    last_departure_time_ms: i64,
    /// Time of the last arrival/departure handed to the sink
    last_event_time_ms: i64,
    last_avl_time_ms: Option<i64>,

    delayed: bool,
    canceled: bool,
    real_time_sched_adh: Option<TemporalDifference>,
    predictions: Vec<Prediction>,

    trip_counter: u32,
    trip_start_times: HashMap<u32, i64>,
    last_trip_index: Option<i32>,
    last_block_id: Option<String>,
    /// Block finished while processing the current report
    finished_block: Option<Arc<Block>>,
}

impl VehicleState {
    pub fn new(vehicle_id: VehicleId, match_history_size: usize, avl_history_size: usize) -> Self {
        Self {
            vehicle_id,
            block: None,
            assignment_method: BlockAssignmentMethod::Unassigned,
            assignment_id: None,
            assignment_time_ms: None,
            predictable: false,
            matches: History::new(match_history_size),
            reports: History::new(avl_history_size),
            bad_matches: 0,
            bad_assignments_in_a_row: 0,
            previous_block_before_unassigned: None,
            unassigned_time_ms: None,
            arrival_to_store: None,
            last_arrival_time_ms: 0,
            last_arrival_stop_path_index: -1,
            last_departure_time_ms: 0,
            last_event_time_ms: 0,
            last_avl_time_ms: None,
            delayed: false,
            canceled: false,
            real_time_sched_adh: None,
            predictions: Vec::new(),
            trip_counter: 0,
            trip_start_times: HashMap::new(),
            last_trip_index: None,
            last_block_id: None,
            finished_block: None,
        }
    }

    pub fn vehicle_id(&self) -> &VehicleId {
        &self.vehicle_id
    }

    /// Applies new history capacities from a reloaded config.
    pub fn set_history_sizes(&mut self, match_history_size: usize, avl_history_size: usize) {
        self.matches.set_capacity(match_history_size);
        self.reports.set_capacity(avl_history_size);
    }

    // ========================================================================
    // Assignment
    // ========================================================================

    pub fn set_block(
        &mut self,
        block: Option<Arc<Block>>,
        method: BlockAssignmentMethod,
        assignment_id: Option<String>,
        predictable: bool,
    ) {
        if self.block.is_some() && block.is_none() {
            self.previous_block_before_unassigned = self.block.take();
            self.unassigned_time_ms = self.avl_time_ms();
        }
        self.block = block;
        self.assignment_method = method;
        self.assignment_id = assignment_id;
        self.predictable = predictable;
        self.assignment_time_ms = self.avl_time_ms();
    }

    /// Clears the assignment and records why.
    pub fn unset_block(&mut self, method: BlockAssignmentMethod) {
        self.set_block(None, method, None, false);
    }

    pub fn block(&self) -> Option<&Arc<Block>> {
        self.block.as_ref()
    }

    pub fn assignment_id(&self) -> Option<&str> {
        self.assignment_id.as_deref()
    }

    pub fn assignment_method(&self) -> BlockAssignmentMethod {
        self.assignment_method
    }

    pub fn assignment_time_ms(&self) -> Option<i64> {
        self.assignment_time_ms
    }

    pub fn is_predictable(&self) -> bool {
        self.predictable
    }

    pub fn is_for_sched_based_preds(&self) -> bool {
        self.avl_report().map(|r| r.for_sched_based_preds).unwrap_or(false)
    }

    /// Just assigned to the same block it was recently taken off.
    pub fn newly_assigned_to_same_block(&self) -> bool {
        if self.previous_match().is_some() || self.current_match().is_none() {
            return false;
        }
        let same = match (&self.previous_block_before_unassigned, &self.block) {
            (Some(previous), Some(current)) => previous.same_block(current),
            _ => false,
        };
        match (same, self.avl_time_ms(), self.unassigned_time_ms) {
            (true, Some(now), Some(unassigned)) => now < unassigned + NEWLY_ASSIGNED_WINDOW_MS,
            _ => false,
        }
    }

    /// True if the report's hint names a different assignment.
    pub fn has_new_assignment(&self, report: &AvlReport, snapshot: &dyn ReferenceSnapshot) -> bool {
        let Some(assignment) = report.assignment.as_ref().filter(|_| report.has_valid_assignment()) else {
            return false;
        };
        match assignment.kind {
            AssignmentType::Block | AssignmentType::Route => {
                self.assignment_id.as_deref() != Some(assignment.id.as_str())
            }
            AssignmentType::Trip => {
                let avl_block = snapshot.trip(&assignment.id).and_then(|t| snapshot.block_for_trip(&t));
                match (&avl_block, &self.block) {
                    (Some(a), Some(b)) => !a.same_block(b),
                    (None, None) => false,
                    _ => true,
                }
            }
            AssignmentType::Previous => false,
        }
    }

    /// The current assignment was recently grabbed or terminated and the
    /// feed is still sending it.
    pub fn previous_assignment_problematic(&self, report: &AvlReport, snapshot: &dyn ReferenceSnapshot) -> bool {
        if !matches!(
            self.assignment_method,
            BlockAssignmentMethod::AssignmentGrabbed | BlockAssignmentMethod::AssignmentTerminated
        ) {
            return false;
        }
        if self.has_new_assignment(report, snapshot) {
            return false;
        }
        self.unassigned_time_ms
            .map(|t| report.time_ms - t < PROBLEMATIC_ASSIGNMENT_WINDOW_MS)
            .unwrap_or(false)
    }

    // ========================================================================
    // Matches
    // ========================================================================

    /// Records a match (or the lack of one) and resets the bad match count.
    pub fn set_match(&mut self, m: Option<TemporalMatch>) {
        let trip_changed = match (self.current_match().and_then(|c| c.trip()), m.as_ref().and_then(|n| n.trip())) {
            (Some(a), Some(b)) => a.id != b.id,
            _ => true,
        };
        if self.canceled && trip_changed {
            self.canceled = false;
        }
        if m.is_none() {
            self.predictable = false;
            self.arrival_to_store = None;
        }
        self.matches.push(m);
        self.bad_matches = 0;
    }

    pub fn current_match(&self) -> Option<&TemporalMatch> {
        self.matches.latest().and_then(|m| m.as_ref())
    }

    pub fn previous_match(&self) -> Option<&TemporalMatch> {
        self.matches.get(1).and_then(|m| m.as_ref())
    }

    /// Most recent match at least `minimum_age_ms` older than the current
    /// report. Stops at a gap where the vehicle was unmatched.
    pub fn previous_match_older_than(&self, minimum_age_ms: i64) -> Option<&TemporalMatch> {
        let now = self.avl_time_ms()?;
        for m in self.matches.iter() {
            let m = m.as_ref()?;
            if m.avl_time_ms() < now - minimum_age_ms {
                return Some(m);
            }
        }
        if self.matches.is_full() {
            error!(
                vehicle_id = %self.vehicle_id,
                minimum_age_ms,
                size = self.matches.len(),
                "match history too small to look back far enough"
            );
        }
        None
    }

    pub fn matches(&self) -> impl Iterator<Item = &Option<TemporalMatch>> {
        self.matches.iter()
    }

    pub fn match_history_len(&self) -> usize {
        self.matches.len()
    }

    pub fn increment_bad_matches(&mut self) {
        self.bad_matches += 1;
    }

    pub fn over_limit_of_bad_matches(&self, allowable: u32) -> bool {
        self.bad_matches > allowable
    }

    pub fn bad_matches(&self) -> u32 {
        self.bad_matches
    }

    pub fn last_match_is_valid(&self) -> bool {
        self.bad_matches == 0
    }

    pub fn trip(&self) -> Option<&Arc<Trip>> {
        self.current_match().and_then(|m| m.trip())
    }

    pub fn route_id(&self) -> Option<&str> {
        self.trip().map(|t| t.route_id.as_str())
    }

    pub fn is_layover(&self) -> bool {
        self.current_match().map(|m| m.is_layover()).unwrap_or(false)
    }

    pub fn is_wait_stop(&self) -> bool {
        self.current_match()
            .and_then(|m| m.at_stop())
            .map(|a| a.is_wait_stop())
            .unwrap_or(false)
    }

    // ========================================================================
    // AVL reports
    // ========================================================================

    pub fn set_avl_report(&mut self, report: AvlReport) {
        self.reports.push(report);
    }

    pub fn avl_report(&self) -> Option<&AvlReport> {
        self.reports.latest()
    }

    pub fn avl_time_ms(&self) -> Option<i64> {
        self.avl_report().map(|r| r.time_ms)
    }

    pub fn avl_history_len(&self) -> usize {
        self.reports.len()
    }

    /// Most recent earlier fix at least `min_distance` from the current one.
    pub fn previous_avl_report_by_distance(&self, min_distance: f64) -> Option<&AvlReport> {
        let current = self.avl_report()?;
        for previous in self.reports.iter().skip(1) {
            if current.time_ms - previous.time_ms > MAX_PREVIOUS_REPORT_AGE_MS {
                return None;
            }
            if previous.location.distance(&current.location) > min_distance {
                return Some(previous);
            }
        }
        None
    }

    /// Most recent fix at least `minimum_age_ms` older than the current one.
    pub fn previous_avl_report_older_than(&self, minimum_age_ms: i64) -> Option<&AvlReport> {
        let now = self.avl_time_ms()?;
        let found = self.reports.iter().find(|r| r.time_ms < now - minimum_age_ms);
        if found.is_none() && self.reports.is_full() {
            error!(vehicle_id = %self.vehicle_id, minimum_age_ms, "AVL history too small to look back far enough");
        }
        found
    }

    /// The fix that produced the last successful match, skipping fixes that
    /// failed to match since.
    pub fn previous_avl_report_from_successful_match(&self) -> Option<&AvlReport> {
        self.reports.get(1 + self.bad_matches as usize)
    }

    pub fn last_avl_time_ms(&self) -> Option<i64> {
        self.last_avl_time_ms
    }

    pub fn set_last_avl_time_ms(&mut self, time_ms: i64) {
        self.last_avl_time_ms = Some(time_ms);
    }

    // ========================================================================
    // Arrival/departure bookkeeping
    // ========================================================================

    pub fn set_arrival_to_store(&mut self, arrival: Option<ArrivalDeparture>) {
        self.arrival_to_store = arrival;
    }

    pub fn arrival_to_store(&self) -> Option<&ArrivalDeparture> {
        self.arrival_to_store.as_ref()
    }

    pub fn take_arrival_to_store(&mut self) -> Option<ArrivalDeparture> {
        self.arrival_to_store.take()
    }

    pub fn last_arrival_time_ms(&self) -> i64 {
        self.last_arrival_time_ms
    }

    pub fn last_arrival_stop_path_index(&self) -> i32 {
        self.last_arrival_stop_path_index
    }

    pub fn set_last_arrival(&mut self, time_ms: i64, stop_path_index: i32) {
        self.last_arrival_time_ms = time_ms;
        self.last_arrival_stop_path_index = stop_path_index;
    }

    pub fn last_departure_time_ms(&self) -> i64 {
        self.last_departure_time_ms
    }

    pub fn set_last_departure_time_ms(&mut self, time_ms: i64) {
        self.last_departure_time_ms = time_ms;
    }

    pub fn last_event_time_ms(&self) -> i64 {
        self.last_event_time_ms
    }

    pub fn set_last_event_time_ms(&mut self, time_ms: i64) {
        self.last_event_time_ms = time_ms;
    }

    // ========================================================================
    // Status flags
    // ========================================================================

    pub fn is_delayed(&self) -> bool {
        self.delayed
    }

    pub fn set_delayed(&mut self, delayed: bool) {
        self.delayed = delayed;
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    pub fn finished_block(&self) -> Option<&Arc<Block>> {
        self.finished_block.as_ref()
    }

    pub fn set_finished_block(&mut self, block: Option<Arc<Block>>) {
        self.finished_block = block;
    }

    pub fn set_canceled(&mut self, canceled: bool) {
        self.canceled = canceled;
    }

    pub fn bad_assignments_in_a_row(&self) -> u32 {
        self.bad_assignments_in_a_row
    }

    pub fn set_bad_assignments_in_a_row(&mut self, count: u32) {
        self.bad_assignments_in_a_row = count;
    }

    pub fn real_time_sched_adh(&self) -> Option<TemporalDifference> {
        self.real_time_sched_adh
    }

    pub fn set_real_time_sched_adh(&mut self, adherence: Option<TemporalDifference>) {
        self.real_time_sched_adh = adherence;
    }

    pub fn predictions(&self) -> &[Prediction] {
        &self.predictions
    }

    pub fn set_predictions(&mut self, predictions: Vec<Prediction>) {
        self.predictions = predictions;
    }

    // ========================================================================
    // Loop trips
    // ========================================================================

    pub fn trip_counter(&self) -> u32 {
        self.trip_counter
    }

    pub fn increment_trip_counter(&mut self) {
        self.trip_counter += 1;
    }

    /// Counts a new pass when an arrival opens a trip, or when an event is
    /// earlier on the pattern than the previous match.
    pub fn increment_trip_counter_for(&mut self, event: &ArrivalDeparture) {
        let wrapped = self
            .previous_match()
            .map(|m| m.stop_path_index() > event.stop_path_index)
            .unwrap_or(false);
        if (event.stop_path_index == 0 && event.is_arrival()) || (event.stop_path_index != 0 && wrapped) {
            self.trip_counter += 1;
            debug!(vehicle_id = %self.vehicle_id, trip_counter = self.trip_counter, "trip counter incremented");
        }
    }

    /// Only the first start time recorded for a counter is kept.
    pub fn put_trip_start_time(&mut self, trip_counter: u32, time_ms: i64) {
        if time_ms > 0 {
            self.trip_start_times.entry(trip_counter).or_insert(time_ms);
        }
    }

    pub fn trip_start_time(&self, trip_counter: u32) -> Option<i64> {
        self.trip_start_times.get(&trip_counter).copied()
    }

    pub fn last_trip_index(&self) -> Option<i32> {
        self.last_trip_index
    }

    pub fn set_last_trip(&mut self, trip_index: i32, block_id: &str) {
        self.last_trip_index = Some(trip_index);
        self.last_block_id = Some(block_id.to_string());
    }

    pub fn last_block_id(&self) -> Option<&str> {
        self.last_block_id.as_deref()
    }

    // ========================================================================
    // Display heading
    // ========================================================================

    /// Heading of the matched segment; none at a layover where the vehicle
    /// may be deadheading.
    pub fn path_heading(&self) -> Option<f32> {
        let m = self.current_match()?;
        if m.stop_path()?.layover {
            return None;
        }
        m.segment()?.heading
    }

    fn next_path_heading_if_at_layover(&self, radius: f64) -> Option<f32> {
        let m = self.current_match()?;
        if !m.is_layover() {
            return None;
        }
        let report = self.avl_report()?;
        if m.stop_path()?.end_location().distance(&report.location) > radius {
            return None;
        }
        let next = m.trip()?.stop_path(m.stop_path_index() + 1)?;
        next.segment(0)?.heading
    }

    fn recent_valid_heading(&self) -> Option<f32> {
        let now = self.avl_time_ms()?;
        self.reports
            .iter()
            .take_while(|r| r.time_ms >= now - MAX_HEADING_AGE_MS)
            .find_map(|r| r.heading)
    }

    /// Heading to show for the vehicle: the path heading, else a recent GPS
    /// heading, else the path leaving a layover the vehicle is sitting at.
    pub fn heading(&self, layover_radius: f64) -> Option<f32> {
        self.path_heading()
            .or_else(|| self.recent_valid_heading())
            .or_else(|| self.next_path_heading_if_at_layover(layover_radius))
    }
}

impl fmt::Debug for VehicleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VehicleState")
            .field("vehicle_id", &self.vehicle_id)
            .field("block", &self.block.as_ref().map(|b| b.id.as_str()))
            .field("assignment_method", &self.assignment_method)
            .field("predictable", &self.predictable)
            .field("bad_matches", &self.bad_matches)
            .field("match", &self.current_match())
            .field("delayed", &self.delayed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Location;
    use crate::indices::tests::two_trip_block;
    use crate::indices::Indices;
    use crate::spatial_match::SpatialMatch;
    use proptest::prelude::*;

    const T0: i64 = 1_704_067_200_000 + 8 * 3_600_000;

    fn report(time_ms: i64, east: f64) -> AvlReport {
        AvlReport::new("v1", time_ms, Location::new(37.0, -122.0).offset(east, 0.0))
    }

    fn temporal(sp: i32, seg: i32, along: f64, time_ms: i64) -> TemporalMatch {
        let m = SpatialMatch::new(time_ms, Indices::new(two_trip_block(), 0, sp, seg).unwrap(), 1.0, along);
        TemporalMatch::new(m, TemporalDifference::ON_TIME)
    }

    fn state() -> VehicleState {
        VehicleState::new(VehicleId::new("v1"), 5, 5)
    }

    #[test]
    fn test_set_match_resets_bad_matches() {
        let mut vs = state();
        vs.increment_bad_matches();
        vs.increment_bad_matches();
        assert!(vs.over_limit_of_bad_matches(1));
        vs.set_match(Some(temporal(1, 0, 10.0, T0)));
        assert!(vs.last_match_is_valid());
        assert!(vs.current_match().is_some());
    }

    #[test]
    fn test_null_match_clears_predictable_and_buffer() {
        let mut vs = state();
        vs.set_avl_report(report(T0, 0.0));
        vs.set_block(Some(two_trip_block()), BlockAssignmentMethod::AvlFeedBlockAssignment, Some("b1".into()), true);
        vs.set_match(Some(temporal(1, 0, 10.0, T0)));
        let m = vs.current_match().unwrap().spatial().clone();
        let arrival = ArrivalDeparture::at_stop_of(crate::events::StopEventKind::Arrival, &VehicleId::new("v1"), T0, T0, &m);
        vs.set_arrival_to_store(arrival);
        vs.set_match(None);
        assert!(!vs.is_predictable());
        assert!(vs.arrival_to_store().is_none());
        assert!(vs.current_match().is_none());
    }

    #[test]
    fn test_previous_match_older_than_stops_at_gap() {
        let mut vs = state();
        vs.set_match(Some(temporal(1, 0, 0.0, T0)));
        vs.set_match(None);
        vs.set_match(Some(temporal(2, 0, 0.0, T0 + 60_000)));
        vs.set_avl_report(report(T0 + 120_000, 0.0));
        assert!(vs.previous_match_older_than(30_000).is_some());
        // The only older match is behind an unmatched gap
        assert!(vs.previous_match_older_than(90_000).is_none());
    }

    #[test]
    fn test_previous_report_by_distance() {
        let mut vs = state();
        vs.set_avl_report(report(T0, 0.0));
        vs.set_avl_report(report(T0 + 10_000, 50.0));
        vs.set_avl_report(report(T0 + 20_000, 120.0));
        let previous = vs.previous_avl_report_by_distance(100.0).unwrap();
        assert_eq!(previous.time_ms, T0);
        assert!(vs.previous_avl_report_by_distance(500.0).is_none());
    }

    #[test]
    fn test_unassigning_remembers_previous_block() {
        let mut vs = state();
        vs.set_avl_report(report(T0, 0.0));
        vs.set_block(Some(two_trip_block()), BlockAssignmentMethod::AvlFeedBlockAssignment, Some("b1".into()), true);
        vs.set_match(Some(temporal(1, 0, 0.0, T0)));
        vs.unset_block(BlockAssignmentMethod::AssignmentGrabbed);
        vs.set_match(None);
        assert_eq!(vs.assignment_method(), BlockAssignmentMethod::AssignmentGrabbed);

        vs.set_avl_report(report(T0 + 60_000, 0.0));
        vs.set_block(Some(two_trip_block()), BlockAssignmentMethod::AvlFeedBlockAssignment, Some("b1".into()), true);
        vs.set_match(Some(temporal(1, 0, 10.0, T0 + 60_000)));
        assert!(vs.newly_assigned_to_same_block());
    }

    #[test]
    fn test_trip_counter_and_start_times() {
        let mut vs = state();
        vs.set_match(Some(temporal(2, 0, 0.0, T0)));
        vs.set_match(Some(temporal(1, 0, 0.0, T0 + 1000)));
        let m = vs.current_match().unwrap().spatial().clone();
        let event = ArrivalDeparture::at_stop_of(crate::events::StopEventKind::Arrival, &VehicleId::new("v1"), T0, T0, &m).unwrap();
        // Previous match was further along the pattern
        vs.increment_trip_counter_for(&event);
        assert_eq!(vs.trip_counter(), 1);

        vs.put_trip_start_time(1, 100);
        vs.put_trip_start_time(1, 200);
        assert_eq!(vs.trip_start_time(1), Some(100));
    }

    #[test]
    fn test_heading_prefers_path() {
        let mut vs = state();
        vs.set_avl_report(report(T0, 150.0).with_heading(10.0));
        assert_eq!(vs.heading(200.0), Some(10.0));
        vs.set_match(Some(temporal(2, 0, 50.0, T0)));
        let heading = vs.heading(200.0).unwrap();
        // Eastward path
        assert!((heading - 90.0).abs() < 1.0);
    }

    proptest! {
        #[test]
        fn prop_history_is_bounded_most_recent_first(capacity in 1usize..10, n in 0usize..40) {
            let mut history = History::new(capacity);
            for i in 0..n {
                history.push(i);
            }
            prop_assert_eq!(history.len(), n.min(capacity));
            if n > 0 {
                prop_assert_eq!(history.latest().copied(), Some(n - 1));
            }
            let items: Vec<usize> = history.iter().copied().collect();
            prop_assert!(items.windows(2).all(|w| w[0] > w[1]));
        }
    }
}
