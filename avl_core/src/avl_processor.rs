//! Per-report orchestration.
//!
//! Each report is processed under its vehicle's lock. The vehicle is either
//! re-matched along its current assignment, matched fresh to the assignment
//! the feed names, or handed to the auto assigner. A successful match then
//! produces predictions, a match record and arrival/departure events, all
//! handed to the outbound sink without blocking.
//!
//! Nothing here returns an error to the caller. Every failure degrades the
//! vehicle to unpredictable or drops a derived record.

use crate::arrival_departure::{arrival_departure_generator, ArrivalDepartureGenerator};
use crate::auto_assign::{AutoAssigner, DisabledAutoAssigner};
use crate::avl_report::{AssignmentType, AvlReport, NoCancellations, TripCancellations, VehicleId};
use crate::config::{ConfigProvider, CoreConfig};
use crate::events::{
    emit, CoreEvent, EventSink, MatchRecord, PredictionSet, VehicleEvent, VehicleEventType, VehicleStateChanged,
};
use crate::indices::Indices;
use crate::prediction::{prediction_generator, PredictionGenerator};
use crate::reference::{Block, ReferenceSnapshot};
use crate::schedule_adherence::real_time_adherence;
use crate::service_time::MS_PER_SEC;
use crate::spatial_match::SpatialMatch;
use crate::spatial_matcher::{MatchingType, SpatialMatcher};
use crate::temporal::{TemporalDifference, TemporalMatch};
use crate::temporal_matcher::TemporalMatcher;
use crate::travel_times::TravelTimes;
use crate::vehicle_manager::{lock_state, BlockKey, PendingGrab, VehicleStateManager};
use crate::vehicle_state::{BlockAssignmentMethod, VehicleState};
use std::sync::{Arc, TryLockError};
use tracing::{debug, error, info, warn};

/// A report is processed at most this many times; the second pass only
/// happens after the vehicle reached the end of its block.
const MAX_PASSES: usize = 2;

fn block_key(block: &Block) -> BlockKey {
    (block.service_id.clone(), block.id.clone())
}

pub struct AvlProcessor {
    config: Arc<dyn ConfigProvider>,
    snapshot: Arc<dyn ReferenceSnapshot>,
    manager: Arc<VehicleStateManager>,
    sink: Arc<EventSink>,
    cancellations: Arc<dyn TripCancellations>,
    auto_assigner: Arc<dyn AutoAssigner>,
    spatial: SpatialMatcher,
    temporal: TemporalMatcher,
    travel_times: Arc<TravelTimes>,
    arrivals: Arc<dyn ArrivalDepartureGenerator>,
    predictions: Arc<dyn PredictionGenerator>,
}

impl AvlProcessor {
    /// Generators are chosen from the configuration current at construction.
    pub fn new(
        config: Arc<dyn ConfigProvider>,
        snapshot: Arc<dyn ReferenceSnapshot>,
        manager: Arc<VehicleStateManager>,
        sink: Arc<EventSink>,
    ) -> Self {
        let travel_times = Arc::new(TravelTimes::new(Arc::clone(&config)));
        Self {
            spatial: SpatialMatcher::new(Arc::clone(&config)),
            temporal: TemporalMatcher::new(Arc::clone(&config), Arc::clone(&travel_times)),
            arrivals: arrival_departure_generator(Arc::clone(&config)),
            predictions: prediction_generator(Arc::clone(&config)),
            cancellations: Arc::new(NoCancellations),
            auto_assigner: Arc::new(DisabledAutoAssigner),
            travel_times,
            config,
            snapshot,
            manager,
            sink,
        }
    }

    pub fn with_auto_assigner(mut self, auto_assigner: Arc<dyn AutoAssigner>) -> Self {
        self.auto_assigner = auto_assigner;
        self
    }

    pub fn with_cancellations(mut self, cancellations: Arc<dyn TripCancellations>) -> Self {
        self.cancellations = cancellations;
        self
    }

    pub fn manager(&self) -> &Arc<VehicleStateManager> {
        &self.manager
    }

    pub fn snapshot(&self) -> &Arc<dyn ReferenceSnapshot> {
        &self.snapshot
    }

    pub fn config(&self) -> Arc<CoreConfig> {
        self.config.current()
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    /// Processes one fix for its vehicle.
    pub fn process_avl_report(&self, report: AvlReport) {
        let config = self.config.current();
        let shared = self.manager.get_or_create(
            &report.vehicle_id,
            config.match_history_max_size,
            config.avl_history_max_size,
        );
        let mut state = lock_state(&shared);
        state.set_history_sizes(config.match_history_max_size, config.avl_history_max_size);
        self.apply_pending_grab(&mut state);

        debug!(vehicle_id = %report.vehicle_id, time_ms = report.time_ms, "processing AVL report");
        let time_ms = report.time_ms;
        state.set_finished_block(None);
        state.set_avl_report(report);
        state.set_last_avl_time_ms(time_ms);

        if self.is_cancelled(&mut state) {
            return;
        }
        if state.avl_report().map(|r| r.ignore_because_in_consist()).unwrap_or(false) {
            debug!(vehicle_id = %state.vehicle_id(), "non-lead vehicle of a consist, ignoring");
            return;
        }

        for pass in 0..MAX_PASSES {
            self.match_report(&mut state, &config);
            if !self.generate_results(&mut state, &config) {
                break;
            }
            if pass + 1 == MAX_PASSES {
                error!(vehicle_id = %state.vehicle_id(), "end of block reached again after reassignment");
            } else {
                debug!(vehicle_id = %state.vehicle_id(), "end of block reached, matching report again");
            }
        }

        self.publish_state(&state, &config);
    }

    /// Applies revocations parked while the vehicle's lock was busy.
    pub fn sweep_pending_grabs(&self) {
        for vehicle_id in self.manager.pending_grab_ids() {
            if let Some(shared) = self.manager.get(&vehicle_id) {
                let mut state = lock_state(&shared);
                self.apply_pending_grab(&mut state);
            }
        }
    }

    // ========================================================================
    // Decision table
    // ========================================================================

    fn match_report(&self, state: &mut VehicleState, config: &CoreConfig) {
        let Some(report) = state.avl_report().cloned() else {
            return;
        };
        let snapshot = self.snapshot.as_ref();
        let has_new_assignment = state.has_new_assignment(&report, snapshot);

        if state.is_predictable() && !has_new_assignment {
            self.match_new_fix_for_predictable_vehicle(state, config);
        } else if report.has_valid_assignment()
            && (!state.is_predictable() || has_new_assignment)
            && !state.previous_assignment_problematic(&report, snapshot)
        {
            self.match_vehicle_to_assignment(state, config);
        } else {
            self.handle_problem_assignment(state, config);
        }
    }

    /// Predictions, match record and stop events for a good match. True if
    /// the vehicle just finished its block.
    fn generate_results(&self, state: &mut VehicleState, config: &CoreConfig) -> bool {
        if !(state.is_predictable() && state.last_match_is_valid()) {
            return false;
        }
        state.set_bad_assignments_in_a_row(0);
        self.handle_possible_vehicle_delay(state, config);
        self.determine_and_set_real_time_sch_adh(state);
        if !state.is_predictable() {
            return false;
        }

        self.process_predictions(state, config);
        if let Some(m) = state.current_match() {
            if let Some(trip) = m.trip() {
                let (trip_index, block_id) = (m.trip_index(), trip.block_id.clone());
                if m.at_stop().is_none() {
                    emit(&*self.sink, CoreEvent::Match(MatchRecord::new(state.vehicle_id(), m)));
                }
                state.set_last_trip(trip_index, &block_id);
            }
        }
        self.arrivals.generate(state, &*self.sink);

        self.handle_possible_end_of_block(state)
    }

    // ========================================================================
    // Re-matching an assigned vehicle
    // ========================================================================

    fn match_new_fix_for_predictable_vehicle(&self, state: &mut VehicleState, config: &CoreConfig) {
        let (Some(report), Some(previous)) = (state.avl_report().cloned(), state.current_match().cloned()) else {
            return;
        };
        let previous_avl_time_ms = previous.avl_time_ms();
        let candidates = self.spatial.rematch(&report, &previous, previous_avl_time_ms);
        debug!(vehicle_id = %report.vehicle_id, candidates = candidates.len(), "rematching predictable vehicle");

        let mut best = None;
        if config.strict_trip_assignment_match {
            best = self
                .temporal
                .best_temporal_match(&report, &previous, previous_avl_time_ms, &candidates, true);
        }
        if best.is_none() {
            best = self
                .temporal
                .best_temporal_match(&report, &previous, previous_avl_time_ms, &candidates, false);
        }

        if best.is_none() {
            state.increment_bad_matches();
        }
        if self.handle_if_vehicle_not_making_progress(best.as_ref(), state, config) {
            return;
        }

        match best {
            Some(m) => state.set_match(Some(m)),
            None if state.over_limit_of_bad_matches(config.allowable_number_of_bad_matches) => {
                let description = format!(
                    "Vehicle had {} bad spatial matches in a row and so was made unpredictable.",
                    state.bad_matches()
                );
                self.make_vehicle_unpredictable_and_terminate_assignment(
                    state,
                    VehicleEventType::NoMatch,
                    description,
                    BlockAssignmentMethod::AssignmentTerminated,
                );
            }
            None => {
                debug!(
                    vehicle_id = %report.vehicle_id,
                    bad_matches = state.bad_matches(),
                    "bad match, keeping previous match"
                );
            }
        }

        if state.is_predictable() && state.last_match_is_valid() && self.verify_real_time_sch_adh(state, config) {
            self.match_vehicle_to_assignment(state, config);
        }
    }

    /// True (and the vehicle made unpredictable) if it barely moved over the
    /// no-progress window without waiting at a wait stop.
    fn handle_if_vehicle_not_making_progress(
        &self,
        best: Option<&TemporalMatch>,
        state: &mut VehicleState,
        config: &CoreConfig,
    ) -> bool {
        let Some(best) = best else {
            return false;
        };
        let window_ms = config.time_for_determining_no_progress_secs * MS_PER_SEC;
        if window_ms <= 0 {
            return false;
        }
        let Some(previous) = state.previous_match_older_than(window_ms) else {
            return false;
        };
        let distance = previous.distance_between_matches(best);
        if distance >= config.min_distance_for_no_progress || previous.traversed_wait_stop(best) {
            return false;
        }
        let elapsed_ms = best.avl_time_ms() - previous.avl_time_ms();
        let description = format!(
            "Vehicle only traveled {:.1}m over the last {}s which is below the minimum of {:.1}m so was made unpredictable.",
            distance,
            elapsed_ms / MS_PER_SEC,
            config.min_distance_for_no_progress
        );
        self.make_vehicle_unpredictable(state, VehicleEventType::NoProgress, description);
        true
    }

    /// Flags a vehicle that barely moved over the delay window. The flag is
    /// recomputed on every match.
    fn handle_possible_vehicle_delay(&self, state: &mut VehicleState, config: &CoreConfig) {
        let was_delayed = state.is_delayed();
        state.set_delayed(false);
        let window_ms = config.time_for_determining_delayed_secs * MS_PER_SEC;
        if window_ms <= 0 {
            return;
        }
        let Some(current) = state.current_match().cloned() else {
            return;
        };
        let Some(previous) = state.previous_match_older_than(window_ms) else {
            return;
        };
        let distance = previous.distance_between_matches(&current);
        if distance >= config.min_distance_for_delayed || previous.traversed_wait_stop(&current) {
            return;
        }
        let elapsed_ms = current.avl_time_ms() - previous.avl_time_ms();
        state.set_delayed(true);
        if !was_delayed {
            let description = format!(
                "Vehicle is delayed. Over {}s it traveled only {:.1}m.",
                elapsed_ms / MS_PER_SEC,
                distance
            );
            info!(vehicle_id = %state.vehicle_id(), distance, elapsed_ms, "vehicle delayed");
            self.emit_vehicle_event(state, VehicleEventType::Delayed, description, true, false);
        }
    }

    fn adherence(&self, state: &VehicleState) -> Option<TemporalDifference> {
        let block = state.block()?;
        if block.no_schedule() {
            return None;
        }
        let m = state.current_match()?;
        real_time_adherence(state.vehicle_id().as_str(), m, state.avl_time_ms()?, &self.travel_times)
    }

    fn determine_and_set_real_time_sch_adh(&self, state: &mut VehicleState) {
        if state.block().map(|b| b.no_schedule()).unwrap_or(true) {
            return;
        }
        let adherence = self.adherence(state);
        state.set_real_time_sched_adh(adherence);
    }

    /// Logs a vehicle stuck at a terminal. True (and the vehicle made
    /// unpredictable) when adherence is outside the allowed bounds, meaning
    /// the vehicle should be matched to its assignment again.
    fn verify_real_time_sch_adh(&self, state: &mut VehicleState, config: &CoreConfig) -> bool {
        let Some(adherence) = self.adherence(state) else {
            return false;
        };
        let stuck_at_terminal = state
            .current_match()
            .map(|m| m.is_wait_stop() && m.at_stop().is_some())
            .unwrap_or(false);
        if stuck_at_terminal && adherence.late() > config.allowable_late_at_terminal_for_logging_event * MS_PER_SEC {
            let description = format!("Vehicle still at terminal {}.", adherence);
            self.emit_vehicle_event(state, VehicleEventType::NotLeavingTerminal, description, true, false);
        }

        if adherence.is_within_bounds(config) {
            return false;
        }
        warn!(
            vehicle_id = %state.vehicle_id(),
            %adherence,
            "schedule adherence outside bounds, matching to assignment again"
        );
        let description = format!(
            "Vehicle had schedule adherence of {} which is beyond acceptable limits. Therefore vehicle made unpredictable.",
            adherence
        );
        self.make_vehicle_unpredictable(state, VehicleEventType::NoMatch, description);
        true
    }

    // ========================================================================
    // Matching to an assignment
    // ========================================================================

    /// Matches the vehicle to the assignment in its report, falling back to
    /// the auto assigner. True if the vehicle ended up predictable.
    fn match_vehicle_to_assignment(&self, state: &mut VehicleState, config: &CoreConfig) -> bool {
        let Some(report) = state.avl_report().cloned() else {
            return false;
        };
        if state.is_predictable() && state.has_new_assignment(&report, self.snapshot.as_ref()) {
            let description = format!(
                "The vehicle assignment is being changed to {}",
                report.assignment.as_ref().map(|a| a.id.as_str()).unwrap_or("none")
            );
            self.make_vehicle_unpredictable_and_terminate_assignment(
                state,
                VehicleEventType::AssignmentChanged,
                description,
                BlockAssignmentMethod::AssignmentTerminated,
            );
        }

        if let Some(assignment) = report.assignment.as_ref().filter(|_| report.has_valid_assignment()) {
            let method = BlockAssignmentMethod::for_assignment(assignment.kind);
            match assignment.kind {
                AssignmentType::Block => {
                    if let Some(block) = self.snapshot.active_block(&assignment.id, report.time_ms) {
                        return self.match_vehicle_to_block_assignment(state, &block, method, config);
                    }
                }
                AssignmentType::Trip => {
                    let block = self
                        .snapshot
                        .trip(&assignment.id)
                        .and_then(|t| self.snapshot.block_for_trip(&t));
                    if let Some(block) = block {
                        return self.match_vehicle_to_block_assignment(state, &block, method, config);
                    }
                }
                AssignmentType::Route => {
                    return self.match_vehicle_to_route_assignment(state, &assignment.id, config);
                }
                AssignmentType::Previous => {}
            }
        }

        if self.automatically_match_vehicle_to_assignment(state, config) {
            return true;
        }

        if let Some(assignment) = report.assignment.as_ref().filter(|a| a.kind == AssignmentType::Trip) {
            let description = format!("Assignment {} not valid", assignment.id);
            self.emit_vehicle_event(state, VehicleEventType::UnmatchedAssignment, description, false, true);
        }
        state.unset_block(BlockAssignmentMethod::Unassigned);
        self.manager.release_blocks(state.vehicle_id());
        false
    }

    fn match_vehicle_to_block_assignment(
        &self,
        state: &mut VehicleState,
        block: &Arc<Block>,
        method: BlockAssignmentMethod,
        config: &CoreConfig,
    ) -> bool {
        let Some(report) = state.avl_report().cloned() else {
            return false;
        };
        let trips = block.trips_currently_active(
            report.time_ms,
            config.allowable_early_for_layover_secs,
            config.allowable_late_secs,
        );
        let candidates = self
            .spatial
            .spatial_matches(&report, block, &trips, MatchingType::Standard);

        let mut best = None;
        if config.strict_trip_assignment_match {
            best = self
                .temporal
                .best_temporal_match_compared_to_schedule(&report, &candidates, true);
        }
        if best.is_none() {
            best = self
                .temporal
                .best_temporal_match_compared_to_schedule(&report, &candidates, false);
        }

        if let Some(m) = &best {
            let previous = state.previous_avl_report_by_distance(
                config.distance_between_avls_for_initial_matching_without_heading,
            );
            if self
                .spatial
                .problem_match_due_to_lack_of_heading(m, &report, previous, MatchingType::Standard)
            {
                debug!(vehicle_id = %report.vehicle_id, block_id = %block.id, "no heading to confirm match, not assigning");
                return false;
            }
        }

        if best.is_none() {
            best = self.match_to_layover_even_if_off_route(&report, block, &trips);
        }

        if let Some(m) = &best {
            if self.match_problematic_due_to_other_vehicle(m, state, config) {
                return false;
            }
        }

        self.update_state_from_assignment(best, state, method, &block.id, config)
    }

    /// A vehicle assigned a block but not yet on its route is placed at the
    /// start of the first trip it can still reach in time.
    fn match_to_layover_even_if_off_route(
        &self,
        report: &AvlReport,
        block: &Arc<Block>,
        trips: &[i32],
    ) -> Option<TemporalMatch> {
        let trip_index = self
            .temporal
            .match_to_layover_stop_even_if_off_route(report, block, trips)?;
        let first_stop = block.trip(trip_index)?.stop_path(0)?.end_location();
        let indices = Indices::start_of_trip(Arc::clone(block), trip_index).ok()?;
        let beginning = SpatialMatch::new(report.time_ms, indices, first_stop.distance(&report.location), 0.0);
        debug!(vehicle_id = %report.vehicle_id, block_id = %block.id, trip_index, "matched to layover off route");
        Some(TemporalMatch::new(beginning, TemporalDifference::ON_TIME))
    }

    fn match_vehicle_to_route_assignment(&self, state: &mut VehicleState, route_id: &str, config: &CoreConfig) -> bool {
        let Some(report) = state.avl_report().cloned() else {
            return false;
        };
        let previous = state
            .previous_avl_report_by_distance(config.distance_between_avls_for_initial_matching_without_heading)
            .cloned();

        let mut candidates = Vec::new();
        for block in self
            .snapshot
            .active_blocks_for_route(route_id, report.time_ms, 0, config.ignore_inactive_blocks)
        {
            let trips = block.trips_currently_active(
                report.time_ms,
                config.allowable_early_for_layover_secs,
                config.allowable_late_secs,
            );
            if trips.is_empty() {
                continue;
            }
            for m in self
                .spatial
                .spatial_matches(&report, &block, &trips, MatchingType::AutoAssigning)
            {
                let heading_problem = self.spatial.problem_match_due_to_lack_of_heading(
                    &m,
                    &report,
                    previous.as_ref(),
                    MatchingType::AutoAssigning,
                );
                if !heading_problem && m.away_from_terminals(config.terminal_distance_for_route_matching) {
                    candidates.push(m);
                }
            }
        }

        let best = self
            .temporal
            .best_temporal_match_compared_to_schedule(&report, &candidates, false);
        self.update_state_from_assignment(best, state, BlockAssignmentMethod::AvlFeedRouteAssignment, route_id, config)
    }

    fn automatically_match_vehicle_to_assignment(&self, state: &mut VehicleState, config: &CoreConfig) -> bool {
        if state.is_for_sched_based_preds() {
            return false;
        }
        let Some(best) = self
            .auto_assigner
            .auto_assign(state, self.snapshot.as_ref(), &self.manager)
        else {
            return false;
        };
        let block_id = best.block().id.clone();
        self.update_state_from_assignment(Some(best), state, BlockAssignmentMethod::AutoAssigner, &block_id, config)
    }

    /// The vehicle's feed assignment is unusable. A predictable vehicle keeps
    /// its old assignment for a few reports, others try the auto assigner.
    fn handle_problem_assignment(&self, state: &mut VehicleState, config: &CoreConfig) {
        debug!(vehicle_id = %state.vehicle_id(), "no usable assignment");
        if !(state.is_predictable() && state.assignment_id().is_some()) {
            self.automatically_match_vehicle_to_assignment(state, config);
            return;
        }
        if state.bad_assignments_in_a_row() < config.allowable_bad_assignments {
            debug!(
                vehicle_id = %state.vehicle_id(),
                bad_assignments = state.bad_assignments_in_a_row(),
                "using previous assignment"
            );
            self.match_new_fix_for_predictable_vehicle(state, config);
            state.set_bad_assignments_in_a_row(state.bad_assignments_in_a_row() + 1);
        } else {
            let description = format!(
                "Vehicle was assigned to {} but received {} bad assignments in a row so was made unpredictable.",
                state.assignment_id().unwrap_or_default(),
                state.bad_assignments_in_a_row()
            );
            self.make_vehicle_unpredictable(state, VehicleEventType::AssignmentChanged, description);
        }
    }

    /// Records a new assignment, taking the block from any vehicle that
    /// holds it. True if the vehicle is now predictable.
    fn update_state_from_assignment(
        &self,
        best: Option<TemporalMatch>,
        state: &mut VehicleState,
        method: BlockAssignmentMethod,
        assignment_id: &str,
        config: &CoreConfig,
    ) -> bool {
        let vehicle_id = state.vehicle_id().clone();
        let time_ms = state.avl_time_ms().unwrap_or_default();
        let Some(best) = best else {
            debug!(%vehicle_id, assignment_id, %method, "no match for assignment, not predictable");
            state.set_match(None);
            state.set_block(None, method, Some(assignment_id.to_string()), false);
            self.manager.release_blocks(&vehicle_id);
            return false;
        };

        let block = Arc::clone(best.block());
        if state.finished_block().map(|b| b.same_block(&block)).unwrap_or(false) {
            debug!(%vehicle_id, block_id = %block.id, "block just ended for this report, not reassigning");
            return false;
        }
        self.unassign_other_vehicles_from_block(&block, &vehicle_id, time_ms, config);
        info!(%vehicle_id, assignment_id, %method, block_id = %block.id, "vehicle is now predictable");

        let description = format!("Vehicle successfully matched to {} assignment and is now predictable.", assignment_id);
        let mut event = VehicleEvent::new(VehicleEventType::Predictable, &vehicle_id, time_ms, description)
            .with_match(&best)
            .predictable(true, false);
        if let Some(report) = state.avl_report() {
            event = event.with_report(report);
        }
        emit(&*self.sink, CoreEvent::VehicleEvent(event));

        state.set_match(Some(best));
        state.set_block(Some(Arc::clone(&block)), method, Some(assignment_id.to_string()), true);
        self.manager.set_block_holder(block_key(&block), &vehicle_id);
        self.log_conflicting_spatial_assignment(state, config);
        true
    }

    /// Raises an event when the match lies far from the fix of a vehicle
    /// whose trip has already started.
    fn log_conflicting_spatial_assignment(&self, state: &VehicleState, config: &CoreConfig) {
        let (Some(report), Some(m)) = (state.avl_report(), state.current_match()) else {
            return;
        };
        let Some(trip) = m.trip() else {
            return;
        };
        if m.block().clock.epoch_time(trip.start_time_secs, report.time_ms) > report.time_ms {
            return;
        }
        let delta = report.location.distance(&m.predicted_location());
        if state.is_predictable() && delta > config.max_match_distance_from_avl_record {
            let description = format!("Vehicle match conflict from AVL report of {:.1}m", delta);
            self.emit_vehicle_event(state, VehicleEventType::AvlConflict, description, true, false);
        }
    }

    // ========================================================================
    // Exclusive blocks
    // ========================================================================

    /// Incumbent of an exclusive block, or `None` if it may be taken. Other
    /// vehicles' states are only ever try-locked; a busy one counts as a
    /// valid incumbent.
    fn valid_incumbent(&self, block: &Block, vehicle_id: &VehicleId) -> Option<VehicleId> {
        for other in self.manager.vehicles_for_block(&block_key(block)) {
            if other == *vehicle_id {
                continue;
            }
            let Some(shared) = self.manager.get(&other) else {
                continue;
            };
            let valid = match shared.try_lock() {
                Ok(s) => !s.is_for_sched_based_preds() && s.is_predictable(),
                Err(TryLockError::Poisoned(p)) => {
                    let s = p.into_inner();
                    !s.is_for_sched_based_preds() && s.is_predictable()
                }
                Err(TryLockError::WouldBlock) => true,
            };
            if valid {
                return Some(other);
            }
        }
        None
    }

    /// A valid incumbent keeps its block when the newcomer's match is too far
    /// from the route to be believable.
    fn match_problematic_due_to_other_vehicle(
        &self,
        m: &TemporalMatch,
        state: &VehicleState,
        config: &CoreConfig,
    ) -> bool {
        if !config.exclusive_block_assignments || state.is_delayed() {
            return false;
        }
        let Some(incumbent) = self.valid_incumbent(m.block(), state.vehicle_id()) else {
            return false;
        };
        if m.distance_to_segment() <= config.max_distance_for_assignment_grab {
            return false;
        }
        warn!(
            vehicle_id = %state.vehicle_id(),
            %incumbent,
            block_id = %m.block().id,
            distance = m.distance_to_segment(),
            "block held by another vehicle and new match is too far from the route"
        );
        true
    }

    fn unassign_other_vehicles_from_block(&self, block: &Block, vehicle_id: &VehicleId, time_ms: i64, config: &CoreConfig) {
        let key = block_key(block);
        for other in self.manager.vehicles_for_block(&key) {
            if other == *vehicle_id {
                continue;
            }
            let Some(shared) = self.manager.get(&other) else {
                continue;
            };
            let grab = PendingGrab {
                block: key.clone(),
                grabbed_by: vehicle_id.clone(),
                time_ms,
            };
            match shared.try_lock() {
                Ok(mut s) => self.revoke_block(&mut s, &grab, config),
                Err(TryLockError::Poisoned(p)) => self.revoke_block(&mut p.into_inner(), &grab, config),
                Err(TryLockError::WouldBlock) => self.manager.defer_grab(other, grab),
            };
        }
    }

    /// Takes the block away from a vehicle that still holds it.
    fn revoke_block(&self, state: &mut VehicleState, grab: &PendingGrab, config: &CoreConfig) {
        let holds = state.block().map(|b| block_key(b) == grab.block).unwrap_or(false);
        let assigned_before = state.assignment_time_ms().map(|t| t <= grab.time_ms).unwrap_or(true);
        if !holds || !assigned_before {
            return;
        }
        if !config.exclusive_block_assignments && !state.is_for_sched_based_preds() {
            return;
        }
        let description = format!(
            "Assigning vehicle {} to block {} so removing assignment from vehicle {}.",
            grab.grabbed_by,
            grab.block.1,
            state.vehicle_id()
        );
        self.make_vehicle_unpredictable(state, VehicleEventType::AssignmentGrabbed, description);
        state.unset_block(BlockAssignmentMethod::AssignmentGrabbed);
        self.publish_state(state, config);
    }

    fn apply_pending_grab(&self, state: &mut VehicleState) {
        if let Some(grab) = self.manager.take_pending_grab(state.vehicle_id()) {
            let config = self.config.current();
            self.revoke_block(state, &grab, &config);
        }
    }

    // ========================================================================
    // Results
    // ========================================================================

    fn process_predictions(&self, state: &mut VehicleState, config: &CoreConfig) {
        let Some(avl_time_ms) = state.avl_time_ms() else {
            return;
        };
        let predictions = self.predictions.generate(state, avl_time_ms);
        let db_horizon_ms = config.max_prediction_time_for_db_secs * MS_PER_SEC;
        let published: Vec<_> = predictions
            .iter()
            .filter(|p| db_horizon_ms <= 0 || p.predicted_time_ms - p.avl_time_ms < db_horizon_ms)
            .cloned()
            .collect();
        debug!(
            vehicle_id = %state.vehicle_id(),
            generated = predictions.len(),
            published = published.len(),
            "predictions"
        );
        emit(
            &*self.sink,
            CoreEvent::Predictions(PredictionSet {
                vehicle_id: state.vehicle_id().clone(),
                avl_time_ms,
                predictions: published,
            }),
        );
        state.set_predictions(predictions);
    }

    fn handle_possible_end_of_block(&self, state: &mut VehicleState) -> bool {
        let at_end = state
            .current_match()
            .and_then(|m| m.at_stop())
            .map(|a| a.at_end_of_block())
            .unwrap_or(false);
        if !at_end {
            return false;
        }
        state.set_finished_block(state.block().cloned());
        let block_id = state.block().map(|b| b.id.clone()).unwrap_or_default();
        info!(vehicle_id = %state.vehicle_id(), %block_id, "end of block reached");
        let description = format!("Block assignment {} ended for vehicle so it was made unpredictable.", block_id);
        self.make_vehicle_unpredictable_and_terminate_assignment(
            state,
            VehicleEventType::EndOfBlock,
            description,
            BlockAssignmentMethod::EndOfBlock,
        );
        true
    }

    /// A trip named by the report, or the one the vehicle is on, that has
    /// been cancelled stops processing of the report.
    fn is_cancelled(&self, state: &mut VehicleState) -> bool {
        let hinted = state
            .avl_report()
            .and_then(|r| r.assignment.as_ref())
            .filter(|a| a.kind == AssignmentType::Trip)
            .map(|a| a.id.clone());
        let Some(trip_id) = hinted.or_else(|| state.trip().map(|t| t.id.clone())) else {
            return false;
        };
        let cancelled = self.cancellations.is_cancelled(&trip_id);
        if cancelled {
            debug!(vehicle_id = %state.vehicle_id(), %trip_id, "trip cancelled, not processing");
            state.set_canceled(true);
        }
        cancelled
    }

    // ========================================================================
    // State transitions
    // ========================================================================

    fn emit_vehicle_event(
        &self,
        state: &VehicleState,
        kind: VehicleEventType,
        description: String,
        predictable: bool,
        became_unpredictable: bool,
    ) {
        let time_ms = state.avl_time_ms().unwrap_or_default();
        let mut event = VehicleEvent::new(kind, state.vehicle_id(), time_ms, description)
            .predictable(predictable, became_unpredictable);
        if let Some(report) = state.avl_report() {
            event = event.with_report(report);
        }
        if let Some(m) = state.current_match() {
            event = event.with_match(m);
        }
        emit(&*self.sink, CoreEvent::VehicleEvent(event));
    }

    /// Drops the vehicle's match and predictions, keeping its assignment.
    pub fn make_vehicle_unpredictable(&self, state: &mut VehicleState, kind: VehicleEventType, description: String) {
        warn!(vehicle_id = %state.vehicle_id(), %kind, %description, "vehicle made unpredictable");
        let was_predictable = state.is_predictable();
        self.emit_vehicle_event(state, kind, description, false, was_predictable);
        state.set_match(None);
        if !state.predictions().is_empty() {
            state.set_predictions(Vec::new());
            emit(
                &*self.sink,
                CoreEvent::Predictions(PredictionSet {
                    vehicle_id: state.vehicle_id().clone(),
                    avl_time_ms: state.avl_time_ms().unwrap_or_default(),
                    predictions: Vec::new(),
                }),
            );
        }
    }

    /// Makes the vehicle unpredictable and frees its block.
    pub fn make_vehicle_unpredictable_and_terminate_assignment(
        &self,
        state: &mut VehicleState,
        kind: VehicleEventType,
        description: String,
        method: BlockAssignmentMethod,
    ) {
        self.make_vehicle_unpredictable(state, kind, description);
        state.unset_block(method);
        self.manager.release_blocks(state.vehicle_id());
    }

    /// Hands the vehicle's current status to the sink.
    pub fn publish_state(&self, state: &VehicleState, config: &CoreConfig) {
        let Some(report) = state.avl_report() else {
            return;
        };
        let trip = state.trip();
        let changed = VehicleStateChanged {
            vehicle_id: state.vehicle_id().clone(),
            avl_time_ms: report.time_ms,
            location: report.location,
            predictable: state.is_predictable(),
            assignment_id: state.assignment_id().map(str::to_string),
            assignment_method: state.assignment_method().to_string(),
            block_id: state.block().map(|b| b.id.clone()),
            trip_id: trip.map(|t| t.id.clone()),
            route_id: trip.map(|t| t.route_id.clone()),
            heading: state.heading(config.layover_heading_radius),
            schedule_adherence_msecs: state.real_time_sched_adh().map(|a| a.msecs()),
            delayed: state.is_delayed(),
            layover: state.is_layover(),
        };
        emit(&*self.sink, CoreEvent::StateChanged(changed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avl_report::Assignment;
    use crate::config::StaticConfig;
    use crate::events::StopEventKind;
    use crate::geo::Location;
    use crate::indices::tests::straight_trip;
    use crate::reference::InMemorySnapshot;
    use crate::service_time::ServiceClock;
    use avl_env::CollectingSink;
    use std::collections::HashSet;

    const DAY: i64 = 1_704_067_200_000;
    const HOUR: i64 = 3_600_000;
    const T8: i64 = DAY + 8 * HOUR;

    /// One 900 m trip on block b1: s0 at 0 m at 8:00, then a stop every
    /// 300 m a minute apart.
    fn snapshot() -> Arc<InMemorySnapshot> {
        let trip = straight_trip("t1", 8 * 3600, &[1, 3, 3, 3], false);
        let block = Block::new("b1", "svc", vec![Arc::new(trip)], ServiceClock::new(0)).unwrap();
        Arc::new(InMemorySnapshot::new(ServiceClock::new(0), vec![], vec![], vec![block]).unwrap())
    }

    struct Harness {
        processor: AvlProcessor,
        sink: Arc<CollectingSink<CoreEvent>>,
    }

    fn harness_with(config: CoreConfig) -> Harness {
        let sink: Arc<CollectingSink<CoreEvent>> = Arc::new(CollectingSink::new());
        let processor = AvlProcessor::new(
            Arc::new(StaticConfig::new(config)),
            snapshot(),
            Arc::new(VehicleStateManager::new()),
            sink.clone(),
        );
        Harness { processor, sink }
    }

    fn harness() -> Harness {
        harness_with(CoreConfig::default())
    }

    fn fix(vehicle: &str, east: f64, time_ms: i64) -> AvlReport {
        AvlReport::new(vehicle, time_ms, Location::new(37.0, -122.0).offset(east, 0.0))
            .with_heading(90.0)
            .with_assignment(Assignment::block("b1"))
    }

    fn state_of(h: &Harness, vehicle: &str) -> crate::vehicle_manager::SharedVehicleState {
        h.processor.manager().get(&VehicleId::new(vehicle)).expect("vehicle state")
    }

    fn vehicle_events(items: &[CoreEvent]) -> Vec<(VehicleId, VehicleEventType)> {
        items
            .iter()
            .filter_map(|e| match e {
                CoreEvent::VehicleEvent(v) => Some((v.vehicle_id.clone(), v.kind)),
                _ => None,
            })
            .collect()
    }

    fn stop_events(items: &[CoreEvent]) -> Vec<(StopEventKind, i32, i64)> {
        items
            .iter()
            .filter_map(|e| match e {
                CoreEvent::ArrivalDeparture(ad) => Some((ad.kind, ad.stop_path_index, ad.time_ms)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_block_assignment_makes_vehicle_predictable() {
        let h = harness();
        h.processor.process_avl_report(fix("v1", 450.0, T8 + 90_000));

        let shared = state_of(&h, "v1");
        let state = lock_state(&shared);
        assert!(state.is_predictable());
        assert_eq!(state.assignment_method(), BlockAssignmentMethod::AvlFeedBlockAssignment);
        assert_eq!(state.current_match().map(|m| m.stop_path_index()), Some(2));
        drop(state);

        let items = h.sink.items();
        assert_eq!(vehicle_events(&items), vec![(VehicleId::new("v1"), VehicleEventType::Predictable)]);
        assert!(items.iter().any(|e| matches!(e, CoreEvent::Predictions(p) if !p.predictions.is_empty())));
        assert!(matches!(items.last(), Some(CoreEvent::StateChanged(s)) if s.predictable));
    }

    #[test]
    fn test_following_fixes_produce_ordered_stop_events() {
        let h = harness();
        for (east, secs) in [(150.0, 30), (450.0, 90), (750.0, 150)] {
            h.processor.process_avl_report(fix("v1", east, T8 + secs * 1000));
        }
        let events = stop_events(&h.sink.items());
        assert!(!events.is_empty());
        assert!(events.windows(2).all(|w| w[0].2 <= w[1].2), "{:?}", events);
        let departures: HashSet<i32> = events
            .iter()
            .filter(|e| e.0 == StopEventKind::Departure)
            .map(|e| e.1)
            .collect();
        assert!(departures.contains(&1) && departures.contains(&2), "{:?}", events);
    }

    #[test]
    fn test_fixes_at_stops_on_schedule_reproduce_schedule() {
        let h = harness();
        for (east, secs) in [(0.0, 0), (300.0, 60), (600.0, 120), (900.0, 180)] {
            h.processor.process_avl_report(fix("v1", east, T8 + secs * 1000));
        }
        let events = stop_events(&h.sink.items());
        let arrivals: Vec<(i32, i64)> = events
            .iter()
            .filter(|e| e.0 == StopEventKind::Arrival)
            .map(|e| (e.1, e.2))
            .collect();
        assert_eq!(arrivals, vec![(1, T8 + 60_000), (2, T8 + 120_000), (3, T8 + 180_000)]);
        for (stop, arrival) in &arrivals[..2] {
            let departure = events
                .iter()
                .find(|e| e.0 == StopEventKind::Departure && e.1 == *stop)
                .map(|e| e.2);
            assert_eq!(departure, Some(arrival + 1));
        }
        assert!(events.windows(2).all(|w| w[0].2 < w[1].2), "{:?}", events);
    }

    #[test]
    fn test_unknown_block_leaves_vehicle_unassigned() {
        let h = harness();
        let report = AvlReport::new("v1", T8 + 90_000, Location::new(37.0, -122.0).offset(250.0, 0.0))
            .with_assignment(Assignment::block("nope"));
        h.processor.process_avl_report(report);
        let shared = state_of(&h, "v1");
        let state = lock_state(&shared);
        assert!(!state.is_predictable());
        assert!(state.block().is_none());
    }

    #[test]
    fn test_bad_matches_make_vehicle_unpredictable() {
        let h = harness();
        h.processor.process_avl_report(fix("v1", 250.0, T8 + 90_000));
        // Far north of the route
        for k in 1..=3 {
            let off = AvlReport::new("v1", T8 + 90_000 + k * 10_000, Location::new(37.0, -122.0).offset(300.0, 5_000.0))
                .with_heading(90.0)
                .with_assignment(Assignment::block("b1"));
            h.processor.process_avl_report(off);
        }
        let shared = state_of(&h, "v1");
        let state = lock_state(&shared);
        assert!(!state.is_predictable());
        drop(state);
        assert!(vehicle_events(&h.sink.items()).contains(&(VehicleId::new("v1"), VehicleEventType::NoMatch)));
    }

    #[test]
    fn test_no_progress_makes_vehicle_unpredictable() {
        let config = CoreConfig {
            allowable_late_secs: 24 * 3600,
            ..CoreConfig::default()
        };
        let h = harness_with(config);
        // Parked mid-path for ten minutes
        for k in 0..=10 {
            h.processor.process_avl_report(fix("v1", 250.0, T8 + 90_000 + k * 60_000));
        }
        let kinds: Vec<VehicleEventType> = vehicle_events(&h.sink.items()).into_iter().map(|(_, k)| k).collect();
        assert!(kinds.contains(&VehicleEventType::Delayed));
        assert!(kinds.contains(&VehicleEventType::NoProgress));
    }

    #[test]
    fn test_second_vehicle_grabs_block() {
        let h = harness();
        h.processor.process_avl_report(fix("v1", 250.0, T8 + 90_000));
        h.processor.process_avl_report(fix("v2", 260.0, T8 + 91_000));

        let v1 = state_of(&h, "v1");
        assert!(!lock_state(&v1).is_predictable());
        assert_eq!(lock_state(&v1).assignment_method(), BlockAssignmentMethod::AssignmentGrabbed);
        assert!(lock_state(&state_of(&h, "v2")).is_predictable());
        assert_eq!(
            h.processor.manager().vehicles_for_block(&("svc".to_string(), "b1".to_string())),
            vec![VehicleId::new("v2")]
        );
        assert!(vehicle_events(&h.sink.items()).contains(&(VehicleId::new("v1"), VehicleEventType::AssignmentGrabbed)));
    }

    #[test]
    fn test_grab_of_busy_vehicle_is_deferred() {
        let h = harness();
        h.processor.process_avl_report(fix("v1", 250.0, T8 + 90_000));
        let v1 = state_of(&h, "v1");
        {
            let _busy = lock_state(&v1);
            h.processor.process_avl_report(fix("v2", 260.0, T8 + 91_000));
            assert_eq!(h.processor.manager().pending_grab_ids(), vec![VehicleId::new("v1")]);
        }
        h.processor.sweep_pending_grabs();
        assert!(!lock_state(&v1).is_predictable());
        assert!(h.processor.manager().pending_grab_ids().is_empty());
    }

    #[test]
    fn test_end_of_block_unassigns() {
        let h = harness();
        for (east, secs) in [(450.0, 90), (750.0, 150), (900.0, 180)] {
            h.processor.process_avl_report(fix("v1", east, T8 + secs * 1000));
        }
        let shared = state_of(&h, "v1");
        let state = lock_state(&shared);
        assert!(!state.is_predictable());
        assert!(state.block().is_none());
        drop(state);
        assert!(vehicle_events(&h.sink.items()).contains(&(VehicleId::new("v1"), VehicleEventType::EndOfBlock)));
        assert!(h
            .processor
            .manager()
            .vehicles_for_block(&("svc".to_string(), "b1".to_string()))
            .is_empty());
    }

    #[test]
    fn test_finished_block_is_not_reassigned_by_same_report() {
        let h = harness();
        for (east, secs) in [(0.0, 0), (300.0, 60), (600.0, 120), (900.0, 180)] {
            h.processor.process_avl_report(fix("v1", east, T8 + secs * 1000));
        }
        let kinds: Vec<VehicleEventType> = vehicle_events(&h.sink.items()).into_iter().map(|(_, k)| k).collect();
        assert_eq!(kinds.iter().filter(|k| **k == VehicleEventType::Predictable).count(), 1);
        assert!(!kinds.contains(&VehicleEventType::AvlConflict));
        assert_eq!(kinds.last(), Some(&VehicleEventType::EndOfBlock));

        let shared = state_of(&h, "v1");
        let state = lock_state(&shared);
        assert!(!state.is_predictable());
        assert_eq!(state.assignment_method(), BlockAssignmentMethod::EndOfBlock);
    }

    #[test]
    fn test_consist_member_is_ignored() {
        let h = harness();
        let mut report = fix("v1", 250.0, T8 + 90_000);
        report.lead_vehicle_id = Some(VehicleId::new("lead"));
        h.processor.process_avl_report(report);
        assert!(!lock_state(&state_of(&h, "v1")).is_predictable());
        assert!(h.sink.is_empty());
    }

    struct CancelAll;

    impl TripCancellations for CancelAll {
        fn is_cancelled(&self, _trip_id: &str) -> bool {
            true
        }
    }

    #[test]
    fn test_cancelled_trip_is_not_processed() {
        let sink: Arc<CollectingSink<CoreEvent>> = Arc::new(CollectingSink::new());
        let processor = AvlProcessor::new(
            Arc::new(StaticConfig::default()),
            snapshot(),
            Arc::new(VehicleStateManager::new()),
            sink.clone(),
        )
        .with_cancellations(Arc::new(CancelAll));
        let report = AvlReport::new("v1", T8 + 90_000, Location::new(37.0, -122.0).offset(250.0, 0.0))
            .with_assignment(Assignment::trip("t1"));
        processor.process_avl_report(report);
        let shared = processor.manager().get(&VehicleId::new("v1")).expect("state");
        assert!(lock_state(&shared).is_canceled());
        assert!(sink.is_empty());
    }
}
