//! Arrival and departure inference.
//!
//! Fixes rarely land exactly on a stop, so stop events are interpolated
//! between the previous and the current match with the travel time model.
//! Every stop crossed between two matches gets an arrival and a departure,
//! spread over the elapsed time with a single speed-up/slow-down ratio.
//!
//! Ordering guarantees, per vehicle, in the order events are handed out:
//! - an arrival is never stored after its departure and a departure is
//!   always at least 1ms after the arrival at the same stop
//! - stored timestamps never go backwards
//!
//! An arrival computed to lie after the fix that produced it is held in the
//! vehicle state and flushed (possibly rescaled) with the next departure.

use crate::avl_report::VehicleId;
use crate::config::{ArrivalDepartureGeneratorKind, ConfigProvider, CoreConfig};
use crate::events::{emit, ArrivalDeparture, CoreEvent, EventSink, StopEventKind, VehicleEvent, VehicleEventType};
use crate::indices::Indices;
use crate::reference::Block;
use crate::service_time::MS_PER_SEC;
use crate::spatial_match::SpatialMatch;
use crate::travel_times::TravelTimes;
use crate::vehicle_state::VehicleState;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Expected travel below this (msec) is too small to derive a speed ratio from.
const MIN_EXPECTED_MSECS_FOR_RATIO: f64 = 5.0;

/// Floor for the speed ratio so 1ms nudges stay finite.
const MIN_SPEED_RATIO: f64 = 1e-6;

// ============================================================================
// TRAIT
// ============================================================================

pub trait ArrivalDepartureGenerator: Send + Sync {
    /// Infers events between the previous and current match held by `state`
    /// and hands them to `sink`. Returns the stored events in order.
    fn generate(&self, state: &mut VehicleState, sink: &EventSink) -> Vec<ArrivalDeparture>;
}

/// Builds the generator selected in config.
pub fn arrival_departure_generator(config: Arc<dyn ConfigProvider>) -> Arc<dyn ArrivalDepartureGenerator> {
    match config.current().arrival_departure_generator {
        ArrivalDepartureGeneratorKind::Default => Arc::new(DefaultArrivalDepartureGenerator::new(config)),
        ArrivalDepartureGeneratorKind::Disabled => Arc::new(DisabledArrivalDepartureGenerator),
    }
}

/// Never produces events.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledArrivalDepartureGenerator;

impl ArrivalDepartureGenerator for DisabledArrivalDepartureGenerator {
    fn generate(&self, _state: &mut VehicleState, _sink: &EventSink) -> Vec<ArrivalDeparture> {
        Vec::new()
    }
}

// ============================================================================
// DEFAULT GENERATOR
// ============================================================================

pub struct DefaultArrivalDepartureGenerator {
    config: Arc<dyn ConfigProvider>,
    travel_times: TravelTimes,
}

impl DefaultArrivalDepartureGenerator {
    pub fn new(config: Arc<dyn ConfigProvider>) -> Self {
        let travel_times = TravelTimes::new(Arc::clone(&config));
        Self { config, travel_times }
    }
}

impl ArrivalDepartureGenerator for DefaultArrivalDepartureGenerator {
    fn generate(&self, state: &mut VehicleState, sink: &EventSink) -> Vec<ArrivalDeparture> {
        if !state.is_predictable() {
            debug!(vehicle_id = %state.vehicle_id(), "not predictable, no arrivals/departures");
            return Vec::new();
        }
        let (Some(new), Some(avl_time_ms)) = (state.current_match().map(|m| m.spatial().clone()), state.avl_time_ms())
        else {
            return Vec::new();
        };

        let config = self.config.current();
        let mut pass = Pass {
            vehicle_id: state.vehicle_id().clone(),
            config: &config,
            travel_times: &self.travel_times,
            sink,
            avl_time_ms,
            new,
            stored: Vec::new(),
        };

        let old = state
            .previous_match()
            .map(|m| m.spatial().clone())
            .filter(|old| old.block().same_block(pass.new.block()));
        match old {
            Some(old) => pass.between_matches(state, old),
            None => pass.without_previous_match(state),
        }
        pass.stored
    }
}

/// One invocation's worth of context.
struct Pass<'a> {
    vehicle_id: VehicleId,
    config: &'a CoreConfig,
    travel_times: &'a TravelTimes,
    sink: &'a EventSink,
    avl_time_ms: i64,
    new: SpatialMatch,
    stored: Vec<ArrivalDeparture>,
}

impl Pass<'_> {
    fn travel(&self, epoch_ms: i64, from: &SpatialMatch, to: &SpatialMatch) -> i64 {
        self.travel_times.between_matches(self.vehicle_id.as_str(), epoch_ms, from, to)
    }

    fn event(&self, kind: StopEventKind, time_ms: i64, block: &Block, trip_index: i32, stop_path_index: i32) -> Option<ArrivalDeparture> {
        let event = ArrivalDeparture::new(kind, &self.vehicle_id, time_ms, self.avl_time_ms, block, trip_index, stop_path_index);
        if event.is_none() {
            warn!(vehicle_id = %self.vehicle_id, trip_index, stop_path_index, "stop event outside block");
        }
        event
    }

    /// Arrival that also advances the last-arrival bookkeeping.
    fn create_arrival(&self, state: &mut VehicleState, time_ms: i64, indices: &Indices) -> Option<ArrivalDeparture> {
        let arrival = self.event(
            StopEventKind::Arrival,
            time_ms,
            indices.block(),
            indices.trip_index(),
            indices.stop_path_index(),
        )?;
        if time_ms > state.last_arrival_time_ms() {
            state.set_last_arrival(time_ms, indices.stop_path_index());
        }
        Some(arrival)
    }

    fn create_departure(&self, state: &mut VehicleState, time_ms: i64, indices: &Indices, dwell_ms: Option<i64>) -> Option<ArrivalDeparture> {
        let mut departure = self.event(
            StopEventKind::Departure,
            time_ms,
            indices.block(),
            indices.trip_index(),
            indices.stop_path_index(),
        )?;
        departure.dwell_time_ms = dwell_ms;
        if time_ms > state.last_departure_time_ms() {
            state.set_last_departure_time_ms(time_ms);
        }
        Some(departure)
    }

    // ========================================================================
    // Storing
    // ========================================================================

    /// Validates, orders and emits one event.
    fn store(&mut self, state: &mut VehicleState, event: Option<ArrivalDeparture>) {
        let Some(mut event) = event else {
            return;
        };

        let allowable_ms = self.config.allowable_difference_between_avl_time_secs * MS_PER_SEC;
        if (event.time_ms - self.avl_time_ms).abs() >= allowable_ms {
            warn!(
                vehicle_id = %self.vehicle_id,
                time_ms = event.time_ms,
                avl_time_ms = self.avl_time_ms,
                stop_id = %event.stop_id,
                "stop event too far from AVL time, dropped"
            );
            return;
        }
        if let Some(dwell) = event.dwell_time_ms {
            if dwell < 0 || dwell > self.config.max_dwell_time_secs * MS_PER_SEC {
                warn!(vehicle_id = %self.vehicle_id, dwell, stop_id = %event.stop_id, "implausible dwell, departure dropped");
                return;
            }
        }

        // The last stop of a loop is the first stop of the next pass
        let block = self.new.block();
        if block.no_schedule() && event.stop_path_index == block.num_stop_paths(event.trip_index) - 1 {
            debug!(vehicle_id = %self.vehicle_id, stop_id = %event.stop_id, "skipping loop end stop");
            return;
        }

        if event.time_ms <= state.last_event_time_ms() {
            let nudged_ms = state.last_event_time_ms() + 1;
            let arrival_ms = self
                .stored
                .iter()
                .rev()
                .find(|a| !a.is_departure() && a.trip_index == event.trip_index && a.stop_path_index == event.stop_path_index)
                .map(|a| a.time_ms);
            // Dwell follows the departure it belongs to
            event.dwell_time_ms = event.dwell_time_ms.map(|dwell| match arrival_ms {
                Some(arrival_ms) => nudged_ms - arrival_ms,
                None => dwell + (nudged_ms - event.time_ms),
            });
            event.time_ms = nudged_ms;
        }
        state.set_last_event_time_ms(event.time_ms);

        state.increment_trip_counter_for(&event);
        if block.no_schedule() {
            let counter = state.trip_counter();
            if event.is_departure() && event.stop_path_index == 0 {
                state.put_trip_start_time(counter, event.time_ms);
            }
            event.freq_start_time_ms = state.trip_start_time(counter);
        }

        info!(
            vehicle_id = %self.vehicle_id,
            kind = ?event.kind,
            stop_id = %event.stop_id,
            trip_id = %event.trip_id,
            time_ms = event.time_ms,
            "stop event"
        );
        emit(self.sink, CoreEvent::ArrivalDeparture(event.clone()));
        self.stored.push(event);
    }

    // ========================================================================
    // First match of an assignment
    // ========================================================================

    /// Back-fills the first stops of the block when the vehicle was first
    /// matched just past them.
    fn without_previous_match(&mut self, state: &mut VehicleState) {
        if state.newly_assigned_to_same_block() {
            info!(vehicle_id = %self.vehicle_id, "reassigned to same block, not back-filling stops");
            return;
        }
        let sp = self.new.stop_path_index();
        if self.new.trip_index() != 0 || sp <= 0 || sp > self.config.max_stops_when_no_previous_match {
            debug!(vehicle_id = %self.vehicle_id, sp, "too far along to back-fill stops");
            return;
        }

        let Ok(start) = Indices::start_of_trip(Arc::clone(self.new.block()), 0) else {
            return;
        };
        let beginning = SpatialMatch::new(self.avl_time_ms, start.clone(), f64::NAN, 0.0);
        let mut departure_ms = self.avl_time_ms - self.travel(self.avl_time_ms, &beginning, &self.new);
        let new_stop = self.new.at_stop().filter(|a| a.trip_index() == 0).map(|a| a.stop_path_index());
        let at_stop = |idx: i32| new_stop == Some(idx);

        if !at_stop(0) {
            let departure = self.create_departure(state, departure_ms, &start, None);
            self.store(state, departure);
        }
        for idx in 1..sp {
            let indices = start.at_end_of(idx);
            let arrival_ms = departure_ms + indices.travel_time_for_path();
            let arrival = self.create_arrival(state, arrival_ms, &indices);
            self.store(state, arrival);
            if !at_stop(idx) {
                departure_ms = arrival_ms + indices.stop_time_for_path().max(1);
                let departure = self.create_departure(state, departure_ms, &indices, Some(departure_ms - arrival_ms));
                self.store(state, departure);
            }
        }
        if at_stop(sp) {
            let indices = start.at_end_of(sp);
            let arrival = self.create_arrival(state, self.avl_time_ms, &indices);
            self.store(state, arrival);
        }
    }

    // ========================================================================
    // Between two matches
    // ========================================================================

    fn between_matches(&mut self, state: &mut VehicleState, old: SpatialMatch) {
        let Some(previous_avl_ms) = state.previous_avl_report_from_successful_match().map(|r| r.time_ms) else {
            return;
        };

        let layover_distance = self.config.layover_distance;
        let problematic = |m: &SpatialMatch| m.is_layover() && m.distance_to_segment() > layover_distance;
        if problematic(&old) || problematic(&self.new) {
            warn!(
                vehicle_id = %self.vehicle_id,
                ?old,
                new = ?self.new,
                layover_distance,
                "layover match too far from path, no arrivals/departures"
            );
            return;
        }

        if self.too_many_stops_traversed(state, &old, previous_avl_ms) {
            return;
        }
        if !self.should_process(&old) {
            return;
        }
        debug!(vehicle_id = %self.vehicle_id, ?old, new = ?self.new, "traversed a stop");

        let begin_ms = self.departing(state, &old, previous_avl_ms);
        let (end_ms, arrival) = self.arriving(state, &old, begin_ms, previous_avl_ms);
        self.intermediate_stops(state, &old, begin_ms, end_ms, previous_avl_ms);
        self.store(state, arrival);
    }

    /// Jumping many stops in a few seconds means a bad match somewhere.
    fn too_many_stops_traversed(&self, state: &VehicleState, old: &SpatialMatch, previous_avl_ms: i64) -> bool {
        let elapsed_ms = self.avl_time_ms - previous_avl_ms;
        let target = self.new.indices();
        let mut indices = old.indices().clone();
        let mut traversed = 0;
        while !indices.past_end_of_block(self.avl_time_ms) && indices.is_earlier_stop_path_than(target) {
            indices = indices.increment_stop_path(self.avl_time_ms);
            traversed += 1;
        }

        let elapsed_secs = elapsed_ms as f64 / MS_PER_SEC as f64;
        let limit = elapsed_secs / self.config.seconds_per_stop_for_too_many_stops;
        if traversed < self.config.min_stops_for_too_many_stops || traversed as f64 <= limit {
            return false;
        }

        warn!(vehicle_id = %self.vehicle_id, traversed, elapsed_secs, ?old, new = ?self.new, "too many stops for elapsed time");
        let mut event = VehicleEvent::new(
            VehicleEventType::TooManyStops,
            &self.vehicle_id,
            self.avl_time_ms,
            format!("Traversed {} stops in {:.0} seconds", traversed, elapsed_secs),
        )
        .with_match(&self.new)
        .predictable(state.is_predictable(), false);
        if let Some(report) = state.avl_report() {
            event = event.with_report(report);
        }
        emit(self.sink, CoreEvent::VehicleEvent(event));
        true
    }

    /// A stop was reached or left between the matches.
    fn should_process(&self, old: &SpatialMatch) -> bool {
        let traversed = SpatialMatch::number_stops_between_matches(old, &self.new);
        if traversed > self.config.max_stops_between_matches {
            warn!(
                vehicle_id = %self.vehicle_id,
                traversed,
                max = self.config.max_stops_between_matches,
                "too many stops between matches, no arrivals/departures"
            );
            return false;
        }
        match (old.at_stop(), self.new.at_stop()) {
            (Some(a), Some(b)) => a.trip_index() != b.trip_index() || a.stop_path_index() != b.stop_path_index(),
            (None, None) => {
                old.trip_index() != self.new.trip_index() || old.stop_path_index() != self.new.stop_path_index()
            }
            _ => true,
        }
    }

    /// Departure from the stop the old match was at. Returns the time the
    /// vehicle is known to have been moving from.
    fn departing(&mut self, state: &mut VehicleState, old: &SpatialMatch, previous_avl_ms: i64) -> i64 {
        let Some(old_stop) = old.at_stop().cloned() else {
            return previous_avl_ms;
        };
        if self.new.at_stop() == Some(&old_stop) {
            return previous_avl_ms;
        }
        let Some(just_after) = old.match_adjusted_to_beginning_of_path() else {
            return previous_avl_ms;
        };

        let based_on_new = self.avl_time_ms - self.travel(self.avl_time_ms, &just_after, &self.new);
        let based_on_old = if just_after.less_than_or_equal_to(old) {
            previous_avl_ms - self.travel(previous_avl_ms, &just_after, old)
        } else {
            match old.match_adjusted_to_end_of_path() {
                Some(just_before) => previous_avl_ms + self.travel(previous_avl_ms, old, &just_before),
                None => previous_avl_ms,
            }
        };
        let mut departure_ms = based_on_new.max(based_on_old);
        if departure_ms >= self.avl_time_ms {
            departure_ms = self.avl_time_ms - 1;
        }
        debug!(vehicle_id = %self.vehicle_id, based_on_new, based_on_old, departure_ms, "departure estimate");

        let departure_ms = self.departure_after_arrival(state, departure_ms, based_on_new, previous_avl_ms, old_stop.indices());
        self.log_terminal_departure(state, departure_ms, old_stop.indices());
        departure_ms
    }

    /// Flushes a held arrival (rescaling it if it would land after the
    /// departure), then stores the departure strictly after the last arrival.
    fn departure_after_arrival(
        &mut self,
        state: &mut VehicleState,
        mut departure_ms: i64,
        based_on_new: i64,
        previous_avl_ms: i64,
        stop: &Indices,
    ) -> i64 {
        let (arrival_ms, arrival_sp) = match state.take_arrival_to_store() {
            Some(mut arrival) => {
                if arrival.time_ms >= departure_ms {
                    let old_to_arrival = (arrival.time_ms - previous_avl_ms) as f64;
                    let departure_to_avl = (self.avl_time_ms - based_on_new) as f64;
                    let between = (self.avl_time_ms - previous_avl_ms) as f64;
                    let denominator = old_to_arrival + departure_to_avl;
                    let ratio = if denominator > 0.0 { between / denominator } else { 1.0 };
                    let rescaled = previous_avl_ms + (ratio * old_to_arrival).round() as i64;
                    debug!(
                        vehicle_id = %self.vehicle_id,
                        held = arrival.time_ms,
                        rescaled,
                        "held arrival after departure, rescaling"
                    );
                    arrival = arrival.with_time(rescaled);
                    departure_ms = rescaled + 1;
                    state.set_last_arrival(rescaled, arrival.stop_path_index);
                }
                let placed = (arrival.time_ms, arrival.stop_path_index);
                self.store(state, Some(arrival));
                placed
            }
            None => {
                let last = state.last_arrival_time_ms();
                if departure_ms <= last {
                    departure_ms = last + 1;
                }
                (last, state.last_arrival_stop_path_index())
            }
        };

        let dwell_ms = (arrival_sp == stop.stop_path_index() && arrival_ms > 0).then(|| departure_ms - arrival_ms);
        let departure = self.create_departure(state, departure_ms, stop, dwell_ms);
        self.store(state, departure);
        departure_ms
    }

    /// Flags leaving the first stop of a trip well off schedule.
    fn log_terminal_departure(&self, state: &VehicleState, departure_ms: i64, stop: &Indices) {
        if stop.stop_path_index() != 0 {
            return;
        }
        let Some(scheduled_secs) = stop.schedule_time().and_then(|s| s.departure_secs) else {
            return;
        };
        let scheduled_ms = stop.block().clock.epoch_time(scheduled_secs, departure_ms);
        let early_ms = scheduled_ms - departure_ms;
        let kind = if early_ms > self.config.allowable_early_departure_time_for_logging_event * MS_PER_SEC {
            VehicleEventType::LeftTerminalEarly
        } else if -early_ms > self.config.allowable_late_departure_time_for_logging_event * MS_PER_SEC {
            VehicleEventType::LeftTerminalLate
        } else {
            return;
        };
        let stop_id = stop.stop_path().map(|p| p.stop_id.as_str()).unwrap_or("");
        info!(vehicle_id = %self.vehicle_id, %kind, stop_id, early_ms, "terminal departure off schedule");
        let mut event = VehicleEvent::new(
            kind,
            &self.vehicle_id,
            self.avl_time_ms,
            format!("Departed terminal {} {}s from schedule", stop_id, early_ms / MS_PER_SEC),
        )
        .with_match(&self.new)
        .predictable(true, false);
        if let Some(report) = state.avl_report() {
            event = event.with_report(report);
        }
        emit(self.sink, CoreEvent::VehicleEvent(event));
    }

    /// Arrival at the stop the new match is at. Returns the time the vehicle
    /// is known to have been moving until, plus the arrival to store after
    /// the intermediate stops (held ones are not returned).
    fn arriving(
        &mut self,
        state: &mut VehicleState,
        old: &SpatialMatch,
        begin_ms: i64,
        previous_avl_ms: i64,
    ) -> (i64, Option<ArrivalDeparture>) {
        let Some(new_stop) = self.new.at_stop().cloned() else {
            return (self.avl_time_ms, None);
        };
        if old.at_stop() == Some(&new_stop) {
            return (self.avl_time_ms, None);
        }
        let Some(just_before) = self.new.match_adjusted_to_end_of_path() else {
            return (self.avl_time_ms, None);
        };

        let based_on_old = begin_ms + self.travel(self.avl_time_ms, old, &just_before);
        let new = self.new.clone();
        let based_on_new = if new.less_than_or_equal_to(&just_before) {
            self.avl_time_ms + self.travel(self.avl_time_ms, &new, &just_before)
        } else {
            match new.match_adjusted_to_beginning_of_path() {
                Some(just_after) => self.avl_time_ms - self.travel(self.avl_time_ms, &just_after, &new),
                None => self.avl_time_ms,
            }
        };
        let mut arrival_ms = based_on_old.min(based_on_new);
        if arrival_ms <= previous_avl_ms {
            arrival_ms = previous_avl_ms + 1;
        }
        if arrival_ms <= state.last_departure_time_ms() {
            arrival_ms = state.last_departure_time_ms() + 1;
        }
        debug!(vehicle_id = %self.vehicle_id, based_on_old, based_on_new, arrival_ms, "arrival estimate");

        let stop = new_stop.indices();
        let arrival = self.create_arrival(state, arrival_ms, stop);
        let last_stop_of_trip = stop.at_end_of_trip();
        if arrival_ms > self.avl_time_ms && !last_stop_of_trip {
            debug!(vehicle_id = %self.vehicle_id, arrival_ms, "arrival after AVL time, holding it");
            state.set_arrival_to_store(arrival);
            return (arrival_ms, None);
        }
        state.set_arrival_to_store(None);
        (arrival_ms, arrival)
    }

    /// Stops strictly between the two matches, spread over `begin..end`.
    fn intermediate_stops(&mut self, state: &mut VehicleState, old: &SpatialMatch, begin_ms: i64, end_ms: i64, previous_avl_ms: i64) {
        let begin_ms = begin_ms + 1;
        let end_ms = end_ms - 1;

        let mut indices = match old.at_stop() {
            Some(a) => a.indices().increment_stop_path(self.avl_time_ms),
            None => old.indices().clone(),
        };
        let end_indices = match self.new.at_stop() {
            Some(a) => a.indices().clone(),
            None => self.new.indices().clone(),
        };
        if !indices.is_earlier_stop_path_than(&end_indices) || indices.past_end_of_block(self.avl_time_ms) {
            return;
        }

        // Zero travel/stop pieces are later nudged to 1ms each; take them
        // out of the elapsed time first
        let mut zero_pieces = 0i64;
        let mut cursor = indices.clone();
        while cursor.is_earlier_stop_path_than(&end_indices) && !cursor.past_end_of_block(self.avl_time_ms) {
            if cursor.travel_time_for_path() == 0 {
                zero_pieces += 1;
            }
            if cursor.stop_time_for_path() == 0 {
                zero_pieces += 1;
            }
            cursor = cursor.increment_stop_path(self.avl_time_ms);
        }

        let new = self.new.clone();
        let expected = self.travel(previous_avl_ms, old, &new) as f64;
        let elapsed = (end_ms - begin_ms - zero_pieces) as f64;
        let ratio = if expected > MIN_EXPECTED_MSECS_FOR_RATIO {
            (elapsed / expected).max(MIN_SPEED_RATIO)
        } else {
            1.0
        };
        debug!(vehicle_id = %self.vehicle_id, ratio, expected, elapsed, "intermediate stop speed ratio");

        let scaled = |unscaled: f64| begin_ms + (unscaled * ratio).round() as i64;
        let at_next = old.match_at_just_before_next_stop();
        let mut unscaled = self.travel(self.avl_time_ms, old, &at_next) as f64;
        let mut guard = 0;
        while indices.is_earlier_stop_path_than(&end_indices)
            && !indices.past_end_of_block(self.avl_time_ms)
            && guard <= self.config.max_stops_between_matches
        {
            guard += 1;
            let stop = indices.at_end_of(indices.stop_path_index());
            let arrival_ms = scaled(unscaled).min(end_ms);
            let arrival = self.create_arrival(state, arrival_ms, &stop);
            self.store(state, arrival);

            let mut stop_time = indices.stop_time_for_path() as f64;
            if stop_time * ratio < 1.0 {
                stop_time = 1.0 / ratio;
            }
            unscaled += stop_time;
            let departure_ms = scaled(unscaled).max(arrival_ms + 1);
            let departure = self.create_departure(state, departure_ms, &stop, Some(departure_ms - arrival_ms));
            self.store(state, departure);

            indices = indices.increment_stop_path(self.avl_time_ms);
            let mut path_time = indices.travel_time_for_path() as f64;
            if path_time * ratio < 1.0 {
                path_time = 1.0 / ratio;
            }
            unscaled += path_time;
        }
    }
}
