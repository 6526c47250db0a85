//! Outbound records.
//!
//! Plain data handed to the injected [`Sink`]; nothing here is kept by the
//! core after it is delivered.

use crate::avl_report::{AvlReport, VehicleId};
use crate::geo::Location;
use crate::reference::Block;
use crate::spatial_match::SpatialMatch;
use crate::temporal::TemporalDifference;
use avl_env::Sink;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;
use uuid::Uuid;

// ============================================================================
// ARRIVALS / DEPARTURES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopEventKind {
    Arrival,
    Departure,
}

/// Inferred arrival at, or departure from, a stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrivalDeparture {
    pub id: Uuid,
    pub kind: StopEventKind,
    pub vehicle_id: VehicleId,
    pub time_ms: i64,
    /// Fix that caused the event to be generated
    pub avl_time_ms: i64,
    pub block_id: String,
    pub service_id: String,
    pub route_id: String,
    pub direction_id: Option<String>,
    pub trip_id: String,
    pub trip_index: i32,
    pub stop_id: String,
    pub stop_path_index: i32,
    pub stop_path_length: f64,
    pub scheduled_time_ms: Option<i64>,
    /// Departures only: time since the matching arrival
    pub dwell_time_ms: Option<i64>,
    /// Start of the pass around a no-schedule loop
    pub freq_start_time_ms: Option<i64>,
}

impl ArrivalDeparture {
    /// Event at the stop ending the given stop path, `None` if the indices
    /// are outside the block.
    pub fn new(
        kind: StopEventKind,
        vehicle_id: &VehicleId,
        time_ms: i64,
        avl_time_ms: i64,
        block: &Block,
        trip_index: i32,
        stop_path_index: i32,
    ) -> Option<Self> {
        let trip = block.trip(trip_index)?;
        let path = trip.stop_path(stop_path_index)?;
        let scheduled_time_ms = trip.schedule_time(stop_path_index).and_then(|s| {
            let secs = match kind {
                StopEventKind::Arrival => s.arrival_secs.or(s.departure_secs),
                StopEventKind::Departure => s.departure_secs.or(s.arrival_secs),
            }?;
            Some(block.clock.epoch_time(secs, time_ms))
        });
        Some(Self {
            id: Uuid::new_v4(),
            kind,
            vehicle_id: vehicle_id.clone(),
            time_ms,
            avl_time_ms,
            block_id: block.id.clone(),
            service_id: block.service_id.clone(),
            route_id: trip.route_id.clone(),
            direction_id: trip.direction_id.clone(),
            trip_id: trip.id.clone(),
            trip_index,
            stop_id: path.stop_id.clone(),
            stop_path_index,
            stop_path_length: path.length,
            scheduled_time_ms,
            dwell_time_ms: None,
            freq_start_time_ms: None,
        })
    }

    /// Event for the stop at the end of the path `m` is on.
    pub fn at_stop_of(kind: StopEventKind, vehicle_id: &VehicleId, time_ms: i64, avl_time_ms: i64, m: &SpatialMatch) -> Option<Self> {
        Self::new(kind, vehicle_id, time_ms, avl_time_ms, m.block(), m.trip_index(), m.stop_path_index())
    }

    /// Same event moved to a new time.
    #[must_use]
    pub fn with_time(mut self, time_ms: i64) -> Self {
        self.time_ms = time_ms;
        self
    }

    /// Positive is early, as for temporal differences.
    pub fn schedule_adherence(&self) -> Option<TemporalDifference> {
        self.scheduled_time_ms.map(|s| TemporalDifference::new(s - self.time_ms))
    }

    pub fn is_arrival(&self) -> bool {
        self.kind == StopEventKind::Arrival
    }

    pub fn is_departure(&self) -> bool {
        self.kind == StopEventKind::Departure
    }
}

// ============================================================================
// MATCH LOG
// ============================================================================

/// One accepted match, for offline analysis of matching quality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub vehicle_id: VehicleId,
    pub avl_time_ms: i64,
    pub block_id: String,
    pub trip_id: String,
    pub stop_path_index: i32,
    pub segment_index: i32,
    pub distance_along_segment: f64,
    pub distance_to_segment: f64,
    pub at_stop_id: Option<String>,
}

impl MatchRecord {
    pub fn new(vehicle_id: &VehicleId, m: &SpatialMatch) -> Self {
        Self {
            vehicle_id: vehicle_id.clone(),
            avl_time_ms: m.avl_time_ms(),
            block_id: m.block().id.clone(),
            trip_id: m.trip().map(|t| t.id.clone()).unwrap_or_default(),
            stop_path_index: m.stop_path_index(),
            segment_index: m.segment_index(),
            distance_along_segment: m.distance_along_segment(),
            distance_to_segment: m.distance_to_segment(),
            at_stop_id: m.at_stop().map(|a| a.stop_id().to_string()),
        }
    }
}

// ============================================================================
// PREDICTIONS
// ============================================================================

/// Predicted arrival or departure at one upcoming stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub vehicle_id: VehicleId,
    pub route_id: String,
    pub direction_id: Option<String>,
    pub stop_id: String,
    pub trip_id: String,
    pub trip_index: i32,
    pub stop_path_index: i32,
    /// Epoch ms
    pub predicted_time_ms: i64,
    pub avl_time_ms: i64,
    pub is_arrival: bool,
    /// Generated from the schedule for a vehicle that is not reporting
    pub sched_based: bool,
    /// Later trip that another vehicle may end up serving
    pub uncertain: bool,
    pub delayed: bool,
    /// Epoch ms the trip started (loop blocks run the same trip repeatedly)
    pub trip_start_time_ms: Option<i64>,
    pub trip_counter: u32,
}

/// Key predictions are published under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PredictionKey {
    pub route_id: String,
    pub stop_id: String,
    pub direction_id: Option<String>,
}

/// Predictions for one vehicle generated from one fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionSet {
    pub vehicle_id: VehicleId,
    pub avl_time_ms: i64,
    pub predictions: Vec<Prediction>,
}

impl PredictionSet {
    /// Predictions grouped by (route, stop, direction).
    pub fn by_stop(&self) -> std::collections::BTreeMap<PredictionKey, Vec<&Prediction>> {
        let mut map: std::collections::BTreeMap<PredictionKey, Vec<&Prediction>> = Default::default();
        for p in &self.predictions {
            map.entry(PredictionKey {
                route_id: p.route_id.clone(),
                stop_id: p.stop_id.clone(),
                direction_id: p.direction_id.clone(),
            })
            .or_default()
            .push(p);
        }
        map
    }
}

// ============================================================================
// VEHICLE EVENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VehicleEventType {
    Predictable,
    NoMatch,
    NoProgress,
    Delayed,
    Timeout,
    EndOfBlock,
    AssignmentGrabbed,
    AssignmentChanged,
    NotLeavingTerminal,
    LeftTerminalEarly,
    LeftTerminalLate,
    AvlConflict,
    UnmatchedAssignment,
    TooManyStops,
}

impl fmt::Display for VehicleEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Predictable => "Predictable",
            Self::NoMatch => "No match",
            Self::NoProgress => "No progress",
            Self::Delayed => "Delayed",
            Self::Timeout => "Timeout",
            Self::EndOfBlock => "End of block",
            Self::AssignmentGrabbed => "Assignment grabbed",
            Self::AssignmentChanged => "Assignment changed",
            Self::NotLeavingTerminal => "Not leaving terminal",
            Self::LeftTerminalEarly => "Left terminal early",
            Self::LeftTerminalLate => "Left terminal late",
            Self::AvlConflict => "AVL conflict",
            Self::UnmatchedAssignment => "Unmatched assignment",
            Self::TooManyStops => "Too many stops",
        };
        f.write_str(s)
    }
}

/// Noteworthy change in a vehicle's status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleEvent {
    pub id: Uuid,
    pub kind: VehicleEventType,
    pub vehicle_id: VehicleId,
    pub time_ms: i64,
    pub avl_time_ms: Option<i64>,
    pub location: Option<Location>,
    pub description: String,
    pub predictable: bool,
    pub became_unpredictable: bool,
    pub block_id: Option<String>,
    pub route_id: Option<String>,
    pub trip_id: Option<String>,
    pub stop_id: Option<String>,
}

impl VehicleEvent {
    pub fn new(kind: VehicleEventType, vehicle_id: &VehicleId, time_ms: i64, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            vehicle_id: vehicle_id.clone(),
            time_ms,
            avl_time_ms: None,
            location: None,
            description: description.into(),
            predictable: false,
            became_unpredictable: false,
            block_id: None,
            route_id: None,
            trip_id: None,
            stop_id: None,
        }
    }

    pub fn with_report(mut self, report: &AvlReport) -> Self {
        self.avl_time_ms = Some(report.time_ms);
        self.location = Some(report.location);
        self
    }

    pub fn with_match(mut self, m: &SpatialMatch) -> Self {
        self.block_id = Some(m.block().id.clone());
        if let Some(trip) = m.trip() {
            self.route_id = Some(trip.route_id.clone());
            self.trip_id = Some(trip.id.clone());
        }
        self.stop_id = m.stop_path().map(|p| p.stop_id.clone());
        self
    }

    pub fn predictable(mut self, predictable: bool, became_unpredictable: bool) -> Self {
        self.predictable = predictable;
        self.became_unpredictable = became_unpredictable;
        self
    }
}

// ============================================================================
// STATE CHANGES
// ============================================================================

/// Snapshot of a vehicle after processing, for external caches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleStateChanged {
    pub vehicle_id: VehicleId,
    pub avl_time_ms: i64,
    pub location: Location,
    pub predictable: bool,
    pub assignment_id: Option<String>,
    pub assignment_method: String,
    pub block_id: Option<String>,
    pub trip_id: Option<String>,
    pub route_id: Option<String>,
    /// Display heading in degrees
    pub heading: Option<f32>,
    /// Positive is early
    pub schedule_adherence_msecs: Option<i64>,
    pub delayed: bool,
    pub layover: bool,
}

// ============================================================================
// ENVELOPE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreEvent {
    ArrivalDeparture(ArrivalDeparture),
    Match(MatchRecord),
    Predictions(PredictionSet),
    VehicleEvent(VehicleEvent),
    StateChanged(VehicleStateChanged),
}

impl CoreEvent {
    pub fn vehicle_id(&self) -> &VehicleId {
        match self {
            Self::ArrivalDeparture(e) => &e.vehicle_id,
            Self::Match(e) => &e.vehicle_id,
            Self::Predictions(e) => &e.vehicle_id,
            Self::VehicleEvent(e) => &e.vehicle_id,
            Self::StateChanged(e) => &e.vehicle_id,
        }
    }
}

pub type EventSink = dyn Sink<CoreEvent>;

/// Best-effort delivery; a saturated or closed sink only costs the record.
pub(crate) fn emit(sink: &EventSink, event: CoreEvent) {
    let vehicle_id = event.vehicle_id().clone();
    if let Err(e) = sink.try_deliver(event) {
        warn!(%vehicle_id, error = %e, "dropped outbound record");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indices::tests::two_trip_block;
    use crate::indices::Indices;
    use avl_env::{CollectingSink, EnvError};

    struct FullSink;

    impl Sink<CoreEvent> for FullSink {
        fn try_deliver(&self, _item: CoreEvent) -> Result<(), EnvError> {
            Err(EnvError::full("test"))
        }
    }

    fn sample_match() -> SpatialMatch {
        SpatialMatch::new(0, Indices::new(two_trip_block(), 0, 1, 1).unwrap(), 2.0, 90.0)
    }

    #[test]
    fn test_arrival_departure_from_match() {
        let vid = VehicleId::new("v1");
        let day = 1_704_067_200_000;
        let e = ArrivalDeparture::at_stop_of(StopEventKind::Arrival, &vid, day + 8 * 3_600_000, day, &sample_match()).unwrap();
        assert_eq!(e.stop_id, "s1");
        assert_eq!(e.trip_id, "t1");
        // Stop 1 of t1 is scheduled at 08:01
        assert_eq!(e.scheduled_time_ms, Some(day + (8 * 3600 + 60) * 1000));
        assert!(e.is_arrival());
    }

    #[test]
    fn test_event_json_is_tagged() {
        let vid = VehicleId::new("v1");
        let event = CoreEvent::VehicleEvent(VehicleEvent::new(VehicleEventType::NoProgress, &vid, 5, "stuck"));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "vehicle_event");
        assert_eq!(json["kind"], "NO_PROGRESS");
        assert_eq!(json["vehicle_id"], "v1");
    }

    #[test]
    fn test_emit_is_best_effort() {
        let vid = VehicleId::new("v1");
        let record = CoreEvent::Match(MatchRecord::new(&vid, &sample_match()));
        emit(&FullSink, record.clone());
        let collecting = CollectingSink::new();
        emit(&collecting, record);
        assert_eq!(collecting.len(), 1);
    }

    #[test]
    fn test_predictions_grouped_by_stop() {
        let vid = VehicleId::new("v1");
        let p = |stop: &str, t: i64| Prediction {
            vehicle_id: vid.clone(),
            route_id: "r1".into(),
            direction_id: None,
            stop_id: stop.into(),
            trip_id: "t1".into(),
            trip_index: 0,
            stop_path_index: 1,
            predicted_time_ms: t,
            avl_time_ms: 0,
            is_arrival: true,
            sched_based: false,
            uncertain: false,
            delayed: false,
            trip_start_time_ms: None,
            trip_counter: 0,
        };
        let set = PredictionSet {
            vehicle_id: vid.clone(),
            avl_time_ms: 0,
            predictions: vec![p("a", 1), p("b", 2), p("a", 3)],
        };
        let grouped = set.by_stop();
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped.values().next().unwrap().len(), 2);
    }
}
