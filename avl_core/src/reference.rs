//! Reference snapshot: the immutable Block → Trip → StopPath → Segment graph
//! plus service calendars.
//!
//! The core only ever reads reference data. [`ReferenceSnapshot`] is the
//! query surface; [`InMemorySnapshot`] is a ready-made implementation that can
//! be built programmatically or from a JSON document ([`SnapshotDef`]).

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::geo::{Location, Segment};
use crate::service_time::{self, ServiceClock, SEC_PER_DAY};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

// ============================================================================
// SCHEDULE & TRAVEL TIMES
// ============================================================================

/// Scheduled times at a stop, seconds into the service day (may exceed 24h).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScheduleTime {
    pub arrival_secs: Option<i32>,
    pub departure_secs: Option<i32>,
}

impl ScheduleTime {
    /// Departure if there is one, otherwise arrival.
    pub fn time(&self) -> Option<i32> {
        self.departure_secs.or(self.arrival_secs)
    }
}

/// Expected travel times across a stop path, split into equal-length pieces,
/// plus the expected dwell at the stop ending the path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TravelTimesForStopPath {
    pub segment_msecs: Vec<u32>,
    pub stop_time_msecs: u32,
}

impl TravelTimesForStopPath {
    pub fn new(segment_msecs: Vec<u32>, stop_time_msecs: u32) -> Self {
        Self {
            segment_msecs,
            stop_time_msecs,
        }
    }

    pub fn num_segments(&self) -> usize {
        self.segment_msecs.len()
    }

    /// Full travel time across the path, excluding the stop.
    pub fn travel_time_msecs(&self) -> i64 {
        self.segment_msecs.iter().map(|&t| t as i64).sum()
    }

    pub fn segment_msecs(&self, index: usize) -> i64 {
        self.segment_msecs.get(index).copied().unwrap_or(0) as i64
    }
}

// ============================================================================
// STOP PATH
// ============================================================================

/// Path from the previous stop to this stop, as ordered segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopPath {
    pub id: String,
    pub stop_id: String,
    pub segments: Vec<Segment>,
    pub length: f64,
    /// Vehicle may leave the path here before the next trip
    pub layover: bool,
    /// Vehicle must not depart before the scheduled departure
    pub wait_stop: bool,
    pub before_stop_distance: f64,
    pub after_stop_distance: f64,
    /// Per-stop override of the max distance from segment
    pub max_distance: Option<f64>,
    /// Per-stop override of the max plausible speed (m/s)
    pub max_speed: Option<f64>,
    /// Mandated break at this stop
    pub break_time_secs: Option<i64>,
}

impl StopPath {
    /// Builds segments from the polyline; a single point yields one
    /// zero-length segment sitting on the stop.
    pub fn new(id: impl Into<String>, stop_id: impl Into<String>, points: &[Location]) -> CoreResult<Self> {
        let id = id.into();
        let segments: Vec<Segment> = match points {
            [] => return Err(CoreError::invalid(format!("stop path {} has no points", id))),
            [only] => vec![Segment::new(*only, *only)],
            _ => points.windows(2).map(|w| Segment::new(w[0], w[1])).collect(),
        };
        let length = segments.iter().map(|s| s.length).sum();
        Ok(Self {
            id,
            stop_id: stop_id.into(),
            segments,
            length,
            layover: false,
            wait_stop: false,
            before_stop_distance: 50.0,
            after_stop_distance: 50.0,
            max_distance: None,
            max_speed: None,
            break_time_secs: None,
        })
    }

    pub fn with_layover(mut self, layover: bool) -> Self {
        self.layover = layover;
        self
    }

    pub fn with_wait_stop(mut self, wait_stop: bool) -> Self {
        self.wait_stop = wait_stop;
        self
    }

    pub fn with_stop_distances(mut self, before: f64, after: f64) -> Self {
        self.before_stop_distance = before;
        self.after_stop_distance = after;
        self
    }

    pub fn num_segments(&self) -> i32 {
        self.segments.len() as i32
    }

    pub fn segment(&self, index: i32) -> Option<&Segment> {
        if index < 0 {
            return None;
        }
        self.segments.get(index as usize)
    }

    /// Location of the stop this path leads to.
    pub fn end_location(&self) -> Location {
        self.segments.last().map(|s| s.end).unwrap_or(Location::new(0.0, 0.0))
    }

    /// Wait stops include layovers.
    pub fn is_wait_stop(&self) -> bool {
        self.wait_stop || self.layover
    }

    /// Distance from the start of the path to the start of `segment`.
    pub fn length_before_segment(&self, segment: i32) -> f64 {
        self.segments
            .iter()
            .take(segment.max(0) as usize)
            .map(|s| s.length)
            .sum()
    }
}

// ============================================================================
// TRIP
// ============================================================================

/// One scheduled (or frequency-based) run along a pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct Trip {
    pub id: String,
    pub route_id: String,
    pub direction_id: Option<String>,
    pub block_id: String,
    pub service_id: String,
    /// Trips sharing a pattern share stop path geometry
    pub pattern_id: String,
    pub start_time_secs: i32,
    pub end_time_secs: i32,
    pub no_schedule: bool,
    pub stop_paths: Vec<Arc<StopPath>>,
    pub schedule_times: Vec<Option<ScheduleTime>>,
    pub travel_times: Vec<TravelTimesForStopPath>,
    /// Route-level override of the max distance from segment
    pub max_distance_from_segment: Option<f64>,
}

impl Trip {
    /// Checks that the per-stop arrays line up.
    pub fn validate(&self) -> CoreResult<()> {
        let n = self.stop_paths.len();
        if n == 0 {
            return Err(CoreError::invalid(format!("trip {} has no stop paths", self.id)));
        }
        if self.schedule_times.len() != n || self.travel_times.len() != n {
            return Err(CoreError::invalid(format!(
                "trip {} has {} stop paths but {} schedule times and {} travel times",
                self.id,
                n,
                self.schedule_times.len(),
                self.travel_times.len()
            )));
        }
        if let Some(tt) = self.travel_times.iter().find(|tt| tt.segment_msecs.is_empty()) {
            return Err(CoreError::invalid(format!(
                "trip {} has a stop path with no travel time segments ({:?})",
                self.id, tt
            )));
        }
        Ok(())
    }

    pub fn num_stop_paths(&self) -> i32 {
        self.stop_paths.len() as i32
    }

    pub fn stop_path(&self, index: i32) -> Option<&Arc<StopPath>> {
        if index < 0 {
            return None;
        }
        self.stop_paths.get(index as usize)
    }

    pub fn schedule_time(&self, index: i32) -> Option<ScheduleTime> {
        if index < 0 {
            return None;
        }
        self.schedule_times.get(index as usize).copied().flatten()
    }

    pub fn travel_times(&self, index: i32) -> Option<&TravelTimesForStopPath> {
        if index < 0 {
            return None;
        }
        self.travel_times.get(index as usize)
    }

    /// Sum of stop path lengths excluding the first (stub) path.
    pub fn length(&self) -> f64 {
        self.stop_paths.iter().skip(1).map(|p| p.length).sum()
    }
}

// ============================================================================
// BLOCK
// ============================================================================

/// A vehicle's full sequence of trips for a service day.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub id: String,
    pub service_id: String,
    pub start_time_secs: i32,
    pub end_time_secs: i32,
    pub trips: Vec<Arc<Trip>>,
    /// Clock the schedule times are expressed against
    pub clock: ServiceClock,
}

impl Block {
    pub fn new(
        id: impl Into<String>,
        service_id: impl Into<String>,
        trips: Vec<Arc<Trip>>,
        clock: ServiceClock,
    ) -> CoreResult<Self> {
        let id = id.into();
        if trips.is_empty() {
            return Err(CoreError::invalid(format!("block {} has no trips", id)));
        }
        for trip in &trips {
            trip.validate()?;
        }
        let start_time_secs = trips.iter().map(|t| t.start_time_secs).min().unwrap_or(0);
        let end_time_secs = trips.iter().map(|t| t.end_time_secs).max().unwrap_or(0);
        Ok(Self {
            id,
            service_id: service_id.into(),
            start_time_secs,
            end_time_secs,
            trips,
            clock,
        })
    }

    pub fn num_trips(&self) -> i32 {
        self.trips.len() as i32
    }

    pub fn trip(&self, index: i32) -> Option<&Arc<Trip>> {
        if index < 0 {
            return None;
        }
        self.trips.get(index as usize)
    }

    pub fn trip_index(&self, trip_id: &str) -> Option<i32> {
        self.trips.iter().position(|t| t.id == trip_id).map(|i| i as i32)
    }

    /// Frequency-based looping block.
    pub fn no_schedule(&self) -> bool {
        self.trips.first().map(|t| t.no_schedule).unwrap_or(false)
    }

    pub fn same_block(&self, other: &Block) -> bool {
        self.id == other.id && self.service_id == other.service_id
    }

    pub fn num_stop_paths(&self, trip_index: i32) -> i32 {
        self.trip(trip_index).map(|t| t.num_stop_paths()).unwrap_or(0)
    }

    pub fn num_segments(&self, trip_index: i32, stop_path_index: i32) -> i32 {
        self.trip(trip_index)
            .and_then(|t| t.stop_path(stop_path_index))
            .map(|p| p.num_segments())
            .unwrap_or(0)
    }

    /// Validated stop path lookup.
    pub fn stop_path_checked(&self, trip_index: i32, stop_path_index: i32) -> CoreResult<&Arc<StopPath>> {
        let trip = self.trip(trip_index).ok_or_else(|| {
            CoreError::out_of_range("trip", trip_index, self.trips.len(), format!("block {}", self.id))
        })?;
        trip.stop_path(stop_path_index).ok_or_else(|| {
            CoreError::out_of_range(
                "stop path",
                stop_path_index,
                trip.stop_paths.len(),
                format!("trip {}", trip.id),
            )
        })
    }

    /// True if `secs_into_day` falls within [start - allowable_before, end],
    /// also checking the previous-day interpretation for blocks past midnight.
    pub fn is_active_at_secs(&self, secs_into_day: i32, allowable_before_secs: i64) -> bool {
        let start = self.start_time_secs as i64 - allowable_before_secs;
        let end = self.end_time_secs as i64;
        let s = secs_into_day as i64;
        (s > start && s < end) || (s + SEC_PER_DAY > start && s + SEC_PER_DAY < end)
    }

    pub fn is_active(&self, epoch_ms: i64, allowable_before_secs: i64) -> bool {
        self.is_active_at_secs(self.clock.seconds_into_day(epoch_ms), allowable_before_secs)
    }

    /// Indices of trips that could plausibly be running at `epoch_ms`.
    pub fn trips_currently_active(&self, epoch_ms: i64, allowable_early_secs: i64, allowable_late_secs: i64) -> Vec<i32> {
        let s = self.clock.seconds_into_day(epoch_ms) as i64;
        self.trips
            .iter()
            .enumerate()
            .filter(|(_, trip)| {
                let start = trip.start_time_secs as i64 - allowable_early_secs;
                let end = trip.end_time_secs as i64 + allowable_late_secs;
                (s > start && s < end) || (s + SEC_PER_DAY > start && s + SEC_PER_DAY < end)
            })
            .map(|(i, _)| i as i32)
            .collect()
    }
}

// ============================================================================
// CALENDARS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calendar {
    pub service_id: String,
    #[serde(default)]
    pub monday: bool,
    #[serde(default)]
    pub tuesday: bool,
    #[serde(default)]
    pub wednesday: bool,
    #[serde(default)]
    pub thursday: bool,
    #[serde(default)]
    pub friday: bool,
    #[serde(default)]
    pub saturday: bool,
    #[serde(default)]
    pub sunday: bool,
    /// YYYYMMDD
    pub start_date: u32,
    /// YYYYMMDD, inclusive
    pub end_date: u32,
}

impl Calendar {
    pub fn runs_on(&self, day: i64) -> bool {
        if day < service_time::day_from_date_key(self.start_date)
            || day > service_time::day_from_date_key(self.end_date)
        {
            return false;
        }
        [
            self.monday,
            self.tuesday,
            self.wednesday,
            self.thursday,
            self.friday,
            self.saturday,
            self.sunday,
        ][service_time::weekday(day)]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalendarException {
    Added,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarDate {
    pub service_id: String,
    /// YYYYMMDD
    pub date: u32,
    pub exception: CalendarException,
}

// ============================================================================
// QUERY SURFACE
// ============================================================================

/// Read-only view of the reference data.
pub trait ReferenceSnapshot: Send + Sync {
    fn service_clock(&self) -> ServiceClock;

    fn block(&self, service_id: &str, block_id: &str) -> Option<Arc<Block>>;

    fn trip(&self, trip_id: &str) -> Option<Arc<Trip>>;

    /// Blocks for `service_id` that contain a trip on `route_id`.
    fn blocks_for_route(&self, service_id: &str, route_id: &str) -> Vec<Arc<Block>>;

    /// Every block of `service_id`, sorted by id.
    fn blocks_for_service(&self, service_id: &str) -> Vec<Arc<Block>>;

    /// Service ids running on the service day containing `epoch_ms`.
    fn active_service_ids(&self, epoch_ms: i64) -> Vec<String>;

    fn block_for_trip(&self, trip: &Trip) -> Option<Arc<Block>> {
        self.block(&trip.service_id, &trip.block_id)
    }

    /// First block with `block_id` under any service active at `epoch_ms`.
    fn active_block(&self, block_id: &str, epoch_ms: i64) -> Option<Arc<Block>> {
        self.active_service_ids(epoch_ms)
            .iter()
            .find_map(|sid| self.block(sid, block_id))
    }

    fn stop_path(&self, trip_id: &str, stop_path_index: i32) -> CoreResult<Arc<StopPath>> {
        let trip = self
            .trip(trip_id)
            .ok_or_else(|| CoreError::UnknownTrip(trip_id.to_string()))?;
        trip.stop_path(stop_path_index).cloned().ok_or_else(|| {
            CoreError::out_of_range("stop path", stop_path_index, trip.stop_paths.len(), format!("trip {}", trip_id))
        })
    }

    fn segment(&self, trip_id: &str, stop_path_index: i32, segment_index: i32) -> CoreResult<Segment> {
        let path = self.stop_path(trip_id, stop_path_index)?;
        path.segment(segment_index).cloned().ok_or_else(|| {
            CoreError::out_of_range("segment", segment_index, path.segments.len(), format!("stop path {}", path.id))
        })
    }

    /// Blocks for a route across every active service, optionally only
    /// those whose active window covers `epoch_ms`.
    fn active_blocks_for_route(
        &self,
        route_id: &str,
        epoch_ms: i64,
        allowable_before_secs: i64,
        ignore_inactive: bool,
    ) -> Vec<Arc<Block>> {
        self.active_service_ids(epoch_ms)
            .iter()
            .flat_map(|sid| self.blocks_for_route(sid, route_id))
            .filter(|b| !ignore_inactive || b.is_active(epoch_ms, allowable_before_secs))
            .collect()
    }

    /// Blocks of every active service whose window covers `epoch_ms`.
    fn active_blocks(&self, epoch_ms: i64, allowable_before_secs: i64) -> Vec<Arc<Block>> {
        self.active_service_ids(epoch_ms)
            .iter()
            .flat_map(|sid| self.blocks_for_service(sid))
            .filter(|b| b.is_active(epoch_ms, allowable_before_secs))
            .collect()
    }
}

// ============================================================================
// JSON DEFINITION
// ============================================================================

/// Serialized form of a snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotDef {
    #[serde(default)]
    pub utc_offset_secs: i32,
    /// Used for stop paths that carry no travel times (m/s)
    #[serde(default = "default_speed")]
    pub default_speed_mps: f64,
    /// No calendars means every referenced service always runs
    #[serde(default)]
    pub calendars: Vec<Calendar>,
    #[serde(default)]
    pub calendar_dates: Vec<CalendarDate>,
    pub blocks: Vec<BlockDef>,
}

fn default_speed() -> f64 {
    8.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDef {
    pub id: String,
    pub service_id: String,
    pub trips: Vec<TripDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripDef {
    pub id: String,
    pub route_id: String,
    #[serde(default)]
    pub direction_id: Option<String>,
    #[serde(default)]
    pub pattern_id: Option<String>,
    #[serde(default)]
    pub no_schedule: bool,
    /// Required for no-schedule trips; derived from schedule otherwise
    #[serde(default)]
    pub start_time_secs: Option<i32>,
    #[serde(default)]
    pub end_time_secs: Option<i32>,
    #[serde(default)]
    pub max_distance_from_segment: Option<f64>,
    pub stop_paths: Vec<StopPathDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopPathDef {
    #[serde(default)]
    pub id: Option<String>,
    pub stop_id: String,
    /// [lat, lon] polyline ending at the stop
    pub points: Vec<[f64; 2]>,
    #[serde(default)]
    pub layover: bool,
    #[serde(default)]
    pub wait_stop: bool,
    #[serde(default)]
    pub before_stop_distance: Option<f64>,
    #[serde(default)]
    pub after_stop_distance: Option<f64>,
    #[serde(default)]
    pub max_distance: Option<f64>,
    #[serde(default)]
    pub max_speed: Option<f64>,
    #[serde(default)]
    pub break_time_secs: Option<i64>,
    #[serde(default)]
    pub arrival_secs: Option<i32>,
    #[serde(default)]
    pub departure_secs: Option<i32>,
    #[serde(default)]
    pub travel_times_msecs: Vec<u32>,
    #[serde(default)]
    pub stop_time_msecs: u32,
}

// ============================================================================
// IN-MEMORY SNAPSHOT
// ============================================================================

/// Hash-indexed snapshot held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemorySnapshot {
    clock: ServiceClock,
    calendars: Vec<Calendar>,
    calendar_dates: Vec<CalendarDate>,
    blocks: HashMap<(String, String), Arc<Block>>,
    trips: HashMap<String, Arc<Trip>>,
    route_blocks: HashMap<(String, String), Vec<Arc<Block>>>,
}

impl InMemorySnapshot {
    pub fn new(
        clock: ServiceClock,
        calendars: Vec<Calendar>,
        calendar_dates: Vec<CalendarDate>,
        blocks: Vec<Block>,
    ) -> CoreResult<Self> {
        let mut snapshot = Self {
            clock,
            calendars,
            calendar_dates,
            ..Default::default()
        };
        for block in blocks {
            let block = Arc::new(block);
            let key = (block.service_id.clone(), block.id.clone());
            if snapshot.blocks.contains_key(&key) {
                return Err(CoreError::invalid(format!("duplicate block {} for service {}", key.1, key.0)));
            }
            for trip in &block.trips {
                snapshot.trips.insert(trip.id.clone(), Arc::clone(trip));
                let route_key = (block.service_id.clone(), trip.route_id.clone());
                let entry = snapshot.route_blocks.entry(route_key).or_default();
                if !entry.iter().any(|b| b.same_block(&block)) {
                    entry.push(Arc::clone(&block));
                }
            }
            snapshot.blocks.insert(key, block);
        }
        Ok(snapshot)
    }

    /// Builds from a definition; per-stop distances left unset take the
    /// configured defaults.
    pub fn from_def(def: SnapshotDef, config: &CoreConfig) -> CoreResult<Self> {
        let clock = ServiceClock::new(def.utc_offset_secs);
        let mut blocks = Vec::with_capacity(def.blocks.len());
        for block_def in def.blocks {
            let mut trips = Vec::with_capacity(block_def.trips.len());
            for trip_def in block_def.trips {
                trips.push(Arc::new(build_trip(
                    trip_def,
                    &block_def.id,
                    &block_def.service_id,
                    def.default_speed_mps,
                    config,
                )?));
            }
            blocks.push(Block::new(block_def.id, block_def.service_id, trips, clock)?);
        }
        Self::new(clock, def.calendars, def.calendar_dates, blocks)
    }

    pub fn from_json(json: &str, config: &CoreConfig) -> CoreResult<Self> {
        let def: SnapshotDef = serde_json::from_str(json)?;
        Self::from_def(def, config)
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Arc<Block>> {
        self.blocks.values()
    }
}

fn build_trip(
    def: TripDef,
    block_id: &str,
    service_id: &str,
    default_speed_mps: f64,
    config: &CoreConfig,
) -> CoreResult<Trip> {
    let mut stop_paths = Vec::with_capacity(def.stop_paths.len());
    let mut schedule_times = Vec::with_capacity(def.stop_paths.len());
    let mut travel_times = Vec::with_capacity(def.stop_paths.len());

    for (i, sp) in def.stop_paths.into_iter().enumerate() {
        let points: Vec<Location> = sp.points.iter().map(|p| Location::new(p[0], p[1])).collect();
        let id = sp.id.unwrap_or_else(|| format!("{}_{}", def.id, i));
        let mut path = StopPath::new(id, sp.stop_id, &points)?
            .with_layover(sp.layover)
            .with_wait_stop(sp.wait_stop)
            .with_stop_distances(
                sp.before_stop_distance.unwrap_or(config.before_stop_distance),
                sp.after_stop_distance.unwrap_or(config.after_stop_distance),
            );
        path.max_distance = sp.max_distance;
        path.max_speed = sp.max_speed;
        path.break_time_secs = sp.break_time_secs;

        let segment_msecs = if sp.travel_times_msecs.is_empty() {
            vec![(path.length / default_speed_mps * 1000.0).round() as u32]
        } else {
            sp.travel_times_msecs
        };
        travel_times.push(TravelTimesForStopPath::new(segment_msecs, sp.stop_time_msecs));

        schedule_times.push(match (sp.arrival_secs, sp.departure_secs) {
            (None, None) => None,
            (arrival_secs, departure_secs) => Some(ScheduleTime {
                arrival_secs,
                departure_secs,
            }),
        });
        stop_paths.push(Arc::new(path));
    }

    let first_time = schedule_times.iter().flatten().find_map(|s| s.time());
    let last_time = schedule_times
        .iter()
        .rev()
        .flatten()
        .find_map(|s| s.arrival_secs.or(s.departure_secs));
    let start_time_secs = def
        .start_time_secs
        .or(first_time)
        .ok_or_else(|| CoreError::invalid(format!("trip {} has no start time", def.id)))?;
    let end_time_secs = def
        .end_time_secs
        .or(last_time)
        .ok_or_else(|| CoreError::invalid(format!("trip {} has no end time", def.id)))?;

    let trip = Trip {
        pattern_id: def.pattern_id.unwrap_or_else(|| def.id.clone()),
        id: def.id,
        route_id: def.route_id,
        direction_id: def.direction_id,
        block_id: block_id.to_string(),
        service_id: service_id.to_string(),
        start_time_secs,
        end_time_secs,
        no_schedule: def.no_schedule,
        stop_paths,
        schedule_times,
        travel_times,
        max_distance_from_segment: def.max_distance_from_segment,
    };
    trip.validate()?;
    Ok(trip)
}

impl ReferenceSnapshot for InMemorySnapshot {
    fn service_clock(&self) -> ServiceClock {
        self.clock
    }

    fn block(&self, service_id: &str, block_id: &str) -> Option<Arc<Block>> {
        self.blocks
            .get(&(service_id.to_string(), block_id.to_string()))
            .cloned()
    }

    fn trip(&self, trip_id: &str) -> Option<Arc<Trip>> {
        self.trips.get(trip_id).cloned()
    }

    fn blocks_for_route(&self, service_id: &str, route_id: &str) -> Vec<Arc<Block>> {
        self.route_blocks
            .get(&(service_id.to_string(), route_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    fn blocks_for_service(&self, service_id: &str) -> Vec<Arc<Block>> {
        let mut blocks: Vec<Arc<Block>> = self
            .blocks
            .iter()
            .filter(|((sid, _), _)| sid == service_id)
            .map(|(_, b)| Arc::clone(b))
            .collect();
        blocks.sort_by(|a, b| a.id.cmp(&b.id));
        blocks
    }

    fn active_service_ids(&self, epoch_ms: i64) -> Vec<String> {
        let mut ids: Vec<String> = if self.calendars.is_empty() && self.calendar_dates.is_empty() {
            self.blocks.keys().map(|(sid, _)| sid.clone()).collect()
        } else {
            let day = self.clock.day_number(epoch_ms);
            let date = service_time::date_key_from_day(day);
            let mut ids: Vec<String> = self
                .calendars
                .iter()
                .filter(|c| c.runs_on(day))
                .map(|c| c.service_id.clone())
                .collect();
            for exception in self.calendar_dates.iter().filter(|d| d.date == date) {
                match exception.exception {
                    CalendarException::Added => ids.push(exception.service_id.clone()),
                    CalendarException::Removed => ids.retain(|id| *id != exception.service_id),
                }
            }
            ids
        };
        ids.sort();
        ids.dedup();
        ids
    }
}
