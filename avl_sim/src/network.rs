//! Synthetic transit network used by the scenarios.
//!
//! Routes are polylines through evenly spaced stops. Every trip starts with
//! a single-point layover path at the terminal and then one two-segment
//! stop path per stop, so the reference data looks like what a GTFS import
//! produces for a simple line.

use avl_core::geo::Location;
use avl_core::reference::{BlockDef, SnapshotDef, StopPathDef, TripDef};
use avl_core::{CoreConfig, CoreResult, InMemorySnapshot};

/// Service every synthetic block runs under.
pub const SERVICE_ID: &str = "weekday";

/// Terminal of every synthetic route.
pub fn default_origin() -> Location {
    Location::new(37.7749, -122.4194)
}

/// Stops of a route in travel order. The first stop is the terminal.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteLayout {
    pub route_id: String,
    pub stops: Vec<Location>,
}

impl RouteLayout {
    /// Straight eastbound line with `num_stops` stops after the terminal.
    pub fn straight(route_id: &str, origin: Location, num_stops: usize, spacing_m: f64) -> Self {
        let stops = (0..=num_stops)
            .map(|i| origin.offset(i as f64 * spacing_m, 0.0))
            .collect();
        Self {
            route_id: route_id.to_string(),
            stops,
        }
    }

    /// Square loop run east, north, west then south, ending back at the
    /// terminal.
    pub fn square_loop(route_id: &str, origin: Location, stops_per_side: usize, spacing_m: f64) -> Self {
        let side = stops_per_side as f64 * spacing_m;
        let mut stops = vec![origin];
        for leg in 0..4 {
            for i in 1..=stops_per_side {
                let d = i as f64 * spacing_m;
                let (east, north) = match leg {
                    0 => (d, 0.0),
                    1 => (side, d),
                    2 => (side - d, side),
                    _ => (0.0, side - d),
                };
                stops.push(origin.offset(east, north));
            }
        }
        Self {
            route_id: route_id.to_string(),
            stops,
        }
    }

    pub fn terminal(&self) -> Location {
        self.stops[0]
    }

    /// Number of stops served after the terminal.
    pub fn num_stops(&self) -> usize {
        self.stops.len().saturating_sub(1)
    }

    /// True when the last stop is the terminal again.
    pub fn is_loop(&self) -> bool {
        self.num_stops() > 1 && self.stops[self.stops.len() - 1].distance(&self.terminal()) < 1.0
    }

    fn stop_id(&self, index: usize) -> String {
        let index = if self.is_loop() && index == self.num_stops() { 0 } else { index };
        format!("{}_s{}", self.route_id, index)
    }

    /// Length from the terminal to the last stop in meters.
    pub fn length(&self) -> f64 {
        self.stops.windows(2).map(|w| w[0].distance(&w[1])).sum()
    }
}

fn midpoint(a: &Location, b: &Location) -> Location {
    Location::new((a.lat + b.lat) / 2.0, (a.lon + b.lon) / 2.0)
}

fn point(loc: &Location) -> [f64; 2] {
    [loc.lat, loc.lon]
}

// ============================================================================
// TRIPS
// ============================================================================

/// One trip over a layout.
#[derive(Debug, Clone)]
pub struct TripPlan {
    pub trip_id: String,
    /// Departure from the terminal, seconds into the service day
    pub start_secs: i32,
    /// Scheduled running time between consecutive stops
    pub secs_between_stops: i32,
    /// Frequency based service without stop times
    pub no_schedule: bool,
}

impl TripPlan {
    pub fn new(trip_id: &str, start_secs: i32, secs_between_stops: i32) -> Self {
        Self {
            trip_id: trip_id.to_string(),
            start_secs,
            secs_between_stops,
            no_schedule: false,
        }
    }

    pub fn unscheduled(mut self) -> Self {
        self.no_schedule = true;
        self
    }

    /// Scheduled time at stop `index` (terminal is 0), seconds into the day.
    pub fn time_at_stop(&self, index: usize) -> i32 {
        self.start_secs + index as i32 * self.secs_between_stops
    }

    pub fn end_secs(&self, layout: &RouteLayout) -> i32 {
        self.time_at_stop(layout.num_stops())
    }

    /// Reference definition of the trip.
    pub fn to_def(&self, layout: &RouteLayout) -> TripDef {
        let scheduled = |secs: i32| (!self.no_schedule).then_some(secs);
        let half_msecs = (self.secs_between_stops.max(0) as u32) * 500;

        let mut stop_paths = Vec::with_capacity(layout.stops.len());
        stop_paths.push(StopPathDef {
            id: Some(format!("{}_0", self.trip_id)),
            stop_id: layout.stop_id(0),
            points: vec![point(&layout.terminal())],
            layover: true,
            wait_stop: false,
            before_stop_distance: None,
            after_stop_distance: None,
            max_distance: None,
            max_speed: None,
            break_time_secs: None,
            arrival_secs: None,
            departure_secs: scheduled(self.start_secs),
            travel_times_msecs: vec![0],
            stop_time_msecs: 0,
        });
        for (i, pair) in layout.stops.windows(2).enumerate() {
            let index = i + 1;
            let time = scheduled(self.time_at_stop(index));
            stop_paths.push(StopPathDef {
                id: Some(format!("{}_{}", self.trip_id, index)),
                stop_id: layout.stop_id(index),
                points: vec![point(&pair[0]), point(&midpoint(&pair[0], &pair[1])), point(&pair[1])],
                layover: false,
                wait_stop: false,
                before_stop_distance: None,
                after_stop_distance: None,
                max_distance: None,
                max_speed: None,
                break_time_secs: None,
                arrival_secs: time,
                departure_secs: time,
                travel_times_msecs: vec![half_msecs, half_msecs],
                stop_time_msecs: 0,
            });
        }

        TripDef {
            id: self.trip_id.clone(),
            route_id: layout.route_id.clone(),
            direction_id: Some("0".to_string()),
            pattern_id: Some(format!("{}_p0", layout.route_id)),
            no_schedule: self.no_schedule,
            start_time_secs: Some(self.start_secs),
            end_time_secs: Some(self.end_secs(layout)),
            max_distance_from_segment: None,
            stop_paths,
        }
    }
}

// ============================================================================
// NETWORK
// ============================================================================

/// Builder for the reference data a scenario runs against.
#[derive(Debug, Clone, Default)]
pub struct SyntheticNetwork {
    def: SnapshotDef,
}

impl SyntheticNetwork {
    pub fn new() -> Self {
        Self {
            def: SnapshotDef {
                default_speed_mps: 8.0,
                ..Default::default()
            },
        }
    }

    /// Adds a block running the given trips back to back over one layout.
    pub fn with_block(mut self, block_id: &str, layout: &RouteLayout, trips: &[TripPlan]) -> Self {
        self.def.blocks.push(BlockDef {
            id: block_id.to_string(),
            service_id: SERVICE_ID.to_string(),
            trips: trips.iter().map(|t| t.to_def(layout)).collect(),
        });
        self
    }

    pub fn def(&self) -> &SnapshotDef {
        &self.def
    }

    pub fn into_def(self) -> SnapshotDef {
        self.def
    }

    pub fn build(&self, config: &CoreConfig) -> CoreResult<InMemorySnapshot> {
        InMemorySnapshot::from_def(self.def.clone(), config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use avl_core::ReferenceSnapshot;

    #[test]
    fn test_straight_layout_spacing() {
        let layout = RouteLayout::straight("r1", default_origin(), 5, 400.0);
        assert_eq!(layout.num_stops(), 5);
        assert_relative_eq!(layout.length(), 2000.0, epsilon = 1.0);
    }

    #[test]
    fn test_square_loop_closes() {
        let layout = RouteLayout::square_loop("loop", default_origin(), 2, 300.0);
        assert_eq!(layout.num_stops(), 8);
        let last = layout.stops[layout.stops.len() - 1];
        assert!(last.distance(&layout.terminal()) < 1.0);
        assert!(layout.is_loop());
        assert_eq!(layout.stop_id(8), "loop_s0");
        assert_relative_eq!(layout.length(), 2400.0, epsilon = 2.0);
    }

    #[test]
    fn test_trip_def_schedule() {
        let layout = RouteLayout::straight("r1", default_origin(), 3, 400.0);
        let def = TripPlan::new("t1", 8 * 3600, 120).to_def(&layout);
        assert_eq!(def.stop_paths.len(), 4);
        assert!(def.stop_paths[0].layover);
        assert_eq!(def.stop_paths[0].departure_secs, Some(8 * 3600));
        assert_eq!(def.stop_paths[3].arrival_secs, Some(8 * 3600 + 360));
        assert_eq!(def.end_time_secs, Some(8 * 3600 + 360));
        assert_eq!(def.stop_paths[2].points.len(), 3);
        assert_eq!(def.stop_paths[3].stop_id, "r1_s3");
    }

    #[test]
    fn test_unscheduled_trip_has_no_stop_times() {
        let layout = RouteLayout::straight("r1", default_origin(), 3, 400.0);
        let def = TripPlan::new("f1", 8 * 3600, 120).unscheduled().to_def(&layout);
        assert!(def.no_schedule);
        assert!(def.stop_paths.iter().all(|sp| sp.arrival_secs.is_none() && sp.departure_secs.is_none()));
        assert_eq!(def.start_time_secs, Some(8 * 3600));
    }

    #[test]
    fn test_network_builds_snapshot() {
        let layout = RouteLayout::straight("r1", default_origin(), 4, 400.0);
        let network = SyntheticNetwork::new().with_block(
            "b1",
            &layout,
            &[TripPlan::new("t1", 8 * 3600, 120), TripPlan::new("t2", 9 * 3600, 120)],
        );
        let snapshot = network.build(&CoreConfig::default()).unwrap();
        let block = snapshot.block(SERVICE_ID, "b1").unwrap();
        assert_eq!(block.num_trips(), 2);
        assert_eq!(block.num_stop_paths(0), 5);
    }
}
