//! Ground truth oracle for the replay harness.
//!
//! Knows where every simulated vehicle really is and turns that into the
//! noisy AVL feed the core sees. GPS noise comes from a seeded ChaCha RNG so
//! a scenario replays bit-for-bit for a given seed.

use crate::network::{RouteLayout, TripPlan};
use avl_core::geo::Location;
use avl_core::service_time::MS_PER_SEC;
use avl_core::{Assignment, AvlReport, VehicleId};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

/// A position the vehicle is at, at a given time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Waypoint {
    pub time_ms: i64,
    pub location: Location,
}

/// Ground-truth movement of one vehicle: straight-line motion between
/// waypoints.
#[derive(Debug, Clone)]
pub struct VehiclePlan {
    pub vehicle_id: VehicleId,
    pub assignment: Option<Assignment>,
    waypoints: Vec<Waypoint>,
}

impl VehiclePlan {
    pub fn new(vehicle_id: &str, assignment: Option<Assignment>) -> Self {
        Self {
            vehicle_id: VehicleId::new(vehicle_id),
            assignment,
            waypoints: Vec::new(),
        }
    }

    /// Be at `location` at `time_ms`.
    pub fn at(mut self, location: Location, time_ms: i64) -> Self {
        self.waypoints.push(Waypoint { time_ms, location });
        self
    }

    /// Stay where the last waypoint left the vehicle until `time_ms`.
    pub fn hold_until(self, time_ms: i64) -> Self {
        match self.waypoints.last().copied() {
            Some(last) => self.at(last.location, time_ms),
            None => self,
        }
    }

    /// Drive a trip, reaching every stop `delay_ms` after its scheduled
    /// time. `day_start_ms` is midnight of the service day.
    pub fn drive(mut self, layout: &RouteLayout, trip: &TripPlan, day_start_ms: i64, delay_ms: i64) -> Self {
        for (i, stop) in layout.stops.iter().enumerate() {
            let time_ms = day_start_ms + trip.time_at_stop(i) as i64 * MS_PER_SEC + delay_ms;
            self.waypoints.push(Waypoint {
                time_ms,
                location: *stop,
            });
        }
        self
    }

    pub fn waypoints(&self) -> &[Waypoint] {
        &self.waypoints
    }

    pub fn start_ms(&self) -> Option<i64> {
        self.waypoints.first().map(|w| w.time_ms)
    }

    pub fn end_ms(&self) -> Option<i64> {
        self.waypoints.last().map(|w| w.time_ms)
    }

    /// True position and direction of travel, `None` outside the plan.
    /// Heading is `None` while the vehicle is stationary.
    pub fn position_at(&self, time_ms: i64) -> Option<(Location, Option<f32>)> {
        let first = self.waypoints.first()?;
        if time_ms < first.time_ms || time_ms > self.end_ms()? {
            return None;
        }
        for pair in self.waypoints.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if time_ms < a.time_ms || time_ms > b.time_ms {
                continue;
            }
            let span = (b.time_ms - a.time_ms) as f64;
            let frac = if span > 0.0 {
                (time_ms - a.time_ms) as f64 / span
            } else {
                1.0
            };
            let location = Location::new(
                a.location.lat + (b.location.lat - a.location.lat) * frac,
                a.location.lon + (b.location.lon - a.location.lon) * frac,
            );
            let heading = (a.location.distance(&b.location) > 1.0).then(|| a.location.bearing_to(&b.location));
            return Some((location, heading));
        }
        Some((first.location, None))
    }
}

// ============================================================================
// ORACLE
// ============================================================================

/// Ground truth oracle producing noisy AVL reports.
pub struct Oracle {
    rng: ChaCha8Rng,
    /// `None` for a perfect GPS
    noise: Option<Normal<f64>>,
}

impl Oracle {
    /// Creates an oracle with per-axis GPS noise of `gps_noise_m` standard
    /// deviation.
    pub fn new(seed: u64, gps_noise_m: f64) -> Self {
        let noise = if gps_noise_m > 0.0 {
            Normal::new(0.0, gps_noise_m).ok()
        } else {
            None
        };
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            noise,
        }
    }

    fn jitter(&mut self) -> (f64, f64) {
        match &self.noise {
            Some(normal) => (normal.sample(&mut self.rng), normal.sample(&mut self.rng)),
            None => (0.0, 0.0),
        }
    }

    /// One fix at `time_ms`, `None` if the plan does not cover that time.
    pub fn report_at(&mut self, plan: &VehiclePlan, time_ms: i64) -> Option<AvlReport> {
        let (truth, heading) = plan.position_at(time_ms)?;
        let (east, north) = self.jitter();
        let mut report = AvlReport::new(plan.vehicle_id.clone(), time_ms, truth.offset(east, north));
        report.heading = heading;
        report.assignment = plan.assignment.clone();
        Some(report)
    }

    /// Fixes every `interval_ms` over `[from_ms, to_ms]`, clipped to the plan.
    pub fn reports(&mut self, plan: &VehiclePlan, from_ms: i64, to_ms: i64, interval_ms: i64) -> Vec<AvlReport> {
        let step = interval_ms.max(1);
        let mut reports = Vec::new();
        let mut time_ms = from_ms;
        while time_ms <= to_ms {
            if let Some(report) = self.report_at(plan, time_ms) {
                reports.push(report);
            }
            time_ms += step;
        }
        reports
    }

    /// Fixes over the whole plan.
    pub fn full_feed(&mut self, plan: &VehiclePlan, interval_ms: i64) -> Vec<AvlReport> {
        match (plan.start_ms(), plan.end_ms()) {
            (Some(start), Some(end)) => self.reports(plan, start, end, interval_ms),
            _ => Vec::new(),
        }
    }
}
