//! Geometry primitives: locations and directed path segments.
//!
//! Distances between arbitrary points use the haversine formula (`geo`).
//! Point-to-segment matching projects into a local east/north plane centred
//! on the segment start (`nalgebra::Vector2`), which is accurate to well
//! under a meter at the few-hundred-meter scale of a stop path segment.

use geo::{HaversineBearing, HaversineDistance, Point};
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

/// Mean earth radius in meters (same constant `geo` uses).
const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// A WGS84 position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

impl Location {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    fn point(&self) -> Point<f64> {
        Point::new(self.lon, self.lat)
    }

    /// Great-circle distance in meters.
    pub fn distance(&self, other: &Location) -> f64 {
        self.point().haversine_distance(&other.point())
    }

    /// Initial bearing towards `other` in degrees, normalized to [0, 360).
    pub fn bearing_to(&self, other: &Location) -> f32 {
        let b = self.point().haversine_bearing(other.point());
        (b.rem_euclid(360.0)) as f32
    }

    /// Offsets this location by meters east/north (small-distance approximation).
    pub fn offset(&self, east_m: f64, north_m: f64) -> Location {
        let dlat = (north_m / EARTH_RADIUS_M).to_degrees();
        let dlon = (east_m / (EARTH_RADIUS_M * self.lat.to_radians().cos())).to_degrees();
        Location::new(self.lat + dlat, self.lon + dlon)
    }

    /// East/north meters of `self` relative to `origin`.
    fn local_xy(&self, origin: &Location) -> Vector2<f64> {
        let x = (self.lon - origin.lon).to_radians() * EARTH_RADIUS_M * origin.lat.to_radians().cos();
        let y = (self.lat - origin.lat).to_radians() * EARTH_RADIUS_M;
        Vector2::new(x, y)
    }
}

/// Where a point falls relative to a segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentProjection {
    /// Perpendicular (or end-point) distance in meters
    pub distance: f64,
    /// Distance along the segment to the foot of the projection, clamped to [0, length]
    pub along: f64,
}

/// A directed vector between two path points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: Location,
    pub end: Location,
    /// Planar length in meters
    pub length: f64,
    /// Direction of travel in degrees, `None` for a degenerate (zero-length) segment
    pub heading: Option<f32>,
}

impl Segment {
    pub fn new(start: Location, end: Location) -> Self {
        let length = end.local_xy(&start).norm();
        let heading = if length > 0.0 {
            Some(start.bearing_to(&end))
        } else {
            None
        };
        Self {
            start,
            end,
            length,
            heading,
        }
    }

    /// Projects `loc` onto the segment.
    pub fn project(&self, loc: &Location) -> SegmentProjection {
        let p = loc.local_xy(&self.start);
        if self.length <= 0.0 {
            return SegmentProjection {
                distance: p.norm(),
                along: 0.0,
            };
        }

        let v = self.end.local_xy(&self.start);
        let t = (p.dot(&v) / v.norm_squared()).clamp(0.0, 1.0);
        let foot = v * t;
        SegmentProjection {
            distance: (p - foot).norm(),
            along: t * self.length,
        }
    }

    /// Distance in meters from `loc` to the nearest point of the segment.
    pub fn distance_to(&self, loc: &Location) -> f64 {
        self.project(loc).distance
    }

    /// Location `distance` meters along the segment.
    pub fn location_along(&self, distance: f64) -> Location {
        if self.length <= 0.0 {
            return self.start;
        }
        let f = (distance / self.length).clamp(0.0, 1.0);
        Location::new(
            self.start.lat + f * (self.end.lat - self.start.lat),
            self.start.lon + f * (self.end.lon - self.start.lon),
        )
    }

    /// True if `vehicle_heading` agrees with the segment within `allowable_delta` degrees.
    ///
    /// Unknown headings (vehicle or segment) always agree.
    pub fn heading_ok(&self, vehicle_heading: Option<f32>, allowable_delta: f32) -> bool {
        match (vehicle_heading, self.heading) {
            (Some(v), Some(s)) => heading_delta(v, s) < allowable_delta,
            _ => true,
        }
    }
}

/// Smallest absolute angle between two headings in degrees.
pub fn heading_delta(a: f32, b: f32) -> f32 {
    let delta = (a - b).abs() % 360.0;
    if delta > 180.0 {
        360.0 - delta
    } else {
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn origin() -> Location {
        Location::new(37.0, -122.0)
    }

    #[test]
    fn test_offset_and_distance_agree() {
        let a = origin();
        let b = a.offset(300.0, 400.0);
        assert_relative_eq!(a.distance(&b), 500.0, epsilon = 0.5);
    }

    #[test]
    fn test_bearing_cardinal() {
        let a = origin();
        assert_relative_eq!(a.bearing_to(&a.offset(0.0, 100.0)), 0.0, epsilon = 0.1);
        assert_relative_eq!(a.bearing_to(&a.offset(100.0, 0.0)), 90.0, epsilon = 0.1);
        assert_relative_eq!(a.bearing_to(&a.offset(-100.0, 0.0)), 270.0, epsilon = 0.1);
    }

    #[test]
    fn test_projection_perpendicular() {
        let a = origin();
        let seg = Segment::new(a, a.offset(200.0, 0.0));
        let proj = seg.project(&a.offset(50.0, 30.0));
        assert_relative_eq!(proj.along, 50.0, epsilon = 0.01);
        assert_relative_eq!(proj.distance, 30.0, epsilon = 0.01);
    }

    #[test]
    fn test_projection_clamps_to_ends() {
        let a = origin();
        let seg = Segment::new(a, a.offset(200.0, 0.0));
        let before = seg.project(&a.offset(-30.0, 40.0));
        assert_relative_eq!(before.along, 0.0);
        assert_relative_eq!(before.distance, 50.0, epsilon = 0.01);

        let after = seg.project(&a.offset(260.0, 0.0));
        assert_relative_eq!(after.along, seg.length, epsilon = 1e-9);
        assert_relative_eq!(after.distance, 60.0, epsilon = 0.01);
    }

    #[test]
    fn test_degenerate_segment() {
        let a = origin();
        let seg = Segment::new(a, a);
        assert_eq!(seg.heading, None);
        assert_eq!(seg.length, 0.0);
        assert_relative_eq!(seg.distance_to(&a.offset(3.0, 4.0)), 5.0, epsilon = 0.01);
        assert!(seg.heading_ok(Some(123.0), 10.0));
    }

    #[test]
    fn test_location_along() {
        let a = origin();
        let b = a.offset(0.0, 100.0);
        let seg = Segment::new(a, b);
        let mid = seg.location_along(50.0);
        assert_relative_eq!(a.distance(&mid), 50.0, epsilon = 0.1);
    }

    #[test]
    fn test_heading_ok_wraps() {
        let a = origin();
        let seg = Segment::new(a, a.offset(0.0, 100.0)); // north
        assert!(seg.heading_ok(Some(355.0), 10.0));
        assert!(seg.heading_ok(Some(5.0), 10.0));
        assert!(!seg.heading_ok(Some(180.0), 10.0));
        assert!(seg.heading_ok(None, 10.0));
        assert_relative_eq!(heading_delta(10.0, 350.0), 20.0);
    }
}
