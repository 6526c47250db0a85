//! Inbound vehicle location reports.

use crate::geo::Location;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;

/// Stable vehicle key; cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VehicleId(Arc<str>);

impl VehicleId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VehicleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VehicleId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for VehicleId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl Serialize for VehicleId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for VehicleId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(VehicleId::from)
    }
}

/// What an assignment hint refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentType {
    Block,
    Route,
    Trip,
    /// Set internally when a stale assignment is being held over
    Previous,
}

/// Externally supplied assignment hint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Assignment {
    pub kind: AssignmentType,
    pub id: String,
}

impl Assignment {
    pub fn block(id: impl Into<String>) -> Self {
        Self {
            kind: AssignmentType::Block,
            id: id.into(),
        }
    }

    pub fn route(id: impl Into<String>) -> Self {
        Self {
            kind: AssignmentType::Route,
            id: id.into(),
        }
    }

    pub fn trip(id: impl Into<String>) -> Self {
        Self {
            kind: AssignmentType::Trip,
            id: id.into(),
        }
    }
}

/// One vehicle location fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvlReport {
    pub vehicle_id: VehicleId,
    /// Epoch milliseconds of the fix
    pub time_ms: i64,
    pub location: Location,
    /// Degrees clockwise from north, `None` when the device has no heading
    #[serde(default)]
    pub heading: Option<f32>,
    /// m/s
    #[serde(default)]
    pub speed: Option<f32>,
    #[serde(default)]
    pub assignment: Option<Assignment>,
    /// Placeholder report synthesized from the schedule, not a real fix
    #[serde(default)]
    pub for_sched_based_preds: bool,
    /// Lead vehicle when running as part of a multi-vehicle consist
    #[serde(default)]
    pub lead_vehicle_id: Option<VehicleId>,
}

impl AvlReport {
    pub fn new(vehicle_id: impl Into<VehicleId>, time_ms: i64, location: Location) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            time_ms,
            location,
            heading: None,
            speed: None,
            assignment: None,
            for_sched_based_preds: false,
            lead_vehicle_id: None,
        }
    }

    pub fn with_heading(mut self, heading: f32) -> Self {
        self.heading = Some(heading);
        self
    }

    pub fn with_assignment(mut self, assignment: Assignment) -> Self {
        self.assignment = Some(assignment);
        self
    }

    pub fn has_valid_assignment(&self) -> bool {
        self.assignment
            .as_ref()
            .map(|a| a.kind != AssignmentType::Previous && !a.id.is_empty())
            .unwrap_or(false)
    }

    /// Non-lead members of a consist are not processed.
    pub fn ignore_because_in_consist(&self) -> bool {
        matches!(&self.lead_vehicle_id, Some(lead) if *lead != self.vehicle_id)
    }
}

/// External knowledge of cancelled trips.
pub trait TripCancellations: Send + Sync {
    fn is_cancelled(&self, trip_id: &str) -> bool;
}

/// Nothing is ever cancelled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCancellations;

impl TripCancellations for NoCancellations {
    fn is_cancelled(&self, _trip_id: &str) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_json() {
        let json = r#"{"vehicle_id": "v1", "time_ms": 1000,
            "location": {"lat": 37.0, "lon": -122.0},
            "assignment": {"kind": "block", "id": "b1"}}"#;
        let report: AvlReport = serde_json::from_str(json).unwrap();
        assert_eq!(report.vehicle_id.as_str(), "v1");
        assert_eq!(report.heading, None);
        assert!(report.has_valid_assignment());
        assert!(!report.ignore_because_in_consist());
    }

    #[test]
    fn test_consist_membership() {
        let mut report = AvlReport::new("v2", 0, Location::new(0.0, 0.0));
        report.lead_vehicle_id = Some(VehicleId::new("v2"));
        assert!(!report.ignore_because_in_consist());
        report.lead_vehicle_id = Some(VehicleId::new("v1"));
        assert!(report.ignore_because_in_consist());
    }

    #[test]
    fn test_previous_assignment_not_valid() {
        let mut report = AvlReport::new("v", 0, Location::new(0.0, 0.0));
        report.assignment = Some(Assignment {
            kind: AssignmentType::Previous,
            id: "b1".into(),
        });
        assert!(!report.has_valid_assignment());
    }
}
