//! Automatic block assignment for vehicles the feed gives no usable
//! assignment.
//!
//! A vehicle is only auto-assigned when exactly one active block explains
//! both its current fix and an earlier fix far enough away to show it is
//! moving in service.

use crate::avl_report::{AvlReport, VehicleId};
use crate::config::{ConfigProvider, CoreConfig};
use crate::reference::{Block, ReferenceSnapshot};
use crate::service_time::MS_PER_SEC;
use crate::spatial_matcher::SpatialMatcher;
use crate::temporal::{TemporalDifference, TemporalMatch};
use crate::temporal_matcher::TemporalMatcher;
use crate::travel_times::TravelTimes;
use crate::vehicle_manager::VehicleStateManager;
use crate::vehicle_state::VehicleState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

pub trait AutoAssigner: Send + Sync {
    /// Best match to an available block, or `None` when the vehicle cannot
    /// be assigned unambiguously. `manager` is only consulted for block
    /// holders; no other vehicle's state is locked.
    fn auto_assign(
        &self,
        state: &VehicleState,
        snapshot: &dyn ReferenceSnapshot,
        manager: &VehicleStateManager,
    ) -> Option<TemporalMatch>;
}

/// Never assigns anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledAutoAssigner;

impl AutoAssigner for DisabledAutoAssigner {
    fn auto_assign(
        &self,
        _state: &VehicleState,
        _snapshot: &dyn ReferenceSnapshot,
        _manager: &VehicleStateManager,
    ) -> Option<TemporalMatch> {
        None
    }
}

// ============================================================================
// SCHEDULE AUTO ASSIGNER
// ============================================================================

/// Tunables for [`ScheduleAutoAssigner`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoAssignerConfig {
    /// Earlier fix must be this far from the current one (default: 100)
    pub min_distance_from_current_report: f64,

    /// How early a vehicle may be and still be assigned (default: 180)
    pub allowable_early_secs: i64,

    /// How late a vehicle may be and still be assigned (default: 300)
    pub allowable_late_secs: i64,

    /// Per-vehicle throttle between attempts (default: 30)
    pub min_time_between_auto_assigning_secs: i64,
}

impl Default for AutoAssignerConfig {
    fn default() -> Self {
        Self {
            min_distance_from_current_report: 100.0,
            allowable_early_secs: 3 * 60,
            allowable_late_secs: 5 * 60,
            min_time_between_auto_assigning_secs: 30,
        }
    }
}

/// Matches against every active block nobody else holds.
pub struct ScheduleAutoAssigner {
    config: Arc<dyn ConfigProvider>,
    settings: AutoAssignerConfig,
    spatial: SpatialMatcher,
    temporal: TemporalMatcher,
    travel_times: Arc<TravelTimes>,
    last_attempt_ms: Mutex<HashMap<VehicleId, i64>>,
}

impl ScheduleAutoAssigner {
    pub fn new(config: Arc<dyn ConfigProvider>, settings: AutoAssignerConfig) -> Self {
        let travel_times = Arc::new(TravelTimes::new(Arc::clone(&config)));
        Self {
            spatial: SpatialMatcher::new(Arc::clone(&config)),
            temporal: TemporalMatcher::new(Arc::clone(&config), Arc::clone(&travel_times)),
            config,
            settings,
            travel_times,
            last_attempt_ms: Mutex::new(HashMap::new()),
        }
    }

    /// Records the attempt unless the previous one was too recent.
    fn too_recent(&self, vehicle_id: &VehicleId, time_ms: i64) -> bool {
        let mut last = self.last_attempt_ms.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(&previous) = last.get(vehicle_id) {
            if (time_ms - previous) / MS_PER_SEC < self.settings.min_time_between_auto_assigning_secs {
                debug!(%vehicle_id, "auto assigned too recently");
                return true;
            }
        }
        last.insert(vehicle_id.clone(), time_ms);
        false
    }

    fn active_trips(config: &CoreConfig, report: &AvlReport, block: &Block) -> Vec<i32> {
        block.trips_currently_active(report.time_ms, config.allowable_early_for_layover_secs, config.allowable_late_secs)
    }

    fn within_bounds(&self, difference: &TemporalDifference) -> bool {
        difference.is_within(self.settings.allowable_early_secs, self.settings.allowable_late_secs)
    }

    /// Best schedule match of one fix to the block, if within bounds.
    fn best_temporal_match(&self, config: &CoreConfig, report: &AvlReport, block: &Arc<Block>) -> Option<TemporalMatch> {
        let trips = Self::active_trips(config, report, block);
        let candidates = self.spatial.spatial_matches_for_auto_assigning(report, block, &trips);
        let best = self
            .temporal
            .best_temporal_match_compared_to_schedule(report, &candidates, false)?;
        if !self.within_bounds(&best.temporal_difference()) {
            debug!(
                vehicle_id = %report.vehicle_id,
                block_id = %block.id,
                difference = %best.temporal_difference(),
                "auto assign match outside bounds"
            );
            return None;
        }
        Some(best)
    }

    /// Both fixes must match and the earlier one must not be ahead.
    fn best_schedule_match(
        &self,
        config: &CoreConfig,
        report: &AvlReport,
        previous: &AvlReport,
        block: &Arc<Block>,
    ) -> Option<TemporalMatch> {
        let best = self.best_temporal_match(config, report, block)?;
        let previous_best = self.best_temporal_match(config, previous, block)?;
        previous_best.less_than_or_equal_to(&best).then_some(best)
    }

    /// Frequency blocks have no schedule to compare with, so the travel
    /// between the two fixes is compared with the expected travel instead.
    fn best_no_schedule_match(
        &self,
        config: &CoreConfig,
        report: &AvlReport,
        previous: &AvlReport,
        block: &Arc<Block>,
    ) -> Option<TemporalMatch> {
        let trips = Self::active_trips(config, report, block);
        let current = self.spatial.spatial_matches_for_auto_assigning(report, block, &trips);
        if current.is_empty() {
            return None;
        }
        let earlier = self.spatial.spatial_matches_for_auto_assigning(previous, block, &trips);
        let elapsed = report.time_ms - previous.time_ms;

        let mut best: Option<TemporalMatch> = None;
        for p in &earlier {
            for m in &current {
                let expected = self
                    .travel_times
                    .between_matches(report.vehicle_id.as_str(), previous.time_ms, p, m);
                let difference = TemporalDifference::new(expected - elapsed);
                if !self.within_bounds(&difference) {
                    continue;
                }
                if difference.better_than(best.as_ref().map(|b| b.temporal_difference()).as_ref(), config) {
                    best = Some(TemporalMatch::new(m.clone(), difference));
                }
            }
        }
        best
    }
}

impl AutoAssigner for ScheduleAutoAssigner {
    fn auto_assign(
        &self,
        state: &VehicleState,
        snapshot: &dyn ReferenceSnapshot,
        manager: &VehicleStateManager,
    ) -> Option<TemporalMatch> {
        let report = state.avl_report()?;
        if report.for_sched_based_preds || self.too_recent(&report.vehicle_id, report.time_ms) {
            return None;
        }
        let Some(previous) = state.previous_avl_report_by_distance(self.settings.min_distance_from_current_report) else {
            debug!(vehicle_id = %report.vehicle_id, "no earlier fix far enough away to auto assign");
            return None;
        };
        let config = self.config.current();

        let blocks: Vec<Arc<Block>> = snapshot
            .active_blocks(report.time_ms, config.allowable_early_for_layover_secs)
            .into_iter()
            .filter(|b| {
                !config.exclusive_block_assignments
                    || manager
                        .vehicles_for_block(&(b.service_id.clone(), b.id.clone()))
                        .iter()
                        .all(|holder| *holder == report.vehicle_id)
            })
            .collect();
        debug!(vehicle_id = %report.vehicle_id, blocks = blocks.len(), "auto assign examining blocks");

        let matches: Vec<TemporalMatch> = blocks
            .iter()
            .filter_map(|block| {
                if block.no_schedule() {
                    self.best_no_schedule_match(&config, report, previous, block)
                } else {
                    self.best_schedule_match(&config, report, previous, block)
                }
            })
            .collect();

        match matches.len() {
            0 => None,
            1 => {
                let m = matches.into_iter().next()?;
                info!(vehicle_id = %report.vehicle_id, block_id = %m.block().id, "auto assigned");
                Some(m)
            }
            n => {
                debug!(vehicle_id = %report.vehicle_id, matches = n, "ambiguous auto assignment");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticConfig;
    use crate::geo::Location;
    use crate::indices::tests::straight_trip;
    use crate::reference::InMemorySnapshot;
    use crate::service_time::ServiceClock;

    const DAY: i64 = 1_704_067_200_000;
    const HOUR: i64 = 3_600_000;

    fn origin() -> Location {
        Location::new(37.0, -122.0)
    }

    fn snapshot() -> InMemorySnapshot {
        // 1000 m, one stop a minute from 8:00
        let trip = straight_trip("t1", 8 * 3600, &[1, 3, 3, 3], false);
        let block = Block::new("b1", "svc", vec![Arc::new(trip)], ServiceClock::new(0)).unwrap();
        InMemorySnapshot::new(ServiceClock::new(0), vec![], vec![], vec![block]).unwrap()
    }

    fn assigner() -> ScheduleAutoAssigner {
        ScheduleAutoAssigner::new(Arc::new(StaticConfig::default()), AutoAssignerConfig::default())
    }

    fn state_with(reports: &[(f64, i64)]) -> VehicleState {
        let mut state = VehicleState::new(VehicleId::new("v1"), 5, 5);
        for &(east, time_ms) in reports {
            state.set_avl_report(AvlReport::new("v1", time_ms, origin().offset(east, 0.0)).with_heading(90.0));
        }
        state
    }

    #[test]
    fn test_disabled_never_assigns() {
        let state = state_with(&[(150.0, DAY + 8 * HOUR + 90_000)]);
        let manager = VehicleStateManager::new();
        assert!(DisabledAutoAssigner.auto_assign(&state, &snapshot(), &manager).is_none());
    }

    #[test]
    fn test_moving_vehicle_is_assigned() {
        // Path 2 runs from 100 m to 400 m between 8:01 and 8:02
        let state = state_with(&[(150.0, DAY + 8 * HOUR + 70_000), (350.0, DAY + 8 * HOUR + 110_000)]);
        let manager = VehicleStateManager::new();
        let m = assigner().auto_assign(&state, &snapshot(), &manager).expect("assigned");
        assert_eq!(m.block().id, "b1");
    }

    #[test]
    fn test_needs_an_earlier_fix_far_enough_away() {
        let state = state_with(&[(340.0, DAY + 8 * HOUR + 108_000), (350.0, DAY + 8 * HOUR + 110_000)]);
        let manager = VehicleStateManager::new();
        assert!(assigner().auto_assign(&state, &snapshot(), &manager).is_none());
    }

    #[test]
    fn test_held_block_is_skipped() {
        let state = state_with(&[(150.0, DAY + 8 * HOUR + 70_000), (350.0, DAY + 8 * HOUR + 110_000)]);
        let manager = VehicleStateManager::new();
        manager.set_block_holder(("svc".to_string(), "b1".to_string()), &VehicleId::new("v2"));
        assert!(assigner().auto_assign(&state, &snapshot(), &manager).is_none());
    }

    #[test]
    fn test_attempts_are_throttled() {
        let assigner = assigner();
        let v = VehicleId::new("v1");
        assert!(!assigner.too_recent(&v, 0));
        assert!(assigner.too_recent(&v, 10_000));
        assert!(!assigner.too_recent(&v, 31_000));
    }
}
