//! Real-time schedule adherence.
//!
//! Both functions return a [`TemporalDifference`] where positive means the
//! vehicle is early, matching the temporal matcher.

use crate::service_time::MS_PER_SEC;
use crate::spatial_match::SpatialMatch;
use crate::temporal::TemporalDifference;
use crate::travel_times::TravelTimes;
use tracing::debug;

/// Adherence at the current stop if it has a departure time, else expected
/// at the next stop that has a schedule time. `None` for unscheduled trips
/// or when no later stop on the trip is timed.
pub fn real_time_adherence(
    vehicle_id: &str,
    m: &SpatialMatch,
    avl_time_ms: i64,
    travel_times: &TravelTimes,
) -> Option<TemporalDifference> {
    let clock = m.block().clock;

    if let Some(at_stop) = m.at_stop() {
        let departure = at_stop.indices().schedule_time().and_then(|s| s.departure_secs);
        if let Some(departure_secs) = departure {
            let departure_ms = clock.epoch_time(departure_secs, avl_time_ms);
            // Before departure at a wait stop the vehicle is exactly on time
            if at_stop.is_wait_stop() && avl_time_ms < departure_ms {
                debug!(vehicle_id, "at wait stop before departure, adherence 0");
                return Some(TemporalDifference::ON_TIME);
            }
            let adherence = TemporalDifference::new(departure_ms - avl_time_ms);
            debug!(vehicle_id, %adherence, "adherence at stop");
            return Some(adherence);
        }
    }

    let at_next = m.match_at_next_stop_with_schedule_time()?;
    let schedule = at_next.indices().schedule_time()?;
    let mut travel = travel_times.between_matches(vehicle_id, avl_time_ms, m, &at_next);
    if schedule.departure_secs.is_some() {
        travel += at_next.indices().stop_time_for_path();
    }
    let scheduled_ms = clock.epoch_time(schedule.time()?, avl_time_ms);
    let adherence = TemporalDifference::new(scheduled_ms - (avl_time_ms + travel));
    debug!(vehicle_id, %adherence, "adherence expected at next timed stop");
    Some(adherence)
}

/// Adherence interpolated linearly between the surrounding timed stops.
/// Before a trip starts the vehicle is on time, unless the previous trip
/// should already have ended.
pub fn effective_schedule_difference(vehicle_id: &str, m: &SpatialMatch) -> Option<TemporalDifference> {
    let trip = m.trip()?;
    let clock = m.block().clock;
    let avl_time_ms = m.avl_time_ms();
    let next = m.stop_path_index();

    if next < 1 {
        let start_ms = clock.epoch_time(trip.schedule_time(0)?.time()?, avl_time_ms);
        let mut late = avl_time_ms - start_ms;
        if late < 0 {
            late = 0;
            if let Some(previous_trip) = m.block().trip(m.trip_index() - 1) {
                let end_ms = clock.epoch_time(previous_trip.end_time_secs, avl_time_ms);
                late = (avl_time_ms - end_ms).min(0);
            }
        }
        debug!(vehicle_id, late, "effective adherence before trip start");
        return Some(TemporalDifference::new(-late));
    }

    if let Some(at_stop) = m.at_stop() {
        let secs = at_stop.indices().schedule_time()?.time()?;
        let scheduled_ms = clock.epoch_time(secs, avl_time_ms);
        return Some(TemporalDifference::new(scheduled_ms - avl_time_ms));
    }

    let from = trip.schedule_time(next - 1)?.time()? as f64;
    let to = trip.schedule_time(next)?.time()? as f64;
    let length = m.stop_path().map(|p| p.length).unwrap_or(0.0);
    let ratio = if length > 0.0 {
        m.distance_along_stop_path() / length
    } else {
        1.0
    };
    let effective_secs = (from + (to - from) * ratio) as i32;
    let effective_ms = clock.epoch_time(effective_secs, avl_time_ms);
    let difference = TemporalDifference::new(effective_ms - avl_time_ms);
    debug!(vehicle_id, %difference, "interpolated effective adherence");
    Some(difference)
}

/// True if `adherence` is outside the given early/late allowances (seconds).
pub fn is_outside(adherence: &TemporalDifference, allowable_early_secs: i64, allowable_late_secs: i64) -> bool {
    adherence.early() > allowable_early_secs * MS_PER_SEC || adherence.late() > allowable_late_secs * MS_PER_SEC
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticConfig;
    use crate::indices::tests::two_trip_block;
    use crate::indices::Indices;
    use std::sync::Arc;

    const DAY: i64 = 1_704_067_200_000;

    fn travel_times() -> TravelTimes {
        TravelTimes::new(Arc::new(StaticConfig::default()))
    }

    #[test]
    fn test_adherence_between_stops() {
        let block = two_trip_block();
        // Halfway along path 2 of t1 (300m, 60s), 30s travel to s2 which is
        // scheduled at 08:02
        let avl = DAY + 8 * 3_600_000 + 60_000;
        let m = SpatialMatch::new(avl, Indices::new(block, 0, 2, 1).unwrap(), 1.0, 50.0);
        let adherence = real_time_adherence("v1", &m, avl, &travel_times()).unwrap();
        // Expected at s2 at 08:01:30 vs 08:02 scheduled: 30s early
        assert!((adherence.msecs() - 30_000).abs() <= 1);
    }

    #[test]
    fn test_adherence_at_stop_is_late_after_departure() {
        let block = two_trip_block();
        // At s1 (end of path 1, scheduled 08:01) two minutes late
        let avl = DAY + 8 * 3_600_000 + 180_000;
        let m = SpatialMatch::new(avl, Indices::new(block, 0, 1, 1).unwrap(), 1.0, 95.0);
        assert!(m.at_stop().is_some());
        let adherence = real_time_adherence("v1", &m, avl, &travel_times()).unwrap();
        assert_eq!(adherence.msecs(), -120_000);
        assert!(is_outside(&adherence, 900, 60));
        assert!(!is_outside(&adherence, 900, 300));
    }

    #[test]
    fn test_effective_difference_interpolates() {
        let block = two_trip_block();
        // Path 2 runs from s1 (08:01) to s2 (08:02). 150m of 300m in is 08:01:30
        let avl = DAY + 8 * 3_600_000 + 90_000;
        let m = SpatialMatch::new(avl, Indices::new(block, 0, 2, 1).unwrap(), 1.0, 50.0);
        let d = effective_schedule_difference("v1", &m).unwrap();
        assert!(d.msecs().abs() <= 1000);
    }

    #[test]
    fn test_effective_difference_before_trip_start_is_on_time() {
        let block = two_trip_block();
        let avl = DAY + 7 * 3_600_000;
        let m = SpatialMatch::new(avl, Indices::new(block, 0, 0, 0).unwrap(), 1.0, 0.0);
        assert_eq!(effective_schedule_difference("v1", &m), Some(TemporalDifference::ON_TIME));
    }
}
