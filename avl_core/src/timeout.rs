//! Silence detection.
//!
//! Vehicles that stop reporting are made unpredictable so stale predictions
//! are withdrawn. A vehicle waiting at a terminal is allowed to stay silent
//! until shortly after its scheduled departure; any other vehicle times out
//! after `allowable_no_avl_secs`. Placeholder vehicles driven by the schedule
//! time out when their block ends or well after its start.
//!
//! The supervisor runs off the injected clock so replayed data times out the
//! same way live data does.

use crate::avl_processor::AvlProcessor;
use crate::avl_report::{AvlReport, VehicleId};
use crate::config::CoreConfig;
use crate::events::VehicleEventType;
use crate::service_time::MS_PER_SEC;
use crate::vehicle_manager::lock_state;
use crate::vehicle_state::{BlockAssignmentMethod, VehicleState};
use avl_env::AvlContext;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

const MS_PER_MIN: i64 = 60 * MS_PER_SEC;

/// What to do with a watched vehicle after a sweep.
enum Verdict {
    /// Keep watching
    Keep,
    /// No longer predictable, stop watching
    Forget,
    /// Timed out with the given description
    TimedOut(String),
}

pub struct TimeoutSupervisor {
    processor: Arc<AvlProcessor>,
    /// Time of the last report seen per vehicle
    last_seen: Mutex<HashMap<VehicleId, i64>>,
}

impl TimeoutSupervisor {
    pub fn new(processor: Arc<AvlProcessor>) -> Self {
        Self {
            processor,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Starts (or keeps) watching the report's vehicle.
    pub fn store_avl_report(&self, report: &AvlReport) {
        self.last_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(report.vehicle_id.clone(), report.time_ms);
    }

    pub fn watched(&self) -> usize {
        self.last_seen.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Checks every watched vehicle against `now_ms`. Returns the vehicles
    /// that were timed out, sorted.
    pub fn sweep(&self, now_ms: i64) -> Vec<VehicleId> {
        let config = self.processor.config();
        let watched: Vec<VehicleId> = self
            .last_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();

        let mut forget = Vec::new();
        let mut timed_out = Vec::new();
        for vehicle_id in watched {
            let Some(shared) = self.processor.manager().get(&vehicle_id) else {
                forget.push(vehicle_id);
                continue;
            };
            let mut state = lock_state(&shared);
            match Self::verdict(&state, now_ms, &config) {
                Verdict::Keep => {}
                Verdict::Forget => forget.push(vehicle_id),
                Verdict::TimedOut(description) => {
                    info!(%vehicle_id, %description, "vehicle timed out");
                    self.processor.make_vehicle_unpredictable_and_terminate_assignment(
                        &mut state,
                        VehicleEventType::Timeout,
                        description,
                        BlockAssignmentMethod::VehicleTimedOut,
                    );
                    self.processor.publish_state(&state, &config);
                    forget.push(vehicle_id.clone());
                    timed_out.push(vehicle_id);
                }
            }
        }

        let mut last_seen = self.last_seen.lock().unwrap_or_else(|e| e.into_inner());
        for vehicle_id in &forget {
            last_seen.remove(vehicle_id);
        }
        drop(last_seen);

        timed_out.sort();
        timed_out
    }

    fn verdict(state: &VehicleState, now_ms: i64, config: &CoreConfig) -> Verdict {
        if !state.is_predictable() {
            return Verdict::Forget;
        }
        let Some(last_report_ms) = state.avl_time_ms() else {
            return Verdict::Forget;
        };
        if state.is_for_sched_based_preds() {
            return Self::sched_based_verdict(state, now_ms, config);
        }

        let max_no_avl_ms = config.allowable_no_avl_secs * MS_PER_SEC;
        let silent_ms = now_ms - last_report_ms;
        if state.is_wait_stop() {
            // Frequency blocks have no departure time to compare with
            if state.block().map(|b| b.no_schedule()).unwrap_or(false) {
                debug!(vehicle_id = %state.vehicle_id(), "not timing out frequency based assignment");
                return Verdict::Keep;
            }
            if silent_ms <= max_no_avl_ms {
                return Verdict::Keep;
            }
            let Some(departure_ms) = Self::wait_stop_departure_ms(state) else {
                return Verdict::Keep;
            };
            let after_departure_ms = config.allowable_no_avl_after_sched_depart_secs * MS_PER_SEC;
            if now_ms <= departure_ms + after_departure_ms {
                return Verdict::Keep;
            }
            let stop_id = state
                .current_match()
                .and_then(|m| m.at_stop())
                .map(|a| a.stop_id().to_string())
                .unwrap_or_else(|| "none".to_string());
            return Verdict::TimedOut(format!(
                "Vehicle timed out because it has not reported in {}s and it is {}s since the scheduled departure \
                 for wait stop {} while {}s is allowed after departure.",
                silent_ms / MS_PER_SEC,
                (now_ms - departure_ms) / MS_PER_SEC,
                stop_id,
                config.allowable_no_avl_after_sched_depart_secs
            ));
        }

        if silent_ms > max_no_avl_ms {
            return Verdict::TimedOut(format!(
                "Vehicle timed out because it has not reported in {}s while allowable time without a report is {}s.",
                silent_ms / MS_PER_SEC,
                config.allowable_no_avl_secs
            ));
        }
        Verdict::Keep
    }

    /// Scheduled departure of the wait stop the vehicle is at.
    fn wait_stop_departure_ms(state: &VehicleState) -> Option<i64> {
        let m = state.current_match()?;
        let at_stop = m.at_stop().filter(|a| a.is_wait_stop())?;
        let departure_secs = at_stop.indices().schedule_time()?.departure_secs?;
        Some(m.block().clock.epoch_time(departure_secs, m.avl_time_ms()))
    }

    /// Placeholder vehicles go away once the block ends, or once the block
    /// start is long past without a real vehicle taking over.
    fn sched_based_verdict(state: &VehicleState, now_ms: i64, config: &CoreConfig) -> Verdict {
        let Some(block) = state.block() else {
            return Verdict::Forget;
        };
        if !block.is_active(now_ms, config.sched_based_before_start_minutes * 60) {
            return Verdict::TimedOut(format!(
                "Schedule based predictions removed for block {} because the block is no longer active.",
                block.id
            ));
        }
        if config.sched_based_after_start_minutes < 0 {
            return Verdict::Keep;
        }
        let Some(departure_ms) = Self::wait_stop_departure_ms(state) else {
            return Verdict::Keep;
        };
        let allowed_ms = config.sched_based_after_start_minutes * MS_PER_MIN;
        if now_ms > departure_ms + allowed_ms {
            return Verdict::TimedOut(format!(
                "Schedule based predictions removed for block {} because it is {}s past the scheduled start.",
                block.id,
                (now_ms - departure_ms) / MS_PER_SEC
            ));
        }
        Verdict::Keep
    }

    /// Sweeps forever at the configured polling rate, reading time from the
    /// context. Deferred block revocations are applied on each pass.
    pub async fn run<C: AvlContext>(self: Arc<Self>, ctx: Arc<C>) {
        info!("timeout supervisor started");
        loop {
            let polling = Duration::from_secs(self.processor.config().timeout_polling_rate_secs.max(1));
            ctx.sleep(polling).await;

            let timed_out = self.sweep(ctx.epoch_millis());
            if !timed_out.is_empty() {
                debug!(count = timed_out.len(), "timeout sweep");
            }
            self.processor.sweep_pending_grabs();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avl_report::Assignment;
    use crate::config::StaticConfig;
    use crate::events::CoreEvent;
    use crate::geo::Location;
    use crate::indices::tests::straight_trip;
    use crate::reference::{Block, InMemorySnapshot, Trip};
    use crate::service_time::ServiceClock;
    use crate::vehicle_manager::VehicleStateManager;
    use async_trait::async_trait;
    use avl_env::CollectingSink;
    use std::future::Future;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    const DAY: i64 = 1_704_067_200_000;
    const T8: i64 = DAY + 8 * 3_600_000;

    /// Trip without a layover whose stop at 300 m is a wait stop departing
    /// at 8:01.
    fn waiting_trip() -> Trip {
        let mut trip = straight_trip("t1", 8 * 3600, &[1, 3, 3, 3], false);
        let stub = trip.stop_paths[0].as_ref().clone().with_layover(false);
        let first = trip.stop_paths[1].as_ref().clone().with_wait_stop(true);
        trip.stop_paths[0] = Arc::new(stub);
        trip.stop_paths[1] = Arc::new(first);
        trip
    }

    fn harness(trip: Trip) -> (Arc<AvlProcessor>, TimeoutSupervisor, Arc<CollectingSink<CoreEvent>>) {
        let block = Block::new("b1", "svc", vec![Arc::new(trip)], ServiceClock::new(0)).unwrap();
        let snapshot = InMemorySnapshot::new(ServiceClock::new(0), vec![], vec![], vec![block]).unwrap();
        let sink: Arc<CollectingSink<CoreEvent>> = Arc::new(CollectingSink::new());
        let processor = Arc::new(AvlProcessor::new(
            Arc::new(StaticConfig::default()),
            Arc::new(snapshot),
            Arc::new(VehicleStateManager::new()),
            sink.clone(),
        ));
        let supervisor = TimeoutSupervisor::new(Arc::clone(&processor));
        (processor, supervisor, sink)
    }

    fn report(east: f64, time_ms: i64) -> AvlReport {
        AvlReport::new("v1", time_ms, Location::new(37.0, -122.0).offset(east, 0.0))
            .with_heading(90.0)
            .with_assignment(Assignment::block("b1"))
    }

    fn feed(processor: &AvlProcessor, supervisor: &TimeoutSupervisor, report: AvlReport) {
        supervisor.store_avl_report(&report);
        processor.process_avl_report(report);
    }

    fn predictable(processor: &AvlProcessor) -> bool {
        let shared = processor.manager().get(&VehicleId::new("v1")).expect("state");
        let predictable = lock_state(&shared).is_predictable();
        predictable
    }

    fn timeout_events(sink: &CollectingSink<CoreEvent>) -> usize {
        sink.items()
            .iter()
            .filter(|e| matches!(e, CoreEvent::VehicleEvent(v) if v.kind == VehicleEventType::Timeout))
            .count()
    }

    #[test]
    fn test_mid_route_vehicle_times_out_after_allowable_silence() {
        let (processor, supervisor, sink) = harness(straight_trip("t1", 8 * 3600, &[1, 3, 3, 3], false));
        feed(&processor, &supervisor, report(250.0, T8 + 90_000));
        assert!(predictable(&processor));

        assert!(supervisor.sweep(T8 + 90_000 + 6 * 60_000).is_empty());
        assert!(predictable(&processor));

        assert_eq!(supervisor.sweep(T8 + 90_000 + 6 * 60_000 + 1), vec![VehicleId::new("v1")]);
        assert!(!predictable(&processor));
        assert_eq!(timeout_events(&sink), 1);
        assert_eq!(supervisor.watched(), 0);
    }

    #[test]
    fn test_vehicle_at_terminal_waits_for_departure() {
        let (processor, supervisor, _sink) = harness(waiting_trip());
        // At the wait stop, before its 8:01 departure
        feed(&processor, &supervisor, report(300.0, T8 + 20_000));
        assert!(predictable(&processor));

        // Silent longer than a vehicle out on the route may be, but still
        // within the allowance after departure
        assert!(supervisor.sweep(T8 + 400_000).is_empty());
        assert!(predictable(&processor));

        assert_eq!(supervisor.sweep(T8 + 421_000), vec![VehicleId::new("v1")]);
        assert!(!predictable(&processor));
    }

    #[test]
    fn test_unpredictable_vehicles_are_forgotten() {
        let (processor, supervisor, sink) = harness(straight_trip("t1", 8 * 3600, &[1, 3, 3, 3], false));
        let unmatched = AvlReport::new("v1", T8, Location::new(38.0, -122.0));
        feed(&processor, &supervisor, unmatched);
        assert_eq!(supervisor.watched(), 1);
        assert!(supervisor.sweep(T8 + 3_600_000).is_empty());
        assert_eq!(supervisor.watched(), 0);
        assert_eq!(timeout_events(&sink), 0);
    }

    /// Clock that jumps forward by whatever it is asked to sleep.
    struct ReplayClock {
        epoch_ms: AtomicI64,
    }

    #[async_trait]
    impl AvlContext for ReplayClock {
        fn now(&self) -> Duration {
            Duration::from_millis(self.epoch_ms.load(Ordering::SeqCst) as u64)
        }

        fn system_time(&self) -> SystemTime {
            UNIX_EPOCH + self.now()
        }

        async fn sleep(&self, duration: Duration) {
            self.epoch_ms.fetch_add(duration.as_millis() as i64, Ordering::SeqCst);
            tokio::task::yield_now().await;
        }

        fn spawn<F>(&self, _name: &str, future: F)
        where
            F: Future<Output = ()> + Send + 'static,
        {
            tokio::spawn(future);
        }
    }

    #[tokio::test]
    async fn test_run_loop_times_out_on_replay_clock() {
        let (processor, supervisor, sink) = harness(straight_trip("t1", 8 * 3600, &[1, 3, 3, 3], false));
        feed(&processor, &supervisor, report(250.0, T8 + 90_000));
        let ctx = Arc::new(ReplayClock {
            epoch_ms: AtomicI64::new(T8 + 90_000),
        });

        let handle = tokio::spawn(Arc::new(supervisor).run(Arc::clone(&ctx)));
        for _ in 0..1000 {
            if timeout_events(&sink) > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        handle.abort();

        assert_eq!(timeout_events(&sink), 1);
        assert!(!predictable(&processor));
        assert!(ctx.epoch_millis() > T8 + 90_000 + 6 * 60_000);
    }
}
