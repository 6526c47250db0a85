//! Async driver.
//!
//! ```text
//!   reports ──► dispatcher ──┬─► lane v1 ──► AvlProcessor ──► sink
//!   (mpsc)                   ├─► lane v2 ──►      │
//!                            └─► lane vN ──►      │
//!                                                 ▼
//!                         TimeoutSupervisor (every timeout_polling_rate_secs)
//! ```
//!
//! Every vehicle gets its own lane so its reports are processed in arrival
//! order while different vehicles proceed in parallel. Tasks are spawned and
//! time is read through the injected [`AvlContext`].

use crate::avl_processor::AvlProcessor;
use crate::avl_report::{AvlReport, VehicleId};
use crate::timeout::TimeoutSupervisor;
use avl_env::AvlContext;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Reports buffered per vehicle lane before the dispatcher waits.
const LANE_CAPACITY: usize = 64;

/// Channel feeding [`AvlRuntime::run`].
pub fn report_channel(capacity: usize) -> (mpsc::Sender<AvlReport>, mpsc::Receiver<AvlReport>) {
    mpsc::channel(capacity)
}

pub struct AvlRuntime<C: AvlContext> {
    ctx: Arc<C>,
    processor: Arc<AvlProcessor>,
    supervisor: Arc<TimeoutSupervisor>,
}

impl<C: AvlContext> AvlRuntime<C> {
    pub fn new(ctx: Arc<C>, processor: Arc<AvlProcessor>) -> Self {
        let supervisor = Arc::new(TimeoutSupervisor::new(Arc::clone(&processor)));
        Self {
            ctx,
            processor,
            supervisor,
        }
    }

    pub fn processor(&self) -> &Arc<AvlProcessor> {
        &self.processor
    }

    pub fn supervisor(&self) -> &Arc<TimeoutSupervisor> {
        &self.supervisor
    }

    /// Starts the timeout supervisor and processes reports until the
    /// channel closes. Returns once every lane has drained; the supervisor
    /// is stopped on the way out.
    pub async fn run(&self, mut reports: mpsc::Receiver<AvlReport>) {
        info!("AVL runtime started");
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let supervisor = Arc::clone(&self.supervisor).run(Arc::clone(&self.ctx));
        self.ctx.spawn("timeout-supervisor", async move {
            tokio::select! {
                _ = supervisor => {}
                _ = stop_rx => debug!("timeout supervisor stopped"),
            }
        });

        // Each lane holds a sender; recv() yields None once all are dropped
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
        let mut lanes: HashMap<VehicleId, mpsc::Sender<AvlReport>> = HashMap::new();
        let mut processed: u64 = 0;

        while let Some(report) = reports.recv().await {
            self.supervisor.store_avl_report(&report);
            let lane = lanes
                .entry(report.vehicle_id.clone())
                .or_insert_with(|| self.open_lane(&report.vehicle_id, done_tx.clone()));
            if let Err(mpsc::error::SendError(report)) = lane.send(report).await {
                // Lane task is gone; process inline rather than lose the fix
                debug!(vehicle_id = %report.vehicle_id, "lane closed, processing inline");
                self.processor.process_avl_report(report);
            }
            processed += 1;
        }

        drop(lanes);
        drop(done_tx);
        let _ = done_rx.recv().await;
        let _ = stop_tx.send(());
        info!(processed, "AVL runtime stopped, report channel closed");
    }

    fn open_lane(&self, vehicle_id: &VehicleId, done: mpsc::Sender<()>) -> mpsc::Sender<AvlReport> {
        debug!(%vehicle_id, "opening vehicle lane");
        let (tx, mut rx) = mpsc::channel::<AvlReport>(LANE_CAPACITY);
        let processor = Arc::clone(&self.processor);
        self.ctx.spawn(&format!("lane-{}", vehicle_id), async move {
            while let Some(report) = rx.recv().await {
                processor.process_avl_report(report);
            }
            drop(done);
        });
        tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avl_report::Assignment;
    use crate::config::StaticConfig;
    use crate::events::{CoreEvent, StopEventKind};
    use crate::geo::Location;
    use crate::indices::tests::straight_trip;
    use crate::reference::{Block, InMemorySnapshot};
    use crate::service_time::ServiceClock;
    use crate::vehicle_manager::{lock_state, VehicleStateManager};
    use avl_env::{CollectingSink, TokioContext};

    const T8: i64 = 1_704_067_200_000 + 8 * 3_600_000;

    fn processor(sink: Arc<CollectingSink<CoreEvent>>) -> Arc<AvlProcessor> {
        let trips = vec![Arc::new(straight_trip("t1", 8 * 3600, &[1, 3, 3, 3], false))];
        let block = Block::new("b1", "svc", trips, ServiceClock::new(0)).unwrap();
        let snapshot = InMemorySnapshot::new(ServiceClock::new(0), vec![], vec![], vec![block]).unwrap();
        Arc::new(AvlProcessor::new(
            Arc::new(StaticConfig::default()),
            Arc::new(snapshot),
            Arc::new(VehicleStateManager::new()),
            sink,
        ))
    }

    fn report(vehicle: &str, east: f64, time_ms: i64) -> AvlReport {
        let report = AvlReport::new(vehicle, time_ms, Location::new(37.0, -122.0).offset(east, 0.0)).with_heading(90.0);
        if vehicle == "v1" {
            report.with_assignment(Assignment::block("b1"))
        } else {
            report
        }
    }

    #[tokio::test]
    async fn test_reports_for_a_vehicle_are_processed_in_order() {
        let sink: Arc<CollectingSink<CoreEvent>> = Arc::new(CollectingSink::new());
        let runtime = AvlRuntime::new(TokioContext::shared(), processor(sink.clone()));
        let (tx, rx) = report_channel(16);

        for (east, secs) in [(250.0, 90), (550.0, 150), (850.0, 210)] {
            tx.send(report("v1", east, T8 + secs * 1000)).await.unwrap();
        }
        tx.send(report("v2", 0.0, T8)).await.unwrap();
        drop(tx);
        runtime.run(rx).await;

        let shared = runtime.processor().manager().get(&VehicleId::new("v1")).unwrap();
        assert!(lock_state(&shared).is_predictable());
        assert_eq!(
            lock_state(&shared).current_match().map(|m| m.avl_time_ms()),
            Some(T8 + 210_000)
        );
        assert_eq!(runtime.processor().manager().len(), 2);
        assert_eq!(runtime.supervisor().watched(), 2);

        let departures: Vec<i32> = sink
            .items()
            .iter()
            .filter_map(|e| match e {
                CoreEvent::ArrivalDeparture(ad) if ad.vehicle_id.as_str() == "v1" && ad.kind == StopEventKind::Departure => {
                    Some(ad.stop_path_index)
                }
                _ => None,
            })
            .collect();
        assert!(departures.windows(2).all(|w| w[0] < w[1]), "{:?}", departures);
    }

    #[tokio::test]
    async fn test_run_returns_when_channel_closes_without_reports() {
        let sink: Arc<CollectingSink<CoreEvent>> = Arc::new(CollectingSink::new());
        let runtime = AvlRuntime::new(TokioContext::shared(), processor(sink.clone()));
        let (tx, rx) = report_channel(1);
        drop(tx);
        runtime.run(rx).await;
        assert!(sink.is_empty());
        assert_eq!(runtime.supervisor().watched(), 0);
    }

    #[tokio::test]
    async fn test_supervisor_task_ends_with_run() {
        let sink: Arc<CollectingSink<CoreEvent>> = Arc::new(CollectingSink::new());
        let runtime = AvlRuntime::new(TokioContext::shared(), processor(sink));
        let (tx, rx) = report_channel(4);
        tx.send(report("v1", 450.0, T8 + 90_000)).await.unwrap();
        drop(tx);
        runtime.run(rx).await;

        // The spawned supervisor holds the only other reference
        for _ in 0..100 {
            if Arc::strong_count(runtime.supervisor()) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(Arc::strong_count(runtime.supervisor()), 1);
    }
}
