//! Scenario runner - replays a scenario's feed through the AVL core.
//!
//! Replay is single threaded and driven by the virtual clock: the timeout
//! supervisor is swept on every polling tick between fixes, so a run is a
//! pure function of the scenario and the seed.

use crate::context::SimContext;
use crate::error::SimResult;
use crate::oracle::Oracle;
use crate::scenarios::{ScenarioId, ScenarioSetup};

use avl_core::events::{ArrivalDeparture, StopEventKind};
use avl_core::service_time::MS_PER_SEC;
use avl_core::{
    AvlProcessor, AvlReport, CoreConfig, CoreEvent, StaticConfig, TimeoutSupervisor, VehicleEvent, VehicleId,
    VehicleStateManager,
};
use avl_env::{AvlContext, CollectingSink};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all checks
    pub passed: bool,

    /// AVL reports fed to the core
    pub reports_processed: usize,

    /// Virtual clock when the replay stopped (epoch ms)
    pub final_time_ms: i64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Counts of what the core produced during a replay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioMetrics {
    pub arrivals: u64,
    pub departures: u64,
    pub prediction_sets: u64,
    pub predictions: u64,
    pub matches: u64,
    pub vehicle_events: u64,
    pub state_changes: u64,
    pub timeouts: u64,
    /// Supervisor polling ticks
    pub sweeps: u64,
}

/// Everything a replay produced.
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    /// Records in the order the core emitted them
    pub events: Vec<CoreEvent>,
    /// Feed replayed through the core
    pub reports: Vec<AvlReport>,
    /// Vehicles the supervisor timed out, with the clock at the time
    pub timeouts: Vec<(VehicleId, i64)>,
    pub reports_processed: usize,
    pub sweeps: u64,
    pub final_time_ms: i64,
}

impl Outcome {
    pub fn vehicle_events<'a>(&'a self, vehicle: &'a str) -> impl Iterator<Item = &'a VehicleEvent> + 'a {
        self.events.iter().filter_map(move |e| match e {
            CoreEvent::VehicleEvent(v) if v.vehicle_id.as_str() == vehicle => Some(v),
            _ => None,
        })
    }

    pub fn stop_events<'a>(
        &'a self,
        vehicle: &'a str,
        kind: StopEventKind,
    ) -> impl Iterator<Item = &'a ArrivalDeparture> + 'a {
        self.events.iter().filter_map(move |e| match e {
            CoreEvent::ArrivalDeparture(ad) if ad.vehicle_id.as_str() == vehicle && ad.kind == kind => Some(ad),
            _ => None,
        })
    }

    pub fn metrics(&self) -> ScenarioMetrics {
        let mut metrics = ScenarioMetrics {
            timeouts: self.timeouts.len() as u64,
            sweeps: self.sweeps,
            ..Default::default()
        };
        for event in &self.events {
            match event {
                CoreEvent::ArrivalDeparture(ad) if ad.is_arrival() => metrics.arrivals += 1,
                CoreEvent::ArrivalDeparture(_) => metrics.departures += 1,
                CoreEvent::Predictions(set) => {
                    metrics.prediction_sets += 1;
                    metrics.predictions += set.predictions.len() as u64;
                }
                CoreEvent::Match(_) => metrics.matches += 1,
                CoreEvent::VehicleEvent(_) => metrics.vehicle_events += 1,
                CoreEvent::StateChanged(_) => metrics.state_changes += 1,
            }
        }
        metrics
    }

    /// Properties every replay must satisfy regardless of scenario.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut last_stop_event: HashMap<&VehicleId, i64> = HashMap::new();
        let mut arrivals: HashMap<(&VehicleId, i32, i32), i64> = HashMap::new();

        for event in &self.events {
            match event {
                CoreEvent::ArrivalDeparture(ad) => {
                    if let Some(&previous) = last_stop_event.get(&ad.vehicle_id) {
                        if ad.time_ms < previous {
                            return Err(format!(
                                "{}: {:?} at {} went back in time by {}ms",
                                ad.vehicle_id,
                                ad.kind,
                                ad.stop_id,
                                previous - ad.time_ms
                            ));
                        }
                    }
                    last_stop_event.insert(&ad.vehicle_id, ad.time_ms);

                    let key = (&ad.vehicle_id, ad.trip_index, ad.stop_path_index);
                    match ad.kind {
                        StopEventKind::Arrival => {
                            arrivals.insert(key, ad.time_ms);
                        }
                        StopEventKind::Departure => {
                            if let Some(&arrived) = arrivals.get(&key) {
                                if ad.time_ms < arrived {
                                    return Err(format!(
                                        "{}: departed {} before arriving",
                                        ad.vehicle_id, ad.stop_id
                                    ));
                                }
                            }
                        }
                    }
                }
                CoreEvent::Predictions(set) => {
                    for pair in set.predictions.windows(2) {
                        if pair[1].predicted_time_ms < pair[0].predicted_time_ms {
                            return Err(format!(
                                "{}: prediction for {} earlier than for {}",
                                set.vehicle_id, pair[1].stop_id, pair[0].stop_id
                            ));
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

// ============================================================================
// RUNNER
// ============================================================================

/// Runs replay scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Per-axis GPS noise in meters
    gps_noise_m: f64,

    /// Seconds between fixes from each vehicle
    report_interval_secs: i64,

    /// Core configuration the processor runs with
    config: CoreConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            gps_noise_m: 3.0,
            report_interval_secs: 20,
            config: CoreConfig::default(),
        }
    }

    /// Sets the GPS noise.
    pub fn with_gps_noise(mut self, meters: f64) -> Self {
        self.gps_noise_m = meters;
        self
    }

    /// Sets the reporting interval.
    pub fn with_report_interval(mut self, secs: i64) -> Self {
        self.report_interval_secs = secs.max(1);
        self
    }

    pub fn with_config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.run_with_outcome(scenario).0
    }

    /// Runs a scenario and also returns everything the core emitted.
    pub fn run_with_outcome(&self, scenario: ScenarioId) -> (ScenarioResult, Outcome) {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        // Noise stream is independent of the context seed
        let oracle_seed = self.seed.wrapping_mul(0x9e3779b97f4a7c15);
        let mut oracle = Oracle::new(oracle_seed, self.gps_noise_m);
        let setup = scenario.build(&mut oracle, self.report_interval_secs * MS_PER_SEC);

        let outcome = match self.replay(&setup) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("{}: replay failed: {}", scenario.name(), e);
                let result = ScenarioResult {
                    scenario,
                    seed: self.seed,
                    passed: false,
                    reports_processed: 0,
                    final_time_ms: 0,
                    failure_reason: Some(e.to_string()),
                    metrics: ScenarioMetrics::default(),
                };
                return (result, Outcome::default());
            }
        };

        let failure_reason = outcome
            .check_invariants()
            .and_then(|_| setup.checks.iter().try_for_each(|check| check.evaluate(&outcome)))
            .err();
        let result = ScenarioResult {
            scenario,
            seed: self.seed,
            passed: failure_reason.is_none(),
            reports_processed: outcome.reports_processed,
            final_time_ms: outcome.final_time_ms,
            failure_reason,
            metrics: outcome.metrics(),
        };
        debug!(metrics = ?result.metrics, "scenario finished");
        (result, outcome)
    }

    /// Feeds every report in time order, sweeping the supervisor on each
    /// polling tick in between, then keeps ticking until `end_ms`.
    fn replay(&self, setup: &ScenarioSetup) -> SimResult<Outcome> {
        let ctx = SimContext::shared(self.seed);
        let snapshot = setup.network.build(&self.config)?;
        let sink: Arc<CollectingSink<CoreEvent>> = Arc::new(CollectingSink::new());
        let processor = Arc::new(AvlProcessor::new(
            Arc::new(StaticConfig::new(self.config.clone())),
            Arc::new(snapshot),
            Arc::new(VehicleStateManager::new()),
            sink.clone(),
        ));
        let mut replay = Replay {
            supervisor: TimeoutSupervisor::new(Arc::clone(&processor)),
            processor,
            poll_ms: self.config.timeout_polling_rate_secs.max(1) as i64 * MS_PER_SEC,
            next_sweep_ms: 0,
            outcome: Outcome::default(),
            ctx,
        };

        let start_ms = setup.reports.first().map(|r| r.time_ms).unwrap_or(setup.end_ms);
        replay.ctx.set_epoch_millis(start_ms);
        replay.next_sweep_ms = (start_ms / replay.poll_ms + 1) * replay.poll_ms;

        for report in &setup.reports {
            replay.advance_to(report.time_ms);
            replay.supervisor.store_avl_report(report);
            replay.processor.process_avl_report(report.clone());
            replay.outcome.reports_processed += 1;
        }
        replay.advance_to(setup.end_ms);

        let mut outcome = replay.outcome;
        outcome.reports = setup.reports.clone();
        outcome.final_time_ms = replay.ctx.epoch_millis();
        outcome.events = sink.drain();
        Ok(outcome)
    }
}

struct Replay {
    ctx: Arc<SimContext>,
    processor: Arc<AvlProcessor>,
    supervisor: TimeoutSupervisor,
    poll_ms: i64,
    next_sweep_ms: i64,
    outcome: Outcome,
}

impl Replay {
    /// Runs every polling tick up to and including `until_ms`, then moves
    /// the clock there.
    fn advance_to(&mut self, until_ms: i64) {
        while self.next_sweep_ms <= until_ms {
            self.ctx.set_epoch_millis(self.next_sweep_ms);
            let now_ms = self.ctx.epoch_millis();
            for vehicle_id in self.supervisor.sweep(now_ms) {
                debug!(%vehicle_id, now_ms, "vehicle timed out");
                self.outcome.timeouts.push((vehicle_id, now_ms));
            }
            self.processor.sweep_pending_grabs();
            self.outcome.sweeps += 1;
            self.next_sweep_ms += self.poll_ms;
        }
        self.ctx.set_epoch_millis(until_ms);
    }
}
