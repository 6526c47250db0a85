//! Replay scenarios.
//!
//! Each scenario builds a synthetic network, scripts the ground truth of
//! one or more vehicles, and states what the core must have produced once
//! the feed has been replayed.

use crate::context::SIM_EPOCH_MS;
use crate::network::{default_origin, RouteLayout, SyntheticNetwork, TripPlan};
use crate::oracle::{Oracle, VehiclePlan};
use crate::runner::Outcome;
use avl_core::events::{CoreEvent, StopEventKind};
use avl_core::{Assignment, AvlReport, VehicleEventType};

/// Midnight of the simulated service day.
pub const DAY_START_MS: i64 = SIM_EPOCH_MS;

const MINUTE_MS: i64 = 60_000;

/// 08:00 on the service day.
pub const T8: i64 = DAY_START_MS + 8 * 60 * MINUTE_MS;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioId {
    /// AVL-001: Vehicle runs its trip exactly to schedule
    OnSchedule,

    /// AVL-002: Vehicle leaves the terminal five minutes late
    LateStart,

    /// AVL-003: Vehicle waits at the terminal before departing on time
    Layover,

    /// AVL-004: Vehicle goes silent while waiting at the terminal
    SilentAtTerminal,

    /// AVL-005: Vehicle goes silent in the middle of its trip
    SilentMidRoute,

    /// AVL-006: One wild GPS fix in an otherwise clean feed
    GpsJump,

    /// AVL-007: Two passes around a frequency based loop
    FrequencyLoop,

    /// AVL-008: A second vehicle takes over a block mid trip
    BlockGrab,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::OnSchedule,
            ScenarioId::LateStart,
            ScenarioId::Layover,
            ScenarioId::SilentAtTerminal,
            ScenarioId::SilentMidRoute,
            ScenarioId::GpsJump,
            ScenarioId::FrequencyLoop,
            ScenarioId::BlockGrab,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::OnSchedule => "on_schedule",
            ScenarioId::LateStart => "late_start",
            ScenarioId::Layover => "layover",
            ScenarioId::SilentAtTerminal => "silent_at_terminal",
            ScenarioId::SilentMidRoute => "silent_mid_route",
            ScenarioId::GpsJump => "gps_jump",
            ScenarioId::FrequencyLoop => "frequency_loop",
            ScenarioId::BlockGrab => "block_grab",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::OnSchedule => "Single vehicle on time, arrivals within a minute of schedule",
            ScenarioId::LateStart => "Departs terminal 5 min late, late departure logged and adherence late",
            ScenarioId::Layover => "10 min wait at terminal, no progress alarms, departs on time",
            ScenarioId::SilentAtTerminal => "Silent at terminal, timed out only after scheduled departure + allowance",
            ScenarioId::SilentMidRoute => "Silent mid trip, timed out after the no-AVL allowance",
            ScenarioId::GpsJump => "5 km GPS outlier absorbed without losing the assignment",
            ScenarioId::FrequencyLoop => "No-schedule loop block, arrivals across both passes",
            ScenarioId::BlockGrab => "Second vehicle reports on the block and takes it over",
        }
    }

    /// Builds the network, the AVL feed, and the checks.
    pub fn build(&self, oracle: &mut Oracle, interval_ms: i64) -> ScenarioSetup {
        match self {
            ScenarioId::OnSchedule => on_schedule(oracle, interval_ms),
            ScenarioId::LateStart => late_start(oracle, interval_ms),
            ScenarioId::Layover => layover(oracle, interval_ms),
            ScenarioId::SilentAtTerminal => silent_at_terminal(oracle, interval_ms),
            ScenarioId::SilentMidRoute => silent_mid_route(oracle, interval_ms),
            ScenarioId::GpsJump => gps_jump(oracle, interval_ms),
            ScenarioId::FrequencyLoop => frequency_loop(oracle, interval_ms),
            ScenarioId::BlockGrab => block_grab(oracle, interval_ms),
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "on_schedule" | "onschedule" | "avl-001" => Ok(ScenarioId::OnSchedule),
            "late_start" | "latestart" | "avl-002" => Ok(ScenarioId::LateStart),
            "layover" | "avl-003" => Ok(ScenarioId::Layover),
            "silent_at_terminal" | "silentatterminal" | "avl-004" => Ok(ScenarioId::SilentAtTerminal),
            "silent_mid_route" | "silentmidroute" | "avl-005" => Ok(ScenarioId::SilentMidRoute),
            "gps_jump" | "gpsjump" | "avl-006" => Ok(ScenarioId::GpsJump),
            "frequency_loop" | "frequencyloop" | "avl-007" => Ok(ScenarioId::FrequencyLoop),
            "block_grab" | "blockgrab" | "avl-008" => Ok(ScenarioId::BlockGrab),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

// ============================================================================
// SETUP AND CHECKS
// ============================================================================

/// Everything the runner needs to replay a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioSetup {
    pub network: SyntheticNetwork,
    /// Feed in time order
    pub reports: Vec<AvlReport>,
    /// Replay stops once the clock passes this instant
    pub end_ms: i64,
    pub checks: Vec<Check>,
}

impl ScenarioSetup {
    fn new(network: SyntheticNetwork, mut reports: Vec<AvlReport>, end_ms: i64, checks: Vec<Check>) -> Self {
        reports.sort_by_key(|r| r.time_ms);
        Self {
            network,
            reports,
            end_ms,
            checks,
        }
    }
}

/// Property the replay outcome must satisfy.
#[derive(Debug, Clone, PartialEq)]
pub enum Check {
    /// At least one vehicle event of this kind
    HasEvent { vehicle: &'static str, kind: VehicleEventType },
    /// No vehicle event of this kind
    NoEvent { vehicle: &'static str, kind: VehicleEventType },
    /// At least this many arrivals
    MinArrivals { vehicle: &'static str, count: usize },
    /// Every scheduled arrival within tolerance of its schedule time
    ArrivalsNearSchedule { vehicle: &'static str, tolerance_secs: i64 },
    /// Some predictable state reported at least this late
    LateAtLeast { vehicle: &'static str, secs: i64 },
    /// Timed out in `(after_ms, after_ms + within_ms]`
    TimedOutWithin {
        vehicle: &'static str,
        after_ms: i64,
        within_ms: i64,
    },
}

impl Check {
    pub fn evaluate(&self, outcome: &Outcome) -> Result<(), String> {
        match self {
            Check::HasEvent { vehicle, kind } => {
                if outcome.vehicle_events(vehicle).any(|e| e.kind == *kind) {
                    Ok(())
                } else {
                    Err(format!("{}: no {} event", vehicle, kind))
                }
            }
            Check::NoEvent { vehicle, kind } => match outcome.vehicle_events(vehicle).find(|e| e.kind == *kind) {
                Some(e) => Err(format!("{}: unexpected {} event: {}", vehicle, kind, e.description)),
                None => Ok(()),
            },
            Check::MinArrivals { vehicle, count } => {
                let arrivals = outcome.stop_events(vehicle, StopEventKind::Arrival).count();
                if arrivals >= *count {
                    Ok(())
                } else {
                    Err(format!("{}: {} arrivals, expected at least {}", vehicle, arrivals, count))
                }
            }
            Check::ArrivalsNearSchedule { vehicle, tolerance_secs } => {
                let mut scheduled = 0;
                for arrival in outcome.stop_events(vehicle, StopEventKind::Arrival) {
                    let Some(scheduled_ms) = arrival.scheduled_time_ms else {
                        continue;
                    };
                    scheduled += 1;
                    let off_secs = (arrival.time_ms - scheduled_ms).abs() / 1000;
                    if off_secs > *tolerance_secs {
                        return Err(format!(
                            "{}: arrival at {} off schedule by {}s",
                            vehicle, arrival.stop_id, off_secs
                        ));
                    }
                }
                if scheduled == 0 {
                    return Err(format!("{}: no scheduled arrivals", vehicle));
                }
                Ok(())
            }
            Check::LateAtLeast { vehicle, secs } => {
                let latest = outcome
                    .events
                    .iter()
                    .filter_map(|e| match e {
                        CoreEvent::StateChanged(s) if s.vehicle_id.as_str() == *vehicle && s.predictable => {
                            s.schedule_adherence_msecs
                        }
                        _ => None,
                    })
                    .min();
                match latest {
                    Some(msecs) if -msecs >= secs * 1000 => Ok(()),
                    Some(msecs) => Err(format!("{}: at most {}s late, expected {}s", vehicle, -msecs / 1000, secs)),
                    None => Err(format!("{}: no schedule adherence reported", vehicle)),
                }
            }
            Check::TimedOutWithin {
                vehicle,
                after_ms,
                within_ms,
            } => {
                let Some(&(_, at_ms)) = outcome.timeouts.iter().find(|(v, _)| v.as_str() == *vehicle) else {
                    return Err(format!("{}: never timed out", vehicle));
                };
                if at_ms > *after_ms && at_ms <= after_ms + within_ms {
                    Ok(())
                } else {
                    Err(format!(
                        "{}: timed out {}ms after the allowance, expected within (0, {}]",
                        vehicle,
                        at_ms - after_ms,
                        within_ms
                    ))
                }
            }
        }
    }
}

// ============================================================================
// SCENARIOS
// ============================================================================

const STOPS: usize = 8;
const SPACING_M: f64 = 400.0;
const SECS_BETWEEN_STOPS: i32 = 120;
const POLL_MS: i64 = 30_000;
const NO_AVL_MS: i64 = 6 * MINUTE_MS;

fn line() -> RouteLayout {
    RouteLayout::straight("r1", default_origin(), STOPS, SPACING_M)
}

fn morning_trip() -> TripPlan {
    TripPlan::new("t1", 8 * 3600, SECS_BETWEEN_STOPS)
}

fn line_network() -> SyntheticNetwork {
    SyntheticNetwork::new().with_block("b1", &line(), &[morning_trip()])
}

fn on_block(vehicle: &str) -> VehiclePlan {
    VehiclePlan::new(vehicle, Some(Assignment::block("b1")))
}

fn trip_end_ms() -> i64 {
    DAY_START_MS + morning_trip().end_secs(&line()) as i64 * 1000
}

fn on_time_plan(vehicle: &str) -> VehiclePlan {
    on_block(vehicle)
        .at(line().terminal(), T8 - 2 * MINUTE_MS)
        .hold_until(T8)
        .drive(&line(), &morning_trip(), DAY_START_MS, 0)
}

fn on_schedule(oracle: &mut Oracle, interval_ms: i64) -> ScenarioSetup {
    let reports = oracle.full_feed(&on_time_plan("v1"), interval_ms);
    ScenarioSetup::new(
        line_network(),
        reports,
        trip_end_ms() + 2 * MINUTE_MS,
        vec![
            Check::HasEvent {
                vehicle: "v1",
                kind: VehicleEventType::Predictable,
            },
            Check::MinArrivals {
                vehicle: "v1",
                count: STOPS - 2,
            },
            Check::ArrivalsNearSchedule {
                vehicle: "v1",
                tolerance_secs: 60,
            },
            Check::NoEvent {
                vehicle: "v1",
                kind: VehicleEventType::NoMatch,
            },
        ],
    )
}

fn late_start(oracle: &mut Oracle, interval_ms: i64) -> ScenarioSetup {
    let delay_ms = 5 * MINUTE_MS;
    let plan = on_block("v1")
        .at(line().terminal(), T8 - 2 * MINUTE_MS)
        .hold_until(T8 + delay_ms)
        .drive(&line(), &morning_trip(), DAY_START_MS, delay_ms);
    let reports = oracle.full_feed(&plan, interval_ms);
    ScenarioSetup::new(
        line_network(),
        reports,
        trip_end_ms() + delay_ms + 2 * MINUTE_MS,
        vec![
            Check::HasEvent {
                vehicle: "v1",
                kind: VehicleEventType::LeftTerminalLate,
            },
            Check::LateAtLeast { vehicle: "v1", secs: 180 },
            Check::MinArrivals {
                vehicle: "v1",
                count: STOPS - 2,
            },
        ],
    )
}

fn layover(oracle: &mut Oracle, interval_ms: i64) -> ScenarioSetup {
    let plan = on_block("v1")
        .at(line().terminal(), T8 - 10 * MINUTE_MS)
        .hold_until(T8)
        .drive(&line(), &morning_trip(), DAY_START_MS, 0);
    let reports = oracle.full_feed(&plan, interval_ms);
    ScenarioSetup::new(
        line_network(),
        reports,
        trip_end_ms() + 2 * MINUTE_MS,
        vec![
            Check::NoEvent {
                vehicle: "v1",
                kind: VehicleEventType::NoProgress,
            },
            Check::NoEvent {
                vehicle: "v1",
                kind: VehicleEventType::LeftTerminalEarly,
            },
            Check::ArrivalsNearSchedule {
                vehicle: "v1",
                tolerance_secs: 60,
            },
        ],
    )
}

fn silent_at_terminal(oracle: &mut Oracle, interval_ms: i64) -> ScenarioSetup {
    let plan = on_block("v1")
        .at(line().terminal(), T8 - 8 * MINUTE_MS)
        .hold_until(T8 - 5 * MINUTE_MS);
    let reports = oracle.full_feed(&plan, interval_ms);
    ScenarioSetup::new(
        line_network(),
        reports,
        T8 + 15 * MINUTE_MS,
        vec![
            Check::HasEvent {
                vehicle: "v1",
                kind: VehicleEventType::Predictable,
            },
            // Scheduled departure is 08:00
            Check::TimedOutWithin {
                vehicle: "v1",
                after_ms: T8 + NO_AVL_MS,
                within_ms: POLL_MS,
            },
        ],
    )
}

fn silent_mid_route(oracle: &mut Oracle, interval_ms: i64) -> ScenarioSetup {
    let last_fix_ms = T8 + 5 * MINUTE_MS;
    let reports = oracle.reports(&on_time_plan("v1"), T8 - 2 * MINUTE_MS, last_fix_ms, interval_ms);
    let last_ms = reports.last().map(|r| r.time_ms).unwrap_or(last_fix_ms);
    ScenarioSetup::new(
        line_network(),
        reports,
        last_ms + 15 * MINUTE_MS,
        vec![
            Check::HasEvent {
                vehicle: "v1",
                kind: VehicleEventType::Predictable,
            },
            Check::TimedOutWithin {
                vehicle: "v1",
                after_ms: last_ms + NO_AVL_MS,
                within_ms: POLL_MS,
            },
        ],
    )
}

fn gps_jump(oracle: &mut Oracle, interval_ms: i64) -> ScenarioSetup {
    let mut reports = oracle.full_feed(&on_time_plan("v1"), interval_ms);
    let jump_ms = T8 + 6 * MINUTE_MS;
    if let Some(report) = reports.iter_mut().find(|r| r.time_ms >= jump_ms) {
        report.location = report.location.offset(0.0, 5000.0);
    }
    ScenarioSetup::new(
        line_network(),
        reports,
        trip_end_ms() + 2 * MINUTE_MS,
        vec![
            Check::NoEvent {
                vehicle: "v1",
                kind: VehicleEventType::NoMatch,
            },
            Check::MinArrivals {
                vehicle: "v1",
                count: STOPS - 2,
            },
        ],
    )
}

fn frequency_loop(oracle: &mut Oracle, interval_ms: i64) -> ScenarioSetup {
    let layout = RouteLayout::square_loop("loop", default_origin(), 2, 300.0);
    let secs = 90;
    let passes: Vec<TripPlan> = (0..3)
        .map(|i| TripPlan::new(&format!("f{}", i + 1), 8 * 3600 + i * 12 * 60, secs).unscheduled())
        .collect();
    let network = SyntheticNetwork::new().with_block("f1", &layout, &passes);

    let plan = VehiclePlan::new("v1", Some(Assignment::block("f1")))
        .at(layout.terminal(), T8 - MINUTE_MS)
        .hold_until(T8)
        .drive(&layout, &passes[0], DAY_START_MS, 0)
        .drive(&layout, &passes[1], DAY_START_MS, 0);
    let reports = oracle.full_feed(&plan, interval_ms);
    let end_ms = plan.end_ms().unwrap_or(T8) + 2 * MINUTE_MS;
    ScenarioSetup::new(
        network,
        reports,
        end_ms,
        vec![
            Check::HasEvent {
                vehicle: "v1",
                kind: VehicleEventType::Predictable,
            },
            Check::MinArrivals {
                vehicle: "v1",
                count: 2 * layout.num_stops() - 6,
            },
            Check::NoEvent {
                vehicle: "v1",
                kind: VehicleEventType::NoMatch,
            },
        ],
    )
}

fn block_grab(oracle: &mut Oracle, interval_ms: i64) -> ScenarioSetup {
    let handover_ms = T8 + 6 * MINUTE_MS;
    let mut reports = oracle.reports(&on_time_plan("v1"), T8 - 2 * MINUTE_MS, handover_ms, interval_ms);
    reports.extend(oracle.reports(
        &on_time_plan("v2"),
        handover_ms + MINUTE_MS,
        trip_end_ms(),
        interval_ms,
    ));
    ScenarioSetup::new(
        line_network(),
        reports,
        trip_end_ms() + 2 * MINUTE_MS,
        vec![
            Check::HasEvent {
                vehicle: "v1",
                kind: VehicleEventType::AssignmentGrabbed,
            },
            Check::HasEvent {
                vehicle: "v2",
                kind: VehicleEventType::Predictable,
            },
            Check::MinArrivals { vehicle: "v2", count: 2 },
        ],
    )
}
