//! Prediction generation.
//!
//! Walks forward from the current match one stop path at a time, adding the
//! expected travel and dwell of each, until the prediction horizon or the
//! end of the block. Wait stops hold the walk to their scheduled departure.

use crate::avl_report::AvlReport;
use crate::config::{ConfigProvider, CoreConfig, PredictionGeneratorKind};
use crate::events::Prediction;
use crate::indices::Indices;
use crate::service_time::MS_PER_SEC;
use crate::travel_times::TravelTimes;
use crate::vehicle_state::VehicleState;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Hard cap on stops predicted in one walk; loop blocks with zero travel
/// times would otherwise never reach the horizon.
const MAX_PREDICTED_STOPS: usize = 1000;

pub trait PredictionGenerator: Send + Sync {
    /// Predictions for the stops ahead of the vehicle's current match, in
    /// walk order. Predictions not after `now_ms` are left out.
    fn generate(&self, state: &mut VehicleState, now_ms: i64) -> Vec<Prediction>;
}

pub fn prediction_generator(config: Arc<dyn ConfigProvider>) -> Arc<dyn PredictionGenerator> {
    match config.current().prediction_generator {
        PredictionGeneratorKind::Default => Arc::new(DefaultPredictionGenerator::new(config)),
        PredictionGeneratorKind::Disabled => Arc::new(DisabledPredictionGenerator),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledPredictionGenerator;

impl PredictionGenerator for DisabledPredictionGenerator {
    fn generate(&self, _state: &mut VehicleState, _now_ms: i64) -> Vec<Prediction> {
        Vec::new()
    }
}

pub struct DefaultPredictionGenerator {
    config: Arc<dyn ConfigProvider>,
    travel_times: TravelTimes,
}

/// What one stop contributes to the walk.
struct StopPrediction {
    prediction: Prediction,
    /// Time the walk continues from; can differ from the reported time at
    /// wait stops
    next_ms: i64,
}

/// Flags that stay fixed for one walk.
struct Walk<'a> {
    config: &'a CoreConfig,
    report: &'a AvlReport,
    sched_based: bool,
    delayed: bool,
}

impl DefaultPredictionGenerator {
    pub fn new(config: Arc<dyn ConfigProvider>) -> Self {
        let travel_times = TravelTimes::new(Arc::clone(&config));
        Self { config, travel_times }
    }

    fn within_horizon(config: &CoreConfig, indices: &Indices, avl_time_ms: i64, prediction_ms: i64) -> bool {
        let within = prediction_ms < avl_time_ms + config.max_predictions_time_secs * MS_PER_SEC;
        if config.terminate_predictions_at_trip_end {
            // Finish the current trip even past the horizon
            return within || !indices.at_end_of_trip();
        }
        within
    }

    fn prediction_for_stop(
        &self,
        walk: &Walk<'_>,
        state: &VehicleState,
        indices: &Indices,
        prediction_ms: i64,
        uncertain: bool,
        trip_counter: u32,
    ) -> Option<StopPrediction> {
        let trip = indices.trip()?;
        let path = indices.stop_path()?;
        let trip_start_time_ms = if trip.no_schedule {
            state.trip_start_time(trip_counter)
        } else {
            None
        };

        let make = |predicted_time_ms: i64, is_arrival: bool| Prediction {
            vehicle_id: walk.report.vehicle_id.clone(),
            route_id: trip.route_id.clone(),
            direction_id: trip.direction_id.clone(),
            stop_id: path.stop_id.clone(),
            trip_id: trip.id.clone(),
            trip_index: indices.trip_index(),
            stop_path_index: indices.stop_path_index(),
            predicted_time_ms,
            avl_time_ms: walk.report.time_ms,
            is_arrival,
            sched_based: walk.sched_based,
            uncertain,
            delayed: walk.delayed,
            trip_start_time_ms,
            trip_counter,
        };

        let wait_stop = indices.is_wait_stop();
        if (indices.at_end_of_trip() || walk.config.use_arrival_preds_for_normal_stops) && !wait_stop {
            return Some(StopPrediction {
                prediction: make(prediction_ms, true),
                next_ms: prediction_ms,
            });
        }

        let stop_time = self.travel_times.stop_time_for_stop_path(indices);
        if !wait_stop {
            let departure = prediction_ms + stop_time;
            return Some(StopPrediction {
                prediction: make(departure, false),
                next_ms: departure,
            });
        }

        // A vehicle that cannot reach the wait stop by the predicted time is
        // deadheading there and gets no driver break
        let mut arrival_ms = prediction_ms;
        let mut deadheading = false;
        let crow_flies = self
            .travel_times
            .crow_flies_msecs(walk.report.location.distance(&path.end_location()));
        if walk.report.time_ms + crow_flies > arrival_ms {
            arrival_ms = walk.report.time_ms + crow_flies;
            deadheading = true;
            debug!(vehicle_id = %walk.report.vehicle_id, stop_id = %path.stop_id, arrival_ms, "deadheading to wait stop");
        }

        let scheduled_ms = self
            .travel_times
            .scheduled_departure_time(indices, arrival_ms)
            .unwrap_or(arrival_ms);
        let break_ms = path.break_time_secs.unwrap_or(walk.config.default_break_time_secs) * MS_PER_SEC;
        let mut expected_ms = (arrival_ms + stop_time).max(scheduled_ms);
        if !deadheading {
            expected_ms = expected_ms.max(prediction_ms + break_ms);
        }

        let reported_ms = if walk.config.use_exact_sched_time_for_wait_stops {
            let mut reported = arrival_ms.max(scheduled_ms);
            if !deadheading {
                reported = reported.max(prediction_ms + break_ms);
            }
            reported
        } else {
            expected_ms
        };
        Some(StopPrediction {
            prediction: make(reported_ms, false),
            next_ms: expected_ms,
        })
    }
}

impl PredictionGenerator for DefaultPredictionGenerator {
    fn generate(&self, state: &mut VehicleState, now_ms: i64) -> Vec<Prediction> {
        let (Some(m), Some(report)) = (
            state.current_match().map(|m| m.spatial().clone()),
            state.avl_report().cloned(),
        ) else {
            return Vec::new();
        };
        let config = self.config.current();
        let walk = Walk {
            config: &config,
            report: &report,
            sched_based: report.for_sched_based_preds,
            delayed: state.is_delayed(),
        };
        let avl_time_ms = report.time_ms;

        let late_cutoff_ms = config.max_late_cutoff_preds_for_next_trips_secs.saturating_mul(MS_PER_SEC);
        let late = state
            .real_time_sched_adh()
            .map(|adherence| adherence.late() > late_cutoff_ms)
            .unwrap_or(false);
        if late {
            debug!(vehicle_id = %report.vehicle_id, "late, later trips predicted as uncertain");
        }

        let block = Arc::clone(m.block());
        let current_trip = m.trip_index();
        let mut indices = m.indices().clone();
        let mut prediction_ms = avl_time_ms + self.travel_times.from_match_to_end_of_stop_path(&m);
        let mut trip_counter = state.trip_counter();

        let mut predictions: Vec<Option<Prediction>> = Vec::new();
        // (route, stop) -> slot of the prediction kept for a loop boundary stop
        let mut boundary: HashMap<(String, String), usize> = HashMap::new();
        let mut walked = 0;

        while walk.sched_based || Self::within_horizon(&config, &indices, avl_time_ms, prediction_ms) {
            walked += 1;
            if walked > MAX_PREDICTED_STOPS {
                warn!(vehicle_id = %report.vehicle_id, walked, "prediction walk cut short");
                break;
            }

            let uncertain = late && indices.trip_index() > current_trip;
            let Some(stop) = self.prediction_for_stop(&walk, state, &indices, prediction_ms, uncertain, trip_counter)
            else {
                break;
            };
            let predicted_ms = stop.prediction.predicted_time_ms;
            if !walk.sched_based
                && !config.terminate_predictions_at_trip_end
                && predicted_ms > avl_time_ms + config.max_predictions_time_secs * MS_PER_SEC
            {
                break;
            }

            // The last stop of a loop is predicted as the first stop of the
            // next pass
            let loop_end = block.no_schedule() && indices.at_end_of_trip();
            if loop_end {
                trip_counter += 1;
                state.put_trip_start_time(trip_counter, predicted_ms);
            }

            if !loop_end && predicted_ms > now_ms {
                let at_boundary = indices.at_end_of_trip() || indices.at_beginning_of_trip();
                if block.no_schedule() && at_boundary {
                    let key = (stop.prediction.route_id.clone(), stop.prediction.stop_id.clone());
                    let start = stop.prediction.trip_start_time_ms.unwrap_or(i64::MIN);
                    let replace = match boundary.get(&key).and_then(|&slot| predictions[slot].as_ref()) {
                        Some(kept) => start > kept.trip_start_time_ms.unwrap_or(i64::MIN),
                        None => true,
                    };
                    if replace {
                        if let Some(&slot) = boundary.get(&key) {
                            predictions[slot] = None;
                        }
                        boundary.insert(key, predictions.len());
                        predictions.push(Some(stop.prediction.clone()));
                    }
                } else {
                    predictions.push(Some(stop.prediction.clone()));
                }
            }

            prediction_ms = stop.next_ms;
            if stop.prediction.is_arrival {
                prediction_ms += self.travel_times.stop_time_for_stop_path(&indices);
            }
            indices = indices.increment_stop_path(prediction_ms);
            if indices.past_end_of_block(prediction_ms) {
                debug!(vehicle_id = %report.vehicle_id, "predictions reached end of block");
                break;
            }
            if !loop_end {
                prediction_ms += self.travel_times.for_stop_path(&indices);
            }
        }

        let predictions: Vec<Prediction> = predictions.into_iter().flatten().collect();
        debug!(vehicle_id = %report.vehicle_id, count = predictions.len(), "generated predictions");
        predictions
    }
}
