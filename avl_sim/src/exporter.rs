//! JSON exporter for replay runs.
//!
//! Writes the feed, every record the core emitted, and the verdict, so a run
//! can be inspected or diffed against another seed.

use crate::error::SimResult;
use crate::runner::{Outcome, ScenarioMetrics, ScenarioResult};
use avl_core::{AvlReport, CoreEvent};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;

/// A timeout observed by the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutRecord {
    pub vehicle_id: String,
    pub time_ms: i64,
}

/// Complete replay export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Feed replayed through the core
    pub reports: Vec<AvlReport>,

    /// Records in emission order
    pub events: Vec<CoreEvent>,

    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub timeouts: Vec<TimeoutRecord>,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    pub metrics: ScenarioMetrics,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            reports: Vec::new(),
            events: Vec::new(),
            timeouts: Vec::new(),
            passed: false,
            failure_reason: None,
            metrics: ScenarioMetrics::default(),
        }
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, result: &ScenarioResult, outcome: Outcome) {
        self.passed = result.passed;
        self.failure_reason = result.failure_reason.clone();
        self.metrics = result.metrics.clone();
        self.timeouts = outcome
            .timeouts
            .into_iter()
            .map(|(vehicle_id, time_ms)| TimeoutRecord {
                vehicle_id: vehicle_id.to_string(),
                time_ms,
            })
            .collect();
        self.events = outcome.events;
        self.reports = outcome.reports;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> SimResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
