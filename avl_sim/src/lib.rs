//! AVL Deterministic Replay Harness
//!
//! Drives the AVL core with synthetic feeds under a virtual clock and
//! checks what comes out.
//!
//! # Core Principle
//!
//! All sources of non-determinism are controlled:
//! - **Time**: a virtual clock moved only by the replay
//! - **GPS noise**: drawn from a ChaCha RNG seeded from one 64-bit seed
//! - **Supervision**: timeout sweeps run on fixed polling ticks
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      ScenarioRunner                      │
//! │  ┌──────────────┐   reports   ┌───────────────────────┐  │
//! │  │    Oracle    │────────────►│     AvlProcessor      │  │
//! │  │ (truth+noise)│             │  + TimeoutSupervisor  │  │
//! │  └──────▲───────┘             └──────────┬────────────┘  │
//! │         │                                │ CoreEvents    │
//! │  ┌──────┴───────┐             ┌──────────▼────────────┐  │
//! │  │ VehiclePlans │             │    CollectingSink     │  │
//! │  │ + Synthetic  │             │  → checks / export    │  │
//! │  │   Network    │             └───────────────────────┘  │
//! │  └──────────────┘                                        │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use avl_sim::{ScenarioRunner, ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::OnSchedule);
//! assert!(result.passed);
//! ```

pub mod context;
pub mod error;
pub mod exporter;
pub mod network;
pub mod oracle;
pub mod runner;
pub mod scenarios;

pub use context::SimContext;
pub use error::{SimError, SimResult};
pub use exporter::SimExport;
pub use network::{RouteLayout, SyntheticNetwork, TripPlan};
pub use oracle::{Oracle, VehiclePlan};
pub use runner::{Outcome, ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use scenarios::ScenarioId;
