//! AVL Core - Vehicle location matching and arrival prediction
//!
//! Turns raw vehicle location fixes into an understanding of where each
//! vehicle is along its scheduled work:
//! 1. **Matching**: spatial candidates along the assigned block, chosen by
//!    how well the elapsed time agrees with expected travel
//! 2. **Inference**: arrival and departure times at every stop passed
//! 3. **Prediction**: arrival/departure predictions for upcoming stops
//!
//! Reference data is read through [`ReferenceSnapshot`], configuration
//! through [`ConfigProvider`], and every derived record is handed to a
//! non-blocking [`avl_env::Sink`].

pub mod arrival_departure;
pub mod auto_assign;
pub mod avl_processor;
pub mod avl_report;
pub mod config;
pub mod error;
pub mod events;
pub mod geo;
pub mod indices;
pub mod prediction;
pub mod reference;
pub mod runtime;
pub mod schedule_adherence;
pub mod service_time;
pub mod spatial_match;
pub mod spatial_matcher;
pub mod temporal;
pub mod temporal_matcher;
pub mod timeout;
pub mod travel_times;
pub mod vehicle_manager;
pub mod vehicle_state;

// Re-export key types for convenience
pub use auto_assign::{AutoAssigner, AutoAssignerConfig, DisabledAutoAssigner, ScheduleAutoAssigner};
pub use avl_processor::AvlProcessor;
pub use avl_report::{Assignment, AssignmentType, AvlReport, NoCancellations, TripCancellations, VehicleId};
pub use config::{ConfigProvider, CoreConfig, ReloadableConfig, StaticConfig};
pub use error::{CoreError, CoreResult};
pub use events::{ArrivalDeparture, CoreEvent, EventSink, Prediction, PredictionSet, VehicleEvent, VehicleEventType};
pub use geo::Location;
pub use reference::{Block, InMemorySnapshot, ReferenceSnapshot, SnapshotDef, Trip};
pub use runtime::{report_channel, AvlRuntime};
pub use service_time::ServiceClock;
pub use timeout::TimeoutSupervisor;
pub use vehicle_manager::VehicleStateManager;
pub use vehicle_state::{BlockAssignmentMethod, VehicleState};
