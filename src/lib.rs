// imports of other modules from this crate
mod error;
pub use error::{SimError, SimResult};

mod config_utils;

mod network_index;
pub use network_index::{NetworkIndex, RoadSegment};

pub mod targets;
pub use targets::{LaneRef, LaneTarget, ParsedTargets, TargetDiagnostic};

pub mod traci;
pub use traci::{ControlChannel, SumoLauncher, TraciClient};

pub mod controller;
pub use controller::{ActionKind, ActionRecord, ControllerState, RestrictionController,
                     RestrictionMode, RestrictionPlan, RestrictionWindow, RunSummary,
                     VehicleClasses};

pub mod metrics;
pub use metrics::{ComparisonReport, MetricDelta, TripMetrics};

pub mod scenario;
pub use scenario::ScenarioConfig;

#[cfg(test)]
mod test_utils;
