//! Conversion orchestration: per-track planning against an output format's
//! codec matrix, followed by pipeline execution with trim/progress/cancel.

mod options;
mod orchestrator;
mod plan;

pub use options::{ConversionOptions, TrackOptions};
pub use orchestrator::Conversion;
pub use plan::{plan_track, Mode, OutputFormat, TrackPlan};
