//! Schedule-driven pipeline creation.

mod creation;
mod sweep;
mod tracking;
mod worker;

pub use creation::{CreatePipelineRequest, CreatePipelineResponse, CreatePipelineService};
pub use sweep::{PipelineScheduleSweeper, SweepEntry};
pub use tracking::LogErrorTracker;
pub use worker::{RunOptions, RunPipelineScheduleWorker, ScheduleRunOutcome};
