mod pipeline;
mod schedule;
mod status;

pub use pipeline::{
    Build, BuildId, Pipeline, PipelineId, PipelineSource, Project, ProjectId, RefHead, User,
    UserId,
};
pub use schedule::{PipelineSchedule, ScheduleId};
pub use status::Status;

#[cfg(test)]
pub use pipeline::JobTemplate;
