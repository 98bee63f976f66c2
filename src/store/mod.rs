//! Persistence collaborators for pipelines, builds and schedules.
//!
//! The engine only talks to the [`PipelineStore`] and [`ScheduleStore`]
//! traits. [`MemoryStore`] is the bundled implementation; it is loaded from and
//! saved to a [`StateSnapshot`] file by the CLI.

mod memory;
mod relation;
mod snapshot;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{
    Build, Pipeline, PipelineId, PipelineSchedule, PipelineSource, Project, ProjectId, RefHead,
    ScheduleId, Status, User, UserId,
};

pub use memory::MemoryStore;
pub use relation::Relation;
pub use snapshot::StateSnapshot;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Pipeline {pipeline_id} was modified concurrently (expected version {expected}, found {actual})")]
    StaleObject {
        pipeline_id: PipelineId,
        expected: u64,
        actual: u64,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: u64 },

    #[error("Store lock poisoned")]
    Poisoned,
}

impl StoreError {
    /// Whether the operation may succeed when retried against fresh data.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::StaleObject { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Attributes applied by [`PipelineStore::cancel_running`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelRequest {
    pub auto_canceled_by_id: PipelineId,
    pub cascade_to_children: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled,
    /// The pipeline had already reached this status; nothing was written
    AlreadyResolved(Status),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewBuild {
    pub name: String,
    pub status: Status,
    pub interruptible: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPipeline {
    pub project_id: ProjectId,
    pub ref_: String,
    pub sha: String,
    pub source: PipelineSource,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub parent_id: Option<PipelineId>,
    pub builds: Vec<NewBuild>,
}

pub trait PipelineStore: Send + Sync {
    fn project(&self, id: ProjectId) -> StoreResult<Option<Project>>;

    fn pipeline(&self, id: PipelineId) -> StoreResult<Option<Pipeline>>;

    /// Evaluates `relation`; rows come back ordered by id.
    fn pipelines(&self, relation: &Relation) -> StoreResult<Vec<Pipeline>>;

    fn pipeline_ids(&self, relation: &Relation) -> StoreResult<Vec<PipelineId>> {
        Ok(self.pipelines(relation)?.into_iter().map(|p| p.id).collect())
    }

    fn builds_for(&self, pipeline_id: PipelineId) -> StoreResult<Vec<Build>>;

    fn ref_head(&self, project_id: ProjectId, ref_: &str) -> StoreResult<Option<RefHead>>;

    /// SHA at the tip of `ref_`, or `None` when the ref is unknown.
    fn current_head_sha(&self, project_id: ProjectId, ref_: &str) -> StoreResult<Option<String>> {
        Ok(self.ref_head(project_id, ref_)?.map(|head| head.sha))
    }

    fn create_pipeline(&self, new: NewPipeline) -> StoreResult<Pipeline>;

    /// Cancels `pipeline` and its cancelable builds.
    ///
    /// Fails with [`StoreError::StaleObject`] when the stored row no longer has
    /// `pipeline.lock_version`. A pipeline that is no longer cancelable is left
    /// untouched. `auto_canceled_by_id` is only written when unset.
    fn cancel_running(
        &self,
        pipeline: &Pipeline,
        request: &CancelRequest,
    ) -> StoreResult<CancelOutcome>;
}

pub trait ScheduleStore: Send + Sync {
    fn schedule(&self, id: ScheduleId) -> StoreResult<Option<PipelineSchedule>>;

    fn user(&self, id: UserId) -> StoreResult<Option<User>>;

    /// Active schedules whose `next_run_at` is not after `now`, ordered by id.
    fn due_schedules(&self, now: DateTime<Utc>) -> StoreResult<Vec<PipelineSchedule>>;

    /// Sets `next_run_at` to `next` only if it still equals `observed`.
    /// Returns whether this caller won the update.
    fn advance_next_run_at(
        &self,
        id: ScheduleId,
        observed: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> StoreResult<bool>;

    fn record_last_pipeline(&self, id: ScheduleId, pipeline_id: PipelineId) -> StoreResult<()>;
}
