use std::sync::Arc;

use chrono::Utc;
use log::{info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::cancellation::{
    AuditSink, CancelRedundantPipelinesService, CancellationReport, CancellationSettings,
};
use crate::domain::{
    Pipeline, PipelineSchedule, PipelineSource, Project, ProjectId, RefHead, ScheduleId, Status,
    User, UserId,
};
use crate::policy::PolicyProvider;
use crate::store::{NewBuild, NewPipeline, PipelineStore, StoreError};

pub const REFERENCE_NOT_FOUND: &str = "Reference not found";
pub const PIPELINE_SKIPPED: &str = "Pipeline skipped";

#[derive(Error, Debug)]
pub enum CreationError {
    #[error("Project {0} not found")]
    ProjectNotFound(ProjectId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePipelineRequest {
    pub project_id: ProjectId,
    pub ref_: String,
    pub source: PipelineSource,
    pub user_id: UserId,
    /// Create the pipeline even when the head commit asks to skip CI
    pub ignore_skip_ci: bool,
    /// Persist pipelines that fail validation, with a failed or skipped status
    pub save_on_errors: bool,
    pub schedule_id: Option<ScheduleId>,
}

impl CreatePipelineRequest {
    pub fn new(project_id: ProjectId, ref_: &str, source: PipelineSource, user_id: UserId) -> Self {
        Self {
            project_id,
            ref_: ref_.to_string(),
            source,
            user_id,
            ignore_skip_ci: false,
            save_on_errors: true,
            schedule_id: None,
        }
    }

    /// Request used when a schedule fires: configuration errors never raise
    /// and are not persisted.
    pub fn for_schedule(schedule: &PipelineSchedule, user: &User) -> Self {
        Self {
            ignore_skip_ci: true,
            save_on_errors: false,
            schedule_id: Some(schedule.id),
            ..Self::new(
                schedule.project_id,
                &schedule.ref_,
                PipelineSource::Schedule,
                user.id,
            )
        }
    }
}

/// Result of a creation attempt. Validation problems are reported here, not
/// as errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreatePipelineResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Set when a pipeline row was written
    pub pipeline: Option<Pipeline>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancellation: Option<CancellationReport>,
}

impl CreatePipelineResponse {
    pub fn success(pipeline: Pipeline, cancellation: Option<CancellationReport>) -> Self {
        Self {
            message: None,
            pipeline: Some(pipeline),
            cancellation,
        }
    }

    pub fn error(message: impl Into<String>, pipeline: Option<Pipeline>) -> Self {
        Self {
            message: Some(message.into()),
            pipeline,
            cancellation: None,
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.pipeline.is_some()
    }

    pub fn is_success(&self) -> bool {
        self.message.is_none()
    }
}

/// Creates pipelines for a project ref.
#[allow(async_fn_in_trait)]
pub trait PipelineCreator: Send + Sync {
    async fn create(
        &self,
        request: CreatePipelineRequest,
    ) -> Result<CreatePipelineResponse, CreationError>;
}

/// Store-backed pipeline creation that cancels redundant pipelines once the
/// new pipeline is persisted.
pub struct CreatePipelineService<S: ?Sized> {
    store: Arc<S>,
    policies: Arc<dyn PolicyProvider>,
    audit: Arc<dyn AuditSink>,
    settings: CancellationSettings,
}

impl<S: PipelineStore + ?Sized> CreatePipelineService<S> {
    pub fn new(
        store: Arc<S>,
        policies: Arc<dyn PolicyProvider>,
        audit: Arc<dyn AuditSink>,
        settings: CancellationSettings,
    ) -> Self {
        Self {
            store,
            policies,
            audit,
            settings,
        }
    }

    pub async fn execute(
        &self,
        request: CreatePipelineRequest,
    ) -> Result<CreatePipelineResponse, CreationError> {
        let project = self
            .store
            .project(request.project_id)?
            .ok_or(CreationError::ProjectNotFound(request.project_id))?;

        let Some(head) = self.store.ref_head(project.id, &request.ref_)? else {
            return Ok(CreatePipelineResponse::error(REFERENCE_NOT_FOUND, None));
        };

        if let Some(config_error) = &project.ci_config_error {
            return self.reject(&request, &project, &head, Status::Failed, config_error);
        }

        if !request.ignore_skip_ci && head.requests_ci_skip() {
            return self.reject(&request, &project, &head, Status::Skipped, PIPELINE_SKIPPED);
        }

        let builds = project
            .ci_jobs
            .iter()
            .map(|job| NewBuild {
                name: job.name.clone(),
                status: Status::Created,
                interruptible: job.interruptible,
            })
            .collect();

        let pipeline = self
            .store
            .create_pipeline(new_pipeline(&request, &head, Status::Created, builds))?;
        info!(
            "Created {} pipeline {} for {}@{} in {}",
            pipeline.source, pipeline.id, pipeline.ref_, pipeline.sha, project.path
        );

        let cancellation = self.cancel_redundant(&pipeline).await;
        Ok(CreatePipelineResponse::success(pipeline, cancellation))
    }

    fn reject(
        &self,
        request: &CreatePipelineRequest,
        project: &Project,
        head: &RefHead,
        status: Status,
        message: &str,
    ) -> Result<CreatePipelineResponse, CreationError> {
        let pipeline = if request.save_on_errors {
            Some(
                self.store
                    .create_pipeline(new_pipeline(request, head, status, Vec::new()))?,
            )
        } else {
            None
        };

        warn!(
            "Pipeline for {}@{} in {} not created: {}",
            request.ref_, head.sha, project.path, message
        );
        Ok(CreatePipelineResponse::error(message, pipeline))
    }

    async fn cancel_redundant(&self, pipeline: &Pipeline) -> Option<CancellationReport> {
        let service = CancelRedundantPipelinesService::new(
            pipeline,
            self.store.as_ref(),
            self.policies.as_ref(),
            self.audit.as_ref(),
            &self.settings,
        );

        match service.execute().await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(
                    "Failed to cancel redundant pipelines for pipeline {}: {}",
                    pipeline.id, e
                );
                None
            }
        }
    }
}

impl<S: PipelineStore + ?Sized> PipelineCreator for CreatePipelineService<S> {
    async fn create(
        &self,
        request: CreatePipelineRequest,
    ) -> Result<CreatePipelineResponse, CreationError> {
        self.execute(request).await
    }
}

fn new_pipeline(
    request: &CreatePipelineRequest,
    head: &RefHead,
    status: Status,
    builds: Vec<NewBuild>,
) -> NewPipeline {
    NewPipeline {
        project_id: request.project_id,
        ref_: request.ref_.clone(),
        sha: head.sha.clone(),
        source: request.source,
        status,
        created_at: Utc::now(),
        parent_id: None,
        builds,
    }
}
