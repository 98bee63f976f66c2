use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use log::{debug, error, info, warn};
use serde::Serialize;

use super::creation::{CreatePipelineRequest, PipelineCreator};
use super::tracking::{ErrorContext, ErrorTracker, LogErrorTracker, WorkerMetrics};
use crate::domain::{PipelineId, PipelineSchedule, Project, ScheduleId, User, UserId};
use crate::error::Result;
use crate::policy::PolicyProvider;
use crate::store::{PipelineStore, ScheduleStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// The caller already advanced `next_run_at` (the schedule sweeper does)
    pub next_run_scheduled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScheduleRunOutcome {
    /// Schedule, project or user no longer exists
    Skipped,
    NotDue { next_run_at: DateTime<Utc> },
    /// Another delivery of the same firing advanced `next_run_at` first
    AlreadyClaimed,
    Created { pipeline_id: PipelineId },
    CreationFailed { message: String },
    Errored { message: String },
}

/// Fires one pipeline schedule on behalf of a user.
///
/// Safe under at-least-once delivery: `next_run_at` is advanced with a
/// compare-and-set before any pipeline is requested, and only the delivery
/// that wins the update goes on to create one. Nothing here returns an error;
/// unexpected failures are counted, logged and handed to the [`ErrorTracker`].
pub struct RunPipelineScheduleWorker<C> {
    schedules: Arc<dyn ScheduleStore>,
    projects: Arc<dyn PipelineStore>,
    creator: Arc<C>,
    policies: Arc<dyn PolicyProvider>,
    tracker: Arc<dyn ErrorTracker>,
    metrics: WorkerMetrics,
}

impl<C: PipelineCreator> RunPipelineScheduleWorker<C> {
    pub fn new(
        schedules: Arc<dyn ScheduleStore>,
        projects: Arc<dyn PipelineStore>,
        creator: Arc<C>,
        policies: Arc<dyn PolicyProvider>,
    ) -> Self {
        Self {
            schedules,
            projects,
            creator,
            policies,
            tracker: Arc::new(LogErrorTracker),
            metrics: WorkerMetrics::default(),
        }
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn ErrorTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    /// Records metrics on `meter` instead of the global one.
    #[cfg(test)]
    pub fn with_meter(mut self, meter: &opentelemetry::metrics::Meter) -> Self {
        self.metrics = WorkerMetrics::new(meter);
        self
    }

    pub async fn perform(
        &self,
        schedule_id: ScheduleId,
        user_id: UserId,
        options: RunOptions,
    ) -> ScheduleRunOutcome {
        let (schedule, project, user) = match self.load(schedule_id, user_id) {
            Ok(Some(loaded)) => loaded,
            Ok(None) => {
                debug!("Schedule {schedule_id} or user {user_id} not found, skipping");
                return ScheduleRunOutcome::Skipped;
            }
            Err(e) => return self.error(schedule_id, &e),
        };

        if self.policies.run_pipeline_schedule_worker_enabled(&project)
            && !options.next_run_scheduled
        {
            let now = Utc::now();
            if schedule.next_run_at > now {
                return ScheduleRunOutcome::NotDue {
                    next_run_at: schedule.next_run_at,
                };
            }

            match self.claim(&schedule, now) {
                Ok(true) => {}
                Ok(false) => {
                    info!(
                        "Schedule {} was already fired for {}, skipping",
                        schedule.id, schedule.next_run_at
                    );
                    return ScheduleRunOutcome::AlreadyClaimed;
                }
                Err(e) => return self.error(schedule.id, &e),
            }
        }

        self.run_pipeline_schedule(&schedule, &user).await
    }

    pub async fn run_pipeline_schedule(
        &self,
        schedule: &PipelineSchedule,
        user: &User,
    ) -> ScheduleRunOutcome {
        let request = CreatePipelineRequest::for_schedule(schedule, user);

        let response = match self.creator.create(request).await {
            Ok(response) => response,
            Err(e) => return self.error(schedule.id, &e),
        };

        let persisted = response.pipeline.as_ref().filter(|_| response.is_persisted());
        if let Some(pipeline) = persisted {
            if let Err(e) = self.schedules.record_last_pipeline(schedule.id, pipeline.id) {
                warn!(
                    "Failed to record pipeline {} on schedule {}: {}",
                    pipeline.id, schedule.id, e
                );
            }
            return ScheduleRunOutcome::Created {
                pipeline_id: pipeline.id,
            };
        }

        let message = response.message.unwrap_or_default();
        let mut metadata = IndexMap::new();
        metadata.insert("schedule_id", schedule.id.to_string());
        metadata.insert("pipeline_creation_error", message.clone());
        info!(
            "Scheduled pipeline not created: {}",
            serde_json::to_string(&metadata).unwrap_or_default()
        );

        ScheduleRunOutcome::CreationFailed { message }
    }

    fn load(
        &self,
        schedule_id: ScheduleId,
        user_id: UserId,
    ) -> Result<Option<(PipelineSchedule, Project, User)>> {
        let Some(schedule) = self.schedules.schedule(schedule_id)? else {
            return Ok(None);
        };
        let Some(project) = self.projects.project(schedule.project_id)? else {
            return Ok(None);
        };
        let Some(user) = self.schedules.user(user_id)? else {
            return Ok(None);
        };
        Ok(Some((schedule, project, user)))
    }

    /// Advances `next_run_at` past `now`; false when another delivery won.
    fn claim(&self, schedule: &PipelineSchedule, now: DateTime<Utc>) -> Result<bool> {
        let next = schedule.calculate_next_run_at(now)?;
        Ok(self
            .schedules
            .advance_next_run_at(schedule.id, schedule.next_run_at, next)?)
    }

    fn error(
        &self,
        schedule_id: ScheduleId,
        err: &(dyn std::error::Error + 'static),
    ) -> ScheduleRunOutcome {
        self.metrics.record_failed_creation();
        error!(
            "Failed to create a scheduled pipeline. schedule_id: {} message: {}",
            schedule_id, err
        );

        let mut context = ErrorContext::new();
        context.insert("schedule_id", schedule_id.to_string());
        self.tracker.track(err, &context);

        ScheduleRunOutcome::Errored {
            message: err.to_string(),
        }
    }
}
