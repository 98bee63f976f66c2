//! Cancellation of pipelines made redundant by a newer pipeline on the same
//! ref.

pub mod audit;
mod canceller;
mod executor;
mod interruptible;
mod locking;
mod selector;

use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use log::{info, warn};
use serde::Serialize;

use crate::domain::{Pipeline, PipelineId};
use crate::error::{AutoCancelError, Result};
use crate::policy::{Policy, PolicyProvider};
use crate::providers::gitlab::PipelineLinks;
use crate::store::{PipelineStore, StoreError};

pub use audit::{AuditSink, LogAuditSink};
pub use canceller::{CancellationSummary, DEFAULT_BATCH_SIZE};
pub use locking::{DEFAULT_BACKOFF, DEFAULT_MAX_ATTEMPTS};
pub use selector::Strategy;

use canceller::BatchedOptimisticCanceller;
use executor::CancellationExecutor;
use locking::OptimisticLock;
use selector::{default_lookback, CandidateSelector};

const LOCK_NAME: &str = "cancel_pending_pipelines";

#[derive(Debug, Clone)]
pub struct CancellationSettings {
    pub batch_size: usize,
    pub lookback: Duration,
    pub max_lock_attempts: u32,
    pub lock_backoff: StdDuration,
    /// GitLab web URL used for links in audit records
    pub web_base_url: Option<String>,
}

impl Default for CancellationSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            lookback: default_lookback(),
            max_lock_attempts: DEFAULT_MAX_ATTEMPTS,
            lock_backoff: DEFAULT_BACKOFF,
            web_base_url: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    ChildPipeline,
    AutoCancelDisabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CancellationOutcome {
    Completed,
    Skipped { reason: SkipReason },
    /// Optimistic lock gave up; cancellations from earlier passes remain
    Abandoned { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancellationReport {
    pub pipeline_id: PipelineId,
    #[serde(flatten)]
    pub outcome: CancellationOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    #[serde(flatten)]
    pub summary: CancellationSummary,
}

impl CancellationReport {
    fn skipped(pipeline_id: PipelineId, reason: SkipReason) -> Self {
        Self {
            pipeline_id,
            outcome: CancellationOutcome::Skipped { reason },
            strategy: None,
            summary: CancellationSummary::default(),
        }
    }
}

/// Cancels older, still running pipelines on the ref of a newly created
/// pipeline.
///
/// Policy is resolved once per call. Candidates are re-read on every pass of
/// the optimistic lock, so a retry never works from stale rows. Exhausting the
/// lock is reported as [`CancellationOutcome::Abandoned`] rather than an
/// error; other failures (store unavailable, unknown project) are returned.
pub struct CancelRedundantPipelinesService<'a, S: ?Sized> {
    pipeline: &'a Pipeline,
    store: &'a S,
    policies: &'a dyn PolicyProvider,
    audit: &'a dyn AuditSink,
    settings: &'a CancellationSettings,
}

impl<'a, S: PipelineStore + ?Sized> CancelRedundantPipelinesService<'a, S> {
    pub fn new(
        pipeline: &'a Pipeline,
        store: &'a S,
        policies: &'a dyn PolicyProvider,
        audit: &'a dyn AuditSink,
        settings: &'a CancellationSettings,
    ) -> Self {
        Self {
            pipeline,
            store,
            policies,
            audit,
            settings,
        }
    }

    pub async fn execute(&self) -> Result<CancellationReport> {
        let pipeline = self.pipeline;

        if pipeline.is_child() {
            return Ok(CancellationReport::skipped(
                pipeline.id,
                SkipReason::ChildPipeline,
            ));
        }

        let project = self
            .store
            .project(pipeline.project_id)?
            .ok_or(StoreError::NotFound {
                entity: "Project",
                id: pipeline.project_id,
            })?;

        let policy = Policy::resolve(self.policies, &project);
        if !policy.auto_cancel_pending_pipelines {
            return Ok(CancellationReport::skipped(
                pipeline.id,
                SkipReason::AutoCancelDisabled,
            ));
        }

        let strategy = Strategy::for_policy(&policy);
        let candidates = CandidateSelector::new(self.store, self.settings.lookback)
            .select_candidates(pipeline, &policy, Utc::now())?;

        let links = self
            .settings
            .web_base_url
            .as_deref()
            .map(|base| PipelineLinks::new(base, &project.path));
        let executor = CancellationExecutor::new(self.store, self.audit).with_links(links);
        let lock = OptimisticLock::new(
            LOCK_NAME,
            self.settings.max_lock_attempts,
            self.settings.lock_backoff,
        );
        let canceller =
            BatchedOptimisticCanceller::new(self.store, executor, lock, self.settings.batch_size);

        let mut summary = CancellationSummary::default();
        let outcome = match canceller.run(&candidates, pipeline, &mut summary).await {
            Ok(()) => CancellationOutcome::Completed,
            Err(AutoCancelError::LockRetriesExhausted { name, attempts }) => {
                warn!(
                    "Giving up on canceling redundant pipelines for pipeline {}: lock '{}' conflicted {} times",
                    pipeline.id, name, attempts
                );
                CancellationOutcome::Abandoned { attempts }
            }
            Err(e) => return Err(e),
        };

        if !summary.canceled.is_empty() {
            info!(
                "Pipeline {} canceled {} redundant pipeline(s) on {}",
                pipeline.id,
                summary.canceled.len(),
                pipeline.ref_
            );
        }

        Ok(CancellationReport {
            pipeline_id: pipeline.id,
            outcome,
            strategy: Some(strategy),
            summary,
        })
    }
}
