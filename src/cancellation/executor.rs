use log::{debug, info};

use super::audit::{self, AuditSink, AutoCancelRecord};
use crate::domain::Pipeline;
use crate::providers::gitlab::PipelineLinks;
use crate::store::{CancelOutcome, CancelRequest, PipelineStore, StoreResult};

/// Cancels one pipeline on behalf of a newer one and records it in the audit
/// trail.
pub struct CancellationExecutor<'a, S: ?Sized> {
    store: &'a S,
    audit: &'a dyn AuditSink,
    links: Option<PipelineLinks>,
}

impl<'a, S: PipelineStore + ?Sized> CancellationExecutor<'a, S> {
    pub fn new(store: &'a S, audit: &'a dyn AuditSink) -> Self {
        Self {
            store,
            audit,
            links: None,
        }
    }

    pub fn with_links(mut self, links: Option<PipelineLinks>) -> Self {
        self.links = links;
        self
    }

    /// `pipeline` must be the row as read in the current pass; a newer version
    /// in the store surfaces as a conflict.
    pub fn cancel(&self, pipeline: &Pipeline, initiator: &Pipeline) -> StoreResult<CancelOutcome> {
        let request = CancelRequest {
            auto_canceled_by_id: initiator.id,
            cascade_to_children: false,
        };

        let outcome = self.store.cancel_running(pipeline, &request)?;

        match outcome {
            CancelOutcome::Canceled => {
                info!(
                    "Auto-canceled pipeline {} (superseded by {})",
                    pipeline.id, initiator.id
                );
                let record = AutoCancelRecord::new(pipeline.id, initiator.id, initiator.source)
                    .with_pipeline_url(self.links.as_ref().map(|links| links.pipeline(pipeline.id)));
                audit::emit(self.audit, &record);
            }
            CancelOutcome::AlreadyResolved(status) => {
                debug!(
                    "Pipeline {} already {}, nothing to cancel",
                    pipeline.id, status
                );
            }
        }

        Ok(outcome)
    }
}
