use std::collections::BTreeSet;

use log::debug;
use serde::Serialize;

use super::executor::CancellationExecutor;
use super::interruptible::filter_interruptible;
use super::locking::OptimisticLock;
use crate::domain::{Pipeline, PipelineId};
use crate::error::Result;
use crate::store::{CancelOutcome, PipelineStore, Relation, StoreResult};

pub const DEFAULT_BATCH_SIZE: usize = 25;

/// What the canceller did across all of its passes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CancellationSummary {
    pub canceled: BTreeSet<PipelineId>,
    /// Candidates left running because a build is not interruptible (last pass)
    pub not_interruptible: BTreeSet<PipelineId>,
    /// Candidates that finished on their own before we got to them (last pass)
    pub already_resolved: BTreeSet<PipelineId>,
    /// Batches read in the last pass
    pub batches: usize,
    pub largest_batch: usize,
    pub attempts: u32,
}

impl CancellationSummary {
    fn start_pass(&mut self, attempt: u32) {
        self.attempts = attempt;
        self.not_interruptible.clear();
        self.already_resolved.clear();
        self.batches = 0;
    }

    fn record_batch(&mut self, size: usize) {
        self.batches += 1;
        self.largest_batch = self.largest_batch.max(size);
    }
}

/// Walks a candidate relation in id-ordered batches and cancels what is safe
/// to cancel, restarting the whole walk when a row changed underneath it.
pub struct BatchedOptimisticCanceller<'a, S: ?Sized> {
    store: &'a S,
    executor: CancellationExecutor<'a, S>,
    lock: OptimisticLock,
    batch_size: usize,
}

impl<'a, S: PipelineStore + ?Sized> BatchedOptimisticCanceller<'a, S> {
    pub fn new(
        store: &'a S,
        executor: CancellationExecutor<'a, S>,
        lock: OptimisticLock,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            executor,
            lock,
            batch_size: batch_size.max(1),
        }
    }

    /// Fills `summary` as it goes, so partial progress is visible even when
    /// the lock gives up.
    pub async fn run(
        &self,
        candidates: &Relation,
        initiator: &Pipeline,
        summary: &mut CancellationSummary,
    ) -> Result<()> {
        if candidates.is_empty_scope() {
            return Ok(());
        }

        self.lock
            .retry(|attempt| {
                summary.start_pass(attempt);
                self.run_pass(candidates, initiator, summary)
            })
            .await?;

        Ok(())
    }

    fn run_pass(
        &self,
        candidates: &Relation,
        initiator: &Pipeline,
        summary: &mut CancellationSummary,
    ) -> StoreResult<()> {
        let mut last_seen: Option<PipelineId> = None;

        loop {
            let batch = match last_seen {
                Some(id) => candidates.clone().id_after(id),
                None => candidates.clone(),
            };
            let ids = self.store.pipeline_ids(&batch.limit(self.batch_size))?;

            let Some(&last) = ids.last() else {
                break;
            };

            summary.record_batch(ids.len());
            debug!(
                "Processing batch {} of {} candidate pipelines",
                summary.batches,
                ids.len()
            );
            self.cancel_batch(&ids, initiator, summary)?;

            if ids.len() < self.batch_size {
                break;
            }
            last_seen = Some(last);
        }

        Ok(())
    }

    fn cancel_batch(
        &self,
        ids: &[PipelineId],
        initiator: &Pipeline,
        summary: &mut CancellationSummary,
    ) -> StoreResult<()> {
        let eligible = filter_interruptible(self.store, ids)?;
        let eligible_ids: BTreeSet<PipelineId> = eligible.iter().map(|p| p.id).collect();

        summary.not_interruptible.extend(
            ids.iter()
                .copied()
                .filter(|id| !eligible_ids.contains(id)),
        );

        for pipeline in &eligible {
            match self.executor.cancel(pipeline, initiator)? {
                CancelOutcome::Canceled => {
                    summary.canceled.insert(pipeline.id);
                }
                CancelOutcome::AlreadyResolved(_) => {
                    summary.already_resolved.insert(pipeline.id);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::domain::Status;
    use crate::error::AutoCancelError;
    use crate::test_support::{
        create_build, create_pipeline, create_store, ConflictingStore, RecordingAuditSink,
    };

    fn lock(max_attempts: u32) -> OptimisticLock {
        OptimisticLock::new("cancel_pending_pipelines", max_attempts, Duration::from_millis(1))
    }

    fn candidates() -> Relation {
        Relation::pipelines_for(1, "main").excluding(100).alive_or_scheduled()
    }

    fn initiator() -> Pipeline {
        create_pipeline(100, "main", Status::Created)
    }

    #[tokio::test]
    async fn test_cancels_across_batches() {
        let pipelines = (1..=60)
            .map(|id| create_pipeline(id, "main", Status::Running))
            .collect();
        let store = create_store(pipelines, vec![]);
        let sink = RecordingAuditSink::default();
        let canceller =
            BatchedOptimisticCanceller::new(&store, CancellationExecutor::new(&store, &sink), lock(5), 25);

        let mut summary = CancellationSummary::default();
        canceller
            .run(&candidates(), &initiator(), &mut summary)
            .await
            .unwrap();

        assert_eq!(summary.canceled.len(), 60);
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.largest_batch, 25);
        assert_eq!(summary.attempts, 1);
        assert_eq!(sink.records().len(), 60);
    }

    #[tokio::test]
    async fn test_exact_multiple_of_batch_size_reads_one_empty_batch() {
        let pipelines = (1..=4)
            .map(|id| create_pipeline(id, "main", Status::Running))
            .collect();
        let store = create_store(pipelines, vec![]);
        let sink = RecordingAuditSink::default();
        let canceller =
            BatchedOptimisticCanceller::new(&store, CancellationExecutor::new(&store, &sink), lock(5), 2);

        let mut summary = CancellationSummary::default();
        canceller
            .run(&candidates(), &initiator(), &mut summary)
            .await
            .unwrap();

        assert_eq!(summary.canceled.len(), 4);
        assert_eq!(summary.batches, 2);
        assert!(summary.largest_batch <= 2);
    }

    #[tokio::test]
    async fn test_non_interruptible_pipelines_survive() {
        let store = create_store(
            vec![
                create_pipeline(1, "main", Status::Running),
                create_pipeline(2, "main", Status::Running),
            ],
            vec![
                create_build(1, 1, Status::Running, true),
                create_build(2, 2, Status::Running, false),
            ],
        );
        let sink = RecordingAuditSink::default();
        let canceller =
            BatchedOptimisticCanceller::new(&store, CancellationExecutor::new(&store, &sink), lock(5), 25);

        let mut summary = CancellationSummary::default();
        canceller
            .run(&candidates(), &initiator(), &mut summary)
            .await
            .unwrap();

        assert_eq!(summary.canceled.iter().copied().collect::<Vec<_>>(), vec![1]);
        assert_eq!(summary.not_interruptible.iter().copied().collect::<Vec<_>>(), vec![2]);
        assert_eq!(store.pipeline(2).unwrap().unwrap().status, Status::Running);
    }

    #[tokio::test]
    async fn test_conflict_restarts_pass() {
        let store = ConflictingStore::new(
            create_store(
                vec![
                    create_pipeline(1, "main", Status::Running),
                    create_pipeline(2, "main", Status::Running),
                    create_pipeline(3, "main", Status::Running),
                ],
                vec![],
            ),
            2,
            1,
        );
        let sink = RecordingAuditSink::default();
        let canceller =
            BatchedOptimisticCanceller::new(&store, CancellationExecutor::new(&store, &sink), lock(5), 25);

        let mut summary = CancellationSummary::default();
        canceller
            .run(&candidates(), &initiator(), &mut summary)
            .await
            .unwrap();

        assert_eq!(summary.attempts, 2);
        assert_eq!(summary.canceled.len(), 3);
        for id in 1..=3 {
            let pipeline = store.inner.pipeline(id).unwrap().unwrap();
            assert_eq!(pipeline.status, Status::Canceled);
            assert_eq!(pipeline.auto_canceled_by_id, Some(100));
        }
        assert_eq!(sink.records().len(), 3, "each pipeline audited once");
    }

    #[tokio::test]
    async fn test_persistent_conflicts_exhaust_the_lock() {
        let store = ConflictingStore::new(
            create_store(vec![create_pipeline(1, "main", Status::Running)], vec![]),
            1,
            u32::MAX,
        );
        let sink = RecordingAuditSink::default();
        let canceller =
            BatchedOptimisticCanceller::new(&store, CancellationExecutor::new(&store, &sink), lock(3), 25);

        let mut summary = CancellationSummary::default();
        let err = canceller
            .run(&candidates(), &initiator(), &mut summary)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AutoCancelError::LockRetriesExhausted { attempts: 3, .. }
        ));
        assert_eq!(summary.attempts, 3);
        assert_eq!(store.inner.pipeline(1).unwrap().unwrap().status, Status::Running);
    }

    #[tokio::test]
    async fn test_empty_relation_touches_nothing() {
        let store = create_store(vec![create_pipeline(1, "main", Status::Running)], vec![]);
        let sink = RecordingAuditSink::default();
        let canceller =
            BatchedOptimisticCanceller::new(&store, CancellationExecutor::new(&store, &sink), lock(5), 25);

        let mut summary = CancellationSummary::default();
        canceller
            .run(&Relation::empty(), &initiator(), &mut summary)
            .await
            .unwrap();

        assert_eq!(summary, CancellationSummary::default());
    }
}
