use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, info, warn};
use serde::Serialize;

use super::creation::PipelineCreator;
use super::worker::{RunOptions, RunPipelineScheduleWorker, ScheduleRunOutcome};
use crate::domain::ScheduleId;
use crate::error::Result;
use crate::store::ScheduleStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepEntry {
    pub schedule_id: ScheduleId,
    #[serde(flatten)]
    pub outcome: ScheduleRunOutcome,
}

/// Finds due schedules and fires each of them once.
pub struct PipelineScheduleSweeper<C> {
    schedules: Arc<dyn ScheduleStore>,
    worker: Arc<RunPipelineScheduleWorker<C>>,
}

impl<C: PipelineCreator> PipelineScheduleSweeper<C> {
    pub fn new(
        schedules: Arc<dyn ScheduleStore>,
        worker: Arc<RunPipelineScheduleWorker<C>>,
    ) -> Self {
        Self { schedules, worker }
    }

    /// Claims every schedule due at `now` by advancing its `next_run_at`, then
    /// runs the claimed ones concurrently. A schedule that cannot be claimed is
    /// left for the next sweep.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<SweepEntry>> {
        let due = self.schedules.due_schedules(now)?;
        let mut claimed = Vec::with_capacity(due.len());

        for schedule in due {
            let next = match schedule.calculate_next_run_at(now) {
                Ok(next) => next,
                Err(e) => {
                    warn!("Schedule {} cannot be advanced: {}", schedule.id, e);
                    continue;
                }
            };

            match self
                .schedules
                .advance_next_run_at(schedule.id, schedule.next_run_at, next)
            {
                Ok(true) => claimed.push(schedule),
                Ok(false) => debug!("Schedule {} was claimed by another sweep", schedule.id),
                Err(e) => warn!("Failed to claim schedule {}: {}", schedule.id, e),
            }
        }

        let options = RunOptions {
            next_run_scheduled: true,
        };
        let outcomes = join_all(
            claimed
                .iter()
                .map(|schedule| self.worker.perform(schedule.id, schedule.owner_id, options)),
        )
        .await;

        let entries: Vec<SweepEntry> = claimed
            .iter()
            .zip(outcomes)
            .map(|(schedule, outcome)| SweepEntry {
                schedule_id: schedule.id,
                outcome,
            })
            .collect();

        if !entries.is_empty() {
            info!("Fired {} due pipeline schedule(s)", entries.len());
        }
        Ok(entries)
    }

    /// Sweeps every `period` until `shutdown` resolves, handing each
    /// completed sweep to `on_sweep`. A failed sweep is logged and retried on
    /// the next tick. Returns the number of completed sweeps.
    pub async fn watch<F, H>(&self, period: Duration, shutdown: F, mut on_sweep: H) -> usize
    where
        F: Future<Output = ()>,
        H: FnMut(&[SweepEntry]),
    {
        let mut interval = tokio::time::interval(period);
        tokio::pin!(shutdown);
        let mut sweeps = 0;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Stopping schedule sweeper after {sweeps} sweep(s)");
                    return sweeps;
                }
                _ = interval.tick() => match self.sweep(Utc::now()).await {
                    Ok(entries) => {
                        sweeps += 1;
                        on_sweep(&entries);
                    }
                    Err(e) => warn!("Schedule sweep failed: {e}"),
                },
            }
        }
    }
}
