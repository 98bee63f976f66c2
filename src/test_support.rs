//! Fixtures shared by the unit tests of several modules.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use opentelemetry::metrics::{Meter, MeterProvider as _};
use opentelemetry_sdk::metrics::data::{AggregatedMetrics, MetricData};
use opentelemetry_sdk::metrics::{InMemoryMetricExporter, PeriodicReader, SdkMeterProvider};

use crate::cancellation::audit::{AuditError, AuditSink, AutoCancelRecord};
use crate::domain::{
    Build, BuildId, JobTemplate, Pipeline, PipelineId, PipelineSchedule, PipelineSource, Project,
    ProjectId, RefHead, Status, User,
};
use crate::store::{
    CancelOutcome, CancelRequest, MemoryStore, NewPipeline, PipelineStore, Relation,
    StateSnapshot, StoreError, StoreResult,
};

pub fn create_pipeline(id: PipelineId, ref_: &str, status: Status) -> Pipeline {
    Pipeline {
        id,
        project_id: 1,
        ref_: ref_.to_string(),
        sha: format!("sha-{id}"),
        source: PipelineSource::Push,
        status,
        created_at: Utc::now() - Duration::minutes(10),
        parent_id: None,
        auto_canceled_by_id: None,
        lock_version: 0,
    }
}

pub fn create_child(id: PipelineId, parent_id: PipelineId, status: Status) -> Pipeline {
    Pipeline {
        source: PipelineSource::ParentPipeline,
        parent_id: Some(parent_id),
        ..create_pipeline(id, "main", status)
    }
}

pub fn create_build(id: BuildId, pipeline_id: PipelineId, status: Status, interruptible: bool) -> Build {
    Build {
        id,
        pipeline_id,
        name: format!("job-{id}"),
        status,
        interruptible,
        auto_canceled_by_id: None,
    }
}

pub fn create_project(id: ProjectId) -> Project {
    Project {
        id,
        path: "group/project".to_string(),
        auto_cancel_pending_pipelines: true,
        ci_config_error: None,
        ci_jobs: vec![
            JobTemplate {
                name: "rspec".to_string(),
                interruptible: true,
            },
            JobTemplate {
                name: "lint".to_string(),
                interruptible: true,
            },
        ],
    }
}

pub fn create_ref_head(ref_: &str, sha: &str) -> RefHead {
    RefHead {
        project_id: 1,
        ref_: ref_.to_string(),
        sha: sha.to_string(),
        message: "Update README".to_string(),
    }
}

pub fn create_user(id: u64) -> User {
    User {
        id,
        username: format!("user-{id}"),
    }
}

pub fn create_schedule(id: u64, next_run_at: DateTime<Utc>) -> PipelineSchedule {
    PipelineSchedule {
        id,
        project_id: 1,
        ref_: "main".to_string(),
        cron: "0 * * * *".to_string(),
        owner_id: 1,
        active: true,
        next_run_at,
        last_pipeline_id: None,
        description: format!("nightly {id}"),
    }
}

/// Store with project 1, user 1 and `main` pointing at `head`.
pub fn create_store(pipelines: Vec<Pipeline>, builds: Vec<Build>) -> MemoryStore {
    MemoryStore::from_snapshot(StateSnapshot {
        projects: vec![create_project(1)],
        users: vec![create_user(1)],
        refs: vec![create_ref_head("main", "head")],
        pipelines,
        builds,
        ..StateSnapshot::default()
    })
}

/// Audit sink that keeps every record in memory.
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    records: Mutex<Vec<AutoCancelRecord>>,
    pub fail: bool,
}

impl RecordingAuditSink {
    pub fn failing() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn records(&self) -> Vec<AutoCancelRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl AuditSink for RecordingAuditSink {
    fn record(&self, entry: &AutoCancelRecord) -> Result<(), AuditError> {
        if self.fail {
            let offline = serde_json::from_str::<serde_json::Value>("sink offline").unwrap_err();
            return Err(AuditError::Encode(offline));
        }
        self.records.lock().unwrap().push(entry.clone());
        Ok(())
    }
}

/// Wraps a [`MemoryStore`] and simulates another writer touching a pipeline
/// right before its cancellation, for a fixed number of times.
pub struct ConflictingStore {
    pub inner: MemoryStore,
    target: PipelineId,
    remaining: AtomicU32,
    finish_with: Option<Status>,
}

impl ConflictingStore {
    /// The other writer rewrites the row unchanged, which only bumps its version.
    pub fn new(inner: MemoryStore, target: PipelineId, conflicts: u32) -> Self {
        Self {
            inner,
            target,
            remaining: AtomicU32::new(conflicts),
            finish_with: None,
        }
    }

    /// The other writer finishes the pipeline with `status` once.
    pub fn finishing(inner: MemoryStore, target: PipelineId, status: Status) -> Self {
        Self {
            finish_with: Some(status),
            ..Self::new(inner, target, 1)
        }
    }
}

impl PipelineStore for ConflictingStore {
    fn project(&self, id: ProjectId) -> StoreResult<Option<Project>> {
        self.inner.project(id)
    }

    fn pipeline(&self, id: PipelineId) -> StoreResult<Option<Pipeline>> {
        self.inner.pipeline(id)
    }

    fn pipelines(&self, relation: &Relation) -> StoreResult<Vec<Pipeline>> {
        self.inner.pipelines(relation)
    }

    fn builds_for(&self, pipeline_id: PipelineId) -> StoreResult<Vec<Build>> {
        self.inner.builds_for(pipeline_id)
    }

    fn ref_head(&self, project_id: ProjectId, ref_: &str) -> StoreResult<Option<RefHead>> {
        self.inner.ref_head(project_id, ref_)
    }

    fn create_pipeline(&self, new: NewPipeline) -> StoreResult<Pipeline> {
        self.inner.create_pipeline(new)
    }

    fn cancel_running(
        &self,
        pipeline: &Pipeline,
        request: &CancelRequest,
    ) -> StoreResult<CancelOutcome> {
        let conflict = pipeline.id == self.target
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();

        if conflict {
            let current = self.inner.pipeline(pipeline.id)?.ok_or(StoreError::NotFound {
                entity: "Pipeline",
                id: pipeline.id,
            })?;
            let status = self.finish_with.unwrap_or(current.status);
            self.inner.set_pipeline_status(pipeline.id, status)?;
        }

        self.inner.cancel_running(pipeline, request)
    }
}

/// Meter provider whose exports are kept in memory for assertions.
pub struct TestMeter {
    provider: SdkMeterProvider,
    exporter: InMemoryMetricExporter,
}

impl TestMeter {
    pub fn new() -> Self {
        let exporter = InMemoryMetricExporter::default();
        let reader = PeriodicReader::builder(exporter.clone()).build();
        let provider = SdkMeterProvider::builder().with_reader(reader).build();
        Self { provider, exporter }
    }

    pub fn meter(&self) -> Meter {
        self.provider.meter("ci_autocancel_test")
    }

    /// Current cumulative value of a u64 counter, 0 when never recorded.
    pub fn total(&self, name: &str) -> u64 {
        self.provider.force_flush().unwrap();
        let exported = self.exporter.get_finished_metrics().unwrap();
        let Some(latest) = exported.last() else {
            return 0;
        };

        latest
            .scope_metrics()
            .flat_map(|scope| scope.metrics())
            .filter(|metric| metric.name() == name)
            .map(|metric| match metric.data() {
                AggregatedMetrics::U64(MetricData::Sum(sum)) => {
                    sum.data_points().map(|point| point.value()).sum::<u64>()
                }
                _ => 0,
            })
            .sum()
    }
}
