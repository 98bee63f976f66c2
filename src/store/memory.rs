use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use log::debug;

use super::relation::{Relation, Scope};
use super::snapshot::StateSnapshot;
use super::{
    CancelOutcome, CancelRequest, NewPipeline, PipelineStore, ScheduleStore, StoreError,
    StoreResult,
};
use crate::domain::{
    Build, BuildId, Pipeline, PipelineId, PipelineSchedule, Project, ProjectId, RefHead,
    ScheduleId, Status, User, UserId,
};

#[derive(Debug, Default)]
struct State {
    projects: BTreeMap<ProjectId, Project>,
    users: BTreeMap<UserId, User>,
    refs: IndexMap<(ProjectId, String), RefHead>,
    pipelines: BTreeMap<PipelineId, Pipeline>,
    builds: BTreeMap<BuildId, Build>,
    schedules: BTreeMap<ScheduleId, PipelineSchedule>,
}

impl State {
    fn next_pipeline_id(&self) -> PipelineId {
        self.pipelines.keys().next_back().map_or(1, |id| id + 1)
    }

    fn next_build_id(&self) -> BuildId {
        self.builds.keys().next_back().map_or(1, |id| id + 1)
    }

    fn builds_of(&self, pipeline_id: PipelineId) -> Vec<&Build> {
        self.builds
            .values()
            .filter(|b| b.pipeline_id == pipeline_id)
            .collect()
    }

    fn evaluate(&self, relation: &Relation) -> Vec<&Pipeline> {
        let mut rows: Vec<&Pipeline> = match relation.scope() {
            Scope::Empty => Vec::new(),
            Scope::All => self.pipelines.values().collect(),
            Scope::Project(project_id) => self
                .pipelines
                .values()
                .filter(|p| p.project_id == *project_id)
                .collect(),
            Scope::HierarchyOf(base) => self.base_and_descendants(base),
        };

        let needs_builds = relation.needs_builds();
        rows.retain(|pipeline| {
            let builds = if needs_builds {
                self.builds_of(pipeline.id)
            } else {
                Vec::new()
            };
            relation.matches(pipeline, &builds)
        });

        rows.sort_by_key(|p| p.id);
        if let Some(limit) = relation.row_limit() {
            rows.truncate(limit);
        }
        rows
    }

    /// Breadth-first walk from the rows of `base` through same-project children.
    fn base_and_descendants(&self, base: &Relation) -> Vec<&Pipeline> {
        let children = self.children_index();

        let mut seen = BTreeSet::new();
        let mut rows = Vec::new();
        let mut queue: VecDeque<&Pipeline> = self.evaluate(base).into_iter().collect();

        while let Some(pipeline) = queue.pop_front() {
            if !seen.insert(pipeline.id) {
                continue;
            }
            rows.push(pipeline);

            if let Some(kids) = children.get(&pipeline.id) {
                queue.extend(
                    kids.iter()
                        .copied()
                        .filter(|child| child.project_id == pipeline.project_id),
                );
            }
        }

        rows
    }

    fn children_index(&self) -> HashMap<PipelineId, Vec<&Pipeline>> {
        let mut children: HashMap<PipelineId, Vec<&Pipeline>> = HashMap::new();
        for pipeline in self.pipelines.values() {
            if let Some(parent_id) = pipeline.parent_id {
                children.entry(parent_id).or_default().push(pipeline);
            }
        }
        children
    }

    fn descendant_ids(&self, root: PipelineId) -> Vec<PipelineId> {
        let Some(root) = self.pipelines.get(&root) else {
            return Vec::new();
        };
        let base = Relation::all().id_in(vec![root.id]);
        self.base_and_descendants(&base)
            .into_iter()
            .map(|p| p.id)
            .filter(|id| *id != root.id)
            .collect()
    }

    fn cancel_pipeline_and_builds(&mut self, id: PipelineId, canceled_by: PipelineId) {
        if let Some(pipeline) = self.pipelines.get_mut(&id) {
            if !pipeline.status.is_cancelable() {
                return;
            }
            pipeline.status = Status::Canceled;
            if pipeline.auto_canceled_by_id.is_none() {
                pipeline.auto_canceled_by_id = Some(canceled_by);
            }
            pipeline.lock_version += 1;
        }

        for build in self
            .builds
            .values_mut()
            .filter(|b| b.pipeline_id == id && b.status.is_cancelable())
        {
            build.status = Status::Canceled;
            if build.auto_canceled_by_id.is_none() {
                build.auto_canceled_by_id = Some(canceled_by);
            }
        }
    }
}

/// Thread-safe in-process store.
///
/// Every pipeline write bumps `lock_version`, which is what
/// [`PipelineStore::cancel_running`] checks to detect concurrent updates.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn from_snapshot(snapshot: StateSnapshot) -> Self {
        let state = State {
            projects: snapshot.projects.into_iter().map(|p| (p.id, p)).collect(),
            users: snapshot.users.into_iter().map(|u| (u.id, u)).collect(),
            refs: snapshot
                .refs
                .into_iter()
                .map(|head| ((head.project_id, head.ref_.clone()), head))
                .collect(),
            pipelines: snapshot.pipelines.into_iter().map(|p| (p.id, p)).collect(),
            builds: snapshot.builds.into_iter().map(|b| (b.id, b)).collect(),
            schedules: snapshot.schedules.into_iter().map(|s| (s.id, s)).collect(),
        };

        Self {
            state: Mutex::new(state),
        }
    }

    pub fn snapshot(&self) -> StoreResult<StateSnapshot> {
        let state = self.lock()?;

        Ok(StateSnapshot {
            projects: state.projects.values().cloned().collect(),
            users: state.users.values().cloned().collect(),
            refs: state.refs.values().cloned().collect(),
            pipelines: state.pipelines.values().cloned().collect(),
            builds: state.builds.values().cloned().collect(),
            schedules: state.schedules.values().cloned().collect(),
        })
    }

    /// Inserts or replaces the head commit of a ref.
    pub fn set_ref_head(&self, head: RefHead) -> StoreResult<()> {
        let mut state = self.lock()?;
        state
            .refs
            .insert((head.project_id, head.ref_.clone()), head);
        Ok(())
    }

    /// Writes a new status the way any other process would, bumping the row
    /// version.
    #[cfg(test)]
    pub fn set_pipeline_status(&self, id: PipelineId, status: Status) -> StoreResult<()> {
        let mut state = self.lock()?;
        let pipeline = state
            .pipelines
            .get_mut(&id)
            .ok_or(StoreError::NotFound {
                entity: "Pipeline",
                id,
            })?;
        pipeline.status = status;
        pipeline.lock_version += 1;
        Ok(())
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl PipelineStore for MemoryStore {
    fn project(&self, id: ProjectId) -> StoreResult<Option<Project>> {
        Ok(self.lock()?.projects.get(&id).cloned())
    }

    fn pipeline(&self, id: PipelineId) -> StoreResult<Option<Pipeline>> {
        Ok(self.lock()?.pipelines.get(&id).cloned())
    }

    fn pipelines(&self, relation: &Relation) -> StoreResult<Vec<Pipeline>> {
        let state = self.lock()?;
        Ok(state.evaluate(relation).into_iter().cloned().collect())
    }

    fn pipeline_ids(&self, relation: &Relation) -> StoreResult<Vec<PipelineId>> {
        let state = self.lock()?;
        Ok(state.evaluate(relation).into_iter().map(|p| p.id).collect())
    }

    fn builds_for(&self, pipeline_id: PipelineId) -> StoreResult<Vec<Build>> {
        let state = self.lock()?;
        Ok(state.builds_of(pipeline_id).into_iter().cloned().collect())
    }

    fn ref_head(&self, project_id: ProjectId, ref_: &str) -> StoreResult<Option<RefHead>> {
        let state = self.lock()?;
        Ok(state.refs.get(&(project_id, ref_.to_string())).cloned())
    }

    fn create_pipeline(&self, new: NewPipeline) -> StoreResult<Pipeline> {
        let mut state = self.lock()?;

        let pipeline = Pipeline {
            id: state.next_pipeline_id(),
            project_id: new.project_id,
            ref_: new.ref_,
            sha: new.sha,
            source: new.source,
            status: new.status,
            created_at: new.created_at,
            parent_id: new.parent_id,
            auto_canceled_by_id: None,
            lock_version: 0,
        };

        for new_build in new.builds {
            let build = Build {
                id: state.next_build_id(),
                pipeline_id: pipeline.id,
                name: new_build.name,
                status: new_build.status,
                interruptible: new_build.interruptible,
                auto_canceled_by_id: None,
            };
            state.builds.insert(build.id, build);
        }

        debug!(
            "Created pipeline {} for {}@{}",
            pipeline.id, pipeline.ref_, pipeline.sha
        );
        state.pipelines.insert(pipeline.id, pipeline.clone());

        Ok(pipeline)
    }

    fn cancel_running(
        &self,
        pipeline: &Pipeline,
        request: &CancelRequest,
    ) -> StoreResult<CancelOutcome> {
        let mut state = self.lock()?;

        let current = state
            .pipelines
            .get(&pipeline.id)
            .ok_or(StoreError::NotFound {
                entity: "Pipeline",
                id: pipeline.id,
            })?;

        if !current.status.is_cancelable() {
            return Ok(CancelOutcome::AlreadyResolved(current.status));
        }

        if current.lock_version != pipeline.lock_version {
            return Err(StoreError::StaleObject {
                pipeline_id: pipeline.id,
                expected: pipeline.lock_version,
                actual: current.lock_version,
            });
        }

        state.cancel_pipeline_and_builds(pipeline.id, request.auto_canceled_by_id);

        if request.cascade_to_children {
            for id in state.descendant_ids(pipeline.id) {
                state.cancel_pipeline_and_builds(id, request.auto_canceled_by_id);
            }
        }

        Ok(CancelOutcome::Canceled)
    }
}

impl ScheduleStore for MemoryStore {
    fn schedule(&self, id: ScheduleId) -> StoreResult<Option<PipelineSchedule>> {
        Ok(self.lock()?.schedules.get(&id).cloned())
    }

    fn user(&self, id: UserId) -> StoreResult<Option<User>> {
        Ok(self.lock()?.users.get(&id).cloned())
    }

    fn due_schedules(&self, now: DateTime<Utc>) -> StoreResult<Vec<PipelineSchedule>> {
        let state = self.lock()?;
        Ok(state
            .schedules
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect())
    }

    fn advance_next_run_at(
        &self,
        id: ScheduleId,
        observed: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.lock()?;
        let schedule = state
            .schedules
            .get_mut(&id)
            .ok_or(StoreError::NotFound {
                entity: "Schedule",
                id,
            })?;

        if schedule.next_run_at != observed {
            return Ok(false);
        }

        schedule.next_run_at = next;
        Ok(true)
    }

    fn record_last_pipeline(&self, id: ScheduleId, pipeline_id: PipelineId) -> StoreResult<()> {
        let mut state = self.lock()?;
        let schedule = state
            .schedules
            .get_mut(&id)
            .ok_or(StoreError::NotFound {
                entity: "Schedule",
                id,
            })?;
        schedule.last_pipeline_id = Some(pipeline_id);
        Ok(())
    }
}
