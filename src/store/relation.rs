use chrono::{DateTime, Utc};

use crate::domain::{Build, Pipeline, PipelineId, PipelineSource, ProjectId};

/// Rows a relation starts from before its filters are applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Scope {
    /// Matches nothing
    Empty,
    All,
    Project(ProjectId),
    /// Rows of the inner relation plus all of their same-project descendants
    HierarchyOf(Box<Relation>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Ref(String),
    /// `created_at >= t`
    CreatedAfter(DateTime<Utc>),
    /// `created_at < t`
    CreatedBefore(DateTime<Utc>),
    NotSha(String),
    Excluding(PipelineId),
    SourceIn(Vec<PipelineSource>),
    NotChild,
    AliveOrScheduled,
    /// No build that is still running or waiting is non-interruptible
    OnlyInterruptibleBuilds,
    IdIn(Vec<PipelineId>),
    /// `id > n`, used for keyset batching
    IdAfter(PipelineId),
}

impl Filter {
    /// `builds` must hold every build of `pipeline` when `needs_builds()` is true.
    pub fn matches(&self, pipeline: &Pipeline, builds: &[&Build]) -> bool {
        match self {
            Filter::Ref(ref_) => pipeline.ref_ == *ref_,
            Filter::CreatedAfter(t) => pipeline.created_at >= *t,
            Filter::CreatedBefore(t) => pipeline.created_at < *t,
            Filter::NotSha(sha) => pipeline.sha != *sha,
            Filter::Excluding(id) => pipeline.id != *id,
            Filter::SourceIn(sources) => sources.contains(&pipeline.source),
            Filter::NotChild => !pipeline.is_child(),
            Filter::AliveOrScheduled => pipeline.status.is_alive_or_scheduled(),
            Filter::OnlyInterruptibleBuilds => !builds.iter().any(|b| b.blocks_auto_cancel()),
            Filter::IdIn(ids) => ids.contains(&pipeline.id),
            Filter::IdAfter(id) => pipeline.id > *id,
        }
    }

    pub fn needs_builds(&self) -> bool {
        matches!(self, Filter::OnlyInterruptibleBuilds)
    }
}

/// A lazily evaluated pipeline query.
///
/// A relation only describes which rows it wants. Every read through a
/// [`PipelineStore`](super::PipelineStore) evaluates it again against the
/// current data, so a retried read observes concurrent changes.
#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    scope: Scope,
    filters: Vec<Filter>,
    limit: Option<usize>,
}

impl Relation {
    pub fn empty() -> Self {
        Self::with_scope(Scope::Empty)
    }

    pub fn all() -> Self {
        Self::with_scope(Scope::All)
    }

    pub fn for_project(project_id: ProjectId) -> Self {
        Self::with_scope(Scope::Project(project_id))
    }

    /// Pipelines of `project_id` running for `ref_`.
    pub fn pipelines_for(project_id: ProjectId, ref_: &str) -> Self {
        Self::for_project(project_id).filter(Filter::Ref(ref_.to_string()))
    }

    /// Expands `base` to its rows and every descendant pipeline in the same
    /// project. Filters added afterwards apply to the expanded set.
    pub fn hierarchy_of(base: Relation) -> Self {
        Self::with_scope(Scope::HierarchyOf(Box::new(base)))
    }

    fn with_scope(scope: Scope) -> Self {
        Self {
            scope,
            filters: Vec::new(),
            limit: None,
        }
    }

    fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn created_after(self, timestamp: DateTime<Utc>) -> Self {
        self.filter(Filter::CreatedAfter(timestamp))
    }

    pub fn created_before(self, timestamp: DateTime<Utc>) -> Self {
        self.filter(Filter::CreatedBefore(timestamp))
    }

    /// Excludes pipelines for `sha`. An unknown SHA excludes nothing.
    pub fn where_not_sha(self, sha: Option<&str>) -> Self {
        match sha {
            Some(sha) => self.filter(Filter::NotSha(sha.to_string())),
            None => self,
        }
    }

    pub fn excluding(self, id: PipelineId) -> Self {
        self.filter(Filter::Excluding(id))
    }

    pub fn with_source_in(self, sources: Vec<PipelineSource>) -> Self {
        self.filter(Filter::SourceIn(sources))
    }

    pub fn not_child(self) -> Self {
        self.filter(Filter::NotChild)
    }

    pub fn alive_or_scheduled(self) -> Self {
        self.filter(Filter::AliveOrScheduled)
    }

    pub fn with_only_interruptible_builds(self) -> Self {
        self.filter(Filter::OnlyInterruptibleBuilds)
    }

    pub fn id_in(self, ids: Vec<PipelineId>) -> Self {
        self.filter(Filter::IdIn(ids))
    }

    pub fn id_after(self, id: PipelineId) -> Self {
        self.filter(Filter::IdAfter(id))
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    #[cfg(test)]
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn row_limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn is_empty_scope(&self) -> bool {
        self.scope == Scope::Empty
    }

    pub fn needs_builds(&self) -> bool {
        self.filters.iter().any(Filter::needs_builds)
    }

    pub fn matches(&self, pipeline: &Pipeline, builds: &[&Build]) -> bool {
        self.filters.iter().all(|f| f.matches(pipeline, builds))
    }
}
