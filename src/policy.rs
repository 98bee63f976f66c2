use serde::{Deserialize, Serialize};

use crate::domain::{Project, ProjectId};

/// Settings and feature-flag answers for one project, resolved once per
/// execution and passed down explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Policy {
    pub auto_cancel_pending_pipelines: bool,
    pub use_hierarchy_strategy: bool,
}

impl Policy {
    pub fn resolve(provider: &dyn PolicyProvider, project: &Project) -> Self {
        Self {
            auto_cancel_pending_pipelines: provider.auto_cancel_pending_pipelines_enabled(project),
            use_hierarchy_strategy: provider.use_hierarchy_strategy(project),
        }
    }
}

/// Source of project settings and feature flags.
pub trait PolicyProvider: Send + Sync {
    fn auto_cancel_pending_pipelines_enabled(&self, project: &Project) -> bool;

    /// Whether redundant pipelines are found through parent/child hierarchy
    /// expansion instead of the flat same-ref scan.
    fn use_hierarchy_strategy(&self, project: &Project) -> bool;

    /// Whether the schedule worker checks `next_run_at` and advances it
    /// itself before creating a pipeline.
    fn run_pipeline_schedule_worker_enabled(&self, _project: &Project) -> bool {
        true
    }
}

/// A feature flag that is either globally on or enabled for listed projects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FeatureFlag {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub projects: Vec<ProjectId>,
}

impl FeatureFlag {
    pub fn on() -> Self {
        Self {
            enabled: true,
            projects: Vec::new(),
        }
    }

    pub fn enabled_for(&self, project_id: ProjectId) -> bool {
        self.enabled || self.projects.contains(&project_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FeatureFlags {
    /// Selects the hierarchy strategy for candidate selection
    #[serde(default)]
    pub move_cancel_pending_pipelines_to_async: FeatureFlag,

    /// Lets the schedule worker check and advance `next_run_at` itself
    #[serde(default = "FeatureFlag::on")]
    pub ci_use_run_pipeline_schedule_worker: FeatureFlag,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            move_cancel_pending_pipelines_to_async: FeatureFlag::default(),
            ci_use_run_pipeline_schedule_worker: FeatureFlag::on(),
        }
    }
}

impl PolicyProvider for FeatureFlags {
    fn auto_cancel_pending_pipelines_enabled(&self, project: &Project) -> bool {
        project.auto_cancel_pending_pipelines
    }

    fn use_hierarchy_strategy(&self, project: &Project) -> bool {
        self.move_cancel_pending_pipelines_to_async
            .enabled_for(project.id)
    }

    fn run_pipeline_schedule_worker_enabled(&self, project: &Project) -> bool {
        self.ci_use_run_pipeline_schedule_worker
            .enabled_for(project.id)
    }
}
