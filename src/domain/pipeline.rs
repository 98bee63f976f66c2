use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::Status;

pub type ProjectId = u64;
pub type PipelineId = u64;
pub type BuildId = u64;
pub type UserId = u64;

/// What caused a pipeline to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineSource {
    #[default]
    Unknown,
    Push,
    Web,
    Trigger,
    Schedule,
    Api,
    External,
    /// Downstream pipeline triggered from another project
    Pipeline,
    Chat,
    Webide,
    MergeRequestEvent,
    ExternalPullRequestEvent,
    /// Child pipeline triggered from a pipeline in the same project
    ParentPipeline,
    OndemandDastScan,
    OndemandDastValidation,
    SecurityOrchestrationPolicy,
    ContainerRegistryPush,
}

impl PipelineSource {
    pub const ALL: [PipelineSource; 17] = [
        PipelineSource::Unknown,
        PipelineSource::Push,
        PipelineSource::Web,
        PipelineSource::Trigger,
        PipelineSource::Schedule,
        PipelineSource::Api,
        PipelineSource::External,
        PipelineSource::Pipeline,
        PipelineSource::Chat,
        PipelineSource::Webide,
        PipelineSource::MergeRequestEvent,
        PipelineSource::ExternalPullRequestEvent,
        PipelineSource::ParentPipeline,
        PipelineSource::OndemandDastScan,
        PipelineSource::OndemandDastValidation,
        PipelineSource::SecurityOrchestrationPolicy,
        PipelineSource::ContainerRegistryPush,
    ];

    /// Sources that do not belong to the regular CI flow of a ref.
    pub fn is_dangling(self) -> bool {
        matches!(
            self,
            PipelineSource::Webide
                | PipelineSource::ParentPipeline
                | PipelineSource::OndemandDastScan
                | PipelineSource::OndemandDastValidation
                | PipelineSource::SecurityOrchestrationPolicy
                | PipelineSource::ContainerRegistryPush
        )
    }

    pub fn is_ci(self) -> bool {
        !self.is_dangling()
    }

    pub fn ci_sources() -> Vec<PipelineSource> {
        Self::ALL.into_iter().filter(|s| s.is_ci()).collect()
    }

    pub fn ci_and_parent_sources() -> Vec<PipelineSource> {
        Self::ALL
            .into_iter()
            .filter(|s| s.is_ci() || *s == PipelineSource::ParentPipeline)
            .collect()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineSource::Unknown => "unknown",
            PipelineSource::Push => "push",
            PipelineSource::Web => "web",
            PipelineSource::Trigger => "trigger",
            PipelineSource::Schedule => "schedule",
            PipelineSource::Api => "api",
            PipelineSource::External => "external",
            PipelineSource::Pipeline => "pipeline",
            PipelineSource::Chat => "chat",
            PipelineSource::Webide => "webide",
            PipelineSource::MergeRequestEvent => "merge_request_event",
            PipelineSource::ExternalPullRequestEvent => "external_pull_request_event",
            PipelineSource::ParentPipeline => "parent_pipeline",
            PipelineSource::OndemandDastScan => "ondemand_dast_scan",
            PipelineSource::OndemandDastValidation => "ondemand_dast_validation",
            PipelineSource::SecurityOrchestrationPolicy => "security_orchestration_policy",
            PipelineSource::ContainerRegistryPush => "container_registry_push",
        }
    }
}

impl fmt::Display for PipelineSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineSource {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|source| source.as_str() == value)
            .ok_or_else(|| format!("unknown pipeline source: {value}"))
    }
}

/// A persisted CI pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: PipelineId,
    pub project_id: ProjectId,
    /// Branch or tag the pipeline runs for
    #[serde(rename = "ref")]
    pub ref_: String,
    /// Commit SHA the pipeline was created for
    pub sha: String,
    #[serde(default)]
    pub source: PipelineSource,
    #[serde(default)]
    pub status: Status,
    pub created_at: DateTime<Utc>,
    /// Same-project parent when this is a child pipeline
    #[serde(default)]
    pub parent_id: Option<PipelineId>,
    /// Pipeline whose creation canceled this one. Written once.
    #[serde(default)]
    pub auto_canceled_by_id: Option<PipelineId>,
    /// Row version, bumped on every write
    #[serde(default)]
    pub lock_version: u64,
}

impl Pipeline {
    pub fn is_child(&self) -> bool {
        self.parent_id.is_some()
    }
}

/// A job belonging to exactly one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub pipeline_id: PipelineId,
    pub name: String,
    #[serde(default)]
    pub status: Status,
    /// Set by the pipeline author when the job is safe to cancel mid-run
    #[serde(default)]
    pub interruptible: bool,
    #[serde(default)]
    pub auto_canceled_by_id: Option<PipelineId>,
}

impl Build {
    /// A build blocks auto-cancellation while it can still make progress and
    /// was not declared interruptible.
    pub fn blocks_auto_cancel(&self) -> bool {
        !self.status.is_completed() && !self.interruptible
    }
}

/// Job definition used when a new pipeline is created for a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTemplate {
    pub name: String,
    #[serde(default)]
    pub interruptible: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    /// Full path, e.g. "group/project"
    pub path: String,
    /// Project setting: cancel redundant pipelines when a newer one is created
    #[serde(default = "default_auto_cancel")]
    pub auto_cancel_pending_pipelines: bool,
    /// Set when the project's CI configuration cannot be processed
    #[serde(default)]
    pub ci_config_error: Option<String>,
    #[serde(default)]
    pub ci_jobs: Vec<JobTemplate>,
}

fn default_auto_cancel() -> bool {
    true
}

/// Commit currently at the tip of a ref.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefHead {
    pub project_id: ProjectId,
    #[serde(rename = "ref")]
    pub ref_: String,
    pub sha: String,
    #[serde(default)]
    pub message: String,
}

impl RefHead {
    pub fn requests_ci_skip(&self) -> bool {
        let message = self.message.to_lowercase();
        message.contains("[ci skip]") || message.contains("[skip ci]")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
}
