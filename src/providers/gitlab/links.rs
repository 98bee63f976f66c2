use crate::domain::PipelineId;

/// Web links into one project of a GitLab instance.
///
/// # Example
///
/// `PipelineLinks::new("https://gitlab.com/", "group/project").pipeline(123)`
/// gives `https://gitlab.com/group/project/-/pipelines/123`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineLinks {
    base_url: String,
    project_path: String,
}

impl PipelineLinks {
    pub fn new(base_url: &str, project_path: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            project_path: project_path.trim_matches('/').to_string(),
        }
    }

    pub fn pipeline(&self, id: PipelineId) -> String {
        pipeline_url(&self.base_url, &self.project_path, id)
    }
}

/// Clickable URL of a pipeline page, e.g.
/// <https://gitlab.com/group/project/-/pipelines/123>.
fn pipeline_url(base_url: &str, project_path: &str, id: PipelineId) -> String {
    format!("{base_url}/{project_path}/-/pipelines/{id}")
}
