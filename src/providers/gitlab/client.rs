use std::time::Duration;

use futures::future::join_all;
use log::{debug, warn};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use url::Url;

use crate::auth::Token;
use crate::domain::{ProjectId, RefHead};
use crate::error::{AutoCancelError, Result};

const MAX_RETRIES: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct BranchResponse {
    name: String,
    commit: CommitResponse,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    id: String,
    #[serde(default)]
    message: String,
}

/// Minimal GitLab REST client used to refresh ref heads.
pub struct GitLabClient {
    client: Client,
    api_url: Url,
    token: Option<Token>,
    retry_delay: Duration,
}

impl GitLabClient {
    pub fn new(base_url: &str, token: Option<Token>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("ci-autocancel/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AutoCancelError::Config(format!("Failed to create HTTP client: {e}")))?;

        let mut base = Url::parse(base_url)
            .map_err(|e| AutoCancelError::Config(format!("Invalid base URL: {e}")))?;
        // Without a trailing slash, join would replace the last path segment.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let api_url = base
            .join("api/v4/")
            .map_err(|e| AutoCancelError::Config(format!("Invalid API base URL: {e}")))?;

        Ok(Self {
            client,
            api_url,
            token,
            retry_delay: RETRY_DELAY,
        })
    }

    #[cfg(test)]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    fn auth_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.token {
            request.bearer_auth(token.as_str())
        } else {
            request
        }
    }

    /// `projects/:path/repository/branches/:branch`, with both parts encoded
    /// as single path segments.
    fn branch_url(&self, project_path: &str, branch: &str) -> Result<Url> {
        let mut url = self.api_url.clone();
        url.path_segments_mut()
            .map_err(|_| AutoCancelError::Config(format!("Invalid API base URL: {}", self.api_url)))?
            .pop_if_empty()
            .extend(["projects", project_path, "repository", "branches", branch]);
        Ok(url)
    }

    /// Current head of `branch`, or `None` when GitLab does not know it.
    pub async fn branch_head(
        &self,
        project_id: ProjectId,
        project_path: &str,
        branch: &str,
    ) -> Result<Option<RefHead>> {
        let url = self.branch_url(project_path, branch)?;

        let mut retry_count = 0;
        loop {
            let response = match self.auth_request(self.client.get(url.clone())).send().await {
                Ok(resp) => resp,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    if retry_count >= MAX_RETRIES {
                        return Err(e.into());
                    }
                    warn!(
                        "Network error ({}), retrying in {:?} ({}/{})...",
                        e,
                        self.retry_delay,
                        retry_count + 1,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    retry_count += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let status = response.status();

            if status == StatusCode::NOT_FOUND {
                debug!("Branch {branch} not found in {project_path}");
                return Ok(None);
            }

            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                if retry_count >= MAX_RETRIES {
                    return Err(AutoCancelError::ApiErrorAfterRetries {
                        status: status.as_u16(),
                        retries: MAX_RETRIES,
                    });
                }

                warn!(
                    "GitLab API error (status {status}). Waiting {:?} before retry {}/{}...",
                    self.retry_delay,
                    retry_count + 1,
                    MAX_RETRIES
                );
                tokio::time::sleep(self.retry_delay).await;
                retry_count += 1;
                continue;
            }

            if !status.is_success() {
                let error_text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unable to read error response".to_string());
                return Err(AutoCancelError::ApiError {
                    status: status.as_u16(),
                    message: error_text,
                });
            }

            let branch: BranchResponse = response.json().await?;
            return Ok(Some(RefHead {
                project_id,
                ref_: branch.name,
                sha: branch.commit.id,
                message: branch.commit.message,
            }));
        }
    }

    /// Fetches several branches concurrently, in the order given.
    pub async fn branch_heads(
        &self,
        project_id: ProjectId,
        project_path: &str,
        branches: &[String],
    ) -> Vec<(String, Result<Option<RefHead>>)> {
        let results = join_all(
            branches
                .iter()
                .map(|branch| self.branch_head(project_id, project_path, branch)),
        )
        .await;

        branches.iter().cloned().zip(results).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    const BRANCH_PATH: &str = r"^/api/v4/projects/group(%2F|/)project/repository/branches/main$";

    fn branch_body(sha: &str) -> String {
        format!(
            r#"{{"name":"main","merged":false,"commit":{{"id":"{sha}","short_id":"abc","message":"Merge branch 'fix' into 'main'"}}}}"#
        )
    }

    fn create_client(url: &str, token: Option<&str>) -> GitLabClient {
        GitLabClient::new(url, token.map(Token::from))
            .unwrap()
            .with_retry_delay(Duration::from_millis(1))
    }

    #[test]
    fn test_branch_url_encodes_project_path() {
        let client = create_client("https://gitlab.example.com", None);
        let url = client.branch_url("group/sub/project", "feature/login").unwrap();
        assert_eq!(
            url.as_str(),
            "https://gitlab.example.com/api/v4/projects/group%2Fsub%2Fproject/repository/branches/feature%2Flogin"
        );
    }

    #[test]
    fn test_base_url_keeps_relative_path() {
        for base in ["https://host.example/gitlab", "https://host.example/gitlab/"] {
            let client = create_client(base, None);
            let url = client.branch_url("group/project", "main").unwrap();
            assert_eq!(
                url.as_str(),
                "https://host.example/gitlab/api/v4/projects/group%2Fproject/repository/branches/main",
                "{base}"
            );
        }
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            GitLabClient::new("not a url", None),
            Err(AutoCancelError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_branch_head_parses_commit() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", Matcher::Regex(BRANCH_PATH.to_string()))
            .match_header("authorization", "Bearer glpat-secret")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(branch_body("0123abcd"))
            .create_async()
            .await;

        let client = create_client(&server.url(), Some("glpat-secret"));
        let head = client.branch_head(7, "group/project", "main").await.unwrap().unwrap();

        mock.assert_async().await;
        assert_eq!(head.project_id, 7);
        assert_eq!(head.ref_, "main");
        assert_eq!(head.sha, "0123abcd");
        assert!(head.message.starts_with("Merge branch"));
    }

    #[tokio::test]
    async fn test_missing_branch_is_none() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", Matcher::Regex(BRANCH_PATH.to_string()))
            .with_status(404)
            .with_body(r#"{"message":"404 Branch Not Found"}"#)
            .create_async()
            .await;

        let client = create_client(&server.url(), None);
        assert!(client.branch_head(1, "group/project", "main").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let mut server = mockito::Server::new_async().await;
        // Mocks with outstanding expected hits are served first.
        let failing = server
            .mock("GET", Matcher::Regex(BRANCH_PATH.to_string()))
            .with_status(502)
            .expect(2)
            .create_async()
            .await;
        let healthy = server
            .mock("GET", Matcher::Regex(BRANCH_PATH.to_string()))
            .with_status(200)
            .with_body(branch_body("feedbeef"))
            .expect(1)
            .create_async()
            .await;

        let client = create_client(&server.url(), None);
        let head = client.branch_head(1, "group/project", "main").await.unwrap();

        failing.assert_async().await;
        healthy.assert_async().await;
        assert_eq!(head.unwrap().sha, "feedbeef");
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", Matcher::Regex(BRANCH_PATH.to_string()))
            .with_status(429)
            .expect(MAX_RETRIES as usize + 1)
            .create_async()
            .await;

        let client = create_client(&server.url(), None);
        let err = client.branch_head(1, "group/project", "main").await.unwrap_err();

        mock.assert_async().await;
        assert!(matches!(
            err,
            AutoCancelError::ApiErrorAfterRetries {
                status: 429,
                retries: MAX_RETRIES
            }
        ));
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", Matcher::Regex(BRANCH_PATH.to_string()))
            .with_status(401)
            .with_body(r#"{"message":"401 Unauthorized"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = create_client(&server.url(), None);
        let err = client.branch_head(1, "group/project", "main").await.unwrap_err();

        mock.assert_async().await;
        assert!(matches!(err, AutoCancelError::ApiError { status: 401, .. }));
    }
}
