use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, RETRY_AFTER, USER_AGENT};
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{CiProvider, GitHubError, IssueService};
use crate::domain::{
    CombinedStatus, CreateIssueInput, CreatePullRequestInput, Issue, IssueComment, Job,
    ListIssueCommentsOptions, ListRunJobsOptions, ListWorkflowRunsOptions, PullRequest,
    PullRequestReview, UpdateIssueInput, Workflow, WorkflowRun,
};

const DEFAULT_BASE_URL: &str = "https://api.github.com";
const ACCEPT_JSON: &str = "application/vnd.github+json";
const AGENT: &str = "flaky-test-cleaner";
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(2);

/// Thin GitHub REST client. The bot holds two instances of this type, one
/// with the read token and one with the write token; in dry-run they are the
/// same value.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    http: reqwest::Client,
    token: String,
    base_url: String,
}

impl GitHubClient {
    pub fn new(token: impl Into<String>, timeout: Duration) -> Result<Self, GitHubError> {
        Self::with_base_url(token, timeout, DEFAULT_BASE_URL)
    }

    /// Points the client at a different API root; tests aim this at a local
    /// mock server.
    pub fn with_base_url(
        token: impl Into<String>,
        timeout: Duration,
        base_url: impl Into<String>,
    ) -> Result<Self, GitHubError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(GitHubClient {
            http,
            token: token.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// One request with a single retry on transient statuses. The request is
    /// rebuilt from parts on retry so the body survives.
    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        payload: Option<&serde_json::Value>,
    ) -> Result<Response, GitHubError> {
        let url = format!("{}{}", self.base_url, path);
        for attempt in 0..2 {
            let mut req = self
                .http
                .request(method.clone(), &url)
                .header(ACCEPT, ACCEPT_JSON)
                .header(USER_AGENT, AGENT);
            if !self.token.is_empty() {
                req = req.bearer_auth(&self.token);
            }
            if !query.is_empty() {
                req = req.query(query);
            }
            if let Some(payload) = payload {
                req = req.json(payload);
            }
            let resp = req.send().await?;
            let status = resp.status();
            if attempt == 0 && is_transient(status) {
                let wait = retry_after(&resp);
                warn!(%status, ?wait, "github request throttled, retrying once");
                tokio::time::sleep(wait).await;
                continue;
            }
            return Ok(resp);
        }
        unreachable!("request loop always returns on the second attempt")
    }

    async fn do_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        payload: Option<&serde_json::Value>,
    ) -> Result<T, GitHubError> {
        let resp = self.send(method, path, query, payload).await?;
        let status = resp.status();
        let body = resp.bytes().await?;
        if status == StatusCode::NOT_FOUND {
            return Err(GitHubError::NotFound);
        }
        if !status.is_success() {
            return Err(GitHubError::Api {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(serde_json::from_slice(&body)?)
    }

    async fn do_empty(
        &self,
        method: Method,
        path: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<(), GitHubError> {
        let resp = self.send(method, path, &[], payload).await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(GitHubError::NotFound);
        }
        if !status.is_success() {
            let body = resp.bytes().await.unwrap_or_default();
            return Err(GitHubError::Api {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(())
    }

    async fn create_label(&self, owner: &str, repo: &str, name: &str) -> Result<(), GitHubError> {
        let payload = json!({
            "name": name,
            "color": "ededed",
            "description": "managed by flaky-test-cleaner",
        });
        self.do_empty(
            Method::POST,
            &format!("/repos/{owner}/{repo}/labels"),
            Some(&payload),
        )
        .await
    }
}

fn is_transient(status: StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 502 | 503 | 504)
}

fn retry_after(resp: &Response) -> Duration {
    resp.headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

/// Empty list instead of an error when a list endpoint 404s; the workflow
/// lookup is the only read that surfaces NotFound.
fn not_found_as_empty<T>(result: Result<Vec<T>, GitHubError>) -> Result<Vec<T>, GitHubError> {
    match result {
        Err(GitHubError::NotFound) => Ok(Vec::new()),
        other => other,
    }
}

fn pick_runner_label(labels: &[String]) -> String {
    for label in labels {
        let lower = label.to_lowercase();
        if lower.contains("ubuntu") || lower.contains("macos") || lower.contains("windows") {
            return label.clone();
        }
    }
    labels.first().cloned().unwrap_or_default()
}

#[derive(Deserialize)]
struct WorkflowList {
    #[serde(default)]
    workflows: Vec<Workflow>,
}

#[derive(Deserialize)]
struct WorkflowRunList {
    #[serde(default)]
    workflow_runs: Vec<WorkflowRun>,
}

#[derive(Deserialize)]
struct JobList {
    #[serde(default)]
    jobs: Vec<Job>,
}

#[async_trait]
impl CiProvider for GitHubClient {
    async fn find_workflow_by_name(
        &self,
        owner: &str,
        repo: &str,
        name: &str,
    ) -> Result<Workflow, GitHubError> {
        let list: WorkflowList = self
            .do_json(
                Method::GET,
                &format!("/repos/{owner}/{repo}/actions/workflows"),
                &[],
                None,
            )
            .await?;
        list.workflows
            .into_iter()
            .find(|wf| wf.name.eq_ignore_ascii_case(name))
            .ok_or(GitHubError::NotFound)
    }

    async fn list_workflow_runs(
        &self,
        owner: &str,
        repo: &str,
        workflow_id: i64,
        opts: &ListWorkflowRunsOptions,
    ) -> Result<Vec<WorkflowRun>, GitHubError> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if !opts.status.is_empty() {
            query.push(("status", opts.status.clone()));
        }
        if !opts.branch.is_empty() {
            query.push(("branch", opts.branch.clone()));
        }
        if !opts.event.is_empty() {
            query.push(("event", opts.event.clone()));
        }
        if opts.per_page > 0 {
            query.push(("per_page", opts.per_page.to_string()));
        }
        let result = self
            .do_json::<WorkflowRunList>(
                Method::GET,
                &format!("/repos/{owner}/{repo}/actions/workflows/{workflow_id}/runs"),
                &query,
                None,
            )
            .await
            .map(|list| list.workflow_runs);
        not_found_as_empty(result)
    }

    async fn list_run_jobs(
        &self,
        owner: &str,
        repo: &str,
        run_id: i64,
        opts: &ListRunJobsOptions,
    ) -> Result<Vec<Job>, GitHubError> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if opts.per_page > 0 {
            query.push(("per_page", opts.per_page.to_string()));
        }
        let result = self
            .do_json::<JobList>(
                Method::GET,
                &format!("/repos/{owner}/{repo}/actions/runs/{run_id}/jobs"),
                &query,
                None,
            )
            .await
            .map(|list| {
                let mut jobs = list.jobs;
                for job in &mut jobs {
                    job.runner_os = if job.runner_name.is_empty() {
                        pick_runner_label(&job.labels)
                    } else {
                        job.runner_name.clone()
                    };
                }
                jobs
            });
        not_found_as_empty(result)
    }

    async fn download_job_logs(
        &self,
        owner: &str,
        repo: &str,
        job_id: i64,
    ) -> Result<Vec<u8>, GitHubError> {
        let resp = self
            .send(
                Method::GET,
                &format!("/repos/{owner}/{repo}/actions/jobs/{job_id}/logs"),
                &[],
                None,
            )
            .await?;
        let status = resp.status();
        let body = resp.bytes().await?;
        if status == StatusCode::NOT_FOUND {
            return Err(GitHubError::NotFound);
        }
        if !status.is_success() {
            return Err(GitHubError::Api {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        debug!(job_id, bytes = body.len(), "downloaded job logs");
        Ok(body.to_vec())
    }
}

#[async_trait]
impl IssueService for GitHubClient {
    async fn ensure_labels(
        &self,
        owner: &str,
        repo: &str,
        labels: &[String],
    ) -> Result<(), GitHubError> {
        for label in labels {
            if label.trim().is_empty() {
                continue;
            }
            match self.create_label(owner, repo, label).await {
                Ok(()) => {}
                // 422 means the label already exists.
                Err(GitHubError::Api { status: 422, .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn create_issue(
        &self,
        owner: &str,
        repo: &str,
        input: &CreateIssueInput,
    ) -> Result<Issue, GitHubError> {
        let payload = json!({
            "title": input.title,
            "body": input.body,
            "labels": input.labels,
        });
        self.do_json(
            Method::POST,
            &format!("/repos/{owner}/{repo}/issues"),
            &[],
            Some(&payload),
        )
        .await
    }

    async fn update_issue(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
        input: &UpdateIssueInput,
    ) -> Result<Issue, GitHubError> {
        let mut payload = serde_json::Map::new();
        if let Some(title) = &input.title {
            payload.insert("title".into(), json!(title));
        }
        if let Some(body) = &input.body {
            payload.insert("body".into(), json!(body));
        }
        if let Some(labels) = &input.labels {
            payload.insert("labels".into(), json!(labels));
        }
        if let Some(state) = &input.state {
            payload.insert("state".into(), json!(state));
        }
        let payload = serde_json::Value::Object(payload);
        self.do_json(
            Method::PATCH,
            &format!("/repos/{owner}/{repo}/issues/{number}"),
            &[],
            Some(&payload),
        )
        .await
    }

    async fn get_issue(&self, owner: &str, repo: &str, number: i64) -> Result<Issue, GitHubError> {
        self.do_json(
            Method::GET,
            &format!("/repos/{owner}/{repo}/issues/{number}"),
            &[],
            None,
        )
        .await
    }

    async fn create_issue_comment(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
        body: &str,
    ) -> Result<(), GitHubError> {
        let payload = json!({ "body": body });
        self.do_empty(
            Method::POST,
            &format!("/repos/{owner}/{repo}/issues/{number}/comments"),
            Some(&payload),
        )
        .await
    }

    async fn list_issue_comments(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
        opts: &ListIssueCommentsOptions,
    ) -> Result<Vec<IssueComment>, GitHubError> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if opts.per_page > 0 {
            query.push(("per_page", opts.per_page.to_string()));
        }
        let result = self
            .do_json(
                Method::GET,
                &format!("/repos/{owner}/{repo}/issues/{number}/comments"),
                &query,
                None,
            )
            .await;
        not_found_as_empty(result)
    }

    async fn list_pull_request_reviews(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
    ) -> Result<Vec<PullRequestReview>, GitHubError> {
        let result = self
            .do_json(
                Method::GET,
                &format!("/repos/{owner}/{repo}/pulls/{number}/reviews"),
                &[],
                None,
            )
            .await;
        not_found_as_empty(result)
    }

    async fn get_combined_status(
        &self,
        owner: &str,
        repo: &str,
        git_ref: &str,
    ) -> Result<CombinedStatus, GitHubError> {
        self.do_json(
            Method::GET,
            &format!("/repos/{owner}/{repo}/commits/{git_ref}/status"),
            &[],
            None,
        )
        .await
    }

    async fn get_pull_request(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
    ) -> Result<PullRequest, GitHubError> {
        self.do_json(
            Method::GET,
            &format!("/repos/{owner}/{repo}/pulls/{number}"),
            &[],
            None,
        )
        .await
    }

    async fn create_pull_request(
        &self,
        owner: &str,
        repo: &str,
        input: &CreatePullRequestInput,
    ) -> Result<PullRequest, GitHubError> {
        let payload = json!({
            "title": input.title,
            "head": input.head,
            "base": input.base,
            "body": input.body,
            "draft": input.draft,
        });
        self.do_json(
            Method::POST,
            &format!("/repos/{owner}/{repo}/pulls"),
            &[],
            Some(&payload),
        )
        .await
    }

    async fn add_issue_labels(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
        labels: &[String],
    ) -> Result<(), GitHubError> {
        let payload = json!({ "labels": labels });
        self.do_empty(
            Method::POST,
            &format!("/repos/{owner}/{repo}/issues/{number}/labels"),
            Some(&payload),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_statuses() {
        assert!(is_transient(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient(StatusCode::BAD_GATEWAY));
        assert!(is_transient(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_transient(StatusCode::GATEWAY_TIMEOUT));
        assert!(!is_transient(StatusCode::NOT_FOUND));
        assert!(!is_transient(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn runner_label_prefers_os_labels() {
        let labels = vec!["self-hosted".to_string(), "ubuntu-latest".to_string()];
        assert_eq!(pick_runner_label(&labels), "ubuntu-latest");
        let labels = vec!["custom-pool".to_string()];
        assert_eq!(pick_runner_label(&labels), "custom-pool");
        assert_eq!(pick_runner_label(&[]), "");
    }
}
