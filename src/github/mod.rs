mod client;

pub use client::GitHubClient;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{
    CombinedStatus, CreateIssueInput, CreatePullRequestInput, Issue, IssueComment, Job,
    ListIssueCommentsOptions, ListRunJobsOptions, ListWorkflowRunsOptions, PullRequest,
    PullRequestReview, UpdateIssueInput, Workflow, WorkflowRun,
};

#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("github resource not found")]
    NotFound,
    #[error("github api error: {status} {message}")]
    Api { status: u16, message: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("github response decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

impl GitHubError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, GitHubError::NotFound)
    }
}

/// Read surface of the code-hosting service: workflows, runs, jobs, logs.
#[async_trait]
pub trait CiProvider: Send + Sync {
    async fn find_workflow_by_name(
        &self,
        owner: &str,
        repo: &str,
        name: &str,
    ) -> Result<Workflow, GitHubError>;

    async fn list_workflow_runs(
        &self,
        owner: &str,
        repo: &str,
        workflow_id: i64,
        opts: &ListWorkflowRunsOptions,
    ) -> Result<Vec<WorkflowRun>, GitHubError>;

    async fn list_run_jobs(
        &self,
        owner: &str,
        repo: &str,
        run_id: i64,
        opts: &ListRunJobsOptions,
    ) -> Result<Vec<Job>, GitHubError>;

    async fn download_job_logs(
        &self,
        owner: &str,
        repo: &str,
        job_id: i64,
    ) -> Result<Vec<u8>, GitHubError>;
}

/// Write surface: issues, labels, comments, pull requests, statuses.
#[async_trait]
pub trait IssueService: Send + Sync {
    async fn ensure_labels(
        &self,
        owner: &str,
        repo: &str,
        labels: &[String],
    ) -> Result<(), GitHubError>;

    async fn create_issue(
        &self,
        owner: &str,
        repo: &str,
        input: &CreateIssueInput,
    ) -> Result<Issue, GitHubError>;

    async fn update_issue(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
        input: &UpdateIssueInput,
    ) -> Result<Issue, GitHubError>;

    async fn get_issue(&self, owner: &str, repo: &str, number: i64) -> Result<Issue, GitHubError>;

    async fn create_issue_comment(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
        body: &str,
    ) -> Result<(), GitHubError>;

    async fn list_issue_comments(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
        opts: &ListIssueCommentsOptions,
    ) -> Result<Vec<IssueComment>, GitHubError>;

    async fn list_pull_request_reviews(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
    ) -> Result<Vec<PullRequestReview>, GitHubError>;

    async fn get_combined_status(
        &self,
        owner: &str,
        repo: &str,
        git_ref: &str,
    ) -> Result<CombinedStatus, GitHubError>;

    async fn get_pull_request(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
    ) -> Result<PullRequest, GitHubError>;

    async fn create_pull_request(
        &self,
        owner: &str,
        repo: &str,
        input: &CreatePullRequestInput,
    ) -> Result<PullRequest, GitHubError>;

    async fn add_issue_labels(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
        labels: &[String],
    ) -> Result<(), GitHubError>;
}
