use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use flaky_test_cleaner::domain::{
    CreateIssueInput, CreatePullRequestInput, ListIssueCommentsOptions, ListRunJobsOptions,
    ListWorkflowRunsOptions, UpdateIssueInput,
};
use flaky_test_cleaner::github::{CiProvider, GitHubClient, GitHubError, IssueService};

fn client(server: &MockServer) -> GitHubClient {
    GitHubClient::with_base_url("test-token", Duration::from_secs(5), server.uri()).unwrap()
}

#[tokio::test]
async fn requests_carry_bearer_token_and_accept_header() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/o/r/actions/workflows"))
        .and(header("authorization", "Bearer test-token"))
        .and(header("accept", "application/vnd.github+json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "workflows": [{"id": 7, "name": "PD Test"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let wf = client(&server)
        .find_workflow_by_name("o", "r", "pd test")
        .await
        .unwrap();
    assert_eq!(wf.id, 7);
    assert_eq!(wf.name, "PD Test");
}

#[tokio::test]
async fn workflow_lookup_surfaces_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/o/r/actions/workflows"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"workflows": []})))
        .mount(&server)
        .await;

    let err = client(&server)
        .find_workflow_by_name("o", "r", "missing")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn transient_errors_are_retried_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/o/r/actions/workflows/7/runs"))
        .respond_with(
            ResponseTemplate::new(503).insert_header("Retry-After", "0"),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/o/r/actions/workflows/7/runs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "workflow_runs": [{
                "id": 100,
                "html_url": "https://example.com/run/100",
                "head_sha": "deadbeef",
                "head_branch": "master",
                "event": "push",
                "created_at": "2026-01-29T00:00:00Z"
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let runs = client(&server)
        .list_workflow_runs(
            "o",
            "r",
            7,
            &ListWorkflowRunsOptions {
                status: "failure".into(),
                branch: "master".into(),
                per_page: 20,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, 100);
}

#[tokio::test]
async fn run_list_passes_filters_and_maps_404_to_empty() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/o/r/actions/workflows/7/runs"))
        .and(query_param("status", "failure"))
        .and(query_param("branch", "master"))
        .and(query_param("per_page", "20"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let runs = client(&server)
        .list_workflow_runs(
            "o",
            "r",
            7,
            &ListWorkflowRunsOptions {
                status: "failure".into(),
                branch: "master".into(),
                per_page: 20,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(runs.is_empty());
}

#[tokio::test]
async fn jobs_derive_runner_os_from_name_or_labels() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/o/r/actions/runs/100/jobs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jobs": [
                {"id": 1, "name": "unit", "conclusion": "failure",
                 "runner_name": "GitHub Actions 12", "labels": ["ubuntu-latest"]},
                {"id": 2, "name": "integration", "conclusion": "failure",
                 "runner_name": "", "labels": ["self-hosted", "macos-14"]}
            ]
        })))
        .mount(&server)
        .await;

    let jobs = client(&server)
        .list_run_jobs("o", "r", 100, &ListRunJobsOptions { per_page: 50 })
        .await
        .unwrap();
    assert_eq!(jobs[0].runner_os, "GitHub Actions 12");
    assert_eq!(jobs[1].runner_os, "macos-14");
}

#[tokio::test]
async fn job_logs_download_as_raw_bytes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/o/r/actions/jobs/55/logs"))
        .respond_with(ResponseTemplate::new(200).set_body_string("--- FAIL: TestFoo (0.01s)\n"))
        .mount(&server)
        .await;

    let raw = client(&server).download_job_logs("o", "r", 55).await.unwrap();
    assert_eq!(raw, b"--- FAIL: TestFoo (0.01s)\n");
}

#[tokio::test]
async fn ensure_labels_tolerates_already_exists() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/repos/o/r/labels"))
        .and(body_partial_json(json!({"name": "flaky-test-cleaner/ai-managed"})))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/repos/o/r/labels"))
        .and(body_partial_json(json!({"name": "flaky-test-cleaner/flaky-test"})))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "message": "Validation Failed",
            "errors": [{"code": "already_exists"}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    client(&server)
        .ensure_labels(
            "o",
            "r",
            &[
                "flaky-test-cleaner/ai-managed".to_string(),
                "flaky-test-cleaner/flaky-test".to_string(),
                "  ".to_string(),
            ],
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn ensure_labels_propagates_other_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/repos/o/r/labels"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let err = client(&server)
        .ensure_labels("o", "r", &["x".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, GitHubError::Api { status: 500, .. }));
}

#[tokio::test]
async fn issues_create_and_update() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/repos/o/r/issues"))
        .and(body_partial_json(json!({"title": "[flaky] TestFoo"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "number": 12, "title": "[flaky] TestFoo", "body": "b", "labels": [], "state": "open"
        })))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/repos/o/r/issues/12"))
        .and(body_partial_json(json!({"state": "closed"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "number": 12, "title": "[flaky] TestFoo", "state": "closed"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let c = client(&server);
    let created = c
        .create_issue(
            "o",
            "r",
            &CreateIssueInput {
                title: "[flaky] TestFoo".into(),
                body: "b".into(),
                labels: vec![],
            },
        )
        .await
        .unwrap();
    assert_eq!(created.number, 12);

    // Partial update: only the state field is serialized.
    let updated = c
        .update_issue(
            "o",
            "r",
            12,
            &UpdateIssueInput {
                state: Some("closed".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.state, "closed");
}

#[tokio::test]
async fn comments_and_reviews_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/o/r/issues/12/comments"))
        .and(query_param("per_page", "50"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 900, "body": "/ai-fix please", "user": {"login": "maintainer"},
             "created_at": "2026-01-29T00:00:00Z"}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/o/r/pulls/9/reviews"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 1, "state": "CHANGES_REQUESTED", "body": "fix it",
             "user": {"login": "reviewer"}, "submitted_at": "2026-01-29T01:00:00Z"}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/repos/o/r/issues/12/comments"))
        .and(body_partial_json(json!({"body": "hello"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 901})))
        .expect(1)
        .mount(&server)
        .await;

    let c = client(&server);
    let comments = c
        .list_issue_comments("o", "r", 12, &ListIssueCommentsOptions { per_page: 50 })
        .await
        .unwrap();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].user.login, "maintainer");

    let reviews = c.list_pull_request_reviews("o", "r", 9).await.unwrap();
    assert_eq!(reviews[0].state, "CHANGES_REQUESTED");

    c.create_issue_comment("o", "r", 12, "hello").await.unwrap();
}

#[tokio::test]
async fn pull_request_and_status_endpoints() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/repos/o/r/pulls"))
        .and(body_partial_json(json!({"head": "ai/fix/abc", "base": "master"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "number": 40, "html_url": "https://example.com/pr/40", "state": "open",
            "merged": false, "merged_at": null,
            "head": {"ref": "ai/fix/abc", "sha": "cafebabe"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/o/r/pulls/40"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "number": 40, "html_url": "https://example.com/pr/40", "state": "closed",
            "merged": true, "merged_at": "2026-01-30T00:00:00Z",
            "head": {"ref": "ai/fix/abc", "sha": "cafebabe"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/o/r/commits/cafebabe/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "state": "failure",
            "statuses": [{"state": "failure", "context": "ci/test",
                          "description": "2 failed", "target_url": "",
                          "updated_at": "2026-01-30T00:00:00Z"}]
        })))
        .mount(&server)
        .await;

    let c = client(&server);
    let pr = c
        .create_pull_request(
            "o",
            "r",
            &CreatePullRequestInput {
                title: "[AI] Stabilize TestFoo".into(),
                head: "ai/fix/abc".into(),
                base: "master".into(),
                body: "body".into(),
                draft: false,
            },
        )
        .await
        .unwrap();
    assert_eq!(pr.number, 40);
    assert!(!pr.is_merged());

    let fetched = c.get_pull_request("o", "r", 40).await.unwrap();
    assert!(fetched.is_merged());

    let status = c.get_combined_status("o", "r", "cafebabe").await.unwrap();
    assert_eq!(status.state, "failure");
    assert_eq!(status.statuses[0].context, "ci/test");
}
