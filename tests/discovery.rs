use std::sync::Arc;

use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use flaky_test_cleaner::config::Config;
use flaky_test_cleaner::domain::FingerprintState;
use flaky_test_cleaner::fingerprint;
use flaky_test_cleaner::service::{Service, ServiceDeps};
use flaky_test_cleaner::store::{MemoryStore, Store};

const OWNER: &str = "test-owner";
const REPO: &str = "test-repo";
const WORKFLOW_ID: i64 = 3933317;
const RUN_ID: i64 = 101;
const JOB_ID: i64 = 202;
const ISSUE_NUMBER: i64 = 123;

async fn mount_ci_read(server: &MockServer, log: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/repos/{OWNER}/{REPO}/actions/workflows")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "workflows": [{"id": WORKFLOW_ID, "name": "PD Test"}]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!(
            "/repos/{OWNER}/{REPO}/actions/workflows/{WORKFLOW_ID}/runs"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "workflow_runs": [{
                "id": RUN_ID,
                "html_url": "https://example.com/run/101",
                "head_sha": "deadbeefdeadbeefdeadbeefdeadbeefdeadbeef",
                "head_branch": "master",
                "event": "push",
                "created_at": "2026-01-29T00:00:00Z"
            }]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!(
            "/repos/{OWNER}/{REPO}/actions/runs/{RUN_ID}/jobs"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jobs": [{
                "id": JOB_ID,
                "name": "PD Test (unit)",
                "conclusion": "failure",
                "runner_name": "",
                "labels": ["ubuntu-latest"]
            }]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!(
            "/repos/{OWNER}/{REPO}/actions/jobs/{JOB_ID}/logs"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_string(log))
        .mount(server)
        .await;
}

fn test_config(server: &MockServer) -> Config {
    let mut cfg = Config::for_tests();
    cfg.github_api_base_url = server.uri();
    cfg.base_branch = "master".into();
    cfg.dry_run = false;
    cfg
}

async fn service_with(server: &MockServer, store: Arc<MemoryStore>) -> Service {
    Service::new(
        test_config(server),
        ServiceDeps {
            store: Some(store),
            ..Default::default()
        },
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn discovery_happy_path_files_issue_and_posts_analysis() {
    let server = MockServer::start().await;
    let log = [
        "=== RUN   TestFoo",
        "--- FAIL: TestFoo (0.02s)",
        "    foo_test.go:12: expected true, got false",
        "FAIL",
        "exit status 1",
    ]
    .join("\n");
    mount_ci_read(&server, &log).await;

    // Labels pretend to already exist upstream.
    Mock::given(method("POST"))
        .and(path(format!("/repos/{OWNER}/{REPO}/labels")))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "message": "Validation Failed"
        })))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/repos/{OWNER}/{REPO}/issues")))
        .and(body_string_contains("[flaky] TestFoo"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "number": ISSUE_NUMBER, "title": "[flaky] TestFoo", "state": "open", "labels": []
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!(
            "/repos/{OWNER}/{REPO}/issues/{ISSUE_NUMBER}/comments"
        )))
        .and(body_string_contains("FTC:ISSUE_AGENT_START"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 1})))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let service = service_with(&server, Arc::clone(&store)).await;
    service.discovery_once().await.unwrap();

    // Exactly one fingerprint, linked to the issue and waiting for a signal.
    let waiting = store
        .list_fingerprints_by_state(FingerprintState::WaitingForSignal, 10)
        .await
        .unwrap();
    assert_eq!(waiting.len(), 1);
    let rec = &waiting[0];
    assert_eq!(rec.issue_number, ISSUE_NUMBER);
    assert_eq!(rec.test_name, "TestFoo");
    assert_eq!(rec.framework, "go-test");
    assert_eq!(rec.fingerprint_version, "v1");
    assert_eq!(rec.fingerprint.len(), 64);

    // Hashing contract: the stored occurrence re-derives its fingerprint.
    let occurrences = store
        .list_recent_occurrences(&rec.fingerprint, 5)
        .await
        .unwrap();
    assert_eq!(occurrences.len(), 1);
    let occ = &occurrences[0];
    let rehash = fingerprint::v1(fingerprint::V1Input {
        repo: &occ.repo,
        framework: &occ.framework,
        test_name: &occ.test_name,
        error_sig_norm: &fingerprint::normalize_error_signature(&occ.error_signature),
        platform: occ.platform_bucket(),
    });
    assert_eq!(rehash, rec.fingerprint);
    assert_eq!(occ.runner_os, "ubuntu-latest");

    let audits = store.audit_entries();
    assert!(audits
        .iter()
        .any(|a| a.action == "issueagent.initial_analysis" && a.result == "success"));
}

#[tokio::test]
async fn discovery_suppresses_infra_flakes() {
    let server = MockServer::start().await;
    let log = [
        "=== RUN   TestFoo",
        "--- FAIL: TestFoo (0.02s)",
        "    dial tcp 10.0.0.1:443: i/o timeout",
        "FAIL",
    ]
    .join("\n");
    mount_ci_read(&server, &log).await;
    Mock::given(method("POST"))
        .and(path(format!("/repos/{OWNER}/{REPO}/labels")))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/repos/{OWNER}/{REPO}/issues")))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let service = service_with(&server, Arc::clone(&store)).await;
    service.discovery_once().await.unwrap();

    let discovered = store
        .list_fingerprints_by_state(FingerprintState::Discovered, 10)
        .await
        .unwrap();
    assert_eq!(discovered.len(), 1);
    assert_eq!(discovered[0].class, "infra-flake");
    assert_eq!(discovered[0].issue_number, 0);
}

#[tokio::test]
async fn rediscovery_updates_issue_without_reposting_analysis() {
    let server = MockServer::start().await;
    let log = [
        "=== RUN   TestFoo",
        "--- FAIL: TestFoo (0.02s)",
        "    foo_test.go:12: expected true, got false",
        "FAIL",
    ]
    .join("\n");
    mount_ci_read(&server, &log).await;
    Mock::given(method("POST"))
        .and(path(format!("/repos/{OWNER}/{REPO}/labels")))
        .respond_with(ResponseTemplate::new(422))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/repos/{OWNER}/{REPO}/issues")))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "number": ISSUE_NUMBER, "title": "t", "state": "open", "labels": []
        })))
        .expect(1)
        .mount(&server)
        .await;
    // The second cycle refreshes the existing issue in place.
    Mock::given(method("PATCH"))
        .and(path(format!("/repos/{OWNER}/{REPO}/issues/{ISSUE_NUMBER}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "number": ISSUE_NUMBER, "title": "t", "state": "open", "labels": []
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!(
            "/repos/{OWNER}/{REPO}/issues/{ISSUE_NUMBER}/comments"
        )))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 1})))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let service = service_with(&server, Arc::clone(&store)).await;
    service.discovery_once().await.unwrap();
    service.discovery_once().await.unwrap();

    let waiting = store
        .list_fingerprints_by_state(FingerprintState::WaitingForSignal, 10)
        .await
        .unwrap();
    assert_eq!(waiting.len(), 1);
}

#[tokio::test]
async fn dry_run_discovery_writes_nothing_upstream() {
    let server = MockServer::start().await;
    let log = "--- FAIL: TestFoo (0.02s)\n    foo_test.go:12: boom";
    mount_ci_read(&server, log).await;
    Mock::given(method("POST"))
        .and(path(format!("/repos/{OWNER}/{REPO}/issues")))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let mut cfg = test_config(&server);
    cfg.dry_run = true;
    let store = Arc::new(MemoryStore::new());
    let service = Service::new(
        cfg,
        ServiceDeps {
            store: Some(Arc::clone(&store) as Arc<dyn Store>),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    service.discovery_once().await.unwrap();

    // The store still learns about the failure.
    let discovered = store
        .list_fingerprints_by_state(FingerprintState::Discovered, 10)
        .await
        .unwrap();
    assert_eq!(discovered.len(), 1);
    assert_eq!(discovered[0].issue_number, 0);
}
