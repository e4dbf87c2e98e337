use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use tempfile::TempDir;

use flaky_test_cleaner::workspace::{WorkspaceError, WorkspaceManager, WorkspaceOptions};

fn run_git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("spawn git {args:?}: {e}"));
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn init_origin(root: &Path) -> (PathBuf, String) {
    let origin = root.join("origin");
    std::fs::create_dir_all(&origin).unwrap();
    run_git(&origin, &["init"]);
    run_git(&origin, &["config", "user.email", "ci@example.com"]);
    run_git(&origin, &["config", "user.name", "CI"]);
    std::fs::write(origin.join("README.md"), "hello workspace\n").unwrap();
    run_git(&origin, &["add", "."]);
    run_git(&origin, &["commit", "-m", "init"]);
    let sha = run_git(&origin, &["rev-parse", "HEAD"]).trim().to_string();
    (origin, sha)
}

fn manager(root: &Path, origin: &Path, max: usize) -> Arc<WorkspaceManager> {
    WorkspaceManager::new(WorkspaceOptions {
        remote_url: origin.to_string_lossy().into_owned(),
        mirror_dir: root.join("mirror.git"),
        worktrees_dir: root.join("worktrees"),
        max_worktrees: max,
        git_binary: "git".into(),
    })
    .unwrap()
}

#[tokio::test]
async fn mirror_read_helpers_and_lease_lifecycle() {
    let root = TempDir::new().unwrap();
    let (origin, sha) = init_origin(root.path());
    let mgr = manager(root.path(), &origin, 1);
    mgr.ensure().await.unwrap();

    let content = mgr.cat_file(&sha, "README.md").await.unwrap();
    assert_eq!(String::from_utf8_lossy(&content).trim(), "hello workspace");

    let files = mgr.list_tree(&sha, "").await.unwrap();
    assert_eq!(files, vec!["README.md".to_string()]);

    assert!(mgr.has_path(&sha, "README.md").await.unwrap());
    assert!(!mgr.has_path(&sha, "missing.md").await.unwrap());

    let hits = mgr.grep(&sha, "hello", &[]).await.unwrap();
    assert_eq!(hits.len(), 1, "unexpected grep hits: {hits:?}");
    assert!(mgr.grep(&sha, "no-such-needle", &[]).await.unwrap().is_empty());

    let lease = mgr.acquire("fp123", &sha).await.unwrap();
    assert!(lease.pathname().join("README.md").exists());
    assert_eq!(mgr.active_count(), 1);

    lease.release().await.unwrap();
    assert_eq!(mgr.active_count(), 0);
    assert!(!lease.pathname().exists());
    // Release is idempotent.
    lease.release().await.unwrap();

    let again = mgr.acquire("fp456", &sha).await.unwrap();
    again.release().await.unwrap();
}

#[tokio::test]
async fn lease_cap_and_duplicate_names_are_enforced() {
    let root = TempDir::new().unwrap();
    let (origin, sha) = init_origin(root.path());
    let mgr = manager(root.path(), &origin, 1);
    mgr.ensure().await.unwrap();

    let first = mgr.acquire("first", &sha).await.unwrap();
    let err = mgr.acquire("second", &sha).await.unwrap_err();
    assert!(matches!(err, WorkspaceError::WorktreeLimit));
    assert_eq!(mgr.active_count(), 1);

    first.release().await.unwrap();
    let second = mgr.acquire("second", &sha).await.unwrap();

    let err = mgr.acquire("second", &sha).await.unwrap_err();
    assert!(matches!(err, WorkspaceError::AlreadyActive { .. }));
    second.release().await.unwrap();
}

#[tokio::test]
async fn lease_names_are_sanitized_onto_one_level() {
    let root = TempDir::new().unwrap();
    let (origin, sha) = init_origin(root.path());
    let mgr = manager(root.path(), &origin, 0);
    mgr.ensure().await.unwrap();

    let lease = mgr.acquire("../sneaky/../name", &sha).await.unwrap();
    assert_eq!(lease.path.parent().unwrap(), root.path().join("worktrees"));
    lease.release().await.unwrap();
}

#[tokio::test]
async fn ensure_picks_up_new_commits() {
    let root = TempDir::new().unwrap();
    let (origin, _) = init_origin(root.path());
    let mgr = manager(root.path(), &origin, 0);
    mgr.ensure().await.unwrap();

    std::fs::write(origin.join("new.txt"), "fresh\n").unwrap();
    run_git(&origin, &["add", "."]);
    run_git(&origin, &["commit", "-m", "second"]);
    let new_sha = run_git(&origin, &["rev-parse", "HEAD"]).trim().to_string();

    mgr.ensure().await.unwrap();
    assert!(mgr.has_path(&new_sha, "new.txt").await.unwrap());
}
