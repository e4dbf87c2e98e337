use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("worktree limit reached")]
    WorktreeLimit,
    #[error("worktree {name} already active at {path}")]
    AlreadyActive { name: String, path: PathBuf },
    #[error("git {args} failed: {stderr}")]
    Git { args: String, stderr: String },
    #[error("workspace configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct WorkspaceOptions {
    pub remote_url: String,
    pub mirror_dir: PathBuf,
    pub worktrees_dir: PathBuf,
    /// 0 means unlimited.
    pub max_worktrees: usize,
    pub git_binary: String,
}

impl Default for WorkspaceOptions {
    fn default() -> Self {
        WorkspaceOptions {
            remote_url: String::new(),
            mirror_dir: PathBuf::new(),
            worktrees_dir: PathBuf::new(),
            max_worktrees: 0,
            git_binary: "git".into(),
        }
    }
}

/// Maintains one bare mirror of the target repository and hands out bounded,
/// commit-pinned worktree leases. Mirror initialization and fetch are
/// serialized; the active-lease map has its own lock.
#[derive(Debug)]
pub struct WorkspaceManager {
    opts: WorkspaceOptions,
    active: Mutex<HashMap<String, PathBuf>>,
    mirror_lock: tokio::sync::Mutex<()>,
}

/// Exclusive checked-out worktree pinned to a commit. Not reclaimed on drop;
/// callers release explicitly (release is idempotent).
#[derive(Debug)]
pub struct Lease {
    pub name: String,
    pub path: PathBuf,
    pub commit: String,
    manager: Arc<WorkspaceManager>,
    released: AtomicBool,
}

impl WorkspaceManager {
    pub fn new(mut opts: WorkspaceOptions) -> Result<Arc<Self>, WorkspaceError> {
        if opts.remote_url.trim().is_empty() {
            return Err(WorkspaceError::Config("remote url must be set".into()));
        }
        if opts.mirror_dir.as_os_str().is_empty() {
            return Err(WorkspaceError::Config("mirror dir must be set".into()));
        }
        if opts.worktrees_dir.as_os_str().is_empty() {
            return Err(WorkspaceError::Config("worktrees dir must be set".into()));
        }
        if opts.git_binary.is_empty() {
            opts.git_binary = "git".into();
        }
        Ok(Arc::new(WorkspaceManager {
            opts,
            active: Mutex::new(HashMap::new()),
            mirror_lock: tokio::sync::Mutex::new(()),
        }))
    }

    /// Clones the mirror on first use, then fetches with prune.
    pub async fn ensure(&self) -> Result<(), WorkspaceError> {
        self.ensure_mirror(true).await
    }

    async fn ensure_mirror(&self, fetch: bool) -> Result<(), WorkspaceError> {
        let _guard = self.mirror_lock.lock().await;
        if !self.opts.mirror_dir.exists() {
            if let Some(parent) = self.opts.mirror_dir.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            self.run_git(
                None,
                &[
                    "clone",
                    "--mirror",
                    &self.opts.remote_url,
                    &self.opts.mirror_dir.to_string_lossy(),
                ],
            )
            .await?;
            // A mirror-flagged remote rejects single-branch pushes from
            // leased worktrees.
            self.run_git(
                Some(&self.opts.mirror_dir),
                &["config", "remote.origin.mirror", "false"],
            )
            .await?;
        }
        if fetch {
            self.run_git(Some(&self.opts.mirror_dir), &["fetch", "--prune"])
                .await?;
        }
        tokio::fs::create_dir_all(&self.opts.worktrees_dir).await?;
        Ok(())
    }

    pub async fn acquire(
        self: &Arc<Self>,
        name: &str,
        sha: &str,
    ) -> Result<Lease, WorkspaceError> {
        self.ensure_mirror(true).await?;

        let clean_name = sanitize_name(name);
        let worktree_path = self.opts.worktrees_dir.join(&clean_name);

        {
            let mut active = self.active.lock().unwrap();
            if self.opts.max_worktrees > 0 && active.len() >= self.opts.max_worktrees {
                return Err(WorkspaceError::WorktreeLimit);
            }
            if let Some(existing) = active.get(&clean_name) {
                return Err(WorkspaceError::AlreadyActive {
                    name: clean_name,
                    path: existing.clone(),
                });
            }
            active.insert(clean_name.clone(), worktree_path.clone());
        }

        let setup = self.checkout_worktree(&worktree_path, sha).await;
        if let Err(err) = setup {
            self.active.lock().unwrap().remove(&clean_name);
            return Err(err);
        }
        debug!(name = %clean_name, %sha, "acquired worktree lease");
        Ok(Lease {
            name: clean_name,
            path: worktree_path,
            commit: sha.to_string(),
            manager: Arc::clone(self),
            released: AtomicBool::new(false),
        })
    }

    async fn checkout_worktree(&self, path: &Path, sha: &str) -> Result<(), WorkspaceError> {
        if path.exists() {
            tokio::fs::remove_dir_all(path).await?;
        }
        self.run_git(
            Some(&self.opts.mirror_dir),
            &["worktree", "add", "--force", &path.to_string_lossy(), sha],
        )
        .await?;
        Ok(())
    }

    async fn release_lease(&self, lease: &Lease) -> Result<(), WorkspaceError> {
        self.run_git(
            Some(&self.opts.mirror_dir),
            &[
                "worktree",
                "remove",
                "--force",
                &lease.path.to_string_lossy(),
            ],
        )
        .await?;
        if lease.path.exists() {
            tokio::fs::remove_dir_all(&lease.path).await?;
        }
        self.active.lock().unwrap().remove(&lease.name);
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    /// `git show <sha>:<path>` against the mirror.
    pub async fn cat_file(&self, sha: &str, path: &str) -> Result<Vec<u8>, WorkspaceError> {
        self.ensure_mirror(false).await?;
        self.run_git(Some(&self.opts.mirror_dir), &["show", &format!("{sha}:{path}")])
            .await
    }

    pub async fn list_tree(&self, sha: &str, prefix: &str) -> Result<Vec<String>, WorkspaceError> {
        self.ensure_mirror(false).await?;
        let mut args = vec!["ls-tree", "-r", "--name-only", sha];
        if !prefix.trim().is_empty() {
            args.push("--");
            args.push(prefix);
        }
        let out = self.run_git(Some(&self.opts.mirror_dir), &args).await?;
        Ok(split_lines(&out))
    }

    pub async fn grep(
        &self,
        sha: &str,
        pattern: &str,
        scopes: &[&str],
    ) -> Result<Vec<String>, WorkspaceError> {
        self.ensure_mirror(false).await?;
        let mut args = vec!["grep", "-n", "--no-color", "-e", pattern, sha];
        if !scopes.is_empty() {
            args.push("--");
            args.extend_from_slice(scopes);
        }
        match self.run_git(Some(&self.opts.mirror_dir), &args).await {
            Ok(out) => Ok(split_lines(&out)),
            // git grep exits 1 when nothing matches.
            Err(WorkspaceError::Git { stderr, .. }) if stderr.is_empty() => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    /// `git cat-file -e`, with the missing-object diagnostic mapped to a
    /// clean false.
    pub async fn has_path(&self, sha: &str, path: &str) -> Result<bool, WorkspaceError> {
        self.ensure_mirror(false).await?;
        match self
            .run_git(
                Some(&self.opts.mirror_dir),
                &["cat-file", "-e", &format!("{sha}:{path}")],
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(WorkspaceError::Git { stderr, .. }) if is_git_not_found(&stderr) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn run_git(&self, dir: Option<&Path>, args: &[&str]) -> Result<Vec<u8>, WorkspaceError> {
        let mut cmd = Command::new(&self.opts.git_binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(WorkspaceError::Git {
                args: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

impl Lease {
    pub fn pathname(&self) -> &Path {
        &self.path
    }

    pub async fn release(&self) -> Result<(), WorkspaceError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.manager.release_lease(self).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.released.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }
}

fn split_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

fn is_git_not_found(stderr: &str) -> bool {
    stderr.contains("Not a valid object name")
        || stderr.contains("does not exist in")
        || stderr.contains("pathspec")
}

fn sanitize_name(name: &str) -> String {
    let trimmed = name.trim();
    let base = Path::new(trimmed)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if base.is_empty() || base == "." {
        return format!("lease-{}", std::process::id());
    }
    base.replace(std::path::MAIN_SEPARATOR, "-").replace("..", "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_path_components() {
        assert_eq!(sanitize_name("fix-abcdef"), "fix-abcdef");
        assert_eq!(sanitize_name("a/b/c"), "c");
        assert_eq!(sanitize_name("../../etc"), "etc");
        assert_eq!(sanitize_name("fix..name"), "fix-name");
        assert!(sanitize_name("").starts_with("lease-"));
        assert!(sanitize_name("  ").starts_with("lease-"));
    }

    #[test]
    fn missing_object_diagnostics() {
        assert!(is_git_not_found("fatal: Not a valid object name abc:path"));
        assert!(is_git_not_found("fatal: path 'x' does not exist in 'abc'"));
        assert!(!is_git_not_found("fatal: repository corrupt"));
    }

    #[test]
    fn options_validation() {
        assert!(WorkspaceManager::new(WorkspaceOptions::default()).is_err());
        let opts = WorkspaceOptions {
            remote_url: "https://example.com/repo.git".into(),
            mirror_dir: PathBuf::from("/tmp/mirror.git"),
            worktrees_dir: PathBuf::from("/tmp/worktrees"),
            ..Default::default()
        };
        assert!(WorkspaceManager::new(opts).is_ok());
    }
}
