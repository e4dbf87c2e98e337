use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Invalid(String),
}

/// Runtime configuration. Every flag falls back to an `FTC_*` environment
/// variable so the bot deploys cleanly as a container with env-only config.
#[derive(Debug, Clone, Parser)]
#[command(name = "flaky-test-cleaner", about = "Autonomous triage and remediation bot for flaky CI tests")]
pub struct Config {
    /// GitHub repository owner (source for Actions logs).
    #[arg(long, env = "FTC_GITHUB_OWNER", default_value = "")]
    pub owner: String,

    /// GitHub repository name (source for Actions logs).
    #[arg(long, env = "FTC_GITHUB_REPO", default_value = "")]
    pub repo: String,

    /// Repository owner to write issues/PRs to (defaults to the source owner).
    #[arg(long, env = "FTC_GITHUB_WRITE_OWNER", default_value = "")]
    pub write_owner: String,

    /// Repository name to write issues/PRs to (defaults to the source repo).
    #[arg(long, env = "FTC_GITHUB_WRITE_REPO", default_value = "")]
    pub write_repo: String,

    /// Base branch used when filtering runs and opening PRs.
    #[arg(long, env = "FTC_BASE_BRANCH", default_value = "master")]
    pub base_branch: String,

    /// GitHub API base URL (overridden in tests).
    #[arg(long, env = "FTC_GITHUB_API_BASE_URL", default_value = "https://api.github.com")]
    pub github_api_base_url: String,

    /// Token used for read operations (runs, jobs, logs).
    #[arg(long, env = "FTC_GITHUB_READ_TOKEN", default_value = "", hide_env_values = true)]
    pub github_read_token: String,

    /// Token used for write operations (issues, comments, PRs).
    #[arg(long, env = "FTC_GITHUB_ISSUE_TOKEN", default_value = "", hide_env_values = true)]
    pub github_issue_token: String,

    /// Workflow name to scan for failed runs.
    #[arg(long = "workflow", env = "FTC_WORKFLOW_NAME", default_value = "PD Test")]
    pub workflow_name: String,

    /// Max failed runs to scan per discovery cycle.
    #[arg(long, env = "FTC_MAX_RUNS", default_value_t = 20)]
    pub max_runs: u32,

    /// Max jobs per run to scan.
    #[arg(long, env = "FTC_MAX_JOBS", default_value_t = 50)]
    pub max_jobs: u32,

    /// Do not write to GitHub; still reads, classifies, and updates the store.
    #[arg(
        long,
        env = "FTC_DRY_RUN",
        default_value_t = true,
        action = clap::ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub dry_run: bool,

    /// Classifier threshold below which flaky matches are demoted.
    #[arg(long, env = "FTC_CONFIDENCE_THRESHOLD", default_value_t = 0.75)]
    pub confidence_threshold: f64,

    /// Postgres URL for the durable state store; empty keeps the in-memory store.
    #[arg(long, env = "FTC_DATABASE_URL", default_value = "", hide_env_values = true)]
    pub database_url: String,

    /// Git remote the workspace manager mirrors; empty derives it from the
    /// write repository.
    #[arg(long, env = "FTC_WORKSPACE_REMOTE_URL", default_value = "")]
    pub workspace_remote_url: String,

    /// Path to the bare mirror maintained by the workspace manager.
    #[arg(long = "workspace-mirror", env = "FTC_WORKSPACE_MIRROR", default_value = "cache/target-repo.git")]
    pub workspace_mirror_dir: PathBuf,

    /// Directory holding leased worktrees.
    #[arg(long = "workspace-dir", env = "FTC_WORKSPACE_WORKTREES", default_value = "worktrees")]
    pub workspace_worktrees_dir: PathBuf,

    /// Maximum concurrent worktree leases.
    #[arg(long = "workspace-max", env = "FTC_WORKSPACE_MAX", default_value_t = 2)]
    pub workspace_max_worktrees: usize,

    /// Per-request HTTP timeout in seconds.
    #[arg(long, env = "FTC_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Run each enabled cycle once and exit.
    #[arg(long = "once", env = "FTC_RUN_ONCE", default_value_t = false)]
    pub run_once: bool,

    /// Seconds between discovery cycles; 0 disables discovery.
    #[arg(long, env = "FTC_DISCOVERY_INTERVAL_SECS", default_value_t = 72 * 60 * 60)]
    pub discovery_interval_secs: u64,

    /// Seconds between interaction cycles; 0 disables interaction.
    #[arg(long, env = "FTC_INTERACTION_INTERVAL_SECS", default_value_t = 10 * 60)]
    pub interaction_interval_secs: u64,

    /// Identifier of the optional external analysis model; empty keeps the
    /// deterministic renderer.
    #[arg(long, env = "FTC_ANALYSIS_MODEL", default_value = "")]
    pub analysis_model: String,

    /// Per-request timeout for the analysis model in seconds.
    #[arg(long, env = "FTC_ANALYSIS_MODEL_TIMEOUT_SECS", default_value_t = 60)]
    pub analysis_model_timeout_secs: u64,

    /// Log level passed to the analysis model backend.
    #[arg(long, env = "FTC_ANALYSIS_MODEL_LOG_LEVEL", default_value = "error")]
    pub analysis_model_log_level: String,
}

impl Config {
    /// Normalizes derived fields and rejects unusable combinations. A failure
    /// here exits the process with code 2.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.owner.is_empty() || self.repo.is_empty() {
            return Err(ConfigError::Invalid("owner/repo must be set".into()));
        }
        if self.write_owner.is_empty() {
            self.write_owner = self.owner.clone();
        }
        if self.write_repo.is_empty() {
            self.write_repo = self.repo.clone();
        }
        if self.github_read_token.is_empty() {
            return Err(ConfigError::Invalid("FTC_GITHUB_READ_TOKEN is required".into()));
        }
        if !self.dry_run && self.github_issue_token.is_empty() {
            return Err(ConfigError::Invalid(
                "FTC_GITHUB_ISSUE_TOKEN is required unless --dry-run".into(),
            ));
        }
        if self.discovery_interval_secs == 0 && self.interaction_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "at least one of discovery/interaction must be enabled (set an interval or use --once)"
                    .into(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn discovery_interval(&self) -> Option<Duration> {
        (self.discovery_interval_secs > 0).then(|| Duration::from_secs(self.discovery_interval_secs))
    }

    pub fn interaction_interval(&self) -> Option<Duration> {
        (self.interaction_interval_secs > 0)
            .then(|| Duration::from_secs(self.interaction_interval_secs))
    }

    pub fn source_repo(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    pub fn repo_remote_url(&self) -> String {
        format!("https://github.com/{}/{}.git", self.owner, self.repo)
    }

    pub fn write_repo_remote_url(&self) -> String {
        format!("https://github.com/{}/{}.git", self.write_owner, self.write_repo)
    }

    pub fn workspace_remote(&self) -> String {
        if self.workspace_remote_url.is_empty() {
            self.write_repo_remote_url()
        } else {
            self.workspace_remote_url.clone()
        }
    }

    /// Baseline configuration for tests; mirrors the clap defaults without
    /// touching the process environment.
    pub fn for_tests() -> Self {
        let mut cfg = Config::parse_from(["flaky-test-cleaner"]);
        cfg.owner = "test-owner".into();
        cfg.repo = "test-repo".into();
        cfg.write_owner = "test-owner".into();
        cfg.write_repo = "test-repo".into();
        cfg.github_read_token = "read-token".into();
        cfg.github_issue_token = "issue-token".into();
        cfg.base_branch = "main".into();
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        let mut cfg = Config::parse_from(["flaky-test-cleaner"]);
        cfg.owner = "o".into();
        cfg.repo = "r".into();
        cfg.github_read_token = "t".into();
        cfg
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::parse_from(["flaky-test-cleaner"]);
        assert!(cfg.dry_run);
        assert_eq!(cfg.max_runs, 20);
        assert_eq!(cfg.max_jobs, 50);
        assert_eq!(cfg.discovery_interval_secs, 72 * 60 * 60);
        assert_eq!(cfg.interaction_interval_secs, 600);
        assert_eq!(cfg.github_api_base_url, "https://api.github.com");
    }

    #[test]
    fn validation_requires_owner_repo_and_token() {
        let mut cfg = Config::parse_from(["flaky-test-cleaner"]);
        assert!(cfg.validate().is_err());
        cfg.owner = "o".into();
        cfg.repo = "r".into();
        assert!(cfg.validate().is_err(), "read token still missing");
        cfg.github_read_token = "t".into();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn write_repo_defaults_to_source() {
        let mut cfg = base();
        cfg.validate().unwrap();
        assert_eq!(cfg.write_owner, "o");
        assert_eq!(cfg.write_repo, "r");
        assert_eq!(cfg.write_repo_remote_url(), "https://github.com/o/r.git");
    }

    #[test]
    fn live_mode_requires_issue_token() {
        let mut cfg = base();
        cfg.dry_run = false;
        assert!(cfg.validate().is_err());
        cfg.github_issue_token = "w".into();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn both_loops_disabled_is_rejected() {
        let mut cfg = base();
        cfg.discovery_interval_secs = 0;
        cfg.interaction_interval_secs = 0;
        assert!(cfg.validate().is_err());
        cfg.interaction_interval_secs = 60;
        assert!(cfg.validate().is_ok());
        assert!(cfg.discovery_interval().is_none());
        assert_eq!(cfg.interaction_interval(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn flags_override_defaults() {
        let cfg = Config::parse_from([
            "flaky-test-cleaner",
            "--owner",
            "tikv",
            "--repo",
            "pd",
            "--workflow",
            "PD Test",
            "--max-runs",
            "7",
            "--once",
        ]);
        assert_eq!(cfg.owner, "tikv");
        assert_eq!(cfg.workflow_name, "PD Test");
        assert_eq!(cfg.max_runs, 7);
        assert!(cfg.run_once);
    }
}
