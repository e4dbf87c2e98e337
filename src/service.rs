use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::classify::HeuristicClassifier;
use crate::config::Config;
use crate::domain::{
    is_managed_body, Class, Classification, FingerprintRecord, FingerprintState, IssueComment,
    ListIssueCommentsOptions, ListRunJobsOptions, ListWorkflowRunsOptions, Occurrence, PrFeedback,
    UpdateIssueInput,
};
use crate::extract::{ExtractInput, LogExtractor};
use crate::fingerprint;
use crate::fixagent::{FixAgent, FixAgentOptions};
use crate::github::{CiProvider, GitHubClient, IssueService};
use crate::issue::{IssueManager, PlanInput, LABEL_FIX_APPROVED};
use crate::issueagent::{self, AnalysisInput, AnalysisModel};
use crate::sanitize;
use crate::store::{AuditResult, MemoryStore, PostgresStore, Store, StoreError};
use crate::workspace::{WorkspaceManager, WorkspaceOptions};

const RECENT_OCCURRENCES: i64 = 5;
const APPROVAL_SCAN_BATCH: i64 = 20;
const FIX_ATTEMPT_BATCH: i64 = 5;
const PR_POLL_BATCH: i64 = 10;
const COMMENT_PAGE: u32 = 50;

/// Injection points for tests; any `None` is built from the config.
#[derive(Default)]
pub struct ServiceDeps {
    pub store: Option<Arc<dyn Store>>,
    pub ci: Option<Arc<dyn CiProvider>>,
    pub issues: Option<Arc<dyn IssueService>>,
    pub analysis_model: Option<Arc<dyn AnalysisModel>>,
}

/// Wires the collaborators together and drives the two control loops:
/// discovery (CI failures → issues) and interaction (signals → fixes).
pub struct Service {
    cfg: Config,
    ci: Arc<dyn CiProvider>,
    issues: Arc<dyn IssueService>,
    store: Arc<dyn Store>,
    extractor: LogExtractor,
    classifier: HeuristicClassifier,
    issue_mgr: IssueManager,
    analysis_model: Option<Arc<dyn AnalysisModel>>,
    write_workspace: OnceCell<Arc<WorkspaceManager>>,
    source_workspace: OnceCell<Arc<WorkspaceManager>>,
}

impl Service {
    pub async fn new(cfg: Config, deps: ServiceDeps) -> Result<Self> {
        let ci: Arc<dyn CiProvider> = match deps.ci {
            Some(ci) => ci,
            None => Arc::new(GitHubClient::with_base_url(
                cfg.github_read_token.clone(),
                cfg.request_timeout(),
                cfg.github_api_base_url.clone(),
            )?),
        };
        let issues: Arc<dyn IssueService> = match deps.issues {
            Some(issues) => issues,
            None if cfg.dry_run => Arc::new(GitHubClient::with_base_url(
                cfg.github_read_token.clone(),
                cfg.request_timeout(),
                cfg.github_api_base_url.clone(),
            )?),
            None => Arc::new(GitHubClient::with_base_url(
                cfg.github_issue_token.clone(),
                cfg.request_timeout(),
                cfg.github_api_base_url.clone(),
            )?),
        };

        let store: Arc<dyn Store> = match deps.store {
            Some(store) => store,
            None if cfg.database_url.is_empty() => Arc::new(MemoryStore::new()),
            None => Arc::new(PostgresStore::connect(&cfg.database_url).await?),
        };
        store.migrate().await.context("migrate state store")?;

        let analysis_model = deps.analysis_model;
        if analysis_model.is_none() && !cfg.analysis_model.is_empty() {
            warn!(
                model = %cfg.analysis_model,
                "analysis model configured but no backend is wired in; using the deterministic renderer"
            );
        }

        let issue_mgr = IssueManager::new(cfg.write_owner.clone(), cfg.write_repo.clone(), cfg.dry_run);
        Ok(Service {
            classifier: HeuristicClassifier::new(cfg.confidence_threshold),
            cfg,
            ci,
            issues,
            store,
            extractor: LogExtractor::new(),
            issue_mgr,
            analysis_model,
            write_workspace: OnceCell::new(),
            source_workspace: OnceCell::new(),
        })
    }

    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    pub async fn close(&self) -> Result<()> {
        self.store.close().await?;
        Ok(())
    }

    /// One discovery cycle: failed runs → occurrences → fingerprints →
    /// issues → initial analysis.
    pub async fn discovery_once(&self) -> Result<()> {
        let cfg = &self.cfg;
        let workflow = self
            .ci
            .find_workflow_by_name(&cfg.owner, &cfg.repo, &cfg.workflow_name)
            .await
            .with_context(|| format!("find workflow {:?}", cfg.workflow_name))?;

        let runs = self
            .ci
            .list_workflow_runs(
                &cfg.owner,
                &cfg.repo,
                workflow.id,
                &ListWorkflowRunsOptions {
                    status: "failure".into(),
                    branch: cfg.base_branch.clone(),
                    per_page: cfg.max_runs,
                    ..Default::default()
                },
            )
            .await?;

        for run in runs {
            let jobs = self
                .ci
                .list_run_jobs(
                    &cfg.owner,
                    &cfg.repo,
                    run.id,
                    &ListRunJobsOptions {
                        per_page: cfg.max_jobs,
                    },
                )
                .await?;
            for job in jobs {
                if job.conclusion != "failure" {
                    continue;
                }
                info!(run = run.id, job = job.id, name = %job.name, "scanning failed job");
                let raw = self
                    .ci
                    .download_job_logs(&cfg.owner, &cfg.repo, job.id)
                    .await?;

                let failures = self.extractor.extract(&ExtractInput {
                    repo: cfg.source_repo(),
                    workflow: workflow.name.clone(),
                    run_id: run.id,
                    run_url: run.html_url.clone(),
                    head_sha: run.head_sha.clone(),
                    job_id: job.id,
                    job_name: job.name.clone(),
                    runner_os: job.runner_os.clone(),
                    occurred_at: run.created_at,
                    raw_log_text: String::from_utf8_lossy(&raw).into_owned(),
                });
                for occurrence in failures {
                    self.process_occurrence(occurrence).await?;
                }
            }
        }
        Ok(())
    }

    async fn process_occurrence(&self, mut occ: Occurrence) -> Result<()> {
        occ.excerpt = sanitize::scrub(&occ.excerpt);
        let norm_sig = fingerprint::normalize_error_signature(&occ.error_signature);
        let fp = fingerprint::v1(fingerprint::V1Input {
            repo: &occ.repo,
            framework: &occ.framework,
            test_name: &occ.test_name,
            error_sig_norm: &norm_sig,
            platform: occ.platform_bucket(),
        });
        occ.fingerprint = fp.clone();

        self.store.upsert_occurrence(&occ).await?;
        let classification = self.classifier.classify(&occ);
        self.store
            .upsert_fingerprint(&FingerprintRecord {
                fingerprint: fp.clone(),
                fingerprint_version: fingerprint::VERSION_V1.into(),
                repo: occ.repo.clone(),
                test_name: occ.test_name.clone(),
                framework: occ.framework.clone(),
                class: classification.class.as_str().into(),
                confidence: classification.confidence,
                state: FingerprintState::Discovered,
                state_changed_at: occ.occurred_at,
                first_seen_at: occ.occurred_at,
                last_seen_at: occ.occurred_at,
                ..Default::default()
            })
            .await?;

        // Infra noise and real regressions are recorded but get no issue.
        if matches!(
            classification.class,
            Class::InfraFlake | Class::LikelyRegression
        ) {
            debug!(fingerprint = %fp, class = %classification.class, "suppressing issue");
            return Ok(());
        }

        let record = self
            .store
            .get_fingerprint(&fp)
            .await?
            .ok_or_else(|| anyhow!("fingerprint record missing after upsert"))?;
        let recent = self
            .store
            .list_recent_occurrences(&fp, RECENT_OCCURRENCES)
            .await?;
        let change = self.issue_mgr.plan_issue_update(&PlanInput {
            fingerprint: record,
            occurrences: recent.clone(),
            classification: classification.clone(),
        });
        if change.noop {
            return Ok(());
        }
        if self.cfg.dry_run {
            info!(
                fingerprint = %fp,
                class = %classification.class,
                confidence = classification.confidence,
                title = %change.title,
                labels = ?change.labels,
                "dry-run issue update"
            );
        }

        let issue_number = self.issue_mgr.apply(self.issues.as_ref(), &change).await?;
        if issue_number == 0 {
            return Ok(());
        }
        self.store.link_issue(&fp, issue_number).await?;
        let record = self
            .store
            .get_fingerprint(&fp)
            .await?
            .ok_or_else(|| anyhow!("fingerprint record missing after linking issue"))?;
        if record.state == FingerprintState::Discovered {
            self.store
                .update_fingerprint_state(&fp, FingerprintState::IssueOpen)
                .await?;
            self.run_initial_analysis(issue_number, &record, &recent, &classification)
                .await?;
        }
        Ok(())
    }

    async fn run_initial_analysis(
        &self,
        issue_number: i64,
        record: &FingerprintRecord,
        occurrences: &[Occurrence],
        classification: &Classification,
    ) -> Result<()> {
        let repo_context_snippets = self.build_repo_context(occurrences).await;
        let input = AnalysisInput {
            fingerprint: record.clone(),
            occurrences: occurrences.to_vec(),
            classification: classification.clone(),
            repo_context_snippets,
        };
        let mut body = issueagent::render_initial_comment(&input);

        if let Some(model) = &self.analysis_model {
            match model.generate_initial_comment(&input).await {
                Ok(out) if issueagent::is_valid_agent_block(&out) => body = out,
                Ok(_) => {
                    warn!(issue = issue_number, "analysis model output missing agent markers; discarded");
                }
                Err(err) => {
                    let _ = self
                        .store
                        .record_audit(
                            "issueagent.model",
                            &format!("issue/{issue_number}"),
                            AuditResult::Error,
                            &err.to_string(),
                        )
                        .await;
                }
            }
        }

        if self.cfg.dry_run {
            info!(issue = issue_number, fingerprint = %record.fingerprint, "dry-run analysis comment\n{body}");
            return Ok(());
        }
        if let Err(err) = self
            .issues
            .create_issue_comment(
                &self.cfg.write_owner,
                &self.cfg.write_repo,
                issue_number,
                &body,
            )
            .await
        {
            let _ = self
                .store
                .record_audit(
                    "issueagent.initial_analysis",
                    &format!("issue/{issue_number}"),
                    AuditResult::Error,
                    &err.to_string(),
                )
                .await;
            return Err(err.into());
        }
        self.store
            .update_fingerprint_state(&record.fingerprint, FingerprintState::Triaged)
            .await?;
        self.store
            .update_fingerprint_state(&record.fingerprint, FingerprintState::WaitingForSignal)
            .await?;
        self.store
            .record_audit(
                "issueagent.initial_analysis",
                &format!("issue/{issue_number}"),
                AuditResult::Success,
                "",
            )
            .await?;
        Ok(())
    }

    /// One interaction cycle: approval signals → fix attempts → PR feedback
    /// → terminal check.
    pub async fn interaction_once(&self) -> Result<()> {
        self.check_approval_signals().await?;
        if self.cfg.dry_run {
            return Ok(());
        }
        if !self.needs_fix_agent().await? {
            return Ok(());
        }

        let workspace = self.write_workspace().await?;
        workspace.ensure().await.context("ensure workspace mirror")?;
        let agent = FixAgent::new(FixAgentOptions {
            owner: self.cfg.write_owner.clone(),
            repo: self.cfg.write_repo.clone(),
            base_branch: self.cfg.base_branch.clone(),
            dry_run: self.cfg.dry_run,
            github: Arc::clone(&self.issues),
            workspace,
            store: Arc::clone(&self.store),
        })?;
        self.run_fix_agent(&agent).await?;
        self.handle_pr_feedback_loop(&agent).await?;
        self.check_pr_status().await
    }

    async fn needs_fix_agent(&self) -> Result<bool> {
        for state in [
            FingerprintState::ApprovedToFix,
            FingerprintState::PrOpen,
            FingerprintState::PrNeedsChanges,
            FingerprintState::PrUpdating,
        ] {
            if !self
                .store
                .list_fingerprints_by_state(state, 1)
                .await?
                .is_empty()
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn check_approval_signals(&self) -> Result<()> {
        let waiting = self
            .store
            .list_fingerprints_by_state(FingerprintState::WaitingForSignal, APPROVAL_SCAN_BATCH)
            .await?;
        for fp in waiting {
            if fp.issue_number == 0 {
                continue;
            }
            let issue = self
                .issues
                .get_issue(&self.cfg.write_owner, &self.cfg.write_repo, fp.issue_number)
                .await?;
            let mut approved = false;
            let mut reason = String::new();
            if issue
                .labels
                .iter()
                .any(|l| l.name.eq_ignore_ascii_case(LABEL_FIX_APPROVED))
            {
                approved = true;
                reason = format!("label {LABEL_FIX_APPROVED} present");
            }

            let comments = self
                .issues
                .list_issue_comments(
                    &self.cfg.write_owner,
                    &self.cfg.write_repo,
                    fp.issue_number,
                    &ListIssueCommentsOptions {
                        per_page: COMMENT_PAGE,
                    },
                )
                .await?;
            let mut max_comment_id = 0i64;
            let mut has_new_human_comment = false;
            for comment in &comments {
                max_comment_id = max_comment_id.max(comment.id);
                let body_lower = comment.body.to_lowercase();
                let is_approval_command = body_lower.contains("/ai-fix");
                if is_approval_command && !approved {
                    approved = true;
                    reason = format!("comment by {} triggered /ai-fix", comment.user.login);
                }
                if comment.id <= fp.last_issue_comment_id {
                    continue;
                }
                if is_managed_body(&comment.body) || is_approval_command {
                    continue;
                }
                has_new_human_comment = true;
            }
            if max_comment_id > fp.last_issue_comment_id {
                let mut update = fp.clone();
                update.last_issue_comment_id = max_comment_id;
                self.store.upsert_fingerprint(&update).await?;
                if has_new_human_comment {
                    let _ = self
                        .store
                        .record_audit(
                            "signal.issue_comment",
                            &format!("issue/{}", fp.issue_number),
                            AuditResult::Success,
                            "",
                        )
                        .await;
                }
            }
            if !approved {
                continue;
            }
            info!(issue = fp.issue_number, fingerprint = %fp.fingerprint, %reason, "approval detected");
            self.store
                .update_fingerprint_state(&fp.fingerprint, FingerprintState::ApprovedToFix)
                .await?;
            self.store
                .record_audit(
                    "signal.approval",
                    &format!("issue/{}", fp.issue_number),
                    AuditResult::Success,
                    &reason,
                )
                .await?;
        }
        Ok(())
    }

    async fn run_fix_agent(&self, agent: &FixAgent) -> Result<()> {
        let approved = self
            .store
            .list_fingerprints_by_state(FingerprintState::ApprovedToFix, FIX_ATTEMPT_BATCH)
            .await?;
        for fp in approved {
            let occurrences = self
                .store
                .list_recent_occurrences(&fp.fingerprint, 1)
                .await?;
            if occurrences.is_empty() {
                continue;
            }
            agent.attempt(&fp, &occurrences).await?;
        }
        Ok(())
    }

    async fn handle_pr_feedback_loop(&self, agent: &FixAgent) -> Result<()> {
        let open = self
            .store
            .list_fingerprints_by_state(FingerprintState::PrOpen, PR_POLL_BATCH)
            .await?;
        for fp in open {
            if fp.pr_number == 0 {
                continue;
            }
            let feedback = self
                .build_pr_feedback(fp.pr_number, fp.last_pr_comment_id)
                .await?;
            if !feedback.needs_update() {
                continue;
            }
            if !self
                .apply_transition(&fp, FingerprintState::PrNeedsChanges)
                .await?
            {
                continue;
            }
            let _ = self
                .store
                .record_audit(
                    "signal.pr_feedback",
                    &format!("pr/{}", fp.pr_number),
                    AuditResult::Success,
                    "",
                )
                .await;
        }

        let needs_changes = self
            .store
            .list_fingerprints_by_state(FingerprintState::PrNeedsChanges, PR_POLL_BATCH)
            .await?;
        for fp in needs_changes {
            if fp.pr_number == 0 {
                continue;
            }
            let feedback = self
                .build_pr_feedback(fp.pr_number, fp.last_pr_comment_id)
                .await?;
            if !self
                .apply_transition(&fp, FingerprintState::PrUpdating)
                .await?
            {
                continue;
            }
            if let Err(err) = agent.follow_up(&fp, &feedback).await {
                let _ = self
                    .store
                    .record_audit(
                        "fixagent.review_followup",
                        &format!("pr/{}", fp.pr_number),
                        AuditResult::Error,
                        &err.to_string(),
                    )
                    .await;
                return Err(err);
            }
            if feedback.latest_comment_id > fp.last_pr_comment_id {
                let mut update = fp.clone();
                update.last_pr_comment_id = feedback.latest_comment_id;
                self.store.upsert_fingerprint(&update).await?;
            }
            self.store
                .update_fingerprint_state(&fp.fingerprint, FingerprintState::PrOpen)
                .await?;
            let _ = self
                .store
                .record_audit(
                    "fixagent.review_followup",
                    &format!("pr/{}", fp.pr_number),
                    AuditResult::Success,
                    "",
                )
                .await;
        }
        Ok(())
    }

    async fn check_pr_status(&self) -> Result<()> {
        for state in [
            FingerprintState::PrOpen,
            FingerprintState::PrNeedsChanges,
            FingerprintState::PrUpdating,
        ] {
            let fps = self
                .store
                .list_fingerprints_by_state(state, PR_POLL_BATCH)
                .await?;
            for fp in fps {
                if fp.pr_number == 0 {
                    continue;
                }
                let pr = self
                    .issues
                    .get_pull_request(&self.cfg.write_owner, &self.cfg.write_repo, fp.pr_number)
                    .await?;
                if pr.is_merged() {
                    self.finalize_merged_pr(&fp, pr.number).await?;
                    continue;
                }
                if pr.state == "closed" {
                    self.handle_closed_pr(&fp, pr.number).await?;
                }
            }
        }
        Ok(())
    }

    async fn finalize_merged_pr(&self, fp: &FingerprintRecord, pr_number: i64) -> Result<()> {
        let comment = format!(
            "PR #{pr_number} has been merged. Closing this issue and marking the fingerprint as resolved."
        );
        self.issues
            .create_issue_comment(
                &self.cfg.write_owner,
                &self.cfg.write_repo,
                fp.issue_number,
                &comment,
            )
            .await?;
        self.issues
            .update_issue(
                &self.cfg.write_owner,
                &self.cfg.write_repo,
                fp.issue_number,
                &UpdateIssueInput {
                    state: Some("closed".into()),
                    ..Default::default()
                },
            )
            .await?;
        if !self.apply_transition(fp, FingerprintState::Merged).await? {
            return Ok(());
        }
        self.store
            .record_audit(
                "fixagent.pr_merged",
                &format!("issue/{}", fp.issue_number),
                AuditResult::Success,
                &format!("pr#{pr_number}"),
            )
            .await?;
        Ok(())
    }

    async fn handle_closed_pr(&self, fp: &FingerprintRecord, pr_number: i64) -> Result<()> {
        let comment =
            format!("PR #{pr_number} was closed without merge. Marking this fingerprint as CLOSED_WONTFIX.");
        self.issues
            .create_issue_comment(
                &self.cfg.write_owner,
                &self.cfg.write_repo,
                fp.issue_number,
                &comment,
            )
            .await?;
        if !self
            .apply_transition(fp, FingerprintState::ClosedWontFix)
            .await?
        {
            return Ok(());
        }
        self.store
            .record_audit(
                "fixagent.pr_closed",
                &format!("issue/{}", fp.issue_number),
                AuditResult::Success,
                &format!("pr#{pr_number}"),
            )
            .await?;
        Ok(())
    }

    /// Applies a state transition; an invalid edge is fatal only to that
    /// fingerprint. Returns whether the transition happened.
    async fn apply_transition(
        &self,
        fp: &FingerprintRecord,
        next: FingerprintState,
    ) -> Result<bool> {
        match self
            .store
            .update_fingerprint_state(&fp.fingerprint, next)
            .await
        {
            Ok(()) => Ok(true),
            Err(StoreError::InvalidTransition { from, to }) => {
                warn!(fingerprint = %fp.fingerprint, %from, %to, "skipping invalid transition");
                let _ = self
                    .store
                    .record_audit(
                        "state.transition",
                        &format!("fingerprint/{}", fp.fingerprint),
                        AuditResult::Error,
                        &format!("invalid transition {from} -> {to}"),
                    )
                    .await;
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn build_pr_feedback(
        &self,
        pr_number: i64,
        since_comment_id: i64,
    ) -> Result<PrFeedback> {
        let owner = &self.cfg.write_owner;
        let repo = &self.cfg.write_repo;
        let pr = self.issues.get_pull_request(owner, repo, pr_number).await?;
        let reviews = self
            .issues
            .list_pull_request_reviews(owner, repo, pr_number)
            .await?;
        let changes_requested = reviews
            .into_iter()
            .filter(|r| r.state.trim().eq_ignore_ascii_case("CHANGES_REQUESTED"))
            .collect();

        let combined_status = if pr.head.sha.trim().is_empty() {
            Default::default()
        } else {
            self.issues
                .get_combined_status(owner, repo, &pr.head.sha)
                .await?
        };

        let comments = self
            .issues
            .list_issue_comments(
                owner,
                repo,
                pr_number,
                &ListIssueCommentsOptions {
                    per_page: COMMENT_PAGE,
                },
            )
            .await?;
        let latest_comment_id = comments.iter().map(|c| c.id).max().unwrap_or(0);
        let new_comments: Vec<IssueComment> = comments
            .into_iter()
            .filter(|c| c.id > since_comment_id && !is_managed_body(&c.body))
            .collect();

        Ok(PrFeedback {
            pr_number: pr.number,
            pr_url: pr.html_url.clone(),
            head_sha: pr.head.sha.clone(),
            changes_requested,
            combined_status,
            latest_comment_id,
            new_comments,
        })
    }

    async fn write_workspace(&self) -> Result<Arc<WorkspaceManager>> {
        let ws = self
            .write_workspace
            .get_or_try_init(|| async {
                WorkspaceManager::new(WorkspaceOptions {
                    remote_url: self.cfg.workspace_remote(),
                    mirror_dir: self.cfg.workspace_mirror_dir.clone(),
                    worktrees_dir: self.cfg.workspace_worktrees_dir.clone(),
                    max_worktrees: self.cfg.workspace_max_worktrees,
                    git_binary: "git".into(),
                })
            })
            .await?;
        Ok(Arc::clone(ws))
    }

    /// Best-effort snippets from the failing commit. Only attempted against
    /// the public API host; any failure degrades to an empty context.
    async fn build_repo_context(&self, occurrences: &[Occurrence]) -> String {
        if self.cfg.github_api_base_url != "https://api.github.com" {
            return String::new();
        }
        let Some(sha) = occurrences
            .iter()
            .map(|o| o.head_sha.trim())
            .find(|s| !s.is_empty())
        else {
            return String::new();
        };

        let workspace = self
            .source_workspace
            .get_or_try_init(|| async {
                WorkspaceManager::new(WorkspaceOptions {
                    remote_url: self.cfg.repo_remote_url(),
                    mirror_dir: with_suffix(&self.cfg.workspace_mirror_dir, ".src"),
                    worktrees_dir: self.cfg.workspace_worktrees_dir.join("src"),
                    max_worktrees: 0,
                    git_binary: "git".into(),
                })
            })
            .await;
        let Ok(workspace) = workspace else {
            return String::new();
        };
        if tokio::time::timeout(Duration::from_secs(60), workspace.ensure())
            .await
            .map(|r| r.is_err())
            .unwrap_or(true)
        {
            return String::new();
        }

        let mut sections = Vec::new();
        for (path, line) in file_line_hints(occurrences, &self.cfg.source_repo()) {
            if sections.len() >= 3 {
                break;
            }
            if !matches!(workspace.has_path(sha, &path).await, Ok(true)) {
                continue;
            }
            let Ok(bytes) = workspace.cat_file(sha, &path).await else {
                continue;
            };
            sections.push(render_snippet(
                sections.len() + 1,
                &path,
                sha,
                line,
                &String::from_utf8_lossy(&bytes),
            ));
        }

        if sections.is_empty() {
            if let Some(test_name) = occurrences
                .iter()
                .map(|o| o.test_name.trim())
                .find(|n| !n.is_empty())
            {
                let base = test_name.split('/').next().unwrap_or_default();
                if !base.is_empty() {
                    if let Ok(matches) = workspace.grep(sha, &format!("func {base}"), &[]).await {
                        for hit in matches {
                            let Some((path, line)) = parse_git_grep_line(&hit, sha) else {
                                continue;
                            };
                            let Ok(bytes) = workspace.cat_file(sha, &path).await else {
                                continue;
                            };
                            sections.push(render_snippet(
                                1,
                                &path,
                                sha,
                                line,
                                &String::from_utf8_lossy(&bytes),
                            ));
                            break;
                        }
                    }
                }
            }
        }

        if sections.is_empty() {
            return String::new();
        }
        format!(
            "RepoContextSnippets (read-only, from failing commit):\n{}",
            sections.join("\n\n")
        )
    }
}

static RE_GO_FILE_HINT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([A-Za-z0-9_./\-]+\.go):(\d+)").unwrap());

fn file_line_hints(occurrences: &[Occurrence], repo: &str) -> Vec<(String, usize)> {
    let mut seen = std::collections::BTreeMap::new();
    for occ in occurrences.iter().take(3) {
        let text = format!("{}\n{}", occ.error_signature, occ.excerpt);
        for caps in RE_GO_FILE_HINT.captures_iter(&text).take(6) {
            let path = normalize_repo_path(&caps[1], repo);
            let line: usize = caps[2].parse().unwrap_or(0);
            if path.is_empty() || line == 0 {
                continue;
            }
            seen.entry(path).or_insert(line);
        }
    }
    seen.into_iter().take(3).collect()
}

fn normalize_repo_path(path: &str, repo: &str) -> String {
    let mut p = path.trim().trim_start_matches("./").replace('\\', "/");
    let module_prefix = format!("github.com/{repo}/");
    if let Some(idx) = p.rfind(&module_prefix) {
        p = p[idx + module_prefix.len()..].to_string();
    } else if let Some(name) = repo.split('/').nth(1) {
        let repo_prefix = format!("/{name}/");
        if let Some(idx) = p.rfind(&repo_prefix) {
            p = p[idx + repo_prefix.len()..].to_string();
        }
    }
    p.trim_start_matches('/').to_string()
}

fn parse_git_grep_line(line: &str, sha: &str) -> Option<(String, usize)> {
    let rest = line.strip_prefix(&format!("{sha}:")).unwrap_or(line);
    let mut parts = rest.splitn(3, ':');
    let path = parts.next()?.to_string();
    let line_num: usize = parts.next()?.parse().ok()?;
    Some((path, line_num))
}

fn render_snippet(id: usize, path: &str, sha: &str, center: usize, content: &str) -> String {
    let lines: Vec<&str> = content.split('\n').collect();
    let center = center.max(1);
    let start = center.saturating_sub(40).max(1);
    let end = (center + 40).min(lines.len());
    let mut body = String::new();
    for i in start..=end {
        body.push_str(&format!("{i:4}: {}\n", lines[i - 1]));
    }
    let short = crate::issue::short_sha(sha);
    format!(
        "- S{id}: {path}@{short} L{start}-L{end}\n\n```go\n{}\n```",
        body.trim_end()
    )
}

fn with_suffix(path: &std::path::Path, suffix: &str) -> std::path::PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    std::path::PathBuf::from(s)
}
