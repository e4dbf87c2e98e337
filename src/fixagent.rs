use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use chrono::Utc;
use tokio::process::Command;
use tracing::{info, warn};

use crate::domain::{
    CreatePullRequestInput, FingerprintRecord, FingerprintState, Occurrence, PrFeedback,
};
use crate::github::IssueService;
use crate::issue::{short_sha, LABEL_PR_OPEN};
use crate::store::{AuditResult, Store};
use crate::workspace::{Lease, WorkspaceManager};

const TODO_FILE: &str = "FIX_AGENT_TODO.md";

/// Prepares fix branches and PRs for approved fingerprints and follows up on
/// review feedback. Every externally visible step is audited.
pub struct FixAgent {
    owner: String,
    repo: String,
    base_branch: String,
    dry_run: bool,
    github: Arc<dyn IssueService>,
    workspace: Arc<WorkspaceManager>,
    store: Arc<dyn Store>,
}

#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub comment_body: String,
    pub branch_name: String,
    pub pr_number: i64,
}

#[derive(Debug, Clone)]
pub struct FollowUpOutcome {
    pub comment_body: String,
    pub branch_name: String,
}

pub struct FixAgentOptions {
    pub owner: String,
    pub repo: String,
    pub base_branch: String,
    pub dry_run: bool,
    pub github: Arc<dyn IssueService>,
    pub workspace: Arc<WorkspaceManager>,
    pub store: Arc<dyn Store>,
}

impl FixAgent {
    pub fn new(opts: FixAgentOptions) -> Result<Self> {
        if opts.base_branch.trim().is_empty() {
            bail!("fix agent requires a base branch");
        }
        Ok(FixAgent {
            owner: opts.owner,
            repo: opts.repo,
            base_branch: opts.base_branch,
            dry_run: opts.dry_run,
            github: opts.github,
            workspace: opts.workspace,
            store: opts.store,
        })
    }

    /// Scaffolds a fix worktree for an approved fingerprint and opens a PR.
    pub async fn attempt(
        &self,
        fp: &FingerprintRecord,
        occurrences: &[Occurrence],
    ) -> Result<AttemptOutcome> {
        if fp.issue_number == 0 {
            bail!("fingerprint {} missing issue number", fp.fingerprint);
        }
        let Some(target) = occurrences.first() else {
            bail!("no occurrences available for fingerprint {}", fp.fingerprint);
        };
        let target_sha = target.head_sha.trim();
        if target_sha.is_empty() {
            bail!("occurrence missing head sha for fingerprint {}", fp.fingerprint);
        }

        let lease_name = format!("fix-{}", lease_suffix(&fp.fingerprint));
        let lease = self
            .workspace
            .acquire(&lease_name, target_sha)
            .await
            .context("acquire workspace")?;
        let result = self.attempt_in_lease(&lease, fp, occurrences, target).await;
        if let Err(err) = lease.release().await {
            warn!(lease = %lease.name, error = %err, "worktree release failed");
        }
        result
    }

    async fn attempt_in_lease(
        &self,
        lease: &Lease,
        fp: &FingerprintRecord,
        occurrences: &[Occurrence],
        target: &Occurrence,
    ) -> Result<AttemptOutcome> {
        write_todo_file(lease.pathname(), fp, target)
            .await
            .context("write todo")?;

        let test_summary = match run_go_test(lease.pathname()).await {
            Ok(output) => format!("go test ./... succeeded:\n{output}"),
            Err(err) => {
                warn!(error = %err, "fix agent verification failed");
                format!("go test ./... failed: {err}")
            }
        };

        let branch = format!("ai/fix/{}", branch_suffix(&fp.fingerprint));
        let body = build_preparation_comment(fp, target, lease.pathname(), &test_summary);
        if self.dry_run {
            return Ok(AttemptOutcome {
                comment_body: body,
                branch_name: branch,
                pr_number: 0,
            });
        }

        self.github
            .create_issue_comment(&self.owner, &self.repo, fp.issue_number, &body)
            .await?;
        self.store
            .update_fingerprint_state(&fp.fingerprint, FingerprintState::PrOpen)
            .await?;
        self.store
            .record_audit(
                "fixagent.prepare",
                &format!("issue/{}", fp.issue_number),
                AuditResult::Success,
                &lease.pathname().to_string_lossy(),
            )
            .await?;

        run_git(lease.pathname(), &["checkout", "-B", &branch]).await?;
        commit_all(
            lease.pathname(),
            &format!("fix flaky test {}", crate::issue::safe(&fp.test_name)),
        )
        .await?;
        push_branch(lease.pathname(), &branch).await?;

        let pr = self
            .github
            .create_pull_request(
                &self.owner,
                &self.repo,
                &CreatePullRequestInput {
                    title: format!("[AI] Stabilize {}", crate::issue::safe(&fp.test_name)),
                    head: branch.clone(),
                    base: self.base_branch.clone(),
                    body: body.clone(),
                    draft: false,
                },
            )
            .await?;
        self.github
            .add_issue_labels(
                &self.owner,
                &self.repo,
                fp.issue_number,
                &[LABEL_PR_OPEN.to_string()],
            )
            .await?;

        let mut update = fp.clone();
        update.pr_number = pr.number;
        update.state = FingerprintState::PrOpen;
        update.state_changed_at = Utc::now();
        self.store.upsert_fingerprint(&update).await?;
        self.store
            .record_audit(
                "fixagent.pr_create",
                &format!("issue/{}", fp.issue_number),
                AuditResult::Success,
                &format!("pr#{}", pr.number),
            )
            .await?;
        info!(pr = pr.number, branch = %branch, "fix PR opened");

        Ok(AttemptOutcome {
            comment_body: body,
            branch_name: branch,
            pr_number: pr.number,
        })
    }

    /// Prepares a follow-up commit and comment for an open fix PR that
    /// received review or CI feedback.
    pub async fn follow_up(
        &self,
        fp: &FingerprintRecord,
        feedback: &PrFeedback,
    ) -> Result<FollowUpOutcome> {
        if fp.issue_number == 0 {
            bail!("fingerprint {} missing issue number", fp.fingerprint);
        }
        if feedback.pr_number == 0 {
            bail!("fingerprint {} missing PR number", fp.fingerprint);
        }
        let head_sha = feedback.head_sha.trim();
        if head_sha.is_empty() {
            bail!("missing PR head sha for fingerprint {}", fp.fingerprint);
        }

        let lease_name = format!("fix-update-{}", lease_suffix(&fp.fingerprint));
        let lease = self
            .workspace
            .acquire(&lease_name, head_sha)
            .await
            .context("acquire workspace")?;
        let result = self.follow_up_in_lease(&lease, fp, feedback).await;
        if let Err(err) = lease.release().await {
            warn!(lease = %lease.name, error = %err, "worktree release failed");
        }
        result
    }

    async fn follow_up_in_lease(
        &self,
        lease: &Lease,
        fp: &FingerprintRecord,
        feedback: &PrFeedback,
    ) -> Result<FollowUpOutcome> {
        let branch = format!("ai/fix/{}", branch_suffix(&fp.fingerprint));
        checkout_branch_from_origin(lease.pathname(), &branch).await?;
        update_todo_for_feedback(lease.pathname(), feedback)
            .await
            .context("update todo")?;

        let comment = build_follow_up_comment(fp, feedback);
        if self.dry_run {
            return Ok(FollowUpOutcome {
                comment_body: comment,
                branch_name: branch,
            });
        }

        commit_all(
            lease.pathname(),
            &format!("chore: follow up on PR #{} feedback", feedback.pr_number),
        )
        .await?;
        push_branch(lease.pathname(), &branch).await?;
        self.github
            .create_issue_comment(&self.owner, &self.repo, feedback.pr_number, &comment)
            .await?;
        self.store
            .record_audit(
                "fixagent.review_followup",
                &format!("pr/{}", feedback.pr_number),
                AuditResult::Success,
                "",
            )
            .await?;

        Ok(FollowUpOutcome {
            comment_body: comment,
            branch_name: branch,
        })
    }
}

fn lease_suffix(fingerprint: &str) -> &str {
    &fingerprint[..fingerprint.len().min(16)]
}

fn branch_suffix(fingerprint: &str) -> &str {
    &fingerprint[..fingerprint.len().min(12)]
}

fn build_preparation_comment(
    fp: &FingerprintRecord,
    target: &Occurrence,
    path: &Path,
    test_summary: &str,
) -> String {
    let workspace = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!(
        "<!-- FTC:FIX_AGENT_START -->\n\
         FixAgent is preparing an automated stabilization patch for fingerprint `{}`.\n\n\
         - Workspace: `{}`\n\
         - Commit: {}\n\
         - Test: {}\n\
         - Last occurrence: [run {}]({})\n\
         - Verification: {}\n\
         - Next Steps:\n\
         \x20 1. Reproduce the failure locally within the workspace.\n\
         \x20 2. Craft a stabilization patch focused on the failing test.\n\
         \x20 3. Run targeted suites and prepare a PR for review.\n\n\
         _This is an automated preparation comment emitted at {}._\n\
         <!-- FTC:FIX_AGENT_END -->",
        fp.fingerprint,
        workspace,
        short_sha(&target.head_sha),
        crate::issue::safe(&target.test_name),
        target.run_id,
        target.run_url,
        test_summary,
        Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    )
}

async fn write_todo_file(
    path: &Path,
    fp: &FingerprintRecord,
    target: &Occurrence,
) -> std::io::Result<()> {
    let content = format!(
        "# FixAgent TODO\n\n- Fingerprint: `{}`\n- Test: `{}`\n- Latest run: {}\n- Commit: {}\n\n\
         Describe the stabilization strategy here.\n",
        fp.fingerprint,
        crate::issue::safe(&target.test_name),
        target.run_url,
        target.head_sha,
    );
    tokio::fs::write(path.join(TODO_FILE), content).await
}

async fn update_todo_for_feedback(path: &Path, feedback: &PrFeedback) -> std::io::Result<()> {
    let todo_path = path.join(TODO_FILE);
    let existing = tokio::fs::read_to_string(&todo_path).await.unwrap_or_default();
    let mut content = if existing.trim().is_empty() {
        "# FixAgent TODO\n\n".to_string()
    } else {
        existing
    };
    content = format!(
        "{}\n\n## Review Follow-up\n\n{}",
        content.trim_end_matches('\n'),
        render_feedback_checklist(feedback)
    );
    tokio::fs::write(&todo_path, content).await
}

fn render_feedback_checklist(feedback: &PrFeedback) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "_Generated at {}_\n\n",
        Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    ));

    if !feedback.changes_requested.is_empty() {
        out.push_str("### Changes requested\n\n");
        for review in &feedback.changes_requested {
            out.push_str(&format!(
                "- [ ] {}: {}\n",
                login_or_unknown(&review.user.login),
                snippet(&review.body),
            ));
        }
        out.push('\n');
    }

    if !feedback.new_comments.is_empty() {
        out.push_str("### PR comments\n\n");
        for comment in &feedback.new_comments {
            out.push_str(&format!(
                "- [ ] {}: {}\n",
                login_or_unknown(&comment.user.login),
                snippet(&comment.body),
            ));
        }
        out.push('\n');
    }

    let state = feedback.combined_status.state.trim();
    if !state.is_empty() {
        out.push_str("### CI status\n\n");
        out.push_str(&format!("- Combined state: `{state}`\n"));
        for status in &feedback.combined_status.statuses {
            let st = status.state.trim().to_lowercase();
            if st != "failure" && st != "error" {
                continue;
            }
            let context = if status.context.trim().is_empty() {
                "(unknown)"
            } else {
                &status.context
            };
            let description = if status.description.trim().is_empty() {
                "(no description)"
            } else {
                &status.description
            };
            out.push_str(&format!("- [ ] {context}: {description}\n"));
        }
        out.push('\n');
    }

    if out.lines().count() <= 2 {
        return "- [ ] No actionable feedback detected.\n".into();
    }
    out
}

fn build_follow_up_comment(fp: &FingerprintRecord, feedback: &PrFeedback) -> String {
    let mut out = String::new();
    out.push_str("<!-- FTC:REVIEW_RESPONSE_START -->\n");
    out.push_str("FixAgent detected review feedback / CI signals and prepared a follow-up plan.\n\n");
    out.push_str(&format!("- Fingerprint: `{}`\n", fp.fingerprint));
    out.push_str(&format!("- PR: #{}\n", feedback.pr_number));
    if !feedback.pr_url.trim().is_empty() {
        out.push_str(&format!("- URL: {}\n", feedback.pr_url));
    }
    if !feedback.head_sha.trim().is_empty() {
        out.push_str(&format!("- Head: {}\n", short_sha(&feedback.head_sha)));
    }
    let state = feedback.combined_status.state.trim();
    if !state.is_empty() {
        out.push_str(&format!("- CI: `{state}`\n"));
    }
    if !feedback.changes_requested.is_empty() {
        out.push_str(&format!(
            "- Changes requested: {} review(s)\n",
            feedback.changes_requested.len()
        ));
    }
    if !feedback.new_comments.is_empty() {
        out.push_str(&format!("- New PR comments: {}\n", feedback.new_comments.len()));
    }
    out.push_str("\nA checklist has been appended to `FIX_AGENT_TODO.md` in the FixAgent worktree.\n");
    out.push_str(&format!(
        "_Emitted at {}._\n",
        Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    ));
    out.push_str("<!-- FTC:REVIEW_RESPONSE_END -->");
    out
}

fn login_or_unknown(login: &str) -> &str {
    if login.trim().is_empty() {
        "unknown"
    } else {
        login
    }
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "(no body)".into();
    }
    if trimmed.chars().count() > 240 {
        let cut: String = trimmed.chars().take(240).collect();
        return format!("{cut}…");
    }
    trimmed.to_string()
}

async fn run_go_test(dir: &Path) -> Result<String> {
    let output = Command::new("go")
        .args(["test", "./..."])
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("spawn go test")?;
    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    if !output.status.success() {
        bail!("exit {}\n{}", output.status, combined);
    }
    Ok(combined)
}

async fn run_git(dir: &Path, args: &[&str]) -> Result<()> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

async fn commit_all(dir: &Path, message: &str) -> Result<()> {
    run_git(dir, &["add", "."]).await?;
    run_git(dir, &["commit", "--allow-empty", "-m", message]).await
}

async fn push_branch(dir: &Path, branch: &str) -> Result<()> {
    run_git(dir, &["push", "--set-upstream", "origin", branch]).await
}

async fn checkout_branch_from_origin(dir: &Path, branch: &str) -> Result<()> {
    // The branch may not exist on the remote yet.
    let _ = run_git(dir, &["fetch", "origin", branch]).await;
    if run_git(dir, &["checkout", "-B", branch, &format!("origin/{branch}")])
        .await
        .is_ok()
    {
        return Ok(());
    }
    run_git(dir, &["checkout", "-B", branch]).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CommitStatus, IssueComment, PullRequestReview, User};

    #[test]
    fn lease_and_branch_suffixes_truncate_the_fingerprint() {
        let fp = "abcdef0123456789abcdef0123456789";
        assert_eq!(lease_suffix(fp), "abcdef0123456789");
        assert_eq!(branch_suffix(fp), "abcdef012345");
        assert_eq!(lease_suffix("short"), "short");
    }

    #[test]
    fn preparation_comment_is_marker_wrapped() {
        let fp = FingerprintRecord {
            fingerprint: "ab".repeat(32),
            test_name: "TestFoo".into(),
            issue_number: 4,
            ..Default::default()
        };
        let occ = Occurrence {
            run_id: 77,
            run_url: "https://example.com/run/77".into(),
            head_sha: "deadbeefcafebabe".into(),
            test_name: "TestFoo".into(),
            ..Default::default()
        };
        let body =
            build_preparation_comment(&fp, &occ, Path::new("/tmp/worktrees/fix-ab"), "skipped");
        assert!(body.starts_with("<!-- FTC:FIX_AGENT_START -->"));
        assert!(body.ends_with("<!-- FTC:FIX_AGENT_END -->"));
        assert!(body.contains("run 77"));
        assert!(body.contains("`fix-ab`"));
    }

    #[test]
    fn feedback_checklist_lists_reviews_comments_and_failing_contexts() {
        let feedback = PrFeedback {
            pr_number: 12,
            changes_requested: vec![PullRequestReview {
                user: User {
                    login: "reviewer".into(),
                },
                body: "please fix the retry loop".into(),
                state: "CHANGES_REQUESTED".into(),
                ..Default::default()
            }],
            new_comments: vec![IssueComment {
                id: 5,
                user: User { login: "dev".into() },
                body: "also the timeout".into(),
                ..Default::default()
            }],
            combined_status: crate::domain::CombinedStatus {
                state: "failure".into(),
                statuses: vec![
                    CommitStatus {
                        state: "failure".into(),
                        context: "ci/test".into(),
                        description: "2 failed".into(),
                        ..Default::default()
                    },
                    CommitStatus {
                        state: "success".into(),
                        context: "ci/lint".into(),
                        ..Default::default()
                    },
                ],
            },
            ..Default::default()
        };
        let checklist = render_feedback_checklist(&feedback);
        assert!(checklist.contains("- [ ] reviewer: please fix the retry loop"));
        assert!(checklist.contains("- [ ] dev: also the timeout"));
        assert!(checklist.contains("- [ ] ci/test: 2 failed"));
        assert!(!checklist.contains("ci/lint"));
    }

    #[test]
    fn empty_feedback_renders_placeholder() {
        let checklist = render_feedback_checklist(&PrFeedback::default());
        assert!(checklist.contains("No actionable feedback detected"));
    }

    #[test]
    fn long_snippets_are_truncated() {
        let long = "x".repeat(500);
        let s = snippet(&long);
        assert!(s.chars().count() <= 241);
        assert!(s.ends_with('…'));
        assert_eq!(snippet("   "), "(no body)");
    }

    #[test]
    fn follow_up_comment_mentions_signals() {
        let fp = FingerprintRecord {
            fingerprint: "cd".repeat(32),
            ..Default::default()
        };
        let feedback = PrFeedback {
            pr_number: 9,
            pr_url: "https://example.com/pr/9".into(),
            head_sha: "deadbeefcafebabe".into(),
            combined_status: crate::domain::CombinedStatus {
                state: "failure".into(),
                statuses: vec![],
            },
            ..Default::default()
        };
        let comment = build_follow_up_comment(&fp, &feedback);
        assert!(comment.starts_with("<!-- FTC:REVIEW_RESPONSE_START -->"));
        assert!(comment.ends_with("<!-- FTC:REVIEW_RESPONSE_END -->"));
        assert!(comment.contains("- PR: #9"));
        assert!(comment.contains("- CI: `failure`"));
    }
}
