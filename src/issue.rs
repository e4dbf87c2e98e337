use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::info;

use crate::domain::{
    Class, Classification, CreateIssueInput, FingerprintRecord, Occurrence, UpdateIssueInput,
};
use crate::github::{GitHubError, IssueService};

pub const LABEL_MANAGED: &str = "flaky-test-cleaner/ai-managed";
pub const LABEL_FLAKY: &str = "flaky-test-cleaner/flaky-test";
pub const LABEL_NEEDS_TRIAGE: &str = "flaky-test-cleaner/needs-triage";
pub const LABEL_FIX_APPROVED: &str = "flaky-test-cleaner/ai-fix-approved";
pub const LABEL_PR_OPEN: &str = "flaky-test-cleaner/ai-pr-open";

const MAX_EVIDENCE_ROWS: usize = 5;
const MAX_EXCERPT_RUNS: usize = 2;

/// Plans and applies the tracking issue for a fingerprint. Planning is pure;
/// apply talks to the issue service.
#[derive(Debug, Clone)]
pub struct IssueManager {
    owner: String,
    repo: String,
    dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct PlanInput {
    pub fingerprint: FingerprintRecord,
    pub occurrences: Vec<Occurrence>,
    pub classification: Classification,
}

#[derive(Debug, Clone, Default)]
pub struct PlannedChange {
    pub noop: bool,
    pub create: bool,
    pub issue_number: i64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

impl IssueManager {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, dry_run: bool) -> Self {
        IssueManager {
            owner: owner.into(),
            repo: repo.into(),
            dry_run,
        }
    }

    pub fn plan_issue_update(&self, input: &PlanInput) -> PlannedChange {
        if input.occurrences.is_empty() {
            return PlannedChange {
                noop: true,
                ..Default::default()
            };
        }
        let mut short_sig = summarize_signature(&input.occurrences[0].error_signature);
        let mut name = input.fingerprint.test_name.clone();
        if name.is_empty() {
            name = input.occurrences[0].test_name.clone();
        }
        if name.is_empty() {
            name = "unknown-test".into();
        }
        if short_sig.is_empty() {
            short_sig = "unknown-error".into();
        }
        let title = if name == "unknown-test" {
            format!("[flaky] {name} — {short_sig}")
        } else {
            format!("[flaky] {name}")
        };
        let labels = default_labels(&input.classification);
        let body = build_body(input, &labels);

        if input.fingerprint.issue_number == 0 {
            PlannedChange {
                create: true,
                title,
                body,
                labels,
                ..Default::default()
            }
        } else {
            PlannedChange {
                issue_number: input.fingerprint.issue_number,
                title,
                body,
                labels,
                ..Default::default()
            }
        }
    }

    /// Applies a planned change; returns the issue number, or 0 when nothing
    /// was written (no-op plan or dry-run).
    pub async fn apply(
        &self,
        github: &dyn IssueService,
        change: &PlannedChange,
    ) -> Result<i64, GitHubError> {
        if change.noop {
            return Ok(0);
        }
        if self.dry_run {
            info!(
                title = %change.title,
                labels = ?change.labels,
                create = change.create,
                "dry-run: skipping issue write"
            );
            return Ok(0);
        }
        github
            .ensure_labels(&self.owner, &self.repo, &change.labels)
            .await?;
        if change.create {
            let created = github
                .create_issue(
                    &self.owner,
                    &self.repo,
                    &CreateIssueInput {
                        title: change.title.clone(),
                        body: change.body.clone(),
                        labels: change.labels.clone(),
                    },
                )
                .await?;
            return Ok(created.number);
        }
        github
            .update_issue(
                &self.owner,
                &self.repo,
                change.issue_number,
                &UpdateIssueInput {
                    title: Some(change.title.clone()),
                    body: Some(change.body.clone()),
                    labels: Some(change.labels.clone()),
                    state: None,
                },
            )
            .await?;
        Ok(change.issue_number)
    }
}

fn default_labels(classification: &Classification) -> Vec<String> {
    let mut labels = vec![LABEL_MANAGED.to_string()];
    match classification.class {
        Class::FlakyTest => labels.push(LABEL_FLAKY.to_string()),
        Class::Unknown | Class::LikelyRegression => labels.push(LABEL_NEEDS_TRIAGE.to_string()),
        Class::InfraFlake => {}
    }
    labels
}

fn build_body(input: &PlanInput, labels: &[String]) -> String {
    let mut occ = input.occurrences.clone();
    occ.sort_by(|a, b| {
        b.occurred_at
            .cmp(&a.occurred_at)
            .then(b.run_id.cmp(&a.run_id))
    });

    let (mut first_seen, mut last_seen) = (
        input.fingerprint.first_seen_at,
        input.fingerprint.last_seen_at,
    );
    let epoch = DateTime::<Utc>::UNIX_EPOCH;
    if first_seen == epoch || last_seen == epoch {
        if let Some((first, last)) = occurrence_range(&occ) {
            first_seen = first;
            last_seen = last;
        }
    }

    let summary = format!(
        "## Summary\n\n- Classification: **{}** (confidence {:.2})\n- First seen: {}\n- Last seen: {}\n",
        input.classification.class,
        input.classification.confidence,
        format_time(first_seen),
        format_time(last_seen),
    );

    let mut evidence =
        String::from("## Evidence\n\n| Run | Commit | Test | Error Signature |\n| --- | --- | --- | --- |\n");
    for o in occ.iter().take(MAX_EVIDENCE_ROWS) {
        evidence.push_str(&format!(
            "| [{}]({}) | {} | {} | {} |\n",
            o.run_id,
            o.run_url,
            short_sha(&o.head_sha),
            safe(&o.test_name),
            summarize_signature(&o.error_signature),
        ));
    }

    let mut excerpts = String::from("## Log Excerpts\n");
    for o in occ.iter().take(MAX_EXCERPT_RUNS) {
        if o.excerpt.is_empty() {
            continue;
        }
        excerpts.push_str(&format!(
            "\n<details>\n<summary>Run {} — {}</summary>\n\n````\n{}\n````\n</details>\n",
            o.run_id,
            safe(&o.job_name),
            o.excerpt,
        ));
    }

    let automation = format!(
        "<details>\n<summary>Automation</summary>\n\n- Fingerprint: `{}`\n- Labels: {}\n- Last scan: {}\n</details>\n",
        input.fingerprint.fingerprint,
        labels.join(", "),
        format_time(Utc::now()),
    );

    [
        wrap_block("SUMMARY", &summary),
        wrap_block("EVIDENCE", &evidence),
        wrap_block("EXCERPTS", &excerpts),
        wrap_block("AUTOMATION", &automation),
    ]
    .join("\n\n")
        + "\n"
}

fn wrap_block(name: &str, content: &str) -> String {
    format!(
        "<!-- FTC:{name}_START -->\n{}\n<!-- FTC:{name}_END -->",
        content.trim()
    )
}

static RE_LEADING_TS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?Z\s+").unwrap()
});

pub(crate) fn summarize_signature(sig: &str) -> String {
    let line = sig.split('\n').next().unwrap_or_default().trim();
    let line = RE_LEADING_TS.replace(line, "").trim().to_string();
    if line.chars().count() > 120 {
        let truncated: String = line.chars().take(120).collect();
        return format!("{truncated}...");
    }
    line
}

pub(crate) fn short_sha(sha: &str) -> &str {
    if sha.len() <= 7 {
        sha
    } else {
        &sha[..7]
    }
}

pub(crate) fn safe(s: &str) -> &str {
    if s.trim().is_empty() {
        "-"
    } else {
        s
    }
}

fn occurrence_range(occ: &[Occurrence]) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let first = occ.iter().map(|o| o.occurred_at).min()?;
    let last = occ.iter().map(|o| o.occurred_at).max()?;
    Some((first, last))
}

pub(crate) fn format_time(t: DateTime<Utc>) -> String {
    if t == DateTime::<Utc>::UNIX_EPOCH {
        return "unknown".into();
    }
    t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
