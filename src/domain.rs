use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workflow {
    pub id: i64,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct ListWorkflowRunsOptions {
    pub status: String,
    pub branch: String,
    pub event: String,
    pub per_page: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: i64,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub head_sha: String,
    #[serde(default)]
    pub head_branch: String,
    #[serde(default)]
    pub event: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ListRunJobsOptions {
    pub per_page: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub conclusion: String,
    #[serde(default)]
    pub runner_name: String,
    #[serde(skip)]
    pub runner_os: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// One observed test failure instance. Immutable once created; identified by
/// `(fingerprint, run_id, job_id, test_name)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Occurrence {
    pub repo: String,
    pub workflow: String,
    pub run_id: i64,
    pub run_url: String,
    pub head_sha: String,
    pub job_id: i64,
    pub job_name: String,
    pub runner_os: String,
    pub occurred_at: DateTime<Utc>,
    pub framework: String,
    pub test_name: String,
    pub error_signature: String,
    pub excerpt: String,
    pub fingerprint: String,
}

impl Occurrence {
    pub fn platform_bucket(&self) -> &str {
        &self.runner_os
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Class {
    #[serde(rename = "flaky-test")]
    FlakyTest,
    #[serde(rename = "infra-flake")]
    InfraFlake,
    #[serde(rename = "likely-regression")]
    LikelyRegression,
    #[serde(rename = "unknown")]
    Unknown,
}

impl Class {
    pub fn as_str(self) -> &'static str {
        match self {
            Class::FlakyTest => "flaky-test",
            Class::InfraFlake => "infra-flake",
            Class::LikelyRegression => "likely-regression",
            Class::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Class {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Classification {
    pub class: Class,
    pub confidence: f64,
    pub explanation: String,
}

/// Lifecycle state of a fingerprint. The allowed edges live in
/// [`FingerprintState::can_transition_to`]; everything else is rejected by
/// the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FingerprintState {
    #[default]
    #[serde(rename = "DISCOVERED")]
    Discovered,
    #[serde(rename = "ISSUE_OPEN")]
    IssueOpen,
    #[serde(rename = "TRIAGED")]
    Triaged,
    #[serde(rename = "WAITING_FOR_SIGNAL")]
    WaitingForSignal,
    #[serde(rename = "NEEDS_UPDATE")]
    NeedsUpdate,
    #[serde(rename = "APPROVED_TO_FIX")]
    ApprovedToFix,
    #[serde(rename = "PR_OPEN")]
    PrOpen,
    #[serde(rename = "PR_NEEDS_CHANGES")]
    PrNeedsChanges,
    #[serde(rename = "PR_UPDATING")]
    PrUpdating,
    #[serde(rename = "MERGED")]
    Merged,
    #[serde(rename = "CLOSED_WONTFIX")]
    ClosedWontFix,
}

impl FingerprintState {
    pub fn as_str(self) -> &'static str {
        match self {
            FingerprintState::Discovered => "DISCOVERED",
            FingerprintState::IssueOpen => "ISSUE_OPEN",
            FingerprintState::Triaged => "TRIAGED",
            FingerprintState::WaitingForSignal => "WAITING_FOR_SIGNAL",
            FingerprintState::NeedsUpdate => "NEEDS_UPDATE",
            FingerprintState::ApprovedToFix => "APPROVED_TO_FIX",
            FingerprintState::PrOpen => "PR_OPEN",
            FingerprintState::PrNeedsChanges => "PR_NEEDS_CHANGES",
            FingerprintState::PrUpdating => "PR_UPDATING",
            FingerprintState::Merged => "MERGED",
            FingerprintState::ClosedWontFix => "CLOSED_WONTFIX",
        }
    }

    /// Parses a stored state string. Empty input maps to `Discovered` so
    /// records written before the lifecycle columns existed keep working.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "" | "DISCOVERED" => Some(FingerprintState::Discovered),
            "ISSUE_OPEN" => Some(FingerprintState::IssueOpen),
            "TRIAGED" => Some(FingerprintState::Triaged),
            "WAITING_FOR_SIGNAL" => Some(FingerprintState::WaitingForSignal),
            "NEEDS_UPDATE" => Some(FingerprintState::NeedsUpdate),
            "APPROVED_TO_FIX" => Some(FingerprintState::ApprovedToFix),
            "PR_OPEN" => Some(FingerprintState::PrOpen),
            "PR_NEEDS_CHANGES" => Some(FingerprintState::PrNeedsChanges),
            "PR_UPDATING" => Some(FingerprintState::PrUpdating),
            "MERGED" => Some(FingerprintState::Merged),
            "CLOSED_WONTFIX" => Some(FingerprintState::ClosedWontFix),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, FingerprintState::Merged | FingerprintState::ClosedWontFix)
    }

    /// The lifecycle transition table. Self-transitions are not listed here;
    /// callers treat them as silent no-ops.
    pub fn can_transition_to(self, next: FingerprintState) -> bool {
        use FingerprintState::*;
        matches!(
            (self, next),
            (Discovered, IssueOpen)
                | (IssueOpen, Triaged)
                | (IssueOpen, NeedsUpdate)
                | (Triaged, WaitingForSignal)
                | (Triaged, NeedsUpdate)
                | (WaitingForSignal, Triaged)
                | (WaitingForSignal, ApprovedToFix)
                | (WaitingForSignal, ClosedWontFix)
                | (WaitingForSignal, NeedsUpdate)
                | (NeedsUpdate, IssueOpen)
                | (ApprovedToFix, PrOpen)
                | (PrOpen, PrNeedsChanges)
                | (PrOpen, Merged)
                | (PrOpen, ClosedWontFix)
                | (PrNeedsChanges, PrUpdating)
                | (PrUpdating, PrOpen)
        )
    }
}

impl std::fmt::Display for FingerprintState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable per-fingerprint aggregate. Created on first discovery, mutated by
/// the discovery and interaction loops, never destroyed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub fingerprint: String,
    pub fingerprint_version: String,
    pub repo: String,
    pub test_name: String,
    pub framework: String,
    pub class: String,
    pub confidence: f64,
    pub issue_number: i64,
    pub pr_number: i64,
    pub last_issue_comment_id: i64,
    pub last_pr_comment_id: i64,
    pub state: FingerprintState,
    pub state_changed_at: DateTime<Utc>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl Default for FingerprintRecord {
    fn default() -> Self {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        FingerprintRecord {
            fingerprint: String::new(),
            fingerprint_version: String::new(),
            repo: String::new(),
            test_name: String::new(),
            framework: String::new(),
            class: String::new(),
            confidence: 0.0,
            issue_number: 0,
            pr_number: 0,
            last_issue_comment_id: 0,
            last_pr_comment_id: 0,
            state: FingerprintState::Discovered,
            state_changed_at: epoch,
            first_seen_at: epoch,
            last_seen_at: epoch,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueLabel {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Issue {
    pub number: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub labels: Vec<IssueLabel>,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, Default)]
pub struct CreateIssueInput {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

/// Partial issue update. `None` fields are left untouched upstream.
#[derive(Debug, Clone, Default)]
pub struct UpdateIssueInput {
    pub title: Option<String>,
    pub body: Option<String>,
    pub labels: Option<Vec<String>>,
    pub state: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub login: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueComment {
    pub id: i64,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub user: User,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct ListIssueCommentsOptions {
    pub per_page: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrHead {
    #[serde(rename = "ref", default)]
    pub branch: String,
    #[serde(default)]
    pub sha: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: i64,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub merged: bool,
    #[serde(default)]
    pub merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub head: PrHead,
}

impl PullRequest {
    pub fn is_merged(&self) -> bool {
        self.merged || self.merged_at.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullRequestReview {
    pub id: i64,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub user: User,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommitStatus {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub target_url: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CombinedStatus {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub statuses: Vec<CommitStatus>,
}

#[derive(Debug, Clone, Default)]
pub struct CreatePullRequestInput {
    pub title: String,
    pub head: String,
    pub base: String,
    pub body: String,
    pub draft: bool,
}

/// Everything the interaction loop learned about an open fix PR in one poll.
#[derive(Debug, Clone, Default)]
pub struct PrFeedback {
    pub pr_number: i64,
    pub pr_url: String,
    pub head_sha: String,
    pub changes_requested: Vec<PullRequestReview>,
    pub combined_status: CombinedStatus,
    pub latest_comment_id: i64,
    pub new_comments: Vec<IssueComment>,
}

impl PrFeedback {
    pub fn needs_update(&self) -> bool {
        if !self.new_comments.is_empty() || !self.changes_requested.is_empty() {
            return true;
        }
        self.combined_status.state == "failure" || self.combined_status.state == "error"
    }
}

/// True when a comment or body was authored by this bot.
pub fn is_managed_body(body: &str) -> bool {
    body.contains("<!-- FTC:")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_accepts_listed_edges() {
        use FingerprintState::*;
        let edges = [
            (Discovered, IssueOpen),
            (IssueOpen, Triaged),
            (IssueOpen, NeedsUpdate),
            (Triaged, WaitingForSignal),
            (WaitingForSignal, ApprovedToFix),
            (WaitingForSignal, ClosedWontFix),
            (NeedsUpdate, IssueOpen),
            (ApprovedToFix, PrOpen),
            (PrOpen, PrNeedsChanges),
            (PrOpen, Merged),
            (PrNeedsChanges, PrUpdating),
            (PrUpdating, PrOpen),
        ];
        for (from, to) in edges {
            assert!(from.can_transition_to(to), "{from} -> {to} should be allowed");
        }
    }

    #[test]
    fn transition_table_rejects_unlisted_edges() {
        use FingerprintState::*;
        let edges = [
            (Discovered, PrOpen),
            (WaitingForSignal, PrOpen),
            (Merged, PrOpen),
            (ClosedWontFix, Discovered),
            (PrOpen, ApprovedToFix),
            (IssueOpen, WaitingForSignal),
        ];
        for (from, to) in edges {
            assert!(!from.can_transition_to(to), "{from} -> {to} should be rejected");
        }
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        use FingerprintState::*;
        let all = [
            Discovered,
            IssueOpen,
            Triaged,
            WaitingForSignal,
            NeedsUpdate,
            ApprovedToFix,
            PrOpen,
            PrNeedsChanges,
            PrUpdating,
            Merged,
            ClosedWontFix,
        ];
        for next in all {
            assert!(!Merged.can_transition_to(next));
            assert!(!ClosedWontFix.can_transition_to(next));
        }
    }

    #[test]
    fn state_round_trips_through_strings() {
        use FingerprintState::*;
        for state in [
            Discovered,
            IssueOpen,
            Triaged,
            WaitingForSignal,
            NeedsUpdate,
            ApprovedToFix,
            PrOpen,
            PrNeedsChanges,
            PrUpdating,
            Merged,
            ClosedWontFix,
        ] {
            assert_eq!(FingerprintState::parse(state.as_str()), Some(state));
        }
        assert_eq!(FingerprintState::parse(""), Some(Discovered));
        assert_eq!(FingerprintState::parse("NOT_A_STATE"), None);
    }

    #[test]
    fn merged_pr_detection() {
        let mut pr = PullRequest {
            merged: true,
            ..Default::default()
        };
        assert!(pr.is_merged());
        pr.merged = false;
        pr.merged_at = Some(Utc::now());
        assert!(pr.is_merged());
        pr.merged_at = None;
        assert!(!pr.is_merged());
    }

    #[test]
    fn feedback_needs_update_on_failure_status() {
        let mut fb = PrFeedback::default();
        assert!(!fb.needs_update());
        fb.combined_status.state = "failure".into();
        assert!(fb.needs_update());
        fb.combined_status.state = "success".into();
        assert!(!fb.needs_update());
        fb.new_comments.push(IssueComment::default());
        assert!(fb.needs_update());
    }
}
