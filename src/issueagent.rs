use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::domain::{Class, Classification, FingerprintRecord, Occurrence};
use crate::issue::{format_time, safe, short_sha, summarize_signature};

pub const AGENT_BLOCK_START: &str = "<!-- FTC:ISSUE_AGENT_START -->";
pub const AGENT_BLOCK_END: &str = "<!-- FTC:ISSUE_AGENT_END -->";

#[derive(Debug, Clone)]
pub struct AnalysisInput {
    pub fingerprint: FingerprintRecord,
    pub occurrences: Vec<Occurrence>,
    pub classification: Classification,
    /// Read-only code snippets around the failure, gathered from the repo
    /// mirror when one is available. Empty when no workspace is configured.
    pub repo_context_snippets: String,
}

/// External analysis backend. Implementations return a complete comment
/// body; the caller rejects anything missing the agent marker pair and falls
/// back to the deterministic renderer.
#[async_trait]
pub trait AnalysisModel: Send + Sync {
    async fn generate_initial_comment(&self, input: &AnalysisInput) -> anyhow::Result<String>;
}

/// A replacement body is only accepted when it carries both agent markers.
pub fn is_valid_agent_block(body: &str) -> bool {
    body.contains(AGENT_BLOCK_START) && body.contains(AGENT_BLOCK_END)
}

/// Deterministic initial-analysis renderer. Always available; an external
/// model may substitute its own body through [`AnalysisModel`].
pub fn render_initial_comment(input: &AnalysisInput) -> String {
    let occ = &input.occurrences;
    let test_name = pick_test_name(input);
    let (first_seen, last_seen) = timeline(input);
    let mut out = String::new();

    out.push_str(AGENT_BLOCK_START);
    out.push_str("\n## AI Analysis Summary\n\n");
    out.push_str(&format!(
        "- Fingerprint: `{}`\n",
        safe(&input.fingerprint.fingerprint)
    ));
    out.push_str(&format!(
        "- Classification: **{}** (confidence {:.2})\n",
        input.classification.class, input.classification.confidence
    ));
    if !input.classification.explanation.trim().is_empty() {
        out.push_str(&format!(
            "- Classifier notes: {}\n",
            input.classification.explanation.trim()
        ));
    }
    out.push_str(&format!("- Test focus: {}\n", safe(&test_name)));
    out.push_str(&format!("- Runs analyzed: {}\n", describe_runs(occ)));
    out.push_str(&format!(
        "- Evidence window: {} → {}\n",
        format_time(first_seen),
        format_time(last_seen)
    ));

    out.push_str("\n## Hypotheses\n");
    for (i, hypothesis) in generate_hypotheses(occ).iter().enumerate() {
        out.push_str(&format!("{}. {}\n", i + 1, hypothesis));
    }

    out.push_str("\n## Reproduction Ideas\n");
    for step in reproduction_ideas(&test_name, occ) {
        out.push_str(&format!("- {step}\n"));
    }

    out.push_str("\n## Suggested Fix Directions\n");
    for step in suggested_next_steps(&input.classification) {
        out.push_str(&format!("- {step}\n"));
    }

    out.push_str("\n## Risk Notes\n");
    for note in risk_notes(&input.classification) {
        out.push_str(&format!("- {note}\n"));
    }

    out.push_str("\n## Evidence Highlights\n");
    for line in evidence_highlights(occ) {
        out.push_str(&format!("- {line}\n"));
    }

    if !input.repo_context_snippets.trim().is_empty() {
        out.push_str("\n## Repo Context\n\n");
        out.push_str(input.repo_context_snippets.trim());
        out.push('\n');
    }

    out.push('\n');
    out.push_str(AGENT_BLOCK_END);
    out.push('\n');
    out
}

fn pick_test_name(input: &AnalysisInput) -> String {
    if !input.fingerprint.test_name.trim().is_empty() {
        return input.fingerprint.test_name.clone();
    }
    input
        .occurrences
        .iter()
        .find(|o| !o.test_name.trim().is_empty())
        .map(|o| o.test_name.clone())
        .unwrap_or_else(|| "unknown-test".into())
}

fn describe_runs(occ: &[Occurrence]) -> String {
    if occ.is_empty() {
        return "n/a".into();
    }
    let mut runs: BTreeMap<i64, String> = BTreeMap::new();
    for o in occ {
        runs.insert(o.run_id, o.run_url.clone());
    }
    runs.iter()
        .rev()
        .take(5)
        .map(|(id, url)| {
            if url.is_empty() {
                id.to_string()
            } else {
                format!("[{id}]({url})")
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn timeline(input: &AnalysisInput) -> (DateTime<Utc>, DateTime<Utc>) {
    let epoch = DateTime::<Utc>::UNIX_EPOCH;
    let mut first = input.fingerprint.first_seen_at;
    let mut last = input.fingerprint.last_seen_at;
    for o in &input.occurrences {
        if first == epoch || o.occurred_at < first {
            first = o.occurred_at;
        }
        if o.occurred_at > last {
            last = o.occurred_at;
        }
    }
    (first, last)
}

struct HypothesisRule {
    keywords: &'static [&'static str],
    message: &'static str,
}

const HYPOTHESIS_RULES: &[HypothesisRule] = &[
    HypothesisRule {
        keywords: &["data race", "race detected"],
        message: "Logs show race detector warnings; run with `go test -race` and audit shared state around the failing test.",
    },
    HypothesisRule {
        keywords: &["panic", "fatal error"],
        message: "A panic occurred in the failing test; inspect the stack trace and recent changes touching the reported function.",
    },
    HypothesisRule {
        keywords: &["timeout", "timed out", "deadline exceeded"],
        message: "Timeout keywords found; the test likely hangs or exceeds its time budget. Verify cleanup and consider instrumentation around network calls.",
    },
    HypothesisRule {
        keywords: &["connection reset", "broken pipe", "dial tcp"],
        message: "Network/connectivity issues detected; confirm backing services are reachable during the test and add retries/backoff.",
    },
    HypothesisRule {
        keywords: &["assert", "expected", "mismatch"],
        message: "Assertion mismatch hints at a logic regression; compare the observed vs expected values in the excerpt.",
    },
];

fn generate_hypotheses(occ: &[Occurrence]) -> Vec<String> {
    let texts: Vec<String> = occ
        .iter()
        .map(|o| format!("{}\n{}", o.error_signature, o.excerpt).to_lowercase())
        .collect();
    let mut out: Vec<String> = HYPOTHESIS_RULES
        .iter()
        .filter(|rule| {
            texts
                .iter()
                .any(|text| rule.keywords.iter().any(|kw| text.contains(kw)))
        })
        .map(|rule| rule.message.to_string())
        .collect();
    if out.is_empty() {
        out.push(
            "No dominant signal detected; review the log excerpts above and gather additional context from recent commits touching the test."
                .into(),
        );
    }
    out
}

fn reproduction_ideas(test_name: &str, occ: &[Occurrence]) -> Vec<String> {
    let mut pattern = regex::escape(test_name);
    if pattern.is_empty() || test_name == "unknown-test" {
        pattern = "Test.*".into();
    }
    let head = occ
        .iter()
        .find(|o| !o.head_sha.trim().is_empty())
        .map(|o| short_sha(&o.head_sha).to_string());
    let mut steps = Vec::new();
    if let Some(short) = head {
        steps.push(format!(
            "Checkout commit `{short}` (or the latest ancestor) locally to mirror the failing CI context."
        ));
    }
    steps.push(format!(
        "Stress the suspected test: `go test ./... -run '^{pattern}$' -count=30 -race`."
    ));
    steps.push(
        "Capture verbose logs (`GO111MODULE=on GODEBUG=gctrace=1`) to identify stalls or resource starvation."
            .into(),
    );
    steps
}

fn suggested_next_steps(classification: &Classification) -> Vec<&'static str> {
    match classification.class {
        Class::InfraFlake => vec![
            "Correlate the failure timestamp with infra metrics (network, runners) to confirm whether it is safe to auto-ignore.",
            "Add defensive retries or health checks around external services used by the test.",
        ],
        Class::LikelyRegression => vec![
            "Diff the commits between the first failure and the last passing run to locate candidate changes.",
            "Add focused assertions around the failing code path to narrow down incorrect behavior.",
        ],
        _ => vec![
            "Audit the test for shared global state or timing assumptions; convert to isolated setup if possible.",
            "Add diagnostics (logging, metrics) around the failing assertions to capture additional evidence in future runs.",
        ],
    }
}

fn risk_notes(classification: &Classification) -> Vec<&'static str> {
    match classification.class {
        Class::InfraFlake => vec![
            "Noise can hide real regressions; keep infra flakes from blocking merges by routing them to a metrics-only pipeline.",
        ],
        Class::LikelyRegression => vec![
            "Potential correctness regression: prioritize manual confirmation before promoting automated fixes.",
        ],
        _ => vec![
            "Flaky tests erode CI signal; each recurrence costs reruns and review time. Prioritize stabilization before enabling auto-fix.",
        ],
    }
}

fn evidence_highlights(occ: &[Occurrence]) -> Vec<String> {
    if occ.is_empty() {
        return vec!["No occurrences available for evidence.".into()];
    }
    occ.iter()
        .take(3)
        .map(|o| {
            let url = if o.run_url.trim().is_empty() {
                "#"
            } else {
                &o.run_url
            };
            let mut summary = summarize_signature(&o.error_signature);
            if summary.is_empty() {
                summary = "unknown error".into();
            }
            format!(
                "Run [{}]({}) · Job {} · Commit {} · Test {} — {}",
                o.run_id,
                url,
                safe(&o.job_name),
                short_sha(&o.head_sha),
                safe(&o.test_name),
                summary,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(signature: &str) -> AnalysisInput {
        AnalysisInput {
            fingerprint: FingerprintRecord {
                fingerprint: "ab".repeat(32),
                test_name: "TestFoo".into(),
                ..Default::default()
            },
            occurrences: vec![Occurrence {
                run_id: 9,
                run_url: "https://example.com/run/9".into(),
                head_sha: "deadbeefcafebabe".into(),
                test_name: "TestFoo".into(),
                job_name: "unit".into(),
                error_signature: signature.into(),
                excerpt: signature.into(),
                occurred_at: Utc::now(),
                ..Default::default()
            }],
            classification: Classification {
                class: Class::FlakyTest,
                confidence: 0.8,
                explanation: "matched flaky keyword".into(),
            },
            repo_context_snippets: String::new(),
        }
    }

    #[test]
    fn rendered_comment_is_a_valid_agent_block() {
        let body = render_initial_comment(&input("panic: boom"));
        assert!(is_valid_agent_block(&body));
        assert!(body.starts_with(AGENT_BLOCK_START));
        assert!(body.trim_end().ends_with(AGENT_BLOCK_END));
    }

    #[test]
    fn hypotheses_follow_keywords() {
        let body = render_initial_comment(&input("WARNING: DATA RACE"));
        assert!(body.contains("race detector"));
        let body = render_initial_comment(&input("context deadline exceeded"));
        assert!(body.contains("Timeout keywords found"));
        let body = render_initial_comment(&input("dial tcp: connection refused"));
        assert!(body.contains("Network/connectivity"));
        let body = render_initial_comment(&input("plain unknown noise"));
        assert!(body.contains("No dominant signal detected"));
    }

    #[test]
    fn reproduction_includes_repeated_run_command() {
        let body = render_initial_comment(&input("panic: boom"));
        assert!(body.contains("go test ./... -run '^TestFoo$' -count=30 -race"));
        assert!(body.contains("Checkout commit `deadbee`"));
    }

    #[test]
    fn fix_directions_vary_by_class() {
        let mut inp = input("dial tcp: i/o timeout");
        inp.classification.class = Class::InfraFlake;
        let body = render_initial_comment(&inp);
        assert!(body.contains("infra metrics"));
        inp.classification.class = Class::LikelyRegression;
        let body = render_initial_comment(&inp);
        assert!(body.contains("Diff the commits"));
    }

    #[test]
    fn evidence_highlights_cap_at_three() {
        let mut inp = input("panic: boom");
        let occ = inp.occurrences[0].clone();
        for i in 0..5 {
            let mut extra = occ.clone();
            extra.run_id = 100 + i;
            inp.occurrences.push(extra);
        }
        let body = render_initial_comment(&inp);
        let highlights = body.matches("Run [").count();
        assert_eq!(highlights, 3);
    }

    #[test]
    fn repo_context_is_embedded_when_present() {
        let mut inp = input("panic: boom");
        inp.repo_context_snippets = "- S1: server/foo.go@deadbee L1-L40".into();
        let body = render_initial_comment(&inp);
        assert!(body.contains("## Repo Context"));
        assert!(body.contains("server/foo.go"));
    }

    #[test]
    fn validation_rejects_bodies_without_markers() {
        assert!(!is_valid_agent_block("## Analysis\nno markers here"));
        assert!(!is_valid_agent_block(AGENT_BLOCK_START));
        assert!(is_valid_agent_block(&format!(
            "{AGENT_BLOCK_START}\nhello\n{AGENT_BLOCK_END}"
        )));
    }
}
