use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

use crate::domain::Occurrence;

/// Metadata for one CI job plus its raw log text.
#[derive(Debug, Clone, Default)]
pub struct ExtractInput {
    pub repo: String,
    pub workflow: String,
    pub run_id: i64,
    pub run_url: String,
    pub head_sha: String,
    pub job_id: i64,
    pub job_name: String,
    pub runner_os: String,
    pub occurred_at: DateTime<Utc>,
    pub raw_log_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkerKind {
    GoTestFail,
    GinkgoFail,
    Panic,
    Race,
    Timeout,
}

impl MarkerKind {
    /// Lines of context kept before/after the marker, tuned per kind: a
    /// panic's interesting content is the stack below it, a test failure's
    /// is the run-up above it.
    fn window(self) -> (usize, usize) {
        match self {
            MarkerKind::Panic | MarkerKind::Timeout => (40, 159),
            MarkerKind::Race => (60, 139),
            MarkerKind::GoTestFail | MarkerKind::GinkgoFail => (159, 40),
        }
    }

    fn carries_test_name(self) -> bool {
        matches!(self, MarkerKind::GoTestFail | MarkerKind::GinkgoFail)
    }

    fn framework(self) -> &'static str {
        match self {
            MarkerKind::GinkgoFail => "ginkgo",
            _ => "go-test",
        }
    }
}

const EXCERPT_CAP: usize = 200;
const NAME_LOOKBACK: usize = 200;
const DETAIL_LOOKAHEAD: usize = 20;

/// Narrow whitelist: plain "timeout" would match config noise such as
/// `election-timeout`.
const TIMEOUT_PHRASES: &[&str] = &[
    "test timed out after",
    "context deadline exceeded",
    "deadline exceeded",
    "panic: test timed out after",
];

static RE_TS_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?Z\s?").unwrap());
static RE_GO_FILE_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\S+\.go:\d+").unwrap());

/// Parses a single job's raw log text into deduplicated failure occurrences.
/// Never emits an occurrence with an empty test name.
#[derive(Debug, Clone, Default)]
pub struct LogExtractor;

impl LogExtractor {
    pub fn new() -> Self {
        LogExtractor
    }

    pub fn extract(&self, input: &ExtractInput) -> Vec<Occurrence> {
        let lines: Vec<&str> = input.raw_log_text.split('\n').collect();
        let mut out = Vec::new();
        let mut seen = HashSet::new();

        for (idx, raw_line) in lines.iter().enumerate() {
            let line = strip_ts_prefix(raw_line);
            let Some(kind) = detect_marker(line) else {
                continue;
            };
            let test_name = if kind.carries_test_name() {
                marker_test_name(kind, line.trim())
            } else {
                infer_test_name(&lines, idx)
            };
            let Some(test_name) = test_name else {
                continue;
            };
            if test_name.is_empty() {
                continue;
            }

            let signature = build_signature(kind, &lines, idx);
            if !seen.insert((test_name.clone(), signature.clone())) {
                continue;
            }

            let (start, end) = excerpt_window(kind, &lines, idx);
            let excerpt = lines[start..=end].join("\n");

            out.push(Occurrence {
                repo: input.repo.clone(),
                workflow: input.workflow.clone(),
                run_id: input.run_id,
                run_url: input.run_url.clone(),
                head_sha: input.head_sha.clone(),
                job_id: input.job_id,
                job_name: input.job_name.clone(),
                runner_os: input.runner_os.clone(),
                occurred_at: input.occurred_at,
                framework: kind.framework().to_string(),
                test_name,
                error_signature: signature,
                excerpt,
                fingerprint: String::new(),
            });
        }

        drop_parent_tests(out)
    }
}

fn strip_ts_prefix(line: &str) -> &str {
    match RE_TS_PREFIX.find(line) {
        Some(m) => &line[m.end()..],
        None => line,
    }
}

fn detect_marker(line: &str) -> Option<MarkerKind> {
    let trimmed = line.trim_start();
    if trimmed.starts_with("--- FAIL: ") {
        return Some(MarkerKind::GoTestFail);
    }
    if trimmed.starts_with("[FAIL]") {
        return Some(MarkerKind::GinkgoFail);
    }
    if trimmed.starts_with("panic:") {
        return Some(MarkerKind::Panic);
    }
    if line.contains("DATA RACE") {
        return Some(MarkerKind::Race);
    }
    let lower = line.to_lowercase();
    if TIMEOUT_PHRASES.iter().any(|p| lower.contains(p)) {
        return Some(MarkerKind::Timeout);
    }
    None
}

fn marker_test_name(kind: MarkerKind, trimmed: &str) -> Option<String> {
    match kind {
        MarkerKind::GoTestFail => trimmed
            .strip_prefix("--- FAIL: ")
            .and_then(|rest| rest.split_whitespace().next())
            .map(str::to_string),
        MarkerKind::GinkgoFail => {
            let rest = trimmed.strip_prefix("[FAIL]")?;
            let tokens: Vec<&str> = rest.split_whitespace().collect();
            if tokens.is_empty() {
                return None;
            }
            tokens
                .iter()
                .find(|t| t.starts_with("Test"))
                .or(tokens.last())
                .map(|t| t.to_string())
        }
        _ => None,
    }
}

/// Walks backward from a nameless marker (panic, race, timeout) to the most
/// recent line that identifies the running test.
fn infer_test_name(lines: &[&str], idx: usize) -> Option<String> {
    let floor = idx.saturating_sub(NAME_LOOKBACK);
    for i in (floor..idx).rev() {
        let line = strip_ts_prefix(lines[i]);
        let trimmed = line.trim_start();
        if trimmed.starts_with("--- FAIL: ") {
            if let Some(name) = marker_test_name(MarkerKind::GoTestFail, trimmed) {
                return Some(name);
            }
        }
        if trimmed.starts_with("=== RUN") {
            if let Some(name) = trimmed
                .strip_prefix("=== RUN")
                .and_then(|rest| rest.split_whitespace().next())
            {
                return Some(name.to_string());
            }
        }
        if trimmed.starts_with("[FAIL]") {
            if let Some(name) = marker_test_name(MarkerKind::GinkgoFail, trimmed) {
                return Some(name);
            }
        }
    }
    None
}

/// Computes the excerpt line range for a marker: the kind-specific window,
/// clamped to an enclosing `##[group]` block, then rescaled around the
/// marker if it would exceed the cap.
fn excerpt_window(kind: MarkerKind, lines: &[&str], idx: usize) -> (usize, usize) {
    let (before, after) = kind.window();
    let mut start = idx.saturating_sub(before);
    let mut end = (idx + after).min(lines.len() - 1);

    if let Some((group_start, group_end)) = enclosing_group(lines, idx) {
        start = start.max(group_start + 1);
        end = end.min(group_end.saturating_sub(1)).max(idx);
    }

    if end - start + 1 > EXCERPT_CAP {
        let before_avail = idx - start;
        let after_avail = end - idx;
        let budget = EXCERPT_CAP - 1;
        let scaled_before = before_avail * budget / (before_avail + after_avail);
        let scaled_after = budget - scaled_before;
        start = idx - scaled_before.min(before_avail);
        end = (idx + scaled_after).min(end);
    }
    (start, end)
}

fn enclosing_group(lines: &[&str], idx: usize) -> Option<(usize, usize)> {
    let mut group_start = None;
    for i in (0..idx).rev() {
        let trimmed = strip_ts_prefix(lines[i]).trim_start();
        if trimmed.starts_with("##[endgroup]") {
            return None;
        }
        if trimmed.starts_with("##[group]") {
            group_start = Some(i);
            break;
        }
    }
    let group_start = group_start?;
    for (offset, raw) in lines[idx + 1..].iter().enumerate() {
        let trimmed = strip_ts_prefix(raw).trim_start();
        if trimmed.starts_with("##[endgroup]") {
            return Some((group_start, idx + 1 + offset));
        }
        if trimmed.starts_with("##[group]") {
            break;
        }
    }
    None
}

/// First-line diagnostic plus one supporting line. For fail markers the
/// "detail" line below the marker (the assertion message) leads; for panics,
/// races and timeouts the marker line itself leads.
fn build_signature(kind: MarkerKind, lines: &[&str], idx: usize) -> String {
    let marker = strip_ts_prefix(lines[idx]).trim();
    match kind {
        MarkerKind::GoTestFail | MarkerKind::GinkgoFail => {
            let ceiling = (idx + DETAIL_LOOKAHEAD).min(lines.len() - 1);
            for raw in &lines[idx + 1..=ceiling] {
                let line = strip_ts_prefix(raw);
                if line.starts_with("    ") || RE_GO_FILE_LINE.is_match(line) {
                    return format!("{}\n{}", line.trim(), marker);
                }
            }
            marker.to_string()
        }
        _ => match lines.get(idx + 1) {
            Some(next) => format!("{}\n{}", marker, strip_ts_prefix(next).trim()),
            None => marker.to_string(),
        },
    }
}

/// Go subtests report both the parent and the leaf; only leaves are
/// actionable. Removes every occurrence whose test name is a proper
/// path-prefix of another emitted name.
fn drop_parent_tests(occurrences: Vec<Occurrence>) -> Vec<Occurrence> {
    let mut parents: HashSet<String> = HashSet::new();
    for occ in &occurrences {
        if !occ.test_name.contains('/') {
            continue;
        }
        let segments: Vec<&str> = occ.test_name.split('/').collect();
        for cut in 1..segments.len() {
            parents.insert(segments[..cut].join("/"));
        }
    }
    occurrences
        .into_iter()
        .filter(|occ| !parents.contains(&occ.test_name))
        .collect()
}
