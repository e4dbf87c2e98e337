use crate::domain::{Class, Classification, Occurrence};

/// Keyword-driven classifier over the error signature and excerpt. Cheap and
/// deterministic; the confidence threshold demotes weak flaky matches to
/// `unknown` so they land in the needs-triage bucket instead.
#[derive(Debug, Clone)]
pub struct HeuristicClassifier {
    threshold: f64,
}

const INFRA_KEYWORDS: &[&str] = &[
    "connection reset",
    "broken pipe",
    "dial tcp",
    "tls handshake timeout",
    "i/o timeout",
    "no space left on device",
    "network is unreachable",
    "temporary failure",
    "runner lost",
    "operation timed out",
];

const REGRESSION_KEYWORDS: &[&str] = &[
    "undefined:",
    "cannot find",
    "build failed",
    "compile",
    "syntax error",
    "missing module",
    "no required module provides package",
];

const FLAKY_KEYWORDS: &[&str] = &[
    "data race",
    "panic:",
    "timeout",
    "test timed out",
    "race detected",
];

impl HeuristicClassifier {
    pub fn new(threshold: f64) -> Self {
        HeuristicClassifier { threshold }
    }

    pub fn classify(&self, occ: &Occurrence) -> Classification {
        let text = format!("{}\n{}", occ.error_signature, occ.excerpt)
            .trim()
            .to_lowercase();
        if text.is_empty() {
            return Classification {
                class: Class::Unknown,
                confidence: 0.4,
                explanation: "no signal in logs".into(),
            };
        }
        if contains_any(&text, INFRA_KEYWORDS) {
            return Classification {
                class: Class::InfraFlake,
                confidence: 0.9,
                explanation: "matched infra/network keyword".into(),
            };
        }
        if contains_any(&text, REGRESSION_KEYWORDS) {
            return Classification {
                class: Class::LikelyRegression,
                confidence: 0.85,
                explanation: "matched build/compile keyword".into(),
            };
        }
        if contains_any(&text, FLAKY_KEYWORDS) {
            let confidence = 0.8;
            if confidence < self.threshold {
                return Classification {
                    class: Class::Unknown,
                    confidence,
                    explanation: "flaky keyword matched below confidence threshold".into(),
                };
            }
            return Classification {
                class: Class::FlakyTest,
                confidence,
                explanation: "matched flaky/timeout/race keyword".into(),
            };
        }
        Classification {
            class: Class::Unknown,
            confidence: 0.5,
            explanation: "no strong heuristic match".into(),
        }
    }
}

fn contains_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|kw| text.contains(kw))
}
