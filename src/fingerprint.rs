use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

/// Version tag stored alongside every fingerprint so the hashing scheme can
/// evolve without orphaning old records.
pub const VERSION_V1: &str = "v1";

#[derive(Debug, Clone, Copy)]
pub struct V1Input<'a> {
    pub repo: &'a str,
    pub framework: &'a str,
    pub test_name: &'a str,
    pub error_sig_norm: &'a str,
    pub platform: &'a str,
}

/// Stable 256-bit identity for a class of failures. The field order in the
/// hashed preimage is load-bearing: changing it re-fingerprints every stored
/// failure.
pub fn v1(input: V1Input<'_>) -> String {
    let preimage = format!(
        "{}|{}|{}|{}|{}",
        input.repo, input.test_name, input.error_sig_norm, input.framework, input.platform
    );
    hex::encode(Sha256::digest(preimage.as_bytes()))
}

static RE_HEX_LITERAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"0x[0-9a-fA-F]+").unwrap());
static RE_LINE_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r":\d+").unwrap());
static RE_DURATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d+(?:\.\d+)?(ms|s|m|h)\b").unwrap());
static RE_LONG_INT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{4,}\b").unwrap());
static RE_HEX_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[0-9a-f]{7,40}\b").unwrap());
static RE_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Replaces volatile details (addresses, line numbers, durations, ids,
/// commit hashes) with a placeholder so noisy variants of the same failure
/// hash to the same fingerprint. Idempotent.
pub fn normalize_error_signature(s: &str) -> String {
    if s.is_empty() {
        return String::new();
    }
    let mut out = s.replace('\r', "");
    out = out.trim().to_string();
    for re in [
        &*RE_HEX_LITERAL,
        &*RE_LINE_SUFFIX,
        &*RE_DURATION,
        &*RE_LONG_INT,
        &*RE_HEX_RUN,
    ] {
        out = re.replace_all(&out, "X").into_owned();
    }
    out = RE_SPACE.replace_all(&out, " ").into_owned();
    out.trim().to_string()
}
