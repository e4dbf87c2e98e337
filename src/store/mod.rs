mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{FingerprintRecord, FingerprintState, Occurrence};

/// Occurrence identity truncates the test name, matching the persistent
/// primary key.
pub const TEST_NAME_KEY_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition {
        from: FingerprintState,
        to: FingerprintState,
    },
    #[error("fingerprint {0} not found")]
    FingerprintNotFound(String),
    #[error("corrupt fingerprint state {0:?}")]
    CorruptState(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditResult {
    Success,
    Error,
}

impl AuditResult {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditResult::Success => "success",
            AuditResult::Error => "error",
        }
    }
}

impl std::fmt::Display for AuditResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only record of an externally visible action and its outcome.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub created_at: DateTime<Utc>,
    pub action: String,
    pub target: String,
    pub result: String,
    pub error_message: String,
}

/// Durable, per-fingerprint serially consistent repository. Both
/// implementations validate lifecycle edges through
/// [`FingerprintState::can_transition_to`]; self-transitions are accepted
/// silently with no timestamp update.
#[async_trait]
pub trait Store: Send + Sync {
    async fn migrate(&self) -> Result<(), StoreError>;

    /// Inserts an occurrence; on identity conflict only `occurred_at` and
    /// `excerpt` are rewritten.
    async fn upsert_occurrence(&self, occ: &Occurrence) -> Result<(), StoreError>;

    /// Inserts or refreshes a fingerprint record. On conflict the seen-at
    /// window only widens, comment high-water marks only rise, descriptive
    /// fields refresh when the incoming value is non-empty/non-zero, and
    /// the lifecycle state is left untouched.
    async fn upsert_fingerprint(&self, rec: &FingerprintRecord) -> Result<(), StoreError>;

    async fn get_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<FingerprintRecord>, StoreError>;

    async fn list_recent_occurrences(
        &self,
        fingerprint: &str,
        limit: i64,
    ) -> Result<Vec<Occurrence>, StoreError>;

    async fn link_issue(&self, fingerprint: &str, issue_number: i64) -> Result<(), StoreError>;

    async fn update_fingerprint_state(
        &self,
        fingerprint: &str,
        next: FingerprintState,
    ) -> Result<(), StoreError>;

    async fn list_fingerprints_by_state(
        &self,
        state: FingerprintState,
        limit: i64,
    ) -> Result<Vec<FingerprintRecord>, StoreError>;

    async fn record_audit(
        &self,
        action: &str,
        target: &str,
        result: AuditResult,
        message: &str,
    ) -> Result<(), StoreError>;

    async fn close(&self) -> Result<(), StoreError>;
}

pub(crate) fn test_name_key(test_name: &str) -> String {
    test_name.chars().take(TEST_NAME_KEY_LEN).collect()
}
