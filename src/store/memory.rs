use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::{test_name_key, AuditEntry, AuditResult, Store, StoreError};
use crate::domain::{FingerprintRecord, FingerprintState, Occurrence};

/// Lock-protected in-memory store for tests and small deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    fingerprints: HashMap<String, FingerprintRecord>,
    occurrences: HashMap<String, Vec<Occurrence>>,
    audit: Vec<AuditEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Snapshot of the audit log, oldest first.
    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.inner.lock().unwrap().audit.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn migrate(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn upsert_occurrence(&self, occ: &Occurrence) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let list = inner.occurrences.entry(occ.fingerprint.clone()).or_default();
        let key = (occ.run_id, occ.job_id, test_name_key(&occ.test_name));
        if let Some(existing) = list
            .iter_mut()
            .find(|o| (o.run_id, o.job_id, test_name_key(&o.test_name)) == key)
        {
            existing.occurred_at = occ.occurred_at;
            existing.excerpt = occ.excerpt.clone();
            return Ok(());
        }
        list.push(occ.clone());
        Ok(())
    }

    async fn upsert_fingerprint(&self, rec: &FingerprintRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.fingerprints.get_mut(&rec.fingerprint) {
            Some(prev) => {
                if rec.first_seen_at < prev.first_seen_at {
                    prev.first_seen_at = rec.first_seen_at;
                }
                if rec.last_seen_at > prev.last_seen_at {
                    prev.last_seen_at = rec.last_seen_at;
                }
                prev.last_issue_comment_id = prev.last_issue_comment_id.max(rec.last_issue_comment_id);
                prev.last_pr_comment_id = prev.last_pr_comment_id.max(rec.last_pr_comment_id);
                if !rec.fingerprint_version.is_empty() {
                    prev.fingerprint_version = rec.fingerprint_version.clone();
                }
                if !rec.repo.is_empty() {
                    prev.repo = rec.repo.clone();
                }
                if !rec.test_name.is_empty() {
                    prev.test_name = rec.test_name.clone();
                }
                if !rec.framework.is_empty() {
                    prev.framework = rec.framework.clone();
                }
                if !rec.class.is_empty() {
                    prev.class = rec.class.clone();
                    prev.confidence = rec.confidence;
                }
                if rec.issue_number != 0 {
                    prev.issue_number = rec.issue_number;
                }
                if rec.pr_number != 0 {
                    prev.pr_number = rec.pr_number;
                }
            }
            None => {
                inner.fingerprints.insert(rec.fingerprint.clone(), rec.clone());
            }
        }
        Ok(())
    }

    async fn get_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<FingerprintRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.fingerprints.get(fingerprint).cloned())
    }

    async fn list_recent_occurrences(
        &self,
        fingerprint: &str,
        limit: i64,
    ) -> Result<Vec<Occurrence>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut list = inner.occurrences.get(fingerprint).cloned().unwrap_or_default();
        list.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        if limit > 0 {
            list.truncate(limit as usize);
        }
        Ok(list)
    }

    async fn link_issue(&self, fingerprint: &str, issue_number: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let rec = inner
            .fingerprints
            .get_mut(fingerprint)
            .ok_or_else(|| StoreError::FingerprintNotFound(fingerprint.to_string()))?;
        rec.issue_number = issue_number;
        Ok(())
    }

    async fn update_fingerprint_state(
        &self,
        fingerprint: &str,
        next: FingerprintState,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let rec = inner
            .fingerprints
            .get_mut(fingerprint)
            .ok_or_else(|| StoreError::FingerprintNotFound(fingerprint.to_string()))?;
        if rec.state == next {
            return Ok(());
        }
        if !rec.state.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                from: rec.state,
                to: next,
            });
        }
        rec.state = next;
        rec.state_changed_at = Utc::now();
        Ok(())
    }

    async fn list_fingerprints_by_state(
        &self,
        state: FingerprintState,
        limit: i64,
    ) -> Result<Vec<FingerprintRecord>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<FingerprintRecord> = inner
            .fingerprints
            .values()
            .filter(|rec| rec.state == state)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        if limit > 0 {
            out.truncate(limit as usize);
        }
        Ok(out)
    }

    async fn record_audit(
        &self,
        action: &str,
        target: &str,
        result: AuditResult,
        message: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.audit.push(AuditEntry {
            created_at: Utc::now(),
            action: action.to_string(),
            target: target.to_string(),
            result: result.as_str().to_string(),
            error_message: message.to_string(),
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
