use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

use super::{AuditResult, Store, StoreError};
use crate::domain::{FingerprintRecord, FingerprintState, Occurrence};

/// Relational store. Schema changes are applied as additive, idempotent
/// statements so an existing deployment upgrades in place.
const MIGRATIONS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS occurrences (
        fingerprint VARCHAR(64) NOT NULL,
        repo VARCHAR(200) NOT NULL,
        workflow VARCHAR(200) NOT NULL,
        run_id BIGINT NOT NULL,
        run_url TEXT NOT NULL,
        head_sha VARCHAR(64) NOT NULL,
        job_id BIGINT NOT NULL,
        job_name VARCHAR(200) NOT NULL,
        runner_os VARCHAR(100) NOT NULL,
        occurred_at TIMESTAMPTZ NOT NULL,
        framework VARCHAR(50) NOT NULL,
        test_name VARCHAR(300) NOT NULL,
        error_signature TEXT NOT NULL,
        excerpt TEXT NOT NULL
    )"#,
    r#"CREATE UNIQUE INDEX IF NOT EXISTS occurrences_identity
        ON occurrences (fingerprint, run_id, job_id, (left(test_name, 128)))"#,
    r#"CREATE TABLE IF NOT EXISTS fingerprints (
        fingerprint VARCHAR(64) NOT NULL PRIMARY KEY,
        repo VARCHAR(200) NOT NULL,
        test_name VARCHAR(300) NOT NULL,
        framework VARCHAR(50) NOT NULL,
        class VARCHAR(50) NOT NULL,
        confidence DOUBLE PRECISION NOT NULL,
        issue_number BIGINT NOT NULL DEFAULT 0,
        pr_number BIGINT NOT NULL DEFAULT 0,
        first_seen_at TIMESTAMPTZ NOT NULL,
        last_seen_at TIMESTAMPTZ NOT NULL
    )"#,
    r#"ALTER TABLE fingerprints
        ADD COLUMN IF NOT EXISTS fingerprint_version VARCHAR(20) NOT NULL DEFAULT ''"#,
    r#"ALTER TABLE fingerprints
        ADD COLUMN IF NOT EXISTS last_issue_comment_id BIGINT NOT NULL DEFAULT 0"#,
    r#"ALTER TABLE fingerprints
        ADD COLUMN IF NOT EXISTS last_pr_comment_id BIGINT NOT NULL DEFAULT 0"#,
    r#"ALTER TABLE fingerprints
        ADD COLUMN IF NOT EXISTS state VARCHAR(30) NOT NULL DEFAULT ''"#,
    r#"ALTER TABLE fingerprints
        ADD COLUMN IF NOT EXISTS state_changed_at TIMESTAMPTZ NOT NULL DEFAULT to_timestamp(0)"#,
    r#"CREATE TABLE IF NOT EXISTS audit_log (
        id BIGSERIAL PRIMARY KEY,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        action VARCHAR(100) NOT NULL,
        target VARCHAR(200) NOT NULL,
        result VARCHAR(50) NOT NULL,
        error_message TEXT
    )"#,
];

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        info!("connecting to state store");
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(PostgresStore { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        PostgresStore { pool }
    }

    fn row_to_fingerprint(row: &PgRow) -> Result<FingerprintRecord, StoreError> {
        let raw_state: String = row.try_get("state")?;
        let state = FingerprintState::parse(&raw_state)
            .ok_or_else(|| StoreError::CorruptState(raw_state.clone()))?;
        Ok(FingerprintRecord {
            fingerprint: row.try_get("fingerprint")?,
            fingerprint_version: row.try_get("fingerprint_version")?,
            repo: row.try_get("repo")?,
            test_name: row.try_get("test_name")?,
            framework: row.try_get("framework")?,
            class: row.try_get("class")?,
            confidence: row.try_get("confidence")?,
            issue_number: row.try_get("issue_number")?,
            pr_number: row.try_get("pr_number")?,
            last_issue_comment_id: row.try_get("last_issue_comment_id")?,
            last_pr_comment_id: row.try_get("last_pr_comment_id")?,
            state,
            state_changed_at: row.try_get("state_changed_at")?,
            first_seen_at: row.try_get("first_seen_at")?,
            last_seen_at: row.try_get("last_seen_at")?,
        })
    }

    fn row_to_occurrence(row: &PgRow) -> Result<Occurrence, StoreError> {
        Ok(Occurrence {
            fingerprint: row.try_get("fingerprint")?,
            repo: row.try_get("repo")?,
            workflow: row.try_get("workflow")?,
            run_id: row.try_get("run_id")?,
            run_url: row.try_get("run_url")?,
            head_sha: row.try_get("head_sha")?,
            job_id: row.try_get("job_id")?,
            job_name: row.try_get("job_name")?,
            runner_os: row.try_get("runner_os")?,
            occurred_at: row.try_get("occurred_at")?,
            framework: row.try_get("framework")?,
            test_name: row.try_get("test_name")?,
            error_signature: row.try_get("error_signature")?,
            excerpt: row.try_get("excerpt")?,
        })
    }
}

const FINGERPRINT_COLUMNS: &str = "fingerprint, fingerprint_version, repo, test_name, framework, \
     class, confidence, issue_number, pr_number, last_issue_comment_id, last_pr_comment_id, \
     state, state_changed_at, first_seen_at, last_seen_at";

#[async_trait]
impl Store for PostgresStore {
    async fn migrate(&self) -> Result<(), StoreError> {
        for stmt in MIGRATIONS {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn upsert_occurrence(&self, occ: &Occurrence) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO occurrences (
                fingerprint, repo, workflow, run_id, run_url, head_sha, job_id, job_name,
                runner_os, occurred_at, framework, test_name, error_signature, excerpt
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (fingerprint, run_id, job_id, (left(test_name, 128))) DO UPDATE SET
                occurred_at = EXCLUDED.occurred_at,
                excerpt = EXCLUDED.excerpt"#,
        )
        .bind(&occ.fingerprint)
        .bind(&occ.repo)
        .bind(&occ.workflow)
        .bind(occ.run_id)
        .bind(&occ.run_url)
        .bind(&occ.head_sha)
        .bind(occ.job_id)
        .bind(&occ.job_name)
        .bind(&occ.runner_os)
        .bind(occ.occurred_at)
        .bind(&occ.framework)
        .bind(&occ.test_name)
        .bind(&occ.error_signature)
        .bind(&occ.excerpt)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_fingerprint(&self, rec: &FingerprintRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO fingerprints (
                fingerprint, fingerprint_version, repo, test_name, framework, class, confidence,
                issue_number, pr_number, last_issue_comment_id, last_pr_comment_id,
                state, state_changed_at, first_seen_at, last_seen_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (fingerprint) DO UPDATE SET
                fingerprint_version = CASE WHEN EXCLUDED.fingerprint_version <> ''
                    THEN EXCLUDED.fingerprint_version ELSE fingerprints.fingerprint_version END,
                repo = CASE WHEN EXCLUDED.repo <> '' THEN EXCLUDED.repo ELSE fingerprints.repo END,
                test_name = CASE WHEN EXCLUDED.test_name <> ''
                    THEN EXCLUDED.test_name ELSE fingerprints.test_name END,
                framework = CASE WHEN EXCLUDED.framework <> ''
                    THEN EXCLUDED.framework ELSE fingerprints.framework END,
                class = CASE WHEN EXCLUDED.class <> '' THEN EXCLUDED.class ELSE fingerprints.class END,
                confidence = CASE WHEN EXCLUDED.class <> ''
                    THEN EXCLUDED.confidence ELSE fingerprints.confidence END,
                issue_number = CASE WHEN EXCLUDED.issue_number <> 0
                    THEN EXCLUDED.issue_number ELSE fingerprints.issue_number END,
                pr_number = CASE WHEN EXCLUDED.pr_number <> 0
                    THEN EXCLUDED.pr_number ELSE fingerprints.pr_number END,
                last_issue_comment_id = GREATEST(fingerprints.last_issue_comment_id, EXCLUDED.last_issue_comment_id),
                last_pr_comment_id = GREATEST(fingerprints.last_pr_comment_id, EXCLUDED.last_pr_comment_id),
                first_seen_at = LEAST(fingerprints.first_seen_at, EXCLUDED.first_seen_at),
                last_seen_at = GREATEST(fingerprints.last_seen_at, EXCLUDED.last_seen_at)"#,
        )
        .bind(&rec.fingerprint)
        .bind(&rec.fingerprint_version)
        .bind(&rec.repo)
        .bind(&rec.test_name)
        .bind(&rec.framework)
        .bind(&rec.class)
        .bind(rec.confidence)
        .bind(rec.issue_number)
        .bind(rec.pr_number)
        .bind(rec.last_issue_comment_id)
        .bind(rec.last_pr_comment_id)
        .bind(rec.state.as_str())
        .bind(rec.state_changed_at)
        .bind(rec.first_seen_at)
        .bind(rec.last_seen_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<FingerprintRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {FINGERPRINT_COLUMNS} FROM fingerprints WHERE fingerprint = $1"
        ))
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_fingerprint).transpose()
    }

    async fn list_recent_occurrences(
        &self,
        fingerprint: &str,
        limit: i64,
    ) -> Result<Vec<Occurrence>, StoreError> {
        let limit = if limit <= 0 { 5 } else { limit };
        let rows = sqlx::query(
            r#"SELECT fingerprint, repo, workflow, run_id, run_url, head_sha, job_id, job_name,
                runner_os, occurred_at, framework, test_name, error_signature, excerpt
            FROM occurrences WHERE fingerprint = $1
            ORDER BY occurred_at DESC LIMIT $2"#,
        )
        .bind(fingerprint)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_occurrence).collect()
    }

    async fn link_issue(&self, fingerprint: &str, issue_number: i64) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE fingerprints SET issue_number = $1 WHERE fingerprint = $2")
            .bind(issue_number)
            .bind(fingerprint)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::FingerprintNotFound(fingerprint.to_string()));
        }
        Ok(())
    }

    async fn update_fingerprint_state(
        &self,
        fingerprint: &str,
        next: FingerprintState,
    ) -> Result<(), StoreError> {
        let row = sqlx::query("SELECT state FROM fingerprints WHERE fingerprint = $1")
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::FingerprintNotFound(fingerprint.to_string()))?;
        let raw_state: String = row.try_get("state")?;
        let current = FingerprintState::parse(&raw_state)
            .ok_or_else(|| StoreError::CorruptState(raw_state.clone()))?;
        if current == next {
            return Ok(());
        }
        if !current.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                from: current,
                to: next,
            });
        }
        let result = sqlx::query(
            "UPDATE fingerprints SET state = $1, state_changed_at = now() \
             WHERE fingerprint = $2 AND state = $3",
        )
        .bind(next.as_str())
        .bind(fingerprint)
        .bind(&raw_state)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            // Lost a race against a concurrent transition.
            return Err(StoreError::InvalidTransition {
                from: current,
                to: next,
            });
        }
        Ok(())
    }

    async fn list_fingerprints_by_state(
        &self,
        state: FingerprintState,
        limit: i64,
    ) -> Result<Vec<FingerprintRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {FINGERPRINT_COLUMNS} FROM fingerprints \
             WHERE state = $1 OR (state = '' AND $1 = 'DISCOVERED') \
             ORDER BY last_seen_at DESC LIMIT $2"
        ))
        .bind(state.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_fingerprint).collect()
    }

    async fn record_audit(
        &self,
        action: &str,
        target: &str,
        result: AuditResult,
        message: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO audit_log (action, target, result, error_message) VALUES ($1, $2, $3, $4)",
        )
        .bind(action)
        .bind(target)
        .bind(result.as_str())
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.pool.close().await;
        Ok(())
    }
}
