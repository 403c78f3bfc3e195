//! Review run and finding persistence using SQLite.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::Connection;
use std::path::Path;

use crate::types::canonical_severity;

/// A persisted review run row.
#[derive(Debug, Clone)]
pub struct ReviewRunRecord {
    pub id: String,
    pub pr_id: i64,
    pub llm_model: String,
    pub head_sha: String,
    pub status: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub published: bool,
    pub github_review_id: Option<i64>,
    pub error_message: Option<String>,
}

/// A persisted finding row.
#[derive(Debug, Clone)]
pub struct FindingRecord {
    pub review_run_id: String,
    pub file_path: String,
    pub line_number: Option<u32>,
    pub finding_type: String,
    /// Upper-case canonical severity
    pub severity: String,
    pub message: String,
    pub suggestion: String,
}

impl FindingRecord {
    /// Build a record, canonicalizing the severity for storage.
    pub fn new(
        review_run_id: &str,
        file_path: &str,
        line_number: Option<u32>,
        finding_type: &str,
        severity: &str,
        message: &str,
        suggestion: &str,
    ) -> Self {
        Self {
            review_run_id: review_run_id.to_string(),
            file_path: file_path.to_string(),
            line_number,
            finding_type: finding_type.to_string(),
            severity: canonical_severity(severity),
            message: message.to_string(),
            suggestion: suggestion.to_string(),
        }
    }
}

/// Run and finding storage using SQLite
pub struct ReviewStore {
    conn: Connection,
}

impl ReviewStore {
    /// Open or create a store at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory store for tests and dry runs
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS review_runs (
                id TEXT PRIMARY KEY,
                pr_id INTEGER NOT NULL,
                llm_model TEXT NOT NULL,
                head_sha TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                published INTEGER NOT NULL DEFAULT 0,
                github_review_id INTEGER,
                error_message TEXT
            );

            CREATE TABLE IF NOT EXISTS review_findings (
                id INTEGER PRIMARY KEY,
                review_run_id TEXT NOT NULL REFERENCES review_runs(id) ON DELETE CASCADE,
                file_path TEXT NOT NULL,
                line_number INTEGER,
                finding_type TEXT NOT NULL,
                severity TEXT NOT NULL,
                message TEXT NOT NULL,
                suggestion TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_findings_run ON review_findings(review_run_id);
            CREATE INDEX IF NOT EXISTS idx_runs_pr ON review_runs(pr_id);
        "#,
        )?;
        Ok(())
    }

    /// Insert a new run in `running` state.
    pub fn create_run(&self, id: &str, pr_id: i64, llm_model: &str, head_sha: &str) -> Result<()> {
        self.conn.execute(
            r#"INSERT INTO review_runs (id, pr_id, llm_model, head_sha, status, started_at)
               VALUES (?1, ?2, ?3, ?4, 'running', ?5)"#,
            (id, pr_id, llm_model, head_sha, Utc::now().to_rfc3339()),
        )?;
        Ok(())
    }

    /// Mark a run completed or failed.
    pub fn complete_run(&self, id: &str, status: &str, error_message: Option<&str>) -> Result<()> {
        self.conn.execute(
            r#"UPDATE review_runs
               SET status = ?2, completed_at = ?3, error_message = ?4
               WHERE id = ?1"#,
            (id, status, Utc::now().to_rfc3339(), error_message),
        )?;
        Ok(())
    }

    /// Record the publish outcome and findings in a single transaction.
    ///
    /// A failed publish persists `published = false` plus the error while
    /// the findings remain recoverable from the rows.
    pub fn record_publish(
        &mut self,
        run_id: &str,
        published: bool,
        github_review_id: Option<i64>,
        publish_error: Option<&str>,
        findings: &[FindingRecord],
    ) -> Result<()> {
        let tx = self.conn.transaction()?;

        tx.execute(
            r#"UPDATE review_runs
               SET published = ?2, github_review_id = ?3,
                   error_message = COALESCE(?4, error_message)
               WHERE id = ?1"#,
            (run_id, published, github_review_id, publish_error),
        )?;

        for finding in findings {
            tx.execute(
                r#"INSERT INTO review_findings
                   (review_run_id, file_path, line_number, finding_type, severity, message, suggestion)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
                (
                    &finding.review_run_id,
                    &finding.file_path,
                    finding.line_number,
                    &finding.finding_type,
                    &finding.severity,
                    &finding.message,
                    &finding.suggestion,
                ),
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Fetch one run by id.
    pub fn get_run(&self, id: &str) -> Result<Option<ReviewRunRecord>> {
        let mut stmt = self.conn.prepare(
            r#"SELECT id, pr_id, llm_model, head_sha, status, started_at,
                      completed_at, published, github_review_id, error_message
               FROM review_runs WHERE id = ?1"#,
        )?;
        let mut rows = stmt.query_map([id], row_to_run)?;
        Ok(rows.next().transpose()?)
    }

    /// Most recent runs, newest first.
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<ReviewRunRecord>> {
        let mut stmt = self.conn.prepare(
            r#"SELECT id, pr_id, llm_model, head_sha, status, started_at,
                      completed_at, published, github_review_id, error_message
               FROM review_runs ORDER BY started_at DESC LIMIT ?1"#,
        )?;
        let rows = stmt
            .query_map([limit as i64], row_to_run)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Findings persisted for one run.
    pub fn findings_for_run(&self, run_id: &str) -> Result<Vec<FindingRecord>> {
        let mut stmt = self.conn.prepare(
            r#"SELECT review_run_id, file_path, line_number, finding_type, severity, message, suggestion
               FROM review_findings WHERE review_run_id = ?1 ORDER BY id"#,
        )?;
        let rows = stmt
            .query_map([run_id], |row| {
                Ok(FindingRecord {
                    review_run_id: row.get(0)?,
                    file_path: row.get(1)?,
                    line_number: row.get(2)?,
                    finding_type: row.get(3)?,
                    severity: row.get(4)?,
                    message: row.get(5)?,
                    suggestion: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReviewRunRecord> {
    Ok(ReviewRunRecord {
        id: row.get(0)?,
        pr_id: row.get(1)?,
        llm_model: row.get(2)?,
        head_sha: row.get(3)?,
        status: row.get(4)?,
        started_at: row.get(5)?,
        completed_at: row.get(6)?,
        published: row.get(7)?,
        github_review_id: row.get(8)?,
        error_message: row.get(9)?,
    })
}
