//! SQLite-backed evidence store.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{CompanyRecord, EvidenceSink, StoreError};
use crate::models::{Evidence, ExtractionMethod, SourceType};

/// Evidence store in a single SQLite file.
pub struct SqliteEvidenceStore {
    conn: Mutex<Connection>,
}

impl SqliteEvidenceStore {
    /// Open (or create) the database at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_tables()?;
        debug!(path = %db_path.display(), "Opened evidence database");
        Ok(store)
    }

    /// A throwaway database that lives as long as the store.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_tables()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_tables(&self) -> Result<(), StoreError> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS companies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT UNIQUE NOT NULL
            );

            CREATE TABLE IF NOT EXISTS evidence (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                company_id INTEGER NOT NULL,
                value INTEGER,
                raw_text TEXT,
                source_url TEXT,
                source_type TEXT,
                source_date TEXT,
                score REAL,
                model TEXT,
                method TEXT NOT NULL,
                extracted_at TEXT NOT NULL,
                page_title TEXT,
                status_code INTEGER,
                error_summary TEXT,
                FOREIGN KEY (company_id) REFERENCES companies(id)
            );

            CREATE INDEX IF NOT EXISTS idx_evidence_company_id ON evidence(company_id);
            CREATE INDEX IF NOT EXISTS idx_evidence_extracted_at ON evidence(extracted_at);
        "#,
        )?;
        Ok(())
    }

    /// Evidence recorded for a company, oldest first.
    pub fn evidence_for_company(&self, company_id: i64) -> Result<Vec<Evidence>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"SELECT company_id, source_url, source_type, value, raw_text, score, model,
                      method, extracted_at, page_title, status_code, error_summary
               FROM evidence WHERE company_id = ?1 ORDER BY id"#,
        )?;

        let rows = stmt.query_map(params![company_id], |row| {
            Ok(StoredEvidence {
                company_id: row.get(0)?,
                source_url: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                source_type: row.get(2)?,
                value: row.get(3)?,
                raw_text: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                score: row.get::<_, Option<f64>>(5)?.unwrap_or(0.0),
                model: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
                method: row.get(7)?,
                extracted_at: row.get(8)?,
                page_title: row.get(9)?,
                status_code: row.get(10)?,
                error_summary: row.get(11)?,
            })
        })?;

        let mut evidence = Vec::new();
        for row in rows {
            evidence.push(row?.into_evidence()?);
        }
        Ok(evidence)
    }

    /// Look up a company by name.
    pub fn find_company(&self, name: &str) -> Result<Option<CompanyRecord>, StoreError> {
        let record = self
            .conn()
            .query_row(
                "SELECT id, name FROM companies WHERE name = ?1",
                params![name],
                |row| {
                    Ok(CompanyRecord {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }
}

/// Raw column values before conversion back into domain types.
struct StoredEvidence {
    company_id: i64,
    source_url: String,
    source_type: Option<String>,
    value: Option<i64>,
    raw_text: String,
    score: f64,
    model: String,
    method: String,
    extracted_at: String,
    page_title: Option<String>,
    status_code: Option<i64>,
    error_summary: Option<String>,
}

impl StoredEvidence {
    fn into_evidence(self) -> Result<Evidence, StoreError> {
        let method = match self.method.as_str() {
            "regex" => ExtractionMethod::Regex,
            "llm" => ExtractionMethod::Llm,
            "failed" => ExtractionMethod::Failed,
            other => return Err(StoreError::Corrupt(format!("extraction method '{other}'"))),
        };
        let extracted_at = DateTime::parse_from_rfc3339(&self.extracted_at)
            .map_err(|e| StoreError::Corrupt(format!("timestamp '{}': {e}", self.extracted_at)))?
            .with_timezone(&Utc);
        let value = self
            .value
            .map(|v| u64::try_from(v).map_err(|_| StoreError::Corrupt(format!("headcount {v}"))))
            .transpose()?;

        Ok(Evidence {
            company_id: self.company_id,
            source_url: self.source_url,
            source_type: self.source_type.as_deref().and_then(SourceType::from_str),
            value,
            raw_text: self.raw_text,
            score: self.score,
            model: self.model,
            method,
            extracted_at,
            page_title: self.page_title,
            status_code: self.status_code.and_then(|s| u16::try_from(s).ok()),
            error_summary: self.error_summary,
        })
    }
}

#[async_trait]
impl EvidenceSink for SqliteEvidenceStore {
    async fn upsert_company(&self, name: &str) -> Result<CompanyRecord, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO companies (name) VALUES (?1)",
            params![name],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM companies WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(CompanyRecord {
            id,
            name: name.to_string(),
        })
    }

    async fn insert_evidence(&self, evidence: &Evidence) -> Result<(), StoreError> {
        let value = evidence
            .value
            .map(|v| i64::try_from(v).map_err(|_| StoreError::Corrupt(format!("headcount {v}"))))
            .transpose()?;

        self.conn().execute(
            r#"INSERT INTO evidence (company_id, value, raw_text, source_url, source_type,
                   source_date, score, model, method, extracted_at, page_title, status_code,
                   error_summary)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"#,
            params![
                evidence.company_id,
                value,
                evidence.raw_text,
                evidence.source_url,
                evidence.source_type.map(|t| t.as_str()),
                evidence.extracted_at.date_naive().to_string(),
                evidence.score,
                evidence.model,
                evidence.method.as_str(),
                evidence.extracted_at.to_rfc3339(),
                evidence.page_title,
                evidence.status_code.map(i64::from),
                evidence.error_summary,
            ],
        )?;
        Ok(())
    }
}
