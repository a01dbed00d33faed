//! Evidence persistence.

pub mod sqlite;

pub use sqlite::SqliteEvidenceStore;

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;

use crate::models::Evidence;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("failed to prepare store at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid stored value: {0}")]
    Corrupt(String),
}

/// A company as registered in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanyRecord {
    pub id: i64,
    pub name: String,
}

/// Destination for terminal pipeline outcomes.
#[async_trait]
pub trait EvidenceSink: Send + Sync {
    /// Register a company by name. Idempotent.
    async fn upsert_company(&self, name: &str) -> Result<CompanyRecord, StoreError>;

    async fn insert_evidence(&self, evidence: &Evidence) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    companies: HashMap<String, i64>,
    evidence: Vec<Evidence>,
}

/// In-process sink for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryEvidenceStore {
    state: Mutex<MemoryState>,
}

impl MemoryEvidenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every evidence record inserted so far, in insertion order.
    pub fn evidence(&self) -> Vec<Evidence> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.evidence.clone()
    }

    pub fn evidence_for_company(&self, company_id: i64) -> Vec<Evidence> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .evidence
            .iter()
            .filter(|e| e.company_id == company_id)
            .cloned()
            .collect()
    }

    pub fn company_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.companies.len()
    }
}

#[async_trait]
impl EvidenceSink for MemoryEvidenceStore {
    async fn upsert_company(&self, name: &str) -> Result<CompanyRecord, StoreError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let next_id = state.companies.len() as i64 + 1;
        let id = *state.companies.entry(name.to_string()).or_insert(next_id);
        Ok(CompanyRecord {
            id,
            name: name.to_string(),
        })
    }

    async fn insert_evidence(&self, evidence: &Evidence) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.evidence.push(evidence.clone());
        Ok(())
    }
}
