//! Domain models shared across the extraction pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Failure;

/// Priority assigned to sources without a usable priority value.
pub const DEFAULT_PRIORITY: u32 = 99;

/// Lowest and highest plausible employee counts.
pub const MIN_HEADCOUNT: u64 = 1;
pub const MAX_HEADCOUNT: u64 = 10_000_000;

/// Check that a headcount falls inside the plausible range.
pub fn is_plausible_headcount(value: u64) -> bool {
    (MIN_HEADCOUNT..=MAX_HEADCOUNT).contains(&value)
}

/// A company to be processed. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub id: i64,
    pub name: String,
}

impl Company {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Key used for per-company error accounting.
    pub fn key(&self) -> String {
        format!("{}:{}", self.id, self.name)
    }
}

/// Kind of page a candidate URL points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Official,
    Ir,
    Pdf,
    Gov,
    Wiki,
    News,
    Agg,
    Web,
    Api,
    Manual,
    Other,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Official => "official",
            SourceType::Ir => "ir",
            SourceType::Pdf => "pdf",
            SourceType::Gov => "gov",
            SourceType::Wiki => "wiki",
            SourceType::News => "news",
            SourceType::Agg => "agg",
            SourceType::Web => "web",
            SourceType::Api => "api",
            SourceType::Manual => "manual",
            SourceType::Other => "other",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "official" => Some(SourceType::Official),
            "ir" => Some(SourceType::Ir),
            "pdf" => Some(SourceType::Pdf),
            "gov" => Some(SourceType::Gov),
            "wiki" => Some(SourceType::Wiki),
            "news" => Some(SourceType::News),
            "agg" => Some(SourceType::Agg),
            "web" => Some(SourceType::Web),
            "api" => Some(SourceType::Api),
            "manual" => Some(SourceType::Manual),
            "other" => Some(SourceType::Other),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A candidate page for one company.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceUrl {
    pub company_id: i64,
    pub url: String,
    pub source_type: SourceType,
    /// Lower numbers are tried first.
    pub priority: u32,
}

impl SourceUrl {
    /// Build a source, normalizing a missing or negative priority to [`DEFAULT_PRIORITY`].
    pub fn new(
        company_id: i64,
        url: impl Into<String>,
        source_type: SourceType,
        priority: Option<i64>,
    ) -> Self {
        Self {
            company_id,
            url: url.into(),
            source_type,
            priority: normalize_priority(priority),
        }
    }
}

/// Normalize a raw priority value.
pub fn normalize_priority(raw: Option<i64>) -> u32 {
    match raw {
        Some(p) if p >= 0 => u32::try_from(p).unwrap_or(DEFAULT_PRIORITY),
        _ => DEFAULT_PRIORITY,
    }
}

/// Result of a single fetch attempt. Never mutated once produced.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub url: String,
    pub success: bool,
    pub text: String,
    pub title: String,
    pub status_code: Option<u16>,
    pub error: Option<Failure>,
}

impl FetchOutcome {
    pub fn success(
        url: impl Into<String>,
        text: impl Into<String>,
        title: impl Into<String>,
        status_code: Option<u16>,
    ) -> Self {
        Self {
            url: url.into(),
            success: true,
            text: text.into(),
            title: title.into(),
            status_code,
            error: None,
        }
    }

    pub fn failure(url: impl Into<String>, error: Failure) -> Self {
        Self {
            url: url.into(),
            success: false,
            text: String::new(),
            title: String::new(),
            status_code: error.status,
            error: Some(error),
        }
    }

    /// The failure carried by this outcome, synthesizing one if a collaborator
    /// reported `success = false` without an error.
    pub fn failure_or_default(&self) -> Failure {
        match &self.error {
            Some(err) => err.clone(),
            None => {
                let failure = Failure::new("fetch reported failure without an error");
                match self.status_code {
                    Some(status) => failure.with_status(status),
                    None => failure,
                }
            }
        }
    }
}

/// How a value was extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMethod {
    Regex,
    Llm,
    Failed,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionMethod::Regex => "regex",
            ExtractionMethod::Llm => "llm",
            ExtractionMethod::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Best numeric candidate produced by an extractor.
///
/// `value` is `None` exactly when `method` is [`ExtractionMethod::Failed`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionCandidate {
    pub value: Option<u64>,
    /// Extraction certainty in `[0, 1]`, used for ranking only.
    pub confidence: f64,
    pub raw_text: String,
    pub method: ExtractionMethod,
    /// Pattern name for regex matches, model id for LLM answers.
    pub source: String,
}

impl ExtractionCandidate {
    pub fn found(
        value: u64,
        confidence: f64,
        raw_text: impl Into<String>,
        method: ExtractionMethod,
        source: impl Into<String>,
    ) -> Self {
        Self {
            value: Some(value),
            confidence: confidence.clamp(0.0, 1.0),
            raw_text: raw_text.into(),
            method,
            source: source.into(),
        }
    }

    /// The documented "not found" outcome.
    pub fn not_found(source: impl Into<String>) -> Self {
        Self {
            value: None,
            confidence: 0.0,
            raw_text: String::new(),
            method: ExtractionMethod::Failed,
            source: source.into(),
        }
    }

    pub fn is_found(&self) -> bool {
        self.value.is_some()
    }
}

/// Terminal output record for one company run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub company_id: i64,
    pub source_url: String,
    pub source_type: Option<SourceType>,
    pub value: Option<u64>,
    pub raw_text: String,
    pub score: f64,
    /// `regex`, the LLM model id, or `none` for failures.
    pub model: String,
    pub method: ExtractionMethod,
    pub extracted_at: DateTime<Utc>,
    pub page_title: Option<String>,
    pub status_code: Option<u16>,
    pub error_summary: Option<String>,
}

impl Evidence {
    /// Evidence for a company whose pipeline did not produce a value.
    pub fn failed(
        company_id: i64,
        source_url: impl Into<String>,
        status_code: Option<u16>,
        error_summary: impl Into<String>,
    ) -> Self {
        Self {
            company_id,
            source_url: source_url.into(),
            source_type: None,
            value: None,
            raw_text: String::new(),
            score: 0.0,
            model: "none".to_string(),
            method: ExtractionMethod::Failed,
            extracted_at: Utc::now(),
            page_title: None,
            status_code,
            error_summary: Some(error_summary.into()),
        }
    }
}
