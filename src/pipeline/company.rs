//! The per-company fetch and extract state machine.
//!
//! ```text
//! Start -> SelectNextSource -> Fetching -> Fetched -> RegexExtracting -> Done
//!               ^    |             ^   \                    |
//!               |    v             |    FetchFailed         v
//!               |  Failed          +----/   |   \      LlmExtracting -> Done
//!               |                           |    Abort        |
//!               +---------------------------+-----------------+
//! ```
//!
//! Sources are visited strictly in priority order and the walk stops at the
//! first source that yields a value. Exactly one evidence record is written when
//! a terminal stage is reached.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::retry::Backoff;
use super::PipelineContext;
use crate::error::{classify, Classification, ErrorKind, Failure};
use crate::models::{Company, Evidence, ExtractionCandidate, ExtractionMethod, FetchOutcome, SourceUrl};
use crate::scrapers::FETCH_RESOURCE;
use crate::sources::{CompanyJob, SourceSummary};

/// How a company's run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// A value was extracted.
    Done,
    /// Every source was tried without a result, or there were none.
    Failed { reason: String },
    /// The error budget ran out before the sources did.
    Aborted { reason: String },
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PipelineOutcome::Done)
    }

    pub fn label(&self) -> &'static str {
        match self {
            PipelineOutcome::Done => "done",
            PipelineOutcome::Failed { .. } => "failed",
            PipelineOutcome::Aborted { .. } => "aborted",
        }
    }
}

/// Terminal result for one company.
#[derive(Debug, Clone)]
pub struct CompanyReport {
    pub company: Company,
    pub outcome: PipelineOutcome,
    /// The record handed to the evidence sink.
    pub evidence: Evidence,
    /// Source URLs fetched at least once, in visiting order.
    pub visited: Vec<String>,
    /// Fetch calls made, retries included.
    pub fetch_attempts: u32,
    /// Errors recorded against the company's budget.
    pub errors: u32,
    /// Whether the evidence sink accepted the record.
    pub persisted: bool,
}

/// Retry schedules for the source currently being fetched.
struct SourceAttempt {
    source: SourceUrl,
    retries: Backoff,
    rate_limit_waits: Backoff,
}

enum Stage {
    Start,
    SelectNextSource,
    Fetching(SourceAttempt),
    FetchFailed(SourceAttempt, Failure),
    Fetched(SourceAttempt, FetchOutcome),
    RegexExtracting(SourceAttempt, FetchOutcome),
    LlmExtracting(SourceAttempt, FetchOutcome),
    Done {
        source: SourceUrl,
        page: FetchOutcome,
        candidate: ExtractionCandidate,
    },
    Failed {
        reason: String,
    },
    Abort {
        reason: String,
    },
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Stage::Start => "start",
            Stage::SelectNextSource => "select_next_source",
            Stage::Fetching(..) => "fetching",
            Stage::FetchFailed(..) => "fetch_failed",
            Stage::Fetched(..) => "fetched",
            Stage::RegexExtracting(..) => "regex_extracting",
            Stage::LlmExtracting(..) => "llm_extracting",
            Stage::Done { .. } => "done",
            Stage::Failed { .. } => "failed",
            Stage::Abort { .. } => "abort",
        }
    }
}

/// Walks one company's sources until a value is found or nothing is left.
pub struct CompanyPipeline {
    ctx: Arc<PipelineContext>,
    company: Company,
    key: String,
    sources: std::vec::IntoIter<SourceUrl>,
    source_count: usize,
    store_id: i64,
    visited: Vec<String>,
    fetch_attempts: u32,
    errors: u32,
    last_failure: Option<Failure>,
    /// Status of the most recent fetch attempt, whichever source it was.
    last_status: Option<u16>,
}

impl CompanyPipeline {
    pub fn new(ctx: Arc<PipelineContext>, job: CompanyJob) -> Self {
        let key = job.company.key();
        let store_id = job.company.id;
        Self {
            ctx,
            source_count: job.sources.len(),
            sources: job.sources.into_iter(),
            company: job.company,
            key,
            store_id,
            visited: Vec::new(),
            fetch_attempts: 0,
            errors: 0,
            last_failure: None,
            last_status: None,
        }
    }

    /// Drive the state machine to a terminal stage and record the evidence.
    pub async fn run(mut self) -> CompanyReport {
        let mut stage = Stage::Start;
        loop {
            debug!(company = %self.company.name, stage = stage.name(), "Pipeline stage");
            stage = match stage {
                Stage::Start => self.start().await,
                Stage::SelectNextSource => self.select_next_source(),
                Stage::Fetching(attempt) => self.fetch(attempt).await,
                Stage::FetchFailed(attempt, failure) => self.handle_fetch_failure(attempt, failure).await,
                Stage::Fetched(attempt, page) => {
                    debug!(
                        company = %self.company.name,
                        url = %page.url,
                        title = %page.title,
                        text_len = page.text.len(),
                        "Page fetched"
                    );
                    Stage::RegexExtracting(attempt, page)
                }
                Stage::RegexExtracting(attempt, page) => self.regex_extract(attempt, page),
                Stage::LlmExtracting(attempt, page) => self.llm_extract(attempt, page).await,
                terminal @ (Stage::Done { .. } | Stage::Failed { .. } | Stage::Abort { .. }) => {
                    return self.finish(terminal).await;
                }
            };
        }
    }

    async fn start(&mut self) -> Stage {
        match self.ctx.sink.upsert_company(&self.company.name).await {
            Ok(record) => self.store_id = record.id,
            Err(e) => error!(company = %self.company.name, error = %e, "Failed to register company"),
        }

        let summary = SourceSummary::of(self.sources.as_slice());
        info!(
            company = %self.company.name,
            total = summary.total,
            high = summary.high,
            medium = summary.medium,
            low = summary.low,
            source_types = ?summary.source_types,
            strategy = summary.strategy(),
            "Processing company"
        );
        Stage::SelectNextSource
    }

    fn select_next_source(&mut self) -> Stage {
        match self.sources.next() {
            Some(source) => {
                debug!(
                    company = %self.company.name,
                    url = %source.url,
                    priority = source.priority,
                    source_type = %source.source_type,
                    "Trying source"
                );
                Stage::Fetching(SourceAttempt {
                    source,
                    retries: self.ctx.config.fetch_backoff(),
                    rate_limit_waits: self.ctx.config.rate_limit_backoff(),
                })
            }
            None if self.source_count == 0 => Stage::Failed {
                reason: "no sources".to_string(),
            },
            None => {
                let mut reason = format!("no headcount found in {} source(s)", self.source_count);
                if let Some(last) = &self.last_failure {
                    reason.push_str(&format!("; last error: {}", last));
                }
                Stage::Failed { reason }
            }
        }
    }

    async fn fetch(&mut self, attempt: SourceAttempt) -> Stage {
        let url = attempt.source.url.clone();
        if self.visited.last() != Some(&url) {
            self.visited.push(url.clone());
        }

        self.ctx.limiter.admit(FETCH_RESOURCE).await;
        self.fetch_attempts += 1;

        let timeout = self.ctx.config.fetch_timeout;
        let outcome = match tokio::time::timeout(
            timeout + self.ctx.config.timeout_grace,
            self.ctx.fetcher.fetch(&url, timeout),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => FetchOutcome::failure(
                url.as_str(),
                Failure::tagged(
                    ErrorKind::Timeout,
                    format!("fetch timed out after {}ms", timeout.as_millis()),
                ),
            ),
        };

        self.last_status = outcome.status_code;
        if outcome.success {
            Stage::Fetched(attempt, outcome)
        } else {
            let failure = outcome.failure_or_default();
            Stage::FetchFailed(attempt, failure)
        }
    }

    /// Classify and count a failure. Returns the classification, or `None` when
    /// the company's error budget is spent.
    fn record_failure(&mut self, url: &str, stage: &str, failure: &Failure) -> Option<Classification> {
        let class = classify(failure);
        self.errors += 1;
        self.last_failure = Some(failure.clone());

        match class.kind {
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::RateLimit => warn!(
                company = %self.company.name,
                url,
                stage,
                kind = %class.kind,
                error = %failure,
                "Collaborator call failed"
            ),
            _ => error!(
                company = %self.company.name,
                url,
                stage,
                kind = %class.kind,
                error = %failure,
                "Collaborator call failed"
            ),
        }

        let decision = self.ctx.budget.record(&self.key, class.kind);
        if decision.should_abort {
            None
        } else {
            Some(class)
        }
    }

    fn abort_stage(&self) -> Stage {
        let last = self
            .last_failure
            .as_ref()
            .map(|f| f.to_string())
            .unwrap_or_default();
        Stage::Abort {
            reason: format!(
                "aborted after {} errors (limit {}); last error: {}",
                self.ctx.budget.company_total(&self.key),
                self.ctx.budget.threshold(),
                last
            ),
        }
    }

    async fn handle_fetch_failure(&mut self, mut attempt: SourceAttempt, failure: Failure) -> Stage {
        let url = attempt.source.url.clone();
        let Some(class) = self.record_failure(&url, "fetch", &failure) else {
            return self.abort_stage();
        };

        if !class.skip_to_next {
            // Rate limited: wait and retry this source without spending a retry
            return match attempt.rate_limit_waits.next() {
                Some(delay) => {
                    warn!(
                        company = %self.company.name,
                        url = %url,
                        wait_ms = delay.as_millis() as u64,
                        "Rate limited, waiting before retrying source"
                    );
                    tokio::time::sleep(delay).await;
                    Stage::Fetching(attempt)
                }
                None => {
                    warn!(company = %self.company.name, url = %url, "Still rate limited, moving to next source");
                    Stage::SelectNextSource
                }
            };
        }

        if class.retryable {
            if let Some(delay) = attempt.retries.next() {
                info!(
                    company = %self.company.name,
                    url = %url,
                    retry = attempt.retries.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "Retrying source"
                );
                tokio::time::sleep(delay).await;
                return Stage::Fetching(attempt);
            }
            debug!(company = %self.company.name, url = %url, "Retries exhausted for source");
        }
        Stage::SelectNextSource
    }

    fn regex_extract(&mut self, attempt: SourceAttempt, page: FetchOutcome) -> Stage {
        let candidate = self.ctx.regex.extract(&page.text);
        if candidate.is_found() {
            return Stage::Done {
                source: attempt.source,
                page,
                candidate,
            };
        }
        if self.ctx.llm.is_some() {
            Stage::LlmExtracting(attempt, page)
        } else {
            debug!(company = %self.company.name, url = %page.url, "No pattern match and LLM stage disabled");
            Stage::SelectNextSource
        }
    }

    async fn llm_extract(&mut self, attempt: SourceAttempt, page: FetchOutcome) -> Stage {
        let Some(llm) = self.ctx.llm.clone() else {
            return Stage::SelectNextSource;
        };
        let mut retries = self.ctx.config.llm_backoff();

        loop {
            match llm.extract(&page.text).await {
                Ok(candidate) if candidate.is_found() => {
                    return Stage::Done {
                        source: attempt.source,
                        page,
                        candidate,
                    };
                }
                Ok(_) => {
                    debug!(company = %self.company.name, url = %page.url, "LLM found no headcount");
                    return Stage::SelectNextSource;
                }
                Err(e) => {
                    let failure = e.to_failure();
                    let Some(class) = self.record_failure(&page.url, "llm", &failure) else {
                        return self.abort_stage();
                    };
                    match retries.next() {
                        Some(delay) if class.retryable => tokio::time::sleep(delay).await,
                        _ => return Stage::SelectNextSource,
                    }
                }
            }
        }
    }

    async fn finish(self, terminal: Stage) -> CompanyReport {
        let last_url = self.visited.last().cloned().unwrap_or_default();
        let last_status = self.last_status;

        let (outcome, evidence) = match terminal {
            Stage::Done {
                source,
                page,
                candidate,
            } => {
                let model = match candidate.method {
                    ExtractionMethod::Llm => candidate.source.clone(),
                    _ => "regex".to_string(),
                };
                let evidence = Evidence {
                    company_id: self.store_id,
                    source_url: source.url.clone(),
                    source_type: Some(source.source_type),
                    value: candidate.value,
                    raw_text: candidate.raw_text,
                    score: candidate.confidence,
                    model,
                    method: candidate.method,
                    extracted_at: Utc::now(),
                    page_title: Some(page.title).filter(|t| !t.is_empty()),
                    status_code: page.status_code,
                    error_summary: None,
                };
                (PipelineOutcome::Done, evidence)
            }
            Stage::Abort { reason } => (
                PipelineOutcome::Aborted {
                    reason: reason.clone(),
                },
                Evidence::failed(self.store_id, last_url, last_status, reason),
            ),
            Stage::Failed { reason } => (
                PipelineOutcome::Failed {
                    reason: reason.clone(),
                },
                Evidence::failed(self.store_id, last_url, last_status, reason),
            ),
            other => {
                let reason = format!("pipeline stopped in non-terminal stage {}", other.name());
                (
                    PipelineOutcome::Failed {
                        reason: reason.clone(),
                    },
                    Evidence::failed(self.store_id, last_url, last_status, reason),
                )
            }
        };

        let persisted = match self.ctx.sink.insert_evidence(&evidence).await {
            Ok(()) => true,
            Err(e) => {
                error!(company = %self.company.name, error = %e, "Failed to store evidence");
                false
            }
        };

        match &outcome {
            PipelineOutcome::Done => info!(
                company = %self.company.name,
                value = evidence.value,
                method = %evidence.method,
                url = %evidence.source_url,
                score = evidence.score,
                "Headcount found"
            ),
            PipelineOutcome::Failed { reason } => warn!(
                company = %self.company.name,
                reason = %reason,
                "No headcount found"
            ),
            PipelineOutcome::Aborted { reason } => error!(
                company = %self.company.name,
                reason = %reason,
                "Company aborted"
            ),
        }

        CompanyReport {
            company: self.company,
            outcome,
            evidence,
            visited: self.visited,
            fetch_attempts: self.fetch_attempts,
            errors: self.errors,
            persisted,
        }
    }
}
