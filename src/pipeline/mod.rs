//! Per-company extraction pipeline and the orchestrator that runs many of them.

pub mod budget;
pub mod company;
pub mod orchestrator;
pub mod retry;

pub use budget::{BudgetDecision, ErrorBudget, ErrorStatistics, DEFAULT_ABORT_THRESHOLD};
pub use company::{CompanyPipeline, CompanyReport, PipelineOutcome};
pub use orchestrator::{Orchestrator, RunEvent};
pub use retry::Backoff;

use std::sync::Arc;
use std::time::Duration;

use crate::extract::RegexExtractor;
use crate::llm::LlmExtractor;
use crate::repository::EvidenceSink;
use crate::scrapers::{PageFetcher, RateLimitConfig, RateLimiter, FETCH_RESOURCE, LLM_RESOURCE};

/// Retry, backoff and timeout settings for one company's walk.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Retries of one source after the first failed fetch.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub max_backoff: Duration,
    /// Waits on one source caused by rate limiting before moving on.
    pub rate_limit_retries: u32,
    pub rate_limit_base_delay: Duration,
    pub fetch_timeout: Duration,
    pub llm_timeout: Duration,
    /// Retries of one LLM call after the first failure.
    pub llm_retries: u32,
    /// Extra time allowed past a collaborator timeout before the call is abandoned.
    pub timeout_grace: Duration,
    pub error_abort_threshold: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(1000),
            max_backoff: Duration::from_secs(60),
            rate_limit_retries: 3,
            rate_limit_base_delay: Duration::from_millis(5000),
            fetch_timeout: Duration::from_millis(30_000),
            llm_timeout: Duration::from_millis(60_000),
            llm_retries: 2,
            timeout_grace: Duration::from_secs(1),
            error_abort_threshold: DEFAULT_ABORT_THRESHOLD,
        }
    }
}

impl PipelineConfig {
    pub fn fetch_backoff(&self) -> Backoff {
        Backoff::new(self.retry_base_delay, self.max_retries).with_max_delay(self.max_backoff)
    }

    pub fn rate_limit_backoff(&self) -> Backoff {
        Backoff::new(self.rate_limit_base_delay, self.rate_limit_retries)
            .with_max_delay(self.max_backoff)
    }

    pub fn llm_backoff(&self) -> Backoff {
        Backoff::new(self.retry_base_delay, self.llm_retries).with_max_delay(self.max_backoff)
    }
}

/// Everything a pipeline needs, shared by all pipelines in a run.
///
/// The limiter windows and error counters inside are the only state shared
/// between concurrently running companies.
#[derive(Clone)]
pub struct PipelineContext {
    pub config: PipelineConfig,
    pub limiter: RateLimiter,
    pub budget: Arc<ErrorBudget>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub regex: RegexExtractor,
    pub llm: Option<LlmExtractor>,
    pub sink: Arc<dyn EvidenceSink>,
}

impl PipelineContext {
    /// A context with default fetch and LLM rate limits and no LLM stage.
    pub fn new(
        config: PipelineConfig,
        fetcher: Arc<dyn PageFetcher>,
        sink: Arc<dyn EvidenceSink>,
    ) -> Self {
        let limiter = RateLimiter::new()
            .with_limit(FETCH_RESOURCE, RateLimitConfig::fetch_default())
            .with_limit(LLM_RESOURCE, RateLimitConfig::llm_default());
        let budget = Arc::new(ErrorBudget::new(config.error_abort_threshold));
        Self {
            config,
            limiter,
            budget,
            fetcher,
            regex: RegexExtractor::default(),
            llm: None,
            sink,
        }
    }

    pub fn with_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_regex(mut self, regex: RegexExtractor) -> Self {
        self.regex = regex;
        self
    }

    /// Enable the LLM stage. The extractor should share this context's limiter.
    pub fn with_llm(mut self, llm: LlmExtractor) -> Self {
        self.llm = Some(llm);
        self
    }
}
