//! Bounded-concurrency runner over many company pipelines.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info};

use super::company::{CompanyPipeline, CompanyReport, PipelineOutcome};
use super::PipelineContext;
use crate::models::{Company, Evidence};
use crate::sources::CompanyJob;

/// Progress notifications emitted during [`Orchestrator::run_all`].
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Started {
        total: usize,
    },
    CompanyStarted {
        index: usize,
        name: String,
    },
    CompanyFinished {
        index: usize,
        name: String,
        outcome: PipelineOutcome,
        value: Option<u64>,
    },
    Complete {
        total: usize,
        succeeded: usize,
        failed: usize,
        aborted: usize,
    },
}

/// Runs company pipelines with at most `max_concurrent` in flight.
pub struct Orchestrator {
    ctx: Arc<PipelineContext>,
    events: Option<UnboundedSender<RunEvent>>,
}

impl Orchestrator {
    pub fn new(ctx: PipelineContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            events: None,
        }
    }

    /// Send progress events to `tx`. A closed receiver is ignored.
    pub fn with_events(mut self, tx: UnboundedSender<RunEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    fn emit(events: &Option<UnboundedSender<RunEvent>>, event: RunEvent) {
        if let Some(tx) = events {
            let _ = tx.send(event);
        }
    }

    /// Process every job and return one report per job, in input order.
    ///
    /// Each pipeline runs as its own task, so a panic in one company becomes a
    /// failed report for that company only.
    pub async fn run_all(&self, jobs: Vec<CompanyJob>, max_concurrent: usize) -> Vec<CompanyReport> {
        let total = jobs.len();
        let max_concurrent = max_concurrent.max(1);
        info!(companies = total, max_concurrent, "Starting extraction run");
        Self::emit(&self.events, RunEvent::Started { total });

        let finished: Vec<(usize, CompanyReport)> = stream::iter(jobs.into_iter().enumerate())
            .map(|(index, job)| {
                let ctx = self.ctx.clone();
                let events = self.events.clone();
                async move {
                    let company = job.company.clone();
                    Self::emit(
                        &events,
                        RunEvent::CompanyStarted {
                            index,
                            name: company.name.clone(),
                        },
                    );

                    let report = match tokio::spawn(CompanyPipeline::new(ctx.clone(), job).run()).await {
                        Ok(report) => report,
                        Err(e) => {
                            error!(company = %company.name, error = %e, "Company pipeline task failed");
                            crashed_report(&ctx, company, format!("pipeline task failed: {e}")).await
                        }
                    };

                    Self::emit(
                        &events,
                        RunEvent::CompanyFinished {
                            index,
                            name: report.company.name.clone(),
                            outcome: report.outcome.clone(),
                            value: report.evidence.value,
                        },
                    );
                    (index, report)
                }
            })
            .buffer_unordered(max_concurrent)
            .collect()
            .await;

        let mut slots: Vec<Option<CompanyReport>> = (0..total).map(|_| None).collect();
        for (index, report) in finished {
            slots[index] = Some(report);
        }
        let reports: Vec<CompanyReport> = slots.into_iter().flatten().collect();

        let succeeded = reports.iter().filter(|r| r.outcome.is_success()).count();
        let aborted = reports
            .iter()
            .filter(|r| matches!(r.outcome, PipelineOutcome::Aborted { .. }))
            .count();
        let failed = reports.len() - succeeded - aborted;
        info!(total, succeeded, failed, aborted, "Extraction run complete");
        Self::emit(
            &self.events,
            RunEvent::Complete {
                total,
                succeeded,
                failed,
                aborted,
            },
        );

        reports
    }
}

/// Report and evidence for a company whose pipeline task died.
async fn crashed_report(ctx: &PipelineContext, company: Company, reason: String) -> CompanyReport {
    let company_id = match ctx.sink.upsert_company(&company.name).await {
        Ok(record) => record.id,
        Err(e) => {
            error!(company = %company.name, error = %e, "Failed to register company");
            company.id
        }
    };
    let evidence = Evidence::failed(company_id, "", None, reason.clone());
    let persisted = match ctx.sink.insert_evidence(&evidence).await {
        Ok(()) => true,
        Err(e) => {
            error!(company = %company.name, error = %e, "Failed to store evidence");
            false
        }
    };
    CompanyReport {
        company,
        outcome: PipelineOutcome::Failed { reason },
        evidence,
        visited: Vec::new(),
        fetch_attempts: 0,
        errors: 0,
        persisted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FetchOutcome, SourceType, SourceUrl};
    use crate::pipeline::PipelineConfig;
    use crate::repository::MemoryEvidenceStore;
    use crate::scrapers::{PageFetcher, RateLimiter};
    use async_trait::async_trait;
    use std::time::Duration;

    struct PanicsOnBoom;

    #[async_trait]
    impl PageFetcher for PanicsOnBoom {
        async fn fetch(&self, url: &str, _timeout: Duration) -> FetchOutcome {
            if url.contains("boom") {
                panic!("fetcher exploded");
            }
            FetchOutcome::success(url, "Employees: 42", "", Some(200))
        }
    }

    fn job(id: i64, url: &str) -> CompanyJob {
        CompanyJob {
            company: Company::new(id, format!("Company {id}")),
            sources: vec![SourceUrl::new(id, url, SourceType::Web, Some(1))],
        }
    }

    #[tokio::test]
    async fn test_panicking_pipeline_does_not_affect_siblings() {
        let sink = Arc::new(MemoryEvidenceStore::new());
        let ctx = PipelineContext::new(PipelineConfig::default(), Arc::new(PanicsOnBoom), sink.clone())
            .with_limiter(RateLimiter::new());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let orchestrator = Orchestrator::new(ctx).with_events(tx);

        let reports = orchestrator
            .run_all(
                vec![
                    job(1, "https://ok.example/1"),
                    job(2, "https://boom.example"),
                    job(3, "https://ok.example/3"),
                ],
                2,
            )
            .await;

        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].evidence.value, Some(42));
        assert!(matches!(reports[1].outcome, PipelineOutcome::Failed { .. }));
        assert_eq!(reports[1].company.id, 2);
        assert_eq!(reports[2].evidence.value, Some(42));
        assert_eq!(sink.evidence().len(), 3);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.first(), Some(&RunEvent::Started { total: 3 }));
        assert_eq!(
            events.last(),
            Some(&RunEvent::Complete {
                total: 3,
                succeeded: 2,
                failed: 1,
                aborted: 0
            })
        );
    }

    #[tokio::test]
    async fn test_crashed_company_evidence_uses_registered_id() {
        let sink = Arc::new(MemoryEvidenceStore::new());
        let ctx = PipelineContext::new(PipelineConfig::default(), Arc::new(PanicsOnBoom), sink.clone())
            .with_limiter(RateLimiter::new());

        let reports = Orchestrator::new(ctx)
            .run_all(vec![job(42, "https://boom.example")], 1)
            .await;

        assert!(matches!(reports[0].outcome, PipelineOutcome::Failed { .. }));
        assert_eq!(reports[0].company.id, 42);
        // Registered by the pipeline before it panicked
        assert_eq!(sink.company_count(), 1);
        assert_eq!(reports[0].evidence.company_id, 1);
        assert_eq!(sink.evidence_for_company(1).len(), 1);
        assert!(sink.evidence_for_company(42).is_empty());
    }
}
