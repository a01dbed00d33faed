mod common;

use std::sync::Arc;

use common::{job, network_error, rate_limited, server_error, FakeCompleter, FakeFetcher};
use headcount::llm::{LlmError, LlmExtractor};
use headcount::models::{ExtractionMethod, FetchOutcome};
use headcount::pipeline::{CompanyPipeline, CompanyReport, PipelineConfig, PipelineContext, PipelineOutcome};
use headcount::repository::MemoryEvidenceStore;
use headcount::scrapers::RateLimiter;
use headcount::sources::CompanyJob;

const A: &str = "https://acme.example/about";
const B: &str = "https://acme.example/company";
const C: &str = "https://acme.example/ir";

fn context(fetcher: Arc<FakeFetcher>, sink: Arc<MemoryEvidenceStore>) -> PipelineContext {
    PipelineContext::new(PipelineConfig::default(), fetcher, sink).with_limiter(RateLimiter::new())
}

async fn run(ctx: PipelineContext, job: CompanyJob) -> CompanyReport {
    CompanyPipeline::new(Arc::new(ctx), job).run().await
}

#[tokio::test(start_paused = true)]
async fn test_network_errors_exhaust_retries_then_next_source_succeeds() {
    let fetcher = FakeFetcher::new();
    fetcher.script(A, vec![network_error(A)]);
    fetcher.page(B, "Company profile\nEmployees: 1,200\nFounded 1990");
    let sink = Arc::new(MemoryEvidenceStore::new());

    let report = run(context(fetcher.clone(), sink.clone()), job(1, "Acme", &[A, B, C])).await;

    assert_eq!(report.outcome, PipelineOutcome::Done);
    assert_eq!(fetcher.calls_to(A), 4);
    assert_eq!(fetcher.calls_to(B), 1);
    assert_eq!(fetcher.calls_to(C), 0);
    assert_eq!(report.visited, vec![A.to_string(), B.to_string()]);
    assert_eq!(report.errors, 4);

    let evidence = &report.evidence;
    assert_eq!(evidence.source_url, B);
    assert_eq!(evidence.value, Some(1200));
    assert_eq!(evidence.method, ExtractionMethod::Regex);
    assert_eq!(evidence.model, "regex");
    assert!(evidence.raw_text.contains("Employees: 1,200"));
    assert_eq!(sink.evidence().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_fifth_error_aborts_company() {
    let fetcher = FakeFetcher::new();
    fetcher.script(A, vec![network_error(A)]);
    fetcher.script(B, vec![network_error(B)]);
    fetcher.page(C, "従業員数：300名");
    let sink = Arc::new(MemoryEvidenceStore::new());

    let report = run(context(fetcher.clone(), sink.clone()), job(1, "Acme", &[A, B, C])).await;

    assert!(matches!(report.outcome, PipelineOutcome::Aborted { .. }));
    assert_eq!(report.errors, 5);
    assert_eq!(fetcher.calls_to(A), 4);
    assert_eq!(fetcher.calls_to(B), 1);
    assert_eq!(fetcher.calls_to(C), 0);

    let stored = sink.evidence();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].method, ExtractionMethod::Failed);
    assert_eq!(stored[0].value, None);
    assert_eq!(stored[0].source_url, B);
    let summary = stored[0].error_summary.as_deref().unwrap();
    assert!(summary.contains("aborted after 5 errors"), "{summary}");
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_retries_same_source() {
    let fetcher = FakeFetcher::new();
    fetcher.script(
        A,
        vec![
            rate_limited(A),
            FetchOutcome::success(A, "Number of employees: 450", "About", Some(200)),
        ],
    );
    fetcher.page(B, "Employees: 9");
    let sink = Arc::new(MemoryEvidenceStore::new());

    let started = tokio::time::Instant::now();
    let report = run(context(fetcher.clone(), sink), job(1, "Acme", &[A, B])).await;

    assert_eq!(report.outcome, PipelineOutcome::Done);
    assert_eq!(report.evidence.value, Some(450));
    assert_eq!(report.evidence.source_url, A);
    assert_eq!(fetcher.calls_to(A), 2);
    assert_eq!(fetcher.calls_to(B), 0);
    assert_eq!(report.errors, 1);
    // First rate limit wait uses the rate limit base delay
    assert!(started.elapsed() >= PipelineConfig::default().rate_limit_base_delay);
}

#[tokio::test(start_paused = true)]
async fn test_not_found_moves_to_next_source_without_retry() {
    let fetcher = FakeFetcher::new();
    // A is unscripted and answers 404
    fetcher.page(B, "Staff: 75");
    let sink = Arc::new(MemoryEvidenceStore::new());

    let report = run(context(fetcher.clone(), sink), job(1, "Acme", &[A, B])).await;

    assert_eq!(report.evidence.value, Some(75));
    assert_eq!(fetcher.calls_to(A), 1);
    assert_eq!(report.errors, 1);
    assert_eq!(report.fetch_attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn test_first_value_stops_the_walk() {
    let fetcher = FakeFetcher::new();
    fetcher.page(A, "従業員数 1,024人");
    fetcher.page(B, "Employees: 2,000");
    let sink = Arc::new(MemoryEvidenceStore::new());

    let report = run(context(fetcher.clone(), sink), job(1, "Acme", &[A, B])).await;

    assert_eq!(report.evidence.value, Some(1024));
    assert_eq!(fetcher.calls(), vec![A.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_llm_reads_page_when_patterns_miss() {
    let fetcher = FakeFetcher::new();
    fetcher.page(A, "We are a team of about three hundred and forty people across five offices.");
    let completer = FakeCompleter::new(vec![
        Err(LlmError::RateLimited("slow down".to_string())),
        Ok(r#"{"employee_count": 340, "raw_text": "about three hundred and forty people", "confidence": 0.8}"#.to_string()),
    ]);
    let sink = Arc::new(MemoryEvidenceStore::new());
    let limiter = RateLimiter::new();
    let ctx = PipelineContext::new(PipelineConfig::default(), fetcher, sink.clone())
        .with_limiter(limiter.clone())
        .with_llm(LlmExtractor::new(completer.clone(), limiter));

    let report = run(ctx, job(1, "Acme", &[A])).await;

    assert_eq!(report.outcome, PipelineOutcome::Done);
    assert_eq!(completer.prompt_count(), 2);
    assert_eq!(report.errors, 1);
    let evidence = &report.evidence;
    assert_eq!(evidence.value, Some(340));
    assert_eq!(evidence.method, ExtractionMethod::Llm);
    assert_eq!(evidence.model, "fake/headcount-model");
    assert_eq!(evidence.raw_text, "about three hundred and forty people");
    assert!((evidence.score - 0.8).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_pages_without_headcount_fail_with_evidence() {
    let fetcher = FakeFetcher::new();
    fetcher.page(A, "Welcome to our website");
    fetcher.page(B, "Contact us");
    let sink = Arc::new(MemoryEvidenceStore::new());

    let report = run(context(fetcher, sink.clone()), job(1, "Acme", &[A, B])).await;

    match &report.outcome {
        PipelineOutcome::Failed { reason } => assert!(reason.contains("2 source(s)"), "{reason}"),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(report.errors, 0);
    assert_eq!(sink.evidence().len(), 1);
    assert_eq!(sink.evidence()[0].method, ExtractionMethod::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_company_without_sources_still_gets_evidence() {
    let fetcher = FakeFetcher::new();
    let sink = Arc::new(MemoryEvidenceStore::new());

    let report = run(context(fetcher.clone(), sink.clone()), job(7, "Initech", &[])).await;

    assert_eq!(
        report.outcome,
        PipelineOutcome::Failed {
            reason: "no sources".to_string()
        }
    );
    assert!(fetcher.calls().is_empty());
    let stored = sink.evidence_for_company(report.evidence.company_id);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].error_summary.as_deref(), Some("no sources"));
    assert_eq!(sink.company_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_rate_limit_moves_to_next_source() {
    let fetcher = FakeFetcher::new();
    fetcher.script(A, vec![rate_limited(A)]);
    fetcher.page(B, "Employees: 10");
    let sink = Arc::new(MemoryEvidenceStore::new());

    let report = run(context(fetcher.clone(), sink), job(1, "Acme", &[A, B])).await;

    // One initial attempt plus three rate limit waits
    assert_eq!(fetcher.calls_to(A), 4);
    assert_eq!(fetcher.calls_to(B), 1);
    assert_eq!(report.errors, 4);
    assert_eq!(report.evidence.value, Some(10));
    assert_eq!(report.evidence.source_url, B);
}

#[tokio::test(start_paused = true)]
async fn test_server_error_retries_same_source() {
    let fetcher = FakeFetcher::new();
    fetcher.script(
        A,
        vec![
            server_error(A),
            FetchOutcome::success(A, "Employees: 77", "About", Some(200)),
        ],
    );
    fetcher.page(B, "Employees: 9");
    let sink = Arc::new(MemoryEvidenceStore::new());

    let report = run(context(fetcher.clone(), sink), job(1, "Acme", &[A, B])).await;

    assert_eq!(fetcher.calls_to(A), 2);
    assert_eq!(fetcher.calls_to(B), 0);
    assert_eq!(report.errors, 1);
    assert_eq!(report.evidence.value, Some(77));
}

#[tokio::test(start_paused = true)]
async fn test_failure_evidence_status_matches_last_source() {
    let fetcher = FakeFetcher::new();
    // A is unscripted and answers 404
    fetcher.page(B, "Welcome to our website");
    let sink = Arc::new(MemoryEvidenceStore::new());

    let report = run(context(fetcher, sink.clone()), job(1, "Acme", &[A, B])).await;

    assert!(matches!(report.outcome, PipelineOutcome::Failed { .. }));
    let stored = sink.evidence();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].source_url, B);
    assert_eq!(stored[0].status_code, Some(200));
}
