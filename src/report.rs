//! Results CSV and end-of-run summary.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use console::style;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::models::ExtractionMethod;
use crate::pipeline::{CompanyReport, PipelineOutcome};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode results: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to flush results: {0}")]
    Flush(#[source] std::io::Error),
}

/// One line of the results file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRow {
    pub company_name: String,
    pub employee_count: Option<u64>,
    pub source_url: String,
    pub source_text: String,
    pub extraction_method: ExtractionMethod,
    pub confidence_score: f64,
    pub extracted_at: String,
    pub error_message: Option<String>,
}

impl From<&CompanyReport> for ResultRow {
    fn from(report: &CompanyReport) -> Self {
        let evidence = &report.evidence;
        Self {
            company_name: report.company.name.clone(),
            employee_count: evidence.value,
            source_url: evidence.source_url.clone(),
            source_text: evidence.raw_text.clone(),
            extraction_method: evidence.method,
            confidence_score: evidence.score,
            extracted_at: evidence.extracted_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            error_message: evidence.error_summary.clone(),
        }
    }
}

/// Write reports as CSV to any writer.
pub fn write_results<W: std::io::Write>(writer: W, reports: &[CompanyReport]) -> Result<(), ReportError> {
    let mut csv = csv::Writer::from_writer(writer);
    for report in reports {
        csv.serialize(ResultRow::from(report))?;
    }
    csv.flush().map_err(ReportError::Flush)?;
    Ok(())
}

/// File name for a run finishing at `at`.
pub fn results_file_name(at: DateTime<Utc>) -> String {
    format!("results_{}.csv", at.format("%Y%m%d_%H%M%S"))
}

/// Write a timestamped results file into `output_dir`, creating it if needed.
pub fn write_results_file(output_dir: &Path, reports: &[CompanyReport]) -> Result<PathBuf, ReportError> {
    std::fs::create_dir_all(output_dir).map_err(|source| ReportError::Io {
        path: output_dir.to_path_buf(),
        source,
    })?;
    let path = output_dir.join(results_file_name(Utc::now()));
    let file = std::fs::File::create(&path).map_err(|source| ReportError::Io {
        path: path.clone(),
        source,
    })?;
    write_results(file, reports)?;
    info!(path = %path.display(), rows = reports.len(), "Wrote results");
    Ok(path)
}

/// Counts shown at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub by_regex: usize,
    pub by_llm: usize,
    pub failed: usize,
    pub aborted: usize,
}

impl RunSummary {
    pub fn of(reports: &[CompanyReport]) -> Self {
        let mut summary = RunSummary {
            total: reports.len(),
            ..RunSummary::default()
        };
        for report in reports {
            match (&report.outcome, report.evidence.method) {
                (PipelineOutcome::Done, ExtractionMethod::Llm) => summary.by_llm += 1,
                (PipelineOutcome::Done, _) => summary.by_regex += 1,
                (PipelineOutcome::Aborted { .. }, _) => summary.aborted += 1,
                (PipelineOutcome::Failed { .. }, _) => summary.failed += 1,
            }
        }
        summary
    }

    pub fn succeeded(&self) -> usize {
        self.by_regex + self.by_llm
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.succeeded() as f64 * 100.0 / self.total as f64
        }
    }

    /// Print the summary block to stdout.
    pub fn print(&self) {
        println!();
        println!("{}", style("Extraction summary").bold());
        println!("  Companies:  {}", self.total);
        println!(
            "  Found:      {} ({:.1}%)",
            style(self.succeeded()).green(),
            self.success_rate()
        );
        println!("    regex:    {}", self.by_regex);
        println!("    llm:      {}", self.by_llm);
        println!("  Not found:  {}", style(self.failed).yellow());
        println!("  Aborted:    {}", style(self.aborted).red());
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Company, Evidence};
    use chrono::TimeZone;

    fn report(name: &str, value: Option<u64>, method: ExtractionMethod, outcome: PipelineOutcome) -> CompanyReport {
        let mut evidence = Evidence::failed(1, "https://acme.example/about", Some(200), "none");
        evidence.value = value;
        evidence.method = method;
        if value.is_some() {
            evidence.error_summary = None;
            evidence.raw_text = "従業員数：2,500名".to_string();
            evidence.score = 0.95;
        }
        evidence.extracted_at = Utc.with_ymd_and_hms(2024, 4, 1, 9, 30, 0).unwrap();
        CompanyReport {
            company: Company::new(1, name),
            outcome,
            evidence,
            visited: vec![],
            fetch_attempts: 1,
            errors: 0,
            persisted: true,
        }
    }

    #[test]
    fn test_write_results_columns() {
        let reports = vec![
            report("Acme", Some(2500), ExtractionMethod::Regex, PipelineOutcome::Done),
            report(
                "Globex",
                None,
                ExtractionMethod::Failed,
                PipelineOutcome::Failed {
                    reason: "no sources".into(),
                },
            ),
        ];
        let mut out = Vec::new();
        write_results(&mut out, &reports).unwrap();

        let mut reader = csv::Reader::from_reader(out.as_slice());
        let headers: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(
            headers,
            vec![
                "company_name",
                "employee_count",
                "source_url",
                "source_text",
                "extraction_method",
                "confidence_score",
                "extracted_at",
                "error_message"
            ]
        );

        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][0], "Acme");
        assert_eq!(&rows[0][1], "2500");
        assert_eq!(&rows[0][3], "従業員数：2,500名");
        assert_eq!(&rows[0][4], "regex");
        assert_eq!(rows[0][5].parse::<f64>().unwrap(), 0.95);
        assert_eq!(&rows[0][6], "2024-04-01T09:30:00Z");
        assert_eq!(&rows[0][7], "");

        assert_eq!(&rows[1][1], "");
        assert_eq!(&rows[1][4], "failed");
        assert_eq!(&rows[1][7], "none");
    }

    #[test]
    fn test_summary_counts() {
        let reports = vec![
            report("A", Some(10), ExtractionMethod::Regex, PipelineOutcome::Done),
            report("B", Some(20), ExtractionMethod::Llm, PipelineOutcome::Done),
            report("C", None, ExtractionMethod::Failed, PipelineOutcome::Failed { reason: "x".into() }),
            report("D", None, ExtractionMethod::Failed, PipelineOutcome::Aborted { reason: "y".into() }),
        ];
        let summary = RunSummary::of(&reports);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.by_regex, 1);
        assert_eq!(summary.by_llm, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.aborted, 1);
        assert!((summary.success_rate() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_results_file_name() {
        let at = Utc.with_ymd_and_hms(2024, 4, 1, 9, 30, 5).unwrap();
        assert_eq!(results_file_name(at), "results_20240401_093005.csv");
    }
}
