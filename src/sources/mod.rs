//! Source prioritization: pairs companies with their candidate URLs.

pub mod loader;

pub use loader::{load_companies, load_urls, read_companies, read_urls, LoadError};

use std::collections::{HashMap, HashSet};

use thiserror::Error;
use tracing::{info, warn};

use crate::models::{Company, SourceType, SourceUrl};

/// One problem found while assembling the run's input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityIssue {
    #[error("duplicate company id {id}")]
    DuplicateCompanyId { id: i64 },
    #[error("url {url} references unknown company id {company_id}")]
    UnknownCompany { company_id: i64, url: String },
}

/// Input that cannot be processed without guessing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} data integrity issue(s): {}", .issues.len(), join_issues(.issues))]
pub struct DataIntegrityError {
    pub issues: Vec<IntegrityIssue>,
}

fn join_issues(issues: &[IntegrityIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A company together with its sources in visiting order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanyJob {
    pub company: Company,
    pub sources: Vec<SourceUrl>,
}

/// Report every duplicate company id and every URL pointing at an unknown company.
pub fn validate(companies: &[Company], urls: &[SourceUrl]) -> Result<(), DataIntegrityError> {
    let mut issues = Vec::new();
    let mut seen = HashSet::new();
    for company in companies {
        if !seen.insert(company.id) {
            issues.push(IntegrityIssue::DuplicateCompanyId { id: company.id });
        }
    }
    for source in urls {
        if !seen.contains(&source.company_id) {
            issues.push(IntegrityIssue::UnknownCompany {
                company_id: source.company_id,
                url: source.url.clone(),
            });
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        for issue in &issues {
            warn!(%issue, "Input rejected");
        }
        Err(DataIntegrityError { issues })
    }
}

/// Sort one company's sources by ascending priority. Equal priorities keep input order.
pub fn prioritize_sources(mut sources: Vec<SourceUrl>) -> Vec<SourceUrl> {
    sources.sort_by_key(|s| s.priority);
    sources
}

/// Group URLs under their companies, in company input order.
///
/// Companies without URLs are kept with an empty source list so the pipeline can
/// report them as failed.
pub fn prioritize(
    companies: &[Company],
    urls: &[SourceUrl],
) -> Result<Vec<CompanyJob>, DataIntegrityError> {
    validate(companies, urls)?;

    let mut by_company: HashMap<i64, Vec<SourceUrl>> = HashMap::new();
    for source in urls {
        by_company
            .entry(source.company_id)
            .or_default()
            .push(source.clone());
    }

    let jobs: Vec<CompanyJob> = companies
        .iter()
        .map(|company| {
            let sources = prioritize_sources(by_company.remove(&company.id).unwrap_or_default());
            if sources.is_empty() {
                warn!(company = %company.name, id = company.id, "No source URLs for company");
            }
            CompanyJob {
                company: company.clone(),
                sources,
            }
        })
        .collect();

    info!(
        companies = jobs.len(),
        urls = urls.len(),
        "Prioritized sources"
    );
    Ok(jobs)
}

/// Coarse priority grouping used for run summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PriorityBand {
    /// 1-3: official and IR pages
    High,
    /// 4-7: encyclopedias and news
    Medium,
    /// 8 and above
    Low,
}

impl PriorityBand {
    pub fn of(priority: u32) -> Self {
        match priority {
            0..=3 => PriorityBand::High,
            4..=7 => PriorityBand::Medium,
            _ => PriorityBand::Low,
        }
    }
}

/// Shape of one company's source list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSummary {
    pub total: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub source_types: Vec<SourceType>,
}

impl SourceSummary {
    pub fn of(sources: &[SourceUrl]) -> Self {
        let mut summary = SourceSummary {
            total: sources.len(),
            high: 0,
            medium: 0,
            low: 0,
            source_types: Vec::new(),
        };
        for source in sources {
            match PriorityBand::of(source.priority) {
                PriorityBand::High => summary.high += 1,
                PriorityBand::Medium => summary.medium += 1,
                PriorityBand::Low => summary.low += 1,
            }
            if !summary.source_types.contains(&source.source_type) {
                summary.source_types.push(source.source_type);
            }
        }
        summary
    }

    /// Name of the walk the pipeline will perform.
    pub fn strategy(&self) -> &'static str {
        if self.high > 0 {
            "high-priority-first"
        } else if self.medium > 0 {
            "medium-priority-fallback"
        } else {
            "low-priority-scan"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(company_id: i64, path: &str, priority: i64) -> SourceUrl {
        SourceUrl::new(
            company_id,
            format!("https://example.com/{path}"),
            SourceType::Official,
            Some(priority),
        )
    }

    #[test]
    fn test_sorts_by_priority() {
        let companies = vec![Company::new(1, "Acme")];
        let urls = vec![url(1, "a", 7), url(1, "b", 1), url(1, "c", 5)];
        let jobs = prioritize(&companies, &urls).unwrap();
        let priorities: Vec<u32> = jobs[0].sources.iter().map(|s| s.priority).collect();
        assert_eq!(priorities, vec![1, 5, 7]);
    }

    #[test]
    fn test_equal_priorities_keep_input_order() {
        let sorted = prioritize_sources(vec![url(1, "first", 2), url(1, "second", 2), url(1, "zero", 0)]);
        let paths: Vec<&str> = sorted.iter().map(|s| s.url.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "https://example.com/zero",
                "https://example.com/first",
                "https://example.com/second"
            ]
        );
    }

    #[test]
    fn test_unknown_company_is_integrity_error() {
        let companies = vec![Company::new(1, "Acme")];
        let urls = vec![url(1, "a", 1), url(42, "orphan", 1)];
        let err = prioritize(&companies, &urls).unwrap_err();
        assert_eq!(
            err.issues,
            vec![IntegrityIssue::UnknownCompany {
                company_id: 42,
                url: "https://example.com/orphan".to_string()
            }]
        );
        assert!(err.to_string().contains("unknown company id 42"));
    }

    #[test]
    fn test_duplicate_company_ids_rejected() {
        let companies = vec![Company::new(1, "Acme"), Company::new(1, "Acme again")];
        let err = validate(&companies, &[]).unwrap_err();
        assert_eq!(err.issues, vec![IntegrityIssue::DuplicateCompanyId { id: 1 }]);
    }

    #[test]
    fn test_company_without_urls_passes_through() {
        let companies = vec![Company::new(1, "Acme"), Company::new(2, "Empty")];
        let jobs = prioritize(&companies, &[url(1, "a", 1)]).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].company.name, "Empty");
        assert!(jobs[1].sources.is_empty());
    }

    #[test]
    fn test_summary_bands_and_strategy() {
        let sources = vec![url(1, "a", 2), url(1, "b", 5), url(1, "c", 9), url(1, "d", 99)];
        let summary = SourceSummary::of(&sources);
        assert_eq!((summary.high, summary.medium, summary.low), (1, 1, 2));
        assert_eq!(summary.source_types, vec![SourceType::Official]);
        assert_eq!(summary.strategy(), "high-priority-first");

        assert_eq!(SourceSummary::of(&[url(1, "b", 6)]).strategy(), "medium-priority-fallback");
        assert_eq!(SourceSummary::of(&[url(1, "c", 10)]).strategy(), "low-priority-scan");
        assert_eq!(SourceSummary::of(&[]).strategy(), "low-priority-scan");
    }
}
