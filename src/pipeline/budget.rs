//! Per-company error budget shared by all running pipelines.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::warn;

use crate::error::ErrorKind;

/// Cumulative errors after which a company is abandoned.
pub const DEFAULT_ABORT_THRESHOLD: u32 = 5;

/// Result of recording one error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetDecision {
    /// Errors of this kind recorded for the company so far.
    pub kind_count: u32,
    /// Errors of any kind recorded for the company so far.
    pub company_total: u32,
    pub should_abort: bool,
}

/// Aggregated counts across every company.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorStatistics {
    pub total: u32,
    pub by_kind: BTreeMap<ErrorKind, u32>,
    pub companies: usize,
}

#[derive(Debug, Default)]
struct Counters {
    by_kind: HashMap<(String, ErrorKind), u32>,
    totals: HashMap<String, u32>,
}

/// Counts errors per `(company, kind)` and signals abort on the company total.
///
/// Counts only grow during a run; [`reset`](Self::reset) is the only way to clear them.
#[derive(Debug)]
pub struct ErrorBudget {
    threshold: u32,
    counters: Mutex<Counters>,
}

impl Default for ErrorBudget {
    fn default() -> Self {
        Self::new(DEFAULT_ABORT_THRESHOLD)
    }
}

impl ErrorBudget {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one error for `company_key`.
    pub fn record(&self, company_key: &str, kind: ErrorKind) -> BudgetDecision {
        let mut counters = self.lock();

        let kind_count = {
            let count = counters
                .by_kind
                .entry((company_key.to_string(), kind))
                .or_insert(0);
            *count += 1;
            *count
        };
        let company_total = {
            let total = counters.totals.entry(company_key.to_string()).or_insert(0);
            *total += 1;
            *total
        };

        let should_abort = company_total >= self.threshold;
        if should_abort {
            warn!(
                company = company_key,
                total = company_total,
                threshold = self.threshold,
                "Error budget exhausted"
            );
        }

        BudgetDecision {
            kind_count,
            company_total,
            should_abort,
        }
    }

    /// Errors of any kind recorded for a company.
    pub fn company_total(&self, company_key: &str) -> u32 {
        self.lock().totals.get(company_key).copied().unwrap_or(0)
    }

    /// Errors of one kind recorded for a company.
    pub fn count(&self, company_key: &str, kind: ErrorKind) -> u32 {
        self.lock()
            .by_kind
            .get(&(company_key.to_string(), kind))
            .copied()
            .unwrap_or(0)
    }

    pub fn statistics(&self) -> ErrorStatistics {
        let counters = self.lock();
        let mut stats = ErrorStatistics {
            companies: counters.totals.len(),
            ..ErrorStatistics::default()
        };
        for ((_, kind), count) in &counters.by_kind {
            *stats.by_kind.entry(*kind).or_insert(0) += count;
            stats.total += count;
        }
        stats
    }

    /// Clear every counter.
    pub fn reset(&self) {
        let mut counters = self.lock();
        counters.by_kind.clear();
        counters.totals.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fifth_error_aborts() {
        let budget = ErrorBudget::new(5);
        let kinds = [
            ErrorKind::Network,
            ErrorKind::Timeout,
            ErrorKind::Network,
            ErrorKind::Api,
        ];
        for kind in kinds {
            assert!(!budget.record("1:Acme", kind).should_abort);
        }
        let decision = budget.record("1:Acme", ErrorKind::Parse);
        assert!(decision.should_abort);
        assert_eq!(decision.company_total, 5);
        assert_eq!(decision.kind_count, 1);
    }

    #[test]
    fn test_companies_counted_separately() {
        let budget = ErrorBudget::new(2);
        budget.record("1:Acme", ErrorKind::Network);
        assert!(!budget.record("2:Globex", ErrorKind::Network).should_abort);
        assert!(budget.record("1:Acme", ErrorKind::Network).should_abort);
        assert_eq!(budget.count("1:Acme", ErrorKind::Network), 2);
        assert_eq!(budget.company_total("2:Globex"), 1);
    }

    #[test]
    fn test_statistics_and_reset() {
        let budget = ErrorBudget::default();
        budget.record("1:Acme", ErrorKind::Network);
        budget.record("1:Acme", ErrorKind::RateLimit);
        budget.record("2:Globex", ErrorKind::Network);

        let stats = budget.statistics();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.companies, 2);
        assert_eq!(stats.by_kind[&ErrorKind::Network], 2);
        assert_eq!(stats.by_kind[&ErrorKind::RateLimit], 1);

        budget.reset();
        assert_eq!(budget.statistics(), ErrorStatistics::default());
        assert_eq!(budget.company_total("1:Acme"), 0);
    }

    #[test]
    fn test_concurrent_records_are_not_lost() {
        let budget = Arc::new(ErrorBudget::new(1000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let budget = budget.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        budget.record("1:Acme", ErrorKind::Timeout);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(budget.company_total("1:Acme"), 400);
    }
}
