//! Sliding-window rate limiter keyed by resource name.
//!
//! Each named resource (`fetch`, `llm`, ...) admits at most `max_requests` calls
//! within a trailing window. Admission on one resource is serialized by that
//! resource's mutex, which is held across the wait, so two callers can never both
//! claim the last free slot. Unconfigured resources admit immediately.

mod window;

pub use window::SlidingWindow;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Resource name used for page fetches.
pub const FETCH_RESOURCE: &str = "fetch";
/// Resource name used for language-model calls.
pub const LLM_RESOURCE: &str = "llm";

/// Extra wait added on top of the computed window wait.
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_millis(1000);

/// Limit for a single resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum admissions per window.
    pub max_requests: usize,
    /// Window length in milliseconds.
    pub window_ms: u64,
}

impl RateLimitConfig {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window_ms: window.as_millis() as u64,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Default page fetch limit: 5 requests per 10 seconds.
    pub fn fetch_default() -> Self {
        Self::new(5, Duration::from_secs(10))
    }

    /// Default language-model limit: 10 requests per minute.
    pub fn llm_default() -> Self {
        Self::new(10, Duration::from_secs(60))
    }
}

/// Snapshot of one resource's window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowStats {
    pub current: usize,
    pub max: usize,
    pub window: Duration,
    pub total_admitted: u64,
    pub total_waits: u64,
}

/// Rate limiter shared by every pipeline in a run.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    safety_margin: Duration,
    windows: Arc<RwLock<HashMap<String, Arc<Mutex<SlidingWindow>>>>>,
}

impl RateLimiter {
    /// Create a limiter with no configured resources.
    pub fn new() -> Self {
        Self::with_safety_margin(DEFAULT_SAFETY_MARGIN)
    }

    /// Create a limiter with a custom safety margin.
    pub fn with_safety_margin(safety_margin: Duration) -> Self {
        Self {
            safety_margin,
            windows: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Create a limiter from a map of resource limits.
    pub fn from_limits<'a>(
        limits: impl IntoIterator<Item = (&'a String, &'a RateLimitConfig)>,
        safety_margin: Duration,
    ) -> Self {
        let limiter = Self::with_safety_margin(safety_margin);
        for (name, config) in limits {
            limiter.set_limit(name, *config);
        }
        limiter
    }

    /// Configure (or reconfigure) a resource. Replaces any existing window.
    pub fn set_limit(&self, resource: &str, config: RateLimitConfig) {
        let window = SlidingWindow::new(config.max_requests, config.window());
        let mut windows = self.windows.write().unwrap_or_else(PoisonError::into_inner);
        windows.insert(resource.to_string(), Arc::new(Mutex::new(window)));
        debug!(
            resource,
            max_requests = config.max_requests,
            window_ms = config.window_ms,
            "Configured rate limit"
        );
    }

    /// Builder form of [`set_limit`](Self::set_limit).
    pub fn with_limit(self, resource: &str, config: RateLimitConfig) -> Self {
        self.set_limit(resource, config);
        self
    }

    fn window_for(&self, resource: &str) -> Option<Arc<Mutex<SlidingWindow>>> {
        let windows = self.windows.read().unwrap_or_else(PoisonError::into_inner);
        windows.get(resource).cloned()
    }

    /// Whether a resource has a configured limit.
    pub fn is_limited(&self, resource: &str) -> bool {
        self.window_for(resource).is_some()
    }

    /// Wait until a request on `resource` is allowed, then record it.
    ///
    /// Returns how long the caller was suspended.
    pub async fn admit(&self, resource: &str) -> Duration {
        let Some(window) = self.window_for(resource) else {
            return Duration::ZERO;
        };

        let mut window = window.lock().await;
        let wait = window.wait_time(Instant::now(), self.safety_margin);

        if wait > Duration::ZERO {
            warn!(
                resource,
                wait_ms = wait.as_millis() as u64,
                in_window = window.timestamps.len(),
                "Rate limit reached, waiting"
            );
            window.total_waits += 1;
            tokio::time::sleep(wait).await;
            window.purge(Instant::now());
        }

        window.record(Instant::now());
        wait
    }

    /// Statistics for one resource.
    pub async fn stats(&self, resource: &str) -> Option<WindowStats> {
        let window = self.window_for(resource)?;
        let mut window = window.lock().await;
        Some(WindowStats {
            current: window.current(Instant::now()),
            max: window.max_requests,
            window: window.window,
            total_admitted: window.total_admitted,
            total_waits: window.total_waits,
        })
    }

    /// Statistics for every configured resource.
    pub async fn all_stats(&self) -> HashMap<String, WindowStats> {
        let names: Vec<String> = {
            let windows = self.windows.read().unwrap_or_else(PoisonError::into_inner);
            windows.keys().cloned().collect()
        };

        let mut stats = HashMap::new();
        for name in names {
            if let Some(s) = self.stats(&name).await {
                stats.insert(name, s);
            }
        }
        stats
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_per_second(margin: Duration) -> RateLimiter {
        RateLimiter::with_safety_margin(margin)
            .with_limit("fetch", RateLimitConfig::new(3, Duration::from_millis(1000)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_within_limit_immediately() {
        let limiter = three_per_second(Duration::ZERO);
        let start = Instant::now();
        for _ in 0..3 {
            assert_eq!(limiter.admit("fetch").await, Duration::ZERO);
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        let stats = limiter.stats("fetch").await.unwrap();
        assert_eq!(stats.current, 3);
        assert_eq!(stats.max, 3);
        assert_eq!(stats.window, Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fourth_request_waits_for_window() {
        let limiter = three_per_second(Duration::ZERO);
        for _ in 0..3 {
            limiter.admit("fetch").await;
        }

        tokio::time::advance(Duration::from_millis(200)).await;
        let before = Instant::now();
        limiter.admit("fetch").await;
        assert!(before.elapsed() >= Duration::from_millis(800));

        let stats = limiter.stats("fetch").await.unwrap();
        assert_eq!(stats.total_waits, 1);
        assert_eq!(stats.total_admitted, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_safety_margin_extends_wait() {
        let limiter = three_per_second(DEFAULT_SAFETY_MARGIN);
        for _ in 0..3 {
            limiter.admit("fetch").await;
        }
        let before = Instant::now();
        limiter.admit("fetch").await;
        assert!(before.elapsed() >= Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_entries_purged() {
        let limiter = RateLimiter::with_safety_margin(Duration::ZERO)
            .with_limit("fetch", RateLimitConfig::new(5, Duration::from_millis(1000)));
        for _ in 0..3 {
            limiter.admit("fetch").await;
        }
        tokio::time::advance(Duration::from_millis(1500)).await;
        limiter.admit("fetch").await;
        assert_eq!(limiter.stats("fetch").await.unwrap().current, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfigured_resource_is_unlimited() {
        let limiter = three_per_second(Duration::ZERO);
        let start = Instant::now();
        for _ in 0..20 {
            limiter.admit("search").await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(limiter.stats("search").await.is_none());
        assert!(!limiter.is_limited("search"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resources_are_independent() {
        let limiter = three_per_second(Duration::ZERO)
            .with_limit("llm", RateLimitConfig::new(1, Duration::from_millis(1000)));
        for _ in 0..3 {
            limiter.admit("fetch").await;
        }
        let start = Instant::now();
        limiter.admit("llm").await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        let all = limiter.all_stats().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all["fetch"].current, 3);
        assert_eq!(all["llm"].current, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_never_exceed_limit() {
        let limiter = three_per_second(Duration::ZERO);
        let mut handles = Vec::new();
        for _ in 0..9 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.admit("fetch").await;
                Instant::now()
            }));
        }

        let mut admitted = Vec::new();
        for handle in handles {
            admitted.push(handle.await.unwrap());
        }
        admitted.sort();

        for i in 3..admitted.len() {
            let span = admitted[i].duration_since(admitted[i - 3]);
            assert!(span >= Duration::from_millis(1000), "four admissions within {span:?}");
        }
    }
}
