//! Per-resource sliding window state.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Ordered admission timestamps within a trailing window.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    /// Maximum admissions within one window.
    pub max_requests: usize,
    /// Length of the trailing window.
    pub window: Duration,
    /// Admission timestamps, oldest first.
    pub timestamps: VecDeque<Instant>,
    /// Total admissions since creation.
    pub total_admitted: u64,
    /// Admissions that had to wait for a free slot.
    pub total_waits: u64,
}

impl SlidingWindow {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            timestamps: VecDeque::new(),
            total_admitted: 0,
            total_waits: 0,
        }
    }

    /// Drop timestamps that fell out of the window ending at `now`.
    pub fn purge(&mut self, now: Instant) {
        // Timestamps are appended in order, so expired entries are at the front
        while let Some(oldest) = self.timestamps.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Whether the window is at capacity at `now`. Purges first.
    pub fn is_full(&mut self, now: Instant) -> bool {
        self.purge(now);
        self.timestamps.len() >= self.max_requests
    }

    /// Time until the oldest entry leaves the window, plus `margin`.
    /// Zero when a slot is already free.
    pub fn wait_time(&mut self, now: Instant, margin: Duration) -> Duration {
        if !self.is_full(now) {
            return Duration::ZERO;
        }
        match self.timestamps.front() {
            Some(oldest) => {
                let elapsed = now.saturating_duration_since(*oldest);
                self.window.saturating_sub(elapsed) + margin
            }
            None => Duration::ZERO,
        }
    }

    /// Record an admission at `now`.
    pub fn record(&mut self, now: Instant) {
        self.timestamps.push_back(now);
        self.total_admitted += 1;
    }

    /// Number of admissions currently inside the window.
    pub fn current(&mut self, now: Instant) -> usize {
        self.purge(now);
        self.timestamps.len()
    }
}
