//! Bounded exponential backoff schedule.

use std::time::Duration;

/// Yields at most `max_retries` delays of `base * 2^attempt`, each capped at `max_delay`.
///
/// The pipeline retries only while this iterator has delays left, so the retry
/// bound cannot be exceeded by a miscounted loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max_delay: Duration,
    max_retries: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_retries: u32) -> Self {
        Self {
            base,
            max_delay: Duration::MAX,
            max_retries,
            attempt: 0,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delays handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn remaining(&self) -> u32 {
        self.max_retries.saturating_sub(self.attempt)
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_retries {
            return None;
        }
        let factor = 2u32.saturating_pow(self.attempt);
        let delay = self.base.saturating_mul(factor).min(self.max_delay);
        self.attempt += 1;
        Some(delay)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining() as usize;
        (remaining, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubling_schedule() {
        let delays: Vec<Duration> = Backoff::new(Duration::from_millis(1000), 3).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(4000)
            ]
        );
    }

    #[test]
    fn test_capped_delay() {
        let delays: Vec<Duration> = Backoff::new(Duration::from_secs(5), 5)
            .with_max_delay(Duration::from_secs(30))
            .collect();
        assert_eq!(delays.last(), Some(&Duration::from_secs(30)));
        assert_eq!(delays.len(), 5);
    }

    #[test]
    fn test_zero_retries_yields_nothing() {
        let mut backoff = Backoff::new(Duration::from_secs(1), 0);
        assert_eq!(backoff.next(), None);
        assert_eq!(backoff.attempts(), 0);
    }

    #[test]
    fn test_remaining() {
        let mut backoff = Backoff::new(Duration::from_secs(1), 2);
        assert_eq!(backoff.remaining(), 2);
        backoff.next();
        assert_eq!(backoff.remaining(), 1);
        backoff.next();
        assert_eq!(backoff.next(), None);
        assert_eq!(backoff.attempts(), 2);
    }
}
