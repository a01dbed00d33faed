//! Page acquisition: fetch collaborator and request admission control.

pub mod http_client;
pub mod rate_limiter;

pub use http_client::{html_to_text, resolve_user_agent, HttpFetcher};
pub use rate_limiter::{RateLimitConfig, RateLimiter, WindowStats, FETCH_RESOURCE, LLM_RESOURCE};

use std::time::Duration;

use async_trait::async_trait;

use crate::models::FetchOutcome;

/// Fetches one page and reduces it to text.
///
/// Implementations perform a single attempt and never retry; failures are
/// returned as an unsuccessful [`FetchOutcome`] carrying a tagged
/// [`Failure`](crate::error::Failure).
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str, timeout: Duration) -> FetchOutcome;
}
