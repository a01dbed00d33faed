//! Language-model fallback for pages the patterns cannot read.

pub mod client;
pub mod extractor;

pub use client::{LlmClient, LlmConfig, LlmError, LlmProvider};
pub use extractor::{parse_model_payload, truncate_for_model, LlmExtractor, ModelAnswer};

use std::time::Duration;

use async_trait::async_trait;

/// A single request/response completion call.
///
/// Implementations never retry; the caller owns retry, truncation and parsing.
#[async_trait]
pub trait Completer: Send + Sync {
    async fn complete(&self, prompt: &str, timeout: Duration) -> Result<String, LlmError>;

    /// Model id recorded as evidence provenance.
    fn model(&self) -> &str;
}
