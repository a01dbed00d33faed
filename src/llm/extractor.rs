//! Headcount extraction through a language model.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{Completer, LlmError};
use crate::extract::parse_headcount;
use crate::models::{is_plausible_headcount, ExtractionCandidate, ExtractionMethod};
use crate::scrapers::{RateLimiter, LLM_RESOURCE};

/// Prompt template; `{text}` is replaced by the truncated page text.
pub const EXTRACTION_PROMPT: &str = r#"Find the total number of employees of the company described in the text below.

Rules:
- Prefer the most recent figure.
- Prefer consolidated or group-wide figures over single-entity figures.
- Approximate figures ("about", "約", "およそ") count; report the number itself.
- Note whether part-time staff are included when the text says so.

Text:
"""
{text}
"""

Answer with exactly this JSON object:
{
  "employee_count": <integer, or null if the text does not state it>,
  "raw_text": "<the sentence the number came from, at most 50 characters>",
  "confidence": <number between 0.0 and 1.0>,
  "notes": "<consolidated or single-entity, as-of date, other caveats>"
}"#;

/// Lines containing any of these are kept first when truncating.
const HEADCOUNT_KEYWORDS: &[&str] = &["従業員", "社員", "人員", "employee", "staff", "人数", "名", "人"];

/// Confidence assumed when the model does not report one.
pub const DEFAULT_MODEL_CONFIDENCE: f64 = 0.7;

/// Characters of page text used as evidence when the model gives no quote.
pub const FALLBACK_EVIDENCE_CHARS: usize = 500;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_GRACE: Duration = Duration::from_secs(1);

/// The JSON object the prompt asks for. Every field is optional on the wire.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelAnswer {
    #[serde(default)]
    pub employee_count: Option<Value>,
    #[serde(default)]
    pub raw_text: Option<String>,
    #[serde(default)]
    pub confidence: Option<Value>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl ModelAnswer {
    /// The reported headcount, if present, numeric and plausible.
    pub fn headcount(&self) -> Option<u64> {
        match self.employee_count.as_ref()? {
            Value::Number(n) => {
                let value = n.as_u64().or_else(|| {
                    n.as_f64()
                        .filter(|f| f.fract() == 0.0 && *f >= 0.0)
                        .map(|f| f as u64)
                })?;
                is_plausible_headcount(value).then_some(value)
            }
            Value::String(s) => parse_headcount(s.trim()),
            _ => None,
        }
    }

    /// Reported confidence, defaulting when missing or zero.
    pub fn confidence(&self) -> f64 {
        let reported = match self.confidence.as_ref() {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        };
        match reported {
            Some(c) if c > 0.0 && c.is_finite() => c.clamp(0.0, 1.0),
            _ => DEFAULT_MODEL_CONFIDENCE,
        }
    }
}

/// Locate and decode the JSON object in a model response.
///
/// Models often wrap the object in prose or code fences, so the outermost
/// `{...}` span is tried before the whole response.
pub fn parse_model_payload(response: &str) -> Option<ModelAnswer> {
    let trimmed = response.trim();
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(answer) = serde_json::from_str::<ModelAnswer>(&trimmed[start..=end]) {
                return Some(answer);
            }
        }
    }
    serde_json::from_str::<ModelAnswer>(trimmed).ok()
}

/// Cut `text` to at most `max_chars` characters, keeping headcount-related lines first.
pub fn truncate_for_model(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let (relevant, other): (Vec<&str>, Vec<&str>) = text.lines().partition(|line| {
        let lower = line.to_lowercase();
        HEADCOUNT_KEYWORDS.iter().any(|k| lower.contains(k))
    });

    let mut result = relevant.join("\n");
    let mut len = result.chars().count();
    for line in other {
        let line_len = line.chars().count();
        if len + line_len + 1 > max_chars {
            break;
        }
        result.push('\n');
        result.push_str(line);
        len += line_len + 1;
    }

    result.chars().take(max_chars).collect()
}

/// Runs the extraction prompt against a [`Completer`] under the `llm` rate limit.
#[derive(Clone)]
pub struct LlmExtractor {
    completer: Arc<dyn Completer>,
    limiter: RateLimiter,
    max_input_chars: usize,
    timeout: Duration,
    grace: Duration,
}

impl LlmExtractor {
    pub fn new(completer: Arc<dyn Completer>, limiter: RateLimiter) -> Self {
        Self {
            completer,
            limiter,
            max_input_chars: 3000,
            timeout: DEFAULT_TIMEOUT,
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_max_input_chars(mut self, max_input_chars: usize) -> Self {
        self.max_input_chars = max_input_chars.max(1);
        self
    }

    /// Per-call timeout handed to the completer, plus the local grace after which
    /// the call is abandoned.
    pub fn with_timeout(mut self, timeout: Duration, grace: Duration) -> Self {
        self.timeout = timeout;
        self.grace = grace;
        self
    }

    pub fn model(&self) -> &str {
        self.completer.model()
    }

    /// One extraction attempt. Payload problems are "not found"; only the
    /// completion call itself can fail.
    pub async fn extract(&self, text: &str) -> Result<ExtractionCandidate, LlmError> {
        let model = self.completer.model().to_string();
        if text.trim().is_empty() {
            return Ok(ExtractionCandidate::not_found(model));
        }

        let truncated = truncate_for_model(text, self.max_input_chars);
        let prompt = EXTRACTION_PROMPT.replace("{text}", &truncated);

        let waited = self.limiter.admit(LLM_RESOURCE).await;
        debug!(
            model = %model,
            input_chars = truncated.chars().count(),
            waited_ms = waited.as_millis() as u64,
            "Requesting LLM extraction"
        );

        let response = tokio::time::timeout(
            self.timeout + self.grace,
            self.completer.complete(&prompt, self.timeout),
        )
        .await
        .map_err(|_| {
            LlmError::Timeout(format!("no response within {}ms", self.timeout.as_millis()))
        })??;

        let Some(answer) = parse_model_payload(&response) else {
            warn!(model = %model, response_len = response.len(), "LLM response was not a JSON object");
            return Ok(ExtractionCandidate::not_found(model));
        };

        let Some(value) = answer.headcount() else {
            info!(model = %model, reported = ?answer.employee_count, "LLM found no usable headcount");
            return Ok(ExtractionCandidate::not_found(model));
        };

        let raw_text = match answer.raw_text.as_deref().map(str::trim) {
            Some(quote) if !quote.is_empty() => quote.to_string(),
            _ => text.chars().take(FALLBACK_EVIDENCE_CHARS).collect(),
        };
        let confidence = answer.confidence();

        info!(
            model = %model,
            value,
            confidence,
            notes = answer.notes.as_deref().unwrap_or(""),
            "Extracted headcount by LLM"
        );

        Ok(ExtractionCandidate::found(
            value,
            confidence,
            raw_text,
            ExtractionMethod::Llm,
            model,
        ))
    }
}
