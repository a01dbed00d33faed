//! Failure taxonomy and classification.
//!
//! Collaborators tag failures with an [`ErrorKind`] where they can tell what went
//! wrong (a reqwest timeout, an HTTP 429). [`classify`] trusts that tag first, then
//! an attached HTTP status, and only falls back to inspecting the message text for
//! failures whose origin could not supply either.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Failure categories used for retry and fallback decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Network,
    Timeout,
    RateLimit,
    Api,
    Parse,
    Validation,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "NETWORK",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::RateLimit => "RATE_LIMIT",
            ErrorKind::Api => "API",
            ErrorKind::Parse => "PARSE",
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A collaborator failure with whatever structure was available where it was caught.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub message: String,
    pub kind: Option<ErrorKind>,
    pub status: Option<u16>,
}

impl Failure {
    /// An untagged failure; classification falls back to the message text.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
            status: None,
        }
    }

    pub fn tagged(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: Some(kind),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Build a failure from an HTTP error status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = if status == 429 {
            ErrorKind::RateLimit
        } else {
            ErrorKind::Api
        };
        Self::tagged(kind, message).with_status(status)
    }

    /// Build a failure from a reqwest transport error.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            Some(ErrorKind::Timeout)
        } else if err.is_connect() || err.is_request() {
            Some(ErrorKind::Network)
        } else if err.is_decode() || err.is_body() {
            Some(ErrorKind::Parse)
        } else {
            None
        };
        let failure = Self {
            message: err.to_string(),
            kind,
            status: None,
        };
        match err.status() {
            Some(status) => failure.with_status(status.as_u16()),
            None => failure,
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (HTTP {})", self.message, status),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for Failure {}

/// What the pipeline should do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: ErrorKind,
    pub retryable: bool,
    /// False only for rate limits, which wait and retry the same source.
    pub skip_to_next: bool,
}

impl Classification {
    fn of(kind: ErrorKind, server_side: bool) -> Self {
        let retryable = match kind {
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::RateLimit => true,
            ErrorKind::Api => server_side,
            ErrorKind::Parse | ErrorKind::Validation | ErrorKind::Unknown => false,
        };
        Self {
            kind,
            retryable,
            skip_to_next: kind != ErrorKind::RateLimit,
        }
    }
}

static STATUS_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([45]\d{2})\b").expect("valid status token pattern"));
static API_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bAPI\b").expect("valid API word pattern"));

/// Classify a failure into the taxonomy.
pub fn classify(failure: &Failure) -> Classification {
    if let Some(kind) = failure.kind {
        let server_side = match failure.status {
            Some(status) => is_server_error(status),
            None => text_has_server_status(&failure.message),
        };
        return Classification::of(kind, server_side);
    }

    if let Some(status) = failure.status {
        if status == 429 {
            return Classification::of(ErrorKind::RateLimit, false);
        }
        if status >= 400 {
            return Classification::of(ErrorKind::Api, is_server_error(status));
        }
    }

    classify_message(&failure.message)
}

/// Text-pattern classification for failures without a structured tag.
///
/// Timeout and network signatures are checked before status codes because a
/// timeout message often carries network-looking text as well.
pub fn classify_message(message: &str) -> Classification {
    let lower = message.to_lowercase();

    if lower.contains("timeout") || lower.contains("timed out") {
        return Classification::of(ErrorKind::Timeout, false);
    }

    const NETWORK_SIGNATURES: &[&str] = &["ECONNREFUSED", "ENOTFOUND", "NetworkError", "ERR_NETWORK"];
    const NETWORK_PHRASES: &[&str] = &[
        "connection refused",
        "connection reset",
        "dns error",
        "error sending request",
    ];
    if NETWORK_SIGNATURES.iter().any(|s| message.contains(s))
        || NETWORK_PHRASES.iter().any(|s| lower.contains(s))
    {
        return Classification::of(ErrorKind::Network, false);
    }

    if message.contains("429") || lower.contains("rate limit") || lower.contains("too many requests") {
        return Classification::of(ErrorKind::RateLimit, false);
    }

    if STATUS_TOKEN.is_match(message) || API_WORD.is_match(message) {
        return Classification::of(ErrorKind::Api, text_has_server_status(message));
    }

    if message.contains("JSON") || lower.contains("parse") {
        return Classification::of(ErrorKind::Parse, false);
    }

    if lower.contains("validation") || message.contains("Invalid") {
        return Classification::of(ErrorKind::Validation, false);
    }

    Classification::of(ErrorKind::Unknown, false)
}

fn is_server_error(status: u16) -> bool {
    (500..600).contains(&status)
}

fn text_has_server_status(message: &str) -> bool {
    STATUS_TOKEN
        .captures_iter(message)
        .any(|cap| cap[1].starts_with('5'))
}
