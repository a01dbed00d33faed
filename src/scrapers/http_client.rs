//! HTTP page fetcher that renders HTML down to plain text.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{ACCEPT_LANGUAGE, CONTENT_TYPE};
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info, warn};

use super::PageFetcher;
use crate::error::{ErrorKind, Failure};
use crate::models::FetchOutcome;

const USER_AGENT: &str = "headcount/0.1 (company research; employee count survey)";

/// Browser user agents for impersonate mode.
const IMPERSONATE_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.1 Safari/605.1.15",
];

const ACCEPT_LANGUAGE_VALUE: &str = "ja-JP,ja;q=0.9,en;q=0.8";

/// Elements whose text never carries page content.
const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "noscript", "template", "svg"];

/// Elements that end a line of rendered text.
const BLOCK_ELEMENTS: &[&str] = &[
    "p", "div", "br", "li", "tr", "td", "th", "dt", "dd", "h1", "h2", "h3", "h4", "h5", "h6",
    "section", "article", "header", "footer", "table", "ul", "ol", "dl", "address", "main",
];

static INLINE_WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t\u{3000}\u{a0}]+").expect("valid whitespace pattern"));

fn random_user_agent() -> &'static str {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as usize)
        .unwrap_or(0);
    IMPERSONATE_USER_AGENTS[nanos % IMPERSONATE_USER_AGENTS.len()]
}

/// Resolve user agent from config value.
/// - None => default user agent
/// - "impersonate" => random browser user agent
/// - other => custom user agent string
pub fn resolve_user_agent(config: Option<&str>) -> String {
    match config {
        None => USER_AGENT.to_string(),
        Some("impersonate") => random_user_agent().to_string(),
        Some(custom) => custom.to_string(),
    }
}

/// Page fetcher backed by reqwest.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Create a fetcher with the given user agent configuration.
    pub fn new(user_agent_config: Option<&str>) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(resolve_user_agent(user_agent_config))
            .gzip(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self { client })
    }

    async fn fetch_inner(&self, url: &str, timeout: Duration) -> Result<FetchOutcome, Failure> {
        debug!(url, "Fetching page");

        let response = self
            .client
            .get(url)
            .header(ACCEPT_LANGUAGE, ACCEPT_LANGUAGE_VALUE)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Failure::from_reqwest(&e))?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(Failure::from_status(
                status.as_u16(),
                format!("HTTP error: {}", status.as_u16()),
            ));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_ascii_lowercase())
            .unwrap_or_default();

        if !is_textual(&content_type) {
            return Err(Failure::tagged(
                ErrorKind::Parse,
                format!("unsupported content type: {}", content_type),
            )
            .with_status(status.as_u16()));
        }

        let body = response.text().await.map_err(|e| Failure::from_reqwest(&e))?;

        let (title, text) = if content_type.contains("html") || content_type.is_empty() {
            let document = Html::parse_document(&body);
            (page_title(&document), document_text(&document))
        } else {
            (String::new(), normalize_lines(&body))
        };

        info!(url, title = %title, text_len = text.len(), "Fetched page");
        Ok(FetchOutcome::success(url, text, title, Some(status.as_u16())))
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, timeout: Duration) -> FetchOutcome {
        match self.fetch_inner(url, timeout).await {
            Ok(outcome) => outcome,
            Err(failure) => {
                warn!(url, error = %failure, "Page fetch failed");
                FetchOutcome::failure(url, failure)
            }
        }
    }
}

fn is_textual(content_type: &str) -> bool {
    content_type.is_empty()
        || content_type.starts_with("text/")
        || content_type.contains("html")
        || content_type.contains("xml")
        || content_type.contains("json")
}

fn page_title(document: &Html) -> String {
    let Ok(selector) = Selector::parse("title") else {
        return String::new();
    };
    document
        .select(&selector)
        .next()
        .map(|t| t.text().collect::<String>().trim().to_string())
        .unwrap_or_default()
}

fn document_text(document: &Html) -> String {
    let root = Selector::parse("body")
        .ok()
        .and_then(|s| document.select(&s).next())
        .unwrap_or_else(|| document.root_element());
    html_element_text(root)
}

/// Render a parsed document's body as text, one block per line.
pub fn html_to_text(html: &str) -> String {
    document_text(&Html::parse_document(html))
}

fn html_element_text(root: ElementRef<'_>) -> String {
    let mut out = String::new();
    collect_text(root, &mut out);
    normalize_lines(&out)
}

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    let name = element.value().name();
    if SKIPPED_ELEMENTS.contains(&name) {
        return;
    }
    let is_block = BLOCK_ELEMENTS.contains(&name);
    if is_block {
        out.push('\n');
    }
    for child in element.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
        } else if let Some(child_element) = ElementRef::wrap(child) {
            collect_text(child_element, out);
        }
    }
    if is_block {
        out.push('\n');
    }
}

/// Collapse runs of inline whitespace and drop blank lines.
fn normalize_lines(text: &str) -> String {
    text.lines()
        .map(|line| INLINE_WHITESPACE.replace_all(line, " ").trim().to_string())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
