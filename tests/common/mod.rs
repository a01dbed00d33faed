//! Scripted collaborators shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use headcount::error::{ErrorKind, Failure};
use headcount::llm::{Completer, LlmError};
use headcount::models::{Company, FetchOutcome, SourceType, SourceUrl};
use headcount::scrapers::PageFetcher;
use headcount::sources::CompanyJob;

/// Serves queued outcomes per URL. The last queued outcome repeats and
/// unknown URLs answer 404.
#[derive(Default)]
pub struct FakeFetcher {
    scripts: Mutex<HashMap<String, VecDeque<FetchOutcome>>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, url: &str, outcomes: Vec<FetchOutcome>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(url.to_string(), outcomes.into());
    }

    pub fn page(&self, url: &str, text: &str) {
        self.script(url, vec![FetchOutcome::success(url, text, "About us", Some(200))]);
    }

    pub fn delay(&self, url: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(url.to_string(), delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == url).count()
    }

    /// Highest number of fetches that were running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageFetcher for FakeFetcher {
    async fn fetch(&self, url: &str, _timeout: Duration) -> FetchOutcome {
        self.calls.lock().unwrap().push(url.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let delay = self.delays.lock().unwrap().get(url).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let outcome = {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(url) {
                Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
                Some(queue) => queue[0].clone(),
                None => FetchOutcome::failure(url, Failure::from_status(404, "HTTP error: 404")),
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

/// Replies from a queue; the last reply repeats.
pub struct FakeCompleter {
    reply: Mutex<VecDeque<Result<String, LlmError>>>,
    prompts: Mutex<Vec<String>>,
}

impl FakeCompleter {
    pub fn new(replies: Vec<Result<String, LlmError>>) -> Arc<Self> {
        Arc::new(Self {
            reply: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl Completer for FakeCompleter {
    async fn complete(&self, prompt: &str, _timeout: Duration) -> Result<String, LlmError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let mut replies = self.reply.lock().unwrap();
        match replies.len() {
            0 => Ok("{}".to_string()),
            1 => replies[0].clone(),
            _ => replies.pop_front().unwrap(),
        }
    }

    fn model(&self) -> &str {
        "fake/headcount-model"
    }
}

pub fn network_error(url: &str) -> FetchOutcome {
    FetchOutcome::failure(url, Failure::tagged(ErrorKind::Network, "connection refused"))
}

pub fn rate_limited(url: &str) -> FetchOutcome {
    FetchOutcome::failure(url, Failure::from_status(429, "HTTP error: 429"))
}

pub fn server_error(url: &str) -> FetchOutcome {
    FetchOutcome::failure(url, Failure::from_status(503, "HTTP error: 503"))
}

/// A job whose sources get priorities 1, 2, 3... in the order given.
pub fn job(id: i64, name: &str, urls: &[&str]) -> CompanyJob {
    CompanyJob {
        company: Company::new(id, name),
        sources: urls
            .iter()
            .enumerate()
            .map(|(i, url)| SourceUrl::new(id, *url, SourceType::Official, Some(i as i64 + 1)))
            .collect(),
    }
}
