//! LLM client for headcount extraction prompts.
//!
//! Supports OpenAI-compatible chat completions (OpenRouter) and the Ollama
//! generate API for local inference.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Completer;
use crate::error::{ErrorKind, Failure};

/// System message sent with chat completion requests.
const SYSTEM_PROMPT: &str = "You extract facts from company web pages and always answer with a single JSON object.";

/// Which backend serves completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    OpenRouter,
    Ollama,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::OpenRouter => "openrouter",
            LlmProvider::Ollama => "ollama",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openrouter" | "openai" => Some(LlmProvider::OpenRouter),
            "ollama" => Some(LlmProvider::Ollama),
            _ => None,
        }
    }

    pub fn default_endpoint(&self) -> &'static str {
        match self {
            LlmProvider::OpenRouter => "https://openrouter.ai/api/v1",
            LlmProvider::Ollama => "http://localhost:11434",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            LlmProvider::OpenRouter => "meta-llama/llama-3.1-8b-instruct",
            LlmProvider::Ollama => "llama3.1:8b",
        }
    }
}

impl std::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for LLM client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Whether the LLM fallback stage runs at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub provider: LlmProvider,
    /// API base URL; provider default when unset
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Model id; provider default when unset
    #[serde(default)]
    pub model: Option<String>,
    /// Bearer token for OpenAI-compatible providers
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// Maximum tokens in response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Temperature for generation (0.0 - 1.0)
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Maximum characters of page text sent to the model
    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,
}

fn default_enabled() -> bool {
    true
}
fn default_max_tokens() -> u32 {
    200
}
fn default_temperature() -> f32 {
    0.1
}
fn default_max_content_chars() -> usize {
    3000
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            provider: LlmProvider::default(),
            endpoint: None,
            model: None,
            api_key: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            max_content_chars: default_max_content_chars(),
        }
    }
}

impl LlmConfig {
    pub fn with_provider(mut self, provider: LlmProvider) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = Some(endpoint.to_string());
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    pub fn with_api_key(mut self, api_key: &str) -> Self {
        self.api_key = Some(api_key.to_string());
        self
    }

    /// Endpoint in effect, without a trailing slash.
    pub fn resolved_endpoint(&self) -> String {
        self.endpoint
            .as_deref()
            .unwrap_or(self.provider.default_endpoint())
            .trim_end_matches('/')
            .to_string()
    }

    /// Model id in effect.
    pub fn resolved_model(&self) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| self.provider.default_model().to_string())
    }

    pub fn requires_api_key(&self) -> bool {
        self.enabled && self.provider == LlmProvider::OpenRouter
    }
}

/// LLM client performing one request per call.
pub struct LlmClient {
    config: LlmConfig,
    model: String,
    endpoint: String,
    client: Client,
}

/// Ollama API request format.
#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    format: &'a str,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

/// Ollama API response format.
#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl LlmClient {
    /// Create a new LLM client with the given configuration.
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        if !config.enabled {
            return Err(LlmError::Disabled);
        }
        if config.requires_api_key() && config.api_key.as_deref().map_or(true, str::is_empty) {
            return Err(LlmError::MissingApiKey);
        }

        let client = Client::builder()
            .build()
            .map_err(|e| LlmError::Connection(e.to_string()))?;

        Ok(Self {
            model: config.resolved_model(),
            endpoint: config.resolved_endpoint(),
            config,
            client,
        })
    }

    /// Call the Ollama generate API with a prompt.
    async fn call_ollama(&self, prompt: &str, timeout: Duration) -> Result<String, LlmError> {
        let request = OllamaRequest {
            model: &self.model,
            prompt,
            stream: false,
            format: "json",
            options: OllamaOptions {
                temperature: self.config.temperature,
                num_predict: self.config.max_tokens,
            },
        };

        let url = format!("{}/api/generate", self.endpoint);
        let resp = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(LlmError::from_transport)?;

        let resp = check_status(resp).await?;
        let ollama_resp: OllamaResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        Ok(ollama_resp.response)
    }

    /// Call an OpenAI-compatible chat completions API with a prompt.
    async fn call_chat_completions(
        &self,
        prompt: &str,
        timeout: Duration,
    ) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let url = format!("{}/chat/completions", self.endpoint);
        let mut builder = self
            .client
            .post(&url)
            .timeout(timeout)
            .header("X-Title", "headcount")
            .json(&request);
        if let Some(key) = self.config.api_key.as_deref() {
            builder = builder.bearer_auth(key);
        }

        let resp = builder.send().await.map_err(LlmError::from_transport)?;
        let resp = check_status(resp).await?;
        let chat: ChatResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| LlmError::Parse("Empty completion response".to_string()))
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, LlmError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(LlmError::RateLimited(body));
    }
    Err(LlmError::Api {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl Completer for LlmClient {
    async fn complete(&self, prompt: &str, timeout: Duration) -> Result<String, LlmError> {
        debug!(
            provider = %self.config.provider,
            model = %self.model,
            prompt_len = prompt.len(),
            "Calling LLM"
        );
        match self.config.provider {
            LlmProvider::Ollama => self.call_ollama(prompt, timeout).await,
            LlmProvider::OpenRouter => self.call_chat_completions(prompt, timeout).await,
        }
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Errors that can occur during LLM operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    /// Failed to connect to LLM service
    Connection(String),
    /// Request did not finish in time
    Timeout(String),
    /// Provider answered 429
    RateLimited(String),
    /// API returned an error status
    Api { status: u16, body: String },
    /// Failed to parse response
    Parse(String),
    /// Provider needs a key and none was configured
    MissingApiKey,
    /// LLM is disabled
    Disabled,
}

impl LlmError {
    fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout(err.to_string())
        } else if err.is_decode() {
            LlmError::Parse(err.to_string())
        } else {
            LlmError::Connection(err.to_string())
        }
    }

    /// Tag this error for classification.
    pub fn to_failure(&self) -> Failure {
        let message = self.to_string();
        match self {
            LlmError::Connection(_) => Failure::tagged(ErrorKind::Network, message),
            LlmError::Timeout(_) => Failure::tagged(ErrorKind::Timeout, message),
            LlmError::RateLimited(_) => Failure::from_status(429, message),
            LlmError::Api { status, .. } => Failure::from_status(*status, message),
            LlmError::Parse(_) => Failure::tagged(ErrorKind::Parse, message),
            LlmError::MissingApiKey | LlmError::Disabled => {
                Failure::tagged(ErrorKind::Validation, message)
            }
        }
    }
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmError::Connection(msg) => write!(f, "Connection error: {}", msg),
            LlmError::Timeout(msg) => write!(f, "LLM request timed out: {}", msg),
            LlmError::RateLimited(msg) => write!(f, "LLM rate limited: {}", msg),
            LlmError::Api { status, body } => write!(f, "API error: HTTP {}: {}", status, body),
            LlmError::Parse(msg) => write!(f, "Parse error: {}", msg),
            LlmError::MissingApiKey => write!(f, "LLM API key is not configured"),
            LlmError::Disabled => write!(f, "LLM is disabled"),
        }
    }
}

impl std::error::Error for LlmError {}
