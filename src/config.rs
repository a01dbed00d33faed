//! Configuration management for headcount using the prefer crate.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::{LlmConfig, LlmProvider};
use crate::pipeline::PipelineConfig;
use crate::scrapers::{RateLimitConfig, RateLimiter, FETCH_RESOURCE, LLM_RESOURCE};

/// Settings that cannot be run with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be at least {min}, got {value}")]
    TooSmall {
        field: &'static str,
        min: u64,
        value: u64,
    },
    #[error("rate limit '{resource}' needs max_requests >= 1 and window_ms >= 1")]
    InvalidRateLimit { resource: String },
    #[error("LLM provider {provider} requires an API key; set OPENROUTER_API_KEY or disable the LLM stage")]
    MissingApiKey { provider: LlmProvider },
}

/// Application settings.
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    /// Base data directory.
    pub data_dir: PathBuf,
    /// Database filename, or an absolute path.
    pub database_filename: String,
    /// Directory for results files.
    pub output_dir: PathBuf,
    /// User agent config: None for the default, "impersonate", or a literal string.
    pub user_agent: Option<String>,
    /// Companies processed at the same time.
    pub max_concurrent: usize,
    pub fetch_timeout_ms: u64,
    pub llm_timeout_ms: u64,
    /// Retries of one source after its first failed fetch.
    pub retry_count: u32,
    pub retry_base_delay_ms: u64,
    pub max_backoff_ms: u64,
    /// Rate-limited retries of one source before moving on.
    pub rate_limit_retries: u32,
    pub rate_limit_base_delay_ms: u64,
    pub llm_retries: u32,
    /// Errors after which a company is abandoned.
    pub error_abort_threshold: u32,
    /// Characters of context kept around a pattern match.
    pub context_radius: usize,
    /// Per-resource sliding window limits.
    pub rate_limits: HashMap<String, RateLimitConfig>,
    /// Added to every computed rate limit wait.
    pub rate_limit_margin_ms: u64,
    pub llm: LlmConfig,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
            .join("headcount");

        let mut rate_limits = HashMap::new();
        rate_limits.insert(FETCH_RESOURCE.to_string(), RateLimitConfig::fetch_default());
        rate_limits.insert(LLM_RESOURCE.to_string(), RateLimitConfig::llm_default());

        Self {
            output_dir: data_dir.join("output"),
            data_dir,
            database_filename: "headcount.db".to_string(),
            user_agent: None,
            max_concurrent: 3,
            fetch_timeout_ms: 30_000,
            llm_timeout_ms: 60_000,
            retry_count: 3,
            retry_base_delay_ms: 1000,
            max_backoff_ms: 60_000,
            rate_limit_retries: 3,
            rate_limit_base_delay_ms: 5000,
            llm_retries: 2,
            error_abort_threshold: 5,
            context_radius: 50,
            rate_limits,
            rate_limit_margin_ms: 1000,
            llm: LlmConfig::default(),
        }
    }
}

impl Settings {
    /// Create settings with a custom data directory.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            output_dir: data_dir.join("output"),
            data_dir,
            ..Default::default()
        }
    }

    /// Get the full path to the database.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_filename)
    }

    /// Check the settings can drive a run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let at_least = |field: &'static str, min: u64, value: u64| {
            if value < min {
                Err(ConfigError::TooSmall { field, min, value })
            } else {
                Ok(())
            }
        };
        at_least("max_concurrent", 1, self.max_concurrent as u64)?;
        at_least("fetch_timeout_ms", 1000, self.fetch_timeout_ms)?;
        at_least("error_abort_threshold", 1, u64::from(self.error_abort_threshold))?;

        let mut resources: Vec<&String> = self.rate_limits.keys().collect();
        resources.sort();
        for resource in resources {
            let limit = &self.rate_limits[resource];
            if limit.max_requests == 0 || limit.window_ms == 0 {
                return Err(ConfigError::InvalidRateLimit {
                    resource: resource.clone(),
                });
            }
        }

        if self.llm.requires_api_key() && self.llm.api_key.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::MissingApiKey {
                provider: self.llm.provider,
            });
        }
        Ok(())
    }

    /// Retry and timeout settings for company pipelines.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            max_retries: self.retry_count,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            rate_limit_retries: self.rate_limit_retries,
            rate_limit_base_delay: Duration::from_millis(self.rate_limit_base_delay_ms),
            fetch_timeout: Duration::from_millis(self.fetch_timeout_ms),
            llm_timeout: Duration::from_millis(self.llm_timeout_ms),
            llm_retries: self.llm_retries,
            error_abort_threshold: self.error_abort_threshold,
            ..PipelineConfig::default()
        }
    }

    /// A limiter configured with every rate limit in these settings.
    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::from_limits(
            &self.rate_limits,
            Duration::from_millis(self.rate_limit_margin_ms),
        )
    }
}

/// Configuration file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Target directory for data.
    #[serde(default)]
    pub target: Option<String>,
    /// Database filename or path.
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    #[serde(default)]
    pub fetch_timeout_ms: Option<u64>,
    #[serde(default)]
    pub llm_timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry_count: Option<u32>,
    #[serde(default)]
    pub retry_base_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_backoff_ms: Option<u64>,
    #[serde(default)]
    pub rate_limit_retries: Option<u32>,
    #[serde(default)]
    pub rate_limit_base_delay_ms: Option<u64>,
    #[serde(default)]
    pub llm_retries: Option<u32>,
    #[serde(default)]
    pub error_abort_threshold: Option<u32>,
    #[serde(default)]
    pub context_radius: Option<usize>,
    #[serde(default)]
    pub rate_limit_margin_ms: Option<u64>,
    /// Per-resource limits; entries replace the defaults for that resource.
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitConfig>,
    #[serde(default)]
    pub llm: Option<LlmConfig>,
}

impl Config {
    /// Load configuration using prefer crate.
    /// Automatically discovers headcount config files in standard locations.
    pub async fn load() -> Self {
        match prefer::load("headcount").await {
            Ok(pref_config) => Config {
                target: pref_config.get("target").await.ok(),
                database: pref_config.get("database").await.ok(),
                output_dir: pref_config.get("output_dir").await.ok(),
                user_agent: pref_config.get("user_agent").await.ok(),
                max_concurrent: pref_config.get("max_concurrent").await.ok(),
                fetch_timeout_ms: pref_config.get("fetch_timeout_ms").await.ok(),
                llm_timeout_ms: pref_config.get("llm_timeout_ms").await.ok(),
                retry_count: pref_config.get("retry_count").await.ok(),
                retry_base_delay_ms: pref_config.get("retry_base_delay_ms").await.ok(),
                max_backoff_ms: pref_config.get("max_backoff_ms").await.ok(),
                rate_limit_retries: pref_config.get("rate_limit_retries").await.ok(),
                rate_limit_base_delay_ms: pref_config.get("rate_limit_base_delay_ms").await.ok(),
                llm_retries: pref_config.get("llm_retries").await.ok(),
                error_abort_threshold: pref_config.get("error_abort_threshold").await.ok(),
                context_radius: pref_config.get("context_radius").await.ok(),
                rate_limit_margin_ms: pref_config.get("rate_limit_margin_ms").await.ok(),
                rate_limits: pref_config.get("rate_limits").await.unwrap_or_default(),
                llm: pref_config.get("llm").await.ok(),
            },
            Err(_) => {
                // No config file found, use defaults
                Self::default()
            }
        }
    }

    /// Apply configuration to settings.
    pub fn apply_to_settings(&self, settings: &mut Settings) {
        if let Some(ref target) = self.target {
            let path = shellexpand::tilde(target);
            settings.data_dir = PathBuf::from(path.as_ref());
            settings.output_dir = settings.data_dir.join("output");
        }
        if let Some(ref database) = self.database {
            settings.database_filename = shellexpand::tilde(database).into_owned();
        }
        if let Some(ref output_dir) = self.output_dir {
            settings.output_dir = PathBuf::from(shellexpand::tilde(output_dir).as_ref());
        }
        if let Some(ref user_agent) = self.user_agent {
            settings.user_agent = Some(user_agent.clone());
        }
        if let Some(max) = self.max_concurrent {
            settings.max_concurrent = max;
        }
        if let Some(timeout) = self.fetch_timeout_ms {
            settings.fetch_timeout_ms = timeout;
        }
        if let Some(timeout) = self.llm_timeout_ms {
            settings.llm_timeout_ms = timeout;
        }
        if let Some(retries) = self.retry_count {
            settings.retry_count = retries;
        }
        if let Some(delay) = self.retry_base_delay_ms {
            settings.retry_base_delay_ms = delay;
        }
        if let Some(max) = self.max_backoff_ms {
            settings.max_backoff_ms = max;
        }
        if let Some(retries) = self.rate_limit_retries {
            settings.rate_limit_retries = retries;
        }
        if let Some(delay) = self.rate_limit_base_delay_ms {
            settings.rate_limit_base_delay_ms = delay;
        }
        if let Some(retries) = self.llm_retries {
            settings.llm_retries = retries;
        }
        if let Some(threshold) = self.error_abort_threshold {
            settings.error_abort_threshold = threshold;
        }
        if let Some(radius) = self.context_radius {
            settings.context_radius = radius;
        }
        if let Some(margin) = self.rate_limit_margin_ms {
            settings.rate_limit_margin_ms = margin;
        }
        for (resource, limit) in &self.rate_limits {
            settings.rate_limits.insert(resource.clone(), *limit);
        }
        if let Some(ref llm) = self.llm {
            settings.llm = llm.clone();
        }
    }
}

/// Load settings from configuration (async version).
pub async fn load_settings() -> Settings {
    let config = Config::load().await;
    let mut settings = Settings::default();
    config.apply_to_settings(&mut settings);
    settings
}
