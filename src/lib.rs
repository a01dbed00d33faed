//! headcount: employee headcount discovery from prioritized company web sources.
//!
//! Each company's candidate URLs are walked in priority order. Pages are read
//! with label patterns first and a language model second, and every company
//! ends with exactly one evidence record.

pub mod config;
pub mod error;
pub mod extract;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod report;
pub mod repository;
pub mod scrapers;
pub mod sources;

pub use config::{load_settings, Config, ConfigError, Settings};
pub use error::{classify, ErrorKind, Failure};
pub use models::{Company, Evidence, ExtractionCandidate, ExtractionMethod, SourceType, SourceUrl};
pub use pipeline::{Orchestrator, PipelineConfig, PipelineContext, PipelineOutcome};
