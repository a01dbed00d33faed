use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use headcount::config::{load_settings, Settings};
use headcount::extract::RegexExtractor;
use headcount::llm::{LlmClient, LlmExtractor, LlmProvider};
use headcount::pipeline::{Orchestrator, PipelineContext, PipelineOutcome, RunEvent};
use headcount::report::{write_results_file, RunSummary};
use headcount::repository::{EvidenceSink, MemoryEvidenceStore, SqliteEvidenceStore};
use headcount::scrapers::HttpFetcher;
use headcount::sources::{load_companies, load_urls, prioritize};

#[derive(Parser)]
#[command(name = "headcount", version, about = "Find employee headcounts on company web pages")]
struct Cli {
    /// Log filter, e.g. "debug" or "headcount=trace"
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract headcounts for every company in the input files
    Extract {
        /// Companies CSV (id,name)
        #[arg(long)]
        companies: PathBuf,
        /// Source URLs CSV (company_id,url,type,priority)
        #[arg(long)]
        urls: PathBuf,
        /// Keep evidence in memory instead of the SQLite database
        #[arg(long)]
        memory: bool,
    },
    /// Print the effective configuration
    Config,
}

/// Settings taken from flags or the environment, applied over the config file.
#[derive(Args)]
struct Overrides {
    /// SQLite evidence database
    #[arg(long = "db", global = true, env = "DB_PATH")]
    database: Option<PathBuf>,
    /// Directory for results files
    #[arg(long = "output", global = true, env = "OUTPUT_DIR")]
    output_dir: Option<PathBuf>,
    #[arg(long, global = true, env = "MAX_CONCURRENT_REQUESTS")]
    max_concurrent: Option<usize>,
    #[arg(long, global = true, env = "REQUEST_TIMEOUT_MS")]
    request_timeout_ms: Option<u64>,
    #[arg(long, global = true, env = "LLM_TIMEOUT_MS")]
    llm_timeout_ms: Option<u64>,
    #[arg(long, global = true, env = "RETRY_COUNT")]
    retry_count: Option<u32>,
    /// openrouter or ollama
    #[arg(long, global = true, env = "LLM_PROVIDER")]
    llm_provider: Option<String>,
    #[arg(long, global = true, env = "OPENROUTER_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    #[arg(long, global = true, env = "OPENROUTER_MODEL_ID")]
    openrouter_model: Option<String>,
    #[arg(long, global = true, env = "OLLAMA_MODEL")]
    ollama_model: Option<String>,
    #[arg(long, global = true, env = "OLLAMA_BASE_URL")]
    ollama_base_url: Option<String>,
    /// Skip the language model stage
    #[arg(long, global = true)]
    no_llm: bool,
}

impl Overrides {
    fn apply(&self, settings: &mut Settings) -> Result<()> {
        if let Some(ref database) = self.database {
            // Relative to the working directory, not the data directory
            let database = std::path::absolute(database).unwrap_or_else(|_| database.clone());
            settings.database_filename = database.to_string_lossy().into_owned();
        }
        if let Some(ref output_dir) = self.output_dir {
            settings.output_dir = output_dir.clone();
        }
        if let Some(max) = self.max_concurrent {
            settings.max_concurrent = max;
        }
        if let Some(timeout) = self.request_timeout_ms {
            settings.fetch_timeout_ms = timeout;
        }
        if let Some(timeout) = self.llm_timeout_ms {
            settings.llm_timeout_ms = timeout;
        }
        if let Some(retries) = self.retry_count {
            settings.retry_count = retries;
        }
        if let Some(ref provider) = self.llm_provider {
            match LlmProvider::from_str(provider) {
                Some(provider) => settings.llm.provider = provider,
                None => bail!("unknown LLM provider '{provider}' (expected openrouter or ollama)"),
            }
        }
        if let Some(ref key) = self.api_key {
            settings.llm.api_key = Some(key.clone());
        }
        let model = match settings.llm.provider {
            LlmProvider::OpenRouter => self.openrouter_model.as_ref(),
            LlmProvider::Ollama => self.ollama_model.as_ref(),
        };
        if let Some(model) = model {
            settings.llm.model = Some(model.clone());
        }
        if settings.llm.provider == LlmProvider::Ollama {
            if let Some(ref url) = self.ollama_base_url {
                settings.llm.endpoint = Some(url.clone());
            }
        }
        if self.no_llm {
            settings.llm.enabled = false;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(&cli.log_level))
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut settings = load_settings().await;
    cli.overrides.apply(&mut settings)?;

    match cli.command {
        Commands::Extract {
            companies,
            urls,
            memory,
        } => extract(settings, companies, urls, memory).await,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            if let Err(e) = settings.validate() {
                println!("{} {}", style("invalid:").red(), e);
            }
            Ok(())
        }
    }
}

async fn extract(settings: Settings, companies: PathBuf, urls: PathBuf, memory: bool) -> Result<()> {
    settings.validate().context("Invalid configuration")?;

    let companies = load_companies(&companies)?;
    let urls = load_urls(&urls)?;
    let jobs = prioritize(&companies, &urls).context("Input files do not agree")?;
    info!(companies = companies.len(), urls = urls.len(), "Loaded input");

    let limiter = settings.rate_limiter();
    let pipeline_config = settings.pipeline_config();
    let fetcher = HttpFetcher::new(settings.user_agent.as_deref())
        .context("Failed to build HTTP client")?;
    let sink: Arc<dyn EvidenceSink> = if memory {
        Arc::new(MemoryEvidenceStore::new())
    } else {
        let path = settings.database_path();
        info!(path = %path.display(), "Opening evidence database");
        Arc::new(SqliteEvidenceStore::open(&path).context("Failed to open evidence database")?)
    };

    let mut ctx = PipelineContext::new(pipeline_config.clone(), Arc::new(fetcher), sink)
        .with_limiter(limiter.clone())
        .with_regex(RegexExtractor::new(settings.context_radius));
    if settings.llm.enabled {
        let client = LlmClient::new(settings.llm.clone()).context("Failed to configure LLM client")?;
        info!(provider = %settings.llm.provider, model = %settings.llm.resolved_model(), "LLM fallback enabled");
        let extractor = LlmExtractor::new(Arc::new(client), limiter.clone())
            .with_max_input_chars(settings.llm.max_content_chars)
            .with_timeout(pipeline_config.llm_timeout, pipeline_config.timeout_grace);
        ctx = ctx.with_llm(extractor);
    } else {
        warn!("LLM fallback disabled; only label patterns will be used");
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let progress = tokio::spawn(show_progress(rx));
    let orchestrator = Orchestrator::new(ctx).with_events(tx);
    let reports = orchestrator.run_all(jobs, settings.max_concurrent).await;

    let errors = orchestrator.context().budget.statistics();
    drop(orchestrator);
    progress.await.ok();

    for (resource, stats) in limiter.all_stats().await {
        info!(
            resource = %resource,
            admitted = stats.total_admitted,
            waits = stats.total_waits,
            "Rate limit usage"
        );
    }
    info!(
        total = errors.total,
        companies = errors.companies,
        by_kind = ?errors.by_kind,
        "Errors recorded"
    );

    let path = write_results_file(&settings.output_dir, &reports)?;
    RunSummary::of(&reports).print();
    println!("Results written to {}", style(path.display()).cyan());
    Ok(())
}

/// Drive a progress bar from run events until the sender is dropped.
async fn show_progress(mut rx: mpsc::UnboundedReceiver<RunEvent>) {
    let mut pb: Option<ProgressBar> = None;
    while let Some(event) = rx.recv().await {
        match event {
            RunEvent::Started { total } => pb = Some(create_progress_bar(total as u64)),
            RunEvent::CompanyStarted { name, .. } => {
                if let Some(ref pb) = pb {
                    pb.set_message(name);
                }
            }
            RunEvent::CompanyFinished {
                name,
                outcome,
                value,
                ..
            } => {
                if let Some(ref pb) = pb {
                    pb.inc(1);
                    match (outcome, value) {
                        (PipelineOutcome::Done, Some(value)) => {
                            pb.println(format!("  {} {name}: {value}", style("✓").green()))
                        }
                        (PipelineOutcome::Aborted { reason }, _) => {
                            pb.println(format!("  {} {name}: {reason}", style("✗").red()))
                        }
                        (PipelineOutcome::Failed { reason }, _) => {
                            pb.println(format!("  {} {name}: {reason}", style("-").yellow()))
                        }
                        (outcome, None) => pb.println(format!("  {name}: {}", outcome.label())),
                    }
                }
            }
            RunEvent::Complete { .. } => {
                if let Some(pb) = pb.take() {
                    pb.finish_and_clear();
                }
            }
        }
    }
}

fn create_progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.green/dim}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░"),
    );
    pb
}
