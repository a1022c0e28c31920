mod memory_cmds;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use awareness_config::AppConfig;
use awareness_llm::{LlmRouter, LmStudioClient, OllamaClient, Provider, ReasoningOracle};
use awareness_memory::{
    DreamingOptions, EmbedFn, ManagerOptions, MemoryManager, MemoryPaths, RecordKind,
    StoreOptions, WeightRule,
};

#[derive(Debug, Parser)]
#[command(
    name = "awareness",
    version,
    about = "Axis-scored conversational memory with offline dreaming"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "config/default.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Score and store one piece of text.
    Ingest {
        #[arg(long, value_enum, default_value = "turn")]
        kind: CliRecordKind,
        /// RFC 3339 timestamp of the turn; defaults to now.
        #[arg(long)]
        at: Option<String>,
        text: String,
    },
    /// Store user feedback on an assistant response.
    Feedback {
        #[arg(long)]
        input: String,
        #[arg(long)]
        output: String,
        text: String,
    },
    /// Run a dreaming cycle.  Without `--force` the memory threshold applies.
    Dream {
        #[arg(long)]
        force: bool,
    },
    /// Show store, dreaming and weight statistics.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List the most recent insights, newest first.
    Insights {
        #[arg(long, default_value_t = 5)]
        limit: usize,
        /// Print the full markdown dream report for each insight.
        #[arg(long)]
        report: bool,
    },
    /// List the most recent records, newest first.
    Recent {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Similarity search over stored records.
    Search {
        query: String,
        #[arg(short, long)]
        k: Option<usize>,
    },
    /// Show (or reset) the learned axis bias.
    Weights {
        #[arg(long)]
        reset: bool,
        #[arg(long)]
        yes: bool,
    },
    /// Keep running and dream automatically until Ctrl-C.
    Watch {
        /// Overrides `dreaming.check_interval_minutes`.
        #[arg(long)]
        interval_minutes: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliRecordKind {
    Turn,
    Reflection,
    Feedback,
}

impl From<CliRecordKind> for RecordKind {
    fn from(kind: CliRecordKind) -> Self {
        match kind {
            CliRecordKind::Turn => RecordKind::Turn,
            CliRecordKind::Reflection => RecordKind::Reflection,
            CliRecordKind::Feedback => RecordKind::Feedback,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Ingest { kind, at, text } => {
            let manager = open_manager(&config, None).await?;
            memory_cmds::run_ingest(&manager, kind.into(), at.as_deref(), &text).await?;
            memory_cmds::maybe_auto_dream(&manager, config.dreaming.auto_trigger).await
        }
        Commands::Feedback {
            input,
            output,
            text,
        } => {
            let manager = open_manager(&config, None).await?;
            memory_cmds::run_feedback(&manager, input, output, text).await?;
            memory_cmds::maybe_auto_dream(&manager, config.dreaming.auto_trigger).await
        }
        Commands::Dream { force } => {
            let manager = open_manager(&config, None).await?;
            memory_cmds::run_dream(&manager, force).await
        }
        Commands::Status { json } => {
            let manager = open_manager(&config, None).await?;
            memory_cmds::run_status(&manager, json).await
        }
        Commands::Insights { limit, report } => {
            let manager = open_manager(&config, None).await?;
            memory_cmds::run_insights(&manager, limit, report).await
        }
        Commands::Recent { limit } => {
            let manager = open_manager(&config, None).await?;
            memory_cmds::run_recent(&manager, limit).await
        }
        Commands::Search { query, k } => {
            let manager = open_manager(&config, None).await?;
            let k = k.unwrap_or(config.dreaming.retrieval_limit);
            memory_cmds::run_search(&manager, &query, k).await
        }
        Commands::Weights { reset, yes } => {
            let manager = open_manager(&config, None).await?;
            memory_cmds::run_weights(&manager, reset, yes).await
        }
        Commands::Watch { interval_minutes } => {
            let minutes = interval_minutes
                .unwrap_or(config.dreaming.check_interval_minutes)
                .max(1);
            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            let manager = open_manager(&config, Some(shutdown_rx)).await?;
            memory_cmds::run_watch(&manager, Duration::from_secs(minutes * 60), shutdown_tx).await
        }
    }
}

fn build_oracle(config: &AppConfig) -> Arc<dyn ReasoningOracle> {
    let token = Some(config.llm.api_token.clone()).filter(|t| !t.trim().is_empty());
    Arc::new(LlmRouter::new(
        Provider::from_label(&config.llm.provider),
        config.llm.model.clone(),
        config.llm.openrouter_model.clone(),
        LmStudioClient::new(config.llm.lmstudio_base_url.clone(), token),
        OllamaClient::new(config.llm.ollama_base_url.clone()),
    ))
}

fn manager_options(config: &AppConfig) -> ManagerOptions {
    let dreaming = &config.dreaming;
    ManagerOptions {
        store: StoreOptions {
            embedding_dim: config.memory.embedding_dim.max(1),
            duplicate_window: Duration::from_secs(config.memory.duplicate_window_secs),
            scoring_context_turns: config.memory.scoring_context_turns,
        },
        dreaming: DreamingOptions {
            memory_threshold: dreaming.memory_threshold,
            batch_limit: dreaming.batch_limit.max(1),
            oracle_timeout: Duration::from_secs(dreaming.oracle_timeout_secs.max(1)),
            temperature: config.llm.synthesis_temperature,
            mark_retry_initial: Duration::from_millis(dreaming.mark_retry_initial_ms.max(1)),
            mark_retry_max: Duration::from_millis(dreaming.mark_retry_max_ms.max(1)),
        },
        weight_rule: WeightRule {
            learning_rate: dreaming.weight_learning_rate,
            max_bias: dreaming.max_axis_bias,
        },
        classify_temperature: config.llm.classify_temperature,
        scoring_timeout: Duration::from_secs(config.memory.scoring_timeout_secs.max(1)),
        embed_fn: None,
        shutdown: None,
    }
}

async fn open_manager(
    config: &AppConfig,
    shutdown: Option<tokio::sync::watch::Receiver<bool>>,
) -> Result<MemoryManager> {
    let mut options = manager_options(config);
    options.shutdown = shutdown;
    let embed_model = config.llm.embedding_model.trim();
    if !embed_model.is_empty() {
        options.embed_fn = Some(make_ollama_embed_fn(embed_model, &config.llm.ollama_base_url));
        info!(model = %embed_model, "embedding backend configured");
    }
    let paths = MemoryPaths::under(config.data_dir());
    Ok(MemoryManager::open(&paths, build_oracle(config), options).await?)
}

type EmbedFuture = Pin<Box<dyn Future<Output = Option<Vec<f32>>> + Send>>;

/// Embedding backend backed by Ollama.  A failed request yields `None`, and
/// the store falls back to its local hashed embedding.
fn make_ollama_embed_fn(model: &str, base_url: &str) -> EmbedFn {
    let model = model.to_string();
    let base_url = base_url.to_string();
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap_or_default();

    Arc::new(move |text: String| -> EmbedFuture {
        let client = client.clone();
        let base_url = base_url.clone();
        let model = model.clone();
        Box::pin(async move {
            awareness_llm::ollama_embeddings(&client, &base_url, &model, &text)
                .await
                .ok()
                .filter(|embedding| !embedding.is_empty())
        })
    })
}
