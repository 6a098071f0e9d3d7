//! Session broker tool server.
//!
//! Reads JSON Lines tool requests on stdin and writes responses on stdout.
//! Logs go to stderr; set `RUST_LOG` to adjust verbosity.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use session_broker_core::BrokerConfig;
use session_broker_executor::CommandExecutor;
use session_broker_session::{OpenAiGenerator, SessionManager, Summarizer, storage::FsStorage};
use session_broker_transport::{ToolDispatcher, stdio};
use tokio::io::BufReader;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long to let the summary worker finish queued jobs on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "session-broker")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Session-scoped command and file broker over stdio", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the storage root directory
    #[arg(long)]
    root: Option<PathBuf>,

    /// Run without background summaries
    #[arg(long)]
    no_summaries: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config =
        BrokerConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(root) = cli.root {
        config.storage_root = root;
    }

    let storage = Arc::new(
        FsStorage::from_config(&config)
            .await
            .with_context(|| format!("failed to open storage at {}", config.storage_root.display()))?,
    );
    tracing::info!(root = %config.storage_root.display(), "Storage ready");

    let mut manager = SessionManager::new(storage, CommandExecutor::new())
        .with_history_chars(config.history.max_chars)
        .with_default_timeout(Duration::from_secs_f64(config.run.default_timeout_secs));

    let worker = if config.summary.enabled && !cli.no_summaries {
        let generator = OpenAiGenerator::from_config(&config.llm)
            .context("failed to build text generation client")?;
        let summarizer = Summarizer::new(Arc::new(generator), config.llm.model.clone());
        tracing::info!(model = %config.llm.model, url = %config.llm.base_url, "Summaries enabled");
        Some(manager.enable_summaries(summarizer, &config.summary).spawn())
    } else {
        tracing::info!("Summaries disabled");
        None
    };

    let dispatcher = ToolDispatcher::new(Arc::new(manager));
    stdio::serve(dispatcher, BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await
        .context("transport failed")?;

    if let Some(worker) = worker {
        if tokio::time::timeout(DRAIN_TIMEOUT, worker).await.is_err() {
            tracing::warn!("Summary worker did not drain in time, exiting");
        }
    }

    Ok(())
}
