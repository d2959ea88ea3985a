mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use strata::{InteractionType, MemoryEngine, StrataConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "strata", version, about = "Context-aware semantic memory engine")]
struct Cli {
    /// Config file (default: ~/.strata/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the background jobs (sync, optimize, cluster, evict) until interrupted
    Serve,
    /// Store one memory
    Store {
        #[arg(long)]
        project: String,
        content: String,
        #[arg(long, default_value = "conversation")]
        kind: InteractionType,
        /// File paths the memory relates to
        #[arg(long = "file")]
        files: Vec<String>,
        /// Tools used, in order
        #[arg(long = "tool")]
        tools: Vec<String>,
        #[arg(long)]
        success: Option<f32>,
        #[arg(long)]
        language: Option<String>,
    },
    /// Search a project's memories
    Search {
        #[arg(long)]
        project: String,
        query: String,
        #[arg(long)]
        limit: Option<usize>,
        /// File currently being edited, for context boosting
        #[arg(long)]
        file: Option<String>,
    },
    /// Show memory statistics
    Stats {
        #[arg(long)]
        project: Option<String>,
    },
    /// Run database diagnostics
    Doctor,
    /// Push pending writes to the remote tier
    Sync,
    /// Enforce storage budgets: prune, merge, compress
    Optimize {
        #[arg(long)]
        project: Option<String>,
    },
    /// Recompute topic clusters
    Cluster {
        #[arg(long)]
        project: Option<String>,
    },
    /// List or requeue dead-lettered sync items
    DeadLetters {
        #[arg(long)]
        requeue: bool,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => StrataConfig::load_from(path)?,
        None => StrataConfig::load()?,
    };

    // Log to stderr so stdout stays clean for command output.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve => serve(config).await?,
        Command::Store {
            project,
            content,
            kind,
            files,
            tools,
            success,
            language,
        } => {
            cli::search::store(
                &config,
                cli::search::StoreArgs {
                    project: &project,
                    content: &content,
                    kind,
                    files,
                    tools,
                    success,
                    language,
                },
            )
            .await?
        }
        Command::Search {
            project,
            query,
            limit,
            file,
        } => cli::search::search(&config, &project, &query, limit, file).await?,
        Command::Stats { project } => cli::stats::stats(&config, project.as_deref()).await?,
        Command::Doctor => cli::doctor::doctor(&config).await?,
        Command::Sync => cli::maintenance::sync(&config).await?,
        Command::Optimize { project } => {
            cli::maintenance::optimize(&config, project.as_deref()).await?
        }
        Command::Cluster { project } => {
            cli::maintenance::cluster(&config, project.as_deref()).await?
        }
        Command::DeadLetters { requeue, limit } => {
            cli::maintenance::dead_letters(&config, requeue, limit).await?
        }
    }

    Ok(())
}

async fn serve(config: StrataConfig) -> Result<()> {
    let engine = Arc::new(MemoryEngine::open(config).await?);
    let scheduler = engine.start_background();

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    scheduler.shutdown().await;

    if let Some(report) = engine.run_sync_cycle().await? {
        tracing::info!(synced = report.synced, failed = report.failed, "final sync cycle");
    }
    Ok(())
}
