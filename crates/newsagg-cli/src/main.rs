use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use newsagg_core::RunRecord;
use newsagg_storage::PgStore;
use newsagg_sync::{IngestPipeline, PipelineConfig, SourceRegistry};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "newsagg")]
#[command(about = "News ingestion pipeline")]
struct Cli {
    /// Source registry path (overrides NEWSAGG_SOURCES).
    #[arg(long, global = true)]
    sources: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one source now, or every enabled source when none is given.
    Run { source_id: Option<String> },
    /// Arm per-source timers and run until interrupted.
    Schedule,
    /// List configured sources and any rejected entries.
    Sources,
    /// Show stored articles for a source.
    Articles {
        source_id: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show recent run records for a source.
    Runs {
        source_id: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Create the article and run tables in DATABASE_URL.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env();
    if let Some(path) = cli.sources {
        config.sources_path = path;
    }

    match cli.command.unwrap_or(Commands::Run { source_id: None }) {
        Commands::Run { source_id } => {
            let pipeline = IngestPipeline::build(config).await?;
            let records = match source_id {
                Some(source_id) => vec![pipeline.run_source(&source_id).await?],
                None => pipeline.run_all().await,
            };
            for record in &records {
                print_record(record);
            }
            pipeline.shutdown().await;
        }
        Commands::Schedule => {
            let pipeline = IngestPipeline::build(config).await?;
            pipeline.start().await?;
            info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("stop requested; waiting for in-flight runs");
            pipeline.shutdown().await;
        }
        Commands::Sources => {
            let registry = SourceRegistry::load(&config.sources_path).await?;
            for source in &registry.sources {
                println!(
                    "{:<16} adapter={:<12} every={:<6} cron={} enabled={}",
                    source.source_id,
                    source.adapter,
                    source.interval.to_string(),
                    source.cron.as_deref().unwrap_or("-"),
                    source.enabled
                );
            }
            for rejected in &registry.rejected {
                println!("rejected: {rejected}");
            }
        }
        Commands::Articles { source_id, limit } => {
            let pipeline = IngestPipeline::build(config).await?;
            for article in pipeline.articles(&source_id).await?.iter().take(limit) {
                println!("{}", serde_json::to_string(article)?);
            }
        }
        Commands::Runs { source_id, limit } => {
            let pipeline = IngestPipeline::build(config).await?;
            for record in pipeline.runs(&source_id, limit).await? {
                print_record(&record);
            }
        }
        Commands::Migrate => {
            let Some(url) = config.database_url else {
                bail!("DATABASE_URL must be set to migrate");
            };
            let store = PgStore::connect(&url).await.context("connecting to postgres")?;
            store.ensure_schema().await.context("creating schema")?;
            println!("schema ready");
        }
    }

    Ok(())
}

fn print_record(record: &RunRecord) {
    let c = record.counts;
    println!(
        "run {} source={} outcome={} discovered={} fetched={} new={} updated={} duplicate={} rejected={} skipped={}{}",
        record.run_id,
        record.source_id,
        record.outcome.as_str(),
        c.discovered,
        c.fetched,
        c.new,
        c.updated,
        c.duplicate,
        c.rejected,
        c.skipped,
        record
            .error_summary
            .as_deref()
            .map(|e| format!(" error=\"{e}\""))
            .unwrap_or_default()
    );
}
