use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use g2b_adapters::FixtureNoticeSource;
use g2b_storage::{NoticeStore, StoreOptions};
use g2b_sync::{run_until_shutdown, IngestConfig, IngestPipeline, RunSummary};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_DATABASE_URL: &str = "sqlite://bids_raw.db";

#[derive(Debug, Parser)]
#[command(name = "g2b-cli")]
#[command(about = "Collects G2B bid notices into a local SQLite store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion cycle and exit.
    Sync {
        /// Replay recorded API pages (`page-1.json`, ...) instead of calling the portal.
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
    /// Run a cycle now, then keep running on the configured schedule until Ctrl-C.
    Watch,
    /// Create or upgrade the notice store schema.
    Migrate,
    /// Serve the read-only notice browser.
    Serve,
    /// Print the most recent ingestion runs.
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

fn database_url() -> String {
    std::env::var("DATABASE_URL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { fixtures: None }) {
        Commands::Sync { fixtures: None } => {
            let config = IngestConfig::from_env().context("loading configuration")?;
            let pipeline = IngestPipeline::connect(config).await?;
            report(pipeline.run_once().await)?;
        }
        Commands::Sync {
            fixtures: Some(dir),
        } => {
            // Offline replay never talks to the portal, so the key is optional.
            let config = IngestConfig::from_lookup(|key| {
                std::env::var(key)
                    .ok()
                    .or_else(|| (key == "G2B_API_KEY").then(|| "offline-replay".to_string()))
            })
            .context("loading configuration")?;
            info!(fixtures = %dir.display(), "replaying recorded pages");
            let source = Arc::new(FixtureNoticeSource::new(dir));
            let pipeline = IngestPipeline::connect_with_source(config, source).await?;
            report(pipeline.run_once().await)?;
        }
        Commands::Watch => {
            let config = IngestConfig::from_env().context("loading configuration")?;
            let pipeline = Arc::new(IngestPipeline::connect(config).await?);
            run_until_shutdown(pipeline, async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;
        }
        Commands::Migrate => {
            let url = database_url();
            let store = NoticeStore::open(&url, &StoreOptions::default()).await?;
            store.migrate().await?;
            println!("migrations applied to {url}");
        }
        Commands::Serve => {
            g2b_web::serve_from_env().await?;
        }
        Commands::Runs { limit } => {
            let url = database_url();
            let store = NoticeStore::open_read_only(&url, &StoreOptions::default()).await?;
            for run in store.recent_runs(limit).await? {
                println!(
                    "{} {} window=[{} .. {}] pages={} fetched={} written={} watermark={} {}",
                    run.started_at.format("%Y-%m-%dT%H:%M:%SZ"),
                    run.status,
                    run.window_start.format("%Y%m%d%H%M"),
                    run.window_end.format("%Y%m%d%H%M"),
                    run.pages,
                    run.fetched,
                    run.written,
                    run.watermark_after.as_deref().unwrap_or("-"),
                    run.error.as_deref().unwrap_or(""),
                );
            }
        }
    }

    Ok(())
}

fn report(summary: RunSummary) -> Result<()> {
    println!(
        "sync {}: run_id={} window={} pages={} fetched={} written={} watermark={}",
        summary.status(),
        summary.run_id,
        summary.window,
        summary.pages,
        summary.fetched,
        summary.written,
        summary
            .watermark_after
            .map(|cp| cp.to_string())
            .unwrap_or_else(|| "none".to_string()),
    );
    if let Some(err) = summary.error {
        bail!(err);
    }
    Ok(())
}
