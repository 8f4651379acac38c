//! News Aggregator
//!
//! Single-binary pipeline that:
//! 1. Selects due topics from the rotation schedule
//! 2. Discovers articles per topic through the quota governor
//! 3. Summarizes each topic's articles with an LLM
//! 4. Publishes one JSON digest per topic under the output directory
//!
//! Admin subcommands inspect quota and cache state without spending
//! any of the daily request budget.

mod config;
mod discovery;
mod pipeline;
mod summarize;

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use governance::{Governor, QuotaStatus};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::pipeline::{LocalJsonPublisher, Pipeline};

#[derive(Parser)]
#[command(name = "news-aggregator", version, about = "Quota-governed news aggregation pipeline")]
struct Cli {
    /// Path to the TOML config file (or set AGGREGATOR_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one aggregation cycle (the default)
    Run,
    /// Show quota and cache state without calling upstream
    Status,
    /// Cache maintenance
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Quota maintenance
    Quota {
        #[command(subcommand)]
        action: QuotaAction,
    },
}

#[derive(Debug, Subcommand)]
enum CacheAction {
    /// Delete every cached response
    Clear,
    /// Delete only expired cached responses
    Cleanup,
}

#[derive(Debug, Subcommand)]
enum QuotaAction {
    /// Start a fresh daily counter
    Reset {
        /// Reset even if the counter is from today
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let cli = Cli::parse();
    let config_path = Config::resolve_path(cli.config.as_deref());
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Status => status(config).await,
        Command::Cache { action } => cache_admin(config, action).await,
        Command::Quota { action } => quota_admin(config, action).await,
    }
}

async fn run(config: Config) -> Result<()> {
    info!(
        discovery_url = %config.discovery.base_url,
        topics = config.topics.available.len(),
        discovery_keys = config.discovery.keys.len(),
        summarization = config.summary.enabled,
        "starting news-aggregator"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let publisher = LocalJsonPublisher::new(config.output_dir.clone());
    let pipeline = Pipeline::new(config, publisher, shutdown_rx)
        .await
        .context("failed to assemble pipeline")?;

    let report = pipeline.run_cycle().await;

    let quota = pipeline.governor().quota_status().await;
    info!(
        requests_made = quota.requests_made,
        daily_limit = quota.daily_limit,
        remaining = quota.remaining,
        "quota after cycle"
    );

    if report.completed == 0 && report.failed > 0 {
        anyhow::bail!("all {} scheduled topics failed", report.failed);
    }
    Ok(())
}

async fn status(config: Config) -> Result<()> {
    let governor = Governor::new(config.discovery_governor(), config.discovery.keys.clone()).await?;
    let quota = governor.quota_status().await;
    let cache = governor.cache_stats().await;

    println!("Quota for {}", quota.date);
    println!("  requests made:    {}/{}", quota.requests_made, quota.daily_limit);
    println!("  remaining:        {}", quota.remaining);
    println!("  used:             {:.1}%", quota.percentage_used);
    println!("  topics processed: {}", quota.topics_processed.len());
    if let Some(projected) = project_daily_usage(&quota, epoch_secs()) {
        if projected > quota.daily_limit {
            println!(
                "  projected:        {projected} by midnight, over the {} limit",
                quota.daily_limit
            );
        } else {
            println!("  projected:        {projected} by midnight");
        }
    }

    println!("Cache ({})", if cache.enabled { "enabled" } else { "disabled" });
    println!(
        "  entries: {} files, {} articles",
        cache.total_files, cache.total_articles
    );
    println!("  size:    {:.2} MB", cache.cache_size_mb);
    if let Some(newest) = &cache.newest_cache {
        println!("  newest:  {newest}");
    }
    if let Some(oldest) = &cache.oldest_cache {
        println!("  oldest:  {oldest}");
    }
    Ok(())
}

async fn cache_admin(config: Config, action: CacheAction) -> Result<()> {
    let governor = Governor::new(config.discovery_governor(), config.discovery.keys.clone()).await?;
    match action {
        CacheAction::Clear => {
            let removed = governor.clear_cache().await;
            println!("removed {removed} cached responses");
        }
        CacheAction::Cleanup => {
            let removed = governor.clear_expired_cache().await;
            println!("removed {removed} expired responses");
        }
    }
    Ok(())
}

async fn quota_admin(config: Config, action: QuotaAction) -> Result<()> {
    let governor = Governor::new(config.discovery_governor(), config.discovery.keys.clone()).await?;
    match action {
        QuotaAction::Reset { force } => {
            if governor.reset_quota(force).await {
                println!("quota counter reset");
            } else {
                println!("quota counter is from today; pass --force to reset it anyway");
            }
        }
    }
    Ok(())
}

/// Requests expected by midnight if the pace since the last reset holds.
/// None when there is no traffic yet to extrapolate from.
fn project_daily_usage(quota: &QuotaStatus, now_epoch: f64) -> Option<u32> {
    let elapsed_hours = (now_epoch - quota.last_reset) / 3600.0;
    if elapsed_hours <= 0.0 || quota.requests_made == 0 {
        return None;
    }
    Some((f64::from(quota.requests_made) / elapsed_hours * 24.0).round() as u32)
}

fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
