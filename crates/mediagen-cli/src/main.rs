//! mediagen CLI
//!
//! Operator tooling over the pipeline's persisted state: usage reports,
//! limit checks, pending jobs and cache maintenance.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_appender::non_blocking::WorkerGuard;

use mediagen_core::core::jobs::list_pending;
use mediagen_core::core::now_ms;
use mediagen_core::{
    ContentCache, DailyUsageState, LimitCheck, PipelineConfig, PricingRegistry, ResourceType,
    UsageLedger,
};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser)]
#[command(name = "mediagen", version, about = "Inspect and maintain mediagen state")]
struct Cli {
    /// JSON config file; environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show daily usage, newest first
    Usage {
        /// Number of days to show
        #[arg(long, default_value_t = 7)]
        days: usize,
        #[arg(long)]
        json: bool,
    },
    /// Check whether a generation would be allowed (exit code 2 when blocked)
    Limits {
        /// image, video, speech or music
        resource: ResourceType,
        /// Expected cost of the generation in USD
        #[arg(long, default_value_t = 0.0)]
        cost: f64,
        #[arg(long)]
        json: bool,
    },
    /// List jobs submitted but not yet confirmed finished
    Pending {
        #[arg(long)]
        json: bool,
    },
    /// Cache maintenance
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Remove expired entries
    Prune,
    /// Remove every entry, pending job records included
    Clear,
}

// =============================================================================
// Logging
// =============================================================================

/// Logs to stderr, plus a daily rolling file when `MEDIAGEN_LOG_DIR` is set
fn init_logging() {
    use tracing_subscriber::prelude::*;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let file_layer = std::env::var_os("MEDIAGEN_LOG_DIR").map(|dir| {
        let dir = PathBuf::from(dir);
        let _ = std::fs::create_dir_all(&dir);
        let appender = tracing_appender::rolling::daily(&dir, "mediagen.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        let _ = LOG_GUARD.set(guard);
        tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
    });

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer);

    let _ = tracing::subscriber::set_global_default(subscriber);
}

// =============================================================================
// Commands
// =============================================================================

fn load_config(path: Option<&PathBuf>) -> PipelineConfig {
    let mut config = match path {
        Some(path) => PipelineConfig::load(path),
        None => PipelineConfig::default(),
    };
    config.apply_env();
    config
}

fn ledger(config: &PipelineConfig) -> UsageLedger {
    UsageLedger::new(
        &config.usage_dir,
        config.limits.clone(),
        PricingRegistry::with_builtin(),
    )
    .with_tracking(config.track_usage)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn cmd_usage(config: &PipelineConfig, days: usize, json: bool) -> Result<()> {
    let history: Vec<DailyUsageState> = ledger(config)
        .history(days.max(1))
        .await
        .context("Failed to read usage history")?;

    if json {
        return print_json(&history);
    }

    println!(
        "{:<12} {:>7} {:>7} {:>9} {:>9} {:>9} {:>10} {:>8}",
        "date", "images", "videos", "video s", "speech m", "music m", "cost", "unpriced"
    );
    for day in &history {
        let c = &day.counters;
        println!(
            "{:<12} {:>7} {:>7} {:>9.1} {:>9.2} {:>9.2} {:>10} {:>8}",
            day.date,
            c.images,
            c.videos,
            c.video_seconds,
            c.speech_minutes,
            c.music_minutes,
            format!("${:.4}", c.total_cost),
            c.unpriced
        );
    }
    Ok(())
}

async fn cmd_limits(
    config: &PipelineConfig,
    resource: ResourceType,
    cost: f64,
    json: bool,
) -> Result<ExitCode> {
    let check = ledger(config)
        .check_limits_with_cost(resource, cost)
        .await
        .context("Failed to check limits")?;

    if json {
        print_json(&check)?;
    } else {
        match &check {
            LimitCheck::Allowed => println!("{}: allowed", resource),
            LimitCheck::Warning {
                limit_type,
                percent,
                current,
                limit,
            } => println!(
                "{}: allowed, {} at {}% ({} of {})",
                resource, limit_type, percent, current, limit
            ),
            LimitCheck::Blocked {
                limit_type,
                current,
                limit,
            } => println!(
                "{}: blocked by {} ({} of {}). Raise {} to allow more generations today",
                resource,
                limit_type,
                current,
                limit,
                limit_type.env_var()
            ),
        }
    }

    Ok(if check.is_blocked() {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    })
}

async fn cmd_pending(config: &PipelineConfig, json: bool) -> Result<()> {
    let cache = ContentCache::open(&config.cache_dir);
    let pending = list_pending(&cache).await;

    if json {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct Row<'a> {
            fingerprint: &'a str,
            request_id: &'a str,
            endpoint_id: &'a str,
            submitted_at: i64,
        }
        let rows: Vec<Row<'_>> = pending
            .iter()
            .map(|(fp, record)| Row {
                fingerprint: fp.as_str(),
                request_id: &record.request_id,
                endpoint_id: &record.endpoint_id,
                submitted_at: record.submitted_at,
            })
            .collect();
        return print_json(&rows);
    }

    if pending.is_empty() {
        println!("No pending jobs");
        return Ok(());
    }

    let now = now_ms();
    for (fingerprint, record) in &pending {
        println!(
            "{}  {}  {}  ({}s ago)",
            fingerprint,
            record.request_id,
            record.endpoint_id,
            record.age_ms(now) / 1000
        );
    }
    Ok(())
}

async fn cmd_cache(config: &PipelineConfig, action: CacheAction) -> Result<()> {
    let cache = ContentCache::open(&config.cache_dir);
    match action {
        CacheAction::Prune => {
            let removed = cache.prune_expired().await;
            println!("Removed {} expired entries", removed);
        }
        CacheAction::Clear => {
            cache.clear().await;
            println!("Cache cleared: {}", config.cache_dir.display());
        }
    }

    if cache.is_degraded() {
        anyhow::bail!(
            "Cache directory {} is not usable",
            config.cache_dir.display()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_logging();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref());

    match cli.command {
        Command::Usage { days, json } => cmd_usage(&config, days, json).await?,
        Command::Limits {
            resource,
            cost,
            json,
        } => return cmd_limits(&config, resource, cost, json).await,
        Command::Pending { json } => cmd_pending(&config, json).await?,
        Command::Cache { action } => cmd_cache(&config, action).await?,
    }

    Ok(ExitCode::SUCCESS)
}
