//! CDR Sync - incremental Call Report uploader

use anyhow::{Context, Result};
use cdr_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use cdr_sync::config::SyncConfig;
use cdr_sync::layout::StagingLayout;
use cdr_sync::source::HttpPeriodSource;
use cdr_sync::staging::TsvZipConverter;
use cdr_sync::store::PgRemoteStore;
use cdr_sync::uploader::BatchUploader;
use cdr_sync::{Orchestrator, OrchestratorOptions, Period, StateStore};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "cdr-sync")]
#[command(author, version, about = "Incremental FFIEC Call Report uploader")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Configuration file (defaults to ./cdr-sync.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Keep going after a period fails to upload
    #[arg(long, global = true)]
    continue_on_failure: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload every published period not yet complete (default)
    Run,

    /// Show the state file
    Status,

    /// Forget a period so the next run uploads it again
    Reset {
        /// Period id or date, e.g. 2024Q1 or 3/31/2024
        period: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .output(LogOutput::Console)
        .log_file_prefix("cdr-sync")
        .build();

    // Environment variables take precedence
    let log_config = log_config.merge_env().unwrap_or_else(|_| {
        LogConfig::builder()
            .level(log_level)
            .log_file_prefix("cdr-sync")
            .build()
    });

    let _guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Warning: logging disabled: {}", e);
            None
        },
    };

    match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        },
    }
}

async fn execute(cli: Cli) -> Result<ExitCode> {
    let mut config = SyncConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if cli.continue_on_failure {
        config.run.continue_on_failure = true;
    }

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Status => status(&config),
        Command::Reset { period } => reset(&config, &period),
    }
}

async fn run(config: SyncConfig) -> Result<ExitCode> {
    config.validate_for_run()?;

    let store = PgRemoteStore::connect_lazy(
        &config.upload.database_url,
        config.upload.schema.clone(),
        config.upload.max_connections,
        Duration::from_secs(config.upload.call_timeout_secs),
    )
    .context("configuring the remote store")?;

    let uploader = BatchUploader::new(
        Arc::new(store),
        config.upload.retry_policy(),
        config.upload.batch_size,
    );
    let source = HttpPeriodSource::new(&config.source)?;
    let state = StateStore::open(&config.state.path, config.state.stale_after())
        .with_context(|| format!("opening state file {}", config.state.path.display()))?;
    let options = OrchestratorOptions {
        continue_on_failure: config.run.continue_on_failure,
        upload_concurrency: config.upload.concurrency,
    };

    let mut orchestrator = Orchestrator::new(
        Arc::new(source),
        Arc::new(TsvZipConverter::new()),
        uploader,
        state,
        StagingLayout::new(&config.staging.data_dir),
        options,
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
        info!("Ctrl-C received, finishing up");
    };

    let summary = orchestrator.run_until(shutdown).await?;

    if summary.all_committed() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn status(config: &SyncConfig) -> Result<ExitCode> {
    let state = StateStore::open(&config.state.path, config.state.stale_after())?;

    println!("State file: {}", state.path().display());
    match state.last_run() {
        Some(at) => println!("Last run:   {}", at.to_rfc3339()),
        None => println!("Last run:   never"),
    }

    let records = state.records();
    if records.is_empty() {
        println!("\nNo periods recorded yet.");
        return Ok(ExitCode::SUCCESS);
    }

    println!();
    println!(
        "{:<12} {:<12} {:>8} {:>12} {:>9}  {}",
        "PERIOD", "STATUS", "TABLES", "ROWS", "ATTEMPTS", "UPDATED"
    );
    for record in records {
        println!(
            "{:<12} {:<12} {:>8} {:>12} {:>9}  {}",
            record.period.id(),
            record.status.as_str(),
            record.tables.len(),
            record.rows_uploaded,
            record.attempts,
            record.updated_at.format("%Y-%m-%d %H:%M:%S"),
        );
        if let Some(reason) = &record.reason {
            println!("{:<12} reason: {}", "", reason);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn reset(config: &SyncConfig, raw: &str) -> Result<ExitCode> {
    let period = Period::parse(raw)?;
    let mut state = StateStore::open(&config.state.path, config.state.stale_after())?;

    // Records from the listing are keyed by date; accept 2024Q1 for those too
    let by_date = Period::from_date(period.date());
    if state.remove(period.id())? || state.remove(by_date.id())? {
        println!("Removed {} from {}", period, state.path().display());
    } else {
        println!("No record for {}", period);
    }
    Ok(ExitCode::SUCCESS)
}
