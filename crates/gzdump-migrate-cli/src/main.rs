//! gzdump-migrate CLI - resumable gzip dump to PostgreSQL/MySQL migration.

use clap::{Parser, Subcommand};
use gzdump_migrate::{Config, MigrateError, MigrationResult, Migrator};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "gzdump-migrate")]
#[command(about = "Resumable migration of gzip NDJSON dumps into PostgreSQL/MySQL")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the migration, resuming from an existing checkpoint
    Run {
        /// Ignore an existing checkpoint and start from the beginning
        #[arg(long)]
        no_resume: bool,

        /// Validate config and destination schema, then exit without
        /// reading or writing data
        #[arg(long)]
        dry_run: bool,
    },

    /// Check destination connectivity and schema compatibility
    Validate,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(MigrateError::Config)?;

    let config = Config::load(&cli.config)?;
    info!("loaded configuration from {:?}", cli.config);
    display_config(&config);

    match cli.command {
        Commands::Run { no_resume, dry_run } => {
            if dry_run {
                Migrator::preflight(&config).await?;
                println!("Dry run passed: destination schema matches the mapping");
                return Ok(());
            }

            let cancel = setup_signal_handler()?;
            let migrator = Migrator::with_resume(config, !no_resume).await?;
            let result = migrator.run(cancel).await?;

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                print_summary(&result);
            }
        }

        Commands::Validate => {
            Migrator::preflight(&config).await?;
            println!("Validation completed successfully");
        }
    }

    Ok(())
}

fn print_summary(result: &MigrationResult) {
    println!("\nMigration {:?}", result.status);
    println!("  Duration: {:.2}s", result.duration_seconds);
    println!("  Records read: {}", result.records_read);
    println!("  Rows written: {}", result.rows_written);
    println!("  Duplicates skipped: {}", result.duplicates_skipped);
    println!(
        "  Records dropped: {} ({} conversion, {} missing required)",
        result.conversion_errors + result.missing_required,
        result.conversion_errors,
        result.missing_required
    );
    println!("  Throughput: {} records/sec", result.records_per_second);
    if let Some(offset) = result.final_offset {
        println!("  Final offset: {}", offset);
    }
}

fn display_config(config: &Config) {
    let p = &config.pipeline;
    info!("pipeline settings:");
    info!("  num_processors: {}", p.effective_num_processors());
    info!("  num_writers: {}", p.effective_num_writers());
    info!("  batch_size: {}", p.effective_batch_size());
    info!("  checkpoint_file: {:?}", p.effective_checkpoint_file());
    info!(
        "  checkpoint_interval: {:?}",
        p.effective_checkpoint_interval()
    );
    info!("  disable_checkpointing: {}", p.disable_checkpointing);
    info!("  disable_dupecheck: {}", p.disable_dupecheck);
    info!("source:");
    info!("  file: {:?}", config.source.file);
    info!("  file_type: {:?}", config.source.file_type);
    info!("  file_contents: {:?}", config.source.file_contents);
    info!("destination:");
    info!("  type: {:?}", config.destination.r#type);
    info!("mapping:");
    for (name, entries) in &config.mapping {
        info!("  {}: {} entries", name, entries.len());
    }
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM; either cancels the pipeline.
#[cfg(unix)]
fn setup_signal_handler() -> Result<CancellationToken, MigrateError> {
    let cancel = CancellationToken::new();

    let token = cancel.clone();
    tokio::spawn(async move {
        let mut sigint =
            signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => eprintln!("\nReceived SIGINT, shutting down gracefully..."),
            _ = sigterm.recv() => eprintln!("\nReceived SIGTERM, shutting down gracefully..."),
        }
        token.cancel();
    });

    Ok(cancel)
}

/// Setup signal handler for non-Unix targets (Ctrl-C only).
#[cfg(not(unix))]
fn setup_signal_handler() -> Result<CancellationToken, MigrateError> {
    let cancel = CancellationToken::new();

    let token = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
        eprintln!("\nReceived Ctrl-C, shutting down gracefully...");
        token.cancel();
    });

    Ok(cancel)
}
