//! Sluice - contract-gated tabular ingestion pipeline

use anyhow::Result;
use clap::{Parser, Subcommand};
use sluice_common::logging::{init_logging, LogConfig, LogLevel};
use sluice_pipeline::config::Settings;
use sluice_pipeline::intake::{self, FinalizeEvent};
use sluice_pipeline::ledger::{self, Ledger};
use sluice_pipeline::processor::{ProcessOutcome, Processor};
use sluice_pipeline::raw_store::LocalRawStore;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "sluice")]
#[command(author, version, about = "Contract-gated tabular ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply pending database migrations
    Migrate,

    /// Store a local file in the raw landing zone and record the arrival
    Ingest {
        /// Dataset the file belongs to
        #[arg(long)]
        dataset: String,

        /// Free-form source tag (e.g. "manual", "watcher")
        #[arg(long)]
        source: Option<String>,

        /// File to ingest
        path: PathBuf,
    },

    /// Run the processing pipeline for one ingestion id
    Process {
        ingestion_id: Uuid,
    },

    /// Create a fresh ingestion referencing the same raw artifact
    Replay {
        ingestion_id: Uuid,

        /// Also process the replay immediately
        #[arg(long)]
        process: bool,
    },

    /// Force long-idle PROCESSING rows back to a retryable state
    Reclaim {
        /// Heartbeat age in seconds before a row counts as stuck
        #[arg(long)]
        older_than_secs: Option<i64>,

        /// Maximum rows to reclaim in one run
        #[arg(long)]
        limit: Option<i64>,
    },

    /// Register an object-finalize event (at-least-once delivery safe)
    RegisterEvent {
        /// Object name, e.g. raw/parcels/2026-08-04/<sha256>.csv
        #[arg(long)]
        object: String,

        /// Storage-assigned generation of the object
        #[arg(long)]
        generation: i64,

        /// Bucket holding the object; omit for a filesystem landing zone
        #[arg(long)]
        bucket: Option<String>,

        /// Also process the ingestion when the event was newly registered
        #[arg(long)]
        process: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { LogLevel::Debug } else { LogLevel::Info };
    let mut log_config = LogConfig::from_env().unwrap_or_default();
    if cli.verbose {
        log_config.level = log_level;
    }
    init_logging(&log_config)?;

    let settings = Settings::load()?;
    let pool = connect(&settings).await?;

    match cli.command {
        Command::Migrate => {
            ledger::run_migrations(&pool).await?;
            info!("Migrations applied");
        },
        Command::Ingest { dataset, source, path } => {
            let ledger = Ledger::new(pool);
            let store = LocalRawStore::new(settings.raw_data_dir.clone());
            let id =
                intake::ingest_file(&ledger, &store, &settings, &dataset, source.as_deref(), &path)
                    .await?;
            info!(ingestion_id = %id, "Created ingestion");
        },
        Command::Process { ingestion_id } => {
            let processor = build_processor(pool, &settings);
            let outcome = processor.process(ingestion_id).await?;
            report_outcome(ingestion_id, &outcome);
        },
        Command::Replay { ingestion_id, process } => {
            let processor = build_processor(pool, &settings);
            let replay_id = processor.ledger().create_replay(ingestion_id).await?;
            info!(original = %ingestion_id, replay = %replay_id, "Replay created");
            if process {
                let outcome = processor.process(replay_id).await?;
                report_outcome(replay_id, &outcome);
            }
        },
        Command::Reclaim { older_than_secs, limit } => {
            let ledger = Ledger::new(pool);
            let reclaimed = ledger
                .reclaim_stuck(
                    older_than_secs.unwrap_or(settings.processing_ttl_secs),
                    limit.unwrap_or(settings.reclaim_max_per_run),
                )
                .await?;
            info!(count = reclaimed.len(), "Reclaimed stuck ingestions");
            for id in reclaimed {
                info!(ingestion_id = %id, "Reclaimed");
            }
        },
        Command::RegisterEvent { object, generation, bucket, process } => {
            let processor = build_processor(pool, &settings);
            let event = FinalizeEvent { bucket, object_name: object, generation };
            let registered =
                intake::register_finalize_event(processor.ledger(), &settings, &event).await?;
            info!(
                ingestion_id = %registered.ingestion_id,
                created = registered.created,
                "Finalize event handled"
            );
            if process && registered.created {
                let outcome = processor.process(registered.ingestion_id).await?;
                report_outcome(registered.ingestion_id, &outcome);
            }
        },
    }

    Ok(())
}

async fn connect(settings: &Settings) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(settings.database_max_connections)
        .connect(&settings.database_url)
        .await?;
    Ok(pool)
}

fn build_processor(pool: PgPool, settings: &Settings) -> Processor {
    let raw_store = Arc::new(LocalRawStore::new(settings.raw_data_dir.clone()));
    Processor::new(pool, raw_store, settings.clone())
}

fn report_outcome(id: Uuid, outcome: &ProcessOutcome) {
    match outcome {
        ProcessOutcome::Loaded { rows_loaded } => {
            info!(ingestion_id = %id, rows_loaded, "Loaded");
        },
        ProcessOutcome::Skipped => {
            info!(ingestion_id = %id, "Skipped (already claimed or terminal)");
        },
        ProcessOutcome::NotFound => {
            warn!(ingestion_id = %id, "Ingestion not found");
        },
        ProcessOutcome::AttemptsExhausted => {
            warn!(ingestion_id = %id, "Attempts exhausted");
        },
        ProcessOutcome::FailedDrift => {
            warn!(ingestion_id = %id, "Failed: breaking schema drift");
        },
        ProcessOutcome::FailedQuality => {
            warn!(ingestion_id = %id, "Failed: quality gate");
        },
        ProcessOutcome::FailedException { error } => {
            warn!(ingestion_id = %id, error = %error, "Failed: exception");
        },
    }
}
