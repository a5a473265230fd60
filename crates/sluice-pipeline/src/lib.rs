//! Sluice Pipeline Library
//!
//! The ingestion processing pipeline for contract-gated tabular data:
//!
//! - **Intake**: manual file uploads and at-least-once object-finalize
//!   events, deduplicated on (raw location, generation)
//! - **Ledger**: durable per-attempt bookkeeping with an atomic claim, so
//!   exactly one worker processes an ingestion at a time
//! - **Schema Drift**: order-independent fingerprints diffed against the
//!   dataset's last-seen snapshot
//! - **Quality Gate**: contract-driven batch validation with accumulating
//!   errors and warnings
//! - **Curated Loader**: idempotent upsert into contract-shaped tables with
//!   lineage columns
//! - **Lineage**: a governance artifact per ingestion linking raw input,
//!   contract, drift, quality, and load outcome
//!
//! # Example
//!
//! ```no_run
//! use sluice_pipeline::config::Settings;
//! use sluice_pipeline::processor::Processor;
//! use sluice_pipeline::raw_store::LocalRawStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load()?;
//!     let pool = sqlx::PgPool::connect(&settings.database_url).await?;
//!     sluice_pipeline::ledger::run_migrations(&pool).await?;
//!
//!     let raw_store = Arc::new(LocalRawStore::new(settings.raw_data_dir.clone()));
//!     let processor = Processor::new(pool, raw_store, settings);
//!     let outcome = processor.process(uuid::Uuid::new_v4()).await?;
//!     println!("{outcome:?}");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod contract;
pub mod curated;
pub mod intake;
pub mod ledger;
pub mod processor;
pub mod quality;
pub mod raw_store;
pub mod schema;
pub mod table;

// Re-export commonly used types
pub use config::Settings;
pub use contract::{ContractRegistry, DatasetContract, DriftPolicy};
pub use ledger::{ClaimOutcome, IngestionStatus, Ledger};
pub use processor::{ProcessOutcome, Processor};
pub use raw_store::{LocalRawStore, RawStore};
