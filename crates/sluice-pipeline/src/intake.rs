//! Ingestion intake
//!
//! Two front doors create ledger rows:
//!
//! - `ingest_file`: a manual or watcher-driven upload from a local path. The
//!   file is durably stored in the raw landing zone first, then recorded as
//!   RECEIVED.
//! - `register_finalize_event`: an object-storage finalize notification.
//!   Delivery is at-least-once, so registration dedupes on the stable
//!   (raw location, generation) pair.

use crate::config::Settings;
use crate::ledger::{Ledger, NewIngestion};
use crate::raw_store::{file_extension, RawStore};
use anyhow::{bail, Context, Result};
use sluice_common::naming::{normalize_dataset_name, parse_raw_object_name};
use std::path::Path;
use tracing::info;
use uuid::Uuid;

/// Store a local file into the raw landing zone and record the arrival.
///
/// Returns the new ingestion id. The ledger row is only created after the
/// bytes are durably stored, so every RECEIVED row points at a real
/// artifact.
pub async fn ingest_file(
    ledger: &Ledger,
    store: &dyn RawStore,
    settings: &Settings,
    dataset: &str,
    source: Option<&str>,
    path: &Path,
) -> Result<Uuid> {
    let dataset = normalize_dataset_name(dataset)?;

    let ext = file_extension(path);
    if !settings.allowed_file_exts.iter().any(|allowed| *allowed == ext) {
        bail!(
            "file extension {:?} not allowed (allowed: {:?})",
            ext,
            settings.allowed_file_exts
        );
    }

    let size = std::fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();
    let max_bytes = settings.max_file_mb * 1024 * 1024;
    if size > max_bytes {
        bail!("file too large ({size} bytes > {} MB cap)", settings.max_file_mb);
    }

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let artifact = store.store(&dataset, path).await?;

    let id = ledger
        .create_ingestion(NewIngestion {
            dataset: dataset.clone(),
            source: source.map(|s| s.to_string()),
            filename,
            file_ext: artifact.ext.clone(),
            sha256: artifact.sha256.clone(),
            raw_uri: artifact.uri.clone(),
            raw_generation: None,
            replay_of: None,
        })
        .await?;

    info!(
        ingestion_id = %id,
        dataset = %dataset,
        sha256 = %artifact.sha256,
        raw_uri = %artifact.uri,
        "Ingestion received"
    );

    Ok(id)
}

/// An object-storage finalize notification.
#[derive(Debug, Clone)]
pub struct FinalizeEvent {
    /// Bucket holding the object; `None` for a filesystem landing zone.
    pub bucket: Option<String>,
    /// Object name relative to the bucket.
    pub object_name: String,
    /// Storage-assigned monotonic version stamp for the object.
    pub generation: i64,
}

/// Outcome of registering a finalize event.
#[derive(Debug, Clone)]
pub struct RegisteredEvent {
    pub ingestion_id: Uuid,
    pub dataset: String,
    /// False when this delivery was a duplicate of an already-registered one.
    pub created: bool,
}

/// Register an ingestion from a finalize event.
///
/// Only objects matching the raw landing scheme
/// `[prefix/]<dataset>/<YYYY-MM-DD>/<sha256><ext>` are accepted; anything
/// else in a shared bucket is ignored with an error.
pub async fn register_finalize_event(
    ledger: &Ledger,
    settings: &Settings,
    event: &FinalizeEvent,
) -> Result<RegisteredEvent> {
    let Some(parsed) = parse_raw_object_name(&settings.raw_prefix, &event.object_name) else {
        bail!(
            "object {:?} does not match the raw landing scheme (prefix {:?})",
            event.object_name,
            settings.raw_prefix
        );
    };
    let dataset = normalize_dataset_name(&parsed.dataset)?;

    let raw_uri = match event.bucket {
        Some(ref bucket) => format!("s3://{bucket}/{}", parsed.object_name),
        None => parsed.object_name.clone(),
    };

    let (ingestion_id, created) = ledger
        .register_finalize_event(NewIngestion {
            dataset: dataset.clone(),
            source: Some("object-finalize".to_string()),
            filename: format!("{}{}", parsed.sha256, parsed.ext),
            file_ext: parsed.ext.clone(),
            sha256: parsed.sha256.clone(),
            raw_uri,
            raw_generation: Some(event.generation),
            replay_of: None,
        })
        .await?;

    if created {
        info!(
            ingestion_id = %ingestion_id,
            dataset = %dataset,
            generation = event.generation,
            "Finalize event registered"
        );
    } else {
        info!(
            ingestion_id = %ingestion_id,
            dataset = %dataset,
            generation = event.generation,
            "Duplicate finalize event ignored"
        );
    }

    Ok(RegisteredEvent { ingestion_id, dataset, created })
}
