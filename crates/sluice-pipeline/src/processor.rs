//! Ingestion orchestrator
//!
//! Drives one ingestion end-to-end:
//! claim -> contract -> materialize -> decode -> drift -> quality -> load ->
//! lineage -> finalize.
//!
//! Exactly one live processor per ingestion id at any time, enforced by the
//! ledger's atomic claim; duplicate or concurrent invocations for the same id
//! are safe. Every exit path persists a quality report and lineage artifact,
//! so any outcome can be inspected without re-running.

use crate::config::Settings;
use crate::contract::{ContractRegistry, DriftPolicy};
use crate::curated::{table_name, CuratedStore};
use crate::ledger::{ClaimOutcome, Ingestion, IngestionStatus, Ledger};
use crate::quality;
use crate::raw_store::RawStore;
use crate::schema::{self, SchemaObservation};
use crate::table::{self, Table};
use anyhow::{bail, Context, Result};
use serde_json::json;
use sqlx::PgPool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Final disposition of one `process` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// No ledger row for the id.
    NotFound,
    /// Another worker owns the ingestion or it is already terminal.
    Skipped,
    /// The attempts cap was hit; the row is now FAILED_MAX_ATTEMPTS.
    AttemptsExhausted,
    Loaded { rows_loaded: u64 },
    FailedDrift,
    FailedQuality,
    FailedException { error: String },
}

/// The pipeline driver. Collaborators are injected so tests and alternative
/// deployments can swap the raw store or contract source.
pub struct Processor {
    ledger: Ledger,
    curated: CuratedStore,
    contracts: ContractRegistry,
    raw_store: Arc<dyn RawStore>,
    settings: Settings,
}

impl Processor {
    pub fn new(pool: PgPool, raw_store: Arc<dyn RawStore>, settings: Settings) -> Self {
        Self {
            ledger: Ledger::new(pool.clone()),
            curated: CuratedStore::new(pool),
            contracts: ContractRegistry::new(settings.contracts_dir.clone()),
            raw_store,
            settings,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Process one ingestion id. Safe under at-least-once triggering.
    pub async fn process(&self, id: Uuid) -> Result<ProcessOutcome> {
        let Some(ingestion) = self.ledger.get_ingestion(id).await? else {
            warn!(ingestion_id = %id, "No such ingestion");
            return Ok(ProcessOutcome::NotFound);
        };

        match self
            .ledger
            .claim(id, self.settings.max_processing_attempts)
            .await?
        {
            ClaimOutcome::Claimed => {},
            ClaimOutcome::Skipped => {
                info!(ingestion_id = %id, "Skipping: already claimed or terminal");
                return Ok(ProcessOutcome::Skipped);
            },
            ClaimOutcome::AttemptsExhausted => {
                warn!(ingestion_id = %id, "Attempts exhausted; ingestion retired");
                return Ok(ProcessOutcome::AttemptsExhausted);
            },
        }

        let dataset = ingestion.dataset.clone();
        match self.run(&ingestion).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                // Transient/unexpected failure: retryable up to the attempts
                // cap. Still persist a failing report and lineage artifact so
                // the failure is inspectable.
                let message = format!("{err:#}");
                error!(ingestion_id = %id, dataset = %dataset, error = %message, "Ingestion failed");

                if let Err(status_err) = self
                    .ledger
                    .set_status(id, IngestionStatus::FailedException, Some(&message))
                    .await
                {
                    error!(ingestion_id = %id, error = %format!("{status_err:#}"), "Failed to record failure status");
                }

                let failure = json!({
                    "dataset": &dataset,
                    "raw_uri": &ingestion.raw_uri,
                    "sha256": &ingestion.sha256,
                    "exception": &message,
                });
                if let Err(report_err) = self.ledger.upsert_report(id, false, &failure).await {
                    warn!(ingestion_id = %id, error = %format!("{report_err:#}"), "Failed to persist failure report");
                }
                let artifact = json!({
                    "ingestion_id": id,
                    "dataset": &dataset,
                    "raw": { "uri": &ingestion.raw_uri, "sha256": &ingestion.sha256 },
                    "exception": &message,
                });
                if let Err(lineage_err) = self.ledger.upsert_lineage(id, &artifact).await {
                    warn!(ingestion_id = %id, error = %format!("{lineage_err:#}"), "Failed to persist failure lineage");
                }
                self.audit(
                    "ingestion.failed_exception",
                    &dataset,
                    id,
                    json!({ "exception": &message }),
                )
                .await;

                Ok(ProcessOutcome::FailedException { error: message })
            },
        }
    }

    async fn run(&self, ingestion: &Ingestion) -> Result<ProcessOutcome> {
        let id = ingestion.id;
        let dataset = &ingestion.dataset;
        let file_ext = ingestion.file_ext.clone().unwrap_or_default();

        self.touch(id).await;
        self.audit(
            "ingestion.processing_started",
            dataset,
            id,
            json!({
                "raw_uri": &ingestion.raw_uri,
                "sha256": &ingestion.sha256,
                "file_ext": &file_ext,
            }),
        )
        .await;

        let document = self
            .contracts
            .load(dataset)
            .with_context(|| format!("contract error for dataset {dataset}"))?;
        let contract = &document.contract;
        self.touch(id).await;

        // _tmp keeps any downloaded temp file alive until this attempt ends;
        // drop cleans it up on every exit path.
        let (local_path, _tmp) = self.materialize(&ingestion.raw_uri, &file_ext).await?;
        self.touch(id).await;

        let batch = decode_table(&local_path, &file_ext)?;
        self.touch(id).await;

        // Schema observation and drift against the latest snapshot.
        let observation = schema::observe(&batch);
        let observed_hash = schema::fingerprint(&observation);
        let previous: Option<SchemaObservation> = match self.ledger.latest_schema(dataset).await? {
            Some(snapshot) => Some(
                serde_json::from_value(snapshot.schema_json)
                    .context("stored schema snapshot is malformed")?,
            ),
            None => None,
        };
        let drift = schema::diff(previous.as_ref(), &observation);
        let drift_policy = contract
            .drift_policy
            .unwrap_or(self.settings.drift_policy_default);

        // The snapshot is recorded no matter how drift gating turns out.
        self.ledger
            .upsert_schema(dataset, &observed_hash, &serde_json::to_value(&observation)?)
            .await?;
        self.touch(id).await;

        let quality = quality::evaluate(&batch, contract);
        self.touch(id).await;

        let mut report = json!({
            "dataset": dataset,
            "source": &ingestion.source,
            "raw_uri": &ingestion.raw_uri,
            "sha256": &ingestion.sha256,
            "contract": {
                "path": document.path.to_string_lossy(),
                "sha256": &document.sha256,
            },
            "observed_schema_hash": &observed_hash,
            "drift": &drift,
            "drift_policy": drift_policy.as_str(),
            "quality": &quality,
        });

        if drift_gate_blocks(drift_policy, drift.breaking) {
            info!(
                ingestion_id = %id,
                dataset = %dataset,
                removed = ?drift.removed,
                changed = ?drift.changed_type.keys().collect::<Vec<_>>(),
                "Breaking schema drift under policy=fail"
            );
            self.ledger.upsert_report(id, false, &report).await?;
            self.ledger
                .set_status(id, IngestionStatus::FailedDrift, Some("schema drift policy=fail"))
                .await?;
            self.audit(
                "ingestion.failed_drift",
                dataset,
                id,
                json!({
                    "policy": drift_policy.as_str(),
                    "drift": &drift,
                    "observed_schema_hash": &observed_hash,
                }),
            )
            .await;
            self.persist_lineage(id, dataset, &report).await?;
            return Ok(ProcessOutcome::FailedDrift);
        }

        if !quality.passed {
            info!(
                ingestion_id = %id,
                dataset = %dataset,
                errors = quality.errors.len(),
                "Quality gate failed"
            );
            self.ledger.upsert_report(id, false, &report).await?;
            self.ledger
                .set_status(id, IngestionStatus::FailedQuality, Some("Quality gate failed"))
                .await?;
            self.audit(
                "ingestion.failed_quality",
                dataset,
                id,
                json!({
                    "errors": quality.errors.iter().take(20).collect::<Vec<_>>(),
                    "warnings": quality.warnings.iter().take(20).collect::<Vec<_>>(),
                    "metrics": &quality.metrics,
                }),
            )
            .await;
            self.persist_lineage(id, dataset, &report).await?;
            return Ok(ProcessOutcome::FailedQuality);
        }

        let rows_loaded = self
            .curated
            .upsert(contract, &batch, id, &ingestion.sha256)
            .await?;
        let load_info = json!({
            "backend": "postgres",
            "rows_loaded": rows_loaded,
            "table": table_name(dataset),
        });
        report["load"] = load_info.clone();
        self.touch(id).await;

        self.ledger.upsert_report(id, true, &report).await?;
        self.ledger.set_status(id, IngestionStatus::Loaded, None).await?;
        self.audit(
            "ingestion.loaded",
            dataset,
            id,
            json!({
                "rows_loaded": rows_loaded,
                "table": table_name(dataset),
                "observed_schema_hash": &observed_hash,
            }),
        )
        .await;
        self.persist_lineage(id, dataset, &report).await?;

        info!(
            ingestion_id = %id,
            dataset = %dataset,
            rows_loaded,
            "Ingestion loaded"
        );

        Ok(ProcessOutcome::Loaded { rows_loaded })
    }

    /// Resolve the raw artifact to a local readable path. Remote URIs are
    /// fetched into a scoped temp file whose guard travels with the result.
    async fn materialize(
        &self,
        raw_uri: &str,
        file_ext: &str,
    ) -> Result<(PathBuf, Option<NamedTempFile>)> {
        if !is_remote_uri(raw_uri) {
            return Ok((PathBuf::from(raw_uri), None));
        }

        let suffix = if file_ext.is_empty() { ".bin" } else { file_ext };
        let tmp = tempfile::Builder::new()
            .prefix("sluice_raw_")
            .suffix(suffix)
            .tempfile()
            .context("failed to create scratch file for raw download")?;
        self.raw_store
            .fetch(raw_uri, tmp.path())
            .await
            .with_context(|| format!("failed to fetch raw artifact {raw_uri}"))?;
        Ok((tmp.path().to_path_buf(), Some(tmp)))
    }

    /// Best-effort heartbeat; never aborts processing.
    async fn touch(&self, id: Uuid) {
        if let Err(err) = self.ledger.heartbeat(id).await {
            debug!(ingestion_id = %id, error = %format!("{err:#}"), "Heartbeat update failed");
        }
    }

    /// Best-effort audit; observability aid, never a correctness gate.
    async fn audit(&self, event_type: &str, dataset: &str, id: Uuid, details: serde_json::Value) {
        if let Err(err) = self
            .ledger
            .insert_audit_event(event_type, "worker", Some(dataset), Some(id), &details)
            .await
        {
            warn!(ingestion_id = %id, event = event_type, error = %format!("{err:#}"), "Audit write failed");
        }
    }

    /// Persist the governance artifact linking raw input, contract, drift,
    /// quality, and load outcome.
    async fn persist_lineage(&self, id: Uuid, dataset: &str, report: &serde_json::Value) -> Result<()> {
        let artifact = json!({
            "ingestion_id": id,
            "dataset": dataset,
            "raw": {
                "uri": report.get("raw_uri"),
                "sha256": report.get("sha256"),
            },
            "contract": report.get("contract"),
            "observed_schema_hash": report.get("observed_schema_hash"),
            "drift": report.get("drift"),
            "quality": report.get("quality"),
            "load": report.get("load"),
        });
        self.ledger.upsert_lineage(id, &artifact).await
    }
}

fn is_remote_uri(uri: &str) -> bool {
    uri.contains("://")
}

/// Breaking drift aborts processing only under policy `fail`; `warn` and
/// `allow` record the drift and proceed to quality.
fn drift_gate_blocks(policy: DriftPolicy, breaking: bool) -> bool {
    breaking && policy == DriftPolicy::Fail
}

fn decode_table(path: &Path, file_ext: &str) -> Result<Table> {
    match file_ext {
        ".csv" => table::read_csv_path(path),
        ".xlsx" | ".xls" => {
            bail!("spreadsheet decoding is not supported; convert {file_ext} to CSV")
        },
        other => bail!("unsupported file type: {other:?}"),
    }
}
