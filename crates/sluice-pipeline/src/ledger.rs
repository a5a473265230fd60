//! Ingestion ledger
//!
//! Durable per-attempt bookkeeping over PostgreSQL. The ledger row is the
//! only shared mutable state per ingestion: workers in any number of
//! processes coordinate exclusively through `claim`, a single conditional
//! UPDATE of which exactly one concurrent caller observes success.
//!
//! Curated tables are contract-shaped and therefore dynamic, so this module
//! (and the loader) uses the runtime query API rather than the compile-time
//! checked macros.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, QueryBuilder, Row};
use uuid::Uuid;

/// Migrations embedded from the workspace-level `migrations/` directory.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

/// Apply any pending migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    MIGRATOR
        .run(pool)
        .await
        .context("Failed to apply database migrations")?;
    Ok(())
}

/// Ingestion lifecycle status.
///
/// `FailedException` is the only retryable failure; drift and quality
/// failures repeat deterministically on identical input, so remediation is a
/// contract or source fix plus an explicit replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestionStatus {
    Received,
    Processing,
    Loaded,
    FailedDrift,
    FailedQuality,
    FailedException,
    FailedMaxAttempts,
}

impl IngestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionStatus::Received => "RECEIVED",
            IngestionStatus::Processing => "PROCESSING",
            IngestionStatus::Loaded => "LOADED",
            IngestionStatus::FailedDrift => "FAILED_DRIFT",
            IngestionStatus::FailedQuality => "FAILED_QUALITY",
            IngestionStatus::FailedException => "FAILED_EXCEPTION",
            IngestionStatus::FailedMaxAttempts => "FAILED_MAX_ATTEMPTS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RECEIVED" => Some(IngestionStatus::Received),
            "PROCESSING" => Some(IngestionStatus::Processing),
            "LOADED" => Some(IngestionStatus::Loaded),
            "FAILED_DRIFT" => Some(IngestionStatus::FailedDrift),
            "FAILED_QUALITY" => Some(IngestionStatus::FailedQuality),
            "FAILED_EXCEPTION" => Some(IngestionStatus::FailedException),
            "FAILED_MAX_ATTEMPTS" => Some(IngestionStatus::FailedMaxAttempts),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, IngestionStatus::Received | IngestionStatus::Processing)
    }
}

impl std::fmt::Display for IngestionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ledger row.
#[derive(Debug, Clone)]
pub struct Ingestion {
    pub id: Uuid,
    pub dataset: String,
    pub source: Option<String>,
    pub filename: Option<String>,
    pub file_ext: Option<String>,
    pub sha256: String,
    pub raw_uri: String,
    pub raw_generation: Option<i64>,
    pub received_at: DateTime<Utc>,
    pub status: IngestionStatus,
    pub error: Option<String>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_heartbeat_at: Option<DateTime<Utc>>,
    pub processing_attempts: i32,
    pub processed_at: Option<DateTime<Utc>>,
    pub replay_of: Option<Uuid>,
}

/// Parameters for a new ledger row.
#[derive(Debug, Clone)]
pub struct NewIngestion {
    pub dataset: String,
    pub source: Option<String>,
    pub filename: String,
    pub file_ext: String,
    pub sha256: String,
    pub raw_uri: String,
    pub raw_generation: Option<i64>,
    pub replay_of: Option<Uuid>,
}

/// Result of a claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller owns the ingestion and must process it.
    Claimed,
    /// Another worker owns it, or the row is terminal.
    Skipped,
    /// Attempts were exhausted; the row was moved to FAILED_MAX_ATTEMPTS.
    AttemptsExhausted,
}

/// A stored schema snapshot.
#[derive(Debug, Clone)]
pub struct SchemaSnapshot {
    pub dataset: String,
    pub schema_hash: String,
    pub schema_json: serde_json::Value,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// A stored quality report.
#[derive(Debug, Clone)]
pub struct StoredReport {
    pub ingestion_id: Uuid,
    pub passed: bool,
    pub report: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A stored lineage artifact.
#[derive(Debug, Clone)]
pub struct StoredLineage {
    pub ingestion_id: Uuid,
    pub artifact: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Ledger over a shared PostgreSQL pool.
#[derive(Debug, Clone)]
pub struct Ledger {
    pool: PgPool,
}

impl Ledger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a new RECEIVED ingestion; the raw artifact must already be
    /// durably stored.
    pub async fn create_ingestion(&self, new: NewIngestion) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO ingestions (
                id, dataset, source, filename, file_ext, sha256, raw_uri,
                raw_generation, received_at, status, replay_of
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW(), 'RECEIVED', $9)
            "#,
        )
        .bind(id)
        .bind(&new.dataset)
        .bind(&new.source)
        .bind(&new.filename)
        .bind(&new.file_ext)
        .bind(&new.sha256)
        .bind(&new.raw_uri)
        .bind(new.raw_generation)
        .bind(new.replay_of)
        .execute(&self.pool)
        .await
        .context("Failed to create ingestion")?;

        Ok(id)
    }

    /// Register an ingestion from an at-least-once object-finalize event.
    ///
    /// Dedup key is the stable (raw_uri, raw_generation) pair. The first
    /// delivery inserts and returns `(id, true)`; every later delivery of
    /// the same key is a no-op returning the existing id and `false`.
    pub async fn register_finalize_event(&self, new: NewIngestion) -> Result<(Uuid, bool)> {
        let Some(generation) = new.raw_generation else {
            bail!("finalize events must carry a raw generation");
        };

        let id = Uuid::new_v4();
        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO ingestions (
                id, dataset, source, filename, file_ext, sha256, raw_uri,
                raw_generation, received_at, status, replay_of
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW(), 'RECEIVED', NULL)
            ON CONFLICT (raw_uri, raw_generation)
              WHERE raw_generation IS NOT NULL AND replay_of IS NULL
            DO NOTHING
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(&new.dataset)
        .bind(&new.source)
        .bind(&new.filename)
        .bind(&new.file_ext)
        .bind(&new.sha256)
        .bind(&new.raw_uri)
        .bind(generation)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to register finalize event")?;

        if let Some(id) = inserted {
            return Ok((id, true));
        }

        let existing: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM ingestions
            WHERE raw_uri = $1 AND raw_generation = $2 AND replay_of IS NULL
            LIMIT 1
            "#,
        )
        .bind(&new.raw_uri)
        .bind(generation)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to look up existing ingestion for finalize event")?;

        match existing {
            Some(id) => Ok((id, false)),
            None => bail!("insert conflict but no existing ingestion found"),
        }
    }

    /// Create a fresh RECEIVED ingestion referencing the same raw artifact
    /// as `original_id`. Replays carry `replay_of` and are therefore exempt
    /// from the event dedup key.
    pub async fn create_replay(&self, original_id: Uuid) -> Result<Uuid> {
        let original = self
            .get_ingestion(original_id)
            .await?
            .with_context(|| format!("original ingestion {original_id} not found"))?;

        let replay_tag = format!("replay:{original_id}");
        let source = match original.source {
            Some(ref s) if !s.is_empty() => format!("{s};{replay_tag}"),
            _ => replay_tag,
        };

        self.create_ingestion(NewIngestion {
            dataset: original.dataset,
            source: Some(source),
            filename: original.filename.unwrap_or_default(),
            file_ext: original.file_ext.unwrap_or_default(),
            sha256: original.sha256,
            raw_uri: original.raw_uri,
            raw_generation: original.raw_generation,
            replay_of: Some(original_id),
        })
        .await
    }

    pub async fn get_ingestion(&self, id: Uuid) -> Result<Option<Ingestion>> {
        let row = sqlx::query("SELECT * FROM ingestions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch ingestion")?;

        row.map(|r| ingestion_from_row(&r)).transpose()
    }

    /// List recent ingestions, newest first.
    ///
    /// `status` accepts grouped values (received/processing/success/failed)
    /// or a raw status such as FAILED_QUALITY.
    pub async fn list_ingestions(
        &self,
        dataset: Option<&str>,
        status: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Ingestion>> {
        let limit = limit.clamp(1, 500);

        let mut qb: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new("SELECT * FROM ingestions WHERE TRUE");

        if let Some(dataset) = dataset {
            qb.push(" AND dataset = ");
            qb.push_bind(dataset.to_string());
        }
        if let Some(status) = status {
            match status.trim().to_lowercase().as_str() {
                "success" => {
                    qb.push(" AND status = 'LOADED'");
                },
                "failed" => {
                    qb.push(" AND status LIKE 'FAILED%'");
                },
                "processing" => {
                    qb.push(" AND status = 'PROCESSING'");
                },
                "received" => {
                    qb.push(" AND status = 'RECEIVED'");
                },
                other => {
                    qb.push(" AND status = ");
                    qb.push_bind(other.to_uppercase());
                },
            }
        }
        qb.push(" ORDER BY received_at DESC LIMIT ");
        qb.push_bind(limit);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("Failed to list ingestions")?;

        rows.iter().map(ingestion_from_row).collect()
    }

    /// Atomically claim an ingestion for processing.
    ///
    /// A single conditional UPDATE moves {RECEIVED, FAILED_EXCEPTION} rows
    /// with remaining attempts to PROCESSING; exactly one concurrent caller
    /// sees the row returned. A second conditional UPDATE is the safety
    /// valve that retires rows whose attempts are exhausted.
    pub async fn claim(&self, id: Uuid, max_attempts: i32) -> Result<ClaimOutcome> {
        let max_attempts = max_attempts.max(1);

        let claimed: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE ingestions
            SET status = 'PROCESSING',
                error = NULL,
                processed_at = NULL,
                processing_started_at = NOW(),
                processing_heartbeat_at = NOW(),
                processing_attempts = processing_attempts + 1
            WHERE id = $1
              AND status IN ('RECEIVED', 'FAILED_EXCEPTION')
              AND processing_attempts < $2
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(max_attempts)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to claim ingestion")?;

        if claimed.is_some() {
            return Ok(ClaimOutcome::Claimed);
        }

        let exhausted: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE ingestions
            SET status = 'FAILED_MAX_ATTEMPTS',
                error = 'max processing attempts exceeded',
                processed_at = NOW(),
                processing_started_at = NULL,
                processing_heartbeat_at = NULL
            WHERE id = $1
              AND status IN ('RECEIVED', 'FAILED_EXCEPTION')
              AND processing_attempts >= $2
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(max_attempts)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to retire exhausted ingestion")?;

        if exhausted.is_some() {
            Ok(ClaimOutcome::AttemptsExhausted)
        } else {
            Ok(ClaimOutcome::Skipped)
        }
    }

    /// Refresh the liveness timestamp of an in-flight ingestion. Only
    /// PROCESSING rows are touched.
    pub async fn heartbeat(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE ingestions
            SET processing_heartbeat_at = NOW()
            WHERE id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to update heartbeat")?;
        Ok(())
    }

    /// Set the ingestion status. Terminal statuses stamp `processed_at`;
    /// RECEIVED/PROCESSING clear it.
    pub async fn set_status(
        &self,
        id: Uuid,
        status: IngestionStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let processed_at: Option<DateTime<Utc>> =
            if status.is_terminal() { Some(Utc::now()) } else { None };

        sqlx::query(
            r#"
            UPDATE ingestions
            SET status = $2, error = $3, processed_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error)
        .bind(processed_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to set ingestion status to {status}"))?;
        Ok(())
    }

    /// Force long-idle PROCESSING rows back to FAILED_EXCEPTION so they
    /// become retry-eligible. Idleness is judged on the heartbeat, falling
    /// back to the processing start and then the receive timestamp.
    pub async fn reclaim_stuck(&self, older_than_secs: i64, limit: i64) -> Result<Vec<Uuid>> {
        let older_than_secs = older_than_secs.max(30);
        let limit = limit.clamp(1, 500);
        let cutoff = Utc::now() - Duration::seconds(older_than_secs);

        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            WITH stuck AS (
              SELECT id
              FROM ingestions
              WHERE status = 'PROCESSING'
                AND COALESCE(processing_heartbeat_at, processing_started_at, received_at) < $1
              ORDER BY COALESCE(processing_heartbeat_at, processing_started_at, received_at) ASC
              LIMIT $2
            )
            UPDATE ingestions i
            SET status = 'FAILED_EXCEPTION',
                error = 'reclaimed stuck PROCESSING row',
                processed_at = NOW()
            FROM stuck
            WHERE i.id = stuck.id
            RETURNING i.id
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to reclaim stuck ingestions")?;

        Ok(ids)
    }

    // -------------------------------------------------------------------
    // Schema snapshots
    // -------------------------------------------------------------------

    /// Insert the snapshot if its fingerprint is new, otherwise bump
    /// `last_seen_at`. Always called, independent of the drift outcome.
    pub async fn upsert_schema(
        &self,
        dataset: &str,
        schema_hash: &str,
        schema_json: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dataset_schemas (dataset, schema_hash, schema_json, first_seen_at, last_seen_at)
            VALUES ($1, $2, $3, NOW(), NOW())
            ON CONFLICT (dataset, schema_hash)
            DO UPDATE SET last_seen_at = EXCLUDED.last_seen_at
            "#,
        )
        .bind(dataset)
        .bind(schema_hash)
        .bind(schema_json)
        .execute(&self.pool)
        .await
        .context("Failed to upsert schema snapshot")?;
        Ok(())
    }

    /// The drift baseline: the most recently seen snapshot for a dataset.
    pub async fn latest_schema(&self, dataset: &str) -> Result<Option<SchemaSnapshot>> {
        let row = sqlx::query(
            r#"
            SELECT dataset, schema_hash, schema_json, first_seen_at, last_seen_at
            FROM dataset_schemas
            WHERE dataset = $1
            ORDER BY last_seen_at DESC
            LIMIT 1
            "#,
        )
        .bind(dataset)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch latest schema snapshot")?;

        row.map(|r| snapshot_from_row(&r)).transpose()
    }

    pub async fn schema_history(&self, dataset: &str, limit: i64) -> Result<Vec<SchemaSnapshot>> {
        let limit = limit.clamp(1, 200);
        let rows = sqlx::query(
            r#"
            SELECT dataset, schema_hash, schema_json, first_seen_at, last_seen_at
            FROM dataset_schemas
            WHERE dataset = $1
            ORDER BY last_seen_at DESC
            LIMIT $2
            "#,
        )
        .bind(dataset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch schema history")?;

        rows.iter().map(snapshot_from_row).collect()
    }

    // -------------------------------------------------------------------
    // Quality reports and lineage artifacts
    // -------------------------------------------------------------------

    /// Idempotent overwrite-by-key so retries always leave the latest view.
    pub async fn upsert_report(
        &self,
        ingestion_id: Uuid,
        passed: bool,
        report: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO quality_reports (ingestion_id, passed, report, created_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (ingestion_id)
            DO UPDATE SET passed = EXCLUDED.passed,
                          report = EXCLUDED.report,
                          created_at = EXCLUDED.created_at
            "#,
        )
        .bind(ingestion_id)
        .bind(passed)
        .bind(report)
        .execute(&self.pool)
        .await
        .context("Failed to upsert quality report")?;
        Ok(())
    }

    pub async fn get_report(&self, ingestion_id: Uuid) -> Result<Option<StoredReport>> {
        let row = sqlx::query(
            "SELECT ingestion_id, passed, report, created_at FROM quality_reports WHERE ingestion_id = $1",
        )
        .bind(ingestion_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch quality report")?;

        row.map(|r| {
            Ok(StoredReport {
                ingestion_id: r.try_get("ingestion_id")?,
                passed: r.try_get("passed")?,
                report: r.try_get("report")?,
                created_at: r.try_get("created_at")?,
            })
        })
        .transpose()
    }

    pub async fn upsert_lineage(
        &self,
        ingestion_id: Uuid,
        artifact: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO lineage_artifacts (ingestion_id, artifact, created_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (ingestion_id)
            DO UPDATE SET artifact = EXCLUDED.artifact,
                          created_at = EXCLUDED.created_at
            "#,
        )
        .bind(ingestion_id)
        .bind(artifact)
        .execute(&self.pool)
        .await
        .context("Failed to upsert lineage artifact")?;
        Ok(())
    }

    pub async fn get_lineage(&self, ingestion_id: Uuid) -> Result<Option<StoredLineage>> {
        let row = sqlx::query(
            "SELECT ingestion_id, artifact, created_at FROM lineage_artifacts WHERE ingestion_id = $1",
        )
        .bind(ingestion_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch lineage artifact")?;

        row.map(|r| {
            Ok(StoredLineage {
                ingestion_id: r.try_get("ingestion_id")?,
                artifact: r.try_get("artifact")?,
                created_at: r.try_get("created_at")?,
            })
        })
        .transpose()
    }

    // -------------------------------------------------------------------
    // Audit events
    // -------------------------------------------------------------------

    pub async fn insert_audit_event(
        &self,
        event_type: &str,
        actor: &str,
        dataset: Option<&str>,
        ingestion_id: Option<Uuid>,
        details: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_events (id, event_type, actor, dataset, ingestion_id, details, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event_type)
        .bind(actor)
        .bind(dataset)
        .bind(ingestion_id)
        .bind(details)
        .execute(&self.pool)
        .await
        .context("Failed to insert audit event")?;
        Ok(())
    }
}

fn ingestion_from_row(row: &PgRow) -> Result<Ingestion> {
    let status_raw: String = row.try_get("status")?;
    let status = IngestionStatus::parse(&status_raw)
        .with_context(|| format!("unknown ingestion status {status_raw:?}"))?;

    Ok(Ingestion {
        id: row.try_get("id")?,
        dataset: row.try_get("dataset")?,
        source: row.try_get("source")?,
        filename: row.try_get("filename")?,
        file_ext: row.try_get("file_ext")?,
        sha256: row.try_get("sha256")?,
        raw_uri: row.try_get("raw_uri")?,
        raw_generation: row.try_get("raw_generation")?,
        received_at: row.try_get("received_at")?,
        status,
        error: row.try_get("error")?,
        processing_started_at: row.try_get("processing_started_at")?,
        processing_heartbeat_at: row.try_get("processing_heartbeat_at")?,
        processing_attempts: row.try_get("processing_attempts")?,
        processed_at: row.try_get("processed_at")?,
        replay_of: row.try_get("replay_of")?,
    })
}

fn snapshot_from_row(row: &PgRow) -> Result<SchemaSnapshot> {
    Ok(SchemaSnapshot {
        dataset: row.try_get("dataset")?,
        schema_hash: row.try_get("schema_hash")?,
        schema_json: row.try_get("schema_json")?,
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
    })
}
