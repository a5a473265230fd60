//! Ledger and pipeline integration tests
//!
//! These tests exercise the claim state machine, event dedup, the stuck-row
//! reclaimer, and the curated loader against a real PostgreSQL instance.
//! They are ignored by default; run them with a database available:
//!
//! ```sh
//! DATABASE_URL=postgresql://localhost/sluice_test cargo test -- --ignored
//! ```

use anyhow::Result;
use sluice_pipeline::config::Settings;
use sluice_pipeline::contract::DatasetContract;
use sluice_pipeline::curated::CuratedStore;
use sluice_pipeline::intake::{self, FinalizeEvent};
use sluice_pipeline::ledger::{self, ClaimOutcome, IngestionStatus, Ledger, NewIngestion};
use sluice_pipeline::processor::{ProcessOutcome, Processor};
use sluice_pipeline::raw_store::LocalRawStore;
use sluice_pipeline::table::{Column, Table, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

async fn test_pool() -> Result<PgPool> {
    let url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgresql://localhost/sluice_test".to_string());
    let pool = PgPoolOptions::new().max_connections(8).connect(&url).await?;
    ledger::run_migrations(&pool).await?;
    Ok(pool)
}

fn unique_dataset(prefix: &str) -> String {
    format!("{prefix}{}", Uuid::new_v4().simple())
}

fn new_ingestion(dataset: &str, raw_uri: &str, generation: Option<i64>) -> NewIngestion {
    NewIngestion {
        dataset: dataset.to_string(),
        source: Some("test".to_string()),
        filename: "batch.csv".to_string(),
        file_ext: ".csv".to_string(),
        sha256: "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9".to_string(),
        raw_uri: raw_uri.to_string(),
        raw_generation: generation,
        replay_of: None,
    }
}

fn strs(values: &[&str]) -> Vec<Value> {
    values.iter().map(|s| Value::Str(s.to_string())).collect()
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set DATABASE_URL)"]
async fn test_claim_yields_exactly_one_winner_under_concurrency() -> Result<()> {
    let pool = test_pool().await?;
    let ledger = Ledger::new(pool);
    let dataset = unique_dataset("tclaim");

    let id = ledger
        .create_ingestion(new_ingestion(&dataset, "/tmp/raw/a.csv", None))
        .await?;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move { ledger.claim(id, 5).await }));
    }

    let mut claimed = 0;
    let mut skipped = 0;
    for handle in handles {
        match handle.await?? {
            ClaimOutcome::Claimed => claimed += 1,
            ClaimOutcome::Skipped => skipped += 1,
            ClaimOutcome::AttemptsExhausted => panic!("fresh row cannot be exhausted"),
        }
    }
    assert_eq!(claimed, 1);
    assert_eq!(skipped, 7);

    let row = ledger.get_ingestion(id).await?.unwrap();
    assert_eq!(row.status, IngestionStatus::Processing);
    assert_eq!(row.processing_attempts, 1);
    Ok(())
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set DATABASE_URL)"]
async fn test_claim_allows_retry_after_exception_until_cap() -> Result<()> {
    let pool = test_pool().await?;
    let ledger = Ledger::new(pool);
    let dataset = unique_dataset("tretry");

    let id = ledger
        .create_ingestion(new_ingestion(&dataset, "/tmp/raw/b.csv", None))
        .await?;

    for attempt in 1..=3 {
        assert_eq!(ledger.claim(id, 3).await?, ClaimOutcome::Claimed, "attempt {attempt}");
        ledger
            .set_status(id, IngestionStatus::FailedException, Some("boom"))
            .await?;
    }

    // Cap reached: the safety valve retires the row.
    assert_eq!(ledger.claim(id, 3).await?, ClaimOutcome::AttemptsExhausted);
    let row = ledger.get_ingestion(id).await?.unwrap();
    assert_eq!(row.status, IngestionStatus::FailedMaxAttempts);
    assert_eq!(row.processing_attempts, 3);

    // Terminal rows are never claimable again.
    assert_eq!(ledger.claim(id, 3).await?, ClaimOutcome::Skipped);
    Ok(())
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set DATABASE_URL)"]
async fn test_drift_and_quality_failures_are_not_retryable() -> Result<()> {
    let pool = test_pool().await?;
    let ledger = Ledger::new(pool);
    let dataset = unique_dataset("tnoretry");

    for status in [IngestionStatus::FailedDrift, IngestionStatus::FailedQuality] {
        let id = ledger
            .create_ingestion(new_ingestion(&dataset, &format!("/tmp/raw/{status}.csv"), None))
            .await?;
        assert_eq!(ledger.claim(id, 5).await?, ClaimOutcome::Claimed);
        ledger.set_status(id, status, Some("gated")).await?;
        assert_eq!(ledger.claim(id, 5).await?, ClaimOutcome::Skipped);
    }
    Ok(())
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set DATABASE_URL)"]
async fn test_finalize_event_dedup_returns_existing_id() -> Result<()> {
    let pool = test_pool().await?;
    let ledger = Ledger::new(pool);
    let dataset = unique_dataset("tdedup");
    let uri = format!("s3://bucket/raw/{dataset}/2026-08-04/aaaa.csv");

    let (first_id, created_first) = ledger
        .register_finalize_event(new_ingestion(&dataset, &uri, Some(7)))
        .await?;
    assert!(created_first);

    let (second_id, created_second) = ledger
        .register_finalize_event(new_ingestion(&dataset, &uri, Some(7)))
        .await?;
    assert!(!created_second);
    assert_eq!(first_id, second_id);

    // A new generation of the same object is a new ingestion.
    let (third_id, created_third) = ledger
        .register_finalize_event(new_ingestion(&dataset, &uri, Some(8)))
        .await?;
    assert!(created_third);
    assert_ne!(first_id, third_id);
    Ok(())
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set DATABASE_URL)"]
async fn test_replay_is_exempt_from_dedup_key() -> Result<()> {
    let pool = test_pool().await?;
    let ledger = Ledger::new(pool);
    let dataset = unique_dataset("treplay");
    let uri = format!("s3://bucket/raw/{dataset}/2026-08-04/bbbb.csv");

    let (original_id, _) = ledger
        .register_finalize_event(new_ingestion(&dataset, &uri, Some(1)))
        .await?;

    // Same (raw_uri, generation) pair, but replay_of exempts it.
    let replay_id = ledger.create_replay(original_id).await?;
    assert_ne!(replay_id, original_id);

    let replay = ledger.get_ingestion(replay_id).await?.unwrap();
    assert_eq!(replay.replay_of, Some(original_id));
    assert_eq!(replay.status, IngestionStatus::Received);
    assert_eq!(replay.raw_generation, Some(1));
    assert!(replay.source.unwrap().contains(&format!("replay:{original_id}")));
    Ok(())
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set DATABASE_URL)"]
async fn test_reclaim_stuck_makes_row_retryable() -> Result<()> {
    let pool = test_pool().await?;
    let ledger = Ledger::new(pool.clone());
    let dataset = unique_dataset("tstuck");

    let id = ledger
        .create_ingestion(new_ingestion(&dataset, "/tmp/raw/c.csv", None))
        .await?;
    assert_eq!(ledger.claim(id, 5).await?, ClaimOutcome::Claimed);

    // Backdate the heartbeat past the TTL.
    sqlx::query(
        "UPDATE ingestions SET processing_heartbeat_at = NOW() - INTERVAL '1 hour' WHERE id = $1",
    )
    .bind(id)
    .execute(&pool)
    .await?;

    let reclaimed = ledger.reclaim_stuck(900, 50).await?;
    assert!(reclaimed.contains(&id));

    let row = ledger.get_ingestion(id).await?.unwrap();
    assert_eq!(row.status, IngestionStatus::FailedException);

    // And it is claimable again.
    assert_eq!(ledger.claim(id, 5).await?, ClaimOutcome::Claimed);
    Ok(())
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set DATABASE_URL)"]
async fn test_heartbeat_only_touches_processing_rows() -> Result<()> {
    let pool = test_pool().await?;
    let ledger = Ledger::new(pool);
    let dataset = unique_dataset("thb");

    let id = ledger
        .create_ingestion(new_ingestion(&dataset, "/tmp/raw/d.csv", None))
        .await?;

    // RECEIVED rows are untouched.
    ledger.heartbeat(id).await?;
    let row = ledger.get_ingestion(id).await?.unwrap();
    assert!(row.processing_heartbeat_at.is_none());

    ledger.claim(id, 5).await?;
    ledger.heartbeat(id).await?;
    let row = ledger.get_ingestion(id).await?.unwrap();
    assert!(row.processing_heartbeat_at.is_some());
    Ok(())
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set DATABASE_URL)"]
async fn test_schema_snapshot_upsert_bumps_last_seen() -> Result<()> {
    let pool = test_pool().await?;
    let ledger = Ledger::new(pool);
    let dataset = unique_dataset("tschema");
    let schema = serde_json::json!({"columns": [{"name": "a", "logical_type": "integer"}], "column_count": 1});

    ledger.upsert_schema(&dataset, "hash1", &schema).await?;
    let first = ledger.latest_schema(&dataset).await?.unwrap();

    ledger.upsert_schema(&dataset, "hash1", &schema).await?;
    let second = ledger.latest_schema(&dataset).await?.unwrap();
    assert_eq!(first.first_seen_at, second.first_seen_at);
    assert!(second.last_seen_at >= first.last_seen_at);

    ledger.upsert_schema(&dataset, "hash2", &schema).await?;
    assert_eq!(ledger.latest_schema(&dataset).await?.unwrap().schema_hash, "hash2");
    assert_eq!(ledger.schema_history(&dataset, 10).await?.len(), 2);
    Ok(())
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set DATABASE_URL)"]
async fn test_keyed_upsert_is_idempotent_and_last_write_wins() -> Result<()> {
    let pool = test_pool().await?;
    let dataset = unique_dataset("tcurated");
    let contract = DatasetContract::from_yaml(&format!(
        "dataset: {dataset}\nprimary_key: parcel_id\ncolumns:\n  parcel_id:\n    type: string\n  sale_price:\n    type: number\n"
    ))?;
    let store = CuratedStore::new(pool.clone());

    let batch = Table::new(vec![
        Column { name: "parcel_id".into(), values: strs(&["P1", "P2"]) },
        Column { name: "sale_price".into(), values: strs(&["100", "200"]) },
    ])?;

    let loaded = store
        .upsert(&contract, &batch, Uuid::new_v4(), "sha-one")
        .await?;
    assert_eq!(loaded, 2);

    // Identical keyed re-load: no duplicate rows.
    store
        .upsert(&contract, &batch, Uuid::new_v4(), "sha-one")
        .await?;
    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM \"curated_{dataset}\""))
        .fetch_one(&pool)
        .await?;
    assert_eq!(count, 2);

    // Conflicting key overwrites non-key columns.
    let updated = Table::new(vec![
        Column { name: "parcel_id".into(), values: strs(&["P1"]) },
        Column { name: "sale_price".into(), values: strs(&["150"]) },
    ])?;
    store
        .upsert(&contract, &updated, Uuid::new_v4(), "sha-two")
        .await?;
    let price: Option<f64> = sqlx::query_scalar(&format!(
        "SELECT \"sale_price\" FROM \"curated_{dataset}\" WHERE \"parcel_id\" = 'P1'"
    ))
    .fetch_one(&pool)
    .await?;
    assert_eq!(price, Some(150.0));
    Ok(())
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set DATABASE_URL)"]
async fn test_unkeyed_upsert_appends_duplicates() -> Result<()> {
    let pool = test_pool().await?;
    let dataset = unique_dataset("tappend");
    let contract = DatasetContract::from_yaml(&format!(
        "dataset: {dataset}\ncolumns:\n  reading:\n    type: number\n"
    ))?;
    let store = CuratedStore::new(pool.clone());

    let batch = Table::new(vec![Column { name: "reading".into(), values: strs(&["1.5"]) }])?;

    store.upsert(&contract, &batch, Uuid::new_v4(), "sha").await?;
    store.upsert(&contract, &batch, Uuid::new_v4(), "sha").await?;

    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM \"curated_{dataset}\""))
        .fetch_one(&pool)
        .await?;
    assert_eq!(count, 2);
    Ok(())
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set DATABASE_URL)"]
async fn test_curated_table_evolves_additively() -> Result<()> {
    let pool = test_pool().await?;
    let dataset = unique_dataset("tevolve");
    let store = CuratedStore::new(pool.clone());

    let v1 = DatasetContract::from_yaml(&format!(
        "dataset: {dataset}\ncolumns:\n  a:\n    type: string\n"
    ))?;
    store.ensure_table(&v1).await?;

    let v2 = DatasetContract::from_yaml(&format!(
        "dataset: {dataset}\ncolumns:\n  a:\n    type: string\n  b:\n    type: integer\n"
    ))?;
    store.ensure_table(&v2).await?;

    let columns: Vec<String> = sqlx::query_scalar(
        "SELECT column_name FROM information_schema.columns WHERE table_schema = current_schema() AND table_name = $1",
    )
    .bind(format!("curated_{dataset}"))
    .fetch_all(&pool)
    .await?;
    assert!(columns.contains(&"a".to_string()));
    assert!(columns.contains(&"b".to_string()));
    Ok(())
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set DATABASE_URL)"]
async fn test_full_pipeline_end_to_end() -> Result<()> {
    let pool = test_pool().await?;
    let dataset = unique_dataset("tpipe");

    let contracts_dir = tempfile::tempdir()?;
    let raw_dir = tempfile::tempdir()?;
    let incoming = tempfile::tempdir()?;

    std::fs::write(
        contracts_dir.path().join(format!("{dataset}.yaml")),
        format!(
            "dataset: {dataset}\nprimary_key: parcel_id\ncolumns:\n  parcel_id:\n    type: string\n    required: true\n    unique: true\n  sale_price:\n    type: number\n    min: 0\ndrift_policy: fail\n"
        ),
    )?;

    let settings = Settings {
        contracts_dir: contracts_dir.path().to_path_buf(),
        raw_data_dir: raw_dir.path().to_path_buf(),
        ..Settings::default()
    };
    let raw_store = Arc::new(LocalRawStore::new(raw_dir.path()));
    let processor = Processor::new(pool.clone(), raw_store.clone(), settings.clone());

    // First arrival: loads cleanly, drift is "initial".
    let file = incoming.path().join("sales.csv");
    std::fs::write(&file, "parcel_id,sale_price\nP1,100\nP2,250.5\n")?;
    let id = intake::ingest_file(
        processor.ledger(),
        raw_store.as_ref(),
        &settings,
        &dataset,
        Some("manual"),
        &file,
    )
    .await?;

    let outcome = processor.process(id).await?;
    assert_eq!(outcome, ProcessOutcome::Loaded { rows_loaded: 2 });

    let row = processor.ledger().get_ingestion(id).await?.unwrap();
    assert_eq!(row.status, IngestionStatus::Loaded);
    let report = processor.ledger().get_report(id).await?.unwrap();
    assert!(report.passed);
    assert!(processor.ledger().get_lineage(id).await?.is_some());

    // Duplicate trigger for the same id is a safe no-op.
    assert_eq!(processor.process(id).await?, ProcessOutcome::Skipped);

    // Second arrival drops sale_price: breaking drift under policy=fail.
    let file2 = incoming.path().join("sales2.csv");
    std::fs::write(&file2, "parcel_id\nP3\n")?;
    let id2 = intake::ingest_file(
        processor.ledger(),
        raw_store.as_ref(),
        &settings,
        &dataset,
        Some("manual"),
        &file2,
    )
    .await?;
    let outcome2 = processor.process(id2).await?;
    assert_eq!(outcome2, ProcessOutcome::FailedDrift);

    let row2 = processor.ledger().get_ingestion(id2).await?.unwrap();
    assert_eq!(row2.status, IngestionStatus::FailedDrift);
    // A failing report and lineage artifact are still persisted.
    let report2 = processor.ledger().get_report(id2).await?.unwrap();
    assert!(!report2.passed);
    assert!(processor.ledger().get_lineage(id2).await?.is_some());

    // The curated table kept only the first load.
    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM \"curated_{dataset}\""))
        .fetch_one(&pool)
        .await?;
    assert_eq!(count, 2);

    // Third arrival: duplicate primary key fails quality; table untouched.
    let file3 = incoming.path().join("sales3.csv");
    std::fs::write(&file3, "parcel_id,sale_price\nP1,100\nP1,200\n")?;
    let id3 = intake::ingest_file(
        processor.ledger(),
        raw_store.as_ref(),
        &settings,
        &dataset,
        Some("manual"),
        &file3,
    )
    .await?;
    assert_eq!(processor.process(id3).await?, ProcessOutcome::FailedQuality);
    let report3 = processor.ledger().get_report(id3).await?.unwrap();
    let errors = report3.report["quality"]["errors"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect::<Vec<_>>();
    assert!(errors.contains(&"Primary key 'parcel_id' contains duplicates.".to_string()));
    let count_after: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM \"curated_{dataset}\""))
        .fetch_one(&pool)
        .await?;
    assert_eq!(count_after, 2);
    Ok(())
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set DATABASE_URL)"]
async fn test_register_event_for_off_scheme_object_is_rejected() -> Result<()> {
    let pool = test_pool().await?;
    let ledger = Ledger::new(pool);
    let settings = Settings::default();

    let event = FinalizeEvent {
        bucket: Some("bucket".to_string()),
        object_name: "somewhere/else/report.csv".to_string(),
        generation: 1,
    };
    assert!(intake::register_finalize_event(&ledger, &settings, &event).await.is_err());
    Ok(())
}
