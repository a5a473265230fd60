//! Curated table loader
//!
//! Loads a validated batch into `curated_<dataset>`, a table shaped by the
//! contract's declared columns plus three lineage columns. Evolution is
//! additive only (new contract columns are added, nothing is ever dropped or
//! retyped), matching the non-breaking-drift guarantee enforced upstream.
//!
//! With a declared primary key the load is an upsert: a key conflict
//! overwrites every non-key column with the incoming value, so re-loading an
//! identical keyed batch is a no-op in effect. Without a primary key rows
//! are strictly appended; replays then intentionally duplicate.
//!
//! Identifiers are validated by the contract rules, but are still quoted in
//! every generated statement.

use crate::contract::{ColumnType, DatasetContract};
use crate::table::{Table, Value};
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{PgPool, QueryBuilder, Row};
use std::collections::HashSet;
use uuid::Uuid;

/// Lineage columns stamped on every curated row.
const LINEAGE_COLUMNS: [&str; 3] = ["_ingestion_id", "_loaded_at", "_source_sha256"];

/// Fill for contract columns missing from a batch.
static NULL_VALUE: Value = Value::Null;

/// Postgres bind-parameter budget per INSERT statement.
const MAX_BIND_PARAMS: usize = 60_000;

/// Hard cap on rows per INSERT chunk.
const MAX_ROWS_PER_CHUNK: usize = 500;

/// Curated table name for a dataset.
pub fn table_name(dataset: &str) -> String {
    format!("curated_{dataset}")
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn sql_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::String => "TEXT",
        ColumnType::Integer => "BIGINT",
        ColumnType::Number => "DOUBLE PRECISION",
        ColumnType::Boolean => "BOOLEAN",
        ColumnType::Datetime => "TIMESTAMPTZ",
    }
}

/// CREATE TABLE statement for a contract's curated table.
pub fn create_table_sql(contract: &DatasetContract) -> String {
    let mut cols: Vec<String> = contract
        .columns
        .iter()
        .map(|(name, spec)| format!("{} {}", quote_ident(name), sql_type(spec.column_type)))
        .collect();

    cols.push("\"_ingestion_id\" UUID NOT NULL".to_string());
    cols.push("\"_loaded_at\" TIMESTAMPTZ NOT NULL".to_string());
    cols.push("\"_source_sha256\" TEXT NOT NULL".to_string());

    let pk = contract
        .primary_key
        .as_deref()
        .map(|pk| format!(", PRIMARY KEY ({})", quote_ident(pk)))
        .unwrap_or_default();

    format!(
        "CREATE TABLE IF NOT EXISTS {} ({}{})",
        quote_ident(&table_name(&contract.dataset)),
        cols.join(", "),
        pk
    )
}

/// Contract-shaped destination store for accepted rows.
#[derive(Debug, Clone)]
pub struct CuratedStore {
    pool: PgPool,
}

impl CuratedStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the curated table on first use; on later uses add any contract
    /// columns that don't exist yet. Returns the table name.
    pub async fn ensure_table(&self, contract: &DatasetContract) -> Result<String> {
        let table = table_name(&contract.dataset);

        sqlx::query(&create_table_sql(contract))
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to create curated table {table}"))?;

        let existing: HashSet<String> = sqlx::query(
            r#"
            SELECT column_name
            FROM information_schema.columns
            WHERE table_schema = current_schema() AND table_name = $1
            "#,
        )
        .bind(&table)
        .fetch_all(&self.pool)
        .await
        .context("Failed to inspect curated table columns")?
        .iter()
        .filter_map(|row| row.try_get::<String, _>("column_name").ok())
        .collect();

        for (name, spec) in &contract.columns {
            if existing.contains(name) {
                continue;
            }
            tracing::info!(table = %table, column = %name, "Adding new contract column to curated table");
            let alter = format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
                quote_ident(&table),
                quote_ident(name),
                sql_type(spec.column_type)
            );
            sqlx::query(&alter)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to add column {name} to {table}"))?;
        }

        Ok(table)
    }

    /// Load a batch, reindexed to the contract's declared columns (missing
    /// columns become null, undeclared columns are dropped). Returns the
    /// number of rows written.
    pub async fn upsert(
        &self,
        contract: &DatasetContract,
        batch: &Table,
        ingestion_id: Uuid,
        source_sha256: &str,
    ) -> Result<u64> {
        let table = self.ensure_table(contract).await?;

        let row_count = batch.row_count();
        if row_count == 0 {
            return Ok(0);
        }

        // Reindex: one slot per contract column, in declaration order.
        let slots: Vec<(&str, ColumnType, Option<&[Value]>)> = contract
            .columns
            .iter()
            .map(|(name, spec)| {
                (
                    name.as_str(),
                    spec.column_type,
                    batch.column(name).map(|c| c.values.as_slice()),
                )
            })
            .collect();

        let insert_columns: String = contract
            .column_names()
            .map(quote_ident)
            .chain(LINEAGE_COLUMNS.iter().map(|c| quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");

        let conflict_clause = contract.primary_key.as_deref().map(|pk| {
            let updates: Vec<String> = contract
                .column_names()
                .filter(|name| *name != pk)
                .chain(LINEAGE_COLUMNS.iter().copied())
                .map(|name| format!("{0} = EXCLUDED.{0}", quote_ident(name)))
                .collect();
            format!(
                " ON CONFLICT ({}) DO UPDATE SET {}",
                quote_ident(pk),
                updates.join(", ")
            )
        });

        let binds_per_row = slots.len() + LINEAGE_COLUMNS.len();
        let rows_per_chunk = (MAX_BIND_PARAMS / binds_per_row).clamp(1, MAX_ROWS_PER_CHUNK);
        let loaded_at = Utc::now();

        let mut written: u64 = 0;
        let mut start = 0usize;
        while start < row_count {
            let end = (start + rows_per_chunk).min(row_count);

            let mut qb: QueryBuilder<sqlx::Postgres> =
                QueryBuilder::new(format!("INSERT INTO {} ({}) ", quote_ident(&table), insert_columns));

            qb.push_values(start..end, |mut b, row_idx| {
                for (_, column_type, values) in &slots {
                    let value = values.map(|v| &v[row_idx]).unwrap_or(&NULL_VALUE);
                    match column_type {
                        ColumnType::String => b.push_bind(value.render()),
                        ColumnType::Integer => b.push_bind(value.as_integer()),
                        ColumnType::Number => b.push_bind(value.as_number()),
                        ColumnType::Boolean => b.push_bind(value.as_boolean()),
                        ColumnType::Datetime => b.push_bind(value.as_datetime()),
                    };
                }
                b.push_bind(ingestion_id);
                b.push_bind(loaded_at);
                b.push_bind(source_sha256.to_string());
            });

            if let Some(ref clause) = conflict_clause {
                qb.push(clause.as_str());
            }

            qb.build()
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to load rows into {table}"))?;

            written += (end - start) as u64;
            start = end;
        }

        tracing::debug!(table = %table, rows = written, ingestion_id = %ingestion_id, "Curated load complete");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::DatasetContract;

    fn contract() -> DatasetContract {
        DatasetContract::from_yaml(
            r#"
dataset: parcels
primary_key: parcel_id
columns:
  parcel_id:
    type: string
    required: true
  sale_price:
    type: number
  sale_date:
    type: datetime
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_create_table_sql_shape() {
        let sql = create_table_sql(&contract());
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"curated_parcels\""));
        assert!(sql.contains("\"parcel_id\" TEXT"));
        assert!(sql.contains("\"sale_price\" DOUBLE PRECISION"));
        assert!(sql.contains("\"sale_date\" TIMESTAMPTZ"));
        assert!(sql.contains("\"_ingestion_id\" UUID NOT NULL"));
        assert!(sql.contains("\"_loaded_at\" TIMESTAMPTZ NOT NULL"));
        assert!(sql.contains("\"_source_sha256\" TEXT NOT NULL"));
        assert!(sql.ends_with("PRIMARY KEY (\"parcel_id\"))"));
    }

    #[test]
    fn test_create_table_sql_without_pk_has_no_constraint() {
        let contract = DatasetContract::from_yaml(
            "dataset: events\ncolumns:\n  payload:\n    type: string\n",
        )
        .unwrap();
        let sql = create_table_sql(&contract);
        assert!(!sql.contains("PRIMARY KEY"));
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("ok"), "\"ok\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_table_name() {
        assert_eq!(table_name("parcels"), "curated_parcels");
    }
}
