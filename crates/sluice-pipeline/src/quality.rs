//! Contract-driven quality gate
//!
//! Evaluates a decoded batch against its dataset contract. Checks accumulate
//! into the outcome instead of short-circuiting, so one report names every
//! problem in the batch. A failing outcome blocks the curated load but is
//! still persisted for inspection.

use crate::contract::{ColumnType, DatasetContract};
use crate::table::{Table, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Batch-level metrics captured alongside the verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub row_count: usize,
    pub column_count: usize,
    pub null_fractions: BTreeMap<String, f64>,
}

/// The quality gate's verdict for one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityOutcome {
    pub passed: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub metrics: QualityMetrics,
}

/// Evaluate a batch against a contract.
pub fn evaluate(table: &Table, contract: &DatasetContract) -> QualityOutcome {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<String> = Vec::new();

    // Required columns
    let missing_required: Vec<&str> = contract
        .columns
        .iter()
        .filter(|(name, spec)| spec.required && table.column(name).is_none())
        .map(|(name, _)| name.as_str())
        .collect();
    if !missing_required.is_empty() {
        errors.push(format!("Missing required columns: {missing_required:?}"));
    }

    // Undeclared columns are drift's concern, not quality's.
    let unexpected: Vec<&str> = table
        .column_names()
        .filter(|name| contract.column(name).is_none())
        .collect();
    if !unexpected.is_empty() {
        warnings.push(format!("Unexpected columns present: {unexpected:?}"));
    }

    // Type conformance and bounds
    for (name, spec) in &contract.columns {
        let Some(column) = table.column(name) else { continue };
        let non_null: Vec<&Value> = column.values.iter().filter(|v| !v.is_null()).collect();
        if non_null.is_empty() {
            // all-null columns skip strict typing but still count toward null metrics
            continue;
        }

        match spec.column_type {
            ColumnType::String => {},
            ColumnType::Integer => {
                if !looks_like_integer(&non_null) {
                    errors.push(format!("Column '{name}' expected integer-like values."));
                }
            },
            ColumnType::Number => {
                if !looks_like_number(&non_null) {
                    errors.push(format!("Column '{name}' expected numeric values."));
                }
            },
            ColumnType::Datetime => {
                let unparseable = non_null.iter().filter(|v| v.as_datetime().is_none()).count();
                if unparseable as f64 / non_null.len() as f64 > 0.2 {
                    errors.push(format!("Column '{name}' expected datetime values."));
                }
            },
            ColumnType::Boolean => {
                if !looks_like_boolean(&non_null) {
                    errors.push(format!("Column '{name}' expected boolean values."));
                }
            },
        }

        if matches!(spec.column_type, ColumnType::Integer | ColumnType::Number) {
            let numeric: Vec<f64> = non_null.iter().filter_map(|v| v.as_number()).collect();
            if let Some(min) = spec.min {
                if numeric.iter().any(|v| *v < min) {
                    errors.push(format!("Column '{name}' has values < min ({min})."));
                }
            }
            if let Some(max) = spec.max {
                if numeric.iter().any(|v| *v > max) {
                    errors.push(format!("Column '{name}' has values > max ({max})."));
                }
            }
        }
    }

    // Per-column uniqueness
    for (name, spec) in &contract.columns {
        if !spec.unique {
            continue;
        }
        let Some(column) = table.column(name) else { continue };
        if has_duplicates(&column.values) {
            errors.push(format!("Column '{name}' has duplicate values but is marked unique."));
        }
    }

    // Primary key uniqueness, independently of the unique flag
    if let Some(ref pk) = contract.primary_key {
        if let Some(column) = table.column(pk) {
            if has_duplicates(&column.values) {
                errors.push(format!("Primary key '{pk}' contains duplicates."));
            }
        }
    }

    // Null fractions for every observed column; thresholds from the contract
    let mut null_fractions: BTreeMap<String, f64> = BTreeMap::new();
    for column in table.columns() {
        let frac = if column.values.is_empty() {
            0.0
        } else {
            column.values.iter().filter(|v| v.is_null()).count() as f64
                / column.values.len() as f64
        };
        null_fractions.insert(column.name.clone(), frac);
    }
    for (name, threshold) in &contract.quality.max_null_fraction {
        let Some(frac) = null_fractions.get(name) else { continue };
        if frac > threshold {
            errors.push(format!(
                "Column '{name}' null fraction {:.2}% exceeds threshold {:.2}%.",
                frac * 100.0,
                threshold * 100.0
            ));
        }
    }

    let metrics = QualityMetrics {
        row_count: table.row_count(),
        column_count: table.column_count(),
        null_fractions,
    };

    QualityOutcome { passed: errors.is_empty(), errors, warnings, metrics }
}

fn looks_like_number(non_null: &[&Value]) -> bool {
    let parseable = non_null.iter().filter(|v| v.as_number().is_some()).count();
    parseable as f64 / non_null.len() as f64 > 0.8
}

fn looks_like_integer(non_null: &[&Value]) -> bool {
    let numeric: Vec<f64> = non_null.iter().filter_map(|v| v.as_number()).collect();
    if numeric.len() as f64 / non_null.len() as f64 <= 0.8 {
        return false;
    }
    numeric.iter().all(|v| (v % 1.0).abs() < 1e-9)
}

fn looks_like_boolean(non_null: &[&Value]) -> bool {
    let tokens = non_null.iter().filter(|v| v.as_boolean().is_some()).count();
    tokens as f64 / non_null.len() as f64 > 0.8
}

/// Duplicate detection over rendered cell values; nulls compare equal to
/// each other, matching the baseline semantics of the original gate.
fn has_duplicates(values: &[Value]) -> bool {
    let mut seen: HashMap<Option<String>, usize> = HashMap::new();
    for value in values {
        let count = seen.entry(value.render()).or_insert(0);
        *count += 1;
        if *count > 1 {
            return true;
        }
    }
    false
}
