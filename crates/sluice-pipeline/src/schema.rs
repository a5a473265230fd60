//! Schema observation and drift detection
//!
//! Every decoded batch produces a `SchemaObservation`: the column set with
//! one inferred logical type per column, sorted by name. The fingerprint is
//! a hash over the sorted (name, logical type) pairs, so neither row order
//! nor column order affects it. Observations are persisted as snapshots; the
//! most recent snapshot is the drift baseline for the next arrival.

use crate::table::{Table, Value};
use serde::{Deserialize, Serialize};
use sluice_common::checksum::sha256_bytes;
use std::collections::BTreeMap;

/// Inferred logical type of an observed column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalType {
    Boolean,
    Integer,
    Number,
    Datetime,
    String,
}

impl LogicalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogicalType::Boolean => "boolean",
            LogicalType::Integer => "integer",
            LogicalType::Number => "number",
            LogicalType::Datetime => "datetime",
            LogicalType::String => "string",
        }
    }
}

/// One observed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnObservation {
    pub name: String,
    pub logical_type: LogicalType,
}

/// A batch's observed schema, columns sorted by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaObservation {
    pub columns: Vec<ColumnObservation>,
    pub column_count: usize,
}

/// Infer the schema of a batch.
pub fn observe(table: &Table) -> SchemaObservation {
    let mut columns: Vec<ColumnObservation> = table
        .columns()
        .iter()
        .map(|col| ColumnObservation {
            name: col.name.clone(),
            logical_type: infer_logical_type(&col.values),
        })
        .collect();
    columns.sort_by(|a, b| a.name.cmp(&b.name));
    let column_count = columns.len();
    SchemaObservation { columns, column_count }
}

/// Stable fingerprint over the sorted (name, logical type) pairs.
pub fn fingerprint(observation: &SchemaObservation) -> String {
    let mut buf: Vec<u8> = Vec::new();
    for col in &observation.columns {
        buf.extend_from_slice(col.name.as_bytes());
        buf.push(0);
        buf.extend_from_slice(col.logical_type.as_str().as_bytes());
        buf.push(0);
    }
    sha256_bytes(&buf)
}

/// Inference is all-or-nothing per column: a single off-type cell demotes the
/// column to the next wider type, ending at string. All-null columns are
/// strings.
fn infer_logical_type(values: &[Value]) -> LogicalType {
    let non_null: Vec<&Value> = values.iter().filter(|v| !v.is_null()).collect();
    if non_null.is_empty() {
        return LogicalType::String;
    }

    // Only literal true/false count here; the quality gate's wider boolean
    // token set (yes/no/1/0) would swallow integer columns.
    let is_bool_literal = |v: &Value| match v {
        Value::Bool(_) => true,
        Value::Str(s) => {
            let t = s.trim().to_lowercase();
            t == "true" || t == "false"
        },
        _ => false,
    };

    if non_null.iter().all(|v| is_bool_literal(v)) {
        return LogicalType::Boolean;
    }
    if non_null.iter().all(|v| match v {
        Value::Int(_) => true,
        Value::Str(s) => s.trim().parse::<i64>().is_ok(),
        _ => false,
    }) {
        return LogicalType::Integer;
    }
    if non_null.iter().all(|v| v.as_number().is_some()) {
        return LogicalType::Number;
    }
    if non_null.iter().all(|v| v.as_datetime().is_some()) {
        return LogicalType::Datetime;
    }
    LogicalType::String
}

/// Drift classification for one observation against its baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftKind {
    Initial,
    None,
    Drift,
}

/// A column whose logical type changed between observations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeChange {
    pub from: LogicalType,
    pub to: LogicalType,
}

/// Diff between the baseline snapshot and the current observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftReport {
    #[serde(rename = "type")]
    pub kind: DriftKind,
    pub breaking: bool,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed_type: BTreeMap<String, TypeChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Diff the current observation against the most recent snapshot.
///
/// No baseline means `initial` and never breaking. Otherwise breaking is
/// exactly "a column was removed or changed type" — additions alone are
/// always safe.
pub fn diff(previous: Option<&SchemaObservation>, current: &SchemaObservation) -> DriftReport {
    let Some(previous) = previous else {
        return DriftReport {
            kind: DriftKind::Initial,
            breaking: false,
            added: Vec::new(),
            removed: Vec::new(),
            changed_type: BTreeMap::new(),
            details: Some("first schema observed".to_string()),
        };
    };

    let prev: BTreeMap<&str, LogicalType> = previous
        .columns
        .iter()
        .map(|c| (c.name.as_str(), c.logical_type))
        .collect();
    let cur: BTreeMap<&str, LogicalType> = current
        .columns
        .iter()
        .map(|c| (c.name.as_str(), c.logical_type))
        .collect();

    let added: Vec<String> = cur
        .keys()
        .filter(|name| !prev.contains_key(**name))
        .map(|name| name.to_string())
        .collect();
    let removed: Vec<String> = prev
        .keys()
        .filter(|name| !cur.contains_key(**name))
        .map(|name| name.to_string())
        .collect();
    let changed_type: BTreeMap<String, TypeChange> = cur
        .iter()
        .filter_map(|(name, to)| {
            prev.get(name)
                .filter(|from| *from != to)
                .map(|from| (name.to_string(), TypeChange { from: *from, to: *to }))
        })
        .collect();

    let breaking = !removed.is_empty() || !changed_type.is_empty();
    let kind = if added.is_empty() && removed.is_empty() && changed_type.is_empty() {
        DriftKind::None
    } else {
        DriftKind::Drift
    };

    DriftReport { kind, breaking, added, removed, changed_type, details: None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Column;

    fn table_of(cols: Vec<(&str, Vec<Value>)>) -> Table {
        Table::new(
            cols.into_iter()
                .map(|(name, values)| Column { name: name.to_string(), values })
                .collect(),
        )
        .unwrap()
    }

    fn obs(cols: &[(&str, LogicalType)]) -> SchemaObservation {
        let mut columns: Vec<ColumnObservation> = cols
            .iter()
            .map(|(name, t)| ColumnObservation { name: name.to_string(), logical_type: *t })
            .collect();
        columns.sort_by(|a, b| a.name.cmp(&b.name));
        let column_count = columns.len();
        SchemaObservation { columns, column_count }
    }

    #[test]
    fn test_fingerprint_is_column_order_independent() {
        let a = observe(&table_of(vec![
            ("a", vec![Value::Str("1".into())]),
            ("b", vec![Value::Str("x".into())]),
        ]));
        let b = observe(&table_of(vec![
            ("b", vec![Value::Str("x".into())]),
            ("a", vec![Value::Str("1".into())]),
        ]));
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_is_row_order_independent() {
        let a = observe(&table_of(vec![(
            "a",
            vec![Value::Str("1".into()), Value::Str("2".into())],
        )]));
        let b = observe(&table_of(vec![(
            "a",
            vec![Value::Str("2".into()), Value::Str("1".into())],
        )]));
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_changes_with_type() {
        let ints = observe(&table_of(vec![("a", vec![Value::Str("1".into())])]));
        let strs = observe(&table_of(vec![("a", vec![Value::Str("one".into())])]));
        assert_ne!(fingerprint(&ints), fingerprint(&strs));
    }

    #[test]
    fn test_infer_logical_types() {
        let table = table_of(vec![
            ("flag", vec![Value::Str("true".into()), Value::Str("False".into())]),
            ("count", vec![Value::Str("1".into()), Value::Null]),
            ("price", vec![Value::Str("1.5".into()), Value::Str("2".into())]),
            ("seen", vec![Value::Str("2026-08-04".into()), Value::Str("2026-08-05".into())]),
            ("name", vec![Value::Str("alice".into()), Value::Str("bob".into())]),
            ("empty", vec![Value::Null, Value::Null]),
        ]);
        let observation = observe(&table);
        let types: BTreeMap<&str, LogicalType> = observation
            .columns
            .iter()
            .map(|c| (c.name.as_str(), c.logical_type))
            .collect();

        assert_eq!(types["flag"], LogicalType::Boolean);
        assert_eq!(types["count"], LogicalType::Integer);
        assert_eq!(types["price"], LogicalType::Number);
        assert_eq!(types["seen"], LogicalType::Datetime);
        assert_eq!(types["name"], LogicalType::String);
        assert_eq!(types["empty"], LogicalType::String);
    }

    #[test]
    fn test_yes_no_columns_are_not_booleans() {
        let table = table_of(vec![("answer", vec![Value::Str("yes".into()), Value::Str("no".into())])]);
        assert_eq!(observe(&table).columns[0].logical_type, LogicalType::String);
    }

    #[test]
    fn test_diff_initial() {
        let current = obs(&[("a", LogicalType::Integer)]);
        let report = diff(None, &current);
        assert_eq!(report.kind, DriftKind::Initial);
        assert!(!report.breaking);
    }

    #[test]
    fn test_diff_no_change() {
        let prev = obs(&[("a", LogicalType::Integer), ("b", LogicalType::String)]);
        let report = diff(Some(&prev), &prev.clone());
        assert_eq!(report.kind, DriftKind::None);
        assert!(!report.breaking);
    }

    #[test]
    fn test_diff_addition_is_not_breaking() {
        let prev = obs(&[("a", LogicalType::Integer)]);
        let cur = obs(&[("a", LogicalType::Integer), ("b", LogicalType::String)]);
        let report = diff(Some(&prev), &cur);
        assert_eq!(report.kind, DriftKind::Drift);
        assert!(!report.breaking);
        assert_eq!(report.added, vec!["b".to_string()]);
    }

    #[test]
    fn test_diff_removal_is_breaking() {
        let prev = obs(&[("a", LogicalType::Integer), ("b", LogicalType::String)]);
        let cur = obs(&[("a", LogicalType::Integer)]);
        let report = diff(Some(&prev), &cur);
        assert!(report.breaking);
        assert_eq!(report.removed, vec!["b".to_string()]);
    }

    #[test]
    fn test_diff_type_change_is_breaking() {
        let prev = obs(&[("a", LogicalType::Integer)]);
        let cur = obs(&[("a", LogicalType::String)]);
        let report = diff(Some(&prev), &cur);
        assert!(report.breaking);
        let change = &report.changed_type["a"];
        assert_eq!(change.from, LogicalType::Integer);
        assert_eq!(change.to, LogicalType::String);
    }

    #[test]
    fn test_observation_json_round_trip() {
        let observation = obs(&[("a", LogicalType::Integer), ("b", LogicalType::Datetime)]);
        let json = serde_json::to_value(&observation).unwrap();
        let back: SchemaObservation = serde_json::from_value(json).unwrap();
        assert_eq!(back, observation);
    }
}
