//! In-memory tabular batch model
//!
//! A decoded batch is an ordered set of named columns; each cell is a tagged
//! `Value`. Column sets vary at runtime (they come from user files), so the
//! contract-type coercions live here as explicit functions on `Value` rather
//! than in the storage layer.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::io::Read;
use std::path::Path;

/// A single cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Datetime(DateTime<Utc>),
}

/// Tokens accepted as booleans by the quality gate (case-insensitive).
pub const BOOLEAN_TOKENS: [&str; 8] = ["true", "false", "1", "0", "yes", "no", "y", "n"];

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view of the value, parsing strings when necessary.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Str(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            _ => None,
        }
    }

    /// Integer view: numeric with no fractional remainder.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) if (v % 1.0).abs() < 1e-9 => Some(*v as i64),
            Value::Str(s) => {
                let t = s.trim();
                if let Ok(v) = t.parse::<i64>() {
                    return Some(v);
                }
                t.parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite() && (v % 1.0).abs() < 1e-9)
                    .map(|v| v as i64)
            },
            _ => None,
        }
    }

    /// Boolean view over the accepted token set.
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Str(s) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" | "y" => Some(true),
                "false" | "0" | "no" | "n" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Datetime view, parsing common string encodings as UTC.
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Datetime(v) => Some(*v),
            Value::Str(s) => parse_datetime_str(s.trim()),
            _ => None,
        }
    }

    /// Text rendering for storage in a TEXT column; `None` for null.
    pub fn render(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(v) => Some(v.to_string()),
            Value::Int(v) => Some(v.to_string()),
            Value::Float(v) => Some(v.to_string()),
            Value::Str(s) => Some(s.clone()),
            Value::Datetime(v) => Some(v.to_rfc3339()),
        }
    }
}

fn parse_datetime_str(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    for fmt in ["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
        }
    }
    None
}

/// A named column and its cells.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub values: Vec<Value>,
}

/// An ordered collection of equal-length columns.
#[derive(Debug, Clone)]
pub struct Table {
    columns: Vec<Column>,
    row_count: usize,
}

impl Table {
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        let row_count = columns.first().map(|c| c.values.len()).unwrap_or(0);
        for col in &columns {
            if col.values.len() != row_count {
                bail!(
                    "column '{}' has {} values, expected {}",
                    col.name,
                    col.values.len(),
                    row_count
                );
            }
        }
        Ok(Self { columns, row_count })
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Decode a CSV stream into a `Table`.
///
/// Empty cells become `Value::Null`; everything else stays a string. Type
/// interpretation is the job of schema inference and the quality gate, not
/// the decoder.
pub fn read_csv<R: Read>(reader: R) -> Result<Table> {
    let mut rdr = csv::ReaderBuilder::new().flexible(false).from_reader(reader);

    let headers: Vec<String> = rdr
        .headers()
        .context("failed to read CSV header row")?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut columns: Vec<Column> = headers
        .into_iter()
        .map(|name| Column { name, values: Vec::new() })
        .collect();

    for (idx, record) in rdr.records().enumerate() {
        let record = record.with_context(|| format!("failed to read CSV record {}", idx + 1))?;
        for (col, field) in columns.iter_mut().zip(record.iter()) {
            if field.is_empty() {
                col.values.push(Value::Null);
            } else {
                col.values.push(Value::Str(field.to_string()));
            }
        }
    }

    Table::new(columns)
}

/// Decode a CSV file into a `Table`.
pub fn read_csv_path(path: impl AsRef<Path>) -> Result<Table> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    read_csv(file)
}
