//! Dataset contracts
//!
//! A contract declares a dataset's columns, quality rules, and drift policy.
//! Contracts are YAML documents at `<contracts_dir>/<dataset>.yaml`, loaded
//! and validated on every use so a fixed contract takes effect on the next
//! processing attempt without a restart.
//!
//! Validation is strict: column names follow the same identifier rule as
//! dataset names because they become SQL identifiers in the curated tables.

use serde::Deserialize;
use sluice_common::checksum::sha256_bytes;
use sluice_common::naming::{is_valid_column_name, normalize_dataset_name};
use sluice_common::{Result, SluiceError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Declared logical type of a contract column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    String,
    Integer,
    Number,
    Boolean,
    Datetime,
}

impl ColumnType {
    /// Parse a declared type, accepting the documented aliases.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "string" | "text" => Some(ColumnType::String),
            "integer" | "int" => Some(ColumnType::Integer),
            "number" | "float" | "double" => Some(ColumnType::Number),
            "boolean" | "bool" => Some(ColumnType::Boolean),
            "datetime" | "timestamp" => Some(ColumnType::Datetime),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::String => "string",
            ColumnType::Integer => "integer",
            ColumnType::Number => "number",
            ColumnType::Boolean => "boolean",
            ColumnType::Datetime => "datetime",
        }
    }
}

/// How breaking schema drift is handled for a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriftPolicy {
    #[default]
    Warn,
    Fail,
    Allow,
}

impl DriftPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "warn" => Some(DriftPolicy::Warn),
            "fail" => Some(DriftPolicy::Fail),
            "allow" => Some(DriftPolicy::Allow),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DriftPolicy::Warn => "warn",
            DriftPolicy::Fail => "fail",
            DriftPolicy::Allow => "allow",
        }
    }
}

/// Per-column declaration.
#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub column_type: ColumnType,
    pub required: bool,
    pub unique: bool,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Default for ColumnSpec {
    fn default() -> Self {
        Self {
            column_type: ColumnType::String,
            required: false,
            unique: false,
            min: None,
            max: None,
        }
    }
}

/// Dataset-level quality rules.
#[derive(Debug, Clone, Default)]
pub struct QualityRules {
    /// Per-column maximum tolerated null fraction (0.0..=1.0).
    pub max_null_fraction: BTreeMap<String, f64>,
}

/// A validated, immutable dataset contract.
#[derive(Debug, Clone)]
pub struct DatasetContract {
    pub dataset: String,
    pub description: String,
    pub primary_key: Option<String>,
    /// Columns in declaration order (declaration order shapes the curated table).
    pub columns: Vec<(String, ColumnSpec)>,
    pub quality: QualityRules,
    pub drift_policy: Option<DriftPolicy>,
}

impl DatasetContract {
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, spec)| spec)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    /// Parse and validate a contract from YAML text.
    pub fn from_yaml(raw_yaml: &str) -> Result<Self> {
        if raw_yaml.trim().is_empty() {
            return Err(SluiceError::ContractInvalid("contract YAML is empty".to_string()));
        }

        let raw: RawContract = serde_yaml::from_str(raw_yaml)
            .map_err(|e| SluiceError::ContractInvalid(format!("not a valid contract document: {e}")))?;

        let dataset = normalize_dataset_name(&raw.dataset)?;
        let description = raw.description.unwrap_or_default();

        if raw.columns.is_empty() {
            return Err(SluiceError::ContractInvalid(
                "contract must declare a non-empty 'columns' mapping".to_string(),
            ));
        }

        let mut columns: Vec<(String, ColumnSpec)> = Vec::with_capacity(raw.columns.len());
        for (key, value) in raw.columns {
            let name = match key.as_str() {
                Some(s) => s.to_string(),
                None => {
                    return Err(SluiceError::ContractInvalid(
                        "column names must be strings".to_string(),
                    ))
                },
            };
            if !is_valid_column_name(&name) {
                return Err(SluiceError::ContractInvalid(format!(
                    "invalid column name {name:?}: use lowercase letters/numbers/underscore, \
                     start with a letter, max 63 chars"
                )));
            }

            let raw_spec: Option<RawColumnSpec> = serde_yaml::from_value(value)
                .map_err(|e| SluiceError::ContractInvalid(format!("column {name:?}: {e}")))?;
            let raw_spec = raw_spec.unwrap_or_default();

            let column_type = match raw_spec.column_type {
                None => ColumnType::String,
                Some(ref t) => ColumnType::parse(t).ok_or_else(|| {
                    SluiceError::ContractInvalid(format!(
                        "unsupported type {t:?} for column {name:?}"
                    ))
                })?,
            };

            columns.push((
                name,
                ColumnSpec {
                    column_type,
                    required: raw_spec.required.unwrap_or(false),
                    unique: raw_spec.unique.unwrap_or(false),
                    min: raw_spec.min,
                    max: raw_spec.max,
                },
            ));
        }

        let primary_key = raw
            .primary_key
            .map(|pk| pk.trim().to_string())
            .filter(|pk| !pk.is_empty());
        if let Some(ref pk) = primary_key {
            if !columns.iter().any(|(n, _)| n == pk) {
                return Err(SluiceError::ContractInvalid(format!(
                    "primary_key {pk:?} must be a declared column"
                )));
            }
        }

        let mut quality = QualityRules::default();
        if let Some(raw_quality) = raw.quality {
            for (col, threshold) in raw_quality.max_null_fraction.unwrap_or_default() {
                if !columns.iter().any(|(n, _)| n == &col) {
                    return Err(SluiceError::ContractInvalid(format!(
                        "quality.max_null_fraction references unknown column {col:?}"
                    )));
                }
                if !(0.0..=1.0).contains(&threshold) {
                    return Err(SluiceError::ContractInvalid(format!(
                        "quality.max_null_fraction threshold for {col:?} must be between 0 and 1"
                    )));
                }
                quality.max_null_fraction.insert(col, threshold);
            }
        }

        let drift_policy = match raw.drift_policy {
            None => None,
            Some(p) if p.trim().is_empty() => None,
            Some(p) => Some(DriftPolicy::parse(&p).ok_or_else(|| {
                SluiceError::ContractInvalid(format!(
                    "drift_policy must be one of warn/fail/allow, got {p:?}"
                ))
            })?),
        };

        Ok(DatasetContract {
            dataset,
            description,
            primary_key,
            columns,
            quality,
            drift_policy,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawContract {
    dataset: String,
    description: Option<String>,
    primary_key: Option<String>,
    #[serde(default)]
    columns: serde_yaml::Mapping,
    quality: Option<RawQuality>,
    drift_policy: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawQuality {
    max_null_fraction: Option<BTreeMap<String, f64>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawColumnSpec {
    #[serde(rename = "type")]
    column_type: Option<String>,
    required: Option<bool>,
    unique: Option<bool>,
    min: Option<f64>,
    max: Option<f64>,
}

/// A loaded contract plus the identity of the file it came from.
///
/// The path and raw-bytes sha256 are recorded in lineage artifacts so an
/// ingestion can always be traced to the exact contract revision that
/// gated it.
#[derive(Debug, Clone)]
pub struct ContractDocument {
    pub contract: DatasetContract,
    pub path: PathBuf,
    pub sha256: String,
}

/// Filesystem-backed contract registry: one YAML document per dataset.
#[derive(Debug, Clone)]
pub struct ContractRegistry {
    contracts_dir: PathBuf,
}

impl ContractRegistry {
    pub fn new(contracts_dir: impl Into<PathBuf>) -> Self {
        Self { contracts_dir: contracts_dir.into() }
    }

    pub fn contracts_dir(&self) -> &Path {
        &self.contracts_dir
    }

    /// Load and validate the contract for a dataset.
    pub fn load(&self, dataset: &str) -> Result<ContractDocument> {
        let dataset = normalize_dataset_name(dataset)?;
        let path = self.contracts_dir.join(format!("{dataset}.yaml"));
        if !path.exists() {
            return Err(SluiceError::ContractNotFound(dataset));
        }

        let raw = std::fs::read(&path)?;
        let sha256 = sha256_bytes(&raw);
        let text = String::from_utf8(raw)
            .map_err(|_| SluiceError::ContractInvalid(format!("{}: not UTF-8", path.display())))?;
        let contract = DatasetContract::from_yaml(&text)?;

        Ok(ContractDocument { contract, path, sha256 })
    }
}
