//! Naming and identifier validation
//!
//! User-controlled identifiers end up as directory names in the raw landing
//! zone, contract filenames, and database identifiers (`curated_<dataset>`).
//! The rules here are strict on purpose: they prevent path traversal, casing
//! surprises (Postgres lowercases unquoted identifiers), and injection via
//! dynamically constructed identifiers.

use crate::error::{Result, SluiceError};
use regex::Regex;
use std::sync::LazyLock;

#[allow(clippy::expect_used)]
fn compiled(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static regex is valid")
}

static IDENT_RE: LazyLock<Regex> = LazyLock::new(|| compiled(r"^[a-z][a-z0-9_]{0,62}$"));

static SHA256_HEX_RE: LazyLock<Regex> = LazyLock::new(|| compiled(r"^[0-9a-f]{64}$"));

static DAY_RE: LazyLock<Regex> = LazyLock::new(|| compiled(r"^\d{4}-\d{2}-\d{2}$"));

/// Normalize and validate a dataset name.
///
/// Mixed-case input is accepted and lowercased; anything that does not match
/// `^[a-z][a-z0-9_]{0,62}$` after normalization is rejected.
pub fn normalize_dataset_name(dataset: &str) -> Result<String> {
    let d = dataset.trim().to_lowercase();
    if d.is_empty() {
        return Err(SluiceError::InvalidIdentifier("dataset is required".to_string()));
    }
    if !IDENT_RE.is_match(&d) {
        return Err(SluiceError::InvalidIdentifier(format!(
            "invalid dataset name {dataset:?}: use lowercase letters/numbers/underscore, \
             start with a letter, max 63 chars"
        )));
    }
    Ok(d)
}

/// Whether `name` is a valid column identifier (same rule as dataset names).
pub fn is_valid_column_name(name: &str) -> bool {
    IDENT_RE.is_match(name)
}

/// Whether `value` is a lowercase 64-char hex SHA-256 digest.
pub fn is_valid_sha256_hex(value: &str) -> bool {
    SHA256_HEX_RE.is_match(&value.to_lowercase())
}

/// Parsed reference to an immutable raw object in the landing zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawObjectRef {
    pub dataset: String,
    pub day: String,
    pub sha256: String,
    pub ext: String,
    pub object_name: String,
}

/// Build an object name for a raw artifact.
///
/// `raw_prefix` may contain slashes (e.g. "raw/dev").
pub fn build_raw_object_name(
    raw_prefix: &str,
    dataset: &str,
    day: &str,
    sha256: &str,
    ext: &str,
) -> String {
    let prefix = raw_prefix.trim_matches('/');
    let mut ext_norm = ext.to_lowercase();
    if !ext_norm.is_empty() && !ext_norm.starts_with('.') {
        ext_norm = format!(".{ext_norm}");
    }

    if prefix.is_empty() {
        format!("{dataset}/{day}/{sha256}{ext_norm}")
    } else {
        format!("{prefix}/{dataset}/{day}/{sha256}{ext_norm}")
    }
}

/// Parse a raw object name of the shape
/// `<raw_prefix>/<dataset>/<YYYY-MM-DD>/<sha256><ext>`.
///
/// Returns `None` if the name does not match the scheme the landing store
/// writes. The day partition and sha256 are both checked so that arbitrary
/// objects in a shared bucket never register ingestions.
pub fn parse_raw_object_name(raw_prefix: &str, object_name: &str) -> Option<RawObjectRef> {
    let obj = object_name.trim_start_matches('/');
    if obj.is_empty() {
        return None;
    }

    let prefix = raw_prefix.trim_matches('/');
    let remainder = if prefix.is_empty() {
        obj
    } else {
        obj.strip_prefix(prefix)?.strip_prefix('/')?
    };

    let parts: Vec<&str> = remainder.split('/').collect();
    if parts.len() != 3 {
        return None;
    }
    let (dataset, day, filename) = (parts[0], parts[1], parts[2]);

    if !DAY_RE.is_match(day) {
        return None;
    }

    let (sha, ext) = match filename.rfind('.') {
        Some(idx) => (&filename[..idx], &filename[idx..]),
        None => (filename, ""),
    };
    let sha = sha.to_lowercase();
    if !is_valid_sha256_hex(&sha) {
        return None;
    }

    Some(RawObjectRef {
        dataset: dataset.to_string(),
        day: day.to_string(),
        sha256: sha,
        ext: ext.to_lowercase(),
        object_name: obj.to_string(),
    })
}
