//! Error types shared across the Sluice workspace

use thiserror::Error;

/// Result type alias for Sluice operations
pub type Result<T> = std::result::Result<T, SluiceError>;

/// Main error type for Sluice
#[derive(Error, Debug)]
pub enum SluiceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Contract not found for dataset: {0}")]
    ContractNotFound(String),

    #[error("Invalid contract: {0}")]
    ContractInvalid(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Storage error: {0}")]
    Storage(String),
}
