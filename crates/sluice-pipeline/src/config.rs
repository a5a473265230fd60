//! Configuration management

use crate::contract::DriftPolicy;
use std::path::PathBuf;

// ============================================================================
// Pipeline Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/sluice";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default raw landing zone root.
pub const DEFAULT_RAW_DATA_DIR: &str = "./data/raw";

/// Default contracts directory.
pub const DEFAULT_CONTRACTS_DIR: &str = "./data/contracts";

/// Default object-name prefix for the raw landing zone in a shared bucket.
pub const DEFAULT_RAW_PREFIX: &str = "raw";

/// Default allowed upload extensions (comma-separated).
pub const DEFAULT_ALLOWED_FILE_EXTS: &str = ".csv";

/// Default upload size cap in megabytes.
pub const DEFAULT_MAX_FILE_MB: u64 = 50;

/// Default drift policy when the contract does not declare one.
pub const DEFAULT_DRIFT_POLICY: DriftPolicy = DriftPolicy::Warn;

/// Default heartbeat age after which a PROCESSING row counts as stuck.
pub const DEFAULT_PROCESSING_TTL_SECS: i64 = 900;

/// Default per-run cap for the stuck-row reclaimer.
pub const DEFAULT_RECLAIM_MAX_PER_RUN: i64 = 50;

/// Default cap on processing attempts per ingestion. A safety valve so
/// pathological inputs that always fail cannot churn a queue forever.
pub const DEFAULT_MAX_PROCESSING_ATTEMPTS: i32 = 5;

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub database_max_connections: u32,
    pub raw_data_dir: PathBuf,
    pub contracts_dir: PathBuf,
    pub raw_prefix: String,
    pub allowed_file_exts: Vec<String>,
    pub max_file_mb: u64,
    pub drift_policy_default: DriftPolicy,
    pub processing_ttl_secs: i64,
    pub reclaim_max_per_run: i64,
    pub max_processing_attempts: i32,
}

impl Settings {
    /// Load configuration from environment and defaults.
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let settings = Settings {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
            database_max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_DATABASE_MAX_CONNECTIONS),
            raw_data_dir: std::env::var("RAW_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_RAW_DATA_DIR)),
            contracts_dir: std::env::var("CONTRACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONTRACTS_DIR)),
            raw_prefix: std::env::var("RAW_PREFIX")
                .unwrap_or_else(|_| DEFAULT_RAW_PREFIX.to_string()),
            allowed_file_exts: split_exts(
                &std::env::var("ALLOWED_FILE_EXTS")
                    .unwrap_or_else(|_| DEFAULT_ALLOWED_FILE_EXTS.to_string()),
            ),
            max_file_mb: std::env::var("MAX_FILE_MB")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_FILE_MB),
            drift_policy_default: std::env::var("DRIFT_POLICY_DEFAULT")
                .ok()
                .and_then(|s| DriftPolicy::parse(&s))
                .unwrap_or(DEFAULT_DRIFT_POLICY),
            processing_ttl_secs: std::env::var("PROCESSING_TTL_SECONDS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_PROCESSING_TTL_SECS),
            reclaim_max_per_run: std::env::var("RECLAIM_MAX_PER_RUN")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_RECLAIM_MAX_PER_RUN),
            max_processing_attempts: std::env::var("MAX_PROCESSING_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_PROCESSING_ATTEMPTS)
                .max(1),
        };

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database_url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.database_max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }
        if self.allowed_file_exts.is_empty() {
            anyhow::bail!("At least one allowed file extension is required");
        }
        if self.max_file_mb == 0 {
            anyhow::bail!("MAX_FILE_MB must be greater than 0");
        }
        if self.processing_ttl_secs < 30 {
            anyhow::bail!("PROCESSING_TTL_SECONDS must be at least 30");
        }
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            database_max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            raw_data_dir: PathBuf::from(DEFAULT_RAW_DATA_DIR),
            contracts_dir: PathBuf::from(DEFAULT_CONTRACTS_DIR),
            raw_prefix: DEFAULT_RAW_PREFIX.to_string(),
            allowed_file_exts: split_exts(DEFAULT_ALLOWED_FILE_EXTS),
            max_file_mb: DEFAULT_MAX_FILE_MB,
            drift_policy_default: DEFAULT_DRIFT_POLICY,
            processing_ttl_secs: DEFAULT_PROCESSING_TTL_SECS,
            reclaim_max_per_run: DEFAULT_RECLAIM_MAX_PER_RUN,
            max_processing_attempts: DEFAULT_MAX_PROCESSING_ATTEMPTS,
        }
    }
}

fn split_exts(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .map(|v| if v.starts_with('.') { v } else { format!(".{v}") })
        .collect()
}
