//! Raw landing store
//!
//! Content-addressed persistence of original upload bytes. The path scheme
//! `<dataset>/<YYYY-MM-DD>/<sha256><ext>` is immutable: a stored object is
//! never overwritten, so the same bytes land at the same address no matter
//! how many times they are stored.
//!
//! Remote object stores (S3 and friends) implement the same trait at the
//! deployment boundary; the pipeline only ever talks to `RawStore`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sluice_common::checksum::sha256_file;
use sluice_common::naming::normalize_dataset_name;
use std::path::{Path, PathBuf};

/// Identity of a durably stored raw artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub sha256: String,
    pub uri: String,
    pub ext: String,
}

/// Content-addressed, idempotent raw artifact storage.
#[async_trait]
pub trait RawStore: Send + Sync {
    /// Store a local file under the dataset's landing path.
    async fn store(&self, dataset: &str, local_file: &Path) -> Result<StoredArtifact>;

    /// Fetch a stored artifact to a local destination path.
    async fn fetch(&self, uri: &str, dest: &Path) -> Result<()>;
}

/// Filesystem-backed landing zone.
#[derive(Debug, Clone)]
pub struct LocalRawStore {
    root: PathBuf,
}

impl LocalRawStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl RawStore for LocalRawStore {
    async fn store(&self, dataset: &str, local_file: &Path) -> Result<StoredArtifact> {
        let dataset = normalize_dataset_name(dataset)?;
        if !local_file.exists() {
            bail!("source file does not exist: {}", local_file.display());
        }

        let ext = file_extension(local_file);
        let sha256 = sha256_file(local_file)
            .with_context(|| format!("failed to hash {}", local_file.display()))?;

        let day = Utc::now().format("%Y-%m-%d").to_string();
        let dir = self.root.join(&dataset).join(&day);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let raw_path = dir.join(format!("{sha256}{ext}"));
        if !raw_path.exists() {
            tokio::fs::copy(local_file, &raw_path)
                .await
                .with_context(|| format!("failed to copy into {}", raw_path.display()))?;
        }

        Ok(StoredArtifact {
            sha256,
            uri: raw_path.to_string_lossy().into_owned(),
            ext,
        })
    }

    async fn fetch(&self, uri: &str, dest: &Path) -> Result<()> {
        tokio::fs::copy(uri, dest)
            .await
            .with_context(|| format!("failed to fetch {uri}"))?;
        Ok(())
    }
}

/// Lowercased extension including the dot, or empty.
pub fn file_extension(path: &Path) -> String {
    path.extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}
