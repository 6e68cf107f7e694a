//! Credential file caching
//!
//! The service-account token and cluster CA certificate are read the first
//! time a pod lookup needs them and kept for the lifetime of the process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Error)]
#[error("failed to read credential file {}: {source}", .path.display())]
pub struct CredentialError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Process-wide cache of small credential files
///
/// Entries are never invalidated. A failed read is not cached, so a file that
/// appears later is picked up by the next lookup.
#[derive(Debug, Default)]
pub struct CredentialCache {
    /// Map of file path to its content
    entries: Mutex<HashMap<PathBuf, Arc<[u8]>>>,

    /// Number of reads that actually hit the disk
    disk_reads: AtomicU64,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Content of `path`, reading it from disk only on the first call
    pub async fn get(&self, path: &Path) -> Result<Arc<[u8]>, CredentialError> {
        // Held across the read so concurrent first lookups share a single read
        let mut entries = self.entries.lock().await;
        if let Some(content) = entries.get(path) {
            return Ok(Arc::clone(content));
        }

        self.disk_reads.fetch_add(1, Ordering::Relaxed);
        let content: Arc<[u8]> = tokio::fs::read(path)
            .await
            .map_err(|source| CredentialError {
                path: path.to_path_buf(),
                source,
            })?
            .into();

        debug!(path = %path.display(), bytes = content.len(), "cached credential file");
        entries.insert(path.to_path_buf(), Arc::clone(&content));
        Ok(content)
    }

    /// How many times a credential file was read from disk
    pub fn disk_reads(&self) -> u64 {
        self.disk_reads.load(Ordering::Relaxed)
    }
}
