use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;

use kubeship_types::LogFilePath;

/// Thread-safe set of log files that currently have a live session
///
/// A path is managed from the moment a session claims it until the returned
/// [`ManagedFile`] guard is dropped.
#[derive(Clone, Debug, Default)]
pub struct ManagedFileRegistry {
    managed: Arc<RwLock<HashSet<LogFilePath>>>,
}

/// Claim on a managed path, released when dropped
#[derive(Debug)]
pub struct ManagedFile {
    path: LogFilePath,
    registry: ManagedFileRegistry,
}

impl ManagedFileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether some session currently manages `path`
    pub fn is_managed(&self, path: &LogFilePath) -> bool {
        self.managed.read().contains(path)
    }

    /// Claim `path`, or `None` if another session already holds it
    ///
    /// The check and the insert happen under one write lock, so concurrent
    /// claimants for the same path get exactly one success.
    pub fn try_manage(&self, path: &LogFilePath) -> Option<ManagedFile> {
        let mut managed = self.managed.write();
        if !managed.insert(path.clone()) {
            return None;
        }

        Some(ManagedFile {
            path: path.clone(),
            registry: self.clone(),
        })
    }

    /// Number of paths currently managed
    pub fn managed_count(&self) -> usize {
        self.managed.read().len()
    }

    fn abandon(&self, path: &LogFilePath) {
        self.managed.write().remove(path);
    }
}

impl ManagedFile {
    pub fn path(&self) -> &LogFilePath {
        &self.path
    }
}

impl Drop for ManagedFile {
    fn drop(&mut self) {
        self.registry.abandon(&self.path);
    }
}
