//! Log file discovery
//!
//! Starts a session for every file already in the log directory, then one
//! for every file created afterwards.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info};

use kubeship_gelf::MessageForwarder;
use kubeship_k8s::PodLookup;
use kubeship_logs::{LogFilePath, SessionContext, spawn_session};

/// Absolute paths of the directory's entries, sorted
///
/// Directories are included; sessions skip them.
pub fn list_log_files(dir: &Path, only_log_suffix: bool) -> io::Result<Vec<LogFilePath>> {
    let dir = std::path::absolute(dir)?;
    let mut files = Vec::new();

    for entry in std::fs::read_dir(&dir)? {
        let path = LogFilePath::new(entry?.path());
        if only_log_suffix && !path.has_log_suffix() {
            continue;
        }
        files.push(path);
    }

    files.sort();
    Ok(files)
}

/// Watches the log directory and starts tail sessions
pub struct Discovery<L, F> {
    dir: PathBuf,
    only_log_suffix: bool,
    ctx: SessionContext<L, F>,
}

impl<L, F> Discovery<L, F>
where
    L: PodLookup + 'static,
    F: MessageForwarder + 'static,
{
    pub fn new(dir: impl Into<PathBuf>, only_log_suffix: bool, ctx: SessionContext<L, F>) -> Self {
        Self {
            dir: dir.into(),
            only_log_suffix,
            ctx,
        }
    }

    /// Run until cancelled
    ///
    /// Errors are fatal: the directory cannot be listed or watched, or the
    /// watcher fails.
    pub async fn run(&self) -> Result<()> {
        let dir = std::path::absolute(&self.dir)
            .with_context(|| format!("error reading from logs dir {}", self.dir.display()))?;

        let files = list_log_files(&dir, self.only_log_suffix)
            .with_context(|| format!("error reading from logs dir {}", dir.display()))?;
        info!(dir = %dir.display(), files = files.len(), "starting sessions for existing files");
        for path in files {
            self.start(path);
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            notify::Config::default(),
        )
        .context("failed to create file watcher")?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch logs dir {}", dir.display()))?;
        info!(dir = %dir.display(), "watching for new log files");

        loop {
            let event = tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => {
                    info!("discovery stopped");
                    return Ok(());
                }
                event = rx.recv() => event,
            };

            let Some(event) = event else {
                bail!("file watcher channel closed");
            };
            let event = event.context("file watcher error")?;

            if let EventKind::Create(_) = event.kind {
                for path in event.paths {
                    self.start(LogFilePath::new(path));
                }
            }
        }
    }

    fn start(&self, path: LogFilePath) {
        if self.only_log_suffix && !path.has_log_suffix() {
            return;
        }
        if self.ctx.registry.is_managed(&path) {
            debug!(path = %path, "already tailing");
            return;
        }

        debug!(path = %path, "starting session");
        // Sessions run detached; the registry tracks which are live
        drop(spawn_session(path, self.ctx.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use kubeship_gelf::ForwardError;
    use kubeship_k8s::ResolveError;
    use kubeship_logs::{FollowConfig, ManagedFileRegistry, SessionConfig};
    use kubeship_types::PodRecord;
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    struct OptedIn;

    impl PodLookup for OptedIn {
        async fn resolve(&self, name: &str, namespace: &str) -> Result<PodRecord, ResolveError> {
            Ok(PodRecord::new(name, namespace)
                .with_node_name("node-1")
                .with_annotation("logging", "enabled"))
        }
    }

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<String>>,
    }

    impl MessageForwarder for Recorder {
        async fn push(&self, message: String, _cancel: &CancellationToken) -> Result<(), ForwardError> {
            self.messages.lock().push(message);
            Ok(())
        }
    }

    fn context(recorder: Arc<Recorder>) -> SessionContext<OptedIn, Recorder> {
        SessionContext::new(
            Arc::new(OptedIn),
            recorder,
            ManagedFileRegistry::new(),
            SessionConfig {
                follow: FollowConfig {
                    poll_interval: Duration::from_millis(10),
                    ..Default::default()
                },
                ..Default::default()
            },
            CancellationToken::new(),
        )
    }

    fn line(text: &str) -> String {
        format!("{{\"log\":\"{text}\",\"time\":\"2024-01-15T10:30:00Z\"}}\n")
    }

    #[test]
    fn test_list_log_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b_prod_2.log"), "").unwrap();
        std::fs::write(dir.path().join("a_prod_1.log"), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("subdir")).unwrap();

        let all = list_log_files(dir.path(), false).unwrap();
        assert_eq!(all.len(), 4);
        assert!(all.iter().all(|p| p.as_path().is_absolute()));
        assert_eq!(all[0].file_name(), Some("a_prod_1.log"));

        let logs = list_log_files(dir.path(), true).unwrap();
        let names: Vec<_> = logs.iter().filter_map(|p| p.file_name()).collect();
        assert_eq!(names, ["a_prod_1.log", "b_prod_2.log"]);
    }

    #[test]
    fn test_list_missing_dir() {
        assert!(list_log_files(Path::new("/nonexistent/kubeship/logs"), false).is_err());
    }

    #[tokio::test]
    async fn test_missing_dir_is_fatal() {
        let discovery = Discovery::new(
            "/nonexistent/kubeship/logs",
            false,
            context(Arc::new(Recorder::default())),
        );
        let err = discovery.run().await.unwrap_err();
        assert!(err.to_string().contains("error reading from logs dir"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tails_existing_and_created_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("api_prod_1.log"), line("existing")).unwrap();

        let recorder = Arc::new(Recorder::default());
        let ctx = context(Arc::clone(&recorder));
        let discovery = Discovery::new(dir.path(), false, ctx.clone());
        let handle = tokio::spawn(async move { discovery.run().await });

        let wait_for = |count: usize| {
            let recorder = Arc::clone(&recorder);
            async move {
                tokio::time::timeout(Duration::from_secs(5), async {
                    while recorder.messages.lock().len() < count {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                })
                .await
                .expect("timed out waiting for forwarded messages");
            }
        };

        wait_for(1).await;
        // Let the watcher attach before creating the next file
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(dir.path().join("web_prod_2.log"), line("created")).unwrap();
        wait_for(2).await;

        assert_eq!(ctx.registry.managed_count(), 2);
        let messages = recorder.messages.lock().clone();
        assert!(messages.iter().any(|m| m.contains("existing")));
        assert!(messages.iter().any(|m| m.contains("created")));

        ctx.cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
