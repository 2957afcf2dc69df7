// File watcher for incremental updates

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::walker::{CancelFlag, WalkOutcome};
use super::Indexer;
use crate::error::IndexError;

/// What a file event turned into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    Walked(WalkOutcome),
    Removed,
    Ignored,
}

/// Turns file-system events into re-index / delete calls
pub struct FileWatcher {
    indexer: Arc<Indexer>,
    watch_path: PathBuf,
}

impl FileWatcher {
    pub fn new(indexer: Arc<Indexer>, watch_path: PathBuf) -> Self {
        Self { indexer, watch_path }
    }

    /// Watch until `cancel` is set. Events are applied one at a time so
    /// store writes never overlap.
    pub async fn watch(&self, cancel: CancelFlag) -> Result<()> {
        info!("Starting file watcher for: {}", self.watch_path.display());

        let (tx, mut rx) = mpsc::channel(256);

        // notify delivers on its own thread, outside the runtime
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if tx.blocking_send(event).is_err() {
                        debug!("File event dropped; watcher is shutting down");
                    }
                }
                Err(e) => error!("File watch error: {}", e),
            },
            NotifyConfig::default(),
        )?;

        watcher.watch(&self.watch_path, RecursiveMode::Recursive)?;

        info!("File watcher started. Monitoring for changes...");

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = tokio::time::sleep(Duration::from_millis(250)) => {
                    if cancel.is_cancelled() {
                        info!("File watcher stopped");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn handle_event(&self, event: Event) {
        debug!("File event: {:?}", event);

        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            return;
        }

        for path in event.paths {
            let indexer = Arc::clone(&self.indexer);
            let root = self.watch_path.clone();
            let shown = path.display().to_string();
            let result = tokio::task::spawn_blocking(move || apply_change(&indexer, &root, &path)).await;

            match result {
                Ok(Ok(WatchAction::Ignored)) => {}
                Ok(Ok(action)) => info!("{}: {:?}", shown, action),
                Ok(Err(e)) => warn!("Failed to update index for {}: {}", shown, e),
                Err(e) => error!("Index task for {} panicked: {}", shown, e),
            }
        }
    }
}

/// Bring the store in line with the current state of `path`: re-index it
/// if it exists, drop its tags if it does not.
pub fn apply_change(indexer: &Indexer, root: &Path, path: &Path) -> Result<WatchAction, IndexError> {
    if !indexer.can_index_file(path) {
        return Ok(WatchAction::Ignored);
    }
    let relative = path
        .strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/");
    if !indexer.config().should_index_file(&relative) {
        return Ok(WatchAction::Ignored);
    }

    if path.is_file() {
        Ok(WatchAction::Walked(indexer.walk_file(path)?))
    } else if indexer.delete_file(path)? {
        Ok(WatchAction::Removed)
    } else {
        Ok(WatchAction::Ignored)
    }
}

/// Start the file watcher for a project
pub async fn start_watcher(indexer: Arc<Indexer>, project_path: &str, cancel: CancelFlag) -> Result<()> {
    info!("Initializing file watcher for project: {}", project_path);

    let watcher = FileWatcher::new(indexer, PathBuf::from(project_path));
    watcher.watch(cancel).await
}
