// Directory walk feeding the tag store one file at a time

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::Indexer;
use crate::error::IndexError;

/// What happened to one file during a walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOutcome {
    Indexed { tags: usize },
    /// Recorded modification time (or content) matches; not re-parsed
    Unchanged,
    /// Over the size threshold
    Skipped,
    Failed,
}

/// Summary counts of one index run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexReport {
    pub indexed: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
    pub tags: usize,
    pub cancelled: bool,
}

impl IndexReport {
    pub fn record(&mut self, outcome: WalkOutcome) {
        match outcome {
            WalkOutcome::Indexed { tags } => {
                self.indexed += 1;
                self.tags += tags;
            }
            WalkOutcome::Unchanged => self.unchanged += 1,
            WalkOutcome::Skipped => self.skipped += 1,
            WalkOutcome::Failed => self.failed += 1,
        }
    }

    pub fn files_seen(&self) -> usize {
        self.indexed + self.unchanged + self.skipped + self.failed
    }
}

/// Cooperative cancellation, checked between files
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One begin/walk/end pass over a directory tree
pub struct IndexRun<'a> {
    indexer: &'a Indexer,
    base_dir: PathBuf,
    files: Vec<PathBuf>,
    report: IndexReport,
}

impl<'a> IndexRun<'a> {
    pub(crate) fn begin(indexer: &'a Indexer, base_dir: &Path) -> Result<Self, IndexError> {
        if !base_dir.is_dir() {
            return Err(IndexError::Io {
                path: base_dir.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
            });
        }

        let paths = indexer.config().path_filter_or_default();
        let mut files = Vec::new();
        let walker = WalkDir::new(base_dir)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0 || !entry.file_type().is_dir() || !is_hidden(entry.file_name())
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry under {}: {}", base_dir.display(), e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path
                .strip_prefix(base_dir)
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/");
            if paths.should_index(&relative) && indexer.can_index_file(path) {
                files.push(path.to_path_buf());
            }
        }

        info!("Found {} PHP files under {}", files.len(), base_dir.display());

        Ok(Self {
            indexer,
            base_dir: base_dir.to_path_buf(),
            files,
            report: IndexReport::default(),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Candidate files in walk order
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Index one file. Failures are logged and counted, never raised, so a
    /// single bad file cannot stop the run.
    pub fn walk(&mut self, path: &Path) -> WalkOutcome {
        let outcome = match self.indexer.walk_file(path) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Failed to index {}: {}", path.display(), e);
                WalkOutcome::Failed
            }
        };
        debug!("{} -> {:?}", path.display(), outcome);
        self.report.record(outcome);
        outcome
    }

    pub fn mark_cancelled(&mut self) {
        self.report.cancelled = true;
    }

    pub fn end_search(self) -> IndexReport {
        info!(
            "Index run over {} finished: {} indexed, {} unchanged, {} skipped, {} failed{}",
            self.base_dir.display(),
            self.report.indexed,
            self.report.unchanged,
            self.report.skipped,
            self.report.failed,
            if self.report.cancelled { " (cancelled)" } else { "" }
        );
        self.report
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().map(|n| n.starts_with('.')).unwrap_or(false)
}
