// Tag indexing: parsing, directory walks and file watching

pub mod parser;
pub mod walker;
pub mod watcher;

use chrono::{DateTime, Utc};
use std::path::Path;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::IndexError;
use crate::index::db::TagStore;
use crate::index::{FileTag, TagParser};
use parser::PhpParser;
use walker::{CancelFlag, IndexReport, IndexRun, WalkOutcome};

/// Coordinates parsing and storage. All store writes go through here.
pub struct Indexer {
    parser: Box<dyn TagParser + Send + Sync>,
    store: TagStore,
    config: Config,
}

impl Indexer {
    pub fn new(store: TagStore, config: Config) -> Self {
        let parser = PhpParser::with_extensions(&config.indexing.extensions);
        Self::with_parser(store, config, Box::new(parser))
    }

    pub fn with_parser(store: TagStore, config: Config, parser: Box<dyn TagParser + Send + Sync>) -> Self {
        Self { parser, store, config }
    }

    /// Open (or create) the project's store and build an indexer on it
    pub fn open(project_dir: impl AsRef<Path>, config: Config) -> Result<Self, IndexError> {
        let store = TagStore::open(config.db_path(project_dir))?;
        Ok(Self::new(store, config))
    }

    pub fn store(&self) -> &TagStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn can_index_file(&self, path: &Path) -> bool {
        let path = path.to_string_lossy();
        self.config.is_php_file(&path) && self.parser.can_parse(&path)
    }

    /// Enumerate candidate files under `base_dir`
    pub fn begin_search(&self, base_dir: impl AsRef<Path>) -> Result<IndexRun<'_>, IndexError> {
        IndexRun::begin(self, base_dir.as_ref())
    }

    /// Full walk of `base_dir`, checking `cancel` between files
    pub fn index_directory(&self, base_dir: impl AsRef<Path>, cancel: &CancelFlag) -> Result<IndexReport, IndexError> {
        let mut run = self.begin_search(base_dir)?;
        let files = run.files().to_vec();
        for path in &files {
            if cancel.is_cancelled() {
                info!("Index run cancelled");
                run.mark_cancelled();
                break;
            }
            run.walk(path);
        }
        Ok(run.end_search())
    }

    /// Index one on-disk file unless its recorded state is current
    pub(crate) fn walk_file(&self, path: &Path) -> Result<WalkOutcome, IndexError> {
        let io_err = |source| IndexError::Io {
            path: path.to_path_buf(),
            source,
        };

        let metadata = std::fs::metadata(path).map_err(io_err)?;
        let full_path = path.to_string_lossy().to_string();
        if metadata.len() > self.config.indexing.max_file_size {
            debug!("Skipping {} ({} bytes)", path.display(), metadata.len());
            // tags from when the file was still small enough are stale now
            if self.store.delete_file_tags(&full_path)? {
                debug!("Dropped previously indexed tags of {}", full_path);
            }
            return Ok(WalkOutcome::Skipped);
        }

        let modified_at: DateTime<Utc> = metadata.modified().map_err(io_err)?.into();
        let existing = self.store.file_tag_by_path(&full_path)?;

        if let Some(existing) = &existing {
            if !existing.is_new && existing.modified_at.timestamp_millis() == modified_at.timestamp_millis() {
                return Ok(WalkOutcome::Unchanged);
            }
        }

        let bytes = std::fs::read(path).map_err(io_err)?;
        let content_hash = blake3::hash(&bytes).to_hex().to_string();

        if let Some(existing) = &existing {
            if !existing.is_new && existing.content_hash == content_hash {
                self.store.touch_file(&full_path, modified_at)?;
                return Ok(WalkOutcome::Unchanged);
            }
        }

        let source = String::from_utf8_lossy(&bytes);
        let mut file = FileTag::new(full_path, modified_at, false);
        file.content_hash = content_hash;
        let stored = self.replace(&file, &source)?;

        Ok(WalkOutcome::Indexed {
            tags: stored.tag_count,
        })
    }

    /// Index an editor buffer. `is_new` marks content not yet backed by a
    /// file on disk.
    pub fn build_resource_cache_for_file(
        &self,
        file_name: &str,
        source: &str,
        is_new: bool,
    ) -> Result<FileTag, IndexError> {
        let modified_at = if is_new {
            Utc::now()
        } else {
            std::fs::metadata(file_name)
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now())
        };

        let mut file = FileTag::new(file_name, modified_at, is_new);
        file.content_hash = blake3::hash(source.as_bytes()).to_hex().to_string();
        self.replace(&file, source)
    }

    fn replace(&self, file: &FileTag, source: &str) -> Result<FileTag, IndexError> {
        let parsed = self.parser.parse(source, &file.full_path)?;
        let stored = self.store.replace_file_tags(file, &parsed)?;
        debug!("Indexed {}: {} tags", stored.full_path, stored.tag_count);
        Ok(stored)
    }

    /// Drop a file's tags. Returns false if the file was never indexed.
    pub fn delete_file(&self, path: impl AsRef<Path>) -> Result<bool, IndexError> {
        let full_path = path.as_ref().to_string_lossy();
        Ok(self.store.delete_file_tags(&full_path)?)
    }

    /// Remove entries for files that no longer exist on disk. Buffers
    /// marked `is_new` are kept.
    pub fn prune_missing(&self) -> Result<usize, IndexError> {
        let mut removed = 0;
        for file in self.store.all_file_tags()? {
            if file.is_new || Path::new(&file.full_path).exists() {
                continue;
            }
            if self.store.delete_file_tags(&file.full_path)? {
                debug!("Pruned {}", file.full_path);
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Pruned {} missing files", removed);
        }
        Ok(removed)
    }

    /// Wipe every stored tag and file
    pub fn rebuild(&self) -> Result<(), IndexError> {
        info!("Clearing tag store for rebuild");
        Ok(self.store.clear()?)
    }
}
