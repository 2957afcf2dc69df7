// Read-only store of built-in PHP functions, classes and constants

use tracing::info;

use super::db::TagStore;
use super::Tag;
use crate::error::StoreResult;

const NATIVE_TAGS_JSON: &str = include_str!("../../assets/native_tags.json");

/// Built-in tags seeded from the packaged asset into a private in-memory
/// store. Queried alongside the user store, never merged into it.
#[derive(Clone)]
pub struct NativeStore {
    store: TagStore,
    len: usize,
}

impl NativeStore {
    /// Load the packaged seed
    pub fn load() -> StoreResult<Self> {
        Self::from_json(NATIVE_TAGS_JSON)
    }

    pub fn from_json(json: &str) -> StoreResult<Self> {
        let mut tags: Vec<Tag> = serde_json::from_str(json)?;
        for tag in &mut tags {
            tag.is_native = true;
            tag.full_path.clear();
        }

        let store = TagStore::open_in_memory()?;
        let len = store.insert_native_tags(&tags)?;
        info!("Loaded {} native tags", len);

        Ok(Self { store, len })
    }

    pub fn store(&self) -> &TagStore {
        &self.store
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
