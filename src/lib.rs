//! Incremental PHP tag index.
//!
//! Source files are parsed into tags (classes, methods, functions,
//! properties, constants, namespaces), stored per file in SQLite, and
//! answered through exact, near-match, file, class-or-file and
//! trait-aware lookups.

pub mod config;
pub mod error;
pub mod index;
pub mod indexer;
pub mod query;

pub use config::Config;
pub use error::{IndexError, StoreError};
pub use index::db::TagStore;
pub use index::native::NativeStore;
pub use index::{FileTag, Tag, TagKind};
pub use indexer::walker::{CancelFlag, IndexReport};
pub use indexer::Indexer;
pub use query::{TagSearch, TagSearchEngine};
