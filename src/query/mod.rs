// Tag search: query parsing, match strategies and result cursors

pub mod engine;
pub mod results;
pub mod search;

pub use engine::TagSearchEngine;
pub use results::{ClassOrFile, ClassOrFileResult, FileTagResult, TagResult, TraitTag, TraitTagResult};
pub use search::TagSearch;
