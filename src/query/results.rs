// Resumable, order-preserving result cursors

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::{StoreError, StoreResult};
use crate::index::db::{TagFilter, TagOrder, TagStore};
use crate::index::{FileTag, Tag};

/// Keyset-paged tag query against one store
pub(crate) struct PagedSource {
    store: TagStore,
    filter: TagFilter,
    order: TagOrder,
    page_size: usize,
    buffer: VecDeque<Tag>,
    cursor: Option<Tag>,
    exhausted: bool,
}

impl PagedSource {
    pub(crate) fn new(store: TagStore, filter: TagFilter, order: TagOrder, page_size: usize) -> Self {
        Self {
            store,
            filter,
            order,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            cursor: None,
            exhausted: false,
        }
    }

    fn fill(&mut self) -> StoreResult<()> {
        if !self.buffer.is_empty() || self.exhausted {
            return Ok(());
        }
        let page = self
            .store
            .fetch_tags(&self.filter, self.order, self.cursor.as_ref(), self.page_size)?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.cursor = Some(last.clone());
        }
        self.buffer.extend(page);
        Ok(())
    }
}

/// One ordered input of a merged result
pub(crate) enum Source {
    Paged(PagedSource),
    Fixed(VecDeque<Tag>),
}

impl Source {
    fn peek(&mut self) -> StoreResult<Option<&Tag>> {
        match self {
            Source::Paged(paged) => {
                paged.fill()?;
                Ok(paged.buffer.front())
            }
            Source::Fixed(tags) => Ok(tags.front()),
        }
    }

    fn pop(&mut self) -> StoreResult<Option<Tag>> {
        match self {
            Source::Paged(paged) => {
                paged.fill()?;
                Ok(paged.buffer.pop_front())
            }
            Source::Fixed(tags) => Ok(tags.pop_front()),
        }
    }
}

/// Tag cursor. Several sources are merged by sort key; on equal keys the
/// earlier source wins, which keeps user tags ahead of native ones.
pub struct TagResult {
    sources: Vec<Source>,
    order: TagOrder,
    lookahead: Option<Tag>,
    current: Option<Tag>,
    done: bool,
}

impl TagResult {
    pub(crate) fn merged(sources: Vec<Source>, order: TagOrder) -> Self {
        Self {
            sources,
            order,
            lookahead: None,
            current: None,
            done: false,
        }
    }

    pub(crate) fn from_tags(tags: Vec<Tag>, order: TagOrder) -> Self {
        Self::merged(vec![Source::Fixed(tags.into())], order)
    }

    pub fn empty() -> Self {
        Self::merged(Vec::new(), TagOrder::Key)
    }

    fn pull(&mut self) -> StoreResult<Option<Tag>> {
        let order = self.order;
        let mut best: Option<(usize, (String, String, String))> = None;
        for (index, source) in self.sources.iter_mut().enumerate() {
            if let Some(tag) = source.peek()? {
                let key = order.sort_key(tag);
                if best.as_ref().map_or(true, |(_, lowest)| key < *lowest) {
                    best = Some((index, key));
                }
            }
        }
        match best {
            Some((index, _)) => self.sources[index].pop(),
            None => Ok(None),
        }
    }

    /// True if another tag is available. Does not consume it.
    pub fn more(&mut self) -> StoreResult<bool> {
        if self.done {
            return Ok(false);
        }
        if self.lookahead.is_none() {
            match self.pull() {
                Ok(Some(tag)) => self.lookahead = Some(tag),
                Ok(None) => {
                    self.done = true;
                    return Ok(false);
                }
                Err(e) => {
                    self.done = true;
                    return Err(e);
                }
            }
        }
        Ok(true)
    }

    /// Move to the next tag. Returns false once the sequence is exhausted.
    pub fn advance(&mut self) -> StoreResult<bool> {
        if !self.more()? {
            self.current = None;
            return Ok(false);
        }
        self.current = self.lookahead.take();
        Ok(true)
    }

    pub fn current(&self) -> Option<&Tag> {
        self.current.as_ref()
    }
}

impl Iterator for TagResult {
    type Item = Result<Tag, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(true) => self.current.clone().map(Ok),
            Ok(false) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Line counts of files on disk, cached per modification time
#[derive(Clone, Default)]
pub struct LineCounts(Arc<DashMap<String, (i64, usize)>>);

impl LineCounts {
    /// None when the file cannot be read
    pub fn line_count(&self, path: &str) -> Option<usize> {
        let metadata = std::fs::metadata(path).ok()?;
        let modified = metadata
            .modified()
            .ok()
            .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
            .unwrap_or(0);

        let cached = self.0.get(path).map(|entry| *entry.value());
        if let Some((at, count)) = cached {
            if at == modified {
                return Some(count);
            }
        }

        let bytes = std::fs::read(path).ok()?;
        let count = count_lines(&bytes);
        self.0.insert(path.to_string(), (modified, count));
        Some(count)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn count_lines(bytes: &[u8]) -> usize {
    if bytes.is_empty() {
        return 0;
    }
    let newlines = bytes.iter().filter(|b| **b == b'\n').count();
    if bytes.ends_with(b"\n") {
        newlines
    } else {
        newlines + 1
    }
}

/// File cursor for basename searches
pub struct FileTagResult {
    store: Option<TagStore>,
    fragment: String,
    source_dirs: Vec<String>,
    page_size: usize,
    buffer: VecDeque<FileTag>,
    cursor: Option<FileTag>,
    exhausted: bool,
    line_number: Option<i32>,
    line_counts: LineCounts,
    lookahead: Option<FileTag>,
    current: Option<FileTag>,
}

impl FileTagResult {
    pub(crate) fn new(
        store: TagStore,
        fragment: String,
        source_dirs: Vec<String>,
        page_size: usize,
        line_number: Option<i32>,
        line_counts: LineCounts,
    ) -> Self {
        Self {
            store: Some(store),
            fragment,
            source_dirs,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            cursor: None,
            exhausted: false,
            line_number,
            line_counts,
            lookahead: None,
            current: None,
        }
    }

    pub fn empty() -> Self {
        Self {
            store: None,
            fragment: String::new(),
            source_dirs: Vec::new(),
            page_size: 1,
            buffer: VecDeque::new(),
            cursor: None,
            exhausted: true,
            line_number: None,
            line_counts: LineCounts::default(),
            lookahead: None,
            current: None,
        }
    }

    /// Files that are unreadable, unsaved, or shorter than the requested
    /// line are dropped
    fn accepts(&self, file: &FileTag) -> bool {
        let Some(line) = self.line_number else {
            return true;
        };
        if file.is_new || line < 1 {
            return false;
        }
        self.line_counts
            .line_count(&file.full_path)
            .map_or(false, |count| line as usize <= count)
    }

    fn pull(&mut self) -> StoreResult<Option<FileTag>> {
        loop {
            if self.buffer.is_empty() && !self.exhausted {
                let Some(store) = &self.store else {
                    return Ok(None);
                };
                let page =
                    store.fetch_file_tags(&self.fragment, &self.source_dirs, self.cursor.as_ref(), self.page_size)?;
                if page.len() < self.page_size {
                    self.exhausted = true;
                }
                if let Some(last) = page.last() {
                    self.cursor = Some(last.clone());
                }
                self.buffer.extend(page);
            }

            let Some(file) = self.buffer.pop_front() else {
                return Ok(None);
            };
            if self.accepts(&file) {
                return Ok(Some(file));
            }
        }
    }

    pub fn more(&mut self) -> StoreResult<bool> {
        if self.lookahead.is_none() {
            match self.pull() {
                Ok(next) => self.lookahead = next,
                Err(e) => {
                    self.exhausted = true;
                    self.buffer.clear();
                    return Err(e);
                }
            }
        }
        Ok(self.lookahead.is_some())
    }

    pub fn advance(&mut self) -> StoreResult<bool> {
        let more = self.more()?;
        self.current = self.lookahead.take();
        Ok(more)
    }

    pub fn current(&self) -> Option<&FileTag> {
        self.current.as_ref()
    }
}

impl Iterator for FileTagResult {
    type Item = Result<FileTag, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(true) => self.current.clone().map(Ok),
            Ok(false) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// A trait member as seen through a class's `use` clause
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraitTag {
    /// The trait's own declaration
    pub tag: Tag,
    /// Fully-qualified trait the member came from
    pub trait_name: String,
    /// Name given by an `as` rule, if any
    pub alias: Option<String>,
}

impl TraitTag {
    /// Name the member is reachable under from the using class
    pub fn exposed_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.tag.identifier)
    }

    /// The trait's tag carrying the exposed name
    pub fn to_exposed_tag(&self) -> Tag {
        let mut tag = self.tag.clone();
        if let Some(alias) = &self.alias {
            tag.identifier = alias.clone();
        }
        tag
    }
}

/// Cursor over trait-provided members
pub struct TraitTagResult {
    items: VecDeque<TraitTag>,
    current: Option<TraitTag>,
}

impl TraitTagResult {
    pub(crate) fn new(items: Vec<TraitTag>) -> Self {
        Self {
            items: items.into(),
            current: None,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn more(&self) -> bool {
        !self.items.is_empty()
    }

    pub fn advance(&mut self) -> bool {
        self.current = self.items.pop_front();
        self.current.is_some()
    }

    pub fn current(&self) -> Option<&TraitTag> {
        self.current.as_ref()
    }

    /// Alias of the current member, if it was renamed
    pub fn current_alias(&self) -> Option<&str> {
        self.current.as_ref().and_then(|t| t.alias.as_deref())
    }
}

impl Iterator for TraitTagResult {
    type Item = Result<TraitTag, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.advance() {
            self.current.clone().map(Ok)
        } else {
            None
        }
    }
}

/// One entry of a combined class-or-file search
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClassOrFile {
    Tag(Tag),
    File(FileTag),
}

/// Classes and functions first, then files
pub struct ClassOrFileResult {
    tags: TagResult,
    files: FileTagResult,
    current: Option<ClassOrFile>,
}

impl ClassOrFileResult {
    pub(crate) fn new(tags: TagResult, files: FileTagResult) -> Self {
        Self {
            tags,
            files,
            current: None,
        }
    }

    pub fn more(&mut self) -> StoreResult<bool> {
        Ok(self.tags.more()? || self.files.more()?)
    }

    pub fn advance(&mut self) -> StoreResult<bool> {
        if self.tags.advance()? {
            self.current = self.tags.current().cloned().map(ClassOrFile::Tag);
            return Ok(true);
        }
        if self.files.advance()? {
            self.current = self.files.current().cloned().map(ClassOrFile::File);
            return Ok(true);
        }
        self.current = None;
        Ok(false)
    }

    pub fn current(&self) -> Option<&ClassOrFile> {
        self.current.as_ref()
    }
}

impl Iterator for ClassOrFileResult {
    type Item = Result<ClassOrFile, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(true) => self.current.clone().map(Ok),
            Ok(false) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
