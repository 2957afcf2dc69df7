// Query execution engine

use std::collections::HashSet;
use tracing::debug;

use super::results::{
    ClassOrFileResult, FileTagResult, LineCounts, PagedSource, Source, TagResult, TraitTag,
    TraitTagResult,
};
use super::search::TagSearch;
use crate::config::Config;
use crate::error::StoreResult;
use crate::index::db::{TagFilter, TagOrder, TagStore};
use crate::index::native::NativeStore;
use crate::index::{split_qualified, Tag, TagKind, TraitUse};

/// Upper bound on `extends` hops and nested trait `use` levels
const MAX_DEPTH: usize = 32;

const DEFAULT_PAGE_SIZE: usize = 200;

#[derive(Clone, Copy)]
enum NameMatch<'a> {
    Exact(&'a str),
    /// Case-insensitive; empty matches everything
    Prefix(&'a str),
}

impl NameMatch<'_> {
    fn matches(&self, name: &str) -> bool {
        match self {
            NameMatch::Exact(wanted) => name == *wanted,
            NameMatch::Prefix(prefix) => name.to_lowercase().starts_with(&prefix.to_lowercase()),
        }
    }

    fn apply(&self, filter: TagFilter) -> TagFilter {
        match self {
            NameMatch::Exact(wanted) => filter.identifier_eq(wanted),
            NameMatch::Prefix(prefix) => filter.identifier_prefix(prefix),
        }
    }
}

/// Answers tag queries against the user store, with native tags unioned in
/// at query time
#[derive(Clone)]
pub struct TagSearchEngine {
    store: TagStore,
    natives: Option<NativeStore>,
    page_size: usize,
    line_counts: LineCounts,
}

impl TagSearchEngine {
    pub fn new(store: TagStore) -> Self {
        Self {
            store,
            natives: None,
            page_size: DEFAULT_PAGE_SIZE,
            line_counts: LineCounts::default(),
        }
    }

    pub fn from_config(store: TagStore, config: &Config) -> StoreResult<Self> {
        let engine = Self::new(store).with_page_size(config.search.page_size);
        if config.storage.use_native_tags {
            Ok(engine.with_natives(NativeStore::load()?))
        } else {
            Ok(engine)
        }
    }

    pub fn with_natives(mut self, natives: NativeStore) -> Self {
        self.natives = Some(natives);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn store(&self) -> &TagStore {
        &self.store
    }

    /// True when neither user nor native tags exist
    pub fn is_empty(&self) -> StoreResult<bool> {
        let natives_empty = self.natives.as_ref().map_or(true, |n| n.is_empty());
        Ok(natives_empty && self.store.is_empty()?)
    }

    /// Tags whose namespace, class and identifier equal the search. Members
    /// resolve through the class, then its traits, then `parent_classes`;
    /// the first level with a hit wins.
    pub fn create_exact_results(&self, search: &TagSearch) -> StoreResult<TagResult> {
        debug!("Exact search: {:?}", search);
        if search.is_empty() || search.is_file_search() {
            return Ok(TagResult::empty());
        }

        if !search.is_member_search() {
            let mut filter = TagFilter::new()
                .kinds(&TagKind::TOP_LEVEL)
                .class_eq("")
                .identifier_eq(&search.class_name);
            if let Some(namespace) = search.namespace() {
                filter = filter.namespace_eq(namespace);
            }
            return self.merged(filter, TagOrder::Key, &search.source_dirs);
        }

        if search.method_name.is_empty() {
            return Ok(TagResult::empty());
        }

        if search.class_name.is_empty() {
            let filter = TagFilter::new()
                .kinds(&TagKind::MEMBERS)
                .identifier_eq(&search.method_name);
            return self.merged(filter, TagOrder::ClassThenIdentifier, &search.source_dirs);
        }

        let wanted = NameMatch::Exact(&search.method_name);
        let subject = qualify(&search.class_name, search.namespace());
        let levels = std::iter::once((subject, search.traits.as_slice()))
            .chain(search.parent_classes.iter().map(|p| (p.clone(), &[] as &[String])));

        for (class_name, extra_traits) in levels {
            let own = self.member_tags(&class_name, wanted, &search.source_dirs)?;
            if !own.is_empty() {
                return Ok(TagResult::from_tags(own, TagOrder::Key));
            }

            let inherited = self.trait_members(&class_name, extra_traits, wanted, &search.source_dirs)?;
            if !inherited.is_empty() {
                let tags = inherited.iter().map(TraitTag::to_exposed_tag).collect();
                return Ok(TagResult::from_tags(tags, TagOrder::Key));
            }
        }

        Ok(TagResult::empty())
    }

    /// Case-insensitive prefix matches in key order. Member searches without
    /// a class span every class, ordered by class then identifier.
    pub fn create_near_match_results(&self, search: &TagSearch) -> StoreResult<TagResult> {
        debug!("Near-match search: {:?}", search);
        if search.is_empty() || search.is_file_search() {
            return Ok(TagResult::empty());
        }

        if !search.is_member_search() {
            return self.near_top_level(search, &TagKind::TOP_LEVEL);
        }

        if search.class_name.is_empty() {
            let filter = TagFilter::new()
                .kinds(&TagKind::MEMBERS)
                .identifier_prefix(&search.method_name);
            return self.merged(filter, TagOrder::ClassThenIdentifier, &search.source_dirs);
        }

        let wanted = NameMatch::Prefix(&search.method_name);
        let class_name = qualify(&search.class_name, search.namespace());
        let mut sources = self.sources(wanted.apply(member_filter(&class_name)), TagOrder::Key, &search.source_dirs)?;

        let inherited = self.trait_members(&class_name, &search.traits, wanted, &search.source_dirs)?;
        if !inherited.is_empty() {
            // the class's own members shadow same-named trait members
            let own: HashSet<String> = self
                .member_tags(&class_name, wanted, &search.source_dirs)?
                .into_iter()
                .map(|t| t.identifier.to_lowercase())
                .collect();
            let mut tags: Vec<Tag> = inherited
                .iter()
                .filter(|t| !own.contains(&t.exposed_name().to_lowercase()))
                .map(TraitTag::to_exposed_tag)
                .collect();
            tags.sort_by_key(|t| TagOrder::Key.sort_key(t));
            sources.push(Source::Fixed(tags.into()));
        }

        Ok(TagResult::merged(sources, TagOrder::Key))
    }

    /// Indexed files whose basename contains the search's file name. With a
    /// line number, files shorter than that line are dropped.
    pub fn create_near_match_file_results(&self, search: &TagSearch) -> StoreResult<FileTagResult> {
        debug!("File search: {:?}", search);
        let fragment = if search.is_file_search() {
            &search.file_name
        } else if !search.is_member_search() {
            &search.class_name
        } else {
            return Ok(FileTagResult::empty());
        };
        if fragment.is_empty() || self.store.is_empty()? {
            return Ok(FileTagResult::empty());
        }

        Ok(FileTagResult::new(
            self.store.clone(),
            fragment.clone(),
            search.source_dirs.clone(),
            self.page_size,
            search.has_line_number().then_some(search.line_number),
            self.line_counts.clone(),
        ))
    }

    /// Class and function near-matches followed by file matches
    pub fn create_class_or_file_results(&self, search: &TagSearch) -> StoreResult<ClassOrFileResult> {
        let tags = if search.is_empty() || search.is_file_search() || search.is_member_search() {
            TagResult::empty()
        } else {
            self.near_top_level(search, &[TagKind::Class, TagKind::Function])?
        };
        let files = self.create_near_match_file_results(search)?;
        Ok(ClassOrFileResult::new(tags, files))
    }

    /// Members a class gets from its traits, with aliases applied
    pub fn create_trait_results(&self, search: &TagSearch) -> StoreResult<TraitTagResult> {
        if search.class_name.is_empty() || !search.is_member_search() {
            return Ok(TraitTagResult::empty());
        }
        let class_name = qualify(&search.class_name, search.namespace());
        let members = self.trait_members(
            &class_name,
            &search.traits,
            NameMatch::Prefix(&search.method_name),
            &search.source_dirs,
        )?;
        Ok(TraitTagResult::new(members))
    }

    /// Ancestor `depth + 1` levels above `class_name` (0 = direct parent);
    /// empty when the chain is shorter
    pub fn parent_class_name(&self, class_name: &str, depth: usize) -> StoreResult<String> {
        let chain = self.ancestors(class_name, depth + 1)?;
        Ok(chain.get(depth).cloned().unwrap_or_default())
    }

    /// Every ancestor of `class_name`, nearest first. Stops at unknown
    /// classes and cycles.
    pub fn ancestor_chain(&self, class_name: &str) -> StoreResult<Vec<String>> {
        self.ancestors(class_name, MAX_DEPTH)
    }

    /// Traits `class_name` uses, nested ones included. With a method filter,
    /// only traits that provide that name (after aliasing) are listed.
    pub fn get_resource_traits(
        &self,
        class_name: &str,
        method_filter: &str,
        source_dirs: &[String],
    ) -> StoreResult<Vec<String>> {
        let expanded = self.expanded_traits(class_name, &[], source_dirs)?;
        if method_filter.is_empty() {
            return Ok(expanded.into_iter().map(|(name, _)| name).collect());
        }

        let mut traits = Vec::new();
        for (trait_name, rules) in &expanded {
            let provides = self
                .exposed_members(trait_name, rules, source_dirs)?
                .iter()
                .any(|t| t.exposed_name().eq_ignore_ascii_case(method_filter));
            if provides {
                traits.push(trait_name.clone());
            }
        }
        Ok(traits)
    }

    fn ancestors(&self, class_name: &str, limit: usize) -> StoreResult<Vec<String>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = class_name.to_string();
        seen.insert(name_key(&current));

        while chain.len() < limit.min(MAX_DEPTH) {
            let Some(class) = self.find_class(&current)? else {
                break;
            };
            if class.parent_class.is_empty() {
                break;
            }
            let parent = class.parent_class;
            if !seen.insert(name_key(&parent)) {
                debug!("Inheritance cycle at {}", parent);
                break;
            }
            chain.push(parent.clone());
            current = parent;
        }
        Ok(chain)
    }

    fn find_class(&self, class_name: &str) -> StoreResult<Option<Tag>> {
        if let Some(class) = self.store.find_class(class_name)? {
            return Ok(Some(class));
        }
        match &self.natives {
            Some(natives) => natives.store().find_class(class_name),
            None => Ok(None),
        }
    }

    fn near_top_level(&self, search: &TagSearch, kinds: &[TagKind]) -> StoreResult<TagResult> {
        let filter = match search.namespace() {
            Some(namespace) => TagFilter::new()
                .kinds(kinds)
                .namespace_prefix(namespace, &search.class_name),
            None => TagFilter::new()
                .kinds(kinds)
                .identifier_prefix(&search.class_name),
        };
        self.merged(filter, TagOrder::Key, &search.source_dirs)
    }

    /// User source (skipped when the store is empty) then native source
    fn sources(&self, filter: TagFilter, order: TagOrder, source_dirs: &[String]) -> StoreResult<Vec<Source>> {
        let mut sources = Vec::with_capacity(2);
        if !self.store.is_empty()? {
            sources.push(Source::Paged(PagedSource::new(
                self.store.clone(),
                filter.clone().source_dirs(source_dirs),
                order,
                self.page_size,
            )));
        }
        if let Some(natives) = &self.natives {
            sources.push(Source::Paged(PagedSource::new(
                natives.store().clone(),
                filter,
                order,
                self.page_size,
            )));
        }
        Ok(sources)
    }

    fn merged(&self, filter: TagFilter, order: TagOrder, source_dirs: &[String]) -> StoreResult<TagResult> {
        Ok(TagResult::merged(self.sources(filter, order, source_dirs)?, order))
    }

    /// Materialized members of one class (user rows before native ones)
    fn member_tags(&self, class_name: &str, wanted: NameMatch, source_dirs: &[String]) -> StoreResult<Vec<Tag>> {
        let filter = wanted.apply(member_filter(class_name));
        self.merged(filter, TagOrder::Key, source_dirs)?.collect()
    }

    /// Trait list of `class_name` plus `extra`, each trait preceded by the
    /// traits it uses itself, paired with the `use` rules that apply to it
    fn expanded_traits(
        &self,
        class_name: &str,
        extra: &[String],
        source_dirs: &[String],
    ) -> StoreResult<Vec<(String, TraitUse)>> {
        let mut uses = self.store.trait_use_for_class(class_name, source_dirs)?;
        for name in extra {
            if !uses.traits.iter().any(|t| name_key(t) == name_key(name)) {
                uses.traits.push(name.clone());
            }
        }

        let mut seen = HashSet::new();
        seen.insert(name_key(class_name));
        let mut out = Vec::new();
        self.expand(&uses, source_dirs, 0, &mut seen, &mut out)?;
        Ok(out)
    }

    fn expand(
        &self,
        uses: &TraitUse,
        source_dirs: &[String],
        depth: usize,
        seen: &mut HashSet<String>,
        out: &mut Vec<(String, TraitUse)>,
    ) -> StoreResult<()> {
        for trait_name in &uses.traits {
            if !seen.insert(name_key(trait_name)) {
                continue;
            }
            if depth < MAX_DEPTH {
                let nested = self.store.trait_use_for_class(trait_name, source_dirs)?;
                if !nested.is_empty() {
                    self.expand(&nested, source_dirs, depth + 1, seen, out)?;
                }
            }
            out.push((trait_name.clone(), uses.clone()));
        }
        Ok(())
    }

    /// A trait's members under the names `rules` expose them as
    fn exposed_members(&self, trait_name: &str, rules: &TraitUse, source_dirs: &[String]) -> StoreResult<Vec<TraitTag>> {
        let mut exposed = Vec::new();
        for tag in self.member_tags(trait_name, NameMatch::Prefix(""), source_dirs)? {
            if rules.is_excluded(trait_name, &tag.identifier) {
                continue;
            }
            let aliases = rules.aliases_for(trait_name, &tag.identifier);
            if aliases.is_empty() {
                exposed.push(TraitTag {
                    tag,
                    trait_name: trait_name.to_string(),
                    alias: None,
                });
            } else {
                for alias in aliases {
                    exposed.push(TraitTag {
                        tag: tag.clone(),
                        trait_name: trait_name.to_string(),
                        alias: Some(alias.alias.clone()),
                    });
                }
            }
        }
        Ok(exposed)
    }

    /// Trait members of `class_name` matching `wanted`. When two traits
    /// expose the same name the later one in the `use` list wins.
    fn trait_members(
        &self,
        class_name: &str,
        extra: &[String],
        wanted: NameMatch,
        source_dirs: &[String],
    ) -> StoreResult<Vec<TraitTag>> {
        let mut candidates = Vec::new();
        for (trait_name, rules) in self.expanded_traits(class_name, extra, source_dirs)? {
            candidates.extend(
                self.exposed_members(&trait_name, &rules, source_dirs)?
                    .into_iter()
                    .filter(|t| wanted.matches(t.exposed_name())),
            );
        }

        let mut seen = HashSet::new();
        let mut winners: Vec<TraitTag> = candidates
            .into_iter()
            .rev()
            .filter(|t| seen.insert(t.exposed_name().to_lowercase()))
            .collect();
        winners.sort_by_key(|t| TagOrder::Key.sort_key(&t.to_exposed_tag()));
        Ok(winners)
    }
}

/// Members of one class; a leading-backslash name also pins the namespace
fn member_filter(class_name: &str) -> TagFilter {
    let filter = TagFilter::new().kinds(&TagKind::MEMBERS);
    if class_name.starts_with('\\') {
        let (namespace, short) = split_qualified(class_name);
        filter.class_eq(short).namespace_eq(&namespace)
    } else {
        filter.class_eq(class_name)
    }
}

/// Case-folded name without the leading backslash, for cycle checks
fn name_key(name: &str) -> String {
    name.trim_start_matches('\\').to_lowercase()
}

fn qualify(class_name: &str, namespace: Option<&str>) -> String {
    match namespace {
        Some(namespace) => crate::index::fully_qualified(namespace, class_name),
        None => class_name.to_string(),
    }
}
