// Tag storage, schema and the tag data model

pub mod db;
pub mod native;
pub mod schema;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::IndexError;

/// The global namespace.
pub const ROOT_NAMESPACE: &str = "\\";

/// Upper bound appended to a key prefix to form a half-open range scan.
pub const MAX_KEY_CHAR: char = '\u{10FFFF}';

/// A single indexed program element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub id: i64,
    pub identifier: String,
    #[serde(default)]
    pub class_name: String,
    #[serde(default = "root_namespace")]
    pub namespace_name: String,
    pub kind: TagKind,
    #[serde(default)]
    pub return_type: String,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub comment: String,
    /// `extends` target for class tags, as written in source
    #[serde(default)]
    pub parent_class: String,
    #[serde(default)]
    pub full_path: String,
    #[serde(default)]
    pub line_number: u32,
    #[serde(default)]
    pub character_position: u32,
    #[serde(default)]
    pub is_native: bool,
    #[serde(default)]
    pub is_static: bool,
}

fn root_namespace() -> String {
    ROOT_NAMESPACE.to_string()
}

fn is_zero(id: &i64) -> bool {
    *id == 0
}

impl Tag {
    pub fn new(kind: TagKind, identifier: impl Into<String>) -> Self {
        Self {
            id: 0,
            identifier: identifier.into(),
            class_name: String::new(),
            namespace_name: root_namespace(),
            kind,
            return_type: String::new(),
            signature: String::new(),
            comment: String::new(),
            parent_class: String::new(),
            full_path: String::new(),
            line_number: 0,
            character_position: 0,
            is_native: false,
            is_static: false,
        }
    }

    /// Derived sort/lookup key. A class key is a strict prefix of its
    /// members' keys, so a class always sorts before its members.
    pub fn key(&self) -> String {
        make_key(&self.namespace_name, &self.class_name, &self.identifier, self.kind)
    }

    pub fn is_member(&self) -> bool {
        self.kind.is_member()
    }

    /// `\Ns\Class`, `\Ns\function` or `\Ns\Class::member`
    pub fn fully_qualified_name(&self) -> String {
        if self.is_member() {
            format!(
                "{}::{}",
                fully_qualified(&self.namespace_name, &self.class_name),
                self.identifier
            )
        } else {
            fully_qualified(&self.namespace_name, &self.identifier)
        }
    }
}

/// Closed set of tag kinds. Interfaces, traits and enums are stored as
/// `Class`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagKind {
    Class,
    Method,
    Function,
    Member,
    ClassConstant,
    Define,
    Namespace,
}

impl TagKind {
    pub const MEMBERS: [TagKind; 3] = [TagKind::Method, TagKind::Member, TagKind::ClassConstant];
    pub const TOP_LEVEL: [TagKind; 4] = [
        TagKind::Class,
        TagKind::Function,
        TagKind::Define,
        TagKind::Namespace,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TagKind::Class => "class",
            TagKind::Method => "method",
            TagKind::Function => "function",
            TagKind::Member => "member",
            TagKind::ClassConstant => "class_constant",
            TagKind::Define => "define",
            TagKind::Namespace => "namespace",
        }
    }

    pub fn is_member(&self) -> bool {
        matches!(self, TagKind::Method | TagKind::Member | TagKind::ClassConstant)
    }
}

impl FromStr for TagKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "class" => Ok(TagKind::Class),
            "method" => Ok(TagKind::Method),
            "function" => Ok(TagKind::Function),
            "member" => Ok(TagKind::Member),
            "class_constant" => Ok(TagKind::ClassConstant),
            "define" => Ok(TagKind::Define),
            "namespace" => Ok(TagKind::Namespace),
            _ => Err(format!("unknown tag kind: {}", s)),
        }
    }
}

impl fmt::Display for TagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Indexed state of one source file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTag {
    pub id: i64,
    pub full_path: String,
    pub name: String,
    pub modified_at: DateTime<Utc>,
    /// Built from an editor buffer that is not yet backed by a file
    pub is_new: bool,
    pub content_hash: String,
    pub tag_count: usize,
}

impl FileTag {
    pub fn new(full_path: impl Into<String>, modified_at: DateTime<Utc>, is_new: bool) -> Self {
        let full_path = full_path.into();
        let name = base_name(&full_path);
        Self {
            id: 0,
            full_path,
            name,
            modified_at,
            is_new,
            content_hash: String::new(),
            tag_count: 0,
        }
    }
}

/// A `X::method as [visibility] alias` rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraitAlias {
    /// Fully-qualified trait, empty when the rule names no trait
    pub trait_name: String,
    pub method_name: String,
    pub alias: String,
    pub visibility: String,
}

/// A `X::method insteadof Y` rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraitInsteadOf {
    pub trait_name: String,
    pub method_name: String,
    pub excluded_trait: String,
}

/// All trait `use` clauses of one class, in declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraitUse {
    pub class_name: String,
    pub namespace_name: String,
    /// Fully-qualified trait names
    pub traits: Vec<String>,
    pub aliases: Vec<TraitAlias>,
    pub insteadof: Vec<TraitInsteadOf>,
}

impl TraitUse {
    pub fn is_empty(&self) -> bool {
        self.traits.is_empty()
    }

    /// Aliases a trait method is exposed under, if any rule renames it
    pub fn aliases_for(&self, trait_name: &str, method_name: &str) -> Vec<&TraitAlias> {
        self.aliases
            .iter()
            .filter(|a| a.method_name.eq_ignore_ascii_case(method_name))
            .filter(|a| a.trait_name.is_empty() || same_class_name(&a.trait_name, trait_name))
            .filter(|a| !a.alias.is_empty())
            .collect()
    }

    /// True when an `insteadof` rule removes this trait's method
    pub fn is_excluded(&self, trait_name: &str, method_name: &str) -> bool {
        self.insteadof.iter().any(|rule| {
            rule.method_name.eq_ignore_ascii_case(method_name)
                && same_class_name(&rule.excluded_trait, trait_name)
        })
    }
}

/// Case-insensitive name comparison. Two fully-qualified names must match
/// in full; otherwise only the short names are compared.
pub fn same_class_name(a: &str, b: &str) -> bool {
    if a.starts_with('\\') && b.starts_with('\\') {
        a.to_lowercase() == b.to_lowercase()
    } else {
        split_qualified(a).1.to_lowercase() == split_qualified(b).1.to_lowercase()
    }
}

/// Everything the parser extracted from one file
#[derive(Debug, Clone, Default)]
pub struct ParsedFile {
    pub tags: Vec<Tag>,
    pub trait_uses: Vec<TraitUse>,
}

/// Parser boundary: turns source text into tags
pub trait TagParser {
    fn can_parse(&self, file_path: &str) -> bool;
    fn parse(&self, content: &str, file_path: &str) -> Result<ParsedFile, IndexError>;
}

/// `\Ns` + `Name` -> `\Ns\Name`
pub fn fully_qualified(namespace: &str, name: &str) -> String {
    let namespace = namespace.trim_end_matches('\\');
    if namespace.is_empty() {
        format!("\\{}", name)
    } else if namespace.starts_with('\\') {
        format!("{}\\{}", namespace, name)
    } else {
        format!("\\{}\\{}", namespace, name)
    }
}

/// Normalize a namespace to its leading-backslash form (`\` for global)
pub fn normalize_namespace(namespace: &str) -> String {
    let trimmed = namespace.trim_matches('\\');
    if trimmed.is_empty() {
        ROOT_NAMESPACE.to_string()
    } else {
        format!("\\{}", trimmed)
    }
}

/// `\A\B\C` -> (`\A\B`, `C`); `C` -> (`\`, `C`)
pub fn split_qualified(name: &str) -> (String, &str) {
    let trimmed = name.trim_start_matches('\\');
    match trimmed.rfind('\\') {
        Some(pos) => (normalize_namespace(&trimmed[..pos]), &trimmed[pos + 1..]),
        None => (ROOT_NAMESPACE.to_string(), trimmed),
    }
}

/// Lower-cased lookup key, see [`Tag::key`]
pub fn make_key(namespace: &str, class_name: &str, identifier: &str, kind: TagKind) -> String {
    let key = if kind.is_member() {
        format!("{}::{}", fully_qualified(namespace, class_name), identifier)
    } else {
        fully_qualified(namespace, identifier)
    };
    key.to_lowercase()
}

/// Exclusive upper bound of the range scan for `prefix`
pub fn key_upper_bound(prefix: &str) -> String {
    let mut upper = String::with_capacity(prefix.len() + 4);
    upper.push_str(prefix);
    upper.push(MAX_KEY_CHAR);
    upper
}

pub fn base_name(full_path: &str) -> String {
    Path::new(full_path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| full_path.to_string())
}
