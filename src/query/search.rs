// Raw query string -> structured search

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::index::{base_name, split_qualified};

static FILE_QUERY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([^:\s]*[^:\s/\\]\.[A-Za-z0-9_]+)(?::(\d+))?$").unwrap());

/// A parsed query. Built per call, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagSearch {
    /// Leading-backslash namespace when the query was qualified, else empty
    pub namespace_name: String,
    /// Class part of `Class::member`, or the bare identifier otherwise
    pub class_name: String,
    pub method_name: String,
    /// Basename part of a `file.ext[:line]` query
    pub file_name: String,
    /// 1-based, -1 when absent
    pub line_number: i32,
    /// Ancestors to search, nearest first
    pub parent_classes: Vec<String>,
    pub traits: Vec<String>,
    pub source_dirs: Vec<String>,
    member_separator: bool,
}

impl Default for TagSearch {
    fn default() -> Self {
        Self {
            namespace_name: String::new(),
            class_name: String::new(),
            method_name: String::new(),
            file_name: String::new(),
            line_number: -1,
            parent_classes: Vec::new(),
            traits: Vec::new(),
            source_dirs: Vec::new(),
            member_separator: false,
        }
    }
}

impl TagSearch {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let mut search = Self::default();
        if raw.is_empty() {
            return search;
        }

        if let Some(caps) = FILE_QUERY.captures(raw) {
            search.file_name = base_name(&caps[1]);
            if let Some(line) = caps.get(2) {
                // too large to ever be in bounds
                search.line_number = line.as_str().parse().unwrap_or(i32::MAX);
            }
            return search;
        }

        let qualified = match raw.split_once("::") {
            Some((class_part, member)) => {
                search.member_separator = true;
                search.method_name = member.trim().trim_start_matches('$').to_string();
                class_part.trim()
            }
            None => raw,
        };

        if qualified.contains('\\') {
            let (namespace, short) = split_qualified(qualified);
            search.namespace_name = namespace;
            search.class_name = short.to_string();
        } else {
            search.class_name = qualified.to_string();
        }

        search
    }

    pub fn with_parent_classes(mut self, parents: Vec<String>) -> Self {
        self.parent_classes = parents;
        self
    }

    pub fn with_traits(mut self, traits: Vec<String>) -> Self {
        self.traits = traits;
        self
    }

    pub fn with_source_dirs(mut self, dirs: Vec<String>) -> Self {
        self.source_dirs = dirs;
        self
    }

    /// Nothing to look for; every strategy yields zero results
    pub fn is_empty(&self) -> bool {
        self.class_name.is_empty() && self.method_name.is_empty() && self.file_name.is_empty()
    }

    /// `Class::member` or `::member`
    pub fn is_member_search(&self) -> bool {
        self.member_separator
    }

    pub fn is_file_search(&self) -> bool {
        !self.file_name.is_empty()
    }

    pub fn has_line_number(&self) -> bool {
        self.line_number >= 0
    }

    pub fn namespace(&self) -> Option<&str> {
        if self.namespace_name.is_empty() {
            None
        } else {
            Some(&self.namespace_name)
        }
    }
}
