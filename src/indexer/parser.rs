// PHP tag parser

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use tree_sitter::{Node, Parser as TreeParser, Tree};

use crate::error::IndexError;
use crate::index::{
    fully_qualified, normalize_namespace, split_qualified, ParsedFile, Tag, TagKind, TagParser,
    TraitAlias, TraitInsteadOf, TraitUse, ROOT_NAMESPACE,
};

static DOC_RETURN: Lazy<Regex> = Lazy::new(|| Regex::new(r"@return\s+([^\s*]+)").unwrap());
static DOC_VAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"@var\s+([^\s*$]+)").unwrap());

const VISIBILITIES: [&str; 3] = ["public", "protected", "private"];

/// PHP parser using tree-sitter
pub struct PhpParser {
    extensions: Vec<String>,
}

impl Default for PhpParser {
    fn default() -> Self {
        Self::new()
    }
}

impl PhpParser {
    pub fn new() -> Self {
        Self::with_extensions(&["php".to_string()])
    }

    pub fn with_extensions(extensions: &[String]) -> Self {
        Self {
            extensions: extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }

    fn parse_tree(&self, content: &str, file_path: &str) -> Result<Tree, IndexError> {
        let mut parser = TreeParser::new();
        let language: tree_sitter::Language = tree_sitter_php::LANGUAGE_PHP.into();
        parser
            .set_language(&language)
            .map_err(|e| IndexError::parse(file_path, e.to_string()))?;

        parser
            .parse(content, None)
            .ok_or_else(|| IndexError::parse(file_path, "parser produced no tree"))
    }
}

impl TagParser for PhpParser {
    fn can_parse(&self, file_path: &str) -> bool {
        std::path::Path::new(file_path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }

    fn parse(&self, content: &str, file_path: &str) -> Result<ParsedFile, IndexError> {
        let tree = self.parse_tree(content, file_path)?;
        let root = tree.root_node();
        if root.has_error() {
            tracing::debug!("{} has syntax errors; indexing what parsed", file_path);
        }

        let mut extractor = Extractor {
            source: content.as_bytes(),
            file_path,
            parsed: ParsedFile::default(),
            imports: HashMap::new(),
        };
        extractor.walk_statements(root, ROOT_NAMESPACE);

        Ok(extractor.parsed)
    }
}

struct Extractor<'a> {
    source: &'a [u8],
    file_path: &'a str,
    parsed: ParsedFile,
    /// `use` imports of the current namespace, lower-cased alias -> name
    imports: HashMap<String, String>,
}

/// Where a class-like name was written: its namespace and the imports in
/// effect there
struct NameScope<'s> {
    namespace: &'s str,
    imports: &'s HashMap<String, String>,
}

impl NameScope<'_> {
    fn resolve(&self, name: &str) -> String {
        if name.starts_with('\\') {
            return normalize_namespace(name);
        }
        let (head, tail) = match name.split_once('\\') {
            Some((head, tail)) => (head, Some(tail)),
            None => (name, None),
        };
        match (self.imports.get(&head.to_lowercase()), tail) {
            (Some(target), Some(tail)) => format!("{}\\{}", target, tail),
            (Some(target), None) => target.clone(),
            (None, _) => fully_qualified(self.namespace, name),
        }
    }
}

impl<'a> Extractor<'a> {
    /// Statement list where `namespace X;` switches the namespace for the
    /// statements that follow it
    fn walk_statements(&mut self, parent: Node, namespace: &str) {
        let mut current = namespace.to_string();
        for child in children(parent) {
            if child.kind() == "namespace_definition" {
                self.imports.clear();
                let ns = self.namespace_definition(child);
                if let Some(body) = child.child_by_field_name("body") {
                    self.walk_statements(body, &ns);
                } else {
                    current = ns;
                }
            } else {
                self.visit(child, &current);
            }
        }
    }

    fn visit(&mut self, node: Node, namespace: &str) {
        match node.kind() {
            "namespace_definition" => {
                self.imports.clear();
                let ns = self.namespace_definition(node);
                if let Some(body) = node.child_by_field_name("body") {
                    self.walk_statements(body, &ns);
                }
            }
            "namespace_use_declaration" => {
                let imports = parse_use_declaration(self.text(node));
                self.imports.extend(imports);
            }
            "class_declaration" | "interface_declaration" | "trait_declaration" | "enum_declaration" => {
                self.class_like(node, namespace);
            }
            "function_definition" => {
                self.function(node, namespace);
            }
            "const_declaration" => {
                self.constants(node, namespace, None);
            }
            "function_call_expression" => {
                self.define(node);
                for child in children(node) {
                    self.visit(child, namespace);
                }
            }
            _ => {
                for child in children(node) {
                    self.visit(child, namespace);
                }
            }
        }
    }

    fn namespace_definition(&mut self, node: Node) -> String {
        let name = node
            .child_by_field_name("name")
            .map(|n| self.text(n).to_string())
            .unwrap_or_default();
        let ns = normalize_namespace(&name);

        if !name.is_empty() {
            let (parent, short) = split_qualified(&ns);
            let mut tag = self.tag(node, TagKind::Namespace, short, "", &parent);
            tag.signature = format!("namespace {}", ns.trim_start_matches('\\'));
            self.parsed.tags.push(tag);
        }
        ns
    }

    fn class_like(&mut self, node: Node, namespace: &str) {
        let Some(name_node) = node.child_by_field_name("name") else {
            return;
        };
        let class_name = self.text(name_node).to_string();

        let mut tag = self.tag(node, TagKind::Class, &class_name, "", namespace);
        tag.signature = self.signature(node);
        tag.comment = self.phpdoc(node);
        tag.parent_class = children(node)
            .into_iter()
            .find(|c| c.kind() == "base_clause")
            .and_then(|base| {
                children(base)
                    .into_iter()
                    .find(|c| matches!(c.kind(), "name" | "qualified_name"))
            })
            .map(|n| self.text(n).to_string())
            .unwrap_or_default();
        self.parsed.tags.push(tag);

        let Some(body) = node.child_by_field_name("body") else {
            return;
        };

        let mut uses = TraitUse {
            class_name: class_name.clone(),
            namespace_name: namespace.to_string(),
            ..TraitUse::default()
        };

        for member in children(body) {
            match member.kind() {
                "method_declaration" => self.method(member, &class_name, namespace),
                "property_declaration" => self.properties(member, &class_name, namespace),
                "const_declaration" => self.constants(member, namespace, Some(&class_name)),
                "enum_case" => self.enum_case(member, &class_name, namespace),
                "use_declaration" => self.trait_use(member, namespace, &mut uses),
                _ => {}
            }
        }

        if !uses.is_empty() {
            self.parsed.trait_uses.push(uses);
        }
    }

    fn function(&mut self, node: Node, namespace: &str) {
        let Some(name_node) = node.child_by_field_name("name") else {
            return;
        };
        let name = self.text(name_node).to_string();
        let mut tag = self.tag(node, TagKind::Function, &name, "", namespace);
        tag.signature = self.signature(node);
        tag.comment = self.phpdoc(node);
        tag.return_type = self.return_type(node, &tag.comment);
        self.parsed.tags.push(tag);
    }

    fn method(&mut self, node: Node, class_name: &str, namespace: &str) {
        let Some(name_node) = node.child_by_field_name("name") else {
            return;
        };
        let name = self.text(name_node).to_string();
        let mut tag = self.tag(node, TagKind::Method, &name, class_name, namespace);
        tag.signature = self.signature(node);
        tag.comment = self.phpdoc(node);
        tag.return_type = self.return_type(node, &tag.comment);
        tag.is_static = has_child(node, "static_modifier");
        self.parsed.tags.push(tag);
    }

    fn properties(&mut self, node: Node, class_name: &str, namespace: &str) {
        let comment = self.phpdoc(node);
        let declared_type = node
            .child_by_field_name("type")
            .map(|t| self.text(t).to_string())
            .or_else(|| doc_capture(&DOC_VAR, &comment))
            .unwrap_or_default();
        let is_static = has_child(node, "static_modifier");

        for element in children(node) {
            if element.kind() != "property_element" {
                continue;
            }
            let Some(var) = children(element)
                .into_iter()
                .find(|c| c.kind() == "variable_name")
            else {
                continue;
            };
            let raw = self.text(var);
            let name = raw.trim_start_matches('$').to_string();

            let prefix = collapse_whitespace(
                std::str::from_utf8(&self.source[node.start_byte()..element.start_byte()]).unwrap_or(""),
            );
            let prefix = prefix.trim_end_matches(',').trim();

            let mut tag = self.tag(element, TagKind::Member, &name, class_name, namespace);
            tag.signature = if prefix.is_empty() {
                raw.to_string()
            } else {
                format!("{} {}", prefix, raw)
            };
            tag.comment = comment.clone();
            tag.return_type = declared_type.clone();
            tag.is_static = is_static;
            self.parsed.tags.push(tag);
        }
    }

    fn constants(&mut self, node: Node, namespace: &str, class_name: Option<&str>) {
        let comment = self.phpdoc(node);
        for element in children(node) {
            if element.kind() != "const_element" {
                continue;
            }
            let Some(name_node) = children(element).into_iter().find(|c| c.kind() == "name") else {
                continue;
            };
            let name = self.text(name_node).to_string();
            let (kind, owner) = match class_name {
                Some(class_name) => (TagKind::ClassConstant, class_name),
                None => (TagKind::Define, ""),
            };
            let mut tag = self.tag(element, kind, &name, owner, namespace);
            tag.signature = format!("const {}", collapse_whitespace(self.text(element)));
            tag.comment = comment.clone();
            self.parsed.tags.push(tag);
        }
    }

    fn enum_case(&mut self, node: Node, class_name: &str, namespace: &str) {
        let name_node = node
            .child_by_field_name("name")
            .or_else(|| children(node).into_iter().find(|c| c.kind() == "name"));
        let Some(name_node) = name_node else {
            return;
        };
        let name = self.text(name_node).to_string();
        let mut tag = self.tag(node, TagKind::ClassConstant, &name, class_name, namespace);
        tag.signature = collapse_whitespace(self.text(node)).trim_end_matches(';').to_string();
        tag.comment = self.phpdoc(node);
        self.parsed.tags.push(tag);
    }

    /// `define('NAME', value)`; always global
    fn define(&mut self, node: Node) {
        let Some(function) = node.child_by_field_name("function") else {
            return;
        };
        if !self.text(function).trim_start_matches('\\').eq_ignore_ascii_case("define") {
            return;
        }
        let Some(arguments) = node.child_by_field_name("arguments") else {
            return;
        };
        let Some(first) = children(arguments)
            .into_iter()
            .find(|c| c.kind() == "argument")
        else {
            return;
        };
        let literal = self.text(first).trim();
        if !(literal.starts_with('\'') || literal.starts_with('"')) {
            return;
        }
        let name = literal.trim_matches(|c| c == '\'' || c == '"');
        if name.is_empty() {
            return;
        }

        let mut tag = self.tag(node, TagKind::Define, name, "", ROOT_NAMESPACE);
        tag.signature = collapse_whitespace(self.text(node));
        self.parsed.tags.push(tag);
    }

    /// `use A, B { A::x as y; A::z insteadof B; }` inside a class body
    fn trait_use(&self, node: Node, namespace: &str, uses: &mut TraitUse) {
        let scope = NameScope {
            namespace,
            imports: &self.imports,
        };
        let mut declared = Vec::new();
        for child in children(node) {
            match child.kind() {
                "name" | "qualified_name" => {
                    declared.push(scope.resolve(self.text(child)));
                }
                _ => {}
            }
        }

        let mut rules = Vec::new();
        collect_kinds(node, &["use_as_clause", "use_instead_of_clause"], &mut rules);
        for rule in rules {
            let text = self.text(rule).trim().trim_end_matches(';').to_string();
            if rule.kind() == "use_as_clause" {
                if let Some(alias) = parse_alias(&text, &scope, &declared) {
                    uses.aliases.push(alias);
                }
            } else {
                uses.insteadof.extend(parse_insteadof(&text, &scope));
            }
        }

        for name in declared {
            if !uses.traits.iter().any(|t| t.eq_ignore_ascii_case(&name)) {
                uses.traits.push(name);
            }
        }
    }

    fn tag(&self, node: Node, kind: TagKind, identifier: &str, class_name: &str, namespace: &str) -> Tag {
        let mut tag = Tag::new(kind, identifier);
        tag.class_name = class_name.to_string();
        tag.namespace_name = namespace.to_string();
        tag.full_path = self.file_path.to_string();
        tag.line_number = node.start_position().row as u32 + 1;
        tag.character_position = node.start_byte() as u32;
        tag
    }

    fn text(&self, node: Node) -> &'a str {
        node.utf8_text(self.source).unwrap_or("")
    }

    /// Declaration text up to its body, attributes excluded
    fn signature(&self, node: Node) -> String {
        let start = children(node)
            .into_iter()
            .find(|c| !matches!(c.kind(), "attribute_list" | "comment"))
            .map(|c| c.start_byte())
            .unwrap_or_else(|| node.start_byte());
        let end = node
            .child_by_field_name("body")
            .map(|b| b.start_byte())
            .unwrap_or_else(|| node.end_byte());
        let text = std::str::from_utf8(&self.source[start..end.max(start)]).unwrap_or("");
        collapse_whitespace(text).trim_end_matches(';').trim().to_string()
    }

    fn return_type(&self, node: Node, comment: &str) -> String {
        node.child_by_field_name("return_type")
            .map(|t| self.text(t).trim_start_matches(':').trim().to_string())
            .or_else(|| doc_capture(&DOC_RETURN, comment))
            .unwrap_or_default()
    }

    /// PHPDoc (`/** ... */`) immediately preceding the node
    fn phpdoc(&self, node: Node) -> String {
        let mut prev = node.prev_sibling();
        while let Some(sibling) = prev {
            if sibling.kind() != "comment" {
                break;
            }
            let text = self.text(sibling);
            if text.starts_with("/**") {
                return clean_phpdoc(text);
            }
            prev = sibling.prev_sibling();
        }
        String::new()
    }
}

fn children(node: Node) -> Vec<Node> {
    let mut cursor = node.walk();
    node.children(&mut cursor).collect()
}

fn has_child(node: Node, kind: &str) -> bool {
    children(node).iter().any(|c| c.kind() == kind)
}

fn collect_kinds<'t>(node: Node<'t>, kinds: &[&str], out: &mut Vec<Node<'t>>) {
    for child in children(node) {
        if kinds.contains(&child.kind()) {
            out.push(child);
        } else {
            collect_kinds(child, kinds, out);
        }
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn doc_capture(re: &Regex, comment: &str) -> Option<String> {
    re.captures(comment)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// `use A\\B, C as D;` or `use A\\{B, C as D};` -> (lower-cased alias, `\\A\\B`).
/// Function and constant imports are ignored.
fn parse_use_declaration(text: &str) -> Vec<(String, String)> {
    let body = text.trim().trim_end_matches(';').trim();
    let Some(body) = body.get(3..).filter(|_| body[..3].eq_ignore_ascii_case("use")) else {
        return Vec::new();
    };
    let body = body.trim();
    let first = body.split_whitespace().next().unwrap_or("");
    if first.eq_ignore_ascii_case("function") || first.eq_ignore_ascii_case("const") {
        return Vec::new();
    }

    let entries: Vec<String> = match body.split_once('{') {
        Some((prefix, group)) => {
            let prefix = prefix.trim().trim_end_matches('\\');
            group
                .trim_end_matches('}')
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(|item| format!("{}\\{}", prefix, item))
                .collect()
        }
        None => body.split(',').map(|item| item.trim().to_string()).collect(),
    };

    entries
        .iter()
        .filter_map(|entry| {
            let tokens: Vec<&str> = entry.split_whitespace().collect();
            let name = *tokens.first()?;
            let alias = match tokens.as_slice() {
                [_, keyword, alias, ..] if keyword.eq_ignore_ascii_case("as") => *alias,
                _ => split_qualified(name).1,
            };
            Some((alias.to_lowercase(), normalize_namespace(name)))
        })
        .collect()
}

/// `Trait::method` or `method`
fn split_member(text: &str, scope: &NameScope) -> (String, String) {
    match text.split_once("::") {
        Some((trait_name, method)) => (scope.resolve(trait_name.trim()), method.trim().to_string()),
        None => (String::new(), text.trim().to_string()),
    }
}

/// `[T::]m as [visibility] [alias]`
fn parse_alias(text: &str, scope: &NameScope, declared: &[String]) -> Option<TraitAlias> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let at = tokens.iter().position(|t| t.eq_ignore_ascii_case("as"))?;
    let (mut trait_name, method_name) = split_member(&tokens[..at].join(""), scope);

    let mut visibility = String::new();
    let mut alias = String::new();
    for token in &tokens[at + 1..] {
        if VISIBILITIES.iter().any(|v| v.eq_ignore_ascii_case(token)) {
            visibility = token.to_lowercase();
        } else if alias.is_empty() {
            alias = token.to_string();
        }
    }
    if alias.is_empty() || method_name.is_empty() {
        return None;
    }
    if trait_name.is_empty() && declared.len() == 1 {
        trait_name = declared[0].clone();
    }

    Some(TraitAlias {
        trait_name,
        method_name,
        alias,
        visibility,
    })
}

/// `T::m insteadof U[, V]`, one rule per excluded trait
fn parse_insteadof(text: &str, scope: &NameScope) -> Vec<TraitInsteadOf> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let Some(at) = tokens.iter().position(|t| t.eq_ignore_ascii_case("insteadof")) else {
        return Vec::new();
    };
    let (trait_name, method_name) = split_member(&tokens[..at].join(""), scope);
    if method_name.is_empty() {
        return Vec::new();
    }

    tokens[at + 1..]
        .join("")
        .split(',')
        .map(str::trim)
        .filter(|excluded| !excluded.is_empty())
        .map(|excluded| TraitInsteadOf {
            trait_name: trait_name.clone(),
            method_name: method_name.clone(),
            excluded_trait: scope.resolve(excluded),
        })
        .collect()
}

/// Strip PHPDoc delimiters and leading `*`
fn clean_phpdoc(raw: &str) -> String {
    let trimmed = raw.strip_prefix("/**").unwrap_or(raw);
    let trimmed = trimmed.strip_suffix("*/").unwrap_or(trimmed);

    let mut lines: Vec<&str> = trimmed
        .lines()
        .map(|line| {
            let stripped = line.trim();
            if let Some(rest) = stripped.strip_prefix("* ") {
                rest
            } else if stripped == "*" {
                ""
            } else {
                stripped
            }
        })
        .collect();

    while lines.first().is_some_and(|l| l.is_empty()) {
        lines.remove(0);
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }

    lines.join("\n")
}
