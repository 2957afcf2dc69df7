use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::schema::{init_schema, SCHEMA_VERSION};
use super::{
    fully_qualified, key_upper_bound, normalize_namespace, split_qualified, FileTag, ParsedFile,
    Tag, TagKind, TraitAlias, TraitInsteadOf, TraitUse,
};
use crate::error::{StoreError, StoreResult};

/// Type alias for connection pool
pub type ConnectionPool = Pool<SqliteConnectionManager>;

const TAG_COLUMNS: &str = "r.id, r.identifier, r.class_name, r.namespace_name, r.kind, \
     r.return_type, r.signature, r.comment, r.parent_class, r.line_number, \
     r.character_position, r.is_native, r.is_static, COALESCE(f.full_path, '')";

const FILE_COLUMNS: &str =
    "f.file_item_id, f.full_path, f.name, f.modified_at, f.is_new, f.content_hash, f.tag_count";

/// Collapses rows re-declared under the same key in the same file to the
/// most recently indexed one. Native rows are exempt.
const LATEST_ONLY: &str = "(r.is_native = 1 OR r.id = (SELECT MAX(d.id) FROM resources d \
     WHERE d.key = r.key AND d.kind = r.kind AND d.file_item_id IS r.file_item_id))";

/// Result ordering understood by [`TagStore::fetch_tags`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagOrder {
    /// By derived key; classes before their own members
    Key,
    /// By class name, then identifier (member search across classes)
    ClassThenIdentifier,
}

impl TagOrder {
    // After the sort key a row is identified by (file, kind), which survives
    // a re-index. Native rows have no file and fall back to the row id.
    fn order_sql(&self) -> &'static str {
        match self {
            TagOrder::Key => "r.key, COALESCE(f.full_path, ''), r.kind, r.is_native * r.id",
            TagOrder::ClassThenIdentifier => {
                "r.class_key, r.identifier_key, r.key, COALESCE(f.full_path, ''), r.kind, r.is_native * r.id"
            }
        }
    }

    fn cursor_sql(&self) -> &'static str {
        match self {
            TagOrder::Key => "(r.key, COALESCE(f.full_path, ''), r.kind, r.is_native * r.id) > (?, ?, ?, ?)",
            TagOrder::ClassThenIdentifier => {
                "(r.class_key, r.identifier_key, r.key, COALESCE(f.full_path, ''), r.kind, r.is_native * r.id) \
                 > (?, ?, ?, ?, ?, ?)"
            }
        }
    }

    fn cursor_params(&self, tag: &Tag) -> Vec<Value> {
        let mut params = match self {
            TagOrder::Key => vec![Value::Text(tag.key())],
            TagOrder::ClassThenIdentifier => vec![
                Value::Text(tag.class_name.to_lowercase()),
                Value::Text(tag.identifier.to_lowercase()),
                Value::Text(tag.key()),
            ],
        };
        params.push(Value::Text(tag.full_path.clone()));
        params.push(Value::Text(tag.kind.as_str().to_string()));
        params.push(Value::Integer(if tag.is_native { tag.id } else { 0 }));
        params
    }

    /// Store-independent sort key used when merging several result sources
    pub fn sort_key(&self, tag: &Tag) -> (String, String, String) {
        match self {
            TagOrder::Key => (tag.key(), String::new(), String::new()),
            TagOrder::ClassThenIdentifier => (
                tag.class_name.to_lowercase(),
                tag.identifier.to_lowercase(),
                tag.key(),
            ),
        }
    }
}

/// WHERE-clause builder over the `resources r` / `file_items f` join
#[derive(Debug, Clone, Default)]
pub struct TagFilter {
    clauses: Vec<String>,
    params: Vec<Value>,
}

impl TagFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(mut self, kinds: &[TagKind]) -> Self {
        if kinds.is_empty() {
            return self;
        }
        let marks = vec!["?"; kinds.len()].join(", ");
        self.clauses.push(format!("r.kind IN ({})", marks));
        self.params
            .extend(kinds.iter().map(|k| Value::Text(k.as_str().to_string())));
        self
    }

    pub fn key_eq(mut self, key: &str) -> Self {
        self.clauses.push("r.key = ?".to_string());
        self.params.push(Value::Text(key.to_lowercase()));
        self
    }

    /// `key` in `[prefix, prefix + MAX_KEY_CHAR)`
    pub fn key_prefix(mut self, prefix: &str) -> Self {
        let prefix = prefix.to_lowercase();
        self.clauses.push("r.key >= ? AND r.key < ?".to_string());
        self.params.push(Value::Text(prefix.clone()));
        self.params.push(Value::Text(key_upper_bound(&prefix)));
        self
    }

    pub fn identifier_eq(mut self, identifier: &str) -> Self {
        self.clauses.push("r.identifier = ?".to_string());
        self.params.push(Value::Text(identifier.to_string()));
        self
    }

    /// Case-insensitive identifier prefix
    pub fn identifier_prefix(mut self, prefix: &str) -> Self {
        if prefix.is_empty() {
            return self;
        }
        let prefix = prefix.to_lowercase();
        self.clauses
            .push("r.identifier_key >= ? AND r.identifier_key < ?".to_string());
        self.params.push(Value::Text(prefix.clone()));
        self.params.push(Value::Text(key_upper_bound(&prefix)));
        self
    }

    /// Case-insensitive whole-identifier match
    pub fn identifier_like(mut self, identifier: &str) -> Self {
        self.clauses.push("r.identifier_key = ?".to_string());
        self.params.push(Value::Text(identifier.to_lowercase()));
        self
    }

    /// Case-insensitive owning class; empty selects top-level tags
    pub fn class_eq(mut self, class_name: &str) -> Self {
        self.clauses.push("r.class_key = ?".to_string());
        self.params.push(Value::Text(class_name.to_lowercase()));
        self
    }

    pub fn namespace_eq(mut self, namespace: &str) -> Self {
        self.clauses.push("r.namespace_key = ?".to_string());
        self.params.push(Value::Text(namespace_key(namespace)));
        self
    }

    /// Identifiers in `namespace` starting with `prefix`, plus everything
    /// declared under the namespace `namespace\prefix` itself. Sibling
    /// namespaces that merely share the leading characters are left out.
    pub fn namespace_prefix(mut self, namespace: &str, prefix: &str) -> Self {
        let identifier = prefix.to_lowercase();
        let contents = format!("{}\\", fully_qualified(namespace, prefix).to_lowercase());
        self.clauses.push(
            "(r.namespace_key = ? AND r.identifier_key >= ? AND r.identifier_key < ?) \
             OR (r.key >= ? AND r.key < ?)"
                .to_string(),
        );
        self.params.push(Value::Text(namespace_key(namespace)));
        self.params.push(Value::Text(identifier.clone()));
        self.params.push(Value::Text(key_upper_bound(&identifier)));
        self.params.push(Value::Text(contents.clone()));
        self.params.push(Value::Text(key_upper_bound(&contents)));
        self
    }

    pub fn file_eq(mut self, full_path: &str) -> Self {
        self.clauses.push("f.full_path = ?".to_string());
        self.params.push(Value::Text(full_path.to_string()));
        self
    }

    /// Restrict to files under any of `dirs`. No-op for an empty list.
    pub fn source_dirs(mut self, dirs: &[String]) -> Self {
        push_source_dirs(&mut self.clauses, &mut self.params, dirs, "f.full_path");
        self
    }

    fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            "1 = 1".to_string()
        } else {
            self.clauses
                .iter()
                .map(|c| format!("({})", c))
                .collect::<Vec<_>>()
                .join(" AND ")
        }
    }
}

/// Lower-cased namespace as stored in `resources.namespace_key`
fn namespace_key(namespace: &str) -> String {
    normalize_namespace(namespace).to_lowercase()
}

/// Matches `dir` itself and paths below it, but not `dir` followed by
/// other characters (`/src` keeps `/src/a.php` and drops `/srcx/a.php`).
fn push_source_dirs(clauses: &mut Vec<String>, params: &mut Vec<Value>, dirs: &[String], column: &str) {
    if dirs.is_empty() {
        return;
    }
    let parts: Vec<String> = dirs
        .iter()
        .map(|_| format!("({col} = ? OR ({col} >= ? AND {col} < ?))", col = column))
        .collect();
    clauses.push(parts.join(" OR "));
    for dir in dirs {
        let dir = dir.trim_end_matches('/');
        let below = format!("{}/", dir);
        params.push(Value::Text(dir.to_string()));
        params.push(Value::Text(below.clone()));
        params.push(Value::Text(key_upper_bound(&below)));
    }
}

/// Tag Record Store: durable tags and file metadata in SQLite.
///
/// Writers are serialized by an in-process lock and run inside an
/// IMMEDIATE transaction, so readers (WAL mode) only ever observe a file's
/// old or new tag set in full.
#[derive(Clone)]
pub struct TagStore {
    pool: ConnectionPool,
    db_path: Option<PathBuf>,
    write_lock: Arc<Mutex<()>>,
}

impl TagStore {
    /// Create or open a store on disk
    pub fn open(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        info!("Opening tag store at: {}", db_path.display());

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let manager = SqliteConnectionManager::file(&db_path).with_init(|conn| {
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
            configure_connection(conn)
        });

        Self::from_manager(manager, 8, Some(db_path))
    }

    /// A private in-memory store. Single connection, so every pool
    /// checkout sees the same database.
    pub fn open_in_memory() -> StoreResult<Self> {
        let manager = SqliteConnectionManager::memory().with_init(configure_connection);
        Self::from_manager(manager, 1, None)
    }

    fn from_manager(
        manager: SqliteConnectionManager,
        max_size: u32,
        db_path: Option<PathBuf>,
    ) -> StoreResult<Self> {
        let pool = Pool::builder().max_size(max_size).build(manager)?;

        {
            let conn = pool.get()?;
            let found = init_schema(&conn)?;
            if found > SCHEMA_VERSION {
                return Err(StoreError::SchemaMismatch {
                    found,
                    supported: SCHEMA_VERSION,
                });
            }
        }

        Ok(Self {
            pool,
            db_path,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Get a connection from the pool
    pub fn get_conn(&self) -> StoreResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Replace every tag of `file` with `parsed` and upsert its file row,
    /// all in one transaction. On error nothing is changed.
    pub fn replace_file_tags(&self, file: &FileTag, parsed: &ParsedFile) -> StoreResult<FileTag> {
        let _guard = self.write_lock.lock();
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT INTO file_items (full_path, name, name_key, modified_at, is_new, content_hash, tag_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(full_path) DO UPDATE SET
                name = excluded.name,
                name_key = excluded.name_key,
                modified_at = excluded.modified_at,
                is_new = excluded.is_new,
                content_hash = excluded.content_hash,
                tag_count = excluded.tag_count,
                indexed_at = CURRENT_TIMESTAMP",
            params![
                file.full_path,
                file.name,
                file.name.to_lowercase(),
                file.modified_at.timestamp_millis(),
                file.is_new,
                file.content_hash,
                parsed.tags.len() as i64,
            ],
        )?;

        let file_item_id: i64 = tx.query_row(
            "SELECT file_item_id FROM file_items WHERE full_path = ?1",
            [&file.full_path],
            |row| row.get(0),
        )?;

        delete_file_rows(&tx, file_item_id)?;

        {
            let mut insert = tx.prepare(INSERT_TAG_SQL)?;
            for tag in &parsed.tags {
                insert_tag(&mut insert, Some(file_item_id), tag, false)?;
            }
        }

        insert_trait_uses(&tx, file_item_id, &parsed.trait_uses)?;

        tx.commit()?;

        debug!(
            "Replaced tags for {}: {} tags, {} trait uses",
            file.full_path,
            parsed.tags.len(),
            parsed.trait_uses.len()
        );

        Ok(FileTag {
            id: file_item_id,
            tag_count: parsed.tags.len(),
            ..file.clone()
        })
    }

    /// Remove a file and all of its tags. Returns false if it was unknown.
    pub fn delete_file_tags(&self, full_path: &str) -> StoreResult<bool> {
        let _guard = self.write_lock.lock();
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let file_item_id: Option<i64> = tx
            .query_row(
                "SELECT file_item_id FROM file_items WHERE full_path = ?1",
                [full_path],
                |row| row.get(0),
            )
            .optional()?;

        let Some(file_item_id) = file_item_id else {
            return Ok(false);
        };

        delete_file_rows(&tx, file_item_id)?;
        tx.execute("DELETE FROM file_items WHERE file_item_id = ?1", [file_item_id])?;
        tx.commit()?;

        debug!("Deleted tags for {}", full_path);
        Ok(true)
    }

    /// Record a new mtime for a file whose content did not change
    pub fn touch_file(&self, full_path: &str, modified_at: DateTime<Utc>) -> StoreResult<bool> {
        let _guard = self.write_lock.lock();
        let conn = self.get_conn()?;
        let updated = conn.execute(
            "UPDATE file_items SET modified_at = ?1 WHERE full_path = ?2",
            params![modified_at.timestamp_millis(), full_path],
        )?;
        Ok(updated > 0)
    }

    /// Load built-in entries; they carry no file row
    pub fn insert_native_tags(&self, tags: &[Tag]) -> StoreResult<usize> {
        let _guard = self.write_lock.lock();
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut insert = tx.prepare(INSERT_TAG_SQL)?;
            for tag in tags {
                insert_tag(&mut insert, None, tag, true)?;
            }
        }
        tx.commit()?;
        Ok(tags.len())
    }

    /// One page of tags matching `filter`, strictly after `after` in `order`
    pub fn fetch_tags(
        &self,
        filter: &TagFilter,
        order: TagOrder,
        after: Option<&Tag>,
        limit: usize,
    ) -> StoreResult<Vec<Tag>> {
        let mut sql = format!(
            "SELECT {} FROM resources r LEFT JOIN file_items f ON f.file_item_id = r.file_item_id
             WHERE {} AND {}",
            TAG_COLUMNS,
            filter.where_sql(),
            LATEST_ONLY
        );
        let mut values = filter.params.clone();

        if let Some(last) = after {
            sql.push_str(" AND ");
            sql.push_str(order.cursor_sql());
            values.extend(order.cursor_params(last));
        }

        sql.push_str(" ORDER BY ");
        sql.push_str(order.order_sql());
        sql.push_str(" LIMIT ?");
        values.push(Value::Integer(limit as i64));

        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let tags = stmt
            .query_map(params_from_iter(values), row_to_tag)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(tags)
    }

    /// Every tag matching `filter`, in `order`
    pub fn find_tags(&self, filter: &TagFilter, order: TagOrder) -> StoreResult<Vec<Tag>> {
        self.fetch_tags(filter, order, None, i64::MAX as usize)
    }

    /// Raw rows whose key lies in `[prefix, prefix + MAX_KEY_CHAR)`, key order
    pub fn lookup_by_key_range(&self, prefix: &str) -> StoreResult<Vec<Tag>> {
        self.find_tags(&TagFilter::new().key_prefix(prefix), TagOrder::Key)
    }

    /// Point lookup on `(namespace, class, identifier[, kind])`
    pub fn lookup_by_exact_key(
        &self,
        namespace: &str,
        class_name: &str,
        identifier: &str,
        kind: Option<TagKind>,
    ) -> StoreResult<Vec<Tag>> {
        let kinds: Vec<TagKind> = match kind {
            Some(kind) => vec![kind],
            None if class_name.is_empty() => TagKind::TOP_LEVEL.to_vec(),
            None => TagKind::MEMBERS.to_vec(),
        };
        let key = super::make_key(namespace, class_name, identifier, kinds[0]);
        let filter = TagFilter::new()
            .key_eq(&key)
            .identifier_eq(identifier)
            .kinds(&kinds);
        self.find_tags(&filter, TagOrder::Key)
    }

    pub fn find_tags_by_file(&self, full_path: &str) -> StoreResult<Vec<Tag>> {
        self.find_tags(&TagFilter::new().file_eq(full_path), TagOrder::Key)
    }

    /// Most recently indexed class declaration named `class_name`
    pub fn find_class(&self, class_name: &str) -> StoreResult<Option<Tag>> {
        let (namespace, short) = split_qualified(class_name);
        let mut filter = TagFilter::new()
            .kinds(&[TagKind::Class])
            .class_eq("")
            .identifier_like(short);
        if class_name.starts_with('\\') {
            filter = filter.namespace_eq(&namespace);
        }

        let sql = format!(
            "SELECT {} FROM resources r LEFT JOIN file_items f ON f.file_item_id = r.file_item_id
             WHERE {} ORDER BY r.id DESC LIMIT 1",
            TAG_COLUMNS,
            filter.where_sql()
        );
        let conn = self.get_conn()?;
        let tag = conn
            .query_row(&sql, params_from_iter(filter.params), row_to_tag)
            .optional()?;
        Ok(tag)
    }

    pub fn all_file_tags(&self) -> StoreResult<Vec<FileTag>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM file_items f ORDER BY f.full_path",
            FILE_COLUMNS
        ))?;
        let files = stmt
            .query_map([], row_to_file_tag)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(files)
    }

    pub fn file_tag_by_path(&self, full_path: &str) -> StoreResult<Option<FileTag>> {
        let conn = self.get_conn()?;
        let file = conn
            .query_row(
                &format!("SELECT {} FROM file_items f WHERE f.full_path = ?1", FILE_COLUMNS),
                [full_path],
                row_to_file_tag,
            )
            .optional()?;
        Ok(file)
    }

    /// One page of files whose basename contains `fragment`
    /// (case-insensitive), ordered by name then id
    pub fn fetch_file_tags(
        &self,
        fragment: &str,
        source_dirs: &[String],
        after: Option<&FileTag>,
        limit: usize,
    ) -> StoreResult<Vec<FileTag>> {
        let mut clauses = vec!["instr(f.name_key, ?) > 0".to_string()];
        let mut values = vec![Value::Text(fragment.to_lowercase())];
        push_source_dirs(&mut clauses, &mut values, source_dirs, "f.full_path");

        if let Some(last) = after {
            clauses.push("(f.name_key, f.file_item_id) > (?, ?)".to_string());
            values.push(Value::Text(last.name.to_lowercase()));
            values.push(Value::Integer(last.id));
        }
        values.push(Value::Integer(limit as i64));

        let where_sql = clauses
            .iter()
            .map(|c| format!("({})", c))
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!(
            "SELECT {} FROM file_items f WHERE {} ORDER BY f.name_key, f.file_item_id LIMIT ?",
            FILE_COLUMNS, where_sql
        );

        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let files = stmt
            .query_map(params_from_iter(values), row_to_file_tag)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(files)
    }

    /// Trait use clauses recorded for `class_name` across all files,
    /// optionally restricted to `source_dirs`. A leading-backslash name only
    /// matches the class in that namespace; a bare name matches any.
    pub fn trait_use_for_class(&self, class_name: &str, source_dirs: &[String]) -> StoreResult<TraitUse> {
        let (namespace, short) = split_qualified(class_name);
        let (column, class_key) = if class_name.starts_with('\\') {
            ("qualified_key", fully_qualified(&namespace, short).to_lowercase())
        } else {
            ("class_key", short.to_lowercase())
        };
        let conn = self.get_conn()?;

        let scoped = |table: &str, columns: &str, order: &str| {
            let mut clauses = vec![format!("{}.{} = ?", table, column)];
            let mut values = vec![Value::Text(class_key.clone())];
            push_source_dirs(&mut clauses, &mut values, source_dirs, "f.full_path");
            let sql = format!(
                "SELECT {columns} FROM {table} JOIN file_items f ON f.file_item_id = {table}.file_item_id
                 WHERE {} ORDER BY {order}",
                clauses.join(" AND "),
                columns = columns,
                table = table,
                order = order
            );
            (sql, values)
        };

        let mut uses = TraitUse {
            class_name: short.to_string(),
            ..TraitUse::default()
        };

        let (sql, values) = scoped(
            "trait_uses",
            "trait_uses.namespace_name, trait_uses.trait_name",
            "trait_uses.file_item_id, trait_uses.position",
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (namespace, trait_name) = row?;
            if uses.namespace_name.is_empty() {
                uses.namespace_name = namespace;
            }
            if !uses.traits.iter().any(|t| t.eq_ignore_ascii_case(&trait_name)) {
                uses.traits.push(trait_name);
            }
        }

        let (sql, values) = scoped(
            "trait_aliases",
            "trait_aliases.trait_name, trait_aliases.method_name, trait_aliases.alias, trait_aliases.visibility",
            "trait_aliases.id",
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| {
            Ok(TraitAlias {
                trait_name: row.get(0)?,
                method_name: row.get(1)?,
                alias: row.get(2)?,
                visibility: row.get(3)?,
            })
        })?;
        for row in rows {
            uses.aliases.push(row?);
        }

        let (sql, values) = scoped(
            "trait_insteadof",
            "trait_insteadof.trait_name, trait_insteadof.method_name, trait_insteadof.excluded_trait",
            "trait_insteadof.id",
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| {
            Ok(TraitInsteadOf {
                trait_name: row.get(0)?,
                method_name: row.get(1)?,
                excluded_trait: row.get(2)?,
            })
        })?;
        for row in rows {
            uses.insteadof.push(row?);
        }

        Ok(uses)
    }

    /// True when neither tags nor files are stored
    pub fn is_empty(&self) -> StoreResult<bool> {
        let conn = self.get_conn()?;
        let empty: bool = conn.query_row(
            "SELECT NOT EXISTS (SELECT 1 FROM resources) AND NOT EXISTS (SELECT 1 FROM file_items)",
            [],
            |row| row.get(0),
        )?;
        Ok(empty)
    }

    /// Get index statistics
    pub fn get_stats(&self) -> StoreResult<IndexStats> {
        let conn = self.get_conn()?;

        let total_tags: i64 = conn.query_row("SELECT COUNT(*) FROM resources", [], |row| row.get(0))?;
        let total_files: i64 = conn.query_row("SELECT COUNT(*) FROM file_items", [], |row| row.get(0))?;
        let classes_with_traits: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT qualified_key) FROM trait_uses",
            [],
            |row| row.get(0),
        )?;

        Ok(IndexStats {
            total_tags: total_tags as usize,
            total_files: total_files as usize,
            classes_with_traits: classes_with_traits as usize,
        })
    }

    pub fn tag_counts_by_kind(&self) -> StoreResult<Vec<(String, usize)>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT kind, COUNT(*) AS count FROM resources GROUP BY kind ORDER BY count DESC, kind",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Clear all data
    pub fn clear(&self) -> StoreResult<()> {
        let _guard = self.write_lock.lock();
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch(
            "DELETE FROM trait_insteadof;
             DELETE FROM trait_aliases;
             DELETE FROM trait_uses;
             DELETE FROM resources;
             DELETE FROM file_items;",
        )?;
        tx.commit()?;
        Ok(())
    }
}

fn configure_connection(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")
}

const INSERT_TAG_SQL: &str = "INSERT INTO resources (
        file_item_id, key, identifier, identifier_key, class_name, class_key, namespace_name,
        namespace_key, kind, return_type, signature, comment, parent_class, line_number,
        character_position, is_native, is_static
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)";

fn insert_tag(
    stmt: &mut rusqlite::Statement<'_>,
    file_item_id: Option<i64>,
    tag: &Tag,
    is_native: bool,
) -> rusqlite::Result<()> {
    stmt.execute(params![
        file_item_id,
        tag.key(),
        tag.identifier,
        tag.identifier.to_lowercase(),
        tag.class_name,
        tag.class_name.to_lowercase(),
        tag.namespace_name,
        namespace_key(&tag.namespace_name),
        tag.kind.as_str(),
        tag.return_type,
        tag.signature,
        tag.comment,
        tag.parent_class,
        tag.line_number as i64,
        tag.character_position as i64,
        is_native || tag.is_native,
        tag.is_static,
    ])?;
    Ok(())
}

fn insert_trait_uses(conn: &Connection, file_item_id: i64, trait_uses: &[TraitUse]) -> rusqlite::Result<()> {
    for uses in trait_uses {
        let class_key = uses.class_name.to_lowercase();
        let qualified_key = fully_qualified(&uses.namespace_name, &uses.class_name).to_lowercase();
        for (position, trait_name) in uses.traits.iter().enumerate() {
            conn.execute(
                "INSERT INTO trait_uses (file_item_id, class_key, qualified_key, class_name, namespace_name,
                                         trait_name, position)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    file_item_id,
                    class_key,
                    qualified_key,
                    uses.class_name,
                    uses.namespace_name,
                    trait_name,
                    position as i64
                ],
            )?;
        }
        for alias in &uses.aliases {
            conn.execute(
                "INSERT INTO trait_aliases (file_item_id, class_key, qualified_key, trait_name, method_name,
                                            alias, visibility)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    file_item_id,
                    class_key,
                    qualified_key,
                    alias.trait_name,
                    alias.method_name,
                    alias.alias,
                    alias.visibility
                ],
            )?;
        }
        for rule in &uses.insteadof {
            conn.execute(
                "INSERT INTO trait_insteadof (file_item_id, class_key, qualified_key, trait_name, method_name,
                                              excluded_trait)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    file_item_id,
                    class_key,
                    qualified_key,
                    rule.trait_name,
                    rule.method_name,
                    rule.excluded_trait
                ],
            )?;
        }
    }
    Ok(())
}

fn delete_file_rows(conn: &Connection, file_item_id: i64) -> rusqlite::Result<()> {
    for table in ["resources", "trait_uses", "trait_aliases", "trait_insteadof"] {
        conn.execute(
            &format!("DELETE FROM {} WHERE file_item_id = ?1", table),
            [file_item_id],
        )?;
    }
    Ok(())
}

/// Index statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_tags: usize,
    pub total_files: usize,
    /// Distinct classes with at least one `use Trait;` clause
    pub classes_with_traits: usize,
}

/// Convert database row to Tag
fn row_to_tag(row: &Row) -> rusqlite::Result<Tag> {
    let kind_str: String = row.get(4)?;
    let kind = kind_str
        .parse::<TagKind>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, e.into()))?;

    Ok(Tag {
        id: row.get(0)?,
        identifier: row.get(1)?,
        class_name: row.get(2)?,
        namespace_name: row.get(3)?,
        kind,
        return_type: row.get(5)?,
        signature: row.get(6)?,
        comment: row.get(7)?,
        parent_class: row.get(8)?,
        line_number: row.get::<_, i64>(9)? as u32,
        character_position: row.get::<_, i64>(10)? as u32,
        is_native: row.get(11)?,
        is_static: row.get(12)?,
        full_path: row.get(13)?,
    })
}

/// Convert database row to FileTag
fn row_to_file_tag(row: &Row) -> rusqlite::Result<FileTag> {
    let millis: i64 = row.get(3)?;
    let modified_at: DateTime<Utc> = Utc
        .timestamp_millis_opt(millis)
        .single()
        .unwrap_or_default();

    Ok(FileTag {
        id: row.get(0)?,
        full_path: row.get(1)?,
        name: row.get(2)?,
        modified_at,
        is_new: row.get(4)?,
        content_hash: row.get(5)?,
        tag_count: row.get::<_, i64>(6)? as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn class(name: &str, path: &str) -> Tag {
        let mut tag = Tag::new(TagKind::Class, name);
        tag.full_path = path.to_string();
        tag.signature = format!("class {}", name);
        tag.line_number = 1;
        tag
    }

    fn method(class_name: &str, name: &str, path: &str) -> Tag {
        let mut tag = Tag::new(TagKind::Method, name);
        tag.class_name = class_name.to_string();
        tag.full_path = path.to_string();
        tag.signature = format!("public function {}()", name);
        tag.return_type = "string".to_string();
        tag.comment = "Returns the name".to_string();
        tag.line_number = 3;
        tag
    }

    fn parsed(tags: Vec<Tag>) -> ParsedFile {
        ParsedFile {
            tags,
            trait_uses: Vec::new(),
        }
    }

    fn file(path: &str) -> FileTag {
        FileTag::new(path, Utc::now(), false)
    }

    #[test]
    fn test_create_database() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("tags.db");

        let store = TagStore::open(&db_path).unwrap();
        assert!(db_path.exists());
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_replace_and_lookup_round_trip() {
        let dir = tempdir().unwrap();
        let store = TagStore::open(dir.path().join("tags.db")).unwrap();

        let path = "/src/user.php";
        store
            .replace_file_tags(
                &file(path),
                &parsed(vec![class("UserClass", path), method("UserClass", "getName", path)]),
            )
            .unwrap();

        let found = store
            .lookup_by_exact_key("\\", "UserClass", "getName", Some(TagKind::Method))
            .unwrap();
        assert_eq!(found.len(), 1);
        let tag = &found[0];
        assert_eq!(tag.signature, "public function getName()");
        assert_eq!(tag.return_type, "string");
        assert_eq!(tag.comment, "Returns the name");
        assert_eq!(tag.kind, TagKind::Method);
        assert_eq!(tag.full_path, path);
        assert!(!store.is_empty().unwrap());
    }

    #[test]
    fn test_replace_leaves_no_residue() {
        let dir = tempdir().unwrap();
        let store = TagStore::open(dir.path().join("tags.db")).unwrap();
        let path = "/src/a.php";

        store
            .replace_file_tags(&file(path), &parsed(vec![class("Old", path), method("Old", "gone", path)]))
            .unwrap();
        let updated = store
            .replace_file_tags(&file(path), &parsed(vec![class("New", path)]))
            .unwrap();

        let tags = store.find_tags_by_file(path).unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].identifier, "New");
        assert_eq!(updated.tag_count, 1);

        // file row is updated in place
        assert_eq!(store.all_file_tags().unwrap().len(), 1);
        assert_eq!(store.file_tag_by_path(path).unwrap().unwrap().id, updated.id);
    }

    #[test]
    fn test_delete_file_tags() {
        let dir = tempdir().unwrap();
        let store = TagStore::open(dir.path().join("tags.db")).unwrap();
        let path = "/src/a.php";

        store
            .replace_file_tags(&file(path), &parsed(vec![class("UserClass", path)]))
            .unwrap();
        assert!(store.delete_file_tags(path).unwrap());
        assert!(!store.delete_file_tags(path).unwrap());

        assert!(store.lookup_by_key_range("\\user").unwrap().is_empty());
        assert!(store.file_tag_by_path(path).unwrap().is_none());
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_key_range_orders_class_before_members() {
        let dir = tempdir().unwrap();
        let store = TagStore::open(dir.path().join("tags.db")).unwrap();
        let path = "/src/a.php";

        store
            .replace_file_tags(
                &file(path),
                &parsed(vec![
                    method("UserClass", "zeta", path),
                    method("UserClass", "alpha", path),
                    class("UserClass", path),
                    class("UserClassB", path),
                ]),
            )
            .unwrap();

        let keys: Vec<String> = store
            .lookup_by_key_range("\\userclass")
            .unwrap()
            .iter()
            .map(|t| t.key())
            .collect();
        assert_eq!(
            keys,
            vec![
                "\\userclass",
                "\\userclass::alpha",
                "\\userclass::zeta",
                "\\userclassb"
            ]
        );
    }

    #[test]
    fn test_duplicates_in_one_file_keep_latest() {
        let dir = tempdir().unwrap();
        let store = TagStore::open(dir.path().join("tags.db")).unwrap();
        let path = "/src/a.php";

        let mut first = class("Dup", path);
        first.line_number = 1;
        let mut second = class("Dup", path);
        second.line_number = 9;
        store
            .replace_file_tags(&file(path), &parsed(vec![first, second]))
            .unwrap();

        let found = store.lookup_by_key_range("\\dup").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].line_number, 9);
    }

    #[test]
    fn test_paging_resumes_after_cursor() {
        let dir = tempdir().unwrap();
        let store = TagStore::open(dir.path().join("tags.db")).unwrap();
        let path = "/src/a.php";
        let tags: Vec<Tag> = (0..5).map(|i| class(&format!("C{}", i), path)).collect();
        store.replace_file_tags(&file(path), &parsed(tags)).unwrap();

        let filter = TagFilter::new().identifier_prefix("c");
        let first = store.fetch_tags(&filter, TagOrder::Key, None, 2).unwrap();
        let second = store
            .fetch_tags(&filter, TagOrder::Key, first.last(), 2)
            .unwrap();
        let third = store
            .fetch_tags(&filter, TagOrder::Key, second.last(), 2)
            .unwrap();

        let names: Vec<&str> = first
            .iter()
            .chain(second.iter())
            .chain(third.iter())
            .map(|t| t.identifier.as_str())
            .collect();
        assert_eq!(names, vec!["C0", "C1", "C2", "C3", "C4"]);
    }

    #[test]
    fn test_source_dirs_filter() {
        let dir = tempdir().unwrap();
        let store = TagStore::open(dir.path().join("tags.db")).unwrap();
        store
            .replace_file_tags(&file("/a/x.php"), &parsed(vec![class("X", "/a/x.php")]))
            .unwrap();
        store
            .replace_file_tags(&file("/b/y.php"), &parsed(vec![class("Y", "/b/y.php")]))
            .unwrap();

        let filter = TagFilter::new().source_dirs(&["/b/".to_string()]);
        let found = store.find_tags(&filter, TagOrder::Key).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].identifier, "Y");
    }

    #[test]
    fn test_trait_uses_round_trip() {
        let dir = tempdir().unwrap();
        let store = TagStore::open(dir.path().join("tags.db")).unwrap();
        let path = "/src/c.php";
        let uses = TraitUse {
            class_name: "C".to_string(),
            namespace_name: "\\".to_string(),
            traits: vec!["\\T".to_string(), "\\U".to_string()],
            aliases: vec![TraitAlias {
                trait_name: "\\T".to_string(),
                method_name: "f".to_string(),
                alias: "g".to_string(),
                visibility: "protected".to_string(),
            }],
            insteadof: Vec::new(),
        };
        store
            .replace_file_tags(
                &file(path),
                &ParsedFile {
                    tags: vec![class("C", path)],
                    trait_uses: vec![uses.clone()],
                },
            )
            .unwrap();

        let loaded = store.trait_use_for_class("c", &[]).unwrap();
        assert_eq!(loaded.traits, uses.traits);
        assert_eq!(loaded.aliases, uses.aliases);

        store.delete_file_tags(path).unwrap();
        assert!(store.trait_use_for_class("C", &[]).unwrap().is_empty());
    }

    #[test]
    fn test_qualified_trait_lookup_stays_in_its_namespace() {
        let store = TagStore::open_in_memory().unwrap();
        let path = "/src/c.php";
        let uses = TraitUse {
            class_name: "C".to_string(),
            namespace_name: "\\A".to_string(),
            traits: vec!["\\A\\T".to_string()],
            ..TraitUse::default()
        };
        store
            .replace_file_tags(
                &file(path),
                &ParsedFile {
                    tags: Vec::new(),
                    trait_uses: vec![uses],
                },
            )
            .unwrap();

        assert_eq!(store.trait_use_for_class("\\A\\C", &[]).unwrap().traits, vec!["\\A\\T"]);
        assert_eq!(store.trait_use_for_class("\\a\\c", &[]).unwrap().traits, vec!["\\A\\T"]);
        assert!(store.trait_use_for_class("\\B\\C", &[]).unwrap().is_empty());
        assert!(store.trait_use_for_class("\\C", &[]).unwrap().is_empty());
        // a bare name is not pinned to any namespace
        assert_eq!(store.trait_use_for_class("C", &[]).unwrap().traits.len(), 1);
    }

    #[test]
    fn test_failed_replace_keeps_previous_tags() {
        let store = TagStore::open_in_memory().unwrap();
        let path = "/src/a.php";
        let mut original = file(path);
        original.content_hash = "first".to_string();
        store
            .replace_file_tags(&original, &parsed(vec![class("Old", path), method("Old", "kept", path)]))
            .unwrap();

        store
            .get_conn()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_boom BEFORE INSERT ON resources WHEN NEW.identifier = 'Boom'
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .unwrap();

        let mut changed = file(path);
        changed.content_hash = "second".to_string();
        let result = store.replace_file_tags(&changed, &parsed(vec![class("New", path), class("Boom", path)]));
        assert!(result.is_err());

        let names: Vec<String> = store
            .find_tags_by_file(path)
            .unwrap()
            .into_iter()
            .map(|t| t.identifier)
            .collect();
        assert_eq!(names, vec!["Old", "kept"]);
        let row = store.file_tag_by_path(path).unwrap().unwrap();
        assert_eq!(row.content_hash, "first");
        assert_eq!(row.tag_count, 2);
    }

    #[test]
    fn test_source_dirs_stop_at_path_boundary() {
        let store = TagStore::open_in_memory().unwrap();
        for (path, name) in [("/src/a.php", "A"), ("/srcx/b.php", "B")] {
            store.replace_file_tags(&file(path), &parsed(vec![class(name, path)])).unwrap();
        }

        for dir in ["/src", "/src/"] {
            let filter = TagFilter::new().source_dirs(&[dir.to_string()]);
            let found = store.find_tags(&filter, TagOrder::Key).unwrap();
            let names: Vec<&str> = found.iter().map(|t| t.identifier.as_str()).collect();
            assert_eq!(names, vec!["A"], "dir {}", dir);
        }

        let files = store.fetch_file_tags("php", &["/src".to_string()], None, 10).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].full_path, "/src/a.php");
    }

    #[test]
    fn test_namespace_match_folds_non_ascii_case() {
        let store = TagStore::open_in_memory().unwrap();
        let path = "/src/u.php";
        let mut tag = class("Foo", path);
        tag.namespace_name = "\\Über".to_string();
        store.replace_file_tags(&file(path), &parsed(vec![tag])).unwrap();

        for namespace in ["\\Über", "\\über", "ÜBER"] {
            let filter = TagFilter::new().namespace_eq(namespace);
            assert_eq!(store.find_tags(&filter, TagOrder::Key).unwrap().len(), 1, "{}", namespace);
        }
        let filter = TagFilter::new().namespace_eq("\\Uber");
        assert!(store.find_tags(&filter, TagOrder::Key).unwrap().is_empty());
    }

    #[test]
    fn test_namespace_prefix_excludes_siblings() {
        let store = TagStore::open_in_memory().unwrap();
        let path = "/src/ns.php";
        let in_namespace = |name: &str, namespace: &str| {
            let mut tag = class(name, path);
            tag.namespace_name = namespace.to_string();
            tag
        };
        store
            .replace_file_tags(
                &file(path),
                &parsed(vec![
                    in_namespace("Inner", "\\First"),
                    in_namespace("Other", "\\Firstx"),
                    in_namespace("FirstHelper", "\\"),
                ]),
            )
            .unwrap();

        let filter = TagFilter::new().namespace_prefix("\\", "First");
        let names: Vec<String> = store
            .find_tags(&filter, TagOrder::Key)
            .unwrap()
            .iter()
            .map(Tag::fully_qualified_name)
            .collect();
        assert_eq!(names, vec!["\\First\\Inner", "\\FirstHelper"]);
    }

    #[test]
    fn test_cursor_survives_reindex_of_the_same_file() {
        let store = TagStore::open_in_memory().unwrap();
        let path = "/src/a.php";
        let tags = || parsed((1..=3).map(|i| class(&format!("Aa{}", i), path)).collect());
        store.replace_file_tags(&file(path), &tags()).unwrap();

        let filter = TagFilter::new().identifier_prefix("aa");
        let first = store.fetch_tags(&filter, TagOrder::Key, None, 1).unwrap();
        assert_eq!(first[0].identifier, "Aa1");

        // same content written again under fresh row ids
        store.replace_file_tags(&file(path), &tags()).unwrap();

        let rest = store.fetch_tags(&filter, TagOrder::Key, first.last(), 10).unwrap();
        let names: Vec<&str> = rest.iter().map(|t| t.identifier.as_str()).collect();
        assert_eq!(names, vec!["Aa2", "Aa3"]);
    }

    #[test]
    fn test_file_name_search() {
        let dir = tempdir().unwrap();
        let store = TagStore::open(dir.path().join("tags.db")).unwrap();
        for path in ["/src/UserController.php", "/src/user/helpers.php", "/src/Other.php"] {
            store.replace_file_tags(&file(path), &parsed(Vec::new())).unwrap();
        }

        let found = store.fetch_file_tags("user", &[], None, 10).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "UserController.php");
    }

    #[test]
    fn test_touch_file_updates_mtime_only() {
        let store = TagStore::open_in_memory().unwrap();
        let path = "/src/a.php";
        store
            .replace_file_tags(&file(path), &parsed(vec![class("A", path)]))
            .unwrap();

        let later = Utc.timestamp_millis_opt(4_102_444_800_000).unwrap();
        assert!(store.touch_file(path, later).unwrap());
        assert!(!store.touch_file("/src/missing.php", later).unwrap());

        let row = store.file_tag_by_path(path).unwrap().unwrap();
        assert_eq!(row.modified_at, later);
        assert_eq!(store.find_tags_by_file(path).unwrap().len(), 1);
    }

    #[test]
    fn test_stats() {
        let dir = tempdir().unwrap();
        let store = TagStore::open(dir.path().join("tags.db")).unwrap();

        let stats = store.get_stats().unwrap();
        assert_eq!(stats.total_tags, 0);
        assert_eq!(stats.total_files, 0);
        assert_eq!(stats.classes_with_traits, 0);

        let path = "/src/c.php";
        let uses = |class_name: &str| TraitUse {
            class_name: class_name.to_string(),
            namespace_name: "\\".to_string(),
            traits: vec!["\\T".to_string(), "\\U".to_string()],
            ..TraitUse::default()
        };
        store
            .replace_file_tags(
                &file(path),
                &ParsedFile {
                    tags: vec![class("C", path), class("D", path)],
                    trait_uses: vec![uses("C"), uses("D")],
                },
            )
            .unwrap();

        let stats = store.get_stats().unwrap();
        assert_eq!(stats.total_files, 1);
        assert_eq!(stats.total_tags, 2);
        assert_eq!(stats.classes_with_traits, 2);
    }

    #[test]
    fn test_in_memory_store_shares_one_database() {
        let store = TagStore::open_in_memory().unwrap();
        store.insert_native_tags(&[Tag::new(TagKind::Function, "strlen")]).unwrap();

        let found = store.lookup_by_exact_key("\\", "", "strlen", None).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].is_native);
        assert!(found[0].full_path.is_empty());
    }
}
