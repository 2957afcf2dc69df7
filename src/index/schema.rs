use rusqlite::{Connection, Result};
use tracing::{debug, info};

/// SQLite schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema. Returns the version found on disk before
/// any migration ran so callers can reject stores written by newer builds.
pub fn init_schema(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    debug!("Current tag store schema version: {}", current_version);

    if current_version < SCHEMA_VERSION {
        info!("Upgrading tag store schema from v{} to v{}", current_version, SCHEMA_VERSION);
        apply_migrations(conn, current_version)?;
    }

    Ok(current_version)
}

fn apply_migrations(conn: &Connection, from_version: i32) -> Result<()> {
    for version in (from_version + 1)..=SCHEMA_VERSION {
        info!("Applying migration v{}", version);
        match version {
            1 => create_v1_schema(conn)?,
            _ => unreachable!("Unknown schema version: {}", version),
        }

        conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    }

    Ok(())
}

fn create_v1_schema(conn: &Connection) -> Result<()> {
    // One row per source file; updated in place on re-parse
    conn.execute(
        "CREATE TABLE IF NOT EXISTS file_items (
            file_item_id INTEGER PRIMARY KEY AUTOINCREMENT,
            full_path TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            name_key TEXT NOT NULL,
            modified_at INTEGER NOT NULL,
            is_new INTEGER NOT NULL DEFAULT 0,
            content_hash TEXT NOT NULL DEFAULT '',
            tag_count INTEGER NOT NULL DEFAULT 0,
            indexed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_file_items_name_key ON file_items(name_key)",
        [],
    )?;

    // Tags. file_item_id is NULL for native entries.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS resources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_item_id INTEGER REFERENCES file_items(file_item_id) ON DELETE CASCADE,
            key TEXT NOT NULL,
            identifier TEXT NOT NULL,
            identifier_key TEXT NOT NULL,
            class_name TEXT NOT NULL DEFAULT '',
            class_key TEXT NOT NULL DEFAULT '',
            namespace_name TEXT NOT NULL DEFAULT '\\',
            namespace_key TEXT NOT NULL DEFAULT '\\',
            kind TEXT NOT NULL,
            return_type TEXT NOT NULL DEFAULT '',
            signature TEXT NOT NULL DEFAULT '',
            comment TEXT NOT NULL DEFAULT '',
            parent_class TEXT NOT NULL DEFAULT '',
            line_number INTEGER NOT NULL DEFAULT 0,
            character_position INTEGER NOT NULL DEFAULT 0,
            is_native INTEGER NOT NULL DEFAULT 0,
            is_static INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute("CREATE INDEX IF NOT EXISTS idx_resources_key ON resources(key)", [])?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_resources_identifier_key ON resources(identifier_key)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_resources_class_key ON resources(class_key, identifier_key)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_resources_namespace ON resources(namespace_key, identifier_key)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_resources_file ON resources(file_item_id)",
        [],
    )?;

    // Trait use clauses, parsed once at index time
    conn.execute(
        "CREATE TABLE IF NOT EXISTS trait_uses (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_item_id INTEGER NOT NULL REFERENCES file_items(file_item_id) ON DELETE CASCADE,
            class_key TEXT NOT NULL,
            qualified_key TEXT NOT NULL,
            class_name TEXT NOT NULL,
            namespace_name TEXT NOT NULL,
            trait_name TEXT NOT NULL,
            position INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS trait_aliases (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_item_id INTEGER NOT NULL REFERENCES file_items(file_item_id) ON DELETE CASCADE,
            class_key TEXT NOT NULL,
            qualified_key TEXT NOT NULL,
            trait_name TEXT NOT NULL,
            method_name TEXT NOT NULL,
            alias TEXT NOT NULL,
            visibility TEXT NOT NULL DEFAULT ''
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS trait_insteadof (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_item_id INTEGER NOT NULL REFERENCES file_items(file_item_id) ON DELETE CASCADE,
            class_key TEXT NOT NULL,
            qualified_key TEXT NOT NULL,
            trait_name TEXT NOT NULL,
            method_name TEXT NOT NULL,
            excluded_trait TEXT NOT NULL
        )",
        [],
    )?;

    for table in ["trait_uses", "trait_aliases", "trait_insteadof"] {
        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_class ON {table}(class_key)",
                table = table
            ),
            [],
        )?;
        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_qualified ON {table}(qualified_key)",
                table = table
            ),
            [],
        )?;
    }

    info!("v1 schema created successfully");

    Ok(())
}
