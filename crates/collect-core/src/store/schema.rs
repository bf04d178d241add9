//! SQLite schema for the asset registry.
//!
//! The DDL is idempotent and replayed on every open. The stored
//! `schema_version` guards against a registry written by a newer build,
//! whose layout this code would misread.

use rusqlite::{Connection, OptionalExtension};

use crate::errors::{CollectError, CollectResult};

pub const SCHEMA_VERSION: i32 = 1;

/// 2 tables + 2 indexes.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS registry_meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS assets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        path TEXT NOT NULL UNIQUE,
        display_name TEXT NOT NULL,
        meta_text TEXT NOT NULL,
        kind TEXT NOT NULL CHECK (kind IN ('form', 'instance')),
        status TEXT NOT NULL CHECK (status IN ('available', 'incomplete', 'complete')),
        content_hash TEXT NOT NULL DEFAULT '',
        updated_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE INDEX IF NOT EXISTS idx_assets_kind ON assets(kind);",
    // status-filtered listings and counts
    "CREATE INDEX IF NOT EXISTS idx_assets_kind_status ON assets(kind, status, id);",
];

/// Apply the DDL, then stamp a fresh registry or check an existing one.
pub fn init_schema(conn: &Connection) -> CollectResult<()> {
    for stmt in SCHEMA_STATEMENTS {
        conn.execute_batch(stmt)?;
    }
    match get_schema_version(conn)? {
        Some(stored) if stored > SCHEMA_VERSION => Err(CollectError::Database(format!(
            "registry schema v{stored} is newer than supported v{SCHEMA_VERSION}"
        ))),
        Some(stored) if stored == SCHEMA_VERSION => Ok(()),
        _ => set_schema_version(conn, SCHEMA_VERSION),
    }
}

/// Stored schema version, `None` for a registry that was never stamped.
pub fn get_schema_version(conn: &Connection) -> CollectResult<Option<i32>> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM registry_meta WHERE key = 'schema_version';",
            [],
            |row| row.get(0),
        )
        .optional()?;
    value
        .map(|v| {
            v.parse::<i32>().map_err(|_| {
                CollectError::Database(format!("unreadable schema_version {v:?}"))
            })
        })
        .transpose()
}

fn set_schema_version(conn: &Connection, version: i32) -> CollectResult<()> {
    conn.execute(
        "INSERT INTO registry_meta(key, value) VALUES('schema_version', ?1) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        rusqlite::params![version.to_string()],
    )?;
    Ok(())
}
