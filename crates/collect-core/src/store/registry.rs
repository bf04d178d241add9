//! SQLite asset registry.
//!
//! One connection guarded by a `parking_lot::Mutex`; every mutating pass runs
//! inside a SQLite transaction while holding the lock, so a reconciliation
//! pass and a deletion pass can never interleave mid-record-set.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::errors::{CollectError, CollectResult};
use crate::models::{
    meta_text_for, AssetCounts, AssetKind, AssetRecord, AssetStatus, NewAsset, Snapshot,
};
use crate::store::schema;

const RECORD_COLUMNS: &str =
    "id, path, display_name, meta_text, kind, status, content_hash, updated_at";

// ---------------------------------------------------------------------------
// Helper: tilde expansion
// ---------------------------------------------------------------------------

/// Expand a leading `~` to the user's home directory.
pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut expanded = PathBuf::from(home);
            if path.len() > 2 {
                expanded.push(&path[2..]);
            }
            return expanded;
        }
    }
    PathBuf::from(path)
}

/// Expand `~` and anchor relative paths at the current directory.
pub(crate) fn resolve_path(path: &Path) -> CollectResult<PathBuf> {
    let expanded = expand_tilde(&path.to_string_lossy());
    if expanded.is_absolute() {
        Ok(expanded)
    } else {
        Ok(std::env::current_dir()?.join(expanded))
    }
}

// ---------------------------------------------------------------------------
// SQL conversions
// ---------------------------------------------------------------------------

impl ToSql for AssetKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for AssetKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: CollectError| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for AssetStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for AssetStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: CollectError| FromSqlError::Other(Box::new(e)))
    }
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<AssetRecord> {
    Ok(AssetRecord {
        id: row.get(0)?,
        path: PathBuf::from(row.get::<_, String>(1)?),
        display_name: row.get(2)?,
        meta_text: row.get(3)?,
        kind: row.get(4)?,
        status: row.get(5)?,
        content_hash: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

// ---------------------------------------------------------------------------
// RegistryTx
// ---------------------------------------------------------------------------

/// Registry operations bound to a connection that is already locked (and,
/// inside [`AssetRegistry::transaction`], inside an open transaction).
pub struct RegistryTx<'a> {
    conn: &'a Connection,
}

impl<'a> RegistryTx<'a> {
    /// Insert a new record and return it with its assigned id.
    pub fn insert(&self, asset: &NewAsset) -> CollectResult<AssetRecord> {
        self.conn.execute(
            "INSERT INTO assets(path, display_name, meta_text, kind, status, content_hash) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
            params![
                path_text(&asset.path),
                asset.display_name(),
                asset.meta_text(),
                asset.kind,
                asset.status,
                asset.content_hash,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get(id)?
            .ok_or_else(|| CollectError::Database(format!("inserted asset {id} vanished")))
    }

    /// Insert a FORM record for `path` unless one already exists. Returns
    /// `true` when a row was added.
    pub fn upsert_form(&self, path: &Path, content_hash: &str) -> CollectResult<bool> {
        let asset = NewAsset::form(path, content_hash);
        let added = self.conn.execute(
            "INSERT INTO assets(path, display_name, meta_text, kind, status, content_hash) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(path) DO NOTHING;",
            params![
                path_text(&asset.path),
                asset.display_name(),
                asset.meta_text(),
                asset.kind,
                asset.status,
                asset.content_hash,
            ],
        )?;
        Ok(added > 0)
    }

    pub fn get(&self, id: i64) -> CollectResult<Option<AssetRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM assets WHERE id = ?1;");
        Ok(self
            .conn
            .query_row(&sql, params![id], row_to_record)
            .optional()?)
    }

    pub fn find_by_path(&self, path: &Path) -> CollectResult<Option<AssetRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM assets WHERE path = ?1;");
        Ok(self
            .conn
            .query_row(&sql, params![path_text(path)], row_to_record)
            .optional()?)
    }

    pub fn list_all(&self) -> CollectResult<Snapshot> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM assets ORDER BY id ASC;");
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map([], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Snapshot::new(records))
    }

    /// Records of one kind, optionally restricted to one status, in
    /// ascending id order.
    pub fn list(&self, kind: AssetKind, status: Option<AssetStatus>) -> CollectResult<Snapshot> {
        let records = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {RECORD_COLUMNS} FROM assets \
                     WHERE kind = ?1 AND status = ?2 ORDER BY id ASC;"
                );
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![kind, status], row_to_record)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let sql =
                    format!("SELECT {RECORD_COLUMNS} FROM assets WHERE kind = ?1 ORDER BY id ASC;");
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![kind], row_to_record)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        Ok(Snapshot::new(records))
    }

    pub fn count(&self, kind: AssetKind, status: Option<AssetStatus>) -> CollectResult<i64> {
        let count = match status {
            Some(status) => self.conn.query_row(
                "SELECT COUNT(*) FROM assets WHERE kind = ?1 AND status = ?2;",
                params![kind, status],
                |row| row.get(0),
            )?,
            None => self.conn.query_row(
                "SELECT COUNT(*) FROM assets WHERE kind = ?1;",
                params![kind],
                |row| row.get(0),
            )?,
        };
        Ok(count)
    }

    pub fn counts(&self) -> CollectResult<AssetCounts> {
        Ok(AssetCounts {
            forms: self.count(AssetKind::Form, None)?,
            instances_incomplete: self
                .count(AssetKind::Instance, Some(AssetStatus::Incomplete))?,
            instances_complete: self.count(AssetKind::Instance, Some(AssetStatus::Complete))?,
            instances_total: self.count(AssetKind::Instance, None)?,
        })
    }

    /// Move an instance forward through its lifecycle. Forms never leave
    /// `Available` and instances never move backwards.
    pub fn advance_status(&self, id: i64, next: AssetStatus) -> CollectResult<AssetRecord> {
        let record = self
            .get(id)?
            .ok_or_else(|| CollectError::NotFound(format!("asset id {id}")))?;
        let allowed = match record.kind {
            AssetKind::Form => next == AssetStatus::Available,
            AssetKind::Instance => record.status.can_advance_to(next),
        };
        if !allowed {
            return Err(CollectError::InvalidTransition {
                id,
                from: record.status,
                to: next,
            });
        }
        self.conn.execute(
            "UPDATE assets SET status = ?1, meta_text = ?2, updated_at = CURRENT_TIMESTAMP \
             WHERE id = ?3;",
            params![next, meta_text_for(record.kind, next), id],
        )?;
        self.get(id)?
            .ok_or_else(|| CollectError::NotFound(format!("asset id {id}")))
    }

    pub fn update_hash(&self, id: i64, content_hash: &str) -> CollectResult<bool> {
        let changed = self.conn.execute(
            "UPDATE assets SET content_hash = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2;",
            params![content_hash, id],
        )?;
        Ok(changed > 0)
    }

    pub fn delete(&self, id: i64) -> CollectResult<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM assets WHERE id = ?1;", params![id])?;
        Ok(deleted > 0)
    }

    pub fn delete_by_path(&self, path: &Path) -> CollectResult<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM assets WHERE path = ?1;",
            params![path_text(path)],
        )?;
        Ok(deleted > 0)
    }
}

// ---------------------------------------------------------------------------
// AssetRegistry
// ---------------------------------------------------------------------------

/// Persistent store of form and instance records.
pub struct AssetRegistry {
    db_path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl AssetRegistry {
    /// Open (creating if needed) the registry at `db_path`. The path is
    /// expanded and parent directories are created if they do not exist.
    pub fn open(db_path: impl AsRef<Path>) -> CollectResult<Self> {
        let resolved = resolve_path(db_path.as_ref())?;
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&resolved)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::init_schema(&conn)?;
        debug!("opened asset registry at {}", resolved.display());
        Ok(Self {
            db_path: Some(resolved),
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> CollectResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            db_path: None,
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> CollectResult<()> {
        schema::init_schema(conn)
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Run `f` as one transaction against the registry. The lock is held for
    /// the whole closure; an `Err` rolls every statement back.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&RegistryTx<'_>) -> CollectResult<T>,
    ) -> CollectResult<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&RegistryTx { conn: &tx })?;
        tx.commit()?;
        Ok(out)
    }

    /// Like [`transaction`](Self::transaction), then run `after` on the
    /// committed result before the lock is released. Other registry users
    /// see either neither step or both.
    pub fn transaction_then<T, U>(
        &self,
        f: impl FnOnce(&RegistryTx<'_>) -> CollectResult<T>,
        after: impl FnOnce(T) -> U,
    ) -> CollectResult<U> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&RegistryTx { conn: &tx })?;
        tx.commit()?;
        Ok(after(out))
    }

    fn read<T>(&self, f: impl FnOnce(&RegistryTx<'_>) -> CollectResult<T>) -> CollectResult<T> {
        let conn = self.conn.lock();
        f(&RegistryTx { conn: &conn })
    }

    pub fn insert(&self, asset: &NewAsset) -> CollectResult<AssetRecord> {
        self.transaction(|tx| tx.insert(asset))
    }

    pub fn upsert_form(&self, path: &Path, content_hash: &str) -> CollectResult<bool> {
        self.transaction(|tx| tx.upsert_form(path, content_hash))
    }

    pub fn get(&self, id: i64) -> CollectResult<Option<AssetRecord>> {
        self.read(|tx| tx.get(id))
    }

    pub fn find_by_path(&self, path: &Path) -> CollectResult<Option<AssetRecord>> {
        self.read(|tx| tx.find_by_path(path))
    }

    pub fn list_all(&self) -> CollectResult<Snapshot> {
        self.read(|tx| tx.list_all())
    }

    pub fn list(&self, kind: AssetKind, status: Option<AssetStatus>) -> CollectResult<Snapshot> {
        self.read(|tx| tx.list(kind, status))
    }

    pub fn count(&self, kind: AssetKind, status: Option<AssetStatus>) -> CollectResult<i64> {
        self.read(|tx| tx.count(kind, status))
    }

    pub fn counts(&self) -> CollectResult<AssetCounts> {
        self.read(|tx| tx.counts())
    }

    pub fn advance_status(&self, id: i64, next: AssetStatus) -> CollectResult<AssetRecord> {
        self.transaction(|tx| tx.advance_status(id, next))
    }

    pub fn update_hash(&self, id: i64, content_hash: &str) -> CollectResult<bool> {
        self.transaction(|tx| tx.update_hash(id, content_hash))
    }

    pub fn delete(&self, id: i64) -> CollectResult<bool> {
        self.transaction(|tx| tx.delete(id))
    }

    pub fn delete_by_path(&self, path: &Path) -> CollectResult<bool> {
        self.transaction(|tx| tx.delete_by_path(path))
    }
}
