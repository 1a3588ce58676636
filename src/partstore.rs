//! Persistence layer: a single SQLite database file storing file metadata
//! and fixed-size data parts.
//!
//! Two tables back every [`crate::filestore::Filestore`]:
//!
//! - `files(zone_id, name, size, created_ts, mod_ts, opts, meta)`, primary
//!   key `(zone_id, name)`.
//! - `file_data(zone_id, name, part_idx, data)`, primary key
//!   `(zone_id, name, part_idx)`.
//!
//! The store holds a single [`rusqlite::Connection`] behind one mutex
//! (`max-open=1`); every public operation here runs inside its own
//! transaction. Concurrency is extracted entirely at the cache layer in
//! [`crate::filestore`] — this module never needs to reason about competing
//! writers.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::{FilestoreError, FilestoreResult};

/// Per-file options. See `SPEC_FULL.md` §3 for the invariants enforced on
/// construction by [`crate::filestore::Filestore::make_file`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FileOpts {
    pub max_size: u64,
    pub circular: bool,
    pub ijson: bool,
    pub ijson_budget: u64,
}

/// File metadata row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileMeta {
    pub zone_id: String,
    pub name: String,
    pub created_ts: i64,
    pub mod_ts: i64,
    pub size: u64,
    pub opts: FileOpts,
    pub meta: Json,
}

/// A fixed-size chunk of a file's contents, addressed by index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPart {
    pub part_idx: u64,
    pub data: Vec<u8>,
}

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS files (
        zone_id    TEXT NOT NULL,
        name       TEXT NOT NULL,
        size       INTEGER NOT NULL,
        created_ts INTEGER NOT NULL,
        mod_ts     INTEGER NOT NULL,
        opts       TEXT NOT NULL,
        meta       TEXT NOT NULL,
        PRIMARY KEY (zone_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS file_data (
        zone_id  TEXT NOT NULL,
        name     TEXT NOT NULL,
        part_idx INTEGER NOT NULL,
        data     BLOB NOT NULL,
        PRIMARY KEY (zone_id, name, part_idx)
    )
    "#,
];

/// The transactional SQLite-backed store behind a [`crate::filestore::Filestore`].
pub struct PartStore {
    conn: Mutex<Connection>,
}

impl PartStore {
    /// Open (creating if necessary) the database file at `path`, apply
    /// migrations, and return a ready store.
    pub fn open(path: &Path) -> FilestoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                FilestoreError::InvalidArgument(format!("cannot create {:?}: {}", parent, e))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::migrate(&conn)?;
        Ok(PartStore { conn: Mutex::new(conn) })
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> FilestoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::migrate(&conn)?;
        Ok(PartStore { conn: Mutex::new(conn) })
    }

    fn migrate(conn: &Connection) -> FilestoreResult<()> {
        for stmt in MIGRATIONS {
            conn.execute(stmt, [])?;
        }
        Ok(())
    }

    pub fn insert_file(&self, file: &FileMeta) -> FilestoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM files WHERE zone_id = ?1 AND name = ?2",
                params![file.zone_id, file.name],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(FilestoreError::already_exists(&file.zone_id, &file.name));
        }
        conn.execute(
            "INSERT INTO files (zone_id, name, size, created_ts, mod_ts, opts, meta)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                file.zone_id,
                file.name,
                file.size as i64,
                file.created_ts,
                file.mod_ts,
                serde_json::to_string(&file.opts).unwrap(),
                file.meta.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn delete_file(&self, zone_id: &str, name: &str) -> FilestoreResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM file_data WHERE zone_id = ?1 AND name = ?2",
            params![zone_id, name],
        )?;
        tx.execute("DELETE FROM files WHERE zone_id = ?1 AND name = ?2", params![zone_id, name])?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_file(&self, zone_id: &str, name: &str) -> FilestoreResult<Option<FileMeta>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT size, created_ts, mod_ts, opts, meta FROM files
                 WHERE zone_id = ?1 AND name = ?2",
                params![zone_id, name],
                |row| row_to_file(zone_id, name, row),
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_zone_files(&self, zone_id: &str) -> FilestoreResult<Vec<FileMeta>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT name, size, created_ts, mod_ts, opts, meta FROM files WHERE zone_id = ?1",
        )?;
        let rows = stmt.query_map(params![zone_id], |row| {
            let name: String = row.get(0)?;
            row_to_file_full(zone_id, &name, row, 1)
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn get_zone_file_names(&self, zone_id: &str) -> FilestoreResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT name FROM files WHERE zone_id = ?1")?;
        let rows = stmt.query_map(params![zone_id], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn get_all_zone_ids(&self) -> FilestoreResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT DISTINCT zone_id FROM files")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn get_file_parts(
        &self,
        zone_id: &str,
        name: &str,
        part_idxs: &[u64],
    ) -> FilestoreResult<std::collections::HashMap<u64, DataPart>> {
        let conn = self.conn.lock().unwrap();
        let mut out = std::collections::HashMap::new();
        let mut stmt = conn.prepare(
            "SELECT data FROM file_data WHERE zone_id = ?1 AND name = ?2 AND part_idx = ?3",
        )?;
        for &idx in part_idxs {
            let data: Option<Vec<u8>> = stmt
                .query_row(params![zone_id, name, idx as i64], |row| row.get(0))
                .optional()?;
            if let Some(data) = data {
                out.insert(idx, DataPart { part_idx: idx, data });
            }
        }
        Ok(out)
    }

    /// Flush a cache entry to disk: update the file row (size/mod_ts/meta,
    /// never created_ts or opts), optionally wipe all parts first, then
    /// upsert the supplied parts. Fails `NotExist` if the row is already
    /// gone (a concurrent `delete_file` raced ahead of this flush).
    pub fn write_cache_entry(
        &self,
        zone_id: &str,
        name: &str,
        size: u64,
        mod_ts: i64,
        meta: &Json,
        data_entries: &[DataPart],
        replace: bool,
    ) -> FilestoreResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let updated = tx.execute(
            "UPDATE files SET size = ?1, mod_ts = ?2, meta = ?3 WHERE zone_id = ?4 AND name = ?5",
            params![size as i64, mod_ts, meta.to_string(), zone_id, name],
        )?;
        if updated == 0 {
            return Err(FilestoreError::not_exist(zone_id, name));
        }

        if replace {
            tx.execute(
                "DELETE FROM file_data WHERE zone_id = ?1 AND name = ?2",
                params![zone_id, name],
            )?;
        }

        for part in data_entries {
            tx.execute(
                "INSERT INTO file_data (zone_id, name, part_idx, data)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(zone_id, name, part_idx) DO UPDATE SET data = excluded.data",
                params![zone_id, name, part.part_idx as i64, part.data],
            )?;
        }

        tx.commit()?;
        Ok(())
    }
}

fn row_to_file(
    zone_id: &str,
    name: &str,
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<FileMeta> {
    row_to_file_full(zone_id, name, row, 0)
}

fn row_to_file_full(
    zone_id: &str,
    name: &str,
    row: &rusqlite::Row<'_>,
    off: usize,
) -> rusqlite::Result<FileMeta> {
    let size: i64 = row.get(off)?;
    let created_ts: i64 = row.get(off + 1)?;
    let mod_ts: i64 = row.get(off + 2)?;
    let opts_json: String = row.get(off + 3)?;
    let meta_json: String = row.get(off + 4)?;
    let opts: FileOpts = serde_json::from_str(&opts_json).unwrap_or_default();
    let meta: Json = serde_json::from_str(&meta_json).unwrap_or(Json::Object(Default::default()));
    Ok(FileMeta {
        zone_id: zone_id.to_string(),
        name: name.to_string(),
        created_ts,
        mod_ts,
        size: size as u64,
        opts,
        meta,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(zone: &str, name: &str) -> FileMeta {
        FileMeta {
            zone_id: zone.to_string(),
            name: name.to_string(),
            created_ts: 1,
            mod_ts: 1,
            size: 0,
            opts: FileOpts::default(),
            meta: json!({}),
        }
    }

    #[test]
    fn insert_then_get() {
        let store = PartStore::open_in_memory().unwrap();
        store.insert_file(&sample("z1", "t1")).unwrap();
        let got = store.get_file("z1", "t1").unwrap().unwrap();
        assert_eq!(got.name, "t1");
        assert_eq!(got.size, 0);
    }

    #[test]
    fn insert_duplicate_fails() {
        let store = PartStore::open_in_memory().unwrap();
        store.insert_file(&sample("z1", "t1")).unwrap();
        let err = store.insert_file(&sample("z1", "t1")).unwrap_err();
        assert!(matches!(err, FilestoreError::AlreadyExists { .. }));
    }

    #[test]
    fn delete_removes_parts() {
        let store = PartStore::open_in_memory().unwrap();
        store.insert_file(&sample("z1", "t1")).unwrap();
        store
            .write_cache_entry(
                "z1",
                "t1",
                4,
                2,
                &json!({}),
                &[DataPart { part_idx: 0, data: vec![1, 2, 3, 4] }],
                false,
            )
            .unwrap();
        store.delete_file("z1", "t1").unwrap();
        assert!(store.get_file("z1", "t1").unwrap().is_none());
        let parts = store.get_file_parts("z1", "t1", &[0]).unwrap();
        assert!(parts.is_empty());
    }

    #[test]
    fn write_cache_entry_missing_file_is_not_exist() {
        let store = PartStore::open_in_memory().unwrap();
        let err = store
            .write_cache_entry("z1", "ghost", 0, 0, &json!({}), &[], false)
            .unwrap_err();
        assert!(err.is_not_exist());
    }

    #[test]
    fn replace_wipes_old_parts() {
        let store = PartStore::open_in_memory().unwrap();
        store.insert_file(&sample("z1", "t1")).unwrap();
        store
            .write_cache_entry(
                "z1",
                "t1",
                8,
                1,
                &json!({}),
                &[
                    DataPart { part_idx: 0, data: vec![1; 4] },
                    DataPart { part_idx: 1, data: vec![2; 4] },
                ],
                false,
            )
            .unwrap();
        store
            .write_cache_entry(
                "z1",
                "t1",
                2,
                2,
                &json!({}),
                &[DataPart { part_idx: 0, data: vec![9, 9] }],
                true,
            )
            .unwrap();
        let parts = store.get_file_parts("z1", "t1", &[0, 1]).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[&0].data, vec![9, 9]);
    }
}
