//! Embedded key-value database.
//!
//! One SQLite file with a single `kv` table plays the role of a single
//! bucket: BLOB keys, BLOB values, byte-ordered prefix scans. Every
//! public operation is one transaction; the write is durable when the
//! call returns.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use super::StoreError;

/// Key under which the bound device id is stored.
pub const SYSTEM_NAME_KEY: &[u8] = b"@SYSTEM/NAME";

const BUSY_TIMEOUT_MS: u64 = 5_000;

pub struct Database {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl Database {
    /// Open (creating if needed) the database file.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
        // journal_mode answers with the resulting mode, so it cannot go
        // through pragma_update.
        conn.query_row("PRAGMA journal_mode = TRUNCATE", [], |_row| Ok(()))?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (key BLOB PRIMARY KEY, value BLOB NOT NULL)",
            [],
        )?;
        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(Some(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.conn.lock().expect("kv connection lock poisoned");
        match guard.as_mut() {
            Some(conn) => f(conn),
            None => Err(StoreError::Closed),
        }
    }

    /// The bound device name, if any.
    pub fn name(&self) -> Result<Option<String>, StoreError> {
        match self.get(SYSTEM_NAME_KEY) {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(StoreError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn set_name(&self, name: &str) -> Result<(), StoreError> {
        self.put(SYSTEM_NAME_KEY, name.as_bytes())
    }

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?
            .ok_or(StoreError::NotFound)
        })
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.apply(&[], &[], &[(key.to_vec(), value.to_vec())])
    }

    pub fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.apply(&[], &[key.to_vec()], &[])
    }

    /// Delete every key under the given prefixes, delete the given keys
    /// and write the given entries — all in one transaction.
    pub fn apply(
        &self,
        delete_prefixes: &[Vec<u8>],
        delete_keys: &[Vec<u8>],
        entries: &[(Vec<u8>, Vec<u8>)],
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            for prefix in delete_prefixes {
                match prefix_upper_bound(prefix) {
                    Some(upper) => {
                        tx.execute(
                            "DELETE FROM kv WHERE key >= ?1 AND key < ?2",
                            params![prefix, upper],
                        )?;
                    }
                    None => {
                        tx.execute("DELETE FROM kv WHERE key >= ?1", params![prefix])?;
                    }
                }
            }
            for key in delete_keys {
                tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            }
            for (key, value) in entries {
                tx.execute(
                    "INSERT INTO kv (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![key, value],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// All key-value pairs whose key starts with `prefix`, key-ordered.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.with_conn(|conn| {
            let (sql, upper) = match prefix_upper_bound(prefix) {
                Some(upper) => (
                    "SELECT key, value FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key",
                    Some(upper),
                ),
                None => ("SELECT key, value FROM kv WHERE key >= ?1 ORDER BY key", None),
            };
            let mut stmt = conn.prepare(sql)?;
            let mut raw_rows = match &upper {
                Some(upper) => stmt.query(params![prefix, upper])?,
                None => stmt.query(params![prefix])?,
            };
            let mut rows = Vec::new();
            while let Some(row) = raw_rows.next()? {
                let key: Vec<u8> = row.get(0)?;
                if key.starts_with(prefix) {
                    rows.push((key, row.get::<_, Vec<u8>>(1)?));
                }
            }
            Ok(rows)
        })
    }

    /// Close the database; subsequent calls fail with [`StoreError::Closed`].
    pub fn close(&self) -> Result<(), StoreError> {
        let mut guard = self.conn.lock().expect("kv connection lock poisoned");
        match guard.take() {
            Some(conn) => conn.close().map_err(|(_conn, err)| StoreError::Sqlite(err)),
            None => Err(StoreError::Closed),
        }
    }
}

/// Smallest byte string greater than every key with this prefix.
fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(&last) = upper.last() {
        if last < 0xff {
            *upper.last_mut().expect("non-empty") = last + 1;
            return Some(upper);
        }
        upper.pop();
    }
    None
}
