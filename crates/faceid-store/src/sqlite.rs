//! SQLite-backed encoding store.
//!
//! One row per identity. `load_all` returns rows in insertion order
//! (`rowid`), and re-enrollment updates the row in place so an identity keeps
//! its position.

use crate::seal::BlobSealer;
use chrono::{SecondsFormat, Utc};
use faceid_core::{EncodingStore, EnrollmentRecord, StoreError};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS enrollments (
    identity    TEXT PRIMARY KEY NOT NULL,
    encoding    BLOB NOT NULL,
    enrolled_at TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteStore {
    conn: Mutex<Connection>,
    sealer: Option<BlobSealer>,
}

/// Timestamps of one enrollment row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentInfo {
    pub identity: String,
    pub enrolled_at: String,
    pub updated_at: String,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(StoreError::backend)?;
            }
        }
        let conn = Connection::open(path).map_err(StoreError::backend)?;
        tracing::info!(path = %path.display(), "opened enrollment database");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(StoreError::backend)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT).map_err(StoreError::backend)?;
        conn.execute_batch(SCHEMA).map_err(StoreError::backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
            sealer: None,
        })
    }

    /// Seal blobs on write and open them on read.
    pub fn with_sealer(mut self, sealer: BlobSealer) -> Self {
        self.sealer = Some(sealer);
        self
    }

    pub fn is_sealed(&self) -> bool {
        self.sealer.is_some()
    }

    /// Enrollment timestamps in load order.
    pub fn list(&self) -> Result<Vec<EnrollmentInfo>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT identity, enrolled_at, updated_at FROM enrollments ORDER BY rowid")
            .map_err(StoreError::backend)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(EnrollmentInfo {
                    identity: row.get(0)?,
                    enrolled_at: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            })
            .map_err(StoreError::backend)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::backend)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EncodingStore for SqliteStore {
    fn put(&self, identity: &str, blob: &[u8]) -> Result<(), StoreError> {
        let stored = match &self.sealer {
            Some(sealer) => sealer.seal(blob).map_err(StoreError::backend)?,
            None => blob.to_vec(),
        };
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        self.conn()
            .execute(
                "INSERT INTO enrollments (identity, encoding, enrolled_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(identity) DO UPDATE SET
                     encoding = excluded.encoding,
                     updated_at = excluded.updated_at",
                params![identity, stored, now],
            )
            .map_err(StoreError::backend)?;
        tracing::debug!(identity, sealed = self.sealer.is_some(), "enrollment stored");
        Ok(())
    }

    fn contains(&self, identity: &str) -> Result<bool, StoreError> {
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM enrollments WHERE identity = ?1",
                params![identity],
                |_| Ok(()),
            )
            .optional()
            .map_err(StoreError::backend)?;
        Ok(found.is_some())
    }

    fn remove(&self, identity: &str) -> Result<bool, StoreError> {
        let changed = self
            .conn()
            .execute("DELETE FROM enrollments WHERE identity = ?1", params![identity])
            .map_err(StoreError::backend)?;
        Ok(changed > 0)
    }

    fn load_all(&self) -> Result<Vec<EnrollmentRecord>, StoreError> {
        let rows: Vec<(String, Vec<u8>)> = {
            let conn = self.conn();
            let mut stmt = conn
                .prepare("SELECT identity, encoding FROM enrollments ORDER BY rowid")
                .map_err(StoreError::backend)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(StoreError::backend)?;
            rows.collect::<Result<_, _>>().map_err(StoreError::backend)?
        };

        rows.into_iter()
            .map(|(identity, stored)| {
                let blob = match &self.sealer {
                    Some(sealer) => sealer.open(&stored).map_err(|err| StoreError::Corrupt {
                        identity: identity.clone(),
                        reason: err.to_string(),
                    })?,
                    None => stored,
                };
                Ok(EnrollmentRecord { identity, blob })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_contains_remove() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(!store.contains("alice").unwrap());
        store.put("alice", b"blob-a").unwrap();
        assert!(store.contains("alice").unwrap());
        assert!(store.remove("alice").unwrap());
        assert!(!store.remove("alice").unwrap());
        assert!(!store.contains("alice").unwrap());
    }

    #[test]
    fn test_reenrollment_keeps_row_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put("alice", b"1").unwrap();
        store.put("bob", b"2").unwrap();
        store.put("alice", b"3").unwrap();

        let all = store.load_all().unwrap();
        let ids: Vec<&str> = all.iter().map(|r| r.identity.as_str()).collect();
        assert_eq!(ids, ["alice", "bob"]);
        assert_eq!(all[0].blob, b"3");

        let info = store.list().unwrap();
        assert_eq!(info[0].identity, "alice");
        assert!(info[0].enrolled_at <= info[0].updated_at);
    }

    #[test]
    fn test_persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("faceid.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.put("alice", b"persisted").unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].blob, b"persisted");
    }

    #[test]
    fn test_sealed_rows_are_ciphertext() {
        let store = SqliteStore::open_in_memory()
            .unwrap()
            .with_sealer(BlobSealer::from_key_material(b"key"));
        store.put("alice", b"FEN1-plaintext").unwrap();

        let raw: Vec<u8> = store
            .conn()
            .query_row("SELECT encoding FROM enrollments WHERE identity = 'alice'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(&raw[..4], b"FSL1");
        assert!(!raw.windows(4).any(|w| w == b"FEN1"));

        assert_eq!(store.load_all().unwrap()[0].blob, b"FEN1-plaintext");
    }

    #[test]
    fn test_wrong_key_reports_corrupt_record() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("faceid.db");
        SqliteStore::open(&path)
            .unwrap()
            .with_sealer(BlobSealer::from_key_material(b"right"))
            .put("alice", b"data")
            .unwrap();

        let store = SqliteStore::open(&path)
            .unwrap()
            .with_sealer(BlobSealer::from_key_material(b"wrong"));
        match store.load_all() {
            Err(StoreError::Corrupt { identity, .. }) => assert_eq!(identity, "alice"),
            other => panic!("expected corrupt record, got {other:?}"),
        }
    }
}
