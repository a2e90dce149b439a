//! Persisted key-value sync progress markers
//!
//! Every operation retries on SQLITE_BUSY. Missing integers read as 0 and
//! missing booleans read as `false`.

use crate::{with_busy_retry, Database, Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension};
use std::path::Path;

/// A stored marker row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEntry {
    /// Marker key
    pub key: String,
    /// Integer value, if set
    pub int_value: Option<u64>,
    /// Boolean value, if set
    pub bool_value: Option<bool>,
    /// Last update (unix seconds)
    pub updated_at: i64,
}

/// Key-value progress store backed by SQLite
pub struct ProgressStore {
    db: Mutex<Database>,
}

impl ProgressStore {
    /// Open the store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            db: Mutex::new(Database::open(path)?),
        })
    }

    /// Open an in-memory store
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            db: Mutex::new(Database::open_in_memory()?),
        })
    }

    /// Read an integer marker (0 when missing)
    pub fn integer(&self, key: &str) -> Result<u64> {
        let db = self.db.lock();
        let value: Option<Option<i64>> = with_busy_retry(|| {
            Ok(db
                .conn()
                .query_row(
                    "SELECT int_value FROM sync_progress WHERE key = ?1",
                    [key],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        Ok(value.flatten().map(|v| v.max(0) as u64).unwrap_or(0))
    }

    /// Write an integer marker
    pub fn set_integer(&self, key: &str, value: u64) -> Result<()> {
        let stored = i64::try_from(value)
            .map_err(|_| Error::Validation(format!("value {} out of range for {}", value, key)))?;
        let db = self.db.lock();
        let now = chrono::Utc::now().timestamp();
        with_busy_retry(|| {
            db.conn().execute(
                r#"
                INSERT INTO sync_progress (key, int_value, updated_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET int_value = excluded.int_value, updated_at = excluded.updated_at
                "#,
                params![key, stored, now],
            )?;
            Ok(())
        })
    }

    /// Read a boolean marker (`false` when missing)
    pub fn bool(&self, key: &str) -> Result<bool> {
        let db = self.db.lock();
        let value: Option<Option<bool>> = with_busy_retry(|| {
            Ok(db
                .conn()
                .query_row(
                    "SELECT bool_value FROM sync_progress WHERE key = ?1",
                    [key],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        Ok(value.flatten().unwrap_or(false))
    }

    /// Write a boolean marker
    pub fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        let db = self.db.lock();
        let now = chrono::Utc::now().timestamp();
        with_busy_retry(|| {
            db.conn().execute(
                r#"
                INSERT INTO sync_progress (key, bool_value, updated_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET bool_value = excluded.bool_value, updated_at = excluded.updated_at
                "#,
                params![key, value, now],
            )?;
            Ok(())
        })
    }

    /// Lower every listed integer marker to `min(current, height)` in one transaction
    pub fn rewind_integers(&self, keys: &[String], height: u64) -> Result<()> {
        let stored = i64::try_from(height)
            .map_err(|_| Error::Validation(format!("height {} out of range", height)))?;
        let mut db = self.db.lock();
        let now = chrono::Utc::now().timestamp();
        with_busy_retry(|| {
            let tx = db.transaction()?;
            for key in keys {
                tx.execute(
                    "UPDATE sync_progress SET int_value = ?2, updated_at = ?3 WHERE key = ?1 AND int_value > ?2",
                    params![key, stored, now],
                )?;
            }
            tx.commit()?;
            Ok(())
        })?;
        tracing::debug!("Rewound {} progress markers to {}", keys.len(), height);
        Ok(())
    }

    /// Remove a marker
    pub fn remove(&self, key: &str) -> Result<()> {
        let db = self.db.lock();
        with_busy_retry(|| {
            db.conn()
                .execute("DELETE FROM sync_progress WHERE key = ?1", [key])?;
            Ok(())
        })
    }

    /// Load a full marker row
    pub fn entry(&self, key: &str) -> Result<ProgressEntry> {
        let db = self.db.lock();
        let entry = with_busy_retry(|| {
            Ok(db
                .conn()
                .query_row(
                    "SELECT key, int_value, bool_value, updated_at FROM sync_progress WHERE key = ?1",
                    [key],
                    |row| {
                        Ok(ProgressEntry {
                            key: row.get(0)?,
                            int_value: row.get::<_, Option<i64>>(1)?.map(|v| v.max(0) as u64),
                            bool_value: row.get(2)?,
                            updated_at: row.get(3)?,
                        })
                    },
                )
                .optional()?)
        })?;
        entry.ok_or_else(|| Error::NotFound(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_values_default() {
        let store = ProgressStore::in_memory().unwrap();
        assert_eq!(store.integer("latestDownloadedBlockHeight").unwrap(), 0);
        assert!(!store.bool("someFlag").unwrap());
        assert!(matches!(store.entry("nope"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_set_and_get() {
        let store = ProgressStore::in_memory().unwrap();
        store.set_integer("latestEnhancedHeight", 1_700_000).unwrap();
        store.set_bool("migrated", true).unwrap();

        assert_eq!(store.integer("latestEnhancedHeight").unwrap(), 1_700_000);
        assert!(store.bool("migrated").unwrap());

        store.set_integer("latestEnhancedHeight", 1_700_010).unwrap();
        assert_eq!(store.integer("latestEnhancedHeight").unwrap(), 1_700_010);
    }

    #[test]
    fn test_int_and_bool_share_key() {
        let store = ProgressStore::in_memory().unwrap();
        store.set_integer("k", 3).unwrap();
        store.set_bool("k", true).unwrap();

        let entry = store.entry("k").unwrap();
        assert_eq!(entry.int_value, Some(3));
        assert_eq!(entry.bool_value, Some(true));
    }

    #[test]
    fn test_rewind_only_lowers() {
        let store = ProgressStore::in_memory().unwrap();
        store.set_integer("a", 100).unwrap();
        store.set_integer("b", 20).unwrap();

        store
            .rewind_integers(&["a".to_string(), "b".to_string(), "c".to_string()], 50)
            .unwrap();

        assert_eq!(store.integer("a").unwrap(), 50);
        assert_eq!(store.integer("b").unwrap(), 20);
        assert_eq!(store.integer("c").unwrap(), 0);
    }

    #[test]
    fn test_remove() {
        let store = ProgressStore::in_memory().unwrap();
        store.set_integer("a", 1).unwrap();
        store.remove("a").unwrap();
        assert_eq!(store.integer("a").unwrap(), 0);
    }

    #[test]
    fn test_persists_on_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("progress.db");
        ProgressStore::open(&path)
            .unwrap()
            .set_integer("latestUTXOFetchedHeight", 42)
            .unwrap();

        let store = ProgressStore::open(&path).unwrap();
        assert_eq!(store.integer("latestUTXOFetchedHeight").unwrap(), 42);
    }

    proptest! {
        #[test]
        fn prop_rewind_is_min(current in 0u64..5_000_000, target in 0u64..5_000_000) {
            let store = ProgressStore::in_memory().unwrap();
            store.set_integer("k", current).unwrap();
            store.rewind_integers(&["k".to_string()], target).unwrap();
            prop_assert_eq!(store.integer("k").unwrap(), current.min(target));
        }
    }
}
