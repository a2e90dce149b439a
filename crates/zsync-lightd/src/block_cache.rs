//! Compact block cache: an append-only store of downloaded blocks awaiting scanning.

use crate::model::{BlockHeight, CompactBlockRange};
use crate::proto_types as proto;
use crate::{Error, Result};
use directories::ProjectDirs;
use prost::Message;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use zsync_storage_sqlite::with_busy_retry;

/// File name of the cache database inside the cache root
pub const CACHE_DB_NAME: &str = "compactblocks.sqlite";

/// Chain cache operations the sync loop depends on
pub trait ChainCache: Send + Sync {
    /// Create the backing store if it does not exist
    fn create(&self) -> Result<()>;

    /// Append blocks; the whole batch is stored or none of it is
    fn write(&self, blocks: &[proto::CompactBlock]) -> Result<()>;

    /// Highest cached height (0 when empty)
    fn latest_height(&self) -> Result<BlockHeight>;

    /// Delete every block above `height`
    fn rewind(&self, height: BlockHeight) -> Result<()>;

    /// Delete every block
    fn clear(&self) -> Result<()>;

    /// Delete every block at or below `height`
    fn clear_up_to(&self, height: BlockHeight) -> Result<()>;

    /// Load cached blocks in `range`, in height order
    fn load_range(&self, range: CompactBlockRange) -> Result<Vec<proto::CompactBlock>>;

    /// Directory holding the cache
    fn root(&self) -> &Path;
}

/// SQLite-backed chain cache
pub struct SqliteChainCache {
    root: PathBuf,
    path: PathBuf,
}

impl SqliteChainCache {
    /// Cache rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let path = root.join(CACHE_DB_NAME);
        Self { root, path }
    }

    /// Cache in the default per-user location for `alias`
    pub fn for_alias(alias: &str) -> Self {
        Self::new(default_cache_root(alias))
    }

    /// Path of the database file
    pub fn db_path(&self) -> &Path {
        &self.path
    }

    fn open_conn(&self) -> Result<Connection> {
        Connection::open(&self.path).map_err(|e| Error::Storage(e.to_string()))
    }
}

impl ChainCache for SqliteChainCache {
    fn create(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        let conn = self.open_conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS compactblocks (
                height INTEGER PRIMARY KEY,
                hash BLOB NOT NULL,
                prev_hash BLOB NOT NULL,
                time INTEGER NOT NULL,
                sapling_outputs_count INTEGER NOT NULL,
                orchard_actions_count INTEGER NOT NULL,
                data BLOB NOT NULL
             );",
        )?;
        Ok(())
    }

    fn write(&self, blocks: &[proto::CompactBlock]) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }

        let mut conn = self.open_conn()?;
        with_busy_retry(|| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR REPLACE INTO compactblocks
                        (height, hash, prev_hash, time, sapling_outputs_count, orchard_actions_count, data)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;

                for block in blocks {
                    stmt.execute(params![
                        block.height as i64,
                        block.hash,
                        block.prev_hash,
                        block.time,
                        block.sapling_outputs_count(),
                        block.orchard_actions_count(),
                        block.encode_to_vec(),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })?;
        Ok(())
    }

    fn latest_height(&self) -> Result<BlockHeight> {
        if !self.path.exists() {
            return Ok(0);
        }
        let conn = self.open_conn()?;
        let height: Option<i64> = with_busy_retry(|| {
            Ok(conn
                .query_row("SELECT MAX(height) FROM compactblocks", [], |row| row.get(0))
                .optional()?
                .flatten())
        })?;
        Ok(height.map(|h| h.max(0) as u64).unwrap_or(0))
    }

    fn rewind(&self, height: BlockHeight) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let conn = self.open_conn()?;
        with_busy_retry(|| {
            conn.execute("DELETE FROM compactblocks WHERE height > ?1", [height as i64])?;
            Ok(())
        })?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let conn = self.open_conn()?;
        with_busy_retry(|| {
            conn.execute("DELETE FROM compactblocks", [])?;
            Ok(())
        })?;
        Ok(())
    }

    fn clear_up_to(&self, height: BlockHeight) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let conn = self.open_conn()?;
        with_busy_retry(|| {
            conn.execute("DELETE FROM compactblocks WHERE height <= ?1", [height as i64])?;
            Ok(())
        })?;
        Ok(())
    }

    fn load_range(&self, range: CompactBlockRange) -> Result<Vec<proto::CompactBlock>> {
        if range.is_empty() || !self.path.exists() {
            return Ok(Vec::new());
        }

        let conn = self.open_conn()?;
        let mut stmt = conn.prepare(
            "SELECT data FROM compactblocks WHERE height BETWEEN ?1 AND ?2 ORDER BY height ASC",
        )?;
        let rows = stmt.query_map(
            params![*range.start() as i64, *range.end() as i64],
            |row| row.get::<_, Vec<u8>>(0),
        )?;

        let mut blocks = Vec::new();
        for row in rows {
            let data = row?;
            let block = proto::CompactBlock::decode(&data[..])
                .map_err(|e| Error::Storage(format!("corrupt cached block: {}", e)))?;
            blocks.push(block);
        }
        Ok(blocks)
    }

    fn root(&self) -> &Path {
        &self.root
    }
}

/// Base directory for caches, overridable with `ZSYNC_CACHE_DIR`
pub fn cache_base_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("ZSYNC_CACHE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }

    ProjectDirs::from("cash", "zsync", "zsync")
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Default cache root for `alias`
pub fn default_cache_root(alias: &str) -> PathBuf {
    cache_base_dir().join(format!("fs_cache_{}", alias))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn block(height: u64) -> proto::CompactBlock {
        proto::CompactBlock {
            proto_version: 1,
            height,
            hash: height.to_le_bytes().to_vec(),
            prev_hash: height.saturating_sub(1).to_le_bytes().to_vec(),
            time: 1_600_000_000 + height as u32,
            ..Default::default()
        }
    }

    fn cache() -> (TempDir, SqliteChainCache) {
        let dir = TempDir::new().unwrap();
        let cache = SqliteChainCache::new(dir.path().join("cache"));
        cache.create().unwrap();
        (dir, cache)
    }

    #[test]
    fn test_empty_cache() {
        let dir = TempDir::new().unwrap();
        let cache = SqliteChainCache::new(dir.path().join("missing"));
        assert_eq!(cache.latest_height().unwrap(), 0);
        assert!(cache.load_range(1..=10).unwrap().is_empty());
        cache.clear().unwrap();
    }

    #[test]
    fn test_write_and_load() {
        let (_dir, cache) = cache();
        let blocks: Vec<_> = (100..110).map(block).collect();
        cache.write(&blocks).unwrap();

        assert_eq!(cache.latest_height().unwrap(), 109);
        let loaded = cache.load_range(102..=104).unwrap();
        assert_eq!(loaded.iter().map(|b| b.height).collect::<Vec<_>>(), vec![102, 103, 104]);
        assert_eq!(loaded[0], blocks[2]);
    }

    #[test]
    fn test_rewind_and_clear_up_to() {
        let (_dir, cache) = cache();
        cache.write(&(100..120).map(block).collect::<Vec<_>>()).unwrap();

        cache.rewind(115).unwrap();
        assert_eq!(cache.latest_height().unwrap(), 115);

        cache.clear_up_to(110).unwrap();
        let remaining = cache.load_range(0..=200).unwrap();
        assert_eq!(remaining.first().map(|b| b.height), Some(111));
        assert_eq!(remaining.len(), 5);

        cache.clear().unwrap();
        assert_eq!(cache.latest_height().unwrap(), 0);
    }
}
