//! Duplicate-key B-tree index backed by redb.
//!
//! One multimap table maps each key to its packed 16-byte entries. redb keeps
//! the values of a key in byte order, which for the packing used here is
//! weight order, so reads never sort.

use std::fmt::Display;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use redb::{Database, MultimapTableDefinition, ReadableMultimapTable, TableError};

use crate::error::{IndexError, IndexResult};
use crate::segment::Pointer;

use super::{
    BackendKind, ENTRY_SIZE, IndexEntry, IndexManifest, IndexWriter, PrefixIndex, key_matches_prefix,
};

/// Key → packed `(sort_weight, segment, offset)` values.
const INDEX_TABLE: MultimapTableDefinition<&str, &[u8]> = MultimapTableDefinition::new("index");
const DB_FILE: &str = "index.redb";

fn redb_err<E: Display>(context: &'static str) -> impl FnOnce(E) -> IndexError {
    move |e| IndexError::Backend {
        message: format!("{context} failed: {e}"),
    }
}

/// Read side of a redb index. Every scan runs in its own MVCC snapshot.
pub struct DurableIndex {
    db: Database,
    path: PathBuf,
}

impl DurableIndex {
    pub fn open(dir: &Path) -> IndexResult<Self> {
        let path = dir.join(DB_FILE);
        if !path.exists() {
            return Err(IndexError::IndexUnavailable {
                path: path.display().to_string(),
                reason: "no index database".into(),
            });
        }
        let db = Database::open(&path).map_err(|e| IndexError::IndexUnavailable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { db, path })
    }

    fn corrupt(&self, key: &str, len: usize) -> IndexError {
        IndexError::CorruptIndex {
            path: self.path.display().to_string(),
            message: format!("value under {key:?} is {len} bytes, expected {ENTRY_SIZE}"),
        }
    }
}

impl PrefixIndex for DurableIndex {
    fn scan_exact(
        &self,
        key: &str,
        visit: &mut dyn FnMut(IndexEntry) -> ControlFlow<()>,
    ) -> IndexResult<()> {
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        let table = match txn.open_multimap_table(INDEX_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(e) => return Err(redb_err("open_multimap_table")(e)),
        };
        for value in table.get(key).map_err(redb_err("get"))? {
            let value = value.map_err(redb_err("read value"))?;
            let bytes = value.value();
            let entry = IndexEntry::unpack(bytes).ok_or_else(|| self.corrupt(key, bytes.len()))?;
            if visit(entry).is_break() {
                break;
            }
        }
        Ok(())
    }

    fn scan_prefix(
        &self,
        prefix: &str,
        visit: &mut dyn FnMut(&str, IndexEntry) -> ControlFlow<()>,
    ) -> IndexResult<()> {
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        let table = match txn.open_multimap_table(INDEX_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(e) => return Err(redb_err("open_multimap_table")(e)),
        };
        for item in table.range::<&str>(prefix..).map_err(redb_err("range"))? {
            let (key, values) = item.map_err(redb_err("range step"))?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            if !key_matches_prefix(key, prefix) {
                continue;
            }
            for value in values {
                let value = value.map_err(redb_err("read value"))?;
                let bytes = value.value();
                let entry =
                    IndexEntry::unpack(bytes).ok_or_else(|| self.corrupt(key, bytes.len()))?;
                if visit(key, entry).is_break() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Redb
    }
}

impl std::fmt::Debug for DurableIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableIndex").field("path", &self.path).finish()
    }
}

/// Buffers inserts and commits them in one write transaction per batch.
pub struct DurableIndexWriter {
    db: Database,
    dir: PathBuf,
    pending: Vec<(String, [u8; ENTRY_SIZE])>,
    batch_size: usize,
    entries: u64,
}

impl DurableIndexWriter {
    /// Create a fresh database in `dir`, replacing any previous one.
    pub fn create(dir: &Path, batch_size: usize) -> IndexResult<Self> {
        std::fs::create_dir_all(dir).map_err(|e| IndexError::Io { source: e })?;
        let path = dir.join(DB_FILE);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| IndexError::Io { source: e })?;
        }
        let db = Database::create(&path).map_err(|e| IndexError::Backend {
            message: format!("failed to create redb at {}: {e}", path.display()),
        })?;
        Ok(Self {
            db,
            dir: dir.to_path_buf(),
            pending: Vec::new(),
            batch_size: batch_size.max(1),
            entries: 0,
        })
    }

    fn flush(&mut self) -> IndexResult<()> {
        let txn = self.db.begin_write().map_err(redb_err("begin_write"))?;
        {
            let mut table = txn
                .open_multimap_table(INDEX_TABLE)
                .map_err(redb_err("open_multimap_table"))?;
            for (key, value) in &self.pending {
                table
                    .insert(key.as_str(), &value[..])
                    .map_err(redb_err("insert"))?;
            }
        }
        txn.commit().map_err(redb_err("commit"))?;
        if !self.pending.is_empty() {
            tracing::debug!(entries = self.pending.len(), total = self.entries, "committed index batch");
        }
        self.pending.clear();
        Ok(())
    }

    fn count_keys(&self) -> IndexResult<u64> {
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        let table = txn
            .open_multimap_table(INDEX_TABLE)
            .map_err(redb_err("open_multimap_table"))?;
        let mut keys = 0u64;
        for item in table.iter().map_err(redb_err("iter"))? {
            item.map_err(redb_err("iter step"))?;
            keys += 1;
        }
        Ok(keys)
    }
}

impl IndexWriter for DurableIndexWriter {
    fn insert(&mut self, key: &str, sort_weight: f32, pointer: Pointer) -> IndexResult<()> {
        self.pending
            .push((key.to_string(), IndexEntry::new(sort_weight, pointer).pack()));
        self.entries += 1;
        if self.pending.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    fn finish(mut self: Box<Self>, segment_base: &str, edges: u64) -> IndexResult<IndexManifest> {
        self.flush()?;
        let manifest = IndexManifest {
            backend: BackendKind::Redb,
            segment_base: segment_base.to_string(),
            edges,
            keys: self.count_keys()?,
            entries: self.entries,
        };
        manifest.save(&self.dir)?;
        tracing::info!(keys = manifest.keys, entries = manifest.entries, "finished redb index");
        Ok(manifest)
    }
}

impl std::fmt::Debug for DurableIndexWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableIndexWriter")
            .field("dir", &self.dir)
            .field("pending", &self.pending.len())
            .finish()
    }
}
