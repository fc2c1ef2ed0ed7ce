//! In-memory index backed by a `BTreeMap`.
//!
//! Doubles as reader and writer. Small stores can persist it as a bincode
//! snapshot and load it back whole.

use std::collections::BTreeMap;
use std::ops::{Bound, ControlFlow};
use std::path::{Path, PathBuf};

use crate::error::{IndexError, IndexResult};
use crate::segment::Pointer;

use super::{
    BackendKind, ENTRY_SIZE, IndexEntry, IndexManifest, IndexWriter, PrefixIndex, key_matches_prefix,
};

const SNAPSHOT_FILE: &str = "index.mem";

/// Sorted multimap of key → packed entries, each list kept in byte order.
#[derive(Debug, Default, Clone)]
pub struct MemIndex {
    map: BTreeMap<String, Vec<[u8; ENTRY_SIZE]>>,
    entries: u64,
    dir: Option<PathBuf>,
}

impl MemIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// An index that [`finish`](IndexWriter::finish) snapshots into `dir`.
    pub fn persistent(dir: &Path) -> Self {
        Self {
            dir: Some(dir.to_path_buf()),
            ..Self::default()
        }
    }

    /// Load a snapshot written by a persistent `MemIndex`.
    pub fn load(dir: &Path) -> IndexResult<Self> {
        let path = dir.join(SNAPSHOT_FILE);
        let bytes = std::fs::read(&path).map_err(|e| IndexError::IndexUnavailable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let map: BTreeMap<String, Vec<[u8; ENTRY_SIZE]>> =
            bincode::deserialize(&bytes).map_err(|e| IndexError::CorruptIndex {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        let entries = map.values().map(|v| v.len() as u64).sum();
        Ok(Self {
            map,
            entries,
            dir: Some(dir.to_path_buf()),
        })
    }

    fn save(&self, dir: &Path) -> IndexResult<()> {
        std::fs::create_dir_all(dir).map_err(|e| IndexError::Io { source: e })?;
        let bytes = bincode::serialize(&self.map).map_err(|e| IndexError::Serialization {
            message: e.to_string(),
        })?;
        std::fs::write(dir.join(SNAPSHOT_FILE), bytes).map_err(|e| IndexError::Io { source: e })
    }

    pub fn key_count(&self) -> usize {
        self.map.len()
    }

    pub fn entry_count(&self) -> u64 {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn visit_values(
        values: &[[u8; ENTRY_SIZE]],
        visit: &mut dyn FnMut(IndexEntry) -> ControlFlow<()>,
    ) -> ControlFlow<()> {
        for packed in values {
            if let Some(entry) = IndexEntry::unpack(packed) {
                visit(entry)?;
            }
        }
        ControlFlow::Continue(())
    }
}

impl PrefixIndex for MemIndex {
    fn scan_exact(
        &self,
        key: &str,
        visit: &mut dyn FnMut(IndexEntry) -> ControlFlow<()>,
    ) -> IndexResult<()> {
        if let Some(values) = self.map.get(key) {
            let _ = Self::visit_values(values, visit);
        }
        Ok(())
    }

    fn scan_prefix(
        &self,
        prefix: &str,
        visit: &mut dyn FnMut(&str, IndexEntry) -> ControlFlow<()>,
    ) -> IndexResult<()> {
        let range = self
            .map
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded));
        for (key, values) in range {
            if !key.starts_with(prefix) {
                break;
            }
            if !key_matches_prefix(key, prefix) {
                continue;
            }
            if Self::visit_values(values, &mut |entry| visit(key, entry)).is_break() {
                break;
            }
        }
        Ok(())
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Memory
    }
}

impl IndexWriter for MemIndex {
    fn insert(&mut self, key: &str, sort_weight: f32, pointer: Pointer) -> IndexResult<()> {
        let packed = IndexEntry::new(sort_weight, pointer).pack();
        let values = self.map.entry(key.to_string()).or_default();
        let pos = values.partition_point(|v| v <= &packed);
        values.insert(pos, packed);
        self.entries += 1;
        Ok(())
    }

    fn finish(self: Box<Self>, segment_base: &str, edges: u64) -> IndexResult<IndexManifest> {
        let manifest = IndexManifest {
            backend: BackendKind::Memory,
            segment_base: segment_base.to_string(),
            edges,
            keys: self.map.len() as u64,
            entries: self.entries,
        };
        if let Some(dir) = &self.dir {
            self.save(dir)?;
            manifest.save(dir)?;
        }
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::open_index;

    fn p(offset: u64) -> Pointer {
        Pointer::new(0, offset)
    }

    #[test]
    fn duplicates_sort_by_weight() {
        let mut index = MemIndex::new();
        index.insert("/c/en/dog", 1.0, p(100)).unwrap();
        index.insert("/c/en/dog", 0.25, p(200)).unwrap();
        index.insert("/c/en/dog", 0.5, p(300)).unwrap();
        assert_eq!(index.lookup_exact("/c/en/dog", 10).unwrap(), vec![p(200), p(300), p(100)]);
        assert_eq!(index.lookup_exact("/c/en/dog", 2).unwrap(), vec![p(200), p(300)]);
        assert!(index.lookup_exact("/c/en/cat", 10).unwrap().is_empty());
    }

    #[test]
    fn prefix_respects_slash_boundary() {
        let mut index = MemIndex::new();
        index.insert("/c/en/dog", 1.0, p(1)).unwrap();
        index.insert("/c/en/dog-sled", 1.0, p(2)).unwrap();
        index.insert("/c/en/dog/n", 1.0, p(3)).unwrap();
        index.insert("/c/en/doghouse", 1.0, p(4)).unwrap();
        assert_eq!(index.lookup_prefix("/c/en/dog", 10).unwrap(), vec![p(1), p(3)]);
        assert_eq!(index.lookup_prefix("/c/en/dog", 1).unwrap(), vec![p(1)]);
    }

    #[test]
    fn snapshot_reopens_through_manifest() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut index = Box::new(MemIndex::persistent(dir.path()));
        index.insert("/r/IsA", 0.5, p(32)).unwrap();
        let manifest = index.finish("assertions", 1).unwrap();
        assert_eq!(manifest.keys, 1);

        let loaded = open_index(dir.path()).unwrap();
        assert_eq!(loaded.manifest, manifest);
        assert_eq!(loaded.index.backend(), BackendKind::Memory);
        assert_eq!(loaded.index.lookup_exact("/r/IsA", 5).unwrap(), vec![p(32)]);
    }
}
