//! Prefix-aware secondary index over segment records.
//!
//! The index is a sorted multimap `key → [(sort_weight, Pointer)]`. Every
//! edge is filed under its own fields, every hierarchical prefix of them,
//! its provenance strings and its feature strings (see [`index_keys`]), so a
//! lookup for `/c/en/dog` also finds `/c/en/dog/n/animal`.
//!
//! Three interchangeable backends implement [`PrefixIndex`] and
//! [`IndexWriter`]:
//!
//! - [`mem::MemIndex`]: a `BTreeMap`, optionally snapshotted to disk
//! - [`durable::DurableIndex`]: a redb multimap table (duplicate keys, values
//!   sorted by their packed bytes)
//! - [`cursor::CursorIndex`]: a memory-mapped file of per-key value blobs
//!   walked forward from a binary-searched starting key
//!
//! A bincode [`IndexManifest`] next to the index records which backend built
//! it, so [`open_index`] can reopen any of them.

pub mod cursor;
pub mod durable;
pub mod mem;

use std::collections::BTreeSet;
use std::fmt;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::edge::Edge;
use crate::error::{IndexError, IndexResult};
use crate::segment::Pointer;
use crate::uri;

/// Packed size of one index value.
pub const ENTRY_SIZE: usize = 16;
pub const MANIFEST_FILE: &str = "manifest.bin";

/// One index value: where an edge lives, and how it sorts under its key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexEntry {
    /// `1 / weight`; ascending order puts the strongest edges first.
    pub sort_weight: f32,
    pub pointer: Pointer,
}

impl IndexEntry {
    pub fn new(sort_weight: f32, pointer: Pointer) -> Self {
        Self {
            sort_weight,
            pointer,
        }
    }

    /// `[f32 BE][u32 segment BE][u64 offset BE]`. For positive weights the
    /// byte order is the numeric order.
    pub fn pack(&self) -> [u8; ENTRY_SIZE] {
        let mut buf = [0u8; ENTRY_SIZE];
        buf[..4].copy_from_slice(&self.sort_weight.to_be_bytes());
        buf[4..8].copy_from_slice(&self.pointer.segment.to_be_bytes());
        buf[8..16].copy_from_slice(&self.pointer.offset.to_be_bytes());
        buf
    }

    pub fn unpack(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != ENTRY_SIZE {
            return None;
        }
        let mut w = [0u8; 4];
        let mut s = [0u8; 4];
        let mut o = [0u8; 8];
        w.copy_from_slice(&bytes[..4]);
        s.copy_from_slice(&bytes[4..8]);
        o.copy_from_slice(&bytes[8..16]);
        Some(Self {
            sort_weight: f32::from_be_bytes(w),
            pointer: Pointer::new(u32::from_be_bytes(s), u64::from_be_bytes(o)),
        })
    }
}

/// Whether `key` equals `prefix` or continues it past a `/` boundary.
///
/// `/c/en/dog` matches `/c/en/dog/n` but not `/c/en/doghouse`.
pub fn key_matches_prefix(key: &str, prefix: &str) -> bool {
    if !key.starts_with(prefix) {
        return false;
    }
    key.len() == prefix.len() || prefix.ends_with('/') || key.as_bytes()[prefix.len()] == b'/'
}

/// Read side of the index.
///
/// The two scan methods drive a visitor that can stop the scan early; the
/// `lookup_*` conveniences collect pointers up to a limit.
pub trait PrefixIndex: Send + Sync {
    /// Visit every entry filed under exactly `key`, weight-ascending.
    fn scan_exact(
        &self,
        key: &str,
        visit: &mut dyn FnMut(IndexEntry) -> ControlFlow<()>,
    ) -> IndexResult<()>;

    /// Visit every entry whose key matches `prefix` (see
    /// [`key_matches_prefix`]), key-ascending, weight-ascending within a key.
    fn scan_prefix(
        &self,
        prefix: &str,
        visit: &mut dyn FnMut(&str, IndexEntry) -> ControlFlow<()>,
    ) -> IndexResult<()>;

    fn backend(&self) -> BackendKind;

    fn lookup_exact(&self, key: &str, limit: usize) -> IndexResult<Vec<Pointer>> {
        let mut out = Vec::new();
        if limit == 0 {
            return Ok(out);
        }
        self.scan_exact(key, &mut |entry| {
            out.push(entry.pointer);
            if out.len() >= limit {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })?;
        Ok(out)
    }

    fn lookup_prefix(&self, prefix: &str, limit: usize) -> IndexResult<Vec<Pointer>> {
        let mut out = Vec::new();
        if limit == 0 {
            return Ok(out);
        }
        self.scan_prefix(prefix, &mut |_, entry| {
            out.push(entry.pointer);
            if out.len() >= limit {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })?;
        Ok(out)
    }
}

/// Write side of the index. Duplicate keys accumulate.
pub trait IndexWriter: Send {
    fn insert(&mut self, key: &str, sort_weight: f32, pointer: Pointer) -> IndexResult<()>;

    /// Make everything durable and write the manifest.
    fn finish(self: Box<Self>, segment_base: &str, edges: u64) -> IndexResult<IndexManifest>;
}

/// Every key an edge is filed under: its uri, rel, start, end and dataset
/// with all their prefixes of two or more pieces, every provenance string
/// with its prefixes, and the three feature strings.
pub fn index_keys(edge: &Edge) -> Vec<String> {
    let mut keys = BTreeSet::new();
    let provenance = edge.sources().provenance_strings();
    let fields = [edge.uri(), edge.rel(), edge.start(), edge.end(), edge.dataset()]
        .into_iter()
        .chain(provenance.iter().map(String::as_str));
    for field in fields {
        if field.is_empty() {
            continue;
        }
        keys.insert(field.to_string());
        keys.extend(uri::uri_prefixes(field, 2));
    }
    keys.extend(edge.features().iter().cloned());
    keys.into_iter().collect()
}

/// The values an exact (`/.`) lookup for this edge must equal.
pub fn exact_values(edge: &Edge) -> Vec<String> {
    let mut values: Vec<String> = [edge.uri(), edge.rel(), edge.start(), edge.end(), edge.dataset()]
        .into_iter()
        .map(str::to_string)
        .collect();
    values.extend(edge.sources().provenance_strings());
    values.extend(edge.features().iter().cloned());
    values
}

/// File an edge under all of its keys. Edges without positive weight are not
/// indexed; returns the number of entries written.
pub fn index_edge(writer: &mut dyn IndexWriter, edge: &Edge, pointer: Pointer) -> IndexResult<usize> {
    if edge.weight() <= 0.0 {
        tracing::debug!(uri = %edge.uri(), weight = edge.weight(), "not indexing non-positive edge");
        return Ok(0);
    }
    let sort_weight = (1.0 / edge.weight()) as f32;
    let keys = index_keys(edge);
    for key in &keys {
        writer.insert(key, sort_weight, pointer)?;
    }
    Ok(keys.len())
}

/// Which backend an index directory holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Redb,
    Cursor,
    Memory,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Redb => "redb",
            BackendKind::Cursor => "cursor",
            BackendKind::Memory => "memory",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "redb" | "durable" => Ok(BackendKind::Redb),
            "cursor" | "cidx" => Ok(BackendKind::Cursor),
            "memory" | "mem" => Ok(BackendKind::Memory),
            other => Err(format!("unknown index backend {other:?} (expected redb, cursor or memory)")),
        }
    }
}

/// Sidecar describing a built index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub backend: BackendKind,
    /// Base name of the segments the pointers refer to.
    pub segment_base: String,
    pub edges: u64,
    pub keys: u64,
    pub entries: u64,
}

impl IndexManifest {
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE)
    }

    pub fn load(dir: &Path) -> IndexResult<Self> {
        let path = Self::path(dir);
        let bytes = std::fs::read(&path).map_err(|e| IndexError::IndexUnavailable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        bincode::deserialize(&bytes).map_err(|e| IndexError::CorruptIndex {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    pub fn save(&self, dir: &Path) -> IndexResult<()> {
        std::fs::create_dir_all(dir).map_err(|e| IndexError::Io { source: e })?;
        let bytes = bincode::serialize(self).map_err(|e| IndexError::Serialization {
            message: e.to_string(),
        })?;
        std::fs::write(Self::path(dir), bytes).map_err(|e| IndexError::Io { source: e })
    }
}

/// An index reopened from disk, with its manifest.
pub struct LoadedIndex {
    pub manifest: IndexManifest,
    pub index: Box<dyn PrefixIndex>,
}

impl fmt::Debug for LoadedIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedIndex")
            .field("manifest", &self.manifest)
            .finish()
    }
}

/// Reopen whatever index `dir` holds. A missing directory or manifest is
/// [`IndexError::IndexUnavailable`].
pub fn open_index(dir: &Path) -> IndexResult<LoadedIndex> {
    let manifest = IndexManifest::load(dir)?;
    let index: Box<dyn PrefixIndex> = match manifest.backend {
        BackendKind::Redb => Box::new(durable::DurableIndex::open(dir)?),
        BackendKind::Cursor => Box::new(cursor::CursorIndex::open(dir)?),
        BackendKind::Memory => Box::new(mem::MemIndex::load(dir)?),
    };
    tracing::info!(
        dir = %dir.display(),
        backend = %manifest.backend,
        keys = manifest.keys,
        entries = manifest.entries,
        "opened index"
    );
    Ok(LoadedIndex { manifest, index })
}

/// Start a fresh index of the given backend in `dir`, replacing any old one.
pub fn create_index(dir: &Path, backend: BackendKind, batch_size: usize) -> IndexResult<Box<dyn IndexWriter>> {
    std::fs::create_dir_all(dir).map_err(|e| IndexError::Io { source: e })?;
    let manifest = IndexManifest::path(dir);
    if manifest.exists() {
        std::fs::remove_file(&manifest).map_err(|e| IndexError::Io { source: e })?;
    }
    Ok(match backend {
        BackendKind::Redb => Box::new(durable::DurableIndexWriter::create(dir, batch_size)?),
        BackendKind::Cursor => Box::new(cursor::CursorIndexWriter::new(dir)),
        BackendKind::Memory => Box::new(mem::MemIndex::persistent(dir)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::{EdgeBuilder, test_edge};

    #[test]
    fn packed_order_is_weight_order() {
        let strong = IndexEntry::new(1.0 / 4.0, Pointer::new(9, 9000)).pack();
        let weak = IndexEntry::new(1.0 / 0.5, Pointer::new(0, 32)).pack();
        assert!(strong < weak);
        let round = IndexEntry::unpack(&strong).unwrap();
        assert_eq!(round.pointer, Pointer::new(9, 9000));
        assert_eq!(round.sort_weight, 0.25);
        assert!(IndexEntry::unpack(&strong[..15]).is_none());
    }

    #[test]
    fn prefix_boundary() {
        assert!(key_matches_prefix("/c/en/dog", "/c/en/dog"));
        assert!(key_matches_prefix("/c/en/dog/n/animal", "/c/en/dog"));
        assert!(!key_matches_prefix("/c/en/doghouse", "/c/en/dog"));
        assert!(!key_matches_prefix("/c/en/do", "/c/en/dog"));
        assert!(key_matches_prefix("/c/en/dog", "/c/en/"));
    }

    #[test]
    fn keys_cover_fields_prefixes_sources_and_features() {
        let edge = EdgeBuilder::new(
            "/r/IsA",
            "/c/en/dog/n",
            "/c/en/animal",
            "/d/wordnet/3.1",
            "cc:by/4.0",
            vec!["/s/resource/wordnet/rdf/3.1"],
        )
        .build()
        .unwrap();
        let keys = index_keys(&edge);
        for expected in [
            "/a/[/r/IsA/,/c/en/dog/n/,/c/en/animal/]",
            "/r/IsA",
            "/c/en",
            "/c/en/dog",
            "/c/en/dog/n",
            "/c/en/animal",
            "/d/wordnet",
            "/d/wordnet/3.1",
            "/s/resource",
            "/s/resource/wordnet/rdf/3.1",
            "/c/en/dog /r/IsA -",
            "/c/en/dog - /c/en/animal",
            "- /r/IsA /c/en/animal",
        ] {
            assert!(keys.iter().any(|k| k == expected), "missing key {expected}");
        }
        // "/c" alone is below the two-piece minimum.
        assert!(!keys.iter().any(|k| k == "/c"));
        let unique: BTreeSet<_> = keys.iter().collect();
        assert_eq!(unique.len(), keys.len());
    }

    #[test]
    fn non_positive_edges_are_not_indexed() {
        let mut index = mem::MemIndex::new();
        let negative = test_edge("/r/IsA", "/c/en/a", "/c/en/b", -1.0);
        assert_eq!(index_edge(&mut index, &negative, Pointer::new(0, 32)).unwrap(), 0);
        assert!(index.is_empty());
        let positive = test_edge("/r/IsA", "/c/en/a", "/c/en/b", 2.0);
        assert!(index_edge(&mut index, &positive, Pointer::new(0, 32)).unwrap() > 0);
        assert_eq!(index.lookup_exact("/c/en/a", 10).unwrap(), vec![Pointer::new(0, 32)]);
    }

    #[test]
    fn backend_names_parse() {
        assert_eq!("redb".parse::<BackendKind>().unwrap(), BackendKind::Redb);
        assert_eq!("Cursor".parse::<BackendKind>().unwrap(), BackendKind::Cursor);
        assert_eq!("mem".parse::<BackendKind>().unwrap(), BackendKind::Memory);
        assert!("lmdb".parse::<BackendKind>().is_err());
    }

    #[test]
    fn missing_manifest_is_unavailable() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = open_index(dir.path()).unwrap_err();
        assert!(matches!(err, IndexError::IndexUnavailable { .. }));
    }
}
