//! Cursor index: one memory-mapped file of per-key value blobs.
//!
//! Layout (integers little-endian, values in the packed big-endian entry
//! format):
//!
//! ```text
//! header     magic "EDGECIDX" | u32 version | u32 reserved | u64 key_count | u64 dir_offset
//! blocks     u32 key_len | key | u32 n | n × 16-byte entry     (ascending key order)
//! directory  key_count × u64 block offset
//! ```
//!
//! A lookup binary-searches the directory once to jump to the first block at
//! or after the key, then only ever walks forward through adjacent blocks.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::{IndexError, IndexResult};
use crate::segment::Pointer;

use super::{
    BackendKind, ENTRY_SIZE, IndexEntry, IndexManifest, IndexWriter, PrefixIndex, key_matches_prefix,
};

const CIDX_MAGIC: &[u8; 8] = b"EDGECIDX";
const CIDX_VERSION: u32 = 1;
const CIDX_HEADER_SIZE: usize = 32;
const CIDX_FILE: &str = "index.cidx";

/// One decoded block, borrowing from the map.
struct Block<'a> {
    key: &'a str,
    values: &'a [u8],
    next: usize,
}

pub struct CursorIndex {
    mmap: Mmap,
    path: PathBuf,
    key_count: usize,
    dir_offset: usize,
}

impl CursorIndex {
    pub fn open(dir: &Path) -> IndexResult<Self> {
        let path = dir.join(CIDX_FILE);
        let unavailable = |reason: String| IndexError::IndexUnavailable {
            path: path.display().to_string(),
            reason,
        };
        let file = File::open(&path).map_err(|e| unavailable(e.to_string()))?;
        let len = file.metadata().map_err(|e| unavailable(e.to_string()))?.len() as usize;
        if len < CIDX_HEADER_SIZE {
            return Err(unavailable(format!("truncated: {len} bytes")));
        }
        // Safety: index files are written to a temporary name and renamed
        // into place, never modified afterwards.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| unavailable(e.to_string()))?;

        let corrupt = |message: String| IndexError::CorruptIndex {
            path: path.display().to_string(),
            message,
        };
        if &mmap[..8] != CIDX_MAGIC {
            return Err(corrupt("bad magic, not a cursor index".into()));
        }
        let version = read_u32(&mmap, 8);
        if version != CIDX_VERSION {
            return Err(corrupt(format!("version {version} != expected {CIDX_VERSION}")));
        }
        let key_count = read_u64(&mmap, 16) as usize;
        let dir_offset = read_u64(&mmap, 24) as usize;
        let dir_end = key_count
            .checked_mul(8)
            .and_then(|n| n.checked_add(dir_offset));
        if dir_offset < CIDX_HEADER_SIZE || dir_end.is_none_or(|end| end > len) {
            return Err(corrupt("directory lies outside the file".into()));
        }

        Ok(Self {
            mmap,
            path,
            key_count,
            dir_offset,
        })
    }

    fn corrupt(&self, message: impl Into<String>) -> IndexError {
        IndexError::CorruptIndex {
            path: self.path.display().to_string(),
            message: message.into(),
        }
    }

    fn block_offset(&self, i: usize) -> usize {
        read_u64(&self.mmap, self.dir_offset + i * 8) as usize
    }

    fn block_at(&self, offset: usize) -> IndexResult<Block<'_>> {
        let bytes = &self.mmap[..self.dir_offset];
        let truncated = || self.corrupt(format!("block at {offset} runs past the directory"));

        let key_len = read_u32_checked(bytes, offset).ok_or_else(truncated)? as usize;
        let key_start = offset + 4;
        let key_end = key_start + key_len;
        let key_bytes = bytes.get(key_start..key_end).ok_or_else(truncated)?;
        let key = std::str::from_utf8(key_bytes)
            .map_err(|e| self.corrupt(format!("key at {offset} is not utf-8: {e}")))?;
        let n = read_u32_checked(bytes, key_end).ok_or_else(truncated)? as usize;
        let values_start = key_end + 4;
        let values_end = values_start + n * ENTRY_SIZE;
        let values = bytes.get(values_start..values_end).ok_or_else(truncated)?;
        Ok(Block {
            key,
            values,
            next: values_end,
        })
    }

    /// Offset of the first block whose key is `>= key`, or `dir_offset`.
    fn seek(&self, key: &str) -> IndexResult<usize> {
        let (mut lo, mut hi) = (0usize, self.key_count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.block_at(self.block_offset(mid))?.key < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(if lo < self.key_count {
            self.block_offset(lo)
        } else {
            self.dir_offset
        })
    }

    pub fn key_count(&self) -> usize {
        self.key_count
    }
}

fn visit_blob(values: &[u8], visit: &mut dyn FnMut(IndexEntry) -> ControlFlow<()>) -> ControlFlow<()> {
    for chunk in values.chunks_exact(ENTRY_SIZE) {
        if let Some(entry) = IndexEntry::unpack(chunk) {
            visit(entry)?;
        }
    }
    ControlFlow::Continue(())
}

impl PrefixIndex for CursorIndex {
    fn scan_exact(
        &self,
        key: &str,
        visit: &mut dyn FnMut(IndexEntry) -> ControlFlow<()>,
    ) -> IndexResult<()> {
        let offset = self.seek(key)?;
        if offset < self.dir_offset {
            let block = self.block_at(offset)?;
            if block.key == key {
                let _ = visit_blob(block.values, visit);
            }
        }
        Ok(())
    }

    fn scan_prefix(
        &self,
        prefix: &str,
        visit: &mut dyn FnMut(&str, IndexEntry) -> ControlFlow<()>,
    ) -> IndexResult<()> {
        let mut offset = self.seek(prefix)?;
        while offset < self.dir_offset {
            let block = self.block_at(offset)?;
            if !block.key.starts_with(prefix) {
                break;
            }
            if key_matches_prefix(block.key, prefix)
                && visit_blob(block.values, &mut |entry| visit(block.key, entry)).is_break()
            {
                break;
            }
            offset = block.next;
        }
        Ok(())
    }

    fn backend(&self) -> BackendKind {
        BackendKind::Cursor
    }
}

impl std::fmt::Debug for CursorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorIndex")
            .field("path", &self.path)
            .field("keys", &self.key_count)
            .finish()
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    read_u32_checked(bytes, at).unwrap_or(0)
}

fn read_u32_checked(bytes: &[u8], at: usize) -> Option<u32> {
    let slice = bytes.get(at..at.checked_add(4)?)?;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(slice);
    Some(u32::from_le_bytes(buf))
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    if let Some(slice) = bytes.get(at..at + 8) {
        buf.copy_from_slice(slice);
    }
    u64::from_le_bytes(buf)
}

/// Accumulates the whole index in memory, then writes it in one pass.
#[derive(Debug)]
pub struct CursorIndexWriter {
    dir: PathBuf,
    map: BTreeMap<String, Vec<[u8; ENTRY_SIZE]>>,
    entries: u64,
}

impl CursorIndexWriter {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            map: BTreeMap::new(),
            entries: 0,
        }
    }

    fn write_file(&mut self) -> IndexResult<()> {
        let io = |e: std::io::Error| IndexError::Io { source: e };
        fs::create_dir_all(&self.dir).map_err(io)?;
        let final_path = self.dir.join(CIDX_FILE);
        let tmp_path = self.dir.join(format!("{CIDX_FILE}.tmp"));

        let mut out = BufWriter::new(File::create(&tmp_path).map_err(io)?);
        out.write_all(&[0u8; CIDX_HEADER_SIZE]).map_err(io)?;
        let mut pos = CIDX_HEADER_SIZE as u64;
        let mut directory = Vec::with_capacity(self.map.len());

        for (key, values) in &mut self.map {
            values.sort_unstable();
            directory.push(pos);
            out.write_all(&(key.len() as u32).to_le_bytes()).map_err(io)?;
            out.write_all(key.as_bytes()).map_err(io)?;
            out.write_all(&(values.len() as u32).to_le_bytes()).map_err(io)?;
            for value in values.iter() {
                out.write_all(value).map_err(io)?;
            }
            pos += 8 + key.len() as u64 + (values.len() * ENTRY_SIZE) as u64;
        }
        let dir_offset = pos;
        for offset in &directory {
            out.write_all(&offset.to_le_bytes()).map_err(io)?;
        }

        let mut header = [0u8; CIDX_HEADER_SIZE];
        header[..8].copy_from_slice(CIDX_MAGIC);
        header[8..12].copy_from_slice(&CIDX_VERSION.to_le_bytes());
        header[16..24].copy_from_slice(&(directory.len() as u64).to_le_bytes());
        header[24..32].copy_from_slice(&dir_offset.to_le_bytes());

        let mut file = out.into_inner().map_err(|e| io(e.into_error()))?;
        file.seek(SeekFrom::Start(0)).map_err(io)?;
        file.write_all(&header).map_err(io)?;
        file.sync_all().map_err(io)?;
        drop(file);
        fs::rename(&tmp_path, &final_path).map_err(io)?;
        Ok(())
    }
}

impl IndexWriter for CursorIndexWriter {
    fn insert(&mut self, key: &str, sort_weight: f32, pointer: Pointer) -> IndexResult<()> {
        self.map
            .entry(key.to_string())
            .or_default()
            .push(IndexEntry::new(sort_weight, pointer).pack());
        self.entries += 1;
        Ok(())
    }

    fn finish(mut self: Box<Self>, segment_base: &str, edges: u64) -> IndexResult<IndexManifest> {
        self.write_file()?;
        let manifest = IndexManifest {
            backend: BackendKind::Cursor,
            segment_base: segment_base.to_string(),
            edges,
            keys: self.map.len() as u64,
            entries: self.entries,
        };
        manifest.save(&self.dir)?;
        tracing::info!(keys = manifest.keys, entries = manifest.entries, "finished cursor index");
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn p(offset: u64) -> Pointer {
        Pointer::new(3, offset)
    }

    fn build(dir: &Path, rows: &[(&str, f32, u64)]) -> CursorIndex {
        let mut writer = Box::new(CursorIndexWriter::new(dir));
        for &(key, w, off) in rows {
            writer.insert(key, w, p(off)).unwrap();
        }
        writer.finish("assertions", 0).unwrap();
        CursorIndex::open(dir).unwrap()
    }

    #[test]
    fn exact_lookup_jumps_to_key() {
        let dir = TempDir::new().unwrap();
        let index = build(
            dir.path(),
            &[
                ("/c/en/cat", 1.0, 1),
                ("/c/en/dog", 1.0, 2),
                ("/c/en/dog", 0.2, 3),
                ("/c/en/emu", 1.0, 4),
            ],
        );
        assert_eq!(index.key_count(), 3);
        assert_eq!(index.lookup_exact("/c/en/dog", 10).unwrap(), vec![p(3), p(2)]);
        assert_eq!(index.lookup_exact("/c/en/emu", 10).unwrap(), vec![p(4)]);
        assert!(index.lookup_exact("/c/en/cow", 10).unwrap().is_empty());
        assert!(index.lookup_exact("/z", 10).unwrap().is_empty());
    }

    #[test]
    fn prefix_walks_forward_with_boundary() {
        let dir = TempDir::new().unwrap();
        let index = build(
            dir.path(),
            &[
                ("/c/en/dog", 1.0, 1),
                ("/c/en/dog-sled", 1.0, 2),
                ("/c/en/dog/n", 1.0, 3),
                ("/c/en/dog/n/animal", 1.0, 5),
                ("/c/en/doghouse", 1.0, 4),
            ],
        );
        assert_eq!(index.lookup_prefix("/c/en/dog", 10).unwrap(), vec![p(1), p(3), p(5)]);
        assert_eq!(index.lookup_prefix("/c/en/dog/n", 10).unwrap(), vec![p(3), p(5)]);
        assert_eq!(index.lookup_prefix("/c/en/dog", 2).unwrap(), vec![p(1), p(3)]);
    }

    #[test]
    fn empty_index_is_valid() {
        let dir = TempDir::new().unwrap();
        let index = build(dir.path(), &[]);
        assert!(index.lookup_prefix("/c", 10).unwrap().is_empty());
        assert!(!dir.path().join(format!("{CIDX_FILE}.tmp")).exists());
    }

    #[test]
    fn garbage_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CIDX_FILE), vec![7u8; 64]).unwrap();
        assert!(matches!(
            CursorIndex::open(dir.path()).unwrap_err(),
            IndexError::CorruptIndex { .. }
        ));
    }
}
