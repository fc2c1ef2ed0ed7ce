//! Append-only segment files holding serialized edges.
//!
//! A segment is written once by a [`SegmentWriter`], sealed on close, and from
//! then on only ever memory-mapped for reading by a [`SegmentReader`]. Records
//! are MessagePack-encoded [`Edge`]s laid back to back after a fixed header;
//! there is no in-segment index, so a record is reached either by sequential
//! scan or through a [`Pointer`] held by the prefix index.
//!
//! - [`SegmentStore`] opens every segment of a base name in a directory.
//! - [`FanInWriter`] serializes writes from many producers onto one writer.
//! - [`ShardDistributor`] routes raw rows to shard files by [`shard_for`].

pub mod reader;
pub mod shard;
pub mod writer;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::edge::Edge;
use crate::error::{SegmentError, SegmentResult};

pub use reader::{SegmentIter, SegmentReader};
pub use shard::{DEFAULT_SHARD_COUNT, ShardDistributor, shard_for};
pub use writer::{FanInHandle, FanInWriter, SegmentSummary, SegmentWriter};

pub(crate) const SEGMENT_MAGIC: &[u8; 8] = b"EDGESEG\0";
pub(crate) const SEGMENT_VERSION: u32 = 1;
/// Bytes reserved at the start of every segment file.
pub const HEADER_SIZE: usize = 32;
const SEGMENT_EXT: &str = "seg";

/// Location of one record: segment id plus absolute byte offset in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pointer {
    pub segment: u32,
    pub offset: u64,
}

impl Pointer {
    pub fn new(segment: u32, offset: u64) -> Self {
        Self { segment, offset }
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.offset)
    }
}

/// `<base>_<id:03>.seg`
pub fn segment_file_name(base: &str, segment: u32) -> String {
    format!("{base}_{segment:03}.{SEGMENT_EXT}")
}

/// Inverse of [`segment_file_name`] for a given base.
pub fn parse_segment_file_name(base: &str, file_name: &str) -> Option<u32> {
    let rest = file_name.strip_prefix(base)?.strip_prefix('_')?;
    let digits = rest.strip_suffix(SEGMENT_EXT)?.strip_suffix('.')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Fixed header at the start of a segment file (little-endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SegmentHeader {
    pub sealed: bool,
    pub data_len: u64,
    pub record_count: u64,
}

impl SegmentHeader {
    pub fn unsealed() -> Self {
        Self {
            sealed: false,
            data_len: 0,
            record_count: 0,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..8].copy_from_slice(SEGMENT_MAGIC);
        buf[8..12].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
        buf[12..16].copy_from_slice(&u32::from(self.sealed).to_le_bytes());
        buf[16..24].copy_from_slice(&self.data_len.to_le_bytes());
        buf[24..32].copy_from_slice(&self.record_count.to_le_bytes());
        buf
    }

    /// Decode and validate; the error string names what is wrong.
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() < HEADER_SIZE {
            return Err(format!("file is {} bytes, shorter than the header", bytes.len()));
        }
        if &bytes[..8] != SEGMENT_MAGIC {
            return Err("bad magic, not a segment file".into());
        }
        let version = u32::from_le_bytes(le_array(&bytes[8..12]));
        if version != SEGMENT_VERSION {
            return Err(format!("segment version {version} != expected {SEGMENT_VERSION}"));
        }
        Ok(Self {
            sealed: u32::from_le_bytes(le_array(&bytes[12..16])) != 0,
            data_len: u64::from_le_bytes(le_array(&bytes[16..24])),
            record_count: u64::from_le_bytes(le_array(&bytes[24..32])),
        })
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// Every sealed segment of one base name in a directory, opened once and
/// held for the life of the store.
#[derive(Debug)]
pub struct SegmentStore {
    dir: PathBuf,
    base: String,
    segments: BTreeMap<u32, SegmentReader>,
}

impl SegmentStore {
    /// Open all `<base>_NNN.seg` files in `dir`.
    ///
    /// Any segment that is missing its seal or is truncated fails the whole
    /// open; an existing directory with no segments yields an empty store.
    pub fn open(dir: &Path, base: &str) -> SegmentResult<Self> {
        let entries = std::fs::read_dir(dir).map_err(|e| SegmentError::SegmentUnavailable {
            path: dir.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut segments = BTreeMap::new();
        for entry in entries {
            let entry = entry.map_err(|e| SegmentError::Io { source: e })?;
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| parse_segment_file_name(base, n)) else {
                continue;
            };
            let reader = SegmentReader::open(&entry.path(), id)?;
            segments.insert(id, reader);
        }

        tracing::debug!(
            dir = %dir.display(),
            base,
            segments = segments.len(),
            "opened segment store"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            base: base.to_string(),
            segments,
        })
    }

    /// Dereference a pointer into its edge.
    pub fn read(&self, pointer: Pointer) -> SegmentResult<Edge> {
        self.segment(pointer.segment)?.read_at(pointer.offset)
    }

    /// A pointer into a segment this store did not load is unavailable.
    pub fn segment(&self, id: u32) -> SegmentResult<&SegmentReader> {
        self.segments
            .get(&id)
            .ok_or_else(|| SegmentError::SegmentUnavailable {
                path: self.dir.join(segment_file_name(&self.base, id)).display().to_string(),
                reason: "segment is not loaded in this store".into(),
            })
    }

    pub fn segments(&self) -> impl Iterator<Item = &SegmentReader> {
        self.segments.values()
    }

    /// Total records across all segments.
    pub fn total_records(&self) -> u64 {
        self.segments.values().map(|s| s.len() as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_records() == 0
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Pick a segment weighted by its record count, then a uniform record in
    /// it. Returns `None` for an empty store.
    pub fn random_edge<R: Rng + ?Sized>(&self, rng: &mut R) -> SegmentResult<Option<Edge>> {
        let total = self.total_records();
        if total == 0 {
            return Ok(None);
        }
        let mut pick = rng.gen_range(0..total);
        for segment in self.segments.values() {
            let len = segment.len() as u64;
            if pick < len {
                return segment.nth_record(pick as usize).map(Some);
            }
            pick -= len;
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_round_trip() {
        assert_eq!(segment_file_name("assertions", 7), "assertions_007.seg");
        assert_eq!(segment_file_name("assertions", 1234), "assertions_1234.seg");
        assert_eq!(parse_segment_file_name("assertions", "assertions_007.seg"), Some(7));
        assert_eq!(parse_segment_file_name("assertions", "assertions_x.seg"), None);
        assert_eq!(parse_segment_file_name("assertions", "rejects_001.seg"), None);
        assert_eq!(parse_segment_file_name("assertions", "assertions_001.cidx"), None);
    }

    #[test]
    fn header_round_trip() {
        let header = SegmentHeader {
            sealed: true,
            data_len: 1234,
            record_count: 9,
        };
        let bytes = header.encode();
        assert_eq!(&bytes[..8], SEGMENT_MAGIC);
        assert_eq!(SegmentHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn header_rejects_garbage() {
        assert!(SegmentHeader::decode(b"short").is_err());
        let mut bytes = SegmentHeader::unsealed().encode();
        bytes[0] = b'X';
        assert!(SegmentHeader::decode(&bytes).is_err());
    }

    #[test]
    fn pointer_into_unloaded_segment_is_unavailable() {
        let dir = tempfile::TempDir::new().unwrap();
        SegmentWriter::create(dir.path(), "assertions", 0, 4)
            .unwrap()
            .close()
            .unwrap();
        let store = SegmentStore::open(dir.path(), "assertions").unwrap();
        match store.read(Pointer::new(7, HEADER_SIZE as u64)).unwrap_err() {
            SegmentError::SegmentUnavailable { path, .. } => {
                assert!(path.ends_with("assertions_007.seg"), "{path}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn pointer_display() {
        assert_eq!(Pointer::new(3, 96).to_string(), "3:96");
    }
}
