//! Memory-mapped, read-only access to sealed segments.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use memmap2::Mmap;

use crate::edge::Edge;
use crate::error::{SegmentError, SegmentResult};

use super::{HEADER_SIZE, Pointer, SegmentHeader};

/// A sealed segment mapped into memory.
///
/// Reads decode exactly one MessagePack record starting at the requested
/// offset; record lengths are never stored, only discovered by decoding.
pub struct SegmentReader {
    segment: u32,
    path: PathBuf,
    mmap: Mmap,
    data_end: u64,
    count: u64,
    /// Record start offsets, found by one sequential pass on first use.
    offsets: OnceLock<Vec<u64>>,
}

impl SegmentReader {
    /// Map a sealed segment file. Missing, unsealed or truncated files are
    /// [`SegmentError::SegmentUnavailable`].
    pub fn open(path: &Path, segment: u32) -> SegmentResult<Self> {
        let unavailable = |reason: String| SegmentError::SegmentUnavailable {
            path: path.display().to_string(),
            reason,
        };

        let file = File::open(path).map_err(|e| unavailable(e.to_string()))?;
        let file_len = file
            .metadata()
            .map_err(|e| unavailable(e.to_string()))?
            .len();
        if file_len < HEADER_SIZE as u64 {
            return Err(unavailable(format!("truncated: {file_len} bytes, no header")));
        }

        // Safety: sealed segments are never written again, so the mapping
        // cannot change underneath us.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| unavailable(e.to_string()))?;

        let header = SegmentHeader::decode(&mmap).map_err(unavailable)?;
        if !header.sealed {
            return Err(unavailable("segment was never sealed".into()));
        }
        let data_end = HEADER_SIZE as u64 + header.data_len;
        if data_end > file_len {
            return Err(unavailable(format!(
                "truncated: header promises {data_end} bytes, file has {file_len}"
            )));
        }

        Ok(Self {
            segment,
            path: path.to_path_buf(),
            mmap,
            data_end,
            count: header.record_count,
            offsets: OnceLock::new(),
        })
    }

    /// Decode the record at `offset`.
    pub fn read_at(&self, offset: u64) -> SegmentResult<Edge> {
        self.decode_at(offset).map(|(edge, _)| edge)
    }

    /// Decode at `offset`, returning the edge and the offset just past it.
    fn decode_at(&self, offset: u64) -> SegmentResult<(Edge, u64)> {
        if offset < HEADER_SIZE as u64 || offset >= self.data_end {
            return Err(self.corrupt(offset, "offset outside the record area"));
        }
        let mut rest: &[u8] = &self.mmap[offset as usize..self.data_end as usize];
        let before = rest.len();
        let edge: Edge =
            rmp_serde::from_read(&mut rest).map_err(|e| self.corrupt(offset, &e.to_string()))?;
        let consumed = (before - rest.len()) as u64;
        Ok((edge, offset + consumed))
    }

    fn corrupt(&self, offset: u64, message: &str) -> SegmentError {
        SegmentError::CorruptRecord {
            segment: self.segment,
            offset,
            message: message.to_string(),
        }
    }

    /// Sequential scan over every record.
    pub fn iter(&self) -> SegmentIter<'_> {
        SegmentIter {
            reader: self,
            pos: HEADER_SIZE as u64,
        }
    }

    /// Start offsets of every record, computed once.
    pub fn record_offsets(&self) -> SegmentResult<&[u64]> {
        if let Some(offsets) = self.offsets.get() {
            return Ok(offsets);
        }
        let mut offsets = Vec::with_capacity(self.count as usize);
        let mut pos = HEADER_SIZE as u64;
        while pos < self.data_end {
            offsets.push(pos);
            let (_, next) = self.decode_at(pos)?;
            pos = next;
        }
        tracing::trace!(segment = self.segment, records = offsets.len(), "indexed record offsets");
        Ok(self.offsets.get_or_init(|| offsets))
    }

    /// The `n`th record in file order.
    pub fn nth_record(&self, n: usize) -> SegmentResult<Edge> {
        let offsets = self.record_offsets()?;
        match offsets.get(n) {
            Some(&offset) => self.read_at(offset),
            None => Err(self.corrupt(
                self.data_end,
                &format!("record {n} requested, segment holds {}", offsets.len()),
            )),
        }
    }

    pub fn segment_id(&self) -> u32 {
        self.segment
    }

    /// Record count from the header.
    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the record area in bytes.
    pub fn data_len(&self) -> u64 {
        self.data_end - HEADER_SIZE as u64
    }
}

impl std::fmt::Debug for SegmentReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentReader")
            .field("segment", &self.segment)
            .field("path", &self.path)
            .field("records", &self.count)
            .finish()
    }
}

/// Forward iterator over `(Pointer, Edge)`; stops after the first error.
pub struct SegmentIter<'a> {
    reader: &'a SegmentReader,
    pos: u64,
}

impl Iterator for SegmentIter<'_> {
    type Item = SegmentResult<(Pointer, Edge)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.reader.data_end {
            return None;
        }
        let offset = self.pos;
        match self.reader.decode_at(offset) {
            Ok((edge, next)) => {
                self.pos = next;
                Some(Ok((Pointer::new(self.reader.segment, offset), edge)))
            }
            Err(e) => {
                self.pos = self.reader.data_end;
                Some(Err(e))
            }
        }
    }
}
