//! Segment writers: the single-owner [`SegmentWriter`] and the channel-fed
//! [`FanInWriter`] that lets many producers share one.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, SyncSender};
use std::thread::JoinHandle;

use crate::combine::EdgeSink;
use crate::edge::Edge;
use crate::error::{SegmentError, SegmentResult};

use super::{HEADER_SIZE, Pointer, SegmentHeader, segment_file_name};

/// What a sealed segment ended up holding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSummary {
    pub segment: u32,
    pub path: PathBuf,
    pub records: u64,
    /// Record bytes, excluding the header.
    pub bytes: u64,
}

/// Sequential writer for one segment file.
///
/// The file carries an unsealed header until [`close`](Self::close) or
/// [`cycle`](Self::cycle) rewrites it, so a writer that is dropped halfway
/// leaves a segment that readers refuse.
pub struct SegmentWriter {
    dir: PathBuf,
    base: String,
    segment: u32,
    capacity: usize,
    path: PathBuf,
    out: BufWriter<File>,
    data_len: u64,
    count: u64,
}

impl SegmentWriter {
    /// Start segment `segment` of `base` in `dir`, holding at most `capacity`
    /// records. An unsealed leftover is overwritten; a sealed one is not.
    pub fn create(dir: &Path, base: &str, segment: u32, capacity: usize) -> SegmentResult<Self> {
        fs::create_dir_all(dir).map_err(|e| SegmentError::Io { source: e })?;
        let path = dir.join(segment_file_name(base, segment));
        if is_sealed(&path) {
            return Err(SegmentError::SegmentSealed {
                path: path.display().to_string(),
            });
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| SegmentError::Io { source: e })?;
        let mut out = BufWriter::new(file);
        out.write_all(&SegmentHeader::unsealed().encode())
            .map_err(|e| SegmentError::Io { source: e })?;

        tracing::debug!(path = %path.display(), segment, capacity, "opened segment for writing");
        Ok(Self {
            dir: dir.to_path_buf(),
            base: base.to_string(),
            segment,
            capacity,
            path,
            out,
            data_len: 0,
            count: 0,
        })
    }

    /// Append one edge and return where it landed.
    pub fn write(&mut self, edge: &Edge) -> SegmentResult<Pointer> {
        if self.is_full() {
            return Err(SegmentError::SegmentFull {
                segment: self.segment,
                capacity: self.capacity,
            });
        }
        let bytes = rmp_serde::to_vec_named(edge).map_err(|e| SegmentError::Serialization {
            message: e.to_string(),
        })?;
        let offset = HEADER_SIZE as u64 + self.data_len;
        self.out
            .write_all(&bytes)
            .map_err(|e| SegmentError::Io { source: e })?;
        self.data_len += bytes.len() as u64;
        self.count += 1;
        Ok(Pointer::new(self.segment, offset))
    }

    pub fn is_full(&self) -> bool {
        self.count as usize >= self.capacity
    }

    pub fn segment_id(&self) -> u32 {
        self.segment
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and seal. The segment is immutable afterwards.
    pub fn close(mut self) -> SegmentResult<SegmentSummary> {
        self.seal()
    }

    /// Seal this segment and continue in the next segment id.
    pub fn cycle(&mut self) -> SegmentResult<SegmentSummary> {
        let summary = self.seal()?;
        *self = Self::create(&self.dir, &self.base, self.segment + 1, self.capacity)?;
        Ok(summary)
    }

    fn seal(&mut self) -> SegmentResult<SegmentSummary> {
        let header = SegmentHeader {
            sealed: true,
            data_len: self.data_len,
            record_count: self.count,
        };
        self.out.flush().map_err(|e| SegmentError::Io { source: e })?;
        let file = self.out.get_mut();
        file.seek(SeekFrom::Start(0))
            .map_err(|e| SegmentError::Io { source: e })?;
        file.write_all(&header.encode())
            .map_err(|e| SegmentError::Io { source: e })?;
        file.sync_all().map_err(|e| SegmentError::Io { source: e })?;

        tracing::info!(
            path = %self.path.display(),
            segment = self.segment,
            records = self.count,
            bytes = self.data_len,
            "sealed segment"
        );
        Ok(SegmentSummary {
            segment: self.segment,
            path: self.path.clone(),
            records: self.count,
            bytes: self.data_len,
        })
    }
}

impl std::fmt::Debug for SegmentWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentWriter")
            .field("path", &self.path)
            .field("records", &self.count)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl EdgeSink for SegmentWriter {
    type Error = SegmentError;

    fn put(&mut self, edge: Edge) -> SegmentResult<()> {
        self.write(&edge).map(|_| ())
    }
}

fn is_sealed(path: &Path) -> bool {
    let mut buf = [0u8; HEADER_SIZE];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut buf))
        .ok()
        .and_then(|_| SegmentHeader::decode(&buf).ok())
        .is_some_and(|h| h.sealed)
}

/// A dedicated writer thread fed through a bounded channel.
///
/// Producers clone a [`FanInHandle`] and send edges; the thread owns the only
/// [`SegmentWriter`] and cycles to a fresh segment whenever one fills up.
pub struct FanInWriter {
    sender: Option<SyncSender<Edge>>,
    thread: Option<JoinHandle<SegmentResult<Vec<SegmentSummary>>>>,
}

/// Cloneable producer side of a [`FanInWriter`].
#[derive(Debug, Clone)]
pub struct FanInHandle {
    sender: SyncSender<Edge>,
}

impl FanInHandle {
    /// Queue an edge; blocks while the channel is full.
    pub fn send(&self, edge: Edge) -> SegmentResult<()> {
        self.sender.send(edge).map_err(|_| SegmentError::WriterGone)
    }
}

impl EdgeSink for FanInHandle {
    type Error = SegmentError;

    fn put(&mut self, edge: Edge) -> SegmentResult<()> {
        self.send(edge)
    }
}

impl FanInWriter {
    /// Move `writer` onto its own thread with a queue of `queue_depth` edges.
    pub fn spawn(writer: SegmentWriter, queue_depth: usize) -> SegmentResult<Self> {
        let (sender, receiver) = mpsc::sync_channel::<Edge>(queue_depth);
        let thread = std::thread::Builder::new()
            .name("segment-writer".into())
            .spawn(move || -> SegmentResult<Vec<SegmentSummary>> {
                let mut writer = writer;
                let mut sealed = Vec::new();
                for edge in receiver {
                    if writer.is_full() {
                        sealed.push(writer.cycle()?);
                    }
                    writer.write(&edge)?;
                }
                sealed.push(writer.close()?);
                Ok(sealed)
            })
            .map_err(|e| SegmentError::Io { source: e })?;
        Ok(Self {
            sender: Some(sender),
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> Option<FanInHandle> {
        self.sender.clone().map(|sender| FanInHandle { sender })
    }

    /// Stop accepting edges, wait for the queue to drain and return every
    /// segment sealed. All handles must have been dropped first, or this
    /// blocks until they are.
    pub fn finish(mut self) -> SegmentResult<Vec<SegmentSummary>> {
        drop(self.sender.take());
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| SegmentError::WriterGone)?,
            None => Ok(Vec::new()),
        }
    }
}

impl std::fmt::Debug for FanInWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanInWriter")
            .field("running", &self.thread.is_some())
            .finish()
    }
}
