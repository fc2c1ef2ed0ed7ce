//! Hash sharding of raw rows by grouping uri.

use std::fs::{self, File};
use std::io::{BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

use crate::error::{SegmentError, SegmentResult};

pub const DEFAULT_SHARD_COUNT: u32 = 100;

/// Shard of a grouping uri: the first eight bytes of its SHA-1 as a
/// big-endian integer, modulo `shards`.
///
/// Rows of one assertion always land in the same shard, whichever worker
/// produced them.
pub fn shard_for(grouping_uri: &str, shards: u32) -> u32 {
    let digest = Sha1::digest(grouping_uri.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % u64::from(shards.max(1))) as u32
}

pub fn shard_file_name(shard: u32) -> String {
    format!("shard_{shard:03}.tsv")
}

/// Writes each incoming row to the shard file its first column hashes to.
pub struct ShardDistributor {
    dir: PathBuf,
    files: Vec<BufWriter<File>>,
    counts: Vec<u64>,
}

impl ShardDistributor {
    /// Create (truncating) `shard_count` shard files in `dir`.
    pub fn create(dir: &Path, shard_count: u32) -> SegmentResult<Self> {
        fs::create_dir_all(dir).map_err(|e| SegmentError::Io { source: e })?;
        let shard_count = shard_count.max(1);
        let files = (0..shard_count)
            .map(|shard| {
                File::create(dir.join(shard_file_name(shard)))
                    .map(BufWriter::new)
                    .map_err(|e| SegmentError::Io { source: e })
            })
            .collect::<SegmentResult<Vec<_>>>()?;
        Ok(Self {
            dir: dir.to_path_buf(),
            counts: vec![0; files.len()],
            files,
        })
    }

    pub fn shard_count(&self) -> u32 {
        self.files.len() as u32
    }

    /// Append one row to its shard; returns the shard id.
    pub fn route(&mut self, line: &str) -> SegmentResult<u32> {
        let line = line.trim_end_matches(['\r', '\n']);
        let key = line.split('\t').next().unwrap_or_default();
        let shard = shard_for(key, self.shard_count());
        let out = &mut self.files[shard as usize];
        out.write_all(line.as_bytes())
            .and_then(|()| out.write_all(b"\n"))
            .map_err(|e| SegmentError::Io { source: e })?;
        self.counts[shard as usize] += 1;
        Ok(shard)
    }

    /// Route every non-blank line of `input`.
    pub fn route_all<R: BufRead>(&mut self, input: R) -> SegmentResult<u64> {
        let mut routed = 0u64;
        for line in input.lines() {
            let line = line.map_err(|e| SegmentError::Io { source: e })?;
            if line.trim().is_empty() {
                continue;
            }
            self.route(&line)?;
            routed += 1;
        }
        Ok(routed)
    }

    /// Flush every shard; returns `(shard, path, rows)` per shard.
    pub fn finish(self) -> SegmentResult<Vec<(u32, PathBuf, u64)>> {
        let mut out = Vec::with_capacity(self.files.len());
        for (shard, (mut file, rows)) in self.files.into_iter().zip(self.counts).enumerate() {
            file.flush().map_err(|e| SegmentError::Io { source: e })?;
            let shard = shard as u32;
            out.push((shard, self.dir.join(shard_file_name(shard)), rows));
        }
        let total: u64 = out.iter().map(|(_, _, rows)| rows).sum();
        tracing::info!(dir = %self.dir.display(), shards = out.len(), rows = total, "distributed rows");
        Ok(out)
    }
}

impl std::fmt::Debug for ShardDistributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardDistributor")
            .field("dir", &self.dir)
            .field("shards", &self.files.len())
            .finish()
    }
}
