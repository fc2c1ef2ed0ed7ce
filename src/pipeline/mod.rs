//! Batch build pipeline: distribute → combine per shard → index.
//!
//! Raw rows are hashed into shard files by grouping uri, so every shard owns
//! a disjoint set of assertions. Shards are then sorted and combined in
//! parallel, each worker owning one accepted and one reject segment writer
//! that it cycles through its own range of segment ids, and finally a single
//! pass indexes every accepted segment.

use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use rayon::prelude::*;

use crate::combine::{CombineStats, Combiner, EdgeSink, RowFormat, parse_rows};
use crate::config::StoreConfig;
use crate::edge::Edge;
use crate::error::{PipelineError, PipelineResult, SegmentError, SegmentResult};
use crate::index::{self, IndexManifest};
use crate::paths::StorePaths;
use crate::segment::{SegmentStore, SegmentSummary, SegmentWriter, ShardDistributor, shard::shard_file_name};

/// Result of combining one shard.
#[derive(Debug, Clone)]
pub struct ShardOutcome {
    pub shard: u32,
    pub stats: CombineStats,
    /// Sealed accepted segments, in id order.
    pub accepted: Vec<SegmentSummary>,
    pub rejected: Vec<SegmentSummary>,
}

impl ShardOutcome {
    pub fn accepted_records(&self) -> u64 {
        self.accepted.iter().map(|s| s.records).sum()
    }

    pub fn rejected_records(&self) -> u64 {
        self.rejected.iter().map(|s| s.records).sum()
    }
}

/// Totals for a full build.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub rows: u64,
    pub shards: Vec<ShardOutcome>,
    pub index: IndexManifest,
}

impl BuildReport {
    pub fn accepted(&self) -> usize {
        self.shards.iter().map(|s| s.stats.accepted).sum()
    }

    pub fn rejected(&self) -> usize {
        self.shards.iter().map(|s| s.stats.rejected).sum()
    }

    pub fn dropped_rows(&self) -> usize {
        self.shards.iter().map(|s| s.stats.dropped_rows).sum()
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> PipelineError + '_ {
    move |e| PipelineError::Io {
        path: path.display().to_string(),
        source: e,
    }
}

/// Empty a directory, creating it if needed.
fn reset_dir(dir: &Path) -> PipelineResult<()> {
    if dir.exists() {
        fs::remove_dir_all(dir).map_err(io_err(dir))?;
    }
    fs::create_dir_all(dir).map_err(io_err(dir))
}

/// One shard's writer for one directory, cycling through the shard's range of
/// segment ids as segments fill.
struct ShardSegments {
    shard: u32,
    last: u32,
    writer: SegmentWriter,
    sealed: Vec<SegmentSummary>,
}

impl ShardSegments {
    fn create(dir: &Path, shard: u32, config: &StoreConfig) -> SegmentResult<Self> {
        let ids = config.shard_segments(shard);
        Ok(Self {
            shard,
            last: *ids.end(),
            writer: SegmentWriter::create(dir, &config.segment_base, *ids.start(), config.segment_capacity)?,
            sealed: Vec::new(),
        })
    }

    fn close(mut self) -> SegmentResult<Vec<SegmentSummary>> {
        self.sealed.push(self.writer.close()?);
        Ok(self.sealed)
    }
}

impl EdgeSink for ShardSegments {
    type Error = SegmentError;

    fn put(&mut self, edge: Edge) -> SegmentResult<()> {
        if self.writer.is_full() {
            if self.writer.segment_id() >= self.last {
                return Err(SegmentError::ShardExhausted {
                    shard: self.shard,
                    last: self.last,
                });
            }
            self.sealed.push(self.writer.cycle()?);
        }
        self.writer.write(&edge).map(|_| ())
    }
}

/// Route every row of `inputs` into the store's shard files.
pub fn distribute(inputs: &[PathBuf], paths: &StorePaths, shard_count: u32) -> PipelineResult<u64> {
    reset_dir(&paths.shards_dir)?;
    let mut distributor = ShardDistributor::create(&paths.shards_dir, shard_count)?;
    let mut rows = 0;
    for input in inputs {
        let file = File::open(input).map_err(io_err(input))?;
        let routed = distributor.route_all(BufReader::new(file))?;
        tracing::info!(input = %input.display(), rows = routed, "distributed input");
        rows += routed;
    }
    distributor.finish()?;
    Ok(rows)
}

/// Read, sort and combine one file of raw rows into shard `shard`'s segments
/// of the accepted and reject directories.
pub fn combine_file(
    input: &Path,
    shard: u32,
    paths: &StorePaths,
    config: &StoreConfig,
    format: RowFormat,
) -> PipelineResult<ShardOutcome> {
    let file = File::open(input).map_err(io_err(input))?;
    let mut lines = BufReader::new(file)
        .lines()
        .collect::<Result<Vec<String>, _>>()
        .map_err(io_err(input))?;
    // Byte order, so every group is contiguous.
    lines.sort_unstable();

    let mut accepted = ShardSegments::create(&paths.segments_dir, shard, config)?;
    let mut rejected = ShardSegments::create(&paths.rejects_dir, shard, config)?;

    let combiner = Combiner::new(config.concept_filter());
    let stats = combiner.combine(
        parse_rows(lines.iter().map(String::as_str), format),
        &mut accepted,
        &mut rejected,
    )?;

    let outcome = ShardOutcome {
        shard,
        stats,
        accepted: accepted.close()?,
        rejected: rejected.close()?,
    };
    tracing::info!(
        shard,
        segments = outcome.accepted.len(),
        groups = stats.groups,
        accepted = stats.accepted,
        rejected = stats.rejected,
        dropped_rows = stats.dropped_rows,
        "combined shard"
    );
    Ok(outcome)
}

/// Combine every shard file in parallel, one worker per shard.
pub fn combine_shards(
    paths: &StorePaths,
    config: &StoreConfig,
    format: RowFormat,
) -> PipelineResult<Vec<ShardOutcome>> {
    reset_dir(&paths.segments_dir)?;
    reset_dir(&paths.rejects_dir)?;

    let shards: Vec<(u32, PathBuf)> = (0..config.shard_count)
        .map(|shard| (shard, paths.shards_dir.join(shard_file_name(shard))))
        .filter(|(_, path)| path.exists())
        .collect();

    let mut outcomes = shards
        .par_iter()
        .map(|(shard, path)| combine_file(path, *shard, paths, config, format))
        .collect::<PipelineResult<Vec<_>>>()?;
    outcomes.sort_by_key(|o| o.shard);
    Ok(outcomes)
}

/// Index every accepted segment with the configured backend.
pub fn build_index(paths: &StorePaths, config: &StoreConfig) -> PipelineResult<IndexManifest> {
    let segments = SegmentStore::open(&paths.segments_dir, &config.segment_base)?;
    let mut writer = index::create_index(&paths.index_dir, config.index_backend, config.index_batch_size)?;

    let mut edges = 0u64;
    let mut skipped = 0u64;
    for segment in segments.segments() {
        for record in segment.iter() {
            let (pointer, edge) = record?;
            if index::index_edge(writer.as_mut(), &edge, pointer)? == 0 {
                skipped += 1;
            } else {
                edges += 1;
            }
        }
        tracing::debug!(segment = segment.segment_id(), edges, "indexed segment");
    }

    let manifest = writer.finish(&config.segment_base, edges)?;
    tracing::info!(
        backend = %manifest.backend,
        edges,
        skipped,
        keys = manifest.keys,
        entries = manifest.entries,
        "built index"
    );
    Ok(manifest)
}

/// Full rebuild of a store from raw input files.
pub fn build(
    inputs: &[PathBuf],
    paths: &StorePaths,
    config: &StoreConfig,
    format: RowFormat,
) -> PipelineResult<BuildReport> {
    paths.ensure_dirs()?;
    let rows = distribute(inputs, paths, config.shard_count)?;
    let shards = combine_shards(paths, config, format)?;
    let index = build_index(paths, config)?;
    Ok(BuildReport {
        rows,
        shards,
        index,
    })
}
