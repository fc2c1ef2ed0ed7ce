//! Rich diagnostic error types for the edge store.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes, help text, and source chains so operators know exactly
//! what went wrong and how to fix it.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the edge store.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain (error codes, help text, sources) through to the user.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Edge(#[from] EdgeError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Row(#[from] RowParseError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Segment(#[from] SegmentError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Path(#[from] crate::paths::PathError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Crate-wide result alias.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Edge builder errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum EdgeError {
    #[error("invalid edge input: {message}")]
    #[diagnostic(
        code(edgestore::edge::invalid_input),
        help(
            "Edges need a relation path starting with `/r/`, non-empty start, end \
             and dataset paths, and at least one non-empty source. Fix the importer \
             that produced this edge."
        )
    )]
    InvalidInput { message: String },
}

pub type EdgeResult<T> = std::result::Result<T, EdgeError>;

// ---------------------------------------------------------------------------
// Combiner row errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum RowParseError {
    #[error("row {line}: expected {expected} tab-separated columns, found {found}")]
    #[diagnostic(
        code(edgestore::row::columns),
        help("Raw rows are `uri rel start end info_json`; flat rows have nine columns.")
    )]
    Columns {
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("row {line}: malformed info payload: {message}")]
    #[diagnostic(
        code(edgestore::row::payload),
        help(
            "The fifth column must be a JSON object with `weight`, `license`, \
             `dataset`, `sources` and an optional `surfaceText`."
        )
    )]
    Payload { line: usize, message: String },

    #[error("row {line}: invalid weight {value:?}")]
    #[diagnostic(
        code(edgestore::row::weight),
        help("Weights must be finite decimal numbers.")
    )]
    Weight { line: usize, value: String },

    #[error("row {line}: {source}")]
    #[diagnostic(code(edgestore::row::edge))]
    Edge {
        line: usize,
        #[source]
        source: EdgeError,
    },
}

// ---------------------------------------------------------------------------
// Segment errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum SegmentError {
    #[error("segment unavailable: {path}: {reason}")]
    #[diagnostic(
        code(edgestore::segment::unavailable),
        help(
            "The segment file is missing, was never sealed, or is truncated. \
             Rebuild the store with `edgestore build`, or restore the file."
        )
    )]
    SegmentUnavailable { path: String, reason: String },

    #[error("corrupt record in segment {segment} at byte offset {offset}: {message}")]
    #[diagnostic(
        code(edgestore::segment::corrupt_record),
        help(
            "The record at this pointer could not be decoded. The index may have \
             been built against different segments; rebuild it with `edgestore index`."
        )
    )]
    CorruptRecord {
        segment: u32,
        offset: u64,
        message: String,
    },

    #[error("segment {segment} is full ({capacity} records)")]
    #[diagnostic(
        code(edgestore::segment::full),
        help("Call `cycle()` to seal this segment and continue in the next one.")
    )]
    SegmentFull { segment: u32, capacity: usize },

    #[error("shard {shard} filled every segment up to id {last}")]
    #[diagnostic(
        code(edgestore::segment::shard_exhausted),
        help(
            "The shard produced more edges than `segments_per_shard * segment_capacity`. \
             Raise either setting, or the shard count."
        )
    )]
    ShardExhausted { shard: u32, last: u32 },

    #[error("segment {path} is already sealed")]
    #[diagnostic(
        code(edgestore::segment::sealed),
        help(
            "Segments are write-once. Remove the old segment directory before \
             rebuilding, or write to a new segment id."
        )
    )]
    SegmentSealed { path: String },

    #[error("fan-in writer has shut down")]
    #[diagnostic(
        code(edgestore::segment::writer_gone),
        help("The writer thread exited early; check the log for its error.")
    )]
    WriterGone,

    #[error("I/O error: {source}")]
    #[diagnostic(
        code(edgestore::segment::io),
        help(
            "A filesystem operation failed. Check that the data directory exists, \
             has correct permissions, and that the disk is not full."
        )
    )]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {message}")]
    #[diagnostic(
        code(edgestore::segment::serde),
        help("Failed to encode an edge record.")
    )]
    Serialization { message: String },
}

pub type SegmentResult<T> = std::result::Result<T, SegmentError>;

// ---------------------------------------------------------------------------
// Index errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum IndexError {
    #[error("index unavailable: {path}: {reason}")]
    #[diagnostic(
        code(edgestore::index::unavailable),
        help("Build the index first with `edgestore index`, or download a prebuilt one.")
    )]
    IndexUnavailable { path: String, reason: String },

    #[error("redb error: {message}")]
    #[diagnostic(
        code(edgestore::index::redb),
        help(
            "The embedded database encountered a transaction error. \
             This may indicate corruption; rebuild the index from the segments."
        )
    )]
    Backend { message: String },

    #[error("corrupt index {path}: {message}")]
    #[diagnostic(
        code(edgestore::index::corrupt),
        help("The index file is damaged or from an incompatible version. Rebuild it.")
    )]
    CorruptIndex { path: String, message: String },

    #[error("I/O error: {source}")]
    #[diagnostic(
        code(edgestore::index::io),
        help("A filesystem operation on the index failed. Check permissions and free space.")
    )]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {message}")]
    #[diagnostic(
        code(edgestore::index::serde),
        help("Failed to encode or decode the index manifest.")
    )]
    Serialization { message: String },
}

pub type IndexResult<T> = std::result::Result<T, IndexError>;

// ---------------------------------------------------------------------------
// Query errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum QueryError {
    #[error("unknown query criterion: {field}")]
    #[diagnostic(
        code(edgestore::query::unknown_criterion),
        help(
            "Valid criteria are: rel, start, end, node, dataset, license, sources, \
             surfaceText, uri."
        )
    )]
    UnknownCriterion { field: String },

    #[error("no searchable criterion in query")]
    #[diagnostic(
        code(edgestore::query::no_searchable_criterion),
        help(
            "At least one of rel, start, end, node, dataset, sources or uri must be \
             given; license and surfaceText alone cannot be looked up in the index."
        )
    )]
    NoSearchableCriterion,

    #[error(transparent)]
    #[diagnostic(transparent)]
    Segment(#[from] SegmentError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Index(#[from] IndexError),
}

pub type QueryResult<T> = std::result::Result<T, QueryError>;

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config: {path}")]
    #[diagnostic(
        code(edgestore::config::read),
        help("Ensure the config file exists and is readable.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {message}")]
    #[diagnostic(
        code(edgestore::config::parse),
        help("Check the TOML syntax in the config file.")
    )]
    Parse { path: String, message: String },

    #[error("failed to write config: {path}")]
    #[diagnostic(
        code(edgestore::config::write),
        help("Ensure you have write permissions to the config directory.")
    )]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config value for `{field}`: {message}")]
    #[diagnostic(code(edgestore::config::invalid))]
    Invalid { field: String, message: String },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// ---------------------------------------------------------------------------
// Pipeline errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error("I/O error on {path}: {source}")]
    #[diagnostic(
        code(edgestore::pipeline::io),
        help("Check that the input files exist and the output directory is writable.")
    )]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Segment(#[from] SegmentError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Path(#[from] crate::paths::PathError),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_error_wraps_segment_error() {
        let err: QueryError = SegmentError::SegmentUnavailable {
            path: "assertions_007.seg".into(),
            reason: "not loaded".into(),
        }
        .into();
        assert!(matches!(err, QueryError::Segment(_)));
        assert_eq!(err.to_string(), "segment unavailable: assertions_007.seg: not loaded");
    }

    #[test]
    fn diagnostic_codes_are_namespaced() {
        let err = StoreError::from(QueryError::NoSearchableCriterion);
        let code = err.code().map(|c| c.to_string()).unwrap_or_default();
        assert_eq!(code, "edgestore::query::no_searchable_criterion");
    }
}
