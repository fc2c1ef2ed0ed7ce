// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # edgestore
//!
//! Storage and retrieval engine for a large weighted graph of assertions
//! between concept URIs, in the style of ConceptNet.
//!
//! ## Architecture
//!
//! - **URIs** (`uri`): path-string algebra, compound and conjunction URIs
//! - **Edges** (`edge`): validated, content-hashed assertions with provenance
//! - **Combiner** (`combine`): streaming group-by that folds observations into edges
//! - **Segments** (`segment`): append-only, write-once record files read via mmap
//! - **Index** (`index`): prefix index from URI strings to weight-ordered pointers,
//!   with in-memory, redb and memory-mapped cursor backends
//! - **Queries** (`query`): `AssertionFinder` lookups, criteria queries, random edges
//! - **Pipeline** (`pipeline`): distribute → combine per shard → index
//!
//! ## Library usage
//!
//! ```no_run
//! use std::path::{Path, PathBuf};
//! use edgestore::config::StoreConfig;
//! use edgestore::paths::StorePaths;
//! use edgestore::pipeline;
//! use edgestore::query::AssertionFinder;
//!
//! let paths = StorePaths::new(Path::new("/data/edges"));
//! let config = StoreConfig::default();
//! pipeline::build(&[PathBuf::from("raw.tsv")], &paths, &config, Default::default()).unwrap();
//!
//! let finder = AssertionFinder::open(&paths.segments_dir, &paths.index_dir).unwrap();
//! for edge in finder.lookup("/c/en/dog", 20, 0).unwrap().edges {
//!     println!("{edge}");
//! }
//! ```

pub mod combine;
pub mod config;
pub mod edge;
pub mod error;
pub mod index;
pub mod paths;
pub mod pipeline;
pub mod query;
pub mod segment;
pub mod uri;

pub use edge::{Edge, EdgeBuilder, ProvenanceRecord, Sources};
pub use error::{StoreError, StoreResult};
pub use query::{AssertionFinder, Criterion, Page};
pub use segment::Pointer;
