//! Query engine over the segment store and prefix index.
//!
//! [`AssertionFinder::lookup`] answers a single uri or feature string;
//! [`AssertionFinder::query`] answers a conjunction of field criteria by
//! scanning the index under the most specific criterion and re-checking every
//! candidate edge against all of them.
//!
//! A value ending in `/.` asks for an exact match: `/c/en/dog/.` matches only
//! `/c/en/dog`, while `/c/en/dog` also matches `/c/en/dog/n/animal`.

use std::collections::HashSet;
use std::fmt;
use std::ops::ControlFlow;
use std::path::Path;
use std::str::FromStr;

use rand::Rng;

use crate::edge::Edge;
use crate::error::{QueryError, QueryResult, SegmentError};
use crate::index::{self, IndexManifest, LoadedIndex, PrefixIndex, key_matches_prefix};
use crate::segment::{Pointer, SegmentStore};

/// Suffix that turns a prefix query into an exact one.
pub const EXACT_SUFFIX: &str = "/.";

/// Edge fields a query may constrain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Criterion {
    Rel,
    Start,
    End,
    /// Start or end.
    Node,
    Dataset,
    License,
    Sources,
    SurfaceText,
    Uri,
}

impl Criterion {
    pub const ALL: [Criterion; 9] = [
        Criterion::Rel,
        Criterion::Start,
        Criterion::End,
        Criterion::Node,
        Criterion::Dataset,
        Criterion::License,
        Criterion::Sources,
        Criterion::SurfaceText,
        Criterion::Uri,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Criterion::Rel => "rel",
            Criterion::Start => "start",
            Criterion::End => "end",
            Criterion::Node => "node",
            Criterion::Dataset => "dataset",
            Criterion::License => "license",
            Criterion::Sources => "sources",
            Criterion::SurfaceText => "surfaceText",
            Criterion::Uri => "uri",
        }
    }

    /// Whether values of this field are keys in the prefix index.
    pub fn is_indexable(self) -> bool {
        !matches!(self, Criterion::License | Criterion::SurfaceText)
    }

    /// The edge's value(s) for this field.
    pub fn values(self, edge: &Edge) -> Vec<String> {
        match self {
            Criterion::Rel => vec![edge.rel().to_string()],
            Criterion::Start => vec![edge.start().to_string()],
            Criterion::End => vec![edge.end().to_string()],
            Criterion::Node => vec![edge.start().to_string(), edge.end().to_string()],
            Criterion::Dataset => vec![edge.dataset().to_string()],
            Criterion::License => vec![edge.license().to_string()],
            Criterion::Sources => edge.sources().provenance_strings(),
            Criterion::SurfaceText => edge.surface_text().map(str::to_string).into_iter().collect(),
            Criterion::Uri => vec![edge.uri().to_string()],
        }
    }

    pub fn matches(self, edge: &Edge, query: &str) -> bool {
        self.values(edge).iter().any(|value| field_match(value, query))
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Criterion {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Criterion::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| QueryError::UnknownCriterion {
                field: s.to_string(),
            })
    }
}

/// Does one field value satisfy one query value?
///
/// Trailing slashes on the query are ignored. `/.` demands equality;
/// otherwise the value must equal the query or extend it past a `/`.
pub fn field_match(value: &str, query: &str) -> bool {
    let query = query.trim_end_matches('/');
    match query.strip_suffix(EXACT_SUFFIX) {
        Some(exact) => value == exact,
        None => key_matches_prefix(value, query),
    }
}

/// Split a lookup value into its index key and whether it is exact.
fn split_exact(query: &str) -> (&str, bool) {
    let query = query.trim_end_matches('/');
    match query.strip_suffix(EXACT_SUFFIX) {
        Some(key) => (key, true),
        None => (query, false),
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub edges: Vec<Edge>,
    pub offset: usize,
    pub limit: usize,
    /// Exactly `limit` results came back, so there may be more.
    pub has_more: bool,
}

impl Page {
    fn from_matches(mut matches: Vec<Edge>, offset: usize, limit: usize) -> Self {
        let edges = if offset < matches.len() {
            matches.split_off(offset)
        } else {
            Vec::new()
        };
        let has_more = limit > 0 && edges.len() == limit;
        Self {
            edges,
            offset,
            limit,
            has_more,
        }
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

/// Read-only query front end. Safe to share across threads once opened.
pub struct AssertionFinder {
    segments: SegmentStore,
    index: Box<dyn PrefixIndex>,
    manifest: Option<IndexManifest>,
}

impl AssertionFinder {
    pub fn new(segments: SegmentStore, index: Box<dyn PrefixIndex>) -> Self {
        Self {
            segments,
            index,
            manifest: None,
        }
    }

    /// Open the index in `index_dir` and the segments it was built over.
    pub fn open(segment_dir: &Path, index_dir: &Path) -> QueryResult<Self> {
        let LoadedIndex { manifest, index } = index::open_index(index_dir)?;
        let segments = SegmentStore::open(segment_dir, &manifest.segment_base)?;
        Ok(Self {
            segments,
            index,
            manifest: Some(manifest),
        })
    }

    pub fn segments(&self) -> &SegmentStore {
        &self.segments
    }

    pub fn index(&self) -> &dyn PrefixIndex {
        self.index.as_ref()
    }

    pub fn manifest(&self) -> Option<&IndexManifest> {
        self.manifest.as_ref()
    }

    /// Every edge filed under a uri, feature or other indexed string.
    ///
    /// With a `/.` suffix only edges with a field exactly equal to the value
    /// are returned.
    pub fn lookup(&self, query: &str, limit: usize, offset: usize) -> QueryResult<Page> {
        let (key, exact) = split_exact(query);
        if exact {
            self.collect(key, true, limit, offset, &|edge| {
                index::exact_values(edge).iter().any(|v| v == key)
            })
        } else {
            self.collect(key, false, limit, offset, &|_| true)
        }
    }

    /// [`lookup`](Self::lookup) without prefix expansion.
    pub fn lookup_exact_value(&self, value: &str, limit: usize, offset: usize) -> QueryResult<Page> {
        let value = value.trim_end_matches('/');
        if value.ends_with(EXACT_SUFFIX) {
            return self.lookup(value, limit, offset);
        }
        self.lookup(&format!("{value}{EXACT_SUFFIX}"), limit, offset)
    }

    /// Edges matching every `(field, value)` criterion.
    ///
    /// Fails with [`QueryError::UnknownCriterion`] for a field outside the
    /// closed set, and [`QueryError::NoSearchableCriterion`] when only
    /// unindexed fields are given.
    pub fn query<I, K, V>(&self, criteria: I, limit: usize, offset: usize) -> QueryResult<Page>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let criteria = criteria
            .into_iter()
            .map(|(k, v)| -> QueryResult<(Criterion, String)> {
                Ok((k.as_ref().parse()?, v.into()))
            })
            .collect::<QueryResult<Vec<_>>>()?;
        self.query_criteria(&criteria, limit, offset)
    }

    /// [`query`](Self::query) over already-parsed criteria.
    pub fn query_criteria(
        &self,
        criteria: &[(Criterion, String)],
        limit: usize,
        offset: usize,
    ) -> QueryResult<Page> {
        // The longest value is taken as the most selective.
        let primary = criteria
            .iter()
            .filter(|(c, _)| c.is_indexable())
            .fold(None::<&(Criterion, String)>, |best, cand| match best {
                Some(b) if b.1.len() >= cand.1.len() => Some(b),
                _ => Some(cand),
            })
            .ok_or(QueryError::NoSearchableCriterion)?;

        let (key, exact) = split_exact(&primary.1);
        tracing::debug!(primary = %primary.0, key, exact, criteria = criteria.len(), "planned query");
        self.collect(key, exact, limit, offset, &|edge| {
            criteria.iter().all(|(c, v)| c.matches(edge, v))
        })
    }

    /// Scan the index under `key`, dereference each distinct pointer and keep
    /// edges passing `accept` until `offset + limit` are found.
    fn collect(
        &self,
        key: &str,
        exact: bool,
        limit: usize,
        offset: usize,
        accept: &dyn Fn(&Edge) -> bool,
    ) -> QueryResult<Page> {
        let wanted = offset.saturating_add(limit);
        let mut matches: Vec<Edge> = Vec::new();
        if limit == 0 {
            return Ok(Page::from_matches(matches, offset, limit));
        }

        let mut seen: HashSet<Pointer> = HashSet::new();
        let mut failure: Option<SegmentError> = None;
        let mut consider = |pointer: Pointer| -> ControlFlow<()> {
            if !seen.insert(pointer) {
                return ControlFlow::Continue(());
            }
            match self.segments.read(pointer) {
                Ok(edge) => {
                    if accept(&edge) {
                        matches.push(edge);
                    }
                    if matches.len() >= wanted {
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                }
                Err(e) => {
                    failure = Some(e);
                    ControlFlow::Break(())
                }
            }
        };

        if exact {
            self.index.scan_exact(key, &mut |entry| consider(entry.pointer))?;
        } else {
            self.index
                .scan_prefix(key, &mut |_, entry| consider(entry.pointer))?;
        }

        if let Some(e) = failure {
            tracing::warn!(key, error = %e, "query aborted on unreadable record");
            return Err(e.into());
        }
        Ok(Page::from_matches(matches, offset, limit))
    }

    /// A random stored edge, segments weighted by their record counts.
    pub fn lookup_random<R: Rng + ?Sized>(&self, rng: &mut R) -> QueryResult<Option<Edge>> {
        Ok(self.segments.random_edge(rng)?)
    }
}

impl fmt::Debug for AssertionFinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssertionFinder")
            .field("segments", &self.segments)
            .field("backend", &self.index.backend())
            .field("manifest", &self.manifest)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::test_edge;
    use crate::index::{IndexWriter, index_edge, mem::MemIndex};
    use crate::segment::SegmentWriter;
    use tempfile::TempDir;

    fn finder(dir: &TempDir, edges: &[Edge]) -> AssertionFinder {
        let mut writer = SegmentWriter::create(dir.path(), "q", 0, 1000).unwrap();
        let mut index = MemIndex::new();
        for edge in edges {
            let ptr = writer.write(edge).unwrap();
            index_edge(&mut index, edge, ptr).unwrap();
        }
        writer.close().unwrap();
        let segments = SegmentStore::open(dir.path(), "q").unwrap();
        AssertionFinder::new(segments, Box::new(index))
    }

    /// Like [`finder`], plus one index entry under `key` that points at
    /// `bad` and sorts ahead of every real edge.
    fn finder_with_bad_pointer(dir: &TempDir, key: &str, bad: Pointer) -> AssertionFinder {
        let mut writer = SegmentWriter::create(dir.path(), "q", 0, 1000).unwrap();
        let mut index = MemIndex::new();
        for edge in &sample() {
            let ptr = writer.write(edge).unwrap();
            index_edge(&mut index, edge, ptr).unwrap();
        }
        writer.close().unwrap();
        index.insert(key, 0.0, bad).unwrap();
        let segments = SegmentStore::open(dir.path(), "q").unwrap();
        AssertionFinder::new(segments, Box::new(index))
    }

    fn sample() -> Vec<Edge> {
        vec![
            test_edge("/r/IsA", "/c/en/dog", "/c/en/animal", 3.0),
            test_edge("/r/IsA", "/c/en/dog/n/canine", "/c/en/pet", 2.0),
            test_edge("/r/IsA", "/c/en/doghouse", "/c/en/building", 1.0),
            test_edge("/r/AtLocation", "/c/en/cat", "/c/en/doghouse", 1.5),
            test_edge("/r/IsA", "/c/en/cat", "/c/en/animal", 0.5),
        ]
    }

    #[test]
    fn field_match_rules() {
        assert!(field_match("/c/en/dog", "/c/en/dog"));
        assert!(field_match("/c/en/dog/n/animal", "/c/en/dog"));
        assert!(field_match("/c/en/dog/n/animal", "/c/en/dog/"));
        assert!(!field_match("/c/en/dogs", "/c/en/dog"));
        assert!(field_match("/c/en/dog", "/c/en/dog/."));
        assert!(!field_match("/c/en/dog/n", "/c/en/dog/."));
    }

    #[test]
    fn criteria_parse_as_closed_set() {
        assert_eq!("surfaceText".parse::<Criterion>().unwrap(), Criterion::SurfaceText);
        assert!(matches!(
            "weight".parse::<Criterion>().unwrap_err(),
            QueryError::UnknownCriterion { field } if field == "weight"
        ));
        assert!(Criterion::Node.is_indexable());
        assert!(!Criterion::License.is_indexable());
    }

    #[test]
    fn lookup_prefix_excludes_longer_words() {
        let dir = TempDir::new().unwrap();
        let f = finder(&dir, &sample());
        let page = f.lookup("/c/en/dog", 10, 0).unwrap();
        let starts: Vec<_> = page.edges.iter().map(|e| e.start()).collect();
        assert_eq!(page.len(), 2);
        assert!(starts.contains(&"/c/en/dog"));
        assert!(starts.contains(&"/c/en/dog/n/canine"));
    }

    #[test]
    fn lookup_exact_suffix() {
        let dir = TempDir::new().unwrap();
        let f = finder(&dir, &sample());
        let page = f.lookup("/c/en/dog/.", 10, 0).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page.edges[0].start(), "/c/en/dog");
        assert_eq!(f.lookup_exact_value("/c/en/dog", 10, 0).unwrap(), page);
    }

    #[test]
    fn lookup_by_feature_string() {
        let dir = TempDir::new().unwrap();
        let f = finder(&dir, &sample());
        let page = f.lookup("- /r/IsA /c/en/animal", 10, 0).unwrap();
        assert_eq!(page.len(), 2);
    }

    #[test]
    fn query_rechecks_every_criterion() {
        let dir = TempDir::new().unwrap();
        let f = finder(&dir, &sample());
        let page = f
            .query([("rel", "/r/IsA"), ("end", "/c/en/animal")], 10, 0)
            .unwrap();
        assert_eq!(page.len(), 2);
        assert!(page.edges.iter().all(|e| e.rel() == "/r/IsA" && e.end() == "/c/en/animal"));

        let page = f.query([("node", "/c/en/doghouse")], 10, 0).unwrap();
        assert_eq!(page.len(), 2);

        let page = f
            .query([("start", "/c/en/dog/."), ("license", "cc:by/4.0")], 10, 0)
            .unwrap();
        assert_eq!(page.len(), 1);
    }

    #[test]
    fn query_error_cases() {
        let dir = TempDir::new().unwrap();
        let f = finder(&dir, &sample());
        assert!(matches!(
            f.query([("colour", "red")], 10, 0).unwrap_err(),
            QueryError::UnknownCriterion { .. }
        ));
        assert!(matches!(
            f.query([("license", "cc:by/4.0")], 10, 0).unwrap_err(),
            QueryError::NoSearchableCriterion
        ));
    }

    #[test]
    fn pagination_is_a_window() {
        let dir = TempDir::new().unwrap();
        let f = finder(&dir, &sample());
        let all = f.query([("rel", "/r")], 100, 0).unwrap();
        assert_eq!(all.len(), 5);
        assert!(!all.has_more);
        let window = f.query([("rel", "/r")], 2, 1).unwrap();
        assert!(window.has_more);
        let prefix = f.query([("rel", "/r")], 3, 0).unwrap();
        assert_eq!(window.edges, prefix.edges[1..]);
        assert!(f.query([("rel", "/r")], 2, 10).unwrap().is_empty());
    }

    #[test]
    fn strongest_edges_first_under_one_key() {
        let dir = TempDir::new().unwrap();
        let f = finder(&dir, &sample());
        let page = f.lookup("/c/en/animal/.", 10, 0).unwrap();
        let weights: Vec<f64> = page.edges.iter().map(|e| e.weight()).collect();
        assert_eq!(weights, vec![3.0, 0.5]);
    }

    #[test]
    fn corrupt_pointer_fails_only_its_own_lookup() {
        let dir = TempDir::new().unwrap();
        let f = finder_with_bad_pointer(&dir, "/c/en/dog", Pointer::new(0, 1 << 40));

        assert!(matches!(
            f.lookup("/c/en/dog", 10, 0).unwrap_err(),
            QueryError::Segment(SegmentError::CorruptRecord { segment: 0, .. })
        ));
        assert!(matches!(
            f.query([("start", "/c/en/dog")], 10, 0).unwrap_err(),
            QueryError::Segment(SegmentError::CorruptRecord { .. })
        ));

        // The finder keeps serving keys that do not reach the bad entry.
        let page = f.lookup("/c/en/animal/.", 10, 0).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page.edges[0].start(), "/c/en/dog");
        assert_eq!(f.lookup("/c/en/cat", 10, 0).unwrap().len(), 2);
    }

    #[test]
    fn dangling_segment_pointer_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let f = finder_with_bad_pointer(&dir, "/c/en/cat", Pointer::new(7, 32));

        assert!(matches!(
            f.lookup("/c/en/cat/.", 10, 0).unwrap_err(),
            QueryError::Segment(SegmentError::SegmentUnavailable { .. })
        ));
        assert!(f
            .query([("node", "/c/en/cat"), ("rel", "/r/IsA")], 10, 0)
            .is_err());
        assert_eq!(f.lookup("/c/en/dog", 10, 0).unwrap().len(), 2);
        assert!(f.lookup("/c/en/cat/.", 10, 0).is_err());
    }

    #[test]
    fn random_lookup_returns_a_stored_edge() {
        use rand::SeedableRng;
        let dir = TempDir::new().unwrap();
        let edges = sample();
        let f = finder(&dir, &edges);
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..10 {
            let edge = f.lookup_random(&mut rng).unwrap().unwrap();
            assert!(edges.contains(&edge));
        }
    }
}
