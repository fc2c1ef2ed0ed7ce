//! The query property suite, run against every index backend.
//!
//! Each backend indexes the same segments; every lookup must give the same
//! logical answer regardless of which one serves it.

use std::path::Path;

use edgestore::edge::EdgeBuilder;
use edgestore::error::{IndexError, QueryError};
use edgestore::index::{self, BackendKind};
use edgestore::query::AssertionFinder;
use edgestore::segment::SegmentWriter;
use edgestore::uri::Licenses;
use edgestore::Edge;

const BACKENDS: [BackendKind; 3] = [BackendKind::Memory, BackendKind::Redb, BackendKind::Cursor];

fn edge(rel: &str, start: &str, end: &str, weight: f64) -> Edge {
    EdgeBuilder::new(
        rel,
        start,
        end,
        "/d/conceptnet/4/en",
        Licenses::CC_ATTRIBUTION,
        vec!["/s/contributor/omcs/alice"],
    )
    .weight(weight)
    .build()
    .unwrap()
}

fn corpus() -> Vec<Edge> {
    vec![
        edge("/r/IsA", "/c/en/dog", "/c/en/animal", 2.0),
        edge("/r/IsA", "/c/en/dog/n/animal", "/c/en/pet", 1.0),
        edge("/r/CapableOf", "/c/en/dog", "/c/en/bark", 4.0),
        edge("/r/AtLocation", "/c/en/doghouse", "/c/en/yard", 1.5),
        edge("/r/IsA", "/c/en/cat", "/c/en/animal", 3.0),
        edge("/r/RelatedTo", "/c/en/dogs", "/c/en/dog", 0.5),
        edge("/r/IsA", "/c/en/wolf", "/c/en/animal", 1.0),
        edge("/r/Antonym", "/c/en/dog", "/c/en/cat", -1.0),
    ]
}

/// Write `edges` into two segments and index them with `backend`.
fn build_store(root: &Path, backend: BackendKind, edges: &[Edge]) -> AssertionFinder {
    let segments = root.join("segments");
    let index_dir = root.join("index");
    std::fs::create_dir_all(&segments).unwrap();

    let mut writer = SegmentWriter::create(&segments, "assertions", 0, 3).unwrap();
    let mut pointers = Vec::new();
    for edge in edges {
        if writer.is_full() {
            writer.cycle().unwrap();
        }
        pointers.push(writer.write(edge).unwrap());
    }
    writer.close().unwrap();

    let mut index_writer = index::create_index(&index_dir, backend, 4).unwrap();
    for (edge, pointer) in edges.iter().zip(&pointers) {
        index::index_edge(index_writer.as_mut(), edge, *pointer).unwrap();
    }
    index_writer
        .finish("assertions", edges.len() as u64)
        .unwrap();

    AssertionFinder::open(&segments, &index_dir).unwrap()
}

fn with_each_backend(mut check: impl FnMut(BackendKind, &AssertionFinder)) {
    let edges = corpus();
    for backend in BACKENDS {
        let dir = tempfile::TempDir::new().unwrap();
        let finder = build_store(dir.path(), backend, &edges);
        assert_eq!(finder.index().backend(), backend);
        check(backend, &finder);
    }
}

fn uris(edges: &[Edge]) -> Vec<String> {
    edges.iter().map(|e| e.uri().to_string()).collect()
}

#[test]
fn prefix_lookup_respects_path_boundaries() {
    with_each_backend(|backend, finder| {
        let page = finder.lookup("/c/en/dog", 100, 0).unwrap();
        for edge in &page.edges {
            let touches_dog = [edge.start(), edge.end()]
                .iter()
                .any(|n| *n == "/c/en/dog" || n.starts_with("/c/en/dog/"));
            assert!(touches_dog, "{backend}: unexpected {}", edge.uri());
        }
        // bark, animal, pet (via dog/n/animal) and dogs→dog; the negative
        // antonym is never indexed.
        assert_eq!(page.len(), 4, "{backend}: {:?}", uris(&page.edges));
        assert!(!page.edges.iter().any(|e| e.start() == "/c/en/doghouse"));
    });
}

#[test]
fn exact_suffix_excludes_longer_paths() {
    with_each_backend(|backend, finder| {
        let page = finder.lookup("/c/en/dog/.", 100, 0).unwrap();
        assert!(!page.is_empty(), "{backend}");
        for edge in &page.edges {
            assert!(
                edge.start() == "/c/en/dog" || edge.end() == "/c/en/dog",
                "{backend}: {}",
                edge.uri()
            );
        }
        assert!(!page.edges.iter().any(|e| e.start() == "/c/en/dog/n/animal"));
    });
}

#[test]
fn exact_lookup_is_highest_weight_first() {
    with_each_backend(|backend, finder| {
        let page = finder.lookup("/c/en/animal/.", 10, 0).unwrap();
        let weights: Vec<f64> = page.edges.iter().map(Edge::weight).collect();
        assert_eq!(weights, vec![3.0, 2.0, 1.0], "{backend}");
    });
}

#[test]
fn pagination_is_a_suffix_of_the_longer_page() {
    with_each_backend(|backend, finder| {
        let all = finder.lookup("/c/en", 100, 0).unwrap();
        assert!(all.len() >= 5);
        for k in 0..3 {
            for n in 1..3 {
                let page = finder.lookup("/c/en", n, k).unwrap();
                let longer = finder.lookup("/c/en", k + n, 0).unwrap();
                assert_eq!(
                    uris(&page.edges),
                    uris(&longer.edges[k..]),
                    "{backend}: k={k} n={n}"
                );
                assert_eq!(page.has_more, page.len() == n);
            }
        }
    });
}

#[test]
fn multi_field_query_post_filters_every_criterion() {
    with_each_backend(|backend, finder| {
        let page = finder
            .query([("rel", "/r/IsA"), ("end", "/c/en/animal")], 10, 0)
            .unwrap();
        let mut starts: Vec<&str> = page.edges.iter().map(Edge::start).collect();
        starts.sort_unstable();
        assert_eq!(starts, vec!["/c/en/cat", "/c/en/dog", "/c/en/wolf"], "{backend}");

        let page = finder
            .query([("node", "/c/en/dog"), ("rel", "/r/CapableOf")], 10, 0)
            .unwrap();
        assert_eq!(page.len(), 1, "{backend}");
        assert_eq!(page.edges[0].end(), "/c/en/bark");

        let page = finder
            .query([("start", "/c/en/dog/."), ("license", Licenses::CC_ATTRIBUTION)], 10, 0)
            .unwrap();
        assert!(page.edges.iter().all(|e| e.start() == "/c/en/dog"), "{backend}");
        assert_eq!(page.len(), 2, "{backend}");
    });
}

#[test]
fn query_errors_are_caller_errors() {
    with_each_backend(|_, finder| {
        assert!(matches!(
            finder.query([("colour", "/c/en/red")], 10, 0).unwrap_err(),
            QueryError::UnknownCriterion { field } if field == "colour"
        ));
        assert!(matches!(
            finder
                .query([("license", Licenses::CC_ATTRIBUTION), ("surfaceText", "x")], 10, 0)
                .unwrap_err(),
            QueryError::NoSearchableCriterion
        ));
    });
}

#[test]
fn missing_key_is_empty_not_an_error() {
    with_each_backend(|backend, finder| {
        assert!(finder.lookup("/c/en/unicorn", 10, 0).unwrap().is_empty(), "{backend}");
        assert!(finder.lookup("/c/zz/.", 10, 0).unwrap().is_empty(), "{backend}");
    });
}

#[test]
fn backends_agree() {
    let edges = corpus();
    let queries = ["/c/en/dog", "/c/en/dog/.", "/r/IsA", "/d/conceptnet", "/s/contributor/omcs", "/c/en/cat"];
    let mut answers: Vec<Vec<Vec<String>>> = Vec::new();
    for backend in BACKENDS {
        let dir = tempfile::TempDir::new().unwrap();
        let finder = build_store(dir.path(), backend, &edges);
        let mut per_query = Vec::new();
        for q in queries {
            let mut found = uris(&finder.lookup(q, 100, 0).unwrap().edges);
            found.sort();
            per_query.push(found);
        }
        answers.push(per_query);
    }
    assert_eq!(answers[0], answers[1]);
    assert_eq!(answers[1], answers[2]);
}

#[test]
fn missing_index_is_unavailable() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("segments")).unwrap();
    let err = AssertionFinder::open(&dir.path().join("segments"), &dir.path().join("index")).unwrap_err();
    assert!(matches!(
        err,
        QueryError::Index(IndexError::IndexUnavailable { .. })
    ));
}
