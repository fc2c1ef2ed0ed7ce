//! Edges: canonical, content-addressed assertion records.
//!
//! An [`Edge`] is built once by [`EdgeBuilder`] and never mutated. Its `uri`,
//! `features` and content-hash `id` are derived from the other fields at build
//! time, so two logically identical observations always collapse to the same
//! id regardless of the order their sources were listed in.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::{EdgeError, EdgeResult};
use crate::uri::{self, ALL_CONTEXTS};

static SURFACE_TERM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[(.*?)\]\]").expect("surface term pattern is valid"));

/// One structured provenance record: role → path, e.g.
/// `contributor → /s/contributor/omcs/dev`, `process → /s/process/wikiparsec/1`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProvenanceRecord(BTreeMap<String, String>);

impl ProvenanceRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a role to the record.
    pub fn with(mut self, role: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(role.into(), value.into());
        self
    }

    pub fn get(&self, role: &str) -> Option<&str> {
        self.0.get(role).map(String::as_str)
    }

    /// Values in role order.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.0.values().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Conjunction of the record's sorted values; two records with the same
    /// set of values share an identity even if their roles differ.
    pub fn identity(&self) -> Option<String> {
        let mut values: Vec<&str> = self.values().collect();
        values.sort_unstable();
        uri::conjunction_uri(&values)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ProvenanceRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Provenance of an edge, in one of its two canonical shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sources {
    /// A single conjunction path built from sorted, deduplicated source paths.
    Conjunction(String),
    /// Structured records, each an independent justification.
    Records(Vec<ProvenanceRecord>),
}

impl Sources {
    /// Canonical string folded into the content hash.
    pub fn canonical_string(&self) -> String {
        match self {
            Sources::Conjunction(conj) => conj.clone(),
            Sources::Records(records) => {
                let mut ids: Vec<String> = records.iter().filter_map(|r| r.identity()).collect();
                ids.sort_unstable();
                ids.join(" ")
            }
        }
    }

    /// Every provenance path this edge can be found by.
    pub fn provenance_strings(&self) -> Vec<String> {
        match self {
            Sources::Conjunction(conj) => uri::parse_possible_compound_uri("and", conj),
            Sources::Records(records) => {
                let mut out: Vec<String> = Vec::new();
                for value in records.iter().flat_map(|r| r.values()) {
                    if !out.iter().any(|seen| seen == value) {
                        out.push(value.to_string());
                    }
                }
                out
            }
        }
    }
}

/// Source list as supplied by a caller, before canonicalization.
#[derive(Debug, Clone)]
pub enum SourceInput {
    /// Plain path strings, joined into one conjunction.
    Paths(Vec<String>),
    /// Structured records, kept in the given order.
    Records(Vec<ProvenanceRecord>),
}

impl From<Vec<String>> for SourceInput {
    fn from(paths: Vec<String>) -> Self {
        SourceInput::Paths(paths)
    }
}

impl From<Vec<&str>> for SourceInput {
    fn from(paths: Vec<&str>) -> Self {
        SourceInput::Paths(paths.into_iter().map(str::to_string).collect())
    }
}

impl From<Vec<ProvenanceRecord>> for SourceInput {
    fn from(records: Vec<ProvenanceRecord>) -> Self {
        SourceInput::Records(records)
    }
}

impl SourceInput {
    fn canonicalize(self) -> EdgeResult<Sources> {
        match self {
            SourceInput::Paths(paths) => {
                if paths.iter().any(|p| p.is_empty()) {
                    return Err(invalid("source paths must be non-empty"));
                }
                uri::conjunction_uri(&paths)
                    .map(Sources::Conjunction)
                    .ok_or_else(|| invalid("an edge needs at least one source"))
            }
            SourceInput::Records(records) => {
                if records.is_empty() {
                    return Err(invalid("an edge needs at least one source"));
                }
                if records
                    .iter()
                    .any(|r| r.is_empty() || r.values().any(str::is_empty))
                {
                    return Err(invalid("provenance records must hold non-empty values"));
                }
                Ok(Sources::Records(records))
            }
        }
    }
}

/// A weighted, content-addressed assertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    id: String,
    uri: String,
    rel: String,
    start: String,
    end: String,
    context: String,
    dataset: String,
    license: String,
    sources: Sources,
    features: Vec<String>,
    weight: f64,
    surface_text: Option<String>,
    surface_start: Option<String>,
    surface_end: Option<String>,
}

impl Edge {
    /// Content hash: `/e/<sha1 hex>`.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn rel(&self) -> &str {
        &self.rel
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn end(&self) -> &str {
        &self.end
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn license(&self) -> &str {
        &self.license
    }

    pub fn sources(&self) -> &Sources {
        &self.sources
    }

    /// `"<start> <rel> -"`, `"<start> - <end>"`, `"- <rel> <end>"`.
    pub fn features(&self) -> &[String] {
        &self.features
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn surface_text(&self) -> Option<&str> {
        self.surface_text.as_deref()
    }

    pub fn surface_start(&self) -> Option<&str> {
        self.surface_start.as_deref()
    }

    pub fn surface_end(&self) -> Option<&str> {
        self.surface_end.as_deref()
    }

    /// Whether this edge counts as asserted (positive weight).
    pub fn is_asserted(&self) -> bool {
        self.weight > 0.0
    }
}

impl std::fmt::Display for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{:.3}] {}", self.uri, self.weight, self.id)
    }
}

/// Builder for [`Edge`]. Optional fields default to the "all contexts"
/// context, no surface text and weight 1.0.
#[derive(Debug, Clone)]
pub struct EdgeBuilder {
    rel: String,
    start: String,
    end: String,
    dataset: String,
    license: String,
    sources: SourceInput,
    context: String,
    surface_text: Option<String>,
    weight: f64,
}

impl EdgeBuilder {
    pub fn new(
        rel: impl Into<String>,
        start: impl Into<String>,
        end: impl Into<String>,
        dataset: impl Into<String>,
        license: impl Into<String>,
        sources: impl Into<SourceInput>,
    ) -> Self {
        Self {
            rel: rel.into(),
            start: start.into(),
            end: end.into(),
            dataset: dataset.into(),
            license: license.into(),
            sources: sources.into(),
            context: ALL_CONTEXTS.to_string(),
            surface_text: None,
            weight: 1.0,
        }
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn surface_text(mut self, text: Option<String>) -> Self {
        self.surface_text = text;
        self
    }

    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Validate the inputs and derive `uri`, `features` and `id`.
    pub fn build(self) -> EdgeResult<Edge> {
        if !looks_like_relation(&self.rel) {
            return Err(invalid(format!("{:?} is not a relation path", self.rel)));
        }
        for (name, value) in [
            ("start", &self.start),
            ("end", &self.end),
            ("dataset", &self.dataset),
            ("context", &self.context),
        ] {
            if value.is_empty() {
                return Err(invalid(format!("{name} must be non-empty")));
            }
        }
        if !self.weight.is_finite() {
            return Err(invalid(format!("weight {} is not finite", self.weight)));
        }

        let sources = self.sources.canonicalize()?;
        let uri = uri::assertion_uri(&self.rel, &self.start, &self.end);
        let features = features_for(&self.rel, &self.start, &self.end);
        let id = content_id(&uri, &self.context, &sources);
        let (surface_start, surface_end) = match extract_surface_terms(self.surface_text.as_deref()) {
            Some((s, e)) => (Some(s), Some(e)),
            None => (None, None),
        };

        Ok(Edge {
            id,
            uri,
            rel: self.rel,
            start: self.start,
            end: self.end,
            context: self.context,
            dataset: self.dataset,
            license: self.license,
            sources,
            features,
            weight: self.weight,
            surface_text: self.surface_text,
            surface_start,
            surface_end,
        })
    }
}

/// Build an edge with default context, no surface text and weight 1.0.
pub fn build_edge(
    rel: &str,
    start: &str,
    end: &str,
    dataset: &str,
    license: &str,
    sources: impl Into<SourceInput>,
) -> EdgeResult<Edge> {
    EdgeBuilder::new(rel, start, end, dataset, license, sources).build()
}

fn looks_like_relation(rel: &str) -> bool {
    rel.starts_with("/r/") && rel.len() > 3
}

fn invalid(message: impl Into<String>) -> EdgeError {
    EdgeError::InvalidInput {
        message: message.into(),
    }
}

fn features_for(rel: &str, start: &str, end: &str) -> Vec<String> {
    let pstart = uri::uri_prefix(start, 3);
    let pend = uri::uri_prefix(end, 3);
    if !(uri::is_concept(&pstart) && uri::is_concept(&pend)) {
        return Vec::new();
    }
    vec![
        format!("{pstart} {rel} -"),
        format!("{pstart} - {pend}"),
        format!("- {rel} {pend}"),
    ]
}

fn content_id(uri: &str, context: &str, sources: &Sources) -> String {
    let canonical = format!("{uri} {context} {}", sources.canonical_string());
    let digest = Sha1::digest(canonical.as_bytes());
    format!("/e/{}", hex::encode(digest))
}

/// The two `[[...]]` terms of a surface text, in (start, end) order.
///
/// Frames that mention the end term first are marked with a leading `*`.
/// Returns `None` unless there are exactly two terms.
pub fn extract_surface_terms(surface: Option<&str>) -> Option<(String, String)> {
    let surface = surface.filter(|s| !s.is_empty())?;
    let terms: Vec<&str> = SURFACE_TERM
        .captures_iter(surface)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    match terms.as_slice() {
        [first, second] if surface.starts_with('*') => Some((second.to_string(), first.to_string())),
        [first, second] => Some((first.to_string(), second.to_string())),
        _ => None,
    }
}

/// Single-source edge for unit tests.
#[cfg(test)]
pub(crate) fn test_edge(rel: &str, start: &str, end: &str, weight: f64) -> Edge {
    EdgeBuilder::new(
        rel,
        start,
        end,
        "/d/test",
        crate::uri::Licenses::CC_ATTRIBUTION,
        vec!["/s/contributor/test"],
    )
    .weight(weight)
    .build()
    .expect("test edge is valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uri::Licenses;

    fn fire_is_hot() -> Edge {
        EdgeBuilder::new(
            "/r/HasProperty",
            "/c/en/fire",
            "/c/en/hot",
            "/d/conceptnet/4/en",
            Licenses::CC_ATTRIBUTION,
            vec!["/s/contributor/omcs/dev"],
        )
        .surface_text(Some("[[Fire]] is [[hot]]".into()))
        .build()
        .unwrap()
    }

    #[test]
    fn derived_fields() {
        let edge = fire_is_hot();
        assert_eq!(edge.uri(), "/a/[/r/HasProperty/,/c/en/fire/,/c/en/hot/]");
        assert_eq!(
            edge.features(),
            &[
                "/c/en/fire /r/HasProperty -".to_string(),
                "/c/en/fire - /c/en/hot".to_string(),
                "- /r/HasProperty /c/en/hot".to_string(),
            ]
        );
        assert_eq!(edge.context(), ALL_CONTEXTS);
        assert_eq!(edge.weight(), 1.0);
        assert_eq!(edge.surface_start(), Some("Fire"));
        assert_eq!(edge.surface_end(), Some("hot"));
        assert!(edge.id().starts_with("/e/"));
        assert_eq!(edge.id().len(), 3 + 40);
    }

    #[test]
    fn features_only_between_concepts() {
        let edge = build_edge(
            "/r/ExternalURL",
            "/c/en/dog",
            "http://dbpedia.org/resource/Dog",
            "/d/dbpedia/en",
            Licenses::CC_SHAREALIKE,
            vec!["/s/resource/dbpedia/2015/en"],
        )
        .unwrap();
        assert!(edge.features().is_empty());
        assert_eq!(edge.end(), "http://dbpedia.org/resource/Dog");
    }

    #[test]
    fn id_matches_sha1_of_canonical_bytes() {
        let edge = fire_is_hot();
        let canonical = format!("{} /ctx/all /s/contributor/omcs/dev", edge.uri());
        let expected = format!("/e/{}", hex::encode(Sha1::digest(canonical.as_bytes())));
        assert_eq!(edge.id(), expected);
    }

    #[test]
    fn source_order_does_not_change_id() {
        let a = build_edge("/r/IsA", "/c/en/dog", "/c/en/animal", "/d/x", "cc:by/4.0", vec!["/s/b", "/s/a"]).unwrap();
        let b = build_edge("/r/IsA", "/c/en/dog", "/c/en/animal", "/d/x", "cc:by/4.0", vec!["/s/a", "/s/b"]).unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(a.sources(), &Sources::Conjunction("/and/[/s/a/,/s/b/]".into()));
    }

    #[test]
    fn record_order_does_not_change_id() {
        let r1 = ProvenanceRecord::new().with("contributor", "/s/contributor/a");
        let r2 = ProvenanceRecord::new()
            .with("contributor", "/s/contributor/b")
            .with("process", "/s/process/p");
        let a = build_edge("/r/IsA", "/c/en/dog", "/c/en/animal", "/d/x", "cc:by/4.0", vec![r1.clone(), r2.clone()]).unwrap();
        let b = build_edge("/r/IsA", "/c/en/dog", "/c/en/animal", "/d/x", "cc:by/4.0", vec![r2, r1]).unwrap();
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn context_changes_id() {
        let a = build_edge("/r/IsA", "/c/en/dog", "/c/en/animal", "/d/x", "cc:by/4.0", vec!["/s/a"]).unwrap();
        let b = EdgeBuilder::new("/r/IsA", "/c/en/dog", "/c/en/animal", "/d/x", "cc:by/4.0", vec!["/s/a"])
            .context("/ctx/fiction")
            .build()
            .unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn rejects_bad_relation() {
        let err = build_edge("/c/en/IsA", "/c/en/dog", "/c/en/animal", "/d/x", "cc:by/4.0", vec!["/s/a"]).unwrap_err();
        assert!(matches!(err, EdgeError::InvalidInput { .. }));
    }

    #[test]
    fn rejects_empty_sources() {
        let empty: Vec<String> = Vec::new();
        assert!(build_edge("/r/IsA", "/c/en/dog", "/c/en/animal", "/d/x", "cc:by/4.0", empty).is_err());
        let no_records: Vec<ProvenanceRecord> = Vec::new();
        assert!(build_edge("/r/IsA", "/c/en/dog", "/c/en/animal", "/d/x", "cc:by/4.0", no_records).is_err());
    }

    #[test]
    fn single_source_is_unchanged() {
        let edge = build_edge("/r/IsA", "/c/en/dog", "/c/en/animal", "/d/x", "cc:by/4.0", vec!["/s/only"]).unwrap();
        assert_eq!(edge.sources(), &Sources::Conjunction("/s/only".into()));
        assert_eq!(edge.sources().provenance_strings(), vec!["/s/only"]);
    }

    #[test]
    fn surface_terms_reverse_on_asterisk() {
        assert_eq!(
            extract_surface_terms(Some("*[[A tail]] can belong to [[a dog]].")),
            Some(("a dog".to_string(), "A tail".to_string()))
        );
        assert_eq!(extract_surface_terms(Some("[[one]] only")), None);
        assert_eq!(extract_surface_terms(None), None);
    }

    #[test]
    fn record_identity_ignores_roles() {
        let a = ProvenanceRecord::new().with("x", "/s/b").with("y", "/s/a");
        let b = ProvenanceRecord::new().with("p", "/s/a").with("q", "/s/b");
        assert_eq!(a.identity(), b.identity());
        assert_eq!(a.identity().unwrap(), "/and/[/s/a/,/s/b/]");
    }
}
