//! Assertion combiner: folds single-source observations into weighted edges.
//!
//! Input is a stream of tab-separated rows sorted by their first column (the
//! grouping URI), so all observations of one assertion are contiguous. The
//! combiner performs a single streaming group-by, holding one group at a time,
//! and routes each combined edge to either the accept or the reject sink.

use std::collections::HashSet;
use std::convert::Infallible;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::edge::{Edge, EdgeBuilder, ProvenanceRecord};
use crate::error::RowParseError;
use crate::uri::{self, ALL_CONTEXTS, Licenses};

/// Scale summed raw weights into a confidence score.
///
/// Linear up to 2, square-root above: `2·sqrt(max(w−1, 1)) + min(w, 2) − 2`.
pub fn weight_scale(weight: f64) -> f64 {
    2.0 * (weight - 1.0).max(1.0).sqrt() + weight.min(2.0) - 2.0
}

/// The structured info payload of one raw row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceObservation {
    pub weight: f64,
    pub license: String,
    pub dataset: String,
    #[serde(default)]
    pub sources: Vec<ProvenanceRecord>,
    #[serde(
        default,
        rename = "surfaceText",
        skip_serializing_if = "Option::is_none"
    )]
    pub surface_text: Option<String>,
}

/// Column layout of combiner input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowFormat {
    /// `uri rel start end info_json`
    #[default]
    Raw,
    /// `uri rel start end context weight sources id dataset`
    Flat,
}

impl RowFormat {
    fn columns(self) -> usize {
        match self {
            RowFormat::Raw => 5,
            RowFormat::Flat => 9,
        }
    }
}

impl FromStr for RowFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Ok(RowFormat::Raw),
            "flat" | "csv" => Ok(RowFormat::Flat),
            other => Err(format!("unknown row format {other:?} (expected raw or flat)")),
        }
    }
}

/// One decoded observation, tagged with its grouping key.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    /// 1-based input line, for diagnostics.
    pub line: usize,
    pub grouping_uri: String,
    pub rel: String,
    pub start: String,
    pub end: String,
    pub context: String,
    pub observation: SourceObservation,
}

impl RawRow {
    /// Decode one input line.
    pub fn parse(line_no: usize, line: &str, format: RowFormat) -> Result<Self, RowParseError> {
        let expected = format.columns();
        let cols: Vec<&str> = line.splitn(expected, '\t').collect();
        if cols.len() != expected {
            return Err(RowParseError::Columns {
                line: line_no,
                expected,
                found: cols.len(),
            });
        }
        match format {
            RowFormat::Raw => {
                let observation: SourceObservation =
                    serde_json::from_str(cols[4]).map_err(|e| RowParseError::Payload {
                        line: line_no,
                        message: e.to_string(),
                    })?;
                if !observation.weight.is_finite() {
                    return Err(RowParseError::Weight {
                        line: line_no,
                        value: observation.weight.to_string(),
                    });
                }
                Ok(Self {
                    line: line_no,
                    grouping_uri: cols[0].to_string(),
                    rel: cols[1].to_string(),
                    start: cols[2].to_string(),
                    end: cols[3].to_string(),
                    context: ALL_CONTEXTS.to_string(),
                    observation,
                })
            }
            RowFormat::Flat => {
                let weight: f64 = cols[5]
                    .trim()
                    .parse()
                    .ok()
                    .filter(|w: &f64| w.is_finite())
                    .ok_or_else(|| RowParseError::Weight {
                        line: line_no,
                        value: cols[5].to_string(),
                    })?;
                let paths = uri::parse_possible_compound_uri("and", cols[6].trim());
                let sources = if paths.iter().all(|p| p.is_empty()) {
                    Vec::new()
                } else {
                    vec![record_from_paths(&paths)]
                };
                Ok(Self {
                    line: line_no,
                    grouping_uri: cols[0].to_string(),
                    rel: cols[1].to_string(),
                    start: cols[2].to_string(),
                    end: cols[3].to_string(),
                    context: non_empty_or(cols[4], ALL_CONTEXTS),
                    observation: SourceObservation {
                        weight,
                        license: Licenses::CC_ATTRIBUTION.to_string(),
                        dataset: cols[8].trim_end().to_string(),
                        sources,
                        surface_text: None,
                    },
                })
            }
        }
    }

    /// Encode as a raw-format line (no trailing newline).
    pub fn to_raw_line(&self) -> String {
        let info = serde_json::to_string(&self.observation).unwrap_or_else(|_| "{}".into());
        format!(
            "{}\t{}\t{}\t{}\t{}",
            self.grouping_uri, self.rel, self.start, self.end, info
        )
    }
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value.trim().to_string()
    }
}

/// Turn the members of a conjunction into one record keyed by source kind
/// (`/s/contributor/...` → `contributor`).
fn record_from_paths(paths: &[String]) -> ProvenanceRecord {
    let mut record = ProvenanceRecord::new();
    for path in paths {
        let kind = match uri::split_uri(path).as_slice() {
            ["s", kind, ..] => (*kind).to_string(),
            _ => "source".to_string(),
        };
        let mut role = kind.clone();
        let mut n = 1;
        while record.get(&role).is_some() {
            n += 1;
            role = format!("{kind}{n}");
        }
        record = record.with(role, path.clone());
    }
    record
}

/// Decode lines, numbering them from 1 and skipping blank ones.
pub fn parse_rows<'a, I>(
    lines: I,
    format: RowFormat,
) -> impl Iterator<Item = Result<RawRow, RowParseError>> + 'a
where
    I: IntoIterator<Item = &'a str>,
    I::IntoIter: 'a,
{
    lines
        .into_iter()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(move |(i, line)| RawRow::parse(i + 1, line.trim_end_matches(['\r', '\n']), format))
}

/// Validity rules applied to every combined edge.
#[derive(Debug, Clone)]
pub struct ConceptFilter {
    languages: HashSet<String>,
    deny_list: HashSet<String>,
}

impl ConceptFilter {
    pub fn new<L, D>(languages: L, deny_list: D) -> Self
    where
        L: IntoIterator,
        L::Item: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        Self {
            languages: languages.into_iter().map(Into::into).collect(),
            deny_list: deny_list.into_iter().map(Into::into).collect(),
        }
    }

    /// Keep absolute URLs, and concepts in a known language with a non-empty
    /// local name.
    pub fn keep_concept(&self, uri: &str) -> bool {
        if uri::is_absolute_url(uri) {
            return true;
        }
        let Some(lang) = uri::uri_language(uri) else {
            return false;
        };
        if !self.languages.contains(lang) {
            return false;
        }
        matches!(uri::split_uri(uri).get(2), Some(text) if !text.is_empty())
    }

    /// Whether any field value (or a node's local name) is on the deny list.
    pub fn denied(&self, edge: &Edge) -> bool {
        let fields = [edge.rel(), edge.start(), edge.end(), edge.dataset()];
        let names = [edge.start(), edge.end()]
            .into_iter()
            .filter_map(|node| uri::split_uri(node).get(2).copied());
        fields
            .into_iter()
            .chain(names)
            .any(|value| self.deny_list.contains(value))
    }

    fn reject_reason(&self, edge: &Edge) -> Option<&'static str> {
        if edge.weight() <= 0.0 {
            Some("non-positive weight")
        } else if !(self.keep_concept(edge.start()) && self.keep_concept(edge.end())) {
            Some("invalid concept")
        } else if self.denied(edge) {
            Some("denied value")
        } else {
            None
        }
    }
}

impl Default for ConceptFilter {
    fn default() -> Self {
        Self::new(
            crate::config::default_languages(),
            crate::config::default_deny_list(),
        )
    }
}

/// Destination for combined edges.
pub trait EdgeSink {
    type Error;

    fn put(&mut self, edge: Edge) -> Result<(), Self::Error>;
}

impl EdgeSink for Vec<Edge> {
    type Error = Infallible;

    fn put(&mut self, edge: Edge) -> Result<(), Infallible> {
        self.push(edge);
        Ok(())
    }
}

/// Counters for one combiner run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CombineStats {
    pub groups: usize,
    pub accepted: usize,
    pub rejected: usize,
    /// Rows dropped because they could not be decoded.
    pub dropped_rows: usize,
    /// Groups dropped because no edge could be built from them.
    pub dropped_groups: usize,
}

/// Outcome of combining one group.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accept(Edge),
    Reject(Edge),
}

/// Streaming group-by combiner.
#[derive(Debug, Clone, Default)]
pub struct Combiner {
    filter: ConceptFilter,
}

impl Combiner {
    pub fn new(filter: ConceptFilter) -> Self {
        Self { filter }
    }

    /// Combine a sorted row stream, sending each group's edge to `accept` or
    /// `reject`. Undecodable rows are logged and dropped; sink errors abort.
    pub fn combine<I, A, R>(
        &self,
        rows: I,
        accept: &mut A,
        reject: &mut R,
    ) -> Result<CombineStats, A::Error>
    where
        I: IntoIterator<Item = Result<RawRow, RowParseError>>,
        A: EdgeSink,
        R: EdgeSink<Error = A::Error>,
    {
        let mut stats = CombineStats::default();
        let mut group: Vec<RawRow> = Vec::new();

        for row in rows {
            let row = match row {
                Ok(row) => row,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed row");
                    stats.dropped_rows += 1;
                    continue;
                }
            };
            if let Some(first) = group.first() {
                if first.grouping_uri != row.grouping_uri {
                    if row.grouping_uri < first.grouping_uri {
                        tracing::warn!(
                            line = row.line,
                            uri = %row.grouping_uri,
                            "input is not sorted by grouping uri; assertions may be split"
                        );
                    }
                    self.flush(&mut group, &mut stats, accept, reject)?;
                }
            }
            group.push(row);
        }
        self.flush(&mut group, &mut stats, accept, reject)?;

        tracing::debug!(
            groups = stats.groups,
            accepted = stats.accepted,
            rejected = stats.rejected,
            dropped_rows = stats.dropped_rows,
            "combine finished"
        );
        Ok(stats)
    }

    fn flush<A, R>(
        &self,
        group: &mut Vec<RawRow>,
        stats: &mut CombineStats,
        accept: &mut A,
        reject: &mut R,
    ) -> Result<(), A::Error>
    where
        A: EdgeSink,
        R: EdgeSink<Error = A::Error>,
    {
        if group.is_empty() {
            return Ok(());
        }
        stats.groups += 1;
        match self.combine_group(group) {
            Some(Verdict::Accept(edge)) => {
                stats.accepted += 1;
                accept.put(edge)?;
            }
            Some(Verdict::Reject(edge)) => {
                stats.rejected += 1;
                reject.put(edge)?;
            }
            None => stats.dropped_groups += 1,
        }
        group.clear();
        Ok(())
    }

    /// Combine one contiguous group of rows sharing a grouping uri.
    pub fn combine_group(&self, rows: &[RawRow]) -> Option<Verdict> {
        let first = rows.first()?;

        // Word senses are only merged up to the part of speech.
        let start = uri::uri_prefix(&first.start, 4);
        let end = uri::uri_prefix(&first.end, 4);

        let raw_weight: f64 = rows.iter().map(|r| r.observation.weight).sum();
        let share_alike = rows
            .iter()
            .any(|r| r.observation.license == Licenses::CC_SHAREALIKE);
        let license = if share_alike {
            Licenses::CC_SHAREALIKE
        } else {
            Licenses::CC_ATTRIBUTION
        };

        let mut surface_text: Option<String> = None;
        let mut sources: Vec<ProvenanceRecord> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for row in rows {
            if surface_text.is_none() {
                surface_text = row.observation.surface_text.clone();
            }
            for record in &row.observation.sources {
                let Some(identity) = record.identity() else {
                    continue;
                };
                if seen.insert(identity) {
                    sources.push(record.clone());
                }
            }
        }

        let built = EdgeBuilder::new(
            first.rel.clone(),
            start,
            end,
            first.observation.dataset.clone(),
            license,
            sources,
        )
        .context(first.context.clone())
        .surface_text(surface_text)
        .weight(weight_scale(raw_weight))
        .build();

        let edge = match built {
            Ok(edge) => edge,
            Err(e) => {
                tracing::warn!(uri = %first.grouping_uri, line = first.line, error = %e, "dropping group");
                return None;
            }
        };

        match self.filter.reject_reason(&edge) {
            Some(reason) => {
                tracing::debug!(uri = %edge.uri(), reason, "rejecting assertion");
                Some(Verdict::Reject(edge))
            }
            None => Some(Verdict::Accept(edge)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::Sources;

    fn raw_line(uri: &str, weight: f64, license: &str, contributor: &str, surface: Option<&str>) -> String {
        let obs = SourceObservation {
            weight,
            license: license.into(),
            dataset: "/d/test".into(),
            sources: vec![ProvenanceRecord::new().with("contributor", contributor)],
            surface_text: surface.map(str::to_string),
        };
        RawRow {
            line: 0,
            grouping_uri: uri.into(),
            rel: "/r/IsA".into(),
            start: "/c/en/dog".into(),
            end: "/c/en/animal".into(),
            context: ALL_CONTEXTS.into(),
            observation: obs,
        }
        .to_raw_line()
    }

    fn run(lines: &[String]) -> (Vec<Edge>, Vec<Edge>, CombineStats) {
        let mut good = Vec::new();
        let mut bad = Vec::new();
        let rows = parse_rows(lines.iter().map(String::as_str), RowFormat::Raw);
        let stats = Combiner::default().combine(rows, &mut good, &mut bad).unwrap();
        (good, bad, stats)
    }

    #[test]
    fn weight_scale_boundaries() {
        assert_eq!(weight_scale(-1.0), -1.0);
        assert_eq!(weight_scale(0.0), 0.0);
        assert_eq!(weight_scale(1.0), 1.0);
        assert_eq!(weight_scale(2.0), 2.0);
        assert_eq!(weight_scale(5.0), 4.0);
        assert_eq!(weight_scale(10.0), 6.0);
    }

    #[test]
    fn combines_weights_licenses_and_sources() {
        let uri = "/a/[/r/IsA/,/c/en/dog/,/c/en/animal/]";
        let lines = vec![
            raw_line(uri, 1.0, Licenses::CC_ATTRIBUTION, "/s/contributor/a", None),
            raw_line(uri, 2.0, Licenses::CC_SHAREALIKE, "/s/contributor/b", Some("[[dog]] is an [[animal]]")),
            raw_line(uri, 0.0, Licenses::CC_ATTRIBUTION, "/s/contributor/a", Some("ignored")),
        ];
        let (good, bad, stats) = run(&lines);
        assert!(bad.is_empty());
        assert_eq!(stats.groups, 1);
        let edge = &good[0];
        assert!((edge.weight() - 2.0 * 2f64.sqrt()).abs() < 1e-12);
        assert_eq!(edge.license(), Licenses::CC_SHAREALIKE);
        assert_eq!(edge.surface_text(), Some("[[dog]] is an [[animal]]"));
        match edge.sources() {
            Sources::Records(records) => {
                assert_eq!(records.len(), 2);
                assert_eq!(records[0].get("contributor"), Some("/s/contributor/a"));
                assert_eq!(records[1].get("contributor"), Some("/s/contributor/b"));
            }
            other => panic!("expected records, got {other:?}"),
        }
    }

    #[test]
    fn groups_split_on_uri_change() {
        let a = "/a/[/r/IsA/,/c/en/cat/,/c/en/animal/]";
        let b = "/a/[/r/IsA/,/c/en/dog/,/c/en/animal/]";
        let lines = vec![
            raw_line(a, 1.0, Licenses::CC_ATTRIBUTION, "/s/x", None),
            raw_line(b, 1.0, Licenses::CC_ATTRIBUTION, "/s/y", None),
            raw_line(b, 1.0, Licenses::CC_ATTRIBUTION, "/s/z", None),
        ];
        let (good, _, stats) = run(&lines);
        assert_eq!(stats.groups, 2);
        assert_eq!(good.len(), 2);
        assert_eq!(good[1].weight(), 2.0);
    }

    #[test]
    fn non_positive_weight_is_rejected() {
        let uri = "/a/[/r/IsA/,/c/en/dog/,/c/en/animal/]";
        let lines = vec![raw_line(uri, -1.0, Licenses::CC_ATTRIBUTION, "/s/x", None)];
        let (good, bad, stats) = run(&lines);
        assert!(good.is_empty());
        assert_eq!(bad.len(), 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(bad[0].weight(), -1.0);
    }

    #[test]
    fn malformed_row_is_dropped_not_fatal() {
        let uri = "/a/[/r/IsA/,/c/en/dog/,/c/en/animal/]";
        let lines = vec![
            raw_line(uri, 1.0, Licenses::CC_ATTRIBUTION, "/s/x", None),
            format!("{uri}\t/r/IsA\t/c/en/dog\t/c/en/animal\t{{not json"),
            raw_line(uri, 1.0, Licenses::CC_ATTRIBUTION, "/s/y", None),
        ];
        let (good, _, stats) = run(&lines);
        assert_eq!(stats.dropped_rows, 1);
        assert_eq!(good.len(), 1);
        assert_eq!(good[0].weight(), 2.0);
    }

    #[test]
    fn keep_concept_rules() {
        let filter = ConceptFilter::default();
        assert!(filter.keep_concept("/c/en/dog"));
        assert!(filter.keep_concept("http://dbpedia.org/resource/Dog"));
        assert!(!filter.keep_concept("/c/xx-unknown/dog"));
        assert!(!filter.keep_concept("/c/en"));
        assert!(!filter.keep_concept("/c/en/"));
    }

    #[test]
    fn unknown_language_is_rejected() {
        let uri = "/a/[/r/IsA/,/c/zz/dog/,/c/en/animal/]";
        let obs = SourceObservation {
            weight: 1.0,
            license: Licenses::CC_ATTRIBUTION.into(),
            dataset: "/d/test".into(),
            sources: vec![ProvenanceRecord::new().with("contributor", "/s/x")],
            surface_text: None,
        };
        let line = format!(
            "{uri}\t/r/IsA\t/c/zz/dog\t/c/en/animal\t{}",
            serde_json::to_string(&obs).unwrap()
        );
        let (good, bad, _) = run(&[line]);
        assert!(good.is_empty());
        assert_eq!(bad.len(), 1);
    }

    #[test]
    fn denied_name_is_rejected() {
        let filter = ConceptFilter::new(["en"], ["something"]);
        let row = RawRow::parse(
            1,
            &format!(
                "u\t/r/IsA\t/c/en/something\t/c/en/animal\t{}",
                r#"{"weight":1.0,"license":"cc:by/4.0","dataset":"/d/t","sources":[{"contributor":"/s/x"}]}"#
            ),
            RowFormat::Raw,
        )
        .unwrap();
        let verdict = Combiner::new(filter).combine_group(&[row]).unwrap();
        assert!(matches!(verdict, Verdict::Reject(_)));
    }

    #[test]
    fn word_senses_truncated_to_pos() {
        let row = RawRow::parse(
            1,
            &format!(
                "u\t/r/IsA\t/c/en/dog/n/canine\t/c/en/animal/n\t{}",
                r#"{"weight":1.0,"license":"cc:by/4.0","dataset":"/d/t","sources":[{"contributor":"/s/x"}]}"#
            ),
            RowFormat::Raw,
        )
        .unwrap();
        let Some(Verdict::Accept(edge)) = Combiner::default().combine_group(&[row]) else {
            panic!("expected accepted edge");
        };
        assert_eq!(edge.start(), "/c/en/dog/n");
        assert_eq!(edge.end(), "/c/en/animal/n");
    }

    #[test]
    fn flat_rows_parse() {
        let line = "/a/[/r/IsA/,/c/en/dog/,/c/en/animal/]\t/r/IsA\t/c/en/dog\t/c/en/animal\t/ctx/all\t1.5\t/and/[/s/contributor/omcs/bob/,/s/rule/sum/]\t/e/abc\t/d/conceptnet/4/en";
        let row = RawRow::parse(3, line, RowFormat::Flat).unwrap();
        assert_eq!(row.observation.weight, 1.5);
        assert_eq!(row.observation.dataset, "/d/conceptnet/4/en");
        let record = &row.observation.sources[0];
        assert_eq!(record.get("contributor"), Some("/s/contributor/omcs/bob"));
        assert_eq!(record.get("rule"), Some("/s/rule/sum"));
    }

    #[test]
    fn wrong_column_count_is_an_error() {
        let err = RawRow::parse(9, "a\tb\tc", RowFormat::Raw).unwrap_err();
        assert!(matches!(err, RowParseError::Columns { line: 9, expected: 5, found: 3 }));
    }

    #[test]
    fn combining_twice_is_identical() {
        let uri = "/a/[/r/IsA/,/c/en/dog/,/c/en/animal/]";
        let lines = vec![
            raw_line(uri, 1.0, Licenses::CC_ATTRIBUTION, "/s/contributor/a", None),
            raw_line(uri, 2.0, Licenses::CC_SHAREALIKE, "/s/contributor/b", None),
        ];
        let (first, _, _) = run(&lines);
        let mut resorted = lines.clone();
        resorted.sort();
        let (second, _, _) = run(&resorted);
        assert_eq!(
            rmp_serde::to_vec(&first).unwrap(),
            rmp_serde::to_vec(&second).unwrap()
        );
    }
}
