//! Path-string algebra for edge identifiers.
//!
//! Every node, relation, dataset and source is a slash-separated path such as
//! `/c/en/cat/n`. Compound structures (assertions, conjunctions) embed their
//! operands between `/[/` and `/]/` segments, separated by `/,/`, so compound
//! identifiers can nest without ambiguity:
//!
//! ```text
//! /a/[/r/CapableOf/,/c/en/cat/,/c/en/sleep/]
//! /and/[/s/contributor/omcs/dev/,/s/rule/parser/]
//! ```

/// License identifiers that the combiner understands.
pub struct Licenses;

impl Licenses {
    /// Creative Commons Attribution.
    pub const CC_ATTRIBUTION: &'static str = "cc:by/4.0";
    /// Creative Commons Attribution-ShareAlike. Stronger than attribution.
    pub const CC_SHAREALIKE: &'static str = "cc:by-sa/4.0";
}

/// Default context for edges that hold everywhere.
pub const ALL_CONTEXTS: &str = "/ctx/all";

/// Join pieces into a path, normalizing slashes.
///
/// Leading and trailing slashes on each piece are ignored; the result always
/// starts with a single slash.
pub fn join_uri<S: AsRef<str>>(pieces: &[S]) -> String {
    let mut joined = String::new();
    for piece in pieces {
        joined.push('/');
        joined.push_str(piece.as_ref().trim_matches('/'));
    }
    if joined.is_empty() {
        joined.push('/');
    }
    joined
}

/// Slash-delimited pieces of a path. Non-paths come back as a single piece.
pub fn split_uri(uri: &str) -> Vec<&str> {
    if !uri.starts_with('/') {
        return vec![uri];
    }
    let rest = uri.trim_start_matches('/');
    if rest.is_empty() {
        return Vec::new();
    }
    rest.split('/').collect()
}

/// Absolute URLs (and `cc:` license identifiers) are opaque: never split.
pub fn is_absolute_url(uri: &str) -> bool {
    uri.starts_with("http") || uri.starts_with("cc:")
}

pub fn is_concept(uri: &str) -> bool {
    uri.starts_with("/c/")
}

/// Keep only the first `max_pieces` components of a path.
pub fn uri_prefix(uri: &str, max_pieces: usize) -> String {
    if is_absolute_url(uri) {
        return uri.to_string();
    }
    let pieces = split_uri(uri);
    let end = pieces.len().min(max_pieces);
    join_uri(&pieces[..end])
}

/// All hierarchical prefixes of a path with at least `min_pieces` components.
///
/// Bracketed sub-structures are atomic: a prefix is only produced when the
/// `[` and `]` segments seen so far are balanced.
pub fn uri_prefixes(uri: &str, min_pieces: usize) -> Vec<String> {
    if is_absolute_url(uri) {
        return vec![uri.to_string()];
    }
    let pieces = split_uri(uri);
    let mut prefixes = Vec::new();
    let mut depth: i64 = 0;
    for (i, piece) in pieces.iter().enumerate() {
        match *piece {
            "[" => depth += 1,
            "]" => depth -= 1,
            _ => {}
        }
        if i + 1 >= min_pieces && depth == 0 {
            prefixes.push(join_uri(&pieces[..=i]));
        }
    }
    prefixes
}

/// Build a compound path: `op/[/arg1/,/arg2/]`.
pub fn compound_uri<S: AsRef<str>>(op: &str, args: &[S]) -> String {
    let mut items: Vec<&str> = Vec::with_capacity(args.len() * 2 + 2);
    items.push(op);
    items.push("[");
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            items.push(",");
        }
        items.push(arg.as_ref());
    }
    items.push("]");
    join_uri(&items)
}

/// Split a compound path into its operator and top-level operands.
///
/// Returns `None` if the path is not a well-formed compound.
pub fn parse_compound_uri(uri: &str) -> Option<(String, Vec<String>)> {
    let pieces = split_uri(uri);
    if pieces.last() != Some(&"]") {
        return None;
    }
    let list_start = pieces.iter().position(|p| *p == "[")?;
    let op = join_uri(&pieces[..list_start]);

    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut depth = 0i64;
    for &piece in &pieces[list_start + 1..pieces.len() - 1] {
        if piece == "," && depth == 0 {
            chunks.push(join_uri(&current));
            current.clear();
        } else {
            current.push(piece);
            match piece {
                "[" => depth += 1,
                "]" => depth -= 1,
                _ => {}
            }
        }
    }
    if depth != 0 {
        return None;
    }
    if !current.is_empty() {
        chunks.push(join_uri(&current));
    }
    Some((op, chunks))
}

/// Operands of `uri` if it is a compound with operator `op`, else `[uri]`.
pub fn parse_possible_compound_uri(op: &str, uri: &str) -> Vec<String> {
    let marker = format!("/{op}/");
    if uri.starts_with(&marker) {
        if let Some((_, args)) = parse_compound_uri(uri) {
            return args;
        }
    }
    vec![uri.to_string()]
}

/// Canonical conjunction of sources: sorted, deduplicated, `/and/[...]`.
///
/// A single source is returned unchanged. Returns `None` for zero sources:
/// an empty conjunction would be trivially true and never belongs in the data.
pub fn conjunction_uri<S: AsRef<str>>(sources: &[S]) -> Option<String> {
    match sources {
        [] => None,
        [one] => Some(one.as_ref().to_string()),
        many => {
            let mut sorted: Vec<&str> = many.iter().map(AsRef::as_ref).collect();
            sorted.sort_unstable();
            sorted.dedup();
            if sorted.len() == 1 {
                return Some(sorted[0].to_string());
            }
            Some(compound_uri("/and", &sorted))
        }
    }
}

/// Assertion identifier: `/a/[/rel/,/start/,/end/]`.
pub fn assertion_uri(rel: &str, start: &str, end: &str) -> String {
    compound_uri("/a", &[rel, start, end])
}

/// Language code of a concept path (`/c/<lang>/...`), if any.
pub fn uri_language(uri: &str) -> Option<&str> {
    match split_uri(uri).as_slice() {
        ["c", lang, ..] => Some(*lang),
        _ => None,
    }
}
