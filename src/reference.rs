//! The `[[...]]` reference syntax.
//!
//! A reference names a target by content hash (`[[sha256:...]]`) or by identifier,
//! optionally followed by a dotted sub-path into the target's resolved fields:
//!
//! - `[[alice]]` links to the entity (SymbolicLink)
//! - `[[alice.address.city]]`, `[[team.members[0]]]` read a value (ValueLookup)
//! - `[[alice.address.*]]` inlines the whole substructure (DataInline)
//!
//! Identifiers may themselves contain dots, so a query is kept as a list of dotted
//! segments and the resolver decides where the head ends ([`Reference::splits`]).

use std::{fmt, ops::Range};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::properties::{is_content_hash, HASH_PREFIX};

static SEGMENT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([\w\-]+)((?:\[\d+\])*)$").expect("static regex"));
static INDEX_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[(\d+)\]").expect("static regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefKind {
    Id,
    Hash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectionMode {
    SymbolicLink,
    ValueLookup,
    DataInline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathSegment {
    Field(String),
    Index(usize),
    Wildcard,
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Field(name) => write!(f, ".{name}"),
            PathSegment::Index(i) => write!(f, "[{i}]"),
            PathSegment::Wildcard => f.write_str(".*"),
        }
    }
}

pub fn projection_mode(sub_path: &[PathSegment]) -> ProjectionMode {
    match sub_path.last() {
        None => ProjectionMode::SymbolicLink,
        Some(PathSegment::Wildcard) => ProjectionMode::DataInline,
        Some(_) => ProjectionMode::ValueLookup,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSyntaxError(pub String);

impl fmt::Display for ReferenceSyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A parsed reference query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub query: String,
    pub kind: RefKind,
    segments: Vec<String>,
}

impl Reference {
    /// Parse the text between the brackets.
    pub fn parse(query: &str) -> Result<Reference, ReferenceSyntaxError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ReferenceSyntaxError("empty reference".to_string()));
        }
        let kind = if query.starts_with(HASH_PREFIX) {
            RefKind::Hash
        } else {
            RefKind::Id
        };
        let segments: Vec<String> = if kind == RefKind::Hash {
            // hex digests contain no dots: the head ends at the first one
            let (head, rest) = query.split_once('.').unwrap_or((query, ""));
            if !is_content_hash(head) {
                return Err(ReferenceSyntaxError(format!("malformed content hash '{head}'")));
            }
            std::iter::once(head.to_string())
                .chain(rest.split('.').filter(|s| !s.is_empty()).map(str::to_string))
                .collect()
        } else {
            query.split('.').map(str::to_string).collect()
        };
        if segments.iter().any(String::is_empty) {
            return Err(ReferenceSyntaxError(format!("empty path segment in '{query}'")));
        }
        if let Some(pos) = segments.iter().position(|s| s == "*") {
            if pos + 1 != segments.len() {
                return Err(ReferenceSyntaxError(format!(
                    "wildcard must be the last segment in '{query}'"
                )));
            }
            if pos == 0 {
                return Err(ReferenceSyntaxError(format!("'{query}' has no target before '*'")));
            }
        }
        let reference = Reference {
            query: query.to_string(),
            kind,
            segments,
        };
        // every split must at least have a well-formed shortest sub-path
        reference.sub_path(1)?;
        Ok(reference)
    }

    /// Candidate (head, sub_path) splits, longest head first. Hash references have a
    /// single split.
    pub fn splits(&self) -> Vec<(String, Vec<PathSegment>)> {
        let max_head = match self.kind {
            RefKind::Hash => 1,
            RefKind::Id => self
                .segments
                .iter()
                .take_while(|s| s.as_str() != "*" && !s.contains('['))
                .count()
                .max(1),
        };
        (1..=max_head)
            .rev()
            .filter_map(|n| {
                let sub = self.sub_path(n).ok()?;
                let head = if n == 1 {
                    self.base_head()
                } else {
                    self.segments[..n].join(".")
                };
                Some((head, sub))
            })
            .collect()
    }

    /// Head when the query is read as `head.sub.path` with a single head segment.
    pub fn first_segment(&self) -> &str {
        &self.segments[0]
    }

    fn sub_path(&self, head_len: usize) -> Result<Vec<PathSegment>, ReferenceSyntaxError> {
        let mut path = vec![];
        let first = &self.segments[0];
        // `team[0]` style indexing directly on the head
        if head_len == 1 && self.kind == RefKind::Id {
            if let Some((_, indices)) = split_indices(first)? {
                path.extend(indices);
            }
        }
        for segment in &self.segments[head_len..] {
            if segment == "*" {
                path.push(PathSegment::Wildcard);
                continue;
            }
            match split_indices(segment)? {
                Some((name, indices)) => {
                    path.push(PathSegment::Field(name));
                    path.extend(indices);
                }
                None => path.push(PathSegment::Field(segment.clone())),
            }
        }
        Ok(path)
    }

    /// Head of the shortest split with any head-level indices removed.
    pub fn base_head(&self) -> String {
        let first = self.first_segment();
        first.split('[').next().unwrap_or(first).to_string()
    }
}

fn split_indices(segment: &str) -> Result<Option<(String, Vec<PathSegment>)>, ReferenceSyntaxError> {
    if !segment.contains('[') {
        return Ok(None);
    }
    let caps = SEGMENT_PATTERN
        .captures(segment)
        .ok_or_else(|| ReferenceSyntaxError(format!("malformed path segment '{segment}'")))?;
    let name = caps[1].to_string();
    let indices = INDEX_PATTERN
        .captures_iter(&caps[2])
        .filter_map(|c| c[1].parse::<usize>().ok())
        .map(PathSegment::Index)
        .collect();
    Ok(Some((name, indices)))
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[[{}]]", self.query)
    }
}

/// A `[[...]]` span inside a string value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceSpan {
    pub range: Range<usize>,
    pub query: String,
}

/// Find every `[[...]]` span in `text`. Single brackets inside a span (list indices)
/// are balanced so `[[team.members[0]]]` is one span.
pub fn find_spans(text: &str) -> Vec<ReferenceSpan> {
    let bytes = text.as_bytes();
    let mut spans = vec![];
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'[' && bytes[i + 1] == b'[' {
            let start = i;
            let mut depth = 0usize;
            let mut j = i + 2;
            let mut end = None;
            while j < bytes.len() {
                match bytes[j] {
                    b'[' => depth += 1,
                    b']' if depth > 0 => depth -= 1,
                    b']' if j + 1 < bytes.len() && bytes[j + 1] == b']' => {
                        end = Some(j);
                        break;
                    }
                    _ => {}
                }
                j += 1;
            }
            match end {
                Some(end) => {
                    spans.push(ReferenceSpan {
                        range: start..end + 2,
                        query: text[start + 2..end].to_string(),
                    });
                    i = end + 2;
                }
                None => break,
            }
        } else {
            i += 1;
        }
    }
    spans
}

/// Query of a string that is exactly one reference.
pub fn whole_reference(text: &str) -> Option<String> {
    let trimmed = text.trim();
    match find_spans(trimmed).as_slice() {
        [span] if span.range == (0..trimmed.len()) => Some(span.query.clone()),
        _ => None,
    }
}

/// Field path of a reference found in an entity body, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldReference {
    pub field_path: String,
    pub query: String,
    /// True when the whole string is the reference (its value is replaced), false
    /// for interpolation inside a longer string.
    pub whole: bool,
}

/// Collect every reference in a raw value tree.
pub fn collect_references(field: &str, value: &Value) -> Vec<FieldReference> {
    let mut found = vec![];
    walk(field.to_string(), value, &mut found);
    found
}

fn walk(path: String, value: &Value, found: &mut Vec<FieldReference>) {
    match value {
        Value::String(text) => {
            if let Some(query) = whole_reference(text) {
                found.push(FieldReference {
                    field_path: path,
                    query,
                    whole: true,
                });
            } else {
                found.extend(find_spans(text).into_iter().map(|span| FieldReference {
                    field_path: path.clone(),
                    query: span.query,
                    whole: false,
                }));
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                walk(format!("{path}[{i}]"), item, found);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                walk(format!("{path}.{key}"), item, found);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_log::test;

    #[test]
    fn test_parse_plain_link() {
        let r = Reference::parse("alice").unwrap();
        assert_eq!(r.kind, RefKind::Id);
        assert_eq!(r.splits(), vec![("alice".to_string(), vec![])]);
        assert_eq!(projection_mode(&r.splits()[0].1), ProjectionMode::SymbolicLink);
    }

    #[test]
    fn test_parse_value_lookup_splits() {
        let r = Reference::parse("users/alice.address.city").unwrap();
        let splits = r.splits();
        assert_eq!(splits.len(), 3);
        assert_eq!(splits[0].0, "users/alice.address.city");
        assert_eq!(
            splits[2],
            (
                "users/alice".to_string(),
                vec![
                    PathSegment::Field("address".to_string()),
                    PathSegment::Field("city".to_string())
                ]
            )
        );
        assert_eq!(projection_mode(&splits[2].1), ProjectionMode::ValueLookup);
    }

    #[test]
    fn test_parse_indices_and_wildcard() {
        let r = Reference::parse("team.members[1].name").unwrap();
        let splits = r.splits();
        // heads never contain indices
        assert_eq!(splits.len(), 1);
        assert_eq!(
            splits[0].1,
            vec![
                PathSegment::Field("members".to_string()),
                PathSegment::Index(1),
                PathSegment::Field("name".to_string())
            ]
        );

        let inline = Reference::parse("alice.address.*").unwrap();
        let last = inline.splits().pop().unwrap();
        assert_eq!(projection_mode(&last.1), ProjectionMode::DataInline);
    }

    #[test]
    fn test_parse_rejects_bad_queries() {
        assert!(Reference::parse("").is_err());
        assert!(Reference::parse("alice.*.name").is_err());
        assert!(Reference::parse("*").is_err());
        assert!(Reference::parse("alice..name").is_err());
        assert!(Reference::parse("sha256:1234").is_err());
        assert!(Reference::parse("alice.tags[x]").is_err());
    }

    #[test]
    fn test_parse_hash() {
        let hash = format!("sha256:{}", "ab".repeat(32));
        let r = Reference::parse(&format!("{hash}.name")).unwrap();
        assert_eq!(r.kind, RefKind::Hash);
        assert_eq!(
            r.splits(),
            vec![(hash, vec![PathSegment::Field("name".to_string())])]
        );
    }

    #[test]
    fn test_find_spans() {
        let spans = find_spans("Lead: [[alice]], backup [[team.members[0]]]!");
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].query, "alice");
        assert_eq!(spans[1].query, "team.members[0]");
        assert!(find_spans("no refs [here]").is_empty());
        assert!(find_spans("unterminated [[alice").is_empty());
        assert_eq!(whole_reference(" [[bob]] "), Some("bob".to_string()));
        assert_eq!(whole_reference("hi [[bob]]"), None);
    }

    #[test]
    fn test_collect_references() {
        let value = json!({"lead": "[[alice]]", "notes": ["see [[bob.name]] and [[carol]]"]});
        let mut refs = collect_references("root", &value);
        refs.sort_by(|a, b| a.query.cmp(&b.query));
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[0].field_path, "root.lead");
        assert!(refs[0].whole);
        assert_eq!(refs[1].field_path, "root.notes[0]");
        assert!(!refs[1].whole);
    }
}
