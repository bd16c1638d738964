//! Core data model: blocks, entities, targets and content addressing.
//!
//! Every addressable unit of a document is a [`Block`]. Instance blocks become
//! [`Entity`] values whose `raw_fields` are filled during scanning and whose
//! `resolved_fields` are completed during validation.

use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// Field maps of raw and resolved entity data.
pub type Fields = Map<String, Value>;

pub const HASH_PREFIX: &str = "sha256:";

/// Reserved body keys that carry evolution links instead of data.
pub const FORMER_KEY: &str = "former";
pub const DERIVED_FROM_KEY: &str = "derived_from";
/// Logical ids belong in the block signature; this key is rejected in bodies.
pub const RESERVED_ID_KEY: &str = "id";

/// Location of a block (or a line inside it) relative to the project root.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    pub path: PathBuf,
    /// 1-based, inclusive
    pub line_start: usize,
    /// 1-based, inclusive
    pub line_end: usize,
    pub column: usize,
}

impl SourceLocation {
    pub fn new(path: impl Into<PathBuf>, line_start: usize, line_end: usize) -> Self {
        SourceLocation {
            path: path.into(),
            line_start,
            line_end,
            column: 0,
        }
    }

    /// Whole-file location, used for file level problems.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        SourceLocation::new(path, 1, 1)
    }

    /// Narrow the location to a single line inside the block.
    pub fn at_line(&self, line: usize) -> Self {
        SourceLocation {
            path: self.path.clone(),
            line_start: line,
            line_end: line,
            column: self.column,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.path.display(), self.line_start)?;
        if self.column > 0 {
            write!(f, ":{}", self.column)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BlockKind {
    Schema,
    Instance,
    Rule,
    ScopeConfig,
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlockKind::Schema => "model",
            BlockKind::Instance => "entity",
            BlockKind::Rule => "spec",
            BlockKind::ScopeConfig => "config",
        };
        f.write_str(name)
    }
}

/// A typed unit of a document, as reported by a [`crate::codec::DocParser`].
///
/// Blocks are immutable. Re-scanning a file replaces all of its blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub kind: BlockKind,
    pub handle: String,
    /// Schema name for instance blocks.
    pub type_name: Option<String>,
    pub explicit_id: Option<String>,
    /// Body language for configuration blocks.
    pub language: Option<String>,
    pub raw_body: String,
    pub location: SourceLocation,
}

impl Block {
    pub fn new(kind: BlockKind, handle: impl Into<String>, raw_body: impl Into<String>) -> Self {
        Block {
            kind,
            handle: handle.into(),
            type_name: None,
            explicit_id: None,
            language: None,
            raw_body: raw_body.into(),
            location: SourceLocation::default(),
        }
    }

    /// 1-based line of the first body line containing `needle`, falling back to the
    /// fence line.
    pub fn line_of(&self, needle: &str) -> usize {
        self.raw_body
            .lines()
            .position(|line| line.contains(needle))
            .map(|offset| self.location.line_start + 1 + offset)
            .unwrap_or(self.location.line_start)
    }
}

/// Stable identity of a block within one set of documents: the file it lives in and
/// its position among that file's blocks. The derived ordering is source order.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockKey {
    pub path: PathBuf,
    pub ordinal: usize,
}

impl BlockKey {
    pub fn new(path: impl Into<PathBuf>, ordinal: usize) -> Self {
        BlockKey {
            path: path.into(),
            ordinal,
        }
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.path.display(), self.ordinal)
    }
}

pub type EntityKey = BlockKey;

/// Handle to a schema registered with a [`crate::codec::SchemaEngine`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SchemaRef {
    pub name: String,
    pub origin: BlockKey,
}

/// Anything a handle or identifier can be bound to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Target {
    Entity(EntityKey),
    Schema(SchemaRef),
    Rule(BlockKey),
}

impl Target {
    pub fn as_entity(&self) -> Option<&EntityKey> {
        match self {
            Target::Entity(key) => Some(key),
            _ => None,
        }
    }

    pub fn as_schema(&self) -> Option<&SchemaRef> {
        match self {
            Target::Schema(schema) => Some(schema),
            _ => None,
        }
    }

    /// Owning block of the target.
    pub fn origin(&self) -> &BlockKey {
        match self {
            Target::Entity(key) | Target::Rule(key) => key,
            Target::Schema(schema) => &schema.origin,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Entity(key) => write!(f, "entity {key}"),
            Target::Schema(schema) => write!(f, "model {} ({})", schema.name, schema.origin),
            Target::Rule(key) => write!(f, "spec {key}"),
        }
    }
}

/// A `former` or `derived_from` link as declared, and what it resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvolutionLink {
    pub query: String,
    pub target: Option<EntityKey>,
    /// Set when the link takes part in an evolution fork and was left out of the merge.
    pub excluded: bool,
}

impl EvolutionLink {
    pub fn unresolved(query: impl Into<String>) -> Self {
        EvolutionLink {
            query: query.into(),
            target: None,
            excluded: false,
        }
    }

    /// The target, if the link participates in merging.
    pub fn merge_target(&self) -> Option<&EntityKey> {
        if self.excluded {
            None
        } else {
            self.target.as_ref()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityStatus {
    /// Scanned but not validated yet.
    #[default]
    Raw,
    /// Every field resolved.
    Resolved,
    /// Resolved with placeholders for references that failed.
    Partial,
    /// Member of a dependency cycle; resolved_fields were not computed.
    Unresolved,
}

/// A data instance. Raw on scan, completed by validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub key: EntityKey,
    pub handle: String,
    pub logical_id: Option<String>,
    pub content_hash: String,
    /// Schema name as written in the block signature.
    pub type_name: String,
    pub schema_ref: Option<SchemaRef>,
    pub raw_fields: Fields,
    pub resolved_fields: Fields,
    pub former: Option<EvolutionLink>,
    pub derived_from: Option<EvolutionLink>,
    pub status: EntityStatus,
    pub location: SourceLocation,
}

impl Entity {
    /// Build the raw entity of an instance block from its parsed body.
    pub fn from_block(key: EntityKey, block: &Block, body: Option<Fields>) -> Self {
        let (raw_fields, content_hash) = match body {
            Some(fields) => {
                let hash = content_hash(&Value::Object(fields.clone()));
                (fields, hash)
            }
            None => (Fields::new(), content_hash_text(&block.raw_body)),
        };
        let former = raw_fields.get(FORMER_KEY).and_then(link_query).map(EvolutionLink::unresolved);
        let derived_from = raw_fields
            .get(DERIVED_FROM_KEY)
            .and_then(link_query)
            .map(EvolutionLink::unresolved);
        Entity {
            key,
            handle: block.handle.clone(),
            logical_id: block.explicit_id.clone(),
            content_hash,
            type_name: block.type_name.clone().unwrap_or_default(),
            schema_ref: None,
            raw_fields,
            resolved_fields: Fields::new(),
            former,
            derived_from,
            status: EntityStatus::Raw,
            location: block.location.clone(),
        }
    }

    /// Globally resolvable identifier: the logical id, or the content hash.
    pub fn id(&self) -> &str {
        self.logical_id.as_deref().unwrap_or(&self.content_hash)
    }

    /// Raw fields without the reserved evolution keys.
    pub fn data_fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.raw_fields
            .iter()
            .filter(|(k, _)| k.as_str() != FORMER_KEY && k.as_str() != DERIVED_FROM_KEY)
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.status, EntityStatus::Resolved | EntityStatus::Partial)
    }
}

/// Query text of an evolution link value: `[[q]]` or a bare identifier.
fn link_query(value: &Value) -> Option<String> {
    let text = value.as_str()?.trim();
    let query = text
        .strip_prefix("[[")
        .and_then(|rest| rest.strip_suffix("]]"))
        .unwrap_or(text)
        .trim();
    if query.is_empty() {
        None
    } else {
        Some(query.to_string())
    }
}

/// YAML reads the `[[x]]` reference sugar as a one-element list holding a one-element
/// list. Turn those back into reference strings, recursively.
pub fn desugar(value: Value) -> Value {
    match value {
        Value::Array(items) => {
            if let Some(query) = sugared_reference(&items) {
                return Value::String(format!("[[{query}]]"));
            }
            Value::Array(items.into_iter().map(desugar).collect())
        }
        Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, desugar(v))).collect()),
        other => other,
    }
}

fn sugared_reference(items: &[Value]) -> Option<String> {
    match items {
        [Value::Array(inner)] => match inner.as_slice() {
            [Value::String(query)] => Some(query.clone()),
            _ => None,
        },
        _ => None,
    }
}

/// True when a desugared value still holds a list of lists.
pub fn has_nested_list(value: &Value) -> bool {
    match value {
        Value::Array(items) => items
            .iter()
            .any(|item| item.is_array() || has_nested_list(item)),
        Value::Object(map) => map.values().any(has_nested_list),
        _ => false,
    }
}

/// Canonical text form: object keys sorted, strings NFC-normalised, no whitespace.
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, &Value)> =
                map.iter().map(|(k, v)| (k.nfc().collect(), v)).collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::String(s) => out.push_str(&Value::String(s.nfc().collect()).to_string()),
        other => out.push_str(&other.to_string()),
    }
}

/// `sha256:<hex>` digest of the canonical form of `value`.
pub fn content_hash(value: &Value) -> String {
    digest(canonicalize(value).as_bytes())
}

/// Fallback digest for bodies that are not structured data: comment lines dropped,
/// whitespace collapsed.
pub fn content_hash_text(text: &str) -> String {
    let normalized = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join("\n");
    digest(normalized.nfc().collect::<String>().as_bytes())
}

fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{HASH_PREFIX}{}", hex::encode(hasher.finalize()))
}

pub fn is_content_hash(text: &str) -> bool {
    text.strip_prefix(HASH_PREFIX)
        .map(|hex| hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit()))
        .unwrap_or(false)
}
