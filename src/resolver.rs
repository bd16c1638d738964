//! Resolution of `[[...]]` queries against the symbol table.
//!
//! Resolution happens in two steps. [`Resolver::resolve_head`] finds the target
//! (content hash, then exact handle / logical id, then fuzzy match collapsed to an
//! evolution tip) without touching any field data; the dependency graph is built
//! from these heads. [`project`] then applies the sub-path to the target's resolved
//! fields, once they exist.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    graph::EvolutionIndex,
    properties::{Entity, EntityKey, Fields, Target},
    reference::{projection_mode, PathSegment, ProjectionMode, RefKind, Reference},
    symbols::{FuzzyEntry, ScopeId, SymbolTable},
};

/// The value a reference stands for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Projection {
    /// Identifier of the target: an entity's logical id (else its hash), or the
    /// name of a schema or rule.
    SymbolicLink(String),
    ValueLookup(Value),
    DataInline(Value),
}

impl Projection {
    pub fn mode(&self) -> ProjectionMode {
        match self {
            Projection::SymbolicLink(_) => ProjectionMode::SymbolicLink,
            Projection::ValueLookup(_) => ProjectionMode::ValueLookup,
            Projection::DataInline(_) => ProjectionMode::DataInline,
        }
    }

    /// Value replacing a field that is exactly this reference.
    pub fn into_value(self) -> Value {
        match self {
            Projection::SymbolicLink(id) => Value::String(id),
            Projection::ValueLookup(value) | Projection::DataInline(value) => value,
        }
    }

    /// Text replacing a reference embedded in a longer string.
    pub fn to_text(&self) -> String {
        match self {
            Projection::SymbolicLink(id) => id.clone(),
            Projection::ValueLookup(Value::String(s)) | Projection::DataInline(Value::String(s)) => {
                s.clone()
            }
            Projection::ValueLookup(value) | Projection::DataInline(value) => value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionResult {
    Resolved { target: Target, projection: Projection },
    /// Nothing matched, or the sub-path does not exist. Carries the reason.
    NotFound(String),
    Ambiguous(Vec<Target>),
}

impl ResolutionResult {
    pub fn target(&self) -> Option<&Target> {
        match self {
            ResolutionResult::Resolved { target, .. } => Some(target),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, ResolutionResult::Resolved { .. })
    }
}

/// Outcome of the first resolution step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadResolution {
    Found {
        target: Target,
        sub_path: Vec<PathSegment>,
        /// True when the target came from fuzzy matching.
        fuzzy: bool,
    },
    NotFound(String),
    Ambiguous(Vec<Target>),
}

impl HeadResolution {
    pub fn entity(&self) -> Option<&EntityKey> {
        match self {
            HeadResolution::Found { target, .. } => target.as_entity(),
            _ => None,
        }
    }

    /// Whether the referencing entity needs the target's resolved fields.
    pub fn needs_fields(&self) -> bool {
        match self {
            HeadResolution::Found { sub_path, .. } => {
                projection_mode(sub_path) != ProjectionMode::SymbolicLink
            }
            _ => false,
        }
    }
}

/// Decides whether a query approximately names an entity.
pub trait FuzzyMatcher: Send + Sync {
    fn matches(&self, query: &str, entry: &FuzzyEntry) -> bool;
}

/// Default matcher:
///
/// - the logical id ends with the query on a `/` boundary (`alice` ~ `people/alice`)
/// - the last id segment starts with the query (`login` ~ `features/login-v2`)
/// - a name-like field equals the query, ignoring case
/// - an alias equals the query, ignoring case
#[derive(Debug, Clone)]
pub struct SegmentMatcher {
    min_query_len: usize,
}

impl SegmentMatcher {
    pub fn new(min_query_len: usize) -> Self {
        SegmentMatcher { min_query_len }
    }
}

impl Default for SegmentMatcher {
    fn default() -> Self {
        SegmentMatcher::new(2)
    }
}

impl FuzzyMatcher for SegmentMatcher {
    fn matches(&self, query: &str, entry: &FuzzyEntry) -> bool {
        let id = entry.logical_id.as_str();
        if !id.is_empty() {
            if id == query || id.ends_with(&format!("/{query}")) {
                return true;
            }
            let last = id.rsplit('/').next().unwrap_or(id);
            if query.len() >= self.min_query_len && !query.contains('/') && last.starts_with(query) {
                return true;
            }
        }
        entry
            .names
            .iter()
            .chain(entry.aliases.iter())
            .any(|name| name.to_lowercase() == query.to_lowercase())
    }
}

/// Read-only resolver over an assembled symbol table.
pub struct Resolver<'a> {
    symbols: &'a SymbolTable,
    evolution: &'a EvolutionIndex,
    matcher: Option<&'a dyn FuzzyMatcher>,
}

impl<'a> Resolver<'a> {
    /// `matcher` is `None` when fuzzy matching is switched off.
    pub fn new(
        symbols: &'a SymbolTable,
        evolution: &'a EvolutionIndex,
        matcher: Option<&'a dyn FuzzyMatcher>,
    ) -> Self {
        Resolver {
            symbols,
            evolution,
            matcher,
        }
    }

    pub fn resolve_head(&self, reference: &Reference, scope: ScopeId) -> HeadResolution {
        let splits = reference.splits();
        if reference.kind == RefKind::Hash {
            let Some((hash, sub_path)) = splits.into_iter().next() else {
                return HeadResolution::NotFound(format!("'{}' is empty", reference.query));
            };
            return match self.symbols.lookup_hash(&hash) {
                Some(key) => HeadResolution::Found {
                    target: Target::Entity(key.clone()),
                    sub_path,
                    fuzzy: false,
                },
                None => HeadResolution::NotFound(format!("no entity has content hash {hash}")),
            };
        }

        for (head, sub_path) in &splits {
            if let Some(target) = self.symbols.lookup(scope, head) {
                return HeadResolution::Found {
                    target,
                    sub_path: sub_path.clone(),
                    fuzzy: false,
                };
            }
        }

        if let Some(matcher) = self.matcher {
            for (head, sub_path) in splits {
                let candidates: Vec<&EntityKey> = self
                    .symbols
                    .fuzzy_entries()
                    .iter()
                    .filter(|entry| matcher.matches(&head, entry))
                    .map(|entry| &entry.key)
                    .collect();
                if candidates.is_empty() {
                    continue;
                }
                let tips: BTreeSet<EntityKey> =
                    candidates.into_iter().map(|key| self.evolution.tip(key)).collect();
                let mut tips = tips.into_iter();
                return match (tips.next(), tips.next()) {
                    (Some(tip), None) => {
                        tracing::trace!("[Resolver] '{}' fuzzily resolved to {}", head, tip);
                        HeadResolution::Found {
                            target: Target::Entity(tip),
                            sub_path,
                            fuzzy: true,
                        }
                    }
                    (first, second) => HeadResolution::Ambiguous(
                        first
                            .into_iter()
                            .chain(second)
                            .chain(tips)
                            .map(Target::Entity)
                            .collect(),
                    ),
                };
            }
        }
        HeadResolution::NotFound(format!("no target named '{}'", reference.query))
    }

    /// Both steps against a finished entity set.
    pub fn resolve(
        &self,
        reference: &Reference,
        scope: ScopeId,
        entities: &BTreeMap<EntityKey, Entity>,
    ) -> ResolutionResult {
        match self.resolve_head(reference, scope) {
            HeadResolution::Found {
                target, sub_path, ..
            } => match project(&target, &sub_path, entities) {
                Ok(projection) => ResolutionResult::Resolved { target, projection },
                Err(reason) => ResolutionResult::NotFound(reason),
            },
            HeadResolution::NotFound(reason) => ResolutionResult::NotFound(reason),
            HeadResolution::Ambiguous(candidates) => ResolutionResult::Ambiguous(candidates),
        }
    }
}

/// Apply a sub-path to a resolved target.
pub fn project(
    target: &Target,
    sub_path: &[PathSegment],
    entities: &BTreeMap<EntityKey, Entity>,
) -> Result<Projection, String> {
    let entity = match target {
        Target::Entity(key) => entities
            .get(key)
            .ok_or_else(|| format!("entity {key} no longer exists"))?,
        Target::Schema(schema) if sub_path.is_empty() => {
            return Ok(Projection::SymbolicLink(schema.name.clone()))
        }
        Target::Rule(key) if sub_path.is_empty() => {
            return Ok(Projection::SymbolicLink(key.to_string()))
        }
        other => return Err(format!("{other} has no fields")),
    };
    if sub_path.is_empty() {
        return Ok(Projection::SymbolicLink(entity.id().to_string()));
    }
    if !entity.is_resolved() {
        return Err(format!("'{}' is unresolved", entity.handle));
    }
    let mode = projection_mode(sub_path);
    let path = match mode {
        ProjectionMode::DataInline => &sub_path[..sub_path.len() - 1],
        _ => sub_path,
    };
    let value = navigate(&entity.resolved_fields, path)
        .map_err(|missing| format!("'{}' has no {missing}", entity.handle))?;
    match mode {
        ProjectionMode::DataInline if value.is_object() || value.is_array() => {
            Ok(Projection::DataInline(value))
        }
        ProjectionMode::DataInline => Err(format!(
            "cannot inline a scalar from '{}'",
            entity.handle
        )),
        _ => Ok(Projection::ValueLookup(value)),
    }
}

/// Follow a field path; the error names the first missing step.
fn navigate(fields: &Fields, path: &[PathSegment]) -> Result<Value, String> {
    let mut current: Option<&Value> = None;
    for (depth, segment) in path.iter().enumerate() {
        let next = match (current, segment) {
            (None, PathSegment::Field(name)) => fields.get(name),
            (None, PathSegment::Index(_)) => None,
            (Some(value), PathSegment::Field(name)) => value.get(name),
            (Some(value), PathSegment::Index(i)) => value.get(*i),
            (_, PathSegment::Wildcard) => None,
        };
        current = Some(next.ok_or_else(|| {
            path[..=depth]
                .iter()
                .map(|s| s.to_string())
                .collect::<String>()
                .trim_start_matches('.')
                .to_string()
        })?);
    }
    Ok(current
        .cloned()
        .unwrap_or_else(|| Value::Object(fields.clone())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        properties::{Block, BlockKey, BlockKind, EntityStatus, SchemaRef},
        symbols::Binding,
    };
    use serde_json::json;
    use std::path::Path;
    use test_log::test;

    struct Fixture {
        symbols: SymbolTable,
        evolution: EvolutionIndex,
        entities: BTreeMap<EntityKey, Entity>,
    }

    fn entity(path: &str, ordinal: usize, handle: &str, id: Option<&str>, fields: Value) -> Entity {
        let mut block = Block::new(BlockKind::Instance, handle, "");
        block.type_name = Some("User".to_string());
        block.explicit_id = id.map(str::to_string);
        let fields = fields.as_object().cloned().unwrap();
        let mut entity = Entity::from_block(BlockKey::new(path, ordinal), &block, Some(fields.clone()));
        entity.resolved_fields = fields;
        entity.status = EntityStatus::Resolved;
        entity
    }

    fn fixture() -> Fixture {
        let all = vec![
            entity("people/team.td", 0, "alice", Some("people/alice"), json!({
                "name": "Alice", "address": {"city": "Oslo"}, "tags": ["a", "b"]
            })),
            entity("people/team.td", 1, "bob", None, json!({"name": "Robert"})),
            entity("features.td", 0, "login_v1", Some("features/login-v1"), json!({"name": "Login"})),
            entity("features.td", 1, "login_v2", Some("features/login-v2"), json!({"name": "Login"})),
            entity("features.td", 2, "login_v3", Some("features/login-v3"), json!({"name": "Login"})),
            entity("other.td", 0, "alicia", Some("other/alicia"), json!({"name": "Alicia"})),
        ];
        let mut symbols = SymbolTable::new();
        let mut fuzzy = vec![];
        for e in &all {
            let scope = symbols.scopes.file_scope(&e.key.path);
            symbols
                .bind(
                    scope,
                    &e.handle,
                    Binding {
                        target: Target::Entity(e.key.clone()),
                        owner: e.key.clone(),
                        location: None,
                    },
                )
                .unwrap();
            if let Some(id) = &e.logical_id {
                symbols.register_global(id, Target::Entity(e.key.clone())).unwrap();
            }
            symbols
                .register_global(&e.content_hash, Target::Entity(e.key.clone()))
                .unwrap();
            fuzzy.push(FuzzyEntry {
                key: e.key.clone(),
                logical_id: e.logical_id.clone().unwrap_or_default(),
                names: vec![e.resolved_fields["name"].as_str().unwrap().to_string()],
                aliases: vec![],
            });
        }
        symbols.set_fuzzy_index(fuzzy);
        let (evolution, forks) = EvolutionIndex::build(vec![
            (all[3].key.clone(), all[2].key.clone()),
            (all[4].key.clone(), all[3].key.clone()),
        ]);
        assert!(forks.is_empty());
        Fixture {
            symbols,
            evolution,
            entities: all.into_iter().map(|e| (e.key.clone(), e)).collect(),
        }
    }

    impl Fixture {
        fn resolve(&self, query: &str, from: &str) -> ResolutionResult {
            let matcher = SegmentMatcher::default();
            let resolver = Resolver::new(&self.symbols, &self.evolution, Some(&matcher));
            let scope = self.symbols.scopes.scope_for(Path::new(from));
            resolver.resolve(&Reference::parse(query).unwrap(), scope, &self.entities)
        }

        fn key(&self, handle: &str) -> EntityKey {
            self.entities
                .values()
                .find(|e| e.handle == handle)
                .map(|e| e.key.clone())
                .unwrap()
        }
    }

    #[test]
    fn test_exact_handle_and_id() {
        let f = fixture();
        assert_eq!(
            f.resolve("alice", "people/team.td"),
            ResolutionResult::Resolved {
                target: Target::Entity(f.key("alice")),
                projection: Projection::SymbolicLink("people/alice".to_string()),
            }
        );
        // bob has no logical id, so the link carries his hash
        let bob = &f.entities[&f.key("bob")];
        assert_eq!(
            f.resolve("bob", "people/team.td"),
            ResolutionResult::Resolved {
                target: Target::Entity(bob.key.clone()),
                projection: Projection::SymbolicLink(bob.content_hash.clone()),
            }
        );
        // handles are file local; logical ids are global
        assert!(matches!(f.resolve("bob", "other.td"), ResolutionResult::NotFound(_)));
        assert!(f.resolve("people/alice", "other.td").is_resolved());
    }

    #[test]
    fn test_hash_lookup_ignores_scope() {
        let f = fixture();
        let bob = &f.entities[&f.key("bob")];
        let result = f.resolve(&bob.content_hash, "features.td");
        assert_eq!(result.target(), Some(&Target::Entity(bob.key.clone())));
        let missing = format!("sha256:{}", "0".repeat(64));
        assert!(matches!(f.resolve(&missing, "features.td"), ResolutionResult::NotFound(_)));
    }

    #[test]
    fn test_value_lookup_and_inline() {
        let f = fixture();
        let lookup = |q: &str| match f.resolve(q, "people/team.td") {
            ResolutionResult::Resolved { projection, .. } => projection,
            other => panic!("{q}: {other:?}"),
        };
        assert_eq!(lookup("alice.address.city"), Projection::ValueLookup(json!("Oslo")));
        assert_eq!(lookup("people/alice.tags[1]"), Projection::ValueLookup(json!("b")));
        assert_eq!(lookup("alice.address.*"), Projection::DataInline(json!({"city": "Oslo"})));
        assert_eq!(lookup("alice.*").mode(), ProjectionMode::DataInline);
        assert!(matches!(
            f.resolve("alice.address.zip", "people/team.td"),
            ResolutionResult::NotFound(reason) if reason.contains("address.zip")
        ));
        assert!(matches!(
            f.resolve("alice.name.*", "people/team.td"),
            ResolutionResult::NotFound(_)
        ));
    }

    #[test]
    fn test_fuzzy_collapses_to_tip() {
        let f = fixture();
        assert_eq!(
            f.resolve("login", "other.td").target(),
            Some(&Target::Entity(f.key("login_v3")))
        );
        // an explicit id names that exact version
        assert_eq!(
            f.resolve("features/login-v1", "other.td").target(),
            Some(&Target::Entity(f.key("login_v1")))
        );
        // name field match
        assert_eq!(
            f.resolve("Alicia", "features.td").target(),
            Some(&Target::Entity(f.key("alicia")))
        );
    }

    #[test]
    fn test_fuzzy_ambiguity_across_families() {
        let f = fixture();
        match f.resolve("ali", "features.td") {
            ResolutionResult::Ambiguous(candidates) => assert_eq!(
                candidates,
                vec![
                    Target::Entity(f.key("alicia")),
                    Target::Entity(f.key("alice")),
                ]
            ),
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn test_fuzzy_disabled() {
        let f = fixture();
        let resolver = Resolver::new(&f.symbols, &f.evolution, None);
        let scope = f.symbols.scopes.scope_for(Path::new("other.td"));
        assert!(matches!(
            resolver.resolve_head(&Reference::parse("login").unwrap(), scope),
            HeadResolution::NotFound(_)
        ));
    }

    #[test]
    fn test_schema_target() {
        let mut f = fixture();
        let origin = BlockKey::new("models.td", 0);
        let scope = f.symbols.scopes.directory_scope(Path::new(""));
        f.symbols
            .bind(
                scope,
                "User",
                Binding {
                    target: Target::Schema(SchemaRef {
                        name: "User".to_string(),
                        origin: origin.clone(),
                    }),
                    owner: origin,
                    location: None,
                },
            )
            .unwrap();
        assert!(matches!(
            f.resolve("User", "other.td"),
            ResolutionResult::Resolved { projection: Projection::SymbolicLink(name), .. } if name == "User"
        ));
        assert!(matches!(f.resolve("User.name", "other.td"), ResolutionResult::NotFound(_)));
    }
}
