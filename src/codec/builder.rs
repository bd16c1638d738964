//! The Validate stage.
//!
//! Validation is always project-wide. It starts from the per-file products of Scan
//! and Link and rebuilds everything derived from them, in source order, so the
//! outcome does not depend on which files were re-linked or when:
//!
//! 1. assemble the symbol table (handles, logical ids, hashes, config aliases)
//! 2. attach schemas and build the fuzzy index
//! 3. resolve `former` / `derived_from` links and cut evolution forks
//! 4. resolve every reference head and build the dependency graph
//! 5. mark cycle members unresolved
//! 6. in topological order, merge evolution parents, project references and
//!    instantiate each entity through the schema engine

use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};

use serde_json::Value;

use crate::{
    codec::{
        diagnostic::{Diagnostic, DiagnosticCode},
        linker::LinkedUnit,
        schema::SchemaEngine,
        spec_runner::RuleBlock,
    },
    config::ResolverConfig,
    graph::{DependencyGraph, EdgeKind, EvolutionIndex},
    properties::{
        is_content_hash, Block, BlockKey, BlockKind, Entity, EntityKey, EntityStatus,
        EvolutionLink, Fields, SchemaRef, SourceLocation, Target, DERIVED_FROM_KEY, FORMER_KEY,
        RESERVED_ID_KEY,
    },
    reference::{collect_references, find_spans, whole_reference, Reference},
    resolver::{project, FuzzyMatcher, HeadResolution, Projection, Resolver},
    symbols::{Binding, FuzzyEntry, ScopeId, SymbolError, SymbolTable},
};

/// The Scan and Link products of one file.
#[derive(Debug, Clone, Copy)]
pub struct FileProducts<'a> {
    pub path: &'a Path,
    pub blocks: &'a [Block],
    /// Raw entities, one per instance block.
    pub entities: &'a [Entity],
    pub linked: &'a LinkedUnit,
}

/// Everything a validation run produced.
#[derive(Debug, Clone, Default)]
pub struct ValidationOutput {
    /// Entities in source order.
    pub entities: BTreeMap<EntityKey, Entity>,
    pub evolution: EvolutionIndex,
    pub graph: DependencyGraph,
    /// Reference heads of every entity, by query text.
    pub links: BTreeMap<EntityKey, BTreeMap<String, HeadResolution>>,
    pub rules: Vec<RuleBlock>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Line lookup for diagnostics.
struct Locator<'a> {
    blocks: BTreeMap<&'a Path, &'a [Block]>,
}

impl<'a> Locator<'a> {
    fn new(files: &[FileProducts<'a>]) -> Self {
        Locator {
            blocks: files.iter().map(|file| (file.path, file.blocks)).collect(),
        }
    }

    fn block(&self, key: &BlockKey) -> Option<&'a Block> {
        self.blocks
            .get(key.path.as_path())
            .and_then(|blocks| blocks.get(key.ordinal))
    }

    /// Location of the first line of `key`'s block containing `needle`.
    fn locate(&self, key: &BlockKey, needle: &str) -> SourceLocation {
        match self.block(key) {
            Some(block) => block.location.at_line(block.line_of(needle)),
            None => SourceLocation::file(&key.path),
        }
    }

    fn whole(&self, key: &BlockKey) -> SourceLocation {
        self.block(key)
            .map(|block| block.location.clone())
            .unwrap_or_else(|| SourceLocation::file(&key.path))
    }
}

/// Builds the validated graph from per-file products.
pub struct GraphBuilder<'a> {
    engine: &'a dyn SchemaEngine,
    matcher: Option<&'a dyn FuzzyMatcher>,
    config: &'a ResolverConfig,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(
        engine: &'a dyn SchemaEngine,
        matcher: Option<&'a dyn FuzzyMatcher>,
        config: &'a ResolverConfig,
    ) -> Self {
        GraphBuilder {
            engine,
            matcher,
            config,
        }
    }

    /// Validate the project. `files` must be in path order.
    #[tracing::instrument(skip_all)]
    pub fn build(&self, symbols: &mut SymbolTable, files: &[FileProducts<'_>]) -> ValidationOutput {
        let locator = Locator::new(files);
        let mut output = ValidationOutput::default();

        tracing::debug!("Phase 1: assemble symbol table");
        self.assemble(symbols, files, &locator, &mut output.diagnostics);

        tracing::debug!("Phase 2: attach schemas");
        let mut entities: BTreeMap<EntityKey, Entity> = files
            .iter()
            .flat_map(|file| file.entities.iter().cloned())
            .map(|entity| (entity.key.clone(), entity))
            .collect();
        self.attach_schemas(symbols, &mut entities, &locator, &mut output.diagnostics);

        tracing::debug!("Phase 3: evolution links");
        let evolution = self.link_evolution(symbols, &mut entities, &locator, &mut output.diagnostics);

        tracing::debug!("Phase 4: reference heads and dependency graph");
        let resolver = Resolver::new(symbols, &evolution, self.matcher);
        let mut graph = DependencyGraph::new();
        for key in entities.keys() {
            graph.add_entity(key.clone());
        }
        for entity in entities.values() {
            for (link, kind) in [
                (entity.former.as_ref(), EdgeKind::Supersedes),
                (entity.derived_from.as_ref(), EdgeKind::DerivesFrom),
            ] {
                let Some(link) = link else { continue };
                match (link.merge_target(), link.target.as_ref()) {
                    (Some(target), _) => {
                        graph.add_edge(target, &entity.key, kind);
                    }
                    (None, Some(target)) => graph.add_mention(target, &entity.key),
                    (None, None) => {}
                }
            }
            let heads = self.resolve_heads(entity, &resolver, symbols, &mut graph, &locator, &mut output.diagnostics);
            output.links.insert(entity.key.clone(), heads);
        }

        tracing::debug!("Phase 5: cycles");
        let mut excluded = BTreeSet::new();
        for cycle in graph.cycles() {
            let names: Vec<&str> = cycle
                .iter()
                .filter_map(|key| entities.get(key).map(|e| e.handle.as_str()))
                .collect();
            let mut diagnostic = Diagnostic::new(
                DiagnosticCode::E0342,
                format!("circular dependency between {}", names.join(", ")),
            )
            .at(locator.whole(&cycle[0]))
            .with_detail("members", names.join(","));
            for (i, key) in cycle.iter().enumerate() {
                diagnostic = diagnostic.with_detail(format!("member{i}"), key);
            }
            output.diagnostics.push(diagnostic);
            for key in cycle {
                if let Some(entity) = entities.get_mut(&key) {
                    entity.status = EntityStatus::Unresolved;
                    entity.resolved_fields.clear();
                }
                excluded.insert(key);
            }
        }

        tracing::debug!("Phase 6: merge, project and instantiate");
        for key in graph.topological_order(&excluded) {
            let Some(mut entity) = entities.remove(&key) else {
                continue;
            };
            let heads = output.links.get(&key).cloned().unwrap_or_default();
            self.evaluate(&mut entity, &heads, &entities, &locator, &mut output.diagnostics);
            entities.insert(key, entity);
        }

        output.rules = files
            .iter()
            .flat_map(|file| {
                file.blocks
                    .iter()
                    .enumerate()
                    .filter(|(_, block)| block.kind == BlockKind::Rule)
                    .map(|(ordinal, block)| RuleBlock {
                        key: BlockKey::new(file.path, ordinal),
                        name: block.handle.clone(),
                        body: block.raw_body.clone(),
                        location: block.location.clone(),
                    })
            })
            .collect();

        tracing::debug!(
            "[Validate] {} entities, {} edges, {} diagnostics",
            entities.len(),
            graph.edges().len(),
            output.diagnostics.len()
        );
        output.entities = entities;
        output.evolution = evolution;
        output.graph = graph;
        output
    }

    fn assemble(
        &self,
        symbols: &mut SymbolTable,
        files: &[FileProducts<'_>],
        locator: &Locator<'_>,
        diagnostics: &mut Vec<Diagnostic>,
    ) {
        symbols.reset();
        for file in files {
            let file_scope = symbols.scopes.file_scope(file.path);
            let dir_scope = symbols
                .scopes
                .directory_scope(file.path.parent().unwrap_or(Path::new("")));
            for (ordinal, block) in file.blocks.iter().enumerate() {
                let key = BlockKey::new(file.path, ordinal);
                let (scope, target) = match block.kind {
                    BlockKind::Schema => match file.linked.schemas.get(&ordinal) {
                        Some(schema) => {
                            symbols.register_schema_name(schema.clone());
                            (dir_scope, Target::Schema(schema.clone()))
                        }
                        None => continue,
                    },
                    BlockKind::Instance => (file_scope, Target::Entity(key.clone())),
                    BlockKind::Rule => (file_scope, Target::Rule(key.clone())),
                    BlockKind::ScopeConfig => continue,
                };
                let binding = Binding {
                    target,
                    owner: key.clone(),
                    location: Some(block.location.clone()),
                };
                if let Err(err) = symbols.bind(scope, &block.handle, binding) {
                    diagnostics.push(duplicate_handle(err, locator.whole(&key)));
                }
            }
            for entity in file.entities {
                let target = Target::Entity(entity.key.clone());
                if let Some(id) = &entity.logical_id {
                    if let Err(SymbolError::DuplicateId { existing, .. }) =
                        symbols.register_global(id, target.clone())
                    {
                        diagnostics.push(
                            Diagnostic::new(
                                DiagnosticCode::E0241,
                                format!("logical id '{id}' is already used by {existing}"),
                            )
                            .at(locator.whole(&entity.key))
                            .with_detail("id", id)
                            .with_detail("existing", existing.origin()),
                        );
                    }
                }
                // identical content: the first entity in source order keeps the hash
                if symbols.register_global(&entity.content_hash, target).is_err() {
                    tracing::trace!("[Validate] {} repeats earlier content", entity.key);
                }
            }
        }

        for file in files {
            for alias in &file.linked.aliases {
                let scope = symbols.scopes.directory_scope(&alias.dir);
                let target = if is_content_hash(&alias.query) {
                    symbols.lookup_hash(&alias.query).cloned().map(Target::Entity)
                } else {
                    symbols.lookup(scope, &alias.query)
                };
                let Some(target) = target else {
                    diagnostics.push(
                        Diagnostic::new(
                            DiagnosticCode::E0341,
                            format!(
                                "configuration alias '{}' names unknown target [[{}]]",
                                alias.handle, alias.query
                            ),
                        )
                        .at(alias.location.clone())
                        .with_detail("query", &alias.query),
                    );
                    continue;
                };
                let binding = Binding {
                    target,
                    owner: alias.owner.clone(),
                    location: Some(alias.location.clone()),
                };
                if let Err(err) = symbols.bind(scope, &alias.handle, binding) {
                    diagnostics.push(duplicate_handle(err, alias.location.clone()));
                }
            }
        }
    }

    fn attach_schemas(
        &self,
        symbols: &mut SymbolTable,
        entities: &mut BTreeMap<EntityKey, Entity>,
        locator: &Locator<'_>,
        diagnostics: &mut Vec<Diagnostic>,
    ) {
        let mut fuzzy = Vec::with_capacity(entities.len());
        for entity in entities.values_mut() {
            let scope = symbols.scopes.scope_for(&entity.key.path);
            entity.schema_ref = symbols.lookup_schema(scope, &entity.type_name);
            if entity.schema_ref.is_none() {
                diagnostics.push(
                    Diagnostic::new(
                        DiagnosticCode::E0364,
                        format!("'{}' is an instance of unknown model '{}'", entity.handle, entity.type_name),
                    )
                    .at(locator.whole(&entity.key))
                    .with_detail("model", &entity.type_name),
                );
            }
            if entity.raw_fields.contains_key(RESERVED_ID_KEY) {
                diagnostics.push(
                    Diagnostic::new(
                        DiagnosticCode::E0363,
                        format!(
                            "'{}' sets 'id' in its body; write `@<id>` in the block signature instead",
                            entity.handle
                        ),
                    )
                    .at(locator.locate(&entity.key, &format!("{RESERVED_ID_KEY}:"))),
                );
            }

            let names = self
                .config
                .name_fields
                .iter()
                .filter_map(|field| entity.raw_fields.get(field))
                .filter_map(|value| value.as_str().map(str::to_string))
                .collect();
            let aliases = match &entity.schema_ref {
                Some(schema) => self
                    .engine
                    .alias_fields(schema)
                    .iter()
                    .filter_map(|field| entity.raw_fields.get(field))
                    .flat_map(string_values)
                    .collect(),
                None => vec![],
            };
            fuzzy.push(FuzzyEntry {
                key: entity.key.clone(),
                logical_id: entity.logical_id.clone().unwrap_or_default(),
                names,
                aliases,
            });
        }
        symbols.set_fuzzy_index(fuzzy);
    }

    fn link_evolution(
        &self,
        symbols: &SymbolTable,
        entities: &mut BTreeMap<EntityKey, Entity>,
        locator: &Locator<'_>,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> EvolutionIndex {
        // exact `former` links first: the chains they form let fuzzy evolution
        // queries collapse to a tip like any other reference
        let unchained = EvolutionIndex::default();
        let exact = Resolver::new(symbols, &unchained, None);
        for entity in entities.values_mut() {
            let scope = symbols.scopes.scope_for(&entity.key.path);
            if let Some(link) = entity.former.as_mut() {
                if let Ok(target) = resolve_link(&exact, link, scope) {
                    link.target = Some(target);
                }
            }
        }
        let (chained, _) = EvolutionIndex::build(entities.values().filter_map(|entity| {
            let target = entity.former.as_ref()?.target.clone()?;
            Some((entity.key.clone(), target))
        }));

        let resolver = Resolver::new(symbols, &chained, self.matcher);
        for entity in entities.values_mut() {
            let scope = symbols.scopes.scope_for(&entity.key.path);
            for (slot, name) in [
                (&mut entity.former, FORMER_KEY),
                (&mut entity.derived_from, DERIVED_FROM_KEY),
            ] {
                let Some(link) = slot.as_mut() else { continue };
                if link.target.is_some() {
                    continue;
                }
                let location = locator.locate(&entity.key, &format!("{name}:"));
                match resolve_link(&resolver, link, scope) {
                    Ok(target) => link.target = Some(target),
                    Err((code, message)) => diagnostics.push(
                        Diagnostic::new(code, format!("'{}': {message}", entity.handle))
                            .at(location)
                            .with_detail("query", &link.query),
                    ),
                }
            }
        }

        let (evolution, forks) = EvolutionIndex::build(entities.values().filter_map(|entity| {
            let target = entity.former.as_ref()?.target.clone()?;
            Some((entity.key.clone(), target))
        }));
        for fork in forks {
            let handle = |key: &EntityKey| {
                entities
                    .get(key)
                    .map(|e| e.handle.clone())
                    .unwrap_or_else(|| key.to_string())
            };
            let excluded: Vec<String> = fork.excluded.iter().map(&handle).collect();
            diagnostics.push(
                Diagnostic::new(
                    DiagnosticCode::E0345,
                    format!(
                        "evolution fork: '{}' is the former of '{}' and '{}'; only '{}' continues the chain",
                        handle(&fork.target),
                        handle(&fork.kept),
                        excluded.join("', '"),
                        handle(&fork.kept),
                    ),
                )
                .at(locator.locate(&fork.excluded[0], &format!("{FORMER_KEY}:")))
                .with_detail("target", &fork.target)
                .with_detail("kept", &fork.kept)
                .with_detail("excluded", excluded.join(",")),
            );
            for key in &fork.excluded {
                if let Some(link) = entities.get_mut(key).and_then(|e| e.former.as_mut()) {
                    link.excluded = true;
                }
            }
        }
        evolution
    }

    fn resolve_heads(
        &self,
        entity: &Entity,
        resolver: &Resolver<'_>,
        symbols: &SymbolTable,
        graph: &mut DependencyGraph,
        locator: &Locator<'_>,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> BTreeMap<String, HeadResolution> {
        let scope = symbols.scopes.scope_for(&entity.key.path);
        let mut heads = BTreeMap::new();
        for (field, value) in entity.data_fields() {
            for found in collect_references(field, value) {
                if heads.contains_key(&found.query) {
                    continue;
                }
                let location = locator.locate(&entity.key, &format!("[[{}", found.query));
                let head = match Reference::parse(&found.query) {
                    Ok(reference) => resolver.resolve_head(&reference, scope),
                    Err(e) => {
                        diagnostics.push(
                            Diagnostic::new(
                                DiagnosticCode::E0346,
                                format!("malformed reference [[{}]] in '{}': {e}", found.query, found.field_path),
                            )
                            .at(location)
                            .with_detail("field", &found.field_path),
                        );
                        continue;
                    }
                };
                match &head {
                    HeadResolution::Found { target, .. } => {
                        if let Some(target) = target.as_entity() {
                            if head.needs_fields() {
                                graph.add_edge(target, &entity.key, EdgeKind::FieldReference);
                            } else {
                                graph.add_mention(target, &entity.key);
                            }
                        }
                    }
                    HeadResolution::NotFound(reason) => diagnostics.push(
                        Diagnostic::new(
                            DiagnosticCode::E0341,
                            format!("reference [[{}]] in '{}' not found: {reason}", found.query, found.field_path),
                        )
                        .at(location)
                        .with_detail("query", &found.query)
                        .with_detail("field", &found.field_path),
                    ),
                    HeadResolution::Ambiguous(candidates) => diagnostics.push(
                        Diagnostic::new(
                            DiagnosticCode::E0344,
                            format!(
                                "reference [[{}]] in '{}' is ambiguous: {}",
                                found.query,
                                found.field_path,
                                candidates
                                    .iter()
                                    .map(|c| c.origin().to_string())
                                    .collect::<Vec<_>>()
                                    .join(", ")
                            ),
                        )
                        .at(location)
                        .with_detail("query", &found.query)
                        .with_detail("candidates", candidates.len()),
                    ),
                }
                heads.insert(found.query, head);
            }
        }
        heads
    }

    fn evaluate(
        &self,
        entity: &mut Entity,
        heads: &BTreeMap<String, HeadResolution>,
        entities: &BTreeMap<EntityKey, Entity>,
        locator: &Locator<'_>,
        diagnostics: &mut Vec<Diagnostic>,
    ) {
        let mut evaluation = Evaluation {
            current: entity,
            heads,
            entities,
            locator,
            diagnostics: &mut *diagnostics,
            partial: false,
        };

        // derived_from supplies defaults first, then former, then the entity itself
        let mut merged = Fields::new();
        for link in [entity.derived_from.as_ref(), entity.former.as_ref()]
            .into_iter()
            .flatten()
        {
            match link.merge_target().and_then(|key| entities.get(key)) {
                Some(base) if base.is_resolved() => merged.extend(base.resolved_fields.clone()),
                Some(_) => evaluation.partial = true,
                None => {}
            }
        }
        for (field, value) in entity.data_fields() {
            merged.insert(field.clone(), evaluation.substitute(field, value));
        }
        let partial = evaluation.partial;

        let resolved = match entity.schema_ref.clone() {
            Some(schema) => {
                let (fields, errors) = self.engine.instantiate(&schema, &merged);
                let clean = errors.is_empty();
                for error in errors {
                    diagnostics.push(
                        Diagnostic::new(DiagnosticCode::E0361, format!("'{}': {error}", entity.handle))
                            .at(locator.locate(&entity.key, &format!("{}:", error.field)))
                            .with_detail("field", &error.field)
                            .with_detail("model", &schema.name),
                    );
                }
                if clean {
                    for error in self.engine.run_validators(&schema, &fields) {
                        diagnostics.push(
                            Diagnostic::new(DiagnosticCode::E0361, format!("'{}': {error}", entity.handle))
                                .at(locator.whole(&entity.key))
                                .with_detail("field", &error.field)
                                .with_detail("model", &schema.name),
                        );
                    }
                }
                self.check_ref_targets(entity, &schema, heads, entities, locator, diagnostics);
                fields
            }
            None => merged,
        };
        entity.resolved_fields = resolved;
        entity.status = if partial {
            EntityStatus::Partial
        } else {
            EntityStatus::Resolved
        };
    }

    /// Whole references in `Ref[...]` fields must name entities of an accepted schema.
    fn check_ref_targets(
        &self,
        entity: &Entity,
        schema: &SchemaRef,
        heads: &BTreeMap<String, HeadResolution>,
        entities: &BTreeMap<EntityKey, Entity>,
        locator: &Locator<'_>,
        diagnostics: &mut Vec<Diagnostic>,
    ) {
        for (field, accepted) in self.engine.reference_fields(schema) {
            if accepted.is_empty() {
                continue;
            }
            let Some(value) = entity.raw_fields.get(&field) else {
                continue;
            };
            for found in collect_references(&field, value).into_iter().filter(|f| f.whole) {
                let Some(HeadResolution::Found { target, sub_path, .. }) = heads.get(&found.query) else {
                    continue;
                };
                if !sub_path.is_empty() {
                    continue;
                }
                let actual = match target {
                    Target::Entity(key) if key == &entity.key => Some(schema_name(entity)),
                    Target::Entity(key) => entities.get(key).map(schema_name),
                    Target::Schema(_) => Some("model".to_string()),
                    Target::Rule(_) => Some("spec".to_string()),
                };
                let Some(actual) = actual else { continue };
                if !accepted.contains(&actual) {
                    diagnostics.push(
                        Diagnostic::new(
                            DiagnosticCode::E0362,
                            format!(
                                "'{}': field '{}' expects Ref[{}], but [[{}]] is a {actual}",
                                entity.handle,
                                found.field_path,
                                accepted.join("|"),
                                found.query
                            ),
                        )
                        .at(locator.locate(&entity.key, &format!("[[{}", found.query)))
                        .with_detail("field", &found.field_path)
                        .with_detail("expected", accepted.join("|"))
                        .with_detail("actual", &actual),
                    );
                }
            }
        }
    }
}

/// State of one entity's reference substitution.
struct Evaluation<'e, 'l> {
    current: &'e Entity,
    heads: &'e BTreeMap<String, HeadResolution>,
    entities: &'e BTreeMap<EntityKey, Entity>,
    locator: &'e Locator<'l>,
    diagnostics: &'e mut Vec<Diagnostic>,
    /// Set when any reference was left as a placeholder.
    partial: bool,
}

impl Evaluation<'_, '_> {
    fn substitute(&mut self, field: &str, value: &Value) -> Value {
        match value {
            Value::String(text) => {
                if let Some(query) = whole_reference(text) {
                    return self
                        .project(field, &query)
                        .map(Projection::into_value)
                        .unwrap_or_else(|| value.clone());
                }
                let spans = find_spans(text);
                if spans.is_empty() {
                    return value.clone();
                }
                let mut out = String::with_capacity(text.len());
                let mut last = 0;
                for span in spans {
                    out.push_str(&text[last..span.range.start]);
                    match self.project(field, &span.query) {
                        Some(projection) => out.push_str(&projection.to_text()),
                        None => out.push_str(&text[span.range.clone()]),
                    }
                    last = span.range.end;
                }
                out.push_str(&text[last..]);
                Value::String(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(|item| self.substitute(field, item)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.substitute(field, v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Projection of `query`, or `None` when it stays a placeholder.
    fn project(&mut self, field: &str, query: &str) -> Option<Projection> {
        let Some(HeadResolution::Found { target, sub_path, .. }) = self.heads.get(query) else {
            // malformed, missing and ambiguous heads were reported with the graph
            self.partial = true;
            return None;
        };
        if target.as_entity() == Some(&self.current.key) && sub_path.is_empty() {
            return Some(Projection::SymbolicLink(self.current.id().to_string()));
        }
        match project(target, sub_path, self.entities) {
            Ok(projection) => Some(projection),
            Err(reason) => {
                self.partial = true;
                self.diagnostics.push(
                    Diagnostic::new(
                        DiagnosticCode::E0341,
                        format!("'{}': cannot resolve [[{query}]] in '{field}': {reason}", self.current.handle),
                    )
                    .at(self.locator.locate(&self.current.key, &format!("[[{query}")))
                    .with_detail("query", query)
                    .with_detail("field", field),
                );
                None
            }
        }
    }
}

fn resolve_link(
    resolver: &Resolver<'_>,
    link: &EvolutionLink,
    scope: ScopeId,
) -> Result<EntityKey, (DiagnosticCode, String)> {
    let reference = Reference::parse(&link.query)
        .map_err(|e| (DiagnosticCode::E0346, format!("malformed evolution link: {e}")))?;
    match resolver.resolve_head(&reference, scope) {
        HeadResolution::Found {
            target: Target::Entity(key),
            sub_path,
            ..
        } if sub_path.is_empty() => Ok(key),
        HeadResolution::Found { target, .. } => Err((
            DiagnosticCode::E0343,
            format!("evolution link [[{}]] must name an entity, found {target}", link.query),
        )),
        HeadResolution::NotFound(_) => Err((
            DiagnosticCode::E0343,
            format!("evolution target [[{}]] not found", link.query),
        )),
        HeadResolution::Ambiguous(candidates) => Err((
            DiagnosticCode::E0344,
            format!(
                "evolution link [[{}]] is ambiguous between {} entities",
                link.query,
                candidates.len()
            ),
        )),
    }
}

fn duplicate_handle(err: SymbolError, location: SourceLocation) -> Diagnostic {
    let diagnostic = Diagnostic::new(DiagnosticCode::E0242, err.to_string()).at(location);
    match err {
        SymbolError::DuplicateHandle { handle, existing } => diagnostic
            .with_detail("handle", handle)
            .with_detail("existing", existing),
        SymbolError::DuplicateId { .. } => diagnostic,
    }
}

fn schema_name(entity: &Entity) -> String {
    entity
        .schema_ref
        .as_ref()
        .map(|schema| schema.name.clone())
        .unwrap_or_else(|| entity.type_name.clone())
}

fn string_values(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => vec![],
    }
}
