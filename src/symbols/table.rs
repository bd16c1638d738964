use std::collections::BTreeMap;

use crate::{
    properties::{is_content_hash, EntityKey, SchemaRef, Target},
    symbols::{Binding, ScopeId, ScopeTree, SymbolError},
};

/// Names an entity can be found by when exact lookup fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuzzyEntry {
    pub key: EntityKey,
    pub logical_id: String,
    /// Values of name-like fields.
    pub names: Vec<String>,
    /// Aliases declared through the entity's schema.
    pub aliases: Vec<String>,
}

/// Project-wide symbol index.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    pub scopes: ScopeTree,
    ids: BTreeMap<String, Target>,
    hashes: BTreeMap<String, EntityKey>,
    schemas: BTreeMap<String, Vec<SchemaRef>>,
    fuzzy: Vec<FuzzyEntry>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every binding and global index entry. Scope structure and scope
    /// variables survive; they are owned by the link stage.
    pub fn reset(&mut self) {
        self.scopes.clear_bindings();
        self.ids.clear();
        self.hashes.clear();
        self.schemas.clear();
        self.fuzzy.clear();
    }

    pub fn bind(&mut self, scope: ScopeId, handle: &str, binding: Binding) -> Result<(), SymbolError> {
        self.scopes.bind(scope, handle, binding)
    }

    /// Register a logical id, or the content hash of an entity.
    pub fn register_global(&mut self, id: &str, target: Target) -> Result<(), SymbolError> {
        if let (true, Target::Entity(key)) = (is_content_hash(id), &target) {
            if let Some(existing) = self.hashes.get(id) {
                return Err(SymbolError::DuplicateId {
                    id: id.to_string(),
                    existing: Target::Entity(existing.clone()),
                });
            }
            self.hashes.insert(id.to_string(), key.clone());
            return Ok(());
        }
        if let Some(existing) = self.ids.get(id) {
            return Err(SymbolError::DuplicateId {
                id: id.to_string(),
                existing: existing.clone(),
            });
        }
        self.ids.insert(id.to_string(), target);
        Ok(())
    }

    /// Index a schema by name for lookups that do not find it in scope.
    pub fn register_schema_name(&mut self, schema: SchemaRef) {
        self.schemas.entry(schema.name.clone()).or_default().push(schema);
    }

    pub fn set_fuzzy_index(&mut self, entries: Vec<FuzzyEntry>) {
        self.fuzzy = entries;
    }

    pub fn fuzzy_entries(&self) -> &[FuzzyEntry] {
        &self.fuzzy
    }

    /// Scope chain first, then the global logical-id index.
    pub fn lookup(&self, scope: ScopeId, name: &str) -> Option<Target> {
        self.scopes
            .lookup(scope, name)
            .map(|binding| binding.target.clone())
            .or_else(|| self.ids.get(name).cloned())
    }

    pub fn lookup_id(&self, id: &str) -> Option<&Target> {
        self.ids.get(id)
    }

    pub fn lookup_hash(&self, hash: &str) -> Option<&EntityKey> {
        self.hashes.get(hash)
    }

    /// Nearest schema binding named `name`, else the only schema of that name in the
    /// same sub-project. Schemas behind a scope boundary are not found from outside
    /// it, nor the other way round.
    pub fn lookup_schema(&self, scope: ScopeId, name: &str) -> Option<SchemaRef> {
        if let Some(binding) = self
            .scopes
            .lookup_where(scope, name, |b| matches!(b.target, Target::Schema(_)))
        {
            return binding.target.as_schema().cloned();
        }
        let project = self.scopes.sub_project(self.scopes.path_of(scope));
        let mut candidates = self
            .schemas
            .get(name)
            .into_iter()
            .flatten()
            .filter(|schema| self.scopes.sub_project(&schema.origin.path) == project);
        match (candidates.next(), candidates.next()) {
            (Some(only), None) => Some(only.clone()),
            _ => None,
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = (&String, &Target)> {
        self.ids.iter()
    }

    pub fn schema_names(&self) -> impl Iterator<Item = &String> {
        self.schemas.keys()
    }
}
