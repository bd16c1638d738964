//! The Link stage: configuration blocks populate directory scopes, schema blocks are
//! registered with the schema engine.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde_json::Value;

use crate::{
    codec::{
        diagnostic::{Diagnostic, DiagnosticCode},
        sandbox::{ConfigBinding, ConfigContext, Permissions, SandboxedExecutor},
        schema::{SchemaDefinition, SchemaEngine, SchemaError},
    },
    properties::{Block, BlockKey, BlockKind, SchemaRef, SourceLocation},
    symbols::ScopeTree,
};

/// A handle introduced by a configuration block, bound once the symbol table is
/// assembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigAlias {
    pub handle: String,
    pub query: String,
    pub owner: BlockKey,
    pub dir: PathBuf,
    pub location: SourceLocation,
}

/// What linking one file produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkedUnit {
    /// Registered schemas by block ordinal.
    pub schemas: BTreeMap<usize, SchemaRef>,
    pub aliases: Vec<ConfigAlias>,
    /// Variables set by this file's configuration blocks.
    pub vars: BTreeMap<String, Value>,
    pub diagnostics: Vec<Diagnostic>,
}

pub struct Linker<'a> {
    root: &'a Path,
    engine: &'a dyn SchemaEngine,
    executor: &'a dyn SandboxedExecutor,
    permissions: &'a Permissions,
}

impl<'a> Linker<'a> {
    pub fn new(
        root: &'a Path,
        engine: &'a dyn SchemaEngine,
        executor: &'a dyn SandboxedExecutor,
        permissions: &'a Permissions,
    ) -> Self {
        Linker {
            root,
            engine,
            executor,
            permissions,
        }
    }

    /// Execute the configuration blocks of a directory's `config.td` and install
    /// the resulting variables in the directory scope, replacing earlier ones.
    pub fn link_config(&self, path: &Path, blocks: &[Block], scopes: &mut ScopeTree) -> LinkedUnit {
        let dir = path.parent().unwrap_or(Path::new("")).to_path_buf();
        let mut unit = LinkedUnit::default();
        for (ordinal, block) in blocks.iter().enumerate() {
            if block.kind != BlockKind::ScopeConfig {
                continue;
            }
            let context = ConfigContext {
                root: self.root,
                dir: &dir,
                language: block.language.as_deref().unwrap_or("toml"),
            };
            let outcome = self
                .executor
                .execute_config(&block.raw_body, &context, self.permissions);
            if let Some(error) = outcome.error {
                tracing::debug!("[Linker] config {} failed: {}", block.location, error);
                unit.diagnostics.push(
                    Diagnostic::new(DiagnosticCode::E0222, format!("configuration failed: {error}"))
                        .at(block.location.clone()),
                );
                continue;
            }
            for warning in outcome.warnings {
                unit.diagnostics
                    .push(Diagnostic::new(DiagnosticCode::E0224, warning).at(block.location.clone()));
            }
            for (name, binding) in outcome.bindings {
                match binding {
                    ConfigBinding::Value(value) => {
                        unit.vars.insert(name, value);
                    }
                    ConfigBinding::Alias(query) => {
                        let location = block.location.at_line(block.line_of(&name));
                        unit.aliases.retain(|alias| alias.handle != name);
                        unit.aliases.push(ConfigAlias {
                            handle: name,
                            query,
                            owner: BlockKey::new(path, ordinal),
                            dir: dir.clone(),
                            location,
                        });
                    }
                }
            }
        }
        let scope = scopes.directory_scope(&dir);
        scopes.get_mut(scope).inherited_vars = unit.vars.clone();
        tracing::debug!(
            "[Linker] {} sets {} vars and {} aliases for '{}'",
            path.display(),
            unit.vars.len(),
            unit.aliases.len(),
            dir.display()
        );
        unit
    }

    /// Register the schema blocks of a file, with the variables visible from it.
    pub fn link_schemas(&self, path: &Path, blocks: &[Block], scopes: &mut ScopeTree, unit: &mut LinkedUnit) {
        let scope = scopes.file_scope(path);
        let vars = scopes.effective_vars(scope);
        for (ordinal, block) in blocks.iter().enumerate() {
            if block.kind != BlockKind::Schema {
                continue;
            }
            let definition = SchemaDefinition {
                name: block.handle.clone(),
                origin: BlockKey::new(path, ordinal),
                body: block.raw_body.clone(),
                vars: vars.clone(),
                location: block.location.clone(),
            };
            match self.engine.register_schema(definition) {
                Ok(schema) => {
                    unit.schemas.insert(ordinal, schema);
                }
                Err(error) => {
                    let code = match &error {
                        SchemaError::NameMismatch { .. } => DiagnosticCode::E0231,
                        SchemaError::ReservedField(_) => DiagnosticCode::E0232,
                        SchemaError::Invalid(_) => DiagnosticCode::E0221,
                    };
                    let location = match &error {
                        SchemaError::ReservedField(field) => {
                            block.location.at_line(block.line_of(&format!("{field}:")))
                        }
                        _ => block.location.clone(),
                    };
                    unit.diagnostics.push(
                        Diagnostic::new(code, format!("model '{}': {error}", block.handle))
                            .at(location)
                            .with_detail("model", &block.handle),
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{sandbox::TomlExecutor, schema::SchemaRegistry};
    use serde_json::json;
    use tempfile::TempDir;
    use test_log::test;

    fn block(kind: BlockKind, handle: &str, body: &str, line: usize) -> Block {
        let mut block = Block::new(kind, handle, body);
        block.location = SourceLocation::new("team/config.td", line, line + body.lines().count() + 1);
        if kind == BlockKind::ScopeConfig {
            block.language = Some("toml".to_string());
        }
        block
    }

    #[test]
    fn test_config_sets_vars_and_aliases() {
        let tmp = TempDir::new().unwrap();
        let engine = SchemaRegistry::create();
        let executor = TomlExecutor::new();
        let permissions = Permissions::default();
        let linker = Linker::new(tmp.path(), &engine, &executor, &permissions);
        let mut scopes = ScopeTree::new();

        let blocks = vec![
            block(BlockKind::ScopeConfig, "config", "ROLE = \"member\"\nLead = \"[[people/alice]]\"\n", 1),
            block(BlockKind::ScopeConfig, "config", "X = [1\n", 6),
        ];
        let unit = linker.link_config(Path::new("team/config.td"), &blocks, &mut scopes);
        assert_eq!(unit.vars, BTreeMap::from([("ROLE".to_string(), json!("member"))]));
        assert_eq!(unit.aliases.len(), 1);
        assert_eq!(unit.aliases[0].query, "people/alice");
        assert_eq!(unit.aliases[0].dir, PathBuf::from("team"));
        assert_eq!(unit.aliases[0].location.line_start, 3);
        assert_eq!(unit.diagnostics.len(), 1);
        assert_eq!(unit.diagnostics[0].code, DiagnosticCode::E0222);

        let file = scopes.file_scope(Path::new("team/sub/x.td"));
        assert_eq!(scopes.effective_vars(file)["ROLE"], json!("member"));

        // re-linking replaces the directory's variables
        let unit = linker.link_config(Path::new("team/config.td"), &blocks[1..], &mut scopes);
        assert!(unit.vars.is_empty());
        assert!(scopes.effective_vars(file).is_empty());
    }

    #[test]
    fn test_schema_errors_map_to_codes() {
        let tmp = TempDir::new().unwrap();
        let engine = SchemaRegistry::create();
        let executor = TomlExecutor::new();
        let permissions = Permissions::default();
        let linker = Linker::new(tmp.path(), &engine, &executor, &permissions);
        let mut scopes = ScopeTree::new();
        let dir = scopes.directory_scope(Path::new(""));
        scopes.get_mut(dir).inherited_vars.insert("ROLE".to_string(), json!("member"));

        let blocks = vec![
            block(BlockKind::Schema, "User", "name: str\nrole: str = ${ROLE}\n", 1),
            block(BlockKind::Schema, "Bot", "__name__: Robot\n", 6),
            block(BlockKind::Schema, "Task", "title: str\nid: str\n", 10),
            block(BlockKind::Schema, "Team", "- not a map\n", 15),
        ];
        let mut unit = LinkedUnit::default();
        linker.link_schemas(Path::new("models.td"), &blocks, &mut scopes, &mut unit);
        assert_eq!(unit.schemas.len(), 1);
        assert_eq!(unit.schemas[&0].name, "User");
        let codes: Vec<(DiagnosticCode, usize)> = unit
            .diagnostics
            .iter()
            .map(|d| (d.code, d.location.as_ref().unwrap().line_start))
            .collect();
        assert_eq!(
            codes,
            vec![
                (DiagnosticCode::E0231, 6),
                (DiagnosticCode::E0232, 12),
                (DiagnosticCode::E0221, 15),
            ]
        );
    }
}
