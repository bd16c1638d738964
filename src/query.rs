//! Editor queries over a compiled project: completion, hover and go-to-definition.
//!
//! All of them read the last committed validation snapshot of a
//! [`ProjectCompiler`]; none of them compiles anything.

use std::{collections::BTreeMap, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    codec::compiler::ProjectCompiler,
    properties::{Entity, SourceLocation, Target},
    resolver::{Projection, ResolutionResult},
};

/// Most completion items returned for one request.
pub const MAX_COMPLETIONS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CompletionKind {
    /// A handle visible from the requesting file.
    Handle,
    /// A schema name.
    Model,
    /// A project-wide logical id.
    LogicalId,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompletionItem {
    pub kind: CompletionKind,
    pub label: String,
    /// Short description of the target.
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hover {
    /// Markdown rendering of the target.
    pub contents: String,
    pub target: Option<Target>,
}

/// Completion candidates for a reference starting with `prefix`, as seen from
/// `context_path`. Matching ignores case; results are ordered by kind, then label.
pub fn completion(compiler: &ProjectCompiler, prefix: &str, context_path: &Path) -> Vec<CompletionItem> {
    let prefix = prefix.trim_start_matches("[[").to_lowercase();
    let matches = |label: &str| label.to_lowercase().starts_with(&prefix);
    let symbols = compiler.symbols();
    let scope = symbols.scopes.scope_for(&compiler.relative(context_path));

    // keyed by label so a handle shadows the same text as an id
    let mut items: BTreeMap<String, CompletionItem> = BTreeMap::new();
    for (handle, binding) in symbols.scopes.visible(scope) {
        if matches(&handle) {
            items.insert(
                handle.clone(),
                CompletionItem {
                    kind: CompletionKind::Handle,
                    label: handle,
                    detail: describe(compiler, &binding.target),
                },
            );
        }
    }
    for name in symbols.schema_names().filter(|name| matches(name)) {
        items.entry(name.clone()).or_insert_with(|| CompletionItem {
            kind: CompletionKind::Model,
            label: name.clone(),
            detail: format!("model {name}"),
        });
    }
    for (id, target) in symbols.ids().filter(|(id, _)| matches(id)) {
        items.entry(id.clone()).or_insert_with(|| CompletionItem {
            kind: CompletionKind::LogicalId,
            label: id.clone(),
            detail: describe(compiler, target),
        });
    }

    let mut items: Vec<CompletionItem> = items.into_values().collect();
    items.sort();
    items.truncate(MAX_COMPLETIONS);
    items
}

/// Markdown summary of what `query` resolves to from `context_path`.
pub fn hover(compiler: &ProjectCompiler, query: &str, context_path: &Path) -> Option<Hover> {
    match compiler.resolve_reference(strip_brackets(query), context_path) {
        ResolutionResult::Resolved { target, projection } => {
            let mut contents = match &target {
                Target::Entity(key) => match compiler.entity_by_key(key) {
                    Some(entity) => render_entity(entity),
                    None => format!("entity `{key}`"),
                },
                Target::Schema(schema) => format!("**model** `{}`\n\n_{}_", schema.name, schema.origin),
                Target::Rule(key) => format!("**spec** _{key}_"),
            };
            match &projection {
                Projection::SymbolicLink(_) => {}
                Projection::ValueLookup(value) | Projection::DataInline(value) => {
                    let rendered = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
                    contents.push_str(&format!("\n\n`{}` =\n```json\n{rendered}\n```", strip_brackets(query)));
                }
            }
            Some(Hover {
                contents,
                target: Some(target),
            })
        }
        ResolutionResult::Ambiguous(candidates) => {
            let mut contents = format!("`{}` is ambiguous:\n", strip_brackets(query));
            for candidate in &candidates {
                contents.push_str(&format!("\n- {}", describe(compiler, candidate)));
            }
            Some(Hover {
                contents,
                target: None,
            })
        }
        ResolutionResult::NotFound(_) => None,
    }
}

/// Source location of the block `query` resolves to.
pub fn goto_definition(compiler: &ProjectCompiler, query: &str, context_path: &Path) -> Option<SourceLocation> {
    let result = compiler.resolve_reference(strip_brackets(query), context_path);
    let target = result.target()?;
    compiler
        .block(target.origin())
        .map(|block| block.location.clone())
}

fn strip_brackets(query: &str) -> &str {
    let query = query.trim();
    query
        .strip_prefix("[[")
        .and_then(|q| q.strip_suffix("]]"))
        .unwrap_or(query)
}

fn describe(compiler: &ProjectCompiler, target: &Target) -> String {
    match target {
        Target::Entity(key) => match compiler.entity_by_key(key) {
            Some(entity) => format!("{} {} ({})", entity.type_name, entity.handle, entity.id()),
            None => format!("entity {key}"),
        },
        other => other.to_string(),
    }
}

fn render_entity(entity: &Entity) -> String {
    let mut text = format!("**{}** `{}`", entity.type_name, entity.handle);
    if let Some(id) = &entity.logical_id {
        text.push_str(&format!(" @{id}"));
    }
    text.push_str(&format!("\n\n_{}_ · {:?}", entity.content_hash, entity.status));
    for (field, value) in entity.data_fields() {
        text.push_str(&format!("\n- {field}: {value}"));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use test_log::test;

    fn project() -> (TempDir, ProjectCompiler) {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join("people.td"),
            "```model:User\nname: str\nemail: str?\n```\n\n```entity User: alice @people/alice\nname: Alice\nemail: alice@example.com\n```\n",
        )
        .unwrap();
        fs::write(
            tmp.path().join("notes.td"),
            "```entity User: bob\nname: Bob\nmentor: \"[[alice]]\"\n```\n",
        )
        .unwrap();
        let mut compiler = ProjectCompiler::new(tmp.path()).unwrap();
        let output = compiler.compile();
        assert!(!output.diagnostics.has_errors(), "{}", output.diagnostics);
        (tmp, compiler)
    }

    #[test]
    fn test_completion() {
        let (_tmp, compiler) = project();
        let labels: Vec<(CompletionKind, String)> = completion(&compiler, "[[", Path::new("people.td"))
            .into_iter()
            .map(|item| (item.kind, item.label))
            .collect();
        assert_eq!(
            labels,
            vec![
                (CompletionKind::Handle, "User".to_string()),
                (CompletionKind::Handle, "alice".to_string()),
                (CompletionKind::LogicalId, "people/alice".to_string()),
            ]
        );
        // file-scoped handles of other files are not offered
        assert!(completion(&compiler, "bo", Path::new("people.td")).is_empty());
        assert_eq!(completion(&compiler, "BO", Path::new("notes.td"))[0].label, "bob");
    }

    #[test]
    fn test_hover_and_goto() {
        let (_tmp, compiler) = project();
        let hover = hover(&compiler, "[[alice.email]]", Path::new("notes.td")).unwrap();
        assert!(hover.contents.starts_with("**User** `alice` @people/alice"));
        assert!(hover.contents.contains("\"alice@example.com\""));

        let location = goto_definition(&compiler, "people/alice", Path::new("notes.td")).unwrap();
        assert_eq!(location.path, Path::new("people.td"));
        assert_eq!(location.line_start, 6);
        assert!(goto_definition(&compiler, "nobody", Path::new("notes.td")).is_none());
    }
}
