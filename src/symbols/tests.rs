//! Tests for scope lookup and the symbol table

use super::*;
use crate::properties::{BlockKey, SchemaRef, Target};
use serde_json::json;
use std::path::Path;
use test_log::test;

fn entity(path: &str, ordinal: usize) -> Target {
    Target::Entity(BlockKey::new(path, ordinal))
}

fn binding(target: Target) -> Binding {
    Binding {
        owner: target.origin().clone(),
        target,
        location: None,
    }
}

#[test]
fn test_child_binding_shadows_parent() {
    let mut table = SymbolTable::new();
    let parent = table.scopes.directory_scope(Path::new("team"));
    let child = table.scopes.file_scope(Path::new("team/a.td"));
    let sibling = table.scopes.file_scope(Path::new("team/b.td"));

    table.bind(parent, "X", binding(entity("team/config.td", 0))).unwrap();
    table.bind(child, "X", binding(entity("team/a.td", 0))).unwrap();

    assert_eq!(table.lookup(child, "X"), Some(entity("team/a.td", 0)));
    assert_eq!(table.lookup(sibling, "X"), Some(entity("team/config.td", 0)));
    assert_eq!(table.lookup(parent, "X"), Some(entity("team/config.td", 0)));
}

#[test]
fn test_duplicate_handle_in_same_scope() {
    let mut table = SymbolTable::new();
    let scope = table.scopes.file_scope(Path::new("a.td"));
    table.bind(scope, "alice", binding(entity("a.td", 0))).unwrap();
    let err = table
        .bind(scope, "alice", binding(entity("a.td", 3)))
        .unwrap_err();
    assert_eq!(
        err,
        SymbolError::DuplicateHandle {
            handle: "alice".to_string(),
            existing: BlockKey::new("a.td", 0)
        }
    );
    // the first binding is untouched
    assert_eq!(table.lookup(scope, "alice"), Some(entity("a.td", 0)));
}

#[test]
fn test_duplicate_global_ids() {
    let mut table = SymbolTable::new();
    table.register_global("people/alice", entity("a.td", 0)).unwrap();
    assert!(matches!(
        table.register_global("people/alice", entity("b.td", 0)),
        Err(SymbolError::DuplicateId { .. })
    ));
    let hash = format!("sha256:{}", "0f".repeat(32));
    table.register_global(&hash, entity("a.td", 0)).unwrap();
    assert!(table.register_global(&hash, entity("b.td", 1)).is_err());
    assert_eq!(table.lookup_hash(&hash), Some(&BlockKey::new("a.td", 0)));
    assert_eq!(table.lookup_id("people/alice"), Some(&entity("a.td", 0)));
}

#[test]
fn test_lookup_falls_back_to_global_ids() {
    let mut table = SymbolTable::new();
    let scope = table.scopes.file_scope(Path::new("docs/x.td"));
    table.register_global("people/alice", entity("people.td", 0)).unwrap();
    assert_eq!(table.lookup(scope, "people/alice"), Some(entity("people.td", 0)));
    assert_eq!(table.lookup(scope, "nobody"), None);
}

#[test]
fn test_boundary_stops_lookup_and_inheritance() {
    let mut table = SymbolTable::new();
    table.scopes.add_boundary("vendor/lib");
    let root = table.scopes.directory_scope(Path::new(""));
    let inner = table.scopes.file_scope(Path::new("vendor/lib/src/a.td"));
    let outer = table.scopes.file_scope(Path::new("vendor/b.td"));

    table.bind(root, "Shared", binding(entity("config.td", 0))).unwrap();
    table
        .scopes
        .get_mut(root)
        .inherited_vars
        .insert("TIMEOUT".to_string(), json!(30));

    assert_eq!(table.lookup(outer, "Shared"), Some(entity("config.td", 0)));
    assert_eq!(table.lookup(inner, "Shared"), None);
    assert_eq!(table.scopes.effective_vars(outer)["TIMEOUT"], json!(30));
    assert!(table.scopes.effective_vars(inner).is_empty());

    assert!(table.scopes.covers(Path::new(""), Path::new("vendor/b.td")));
    assert!(!table.scopes.covers(Path::new(""), Path::new("vendor/lib/src/a.td")));
    assert!(table
        .scopes
        .covers(Path::new("vendor/lib"), Path::new("vendor/lib/src/a.td")));
}

#[test]
fn test_vars_override_nearest_first() {
    let mut tree = ScopeTree::new();
    let root = tree.directory_scope(Path::new(""));
    let sub = tree.directory_scope(Path::new("sub"));
    let file = tree.file_scope(Path::new("sub/a.td"));
    tree.get_mut(root).inherited_vars.insert("A".into(), json!(1));
    tree.get_mut(root).inherited_vars.insert("B".into(), json!(1));
    tree.get_mut(sub).inherited_vars.insert("B".into(), json!(2));
    let vars = tree.effective_vars(file);
    assert_eq!(vars["A"], json!(1));
    assert_eq!(vars["B"], json!(2));
}

#[test]
fn test_schema_lookup() {
    let mut table = SymbolTable::new();
    let dir = table.scopes.directory_scope(Path::new("models"));
    let file = table.scopes.file_scope(Path::new("models/users.td"));
    let elsewhere = table.scopes.file_scope(Path::new("other/x.td"));
    let user = SchemaRef {
        name: "User".to_string(),
        origin: BlockKey::new("models/users.td", 0),
    };
    table
        .bind(dir, "User", binding(Target::Schema(user.clone())))
        .unwrap();
    table.register_schema_name(user.clone());

    assert_eq!(table.lookup_schema(file, "User"), Some(user.clone()));
    // unique schema names are found project wide
    assert_eq!(table.lookup_schema(elsewhere, "User"), Some(user.clone()));

    table.register_schema_name(SchemaRef {
        name: "User".to_string(),
        origin: BlockKey::new("other/models.td", 0),
    });
    assert_eq!(table.lookup_schema(elsewhere, "User"), None);
    assert_eq!(table.lookup_schema(file, "User"), Some(user));
}

#[test]
fn test_reset_keeps_vars() {
    let mut table = SymbolTable::new();
    let dir = table.scopes.directory_scope(Path::new(""));
    table.scopes.get_mut(dir).inherited_vars.insert("A".into(), json!(true));
    table.bind(dir, "x", binding(entity("a.td", 0))).unwrap();
    table.register_global("x-id", entity("a.td", 0)).unwrap();
    table.reset();
    assert_eq!(table.lookup(dir, "x"), None);
    assert_eq!(table.lookup_id("x-id"), None);
    assert_eq!(table.scopes.effective_vars(dir)["A"], json!(true));
}

#[test]
fn test_schema_fallback_stays_inside_boundaries() {
    let mut table = SymbolTable::new();
    table.scopes.add_boundary("vendor");
    let outside = table.scopes.file_scope(Path::new("notes.td"));
    let inside = table.scopes.file_scope(Path::new("vendor/x.td"));
    let vendored = SchemaRef {
        name: "Part".to_string(),
        origin: BlockKey::new("vendor/models/parts.td", 0),
    };
    table.register_schema_name(vendored.clone());

    assert_eq!(table.lookup_schema(inside, "Part"), Some(vendored));
    assert_eq!(table.lookup_schema(outside, "Part"), None);
}

#[test]
fn test_removed_file_scopes_are_reused() {
    let mut tree = ScopeTree::new();
    let first = tree.file_scope(Path::new("a.td"));
    tree.get_mut(first).inherited_vars.insert("title".into(), json!("A"));
    let slots = tree.slot_count();
    for _ in 0..10 {
        tree.remove_file(Path::new("a.td"));
        assert_eq!(tree.existing_file_scope(Path::new("a.td")), None);
        tree.file_scope(Path::new("a.td"));
    }
    assert_eq!(tree.slot_count(), slots);

    tree.remove_file(Path::new("a.td"));
    let other = tree.file_scope(Path::new("b.td"));
    assert_eq!(other, first);
    assert_eq!(tree.path_of(other), Path::new("b.td"));
    assert!(tree.effective_vars(other).is_empty());
}
