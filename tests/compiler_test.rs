mod common;

use common::{by_handle, codes, create_project, only, write_files, LOGIN_CHAIN, PEOPLE};
use serde_json::json;
use std::path::Path;
use test_log::test;
use weave_core::{
    codec::{DiagnosticCode, FileStage, ProjectCompiler, Severity},
    compile,
    properties::{EntityStatus, SourceLocation, Target},
    resolver::ResolutionResult,
};

const NOTES: &str = r#"```model:Note
text: str
```

```entity Note: n1
text: "Ask [[people/alice.name]] about [[login.status]]"
```

```entity User: alice2 @people/alice-2
former: [[people/alice]]
role: owner
```
"#;

fn fresh(root: &Path) -> (Vec<weave_core::properties::Entity>, weave_core::codec::DiagnosticReport) {
    let output = compile(root).unwrap();
    (output.entities, output.diagnostics)
}

#[test]
fn test_people_scenario_has_no_diagnostics() {
    let project = create_project(&[("people.td", PEOPLE)]);
    let output = compile(project.path()).unwrap();
    assert!(output.diagnostics.is_empty(), "{}", output.diagnostics);

    let alice = by_handle(&output.entities, "alice");
    let bob = by_handle(&output.entities, "bob");
    assert_eq!(alice.resolved_fields["role"], json!("admin"));
    assert_eq!(bob.resolved_fields["manager"], json!(alice.id()));
    assert_eq!(bob.resolved_fields["manager"], json!("people/alice"));
    assert_eq!(bob.status, EntityStatus::Resolved);
}

#[test]
fn test_missing_former() {
    let project = create_project(&[(
        "x.td",
        "```model:Item\nname: str?\n```\n\n```entity Item: x\nformer: y\nname: X\n```\n",
    )]);
    let output = compile(project.path()).unwrap();
    assert_eq!(codes(&output.diagnostics), vec![DiagnosticCode::E0343]);
    let diagnostic = only(&output.diagnostics, DiagnosticCode::E0343);
    assert_eq!(diagnostic.location.unwrap().line_start, 6);

    let x = by_handle(&output.entities, "x");
    let former = x.former.as_ref().unwrap();
    assert_eq!(former.query, "y");
    assert!(former.target.is_none());
    assert_eq!(x.resolved_fields["name"], json!("X"));
}

#[test]
fn test_evolution_tip_resolution() {
    let project = create_project(&[("features.td", LOGIN_CHAIN), ("people.td", PEOPLE), ("notes.td", NOTES)]);
    let mut compiler = ProjectCompiler::new(project.path()).unwrap();
    let output = compiler.compile();
    assert!(output.diagnostics.is_empty(), "{}", output.diagnostics);

    let login3 = compiler.entity("features/login-v3").unwrap().key.clone();
    let login1 = compiler.entity("features/login-v1").unwrap().key.clone();
    match compiler.resolve_reference("login", Path::new("notes.td")) {
        ResolutionResult::Resolved { target, .. } => assert_eq!(target, Target::Entity(login3.clone())),
        other => panic!("unexpected {other:?}"),
    }
    match compiler.resolve_reference("features/login-v1", Path::new("notes.td")) {
        ResolutionResult::Resolved { target, .. } => assert_eq!(target, Target::Entity(login1)),
        other => panic!("unexpected {other:?}"),
    }

    // fields merge along the chain, newest wins
    let tip = compiler.entity_by_key(&login3).unwrap();
    assert_eq!(tip.resolved_fields["title"], json!("Login"));
    assert_eq!(tip.resolved_fields["owner"], json!("ops"));
    assert_eq!(tip.resolved_fields["status"], json!("shipped"));
    let login2 = compiler.entity("features/login-v2").unwrap();
    assert_eq!(login2.resolved_fields["status"], json!("review"));

    let note = by_handle(&output.entities, "n1");
    assert_eq!(note.resolved_fields["text"], json!("Ask Alice about shipped"));
    let alice2 = compiler.entity("people/alice-2").unwrap();
    assert_eq!(alice2.resolved_fields["name"], json!("Alice"));
    assert_eq!(alice2.resolved_fields["role"], json!("owner"));
}

#[test]
fn test_fork_reports_once_and_keeps_both() {
    let project = create_project(&[(
        "docs.td",
        r#"```model:Doc
title: str?
```

```entity Doc: a @a
title: A
```

```entity Doc: b
former: [[a]]
title: B
```

```entity Doc: d
former: [[a]]
```
"#,
    )]);
    let output = compile(project.path()).unwrap();
    assert_eq!(codes(&output.diagnostics), vec![DiagnosticCode::E0345]);
    let fork = only(&output.diagnostics, DiagnosticCode::E0345);
    assert_eq!(fork.location.unwrap().line_start, 15);
    assert_eq!(fork.details["excluded"], "d");

    let b = by_handle(&output.entities, "b");
    let d = by_handle(&output.entities, "d");
    assert!(!b.former.as_ref().unwrap().excluded);
    assert!(d.former.as_ref().unwrap().excluded);
    assert_eq!(b.resolved_fields["title"], json!("B"));
    assert_eq!(d.resolved_fields["title"], json!(null));
    assert_eq!(d.status, EntityStatus::Resolved);
}

#[test]
fn test_cycle() {
    let project = create_project(&[(
        "nodes.td",
        r#"```model:Node
v: any?
w: any?
```

```entity Node: a
v: 1
w: "[[b.v]]"
```

```entity Node: b
v: "[[a.w]]"
```
"#,
    )]);
    let output = compile(project.path()).unwrap();
    let cycle = only(&output.diagnostics, DiagnosticCode::E0342);
    let mut members: Vec<&str> = cycle.details["members"].split(',').collect();
    members.sort();
    assert_eq!(members, vec!["a", "b"]);
    for handle in ["a", "b"] {
        let entity = by_handle(&output.entities, handle);
        assert_eq!(entity.status, EntityStatus::Unresolved);
        assert!(entity.resolved_fields.is_empty());
    }
}

#[test]
fn test_scope_shadowing() {
    let project = create_project(&[
        (
            "people.td",
            "```model:User\nname: str?\nmanager: Ref[User]?\n```\n\n```entity User: alice @people/alice\nname: Alice\n```\n\n```entity User: carol @people/carol\nname: Carol\n```\n",
        ),
        ("config.td", "```config\nlead = \"[[people/alice]]\"\n```\n"),
        ("team/config.td", "```config\nlead = \"[[people/carol]]\"\n```\n"),
        ("team/a.td", "```entity User: t1\nmanager: [[lead]]\n```\n"),
        (
            "team/b.td",
            "```entity User: lead\nname: Local\n```\n\n```entity User: t2\nmanager: [[lead]]\n```\n",
        ),
        ("other/c.td", "```entity User: o1\nmanager: [[lead]]\n```\n"),
    ]);
    let output = compile(project.path()).unwrap();
    assert!(output.diagnostics.is_empty(), "{}", output.diagnostics);

    assert_eq!(by_handle(&output.entities, "t1").resolved_fields["manager"], json!("people/carol"));
    assert_eq!(by_handle(&output.entities, "o1").resolved_fields["manager"], json!("people/alice"));
    let local = by_handle(&output.entities, "lead");
    assert_eq!(
        by_handle(&output.entities, "t2").resolved_fields["manager"],
        json!(local.content_hash)
    );
}

#[test]
fn test_scope_boundary_hides_parent_bindings() {
    let project = create_project(&[
        ("people.td", PEOPLE),
        ("config.td", "```config\nlead = \"[[people/alice]]\"\n```\n"),
        ("sub/weave.toml", "[package]\nname = \"sub\"\n"),
        ("sub/a.td", "```model:Item\nowner: str?\n```\n\n```entity Item: i\nowner: \"[[lead]]\"\n```\n"),
        ("x.td", "```entity User: x\nmanager: [[lead]]\n```\n"),
    ]);
    let output = compile(project.path()).unwrap();
    let missing = only(&output.diagnostics, DiagnosticCode::E0341);
    assert_eq!(missing.path(), Some(Path::new("sub/a.td")));
    assert_eq!(by_handle(&output.entities, "x").resolved_fields["manager"], json!("people/alice"));
}

#[test]
fn test_hash_stability() {
    let project = create_project(&[(
        "items.td",
        r#"```model:Item
name: str
age: int?
```

```entity Item: one
name: A
age: 3
```

```entity Item: two
# same data, other layout
age:    3

name: A   # trailing
```

```entity Item: three
name: A
age: 4
```
"#,
    )]);
    let output = compile(project.path()).unwrap();
    assert!(output.diagnostics.is_empty(), "{}", output.diagnostics);
    let one = by_handle(&output.entities, "one");
    let two = by_handle(&output.entities, "two");
    let three = by_handle(&output.entities, "three");
    assert!(one.content_hash.starts_with("sha256:"));
    assert_eq!(one.content_hash, two.content_hash);
    assert_ne!(one.content_hash, three.content_hash);

    // the first in source order owns a repeated hash
    let compiler = {
        let mut compiler = ProjectCompiler::new(project.path()).unwrap();
        compiler.compile();
        compiler
    };
    match compiler.resolve_reference(&format!("{}.name", one.content_hash), Path::new("items.td")) {
        ResolutionResult::Resolved { target, .. } => assert_eq!(target, Target::Entity(one.key.clone())),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_determinism() {
    let project = create_project(&[
        ("features.td", LOGIN_CHAIN),
        ("people.td", PEOPLE),
        ("notes.td", NOTES),
        (
            "broken.td",
            "```entity User: z\nmanager: [[nobody]]\nformer: [[people/alice]]\n```\n\n```entity Ghost: g\n```\n",
        ),
    ]);
    let first = fresh(project.path());
    let second = fresh(project.path());
    assert!(!first.1.is_empty());
    assert_eq!(first, second);
}

#[test]
fn test_incremental_equivalence() {
    let project = create_project(&[
        ("features.td", LOGIN_CHAIN),
        ("people.td", PEOPLE),
        ("notes.td", NOTES),
    ]);
    let mut compiler = ProjectCompiler::new(project.path()).unwrap();
    compiler.compile();

    let edits: [(&str, String); 3] = [
        ("people.td", PEOPLE.replace("manager: [[alice]]", "manager: [[nobody]]").replace("admin", "root")),
        (
            "features.td",
            format!("{LOGIN_CHAIN}\n```entity Feature: login4 @features/login-v4\nformer: [[features/login-v3]]\nstatus: retired\n```\n"),
        ),
        ("extra/new.td", "```entity Note: n2\ntext: \"see [[n1]]\"\n```\n".to_string()),
    ];
    for (path, text) in edits {
        let report = compiler.update_file(Path::new(path), &text);
        write_files(project.path(), &[(path, &text)]);
        let (entities, diagnostics) = fresh(project.path());
        assert_eq!(report, diagnostics, "after editing {path}");
        assert_eq!(compiler.entities().cloned().collect::<Vec<_>>(), entities, "after editing {path}");
    }
    assert_eq!(
        compiler.entity("features/login-v4").unwrap().resolved_fields["title"],
        json!("Login")
    );

    let report = compiler.remove_file(Path::new("notes.td"));
    std::fs::remove_file(project.path().join("notes.td")).unwrap();
    let (entities, diagnostics) = fresh(project.path());
    assert_eq!(report, diagnostics);
    assert_eq!(compiler.entities().cloned().collect::<Vec<_>>(), entities);
    // n2 now points nowhere
    assert!(report
        .by_code(DiagnosticCode::E0341)
        .iter()
        .any(|d| d.path() == Some(Path::new("extra/new.td"))));
}

#[test]
fn test_config_change_relinks_models() {
    let project = create_project(&[
        ("weave.toml", "[scope.vars]\nDEFAULT_ROLE = \"member\"\n"),
        ("models.td", "```model:User\nname: str\nrole: str = ${DEFAULT_ROLE}\n```\n\n```entity User: bob\nname: Bob\n```\n"),
        ("team/config.td", "```config\nDEFAULT_ROLE = \"lead\"\n```\n"),
        ("team/roles.td", "```model:Member\nname: str\nrole: str = ${DEFAULT_ROLE}\n```\n\n```entity Member: carol\nname: Carol\n```\n"),
    ]);
    let mut compiler = ProjectCompiler::new(project.path()).unwrap();
    let output = compiler.compile();
    assert!(output.diagnostics.is_empty(), "{}", output.diagnostics);
    assert_eq!(by_handle(&output.entities, "bob").resolved_fields["role"], json!("member"));
    assert_eq!(by_handle(&output.entities, "carol").resolved_fields["role"], json!("lead"));

    let text = "```config\nDEFAULT_ROLE = \"guest\"\n```\n";
    let report = compiler.update_file(Path::new("team/config.td"), text);
    assert!(report.is_empty(), "{report}");
    let carol = compiler.entities().find(|e| e.handle == "carol").unwrap();
    assert_eq!(carol.resolved_fields["role"], json!("guest"));

    write_files(project.path(), &[("team/config.td", text)]);
    let (entities, _) = fresh(project.path());
    assert_eq!(compiler.entities().cloned().collect::<Vec<_>>(), entities);
}

#[test]
fn test_scan_diagnostics() {
    let project = create_project(&[(
        "misc.td",
        r#"```model:Item
name: str?
```

```entity Item: broken
name: [unclosed
```

```entity Item: grid
matrix: [[1, 2], [3, 4]]
```

```entity Item: withid
id: nope
```

```entity Ghost: spooky
name: x
```

```entity Item bad signature
```

```config
X = 1
```
"#,
    )]);
    let output = compile(project.path()).unwrap();
    let mut found = codes(&output.diagnostics);
    found.sort();
    assert_eq!(
        found,
        vec![
            DiagnosticCode::E0101,
            DiagnosticCode::E0102,
            DiagnosticCode::E0103,
            DiagnosticCode::E0105,
            DiagnosticCode::E0363,
            DiagnosticCode::E0364,
        ]
    );
    assert_eq!(only(&output.diagnostics, DiagnosticCode::E0103).severity, Severity::Warning);

    // a body that is not data still yields an entity, identified by its text
    let broken = by_handle(&output.entities, "broken");
    assert!(broken.raw_fields.is_empty());
    assert!(broken.content_hash.starts_with("sha256:"));
    assert_eq!(output.entities.len(), 4);
}

#[test]
fn test_find_references() {
    let project = create_project(&[("features.td", LOGIN_CHAIN), ("people.td", PEOPLE), ("notes.td", NOTES)]);
    let mut compiler = ProjectCompiler::new(project.path()).unwrap();
    compiler.compile();

    let locations = compiler.find_references("people/alice");
    assert_eq!(
        locations,
        vec![
            SourceLocation::new("notes.td", 6, 6),
            SourceLocation::new("notes.td", 10, 10),
            SourceLocation::new("people.td", 15, 15),
        ]
    );
    assert!(compiler.find_references("people/alice-2").is_empty());
    assert!(compiler.find_references("nobody").is_empty());
}

#[test]
fn test_specs_run_only_on_clean_projects() {
    let rules = "```spec:roles\ntarget: User\nrequire: [role]\n```\n";
    let project = create_project(&[("people.td", PEOPLE), ("rules.td", rules)]);

    let mut compiler = ProjectCompiler::new(project.path()).unwrap();
    let output = compiler.compile();
    let failure = only(&output.diagnostics, DiagnosticCode::E0424);
    assert_eq!(failure.details["rule"], "roles");
    assert!(failure.message.contains("'bob'"), "{}", failure.message);
    assert_eq!(compiler.stage(Path::new("people.td")), FileStage::SpecRun);

    let mut compiler = ProjectCompiler::new(project.path()).unwrap().with_specs(false);
    assert!(compiler.compile().diagnostics.is_empty());
    assert_eq!(compiler.stage(Path::new("people.td")), FileStage::Validated);

    let mut compiler = ProjectCompiler::new(project.path()).unwrap();
    compiler.compile();
    let report = compiler.update_file(Path::new("ghost.td"), "```entity Ghost: g\n```\n");
    assert_eq!(codes(&report), vec![DiagnosticCode::E0364]);
    assert_eq!(compiler.stage(Path::new("ghost.td")), FileStage::Validated);
    assert_eq!(compiler.stage(Path::new("missing.td")), FileStage::Unscanned);
}

#[test]
fn test_invalid_project_config() {
    let project = create_project(&[("weave.toml", "[compiler\n"), ("people.td", PEOPLE)]);
    let output = compile(project.path()).unwrap();
    assert_eq!(codes(&output.diagnostics), vec![DiagnosticCode::E0983]);
    assert_eq!(output.entities.len(), 2);
}

#[test]
fn test_fuzzy_evolution_link_follows_the_chain() {
    let project = create_project(&[
        ("features.td", LOGIN_CHAIN),
        (
            "sso.td",
            "```entity Feature: sso @features/sso\nderived_from: [[login]]\ntitle: SSO\n```\n",
        ),
    ]);
    let mut compiler = ProjectCompiler::new(project.path()).unwrap();
    let output = compiler.compile();
    assert!(output.diagnostics.is_empty(), "{}", output.diagnostics);

    let tip = compiler.entity("features/login-v3").unwrap().key.clone();
    let sso = compiler.entity("features/sso").unwrap();
    assert_eq!(sso.derived_from.as_ref().unwrap().target, Some(tip));
    assert_eq!(sso.resolved_fields["title"], json!("SSO"));
    assert_eq!(sso.resolved_fields["status"], json!("shipped"));
}

#[test]
fn test_fork_with_several_excluded_children() {
    let project = create_project(&[(
        "docs.td",
        r#"```model:Doc
title: str?
```

```entity Doc: a @a
```

```entity Doc: b
former: [[a]]
```

```entity Doc: d
former: [[a]]
```

```entity Doc: e
former: [[a]]
```
"#,
    )]);
    let output = compile(project.path()).unwrap();
    assert_eq!(codes(&output.diagnostics), vec![DiagnosticCode::E0345]);
    let fork = only(&output.diagnostics, DiagnosticCode::E0345);
    assert_eq!(fork.details["excluded"], "d,e");
    assert_eq!(fork.message.matches("'d', 'e'").count(), 1);
    assert!(by_handle(&output.entities, "e").former.as_ref().unwrap().excluded);
}

#[test]
fn test_front_matter_sets_document_vars() {
    let project = create_project(&[
        ("weave.toml", "[scope.vars]\nteam = \"everyone\"\n"),
        (
            "tasks.td",
            "---\nteam: core\n---\n\n# Tasks\n\n```model:Task\ntitle: str\nteam: str = ${team}\n```\n\n```entity Task: t1\ntitle: Ship\n```\n",
        ),
        ("later.td", "```entity Task: t2\ntitle: Later\n```\n"),
        ("broken.td", "---\n- a\n- b\n---\n\n```entity Task: t3\ntitle: Broken\n```\n"),
    ]);
    let output = compile(project.path()).unwrap();
    let malformed = only(&output.diagnostics, DiagnosticCode::E0101);
    assert_eq!(malformed.path(), Some(Path::new("broken.td")));

    // the model's default is bound where the model is declared
    assert_eq!(by_handle(&output.entities, "t1").resolved_fields["team"], json!("core"));
    assert_eq!(by_handle(&output.entities, "t2").resolved_fields["team"], json!("core"));
    assert_eq!(by_handle(&output.entities, "t3").resolved_fields["team"], json!("core"));
}
