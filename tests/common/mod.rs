//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use std::path::{Path, PathBuf};
use tempfile::TempDir;
use weave_core::{
    codec::{Diagnostic, DiagnosticCode, DiagnosticReport},
    properties::Entity,
};

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times; subsequent calls are no-ops.
#[allow(dead_code)]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// Write `files` (project-relative path, content) under `root`, creating directories.
#[allow(dead_code)]
pub fn write_files(root: &Path, files: &[(&str, &str)]) {
    for (path, content) in files {
        let path = root.join(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }
}

/// A temporary project holding `files`.
#[allow(dead_code)]
pub fn create_project(files: &[(&str, &str)]) -> TempDir {
    let temp_dir = TempDir::new().unwrap();
    write_files(temp_dir.path(), files);
    temp_dir
}

/// The people directory used across tests: a `User` model, alice with a logical id
/// and bob managed by alice.
#[allow(dead_code)]
pub const PEOPLE: &str = r#"# People

```model:User
name: str?
role: str?
manager: Ref[User]?
```

```entity User: alice @people/alice
name: Alice
role: admin
```

```entity User: bob
manager: [[alice]]
```
"#;

/// A `login` feature in three versions, chained by `former`.
#[allow(dead_code)]
pub const LOGIN_CHAIN: &str = r#"```model:Feature
title: str
status: str = draft
owner: str?
```

```entity Feature: login1 @features/login-v1
title: Login
owner: ops
```

```entity Feature: login2 @features/login-v2
former: [[features/login-v1]]
status: review
```

```entity Feature: login3 @features/login-v3
former: [[features/login-v2]]
status: shipped
```
"#;

#[allow(dead_code)]
pub fn codes(report: &DiagnosticReport) -> Vec<DiagnosticCode> {
    report.iter().map(|d| d.code).collect()
}

#[allow(dead_code)]
pub fn only(report: &DiagnosticReport, code: DiagnosticCode) -> Diagnostic {
    let found = report.by_code(code);
    assert_eq!(found.len(), 1, "expected one {code}, got:\n{report}");
    found[0].clone()
}

/// Entity by handle.
#[allow(dead_code)]
pub fn by_handle<'a>(entities: &'a [Entity], handle: &str) -> &'a Entity {
    entities
        .iter()
        .find(|e| e.handle == handle)
        .unwrap_or_else(|| panic!("no entity '{handle}'"))
}

#[allow(dead_code)]
pub fn path(p: &str) -> PathBuf {
    PathBuf::from(p)
}
