//! Execution of configuration blocks.
//!
//! Configuration blocks live in a directory's `config.td` and populate that
//! directory's scope. Execution is delegated to a [`SandboxedExecutor`] and is
//! bounded by the [`Permissions`] of the project configuration.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::reference::whole_reference;

/// What configuration code may touch. Supplied by the project configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Permissions {
    pub allow_file_read: bool,
    pub allow_network: bool,
    /// Extra roots, besides the project root, that file access may reach.
    pub allowed_paths: Vec<PathBuf>,
    /// Modules an executor for a scripting language may import.
    pub allowed_modules: Vec<String>,
}

impl Permissions {
    /// Whether `path` lies inside the project root or an allowed path.
    pub fn may_read(&self, root: &Path, path: &Path) -> bool {
        if !self.allow_file_read {
            return false;
        }
        let Ok(path) = path.canonicalize() else {
            return false;
        };
        std::iter::once(root.to_path_buf())
            .chain(self.allowed_paths.iter().map(|p| root.join(p)))
            .filter_map(|allowed| allowed.canonicalize().ok())
            .any(|allowed| path.starts_with(allowed))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigBinding {
    /// A variable inherited by every scope below the directory.
    Value(Value),
    /// A handle bound to the target of a reference query.
    Alias(String),
}

/// Result of executing one configuration block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOutcome {
    pub bindings: BTreeMap<String, ConfigBinding>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

impl ConfigOutcome {
    fn failed(message: impl Into<String>) -> Self {
        ConfigOutcome {
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Where a configuration block runs.
#[derive(Debug, Clone, Copy)]
pub struct ConfigContext<'a> {
    /// Absolute project root.
    pub root: &'a Path,
    /// Project-relative directory the configuration applies to.
    pub dir: &'a Path,
    pub language: &'a str,
}

pub trait SandboxedExecutor: Send + Sync {
    fn execute_config(
        &self,
        code: &str,
        context: &ConfigContext<'_>,
        permissions: &Permissions,
    ) -> ConfigOutcome;
}

const INCLUDE_KEY: &str = "include";

/// Declarative executor: configuration blocks are TOML tables.
///
/// ````markdown
/// ```config
/// DEFAULT_ROLE = "member"
/// Person = "[[models/User]]"
/// include = ["shared.toml"]
/// ```
/// ````
///
/// Each key is a binding. A value that is exactly one `[[reference]]` binds the key
/// as a handle; anything else is an inherited variable. `include` merges other TOML
/// files underneath the block and needs `allow_file_read`.
#[derive(Debug, Clone, Default)]
pub struct TomlExecutor;

impl TomlExecutor {
    pub fn new() -> Self {
        TomlExecutor
    }

    fn includes(
        &self,
        table: &mut toml::Table,
        context: &ConfigContext<'_>,
        permissions: &Permissions,
    ) -> Result<toml::Table, String> {
        let mut merged = toml::Table::new();
        let Some(include) = table.remove(INCLUDE_KEY) else {
            return Ok(merged);
        };
        let paths: Vec<String> = match include {
            toml::Value::String(path) => vec![path],
            toml::Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    toml::Value::String(path) => Ok(path),
                    other => Err(format!("include entries must be strings, found {other}")),
                })
                .collect::<Result<_, _>>()?,
            other => return Err(format!("include must be a string or a list, found {other}")),
        };
        for include in paths {
            if include.starts_with("http://") || include.starts_with("https://") {
                if !permissions.allow_network {
                    return Err(format!("network access denied for include '{include}'"));
                }
                return Err(format!("remote include '{include}' is not supported"));
            }
            let path = context.root.join(context.dir).join(&include);
            if !permissions.may_read(context.root, &path) {
                return Err(format!("file access denied for include '{include}'"));
            }
            let text = fs::read_to_string(&path)
                .map_err(|e| format!("cannot read include '{include}': {e}"))?;
            let included: toml::Table = text
                .parse()
                .map_err(|e| format!("include '{include}' is not valid TOML: {e}"))?;
            merged.extend(included);
        }
        Ok(merged)
    }
}

impl SandboxedExecutor for TomlExecutor {
    fn execute_config(
        &self,
        code: &str,
        context: &ConfigContext<'_>,
        permissions: &Permissions,
    ) -> ConfigOutcome {
        if context.language != "toml" {
            return ConfigOutcome::failed(format!(
                "unsupported configuration language '{}'",
                context.language
            ));
        }
        let mut table: toml::Table = match code.parse() {
            Ok(table) => table,
            Err(e) => return ConfigOutcome::failed(format!("invalid TOML: {e}")),
        };
        let mut merged = match self.includes(&mut table, context, permissions) {
            Ok(merged) => merged,
            Err(e) => return ConfigOutcome::failed(e),
        };
        merged.extend(table);

        let mut outcome = ConfigOutcome::default();
        if merged.is_empty() {
            outcome
                .warnings
                .push("configuration block defines nothing".to_string());
        }
        for (key, value) in merged {
            let binding = match &value {
                toml::Value::String(text) => match whole_reference(text) {
                    Some(query) => ConfigBinding::Alias(query),
                    None => ConfigBinding::Value(toml_to_json(value)),
                },
                _ => ConfigBinding::Value(toml_to_json(value)),
            };
            outcome.bindings.insert(key, binding);
        }
        outcome
    }
}

pub(crate) fn toml_to_json(value: toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::from(i),
        toml::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(d) => Value::String(d.to_string()),
        toml::Value::Array(items) => Value::Array(items.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}
