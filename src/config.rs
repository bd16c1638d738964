use crate::{codec::sandbox::Permissions, error::WeaveError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
};

/// Project configuration file. Marks a project root, or a scope boundary when found
/// in a subdirectory.
pub const PROJECT_CONFIG_NAME: &str = "weave.toml";
/// The only document allowed to hold configuration blocks for its directory.
pub const DIRECTORY_CONFIG_NAME: &str = "config.td";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageConfig {
    pub name: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Document extensions to compile.
    pub extensions: Vec<String>,
    /// Project-relative path prefixes to skip.
    pub exclude: Vec<PathBuf>,
    /// Delay between the last edit and a project validation, in milliseconds.
    pub debounce_ms: u64,
    pub run_specs: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            extensions: vec!["td".to_string(), "md".to_string()],
            exclude: vec![],
            debounce_ms: 150,
            run_specs: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub fuzzy: bool,
    /// Shortest query considered for prefix matching.
    pub min_query_len: usize,
    /// Entity fields whose values name the entity for fuzzy matching.
    pub name_fields: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            fuzzy: true,
            min_query_len: 2,
            name_fields: vec!["name".to_string(), "title".to_string(), "label".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeSettings {
    /// Seeded into the global scope.
    pub vars: BTreeMap<String, Value>,
}

/// Contents of a `weave.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub package: PackageConfig,
    pub compiler: CompilerConfig,
    pub resolver: ResolverConfig,
    pub security: Permissions,
    pub scope: ScopeSettings,
}

impl ProjectConfig {
    pub fn parse(text: &str) -> Result<ProjectConfig, WeaveError> {
        Ok(toml::from_str(text)?)
    }

    /// Read `<root>/weave.toml`. A root without one gets the defaults.
    pub fn load(root: &Path) -> Result<ProjectConfig, WeaveError> {
        let path = root.join(PROJECT_CONFIG_NAME);
        tracing::debug!("Attempting to read project config from: {:?}", &path);
        if !path.exists() {
            tracing::debug!("Config file not found, using defaults.");
            return Ok(ProjectConfig::default());
        }
        ProjectConfig::parse(&get_content(&path)?)
            .map_err(|e| WeaveError::Config(format!("{}: {e}", path.display())))
    }

    /// Whether a project-relative path is a document this project compiles.
    pub fn includes(&self, rel_path: &Path) -> bool {
        let extension_ok = rel_path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.compiler.extensions.iter().any(|e| e == ext))
            .unwrap_or(false);
        extension_ok
            && !self
                .compiler
                .exclude
                .iter()
                .any(|prefix| rel_path.starts_with(prefix))
    }
}

/// Nearest ancestor of `start` (inclusive) holding a `weave.toml`.
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    let start = if start.is_file() { start.parent()? } else { start };
    start
        .ancestors()
        .find(|dir| dir.join(PROJECT_CONFIG_NAME).is_file())
        .map(Path::to_path_buf)
}

pub fn get_content<P: AsRef<Path>>(path: P) -> Result<String, WeaveError> {
    tracing::debug!("Reading {:?}", path.as_ref());
    Ok(read_to_string(path)?)
}
