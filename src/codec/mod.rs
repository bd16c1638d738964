//! Compilation of documents into a validated knowledge graph.
//!
//! ## Key Components
//!
//! - [`ProjectCompiler`] - Orchestrates Scan → Link → Validate (→ Spec) across a project
//! - [`DocParser`] trait - Turns raw text into typed [`Block`](crate::properties::Block)s
//! - [`ParserMap`] - Registry of parsers by file extension
//! - [`SchemaEngine`] trait - Registers schemas, instantiates and validates entities
//! - [`SandboxedExecutor`] trait - Executes configuration blocks under a permission set
//! - [`SpecRunner`] trait - Runs project-wide rules after a clean validation
//! - [`Diagnostic`] - Everything a stage has to say about user content
//!
//! ## Stages
//!
//! 1. **Scan** (per file): parse blocks, build raw entities, flag misplaced or
//!    malformed blocks
//! 2. **Link** (per file): execute configuration blocks into directory scopes and
//!    register schema blocks with the schema engine
//! 3. **Validate** (whole project): assemble the symbol table, build the
//!    dependency/evolution graph, resolve every reference in dependency order, merge
//!    evolution chains and instantiate entities
//! 4. **Spec** (whole project, optional): run rule blocks once validation produced
//!    no errors
//!
//! Every collaborator sits behind a trait, so the built-in markdown parser, schema
//! engine, configuration executor and rule runner can each be replaced:
//!
//! ```rust
//! use std::path::Path;
//! use weave_core::codec::{DocParser, ParseOutput, ParserMap};
//!
//! struct NothingParser;
//!
//! impl DocParser for NothingParser {
//!     fn parse(&self, _path: &Path, _text: &str) -> ParseOutput {
//!         ParseOutput::default()
//!     }
//! }
//!
//! let parsers = ParserMap::create();
//! parsers.insert("txt", NothingParser);
//! assert!(parsers.get("txt").is_some());
//! ```

use parking_lot::RwLock;
use std::{path::Path, sync::Arc};

use crate::properties::Block;

pub mod builder;
pub mod compiler;
pub mod diagnostic;
pub mod linker;
pub mod md;
pub mod sandbox;
pub mod schema;
pub mod spec_runner;

pub use builder::{FileProducts, GraphBuilder, ValidationOutput};
pub use compiler::{compile, CompileOutput, FileStage, ProjectCompiler};
pub use diagnostic::{Diagnostic, DiagnosticCode, DiagnosticReport, Severity, Stage};
pub use linker::{ConfigAlias, LinkedUnit, Linker};
pub use sandbox::{
    ConfigBinding, ConfigContext, ConfigOutcome, Permissions, SandboxedExecutor, TomlExecutor,
};
pub use schema::{SchemaDefinition, SchemaEngine, SchemaRegistry};
pub use spec_runner::{ProjectSnapshot, RuleBlock, RuleRunner, SpecRunner};

/// What a parser found in one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseOutput {
    pub blocks: Vec<Block>,
    /// Raw front matter text, if the document has any.
    pub front_matter: Option<String>,
    /// Problems with block boundaries or signatures.
    pub diagnostics: Vec<Diagnostic>,
}

/// Turns document text into blocks. Must be deterministic for identical input and
/// report block bodies without loss.
pub trait DocParser: Send + Sync {
    fn parse(&self, path: &Path, text: &str) -> ParseOutput;
}

/// Parsers by file extension.
#[derive(Clone)]
pub struct ParserMap(Arc<RwLock<Vec<(String, Arc<dyn DocParser>)>>>);

impl ParserMap {
    /// Registry with the markdown parser for `md` and `td`.
    pub fn create() -> Self {
        let markdown: Arc<dyn DocParser> = Arc::new(md::MdParserCodec::new());
        ParserMap(Arc::new(RwLock::new(vec![
            ("md".to_string(), markdown.clone()),
            ("td".to_string(), markdown),
        ])))
    }

    pub fn insert<T: DocParser + 'static>(&self, extension: impl Into<String>, parser: T) {
        let extension = extension.into();
        let parser: Arc<dyn DocParser> = Arc::new(parser);
        let mut writer = self.0.write();
        if let Some(entry) = writer.iter_mut().find(|(ext, _)| ext == &extension) {
            entry.1 = parser;
        } else {
            writer.push((extension, parser));
        }
    }

    pub fn get(&self, ext: &str) -> Option<Arc<dyn DocParser>> {
        self.0
            .read()
            .iter()
            .find(|(parser_ext, _)| parser_ext == ext)
            .map(|(_, parser)| parser.clone())
    }

    /// Parser for a path, by its extension.
    pub fn for_path(&self, path: &Path) -> Option<Arc<dyn DocParser>> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| self.get(ext))
    }

    pub fn extensions(&self) -> Vec<String> {
        self.0.read().iter().map(|(ext, _)| ext.clone()).collect()
    }
}

impl Default for ParserMap {
    fn default() -> Self {
        ParserMap::create()
    }
}

impl std::fmt::Debug for ParserMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ParserMap").field(&self.extensions()).finish()
    }
}
