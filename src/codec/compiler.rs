use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use walkdir::WalkDir;

use crate::{
    codec::{
        builder::{FileProducts, GraphBuilder, ValidationOutput},
        diagnostic::{Diagnostic, DiagnosticCode, DiagnosticReport},
        linker::{LinkedUnit, Linker},
        md::MdParserCodec,
        sandbox::{SandboxedExecutor, TomlExecutor},
        schema::{value_kind, SchemaEngine, SchemaRegistry},
        spec_runner::{ProjectSnapshot, RuleRunner, SpecRunner},
        DocParser, ParserMap,
    },
    config::{get_content, ProjectConfig, DIRECTORY_CONFIG_NAME, PROJECT_CONFIG_NAME},
    error::WeaveError,
    properties::{
        desugar, has_nested_list, Block, BlockKey, BlockKind, Entity, EntityKey, Fields,
        SourceLocation, DERIVED_FROM_KEY, FORMER_KEY,
    },
    reference::Reference,
    resolver::{FuzzyMatcher, ResolutionResult, Resolver, SegmentMatcher},
    symbols::{ScopeId, SymbolTable},
};

/// Pipeline watermark of one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FileStage {
    #[default]
    Unscanned,
    Scanned,
    Linked,
    Validated,
    /// Validated project-wide without errors, and the rules ran.
    SpecRun,
}

/// Per-file Scan and Link products.
#[derive(Debug, Clone, Default)]
struct FileState {
    stage: FileStage,
    blocks: Vec<Block>,
    entities: Vec<Entity>,
    linked: LinkedUnit,
    /// Front matter keys, the variables of the file's own scope.
    front_matter: BTreeMap<String, Value>,
    scan_diagnostics: Vec<Diagnostic>,
}

/// Result of a batch compile.
#[derive(Debug, Clone, Default)]
pub struct CompileOutput {
    /// Entities in source order.
    pub entities: Vec<Entity>,
    pub diagnostics: DiagnosticReport,
}

/// Orchestrates Scan → Link → Validate (→ Spec) over one project.
///
/// ## Stages
///
/// - **Scan** (per file) parses a document into blocks and raw entities. Re-scanning a
///   file replaces everything it produced before.
/// - **Link** (per file) executes the configuration blocks of a directory's
///   `config.td` into that directory's scope and registers schema blocks with the
///   [`SchemaEngine`]. When a configuration changes the variables it sets, every file
///   below its directory (up to a scope boundary) is linked again, since schema
///   defaults may refer to those variables.
/// - **Validate** (project) always runs over every file: any reference may target an
///   entity of any other file. It reuses the Linked per-file products and rebuilds the
///   symbol table, the dependency/evolution graph and every resolved entity from
///   them, in source order.
/// - **Spec** (project) runs rule blocks through the [`SpecRunner`], only when the
///   project has no Error-severity diagnostic.
///
/// ## Incremental updates
///
/// [`ProjectCompiler::update_file`] re-runs Scan and Link for one file and then
/// Validate for the project. The split is also available as
/// [`ProjectCompiler::scan_and_link`] plus [`ProjectCompiler::revalidate`], which the
/// language service uses to debounce the project-wide part.
///
/// ## Failure policy
///
/// Nothing about user content aborts a stage. Scan and Link problems stay with their
/// file, Validate problems with the entity or edge involved. All of them are collected
/// as [`Diagnostic`]s; [`WeaveError`] is reserved for operational failures such as an
/// unreadable project root.
///
/// ```rust,no_run
/// use weave_core::codec::ProjectCompiler;
///
/// let mut compiler = ProjectCompiler::new("docs")?;
/// let output = compiler.compile();
/// for diagnostic in output.diagnostics.errors() {
///     eprintln!("{diagnostic}");
/// }
/// # Ok::<(), weave_core::WeaveError>(())
/// ```
pub struct ProjectCompiler {
    root: PathBuf,
    config: ProjectConfig,
    parsers: ParserMap,
    engine: Arc<dyn SchemaEngine>,
    executor: Arc<dyn SandboxedExecutor>,
    spec_runner: Arc<dyn SpecRunner>,
    custom_matcher: Option<Arc<dyn FuzzyMatcher>>,
    run_specs: Option<bool>,
    files: BTreeMap<PathBuf, FileState>,
    symbols: SymbolTable,
    validation: ValidationOutput,
    system_diagnostics: Vec<Diagnostic>,
    spec_diagnostics: Vec<Diagnostic>,
}

impl ProjectCompiler {
    /// Compiler for the project rooted at `root`, with the built-in collaborators.
    /// A malformed `weave.toml` is reported as a diagnostic and the defaults apply.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, WeaveError> {
        let root = root.as_ref().canonicalize()?;
        let mut system_diagnostics = vec![];
        let config = ProjectConfig::load(&root).unwrap_or_else(|e| {
            system_diagnostics.push(
                Diagnostic::new(DiagnosticCode::E0983, e.to_string())
                    .at(SourceLocation::file(PROJECT_CONFIG_NAME)),
            );
            ProjectConfig::default()
        });
        let mut compiler = ProjectCompiler {
            root,
            config,
            parsers: ParserMap::create(),
            engine: Arc::new(SchemaRegistry::create()),
            executor: Arc::new(TomlExecutor::new()),
            spec_runner: Arc::new(RuleRunner::new()),
            custom_matcher: None,
            run_specs: None,
            files: BTreeMap::new(),
            symbols: SymbolTable::new(),
            validation: ValidationOutput::default(),
            system_diagnostics,
            spec_diagnostics: vec![],
        };
        compiler.register_extensions();
        compiler.seed_global_vars();
        Ok(compiler)
    }

    pub fn with_schema_engine(mut self, engine: Arc<dyn SchemaEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn SandboxedExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_spec_runner(mut self, spec_runner: Arc<dyn SpecRunner>) -> Self {
        self.spec_runner = spec_runner;
        self
    }

    pub fn with_matcher(mut self, matcher: Arc<dyn FuzzyMatcher>) -> Self {
        self.custom_matcher = Some(matcher);
        self
    }

    /// Override `compiler.run_specs` from `weave.toml`.
    pub fn with_specs(mut self, enabled: bool) -> Self {
        self.run_specs = Some(enabled);
        self
    }

    pub fn with_parser<T: DocParser + 'static>(self, extension: &str, parser: T) -> Self {
        self.parsers.insert(extension, parser);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn validation(&self) -> &ValidationOutput {
        &self.validation
    }

    fn register_extensions(&self) {
        for extension in &self.config.compiler.extensions {
            if self.parsers.get(extension).is_none() {
                self.parsers.insert(extension.as_str(), MdParserCodec::new());
            }
        }
    }

    fn seed_global_vars(&mut self) {
        self.symbols.scopes.get_mut(ScopeId::GLOBAL).inherited_vars = self.config.scope.vars.clone();
    }

    fn matcher(&self) -> Arc<dyn FuzzyMatcher> {
        self.custom_matcher
            .clone()
            .unwrap_or_else(|| Arc::new(SegmentMatcher::new(self.config.resolver.min_query_len)))
    }

    /// Project-relative form of `path`.
    pub fn relative(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            if let Ok(rel) = path.strip_prefix(&self.root) {
                return rel.to_path_buf();
            }
            if let Some(rel) = path
                .canonicalize()
                .ok()
                .and_then(|p| p.strip_prefix(&self.root).ok().map(Path::to_path_buf))
            {
                return rel;
            }
        }
        path.to_path_buf()
    }

    /// Whether `path` is a document of this project.
    pub fn is_document(&self, path: &Path) -> bool {
        self.config.includes(&self.relative(path))
    }

    /// Full batch compile from the filesystem. Reloads `weave.toml` and starts from a
    /// clean slate.
    #[tracing::instrument(skip_all, fields(root = %self.root.display()))]
    pub fn compile(&mut self) -> CompileOutput {
        self.system_diagnostics.clear();
        match ProjectConfig::load(&self.root) {
            Ok(config) => self.config = config,
            Err(e) => self.system_diagnostics.push(
                Diagnostic::new(DiagnosticCode::E0983, e.to_string())
                    .at(SourceLocation::file(PROJECT_CONFIG_NAME)),
            ),
        }
        self.register_extensions();
        self.files.clear();
        self.symbols = SymbolTable::new();
        self.seed_global_vars();

        let paths = self.discover();
        tracing::debug!("[Compiler] scanning {} documents", paths.len());
        for rel in &paths {
            let state = match get_content(self.root.join(rel)) {
                Ok(text) => self.scan(rel, &text),
                Err(e) => FileState {
                    stage: FileStage::Scanned,
                    scan_diagnostics: vec![Diagnostic::new(
                        DiagnosticCode::E0104,
                        format!("cannot read {}: {e}", rel.display()),
                    )
                    .at(SourceLocation::file(rel))],
                    ..Default::default()
                },
            };
            self.files.insert(rel.clone(), state);
        }
        self.link_all();
        self.revalidate();

        let output = CompileOutput {
            entities: self.entities().cloned().collect(),
            diagnostics: self.diagnostics(),
        };
        tracing::info!(
            "[Compiler] compiled {} files: {} entities, {} diagnostics ({} errors)",
            self.files.len(),
            output.entities.len(),
            output.diagnostics.len(),
            output.diagnostics.errors().count()
        );
        output
    }

    /// Documents under the root, in path order. Nested `weave.toml` files mark scope
    /// boundaries.
    fn discover(&mut self) -> Vec<PathBuf> {
        let mut found = vec![];
        let walker = WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.')
            });
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let location = e
                        .path()
                        .map(|p| SourceLocation::file(self.relative(p)));
                    let mut diagnostic = Diagnostic::new(DiagnosticCode::E0982, e.to_string());
                    if let Some(location) = location {
                        diagnostic = diagnostic.at(location);
                    }
                    self.system_diagnostics.push(diagnostic);
                    continue;
                }
            };
            let Ok(rel) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            if entry.file_type().is_dir() {
                if entry.depth() > 0 && entry.path().join(PROJECT_CONFIG_NAME).is_file() {
                    tracing::debug!("[Compiler] scope boundary at {}", rel.display());
                    self.symbols.scopes.add_boundary(rel);
                }
                continue;
            }
            if self.config.includes(rel) {
                found.push(rel.to_path_buf());
            }
        }
        found
    }

    fn scan(&self, rel: &Path, text: &str) -> FileState {
        let mut state = FileState {
            stage: FileStage::Scanned,
            ..Default::default()
        };
        let Some(parser) = self.parsers.for_path(rel) else {
            state.scan_diagnostics.push(
                Diagnostic::new(DiagnosticCode::E0981, format!("no parser for {}", rel.display()))
                    .at(SourceLocation::file(rel)),
            );
            return state;
        };
        let output = parser.parse(rel, text);
        state.scan_diagnostics.extend(output.diagnostics);
        if let Some(matter) = output.front_matter.as_deref() {
            state.front_matter = scan_front_matter(rel, matter, &mut state.scan_diagnostics);
        }
        let in_config = is_directory_config(rel);
        for (ordinal, block) in output.blocks.iter().enumerate() {
            match block.kind {
                BlockKind::ScopeConfig if !in_config => state.scan_diagnostics.push(
                    Diagnostic::new(
                        DiagnosticCode::E0102,
                        format!("configuration blocks are only allowed in a directory's {DIRECTORY_CONFIG_NAME}"),
                    )
                    .at(block.location.clone()),
                ),
                BlockKind::Instance => {
                    let fields = scan_body(block, &mut state.scan_diagnostics);
                    state
                        .entities
                        .push(Entity::from_block(BlockKey::new(rel, ordinal), block, fields));
                }
                _ => {}
            }
        }
        state.blocks = output.blocks;
        tracing::trace!(
            "[Compiler] scanned {}: {} blocks, {} entities",
            rel.display(),
            state.blocks.len(),
            state.entities.len()
        );
        state
    }

    /// Configuration files first, shallow directories first, then the rest in path
    /// order.
    fn link_all(&mut self) {
        let mut order: Vec<PathBuf> = self.files.keys().cloned().collect();
        order.sort_by_key(|path| {
            (
                !is_directory_config(path),
                path.components().count(),
                path.clone(),
            )
        });
        for rel in order {
            self.link(&rel, false);
        }
    }

    fn link(&mut self, rel: &Path, cascade: bool) {
        let Some(state) = self.files.get(rel) else {
            return;
        };
        let linker = Linker::new(&self.root, &*self.engine, &*self.executor, &self.config.security);
        let is_config = is_directory_config(rel);
        let file_scope = self.symbols.scopes.file_scope(rel);
        self.symbols.scopes.get_mut(file_scope).inherited_vars = state.front_matter.clone();
        let mut unit = if is_config {
            linker.link_config(rel, &state.blocks, &mut self.symbols.scopes)
        } else {
            LinkedUnit::default()
        };
        linker.link_schemas(rel, &state.blocks, &mut self.symbols.scopes, &mut unit);
        let vars_changed = is_config && unit.vars != state.linked.vars;

        if let Some(state) = self.files.get_mut(rel) {
            state.linked = unit;
            state.stage = FileStage::Linked;
        }
        if cascade && vars_changed {
            self.relink_below(rel.parent().unwrap_or(Path::new("")), rel);
        }
    }

    fn relink_below(&mut self, dir: &Path, except: &Path) {
        let below: Vec<PathBuf> = self
            .files
            .keys()
            .filter(|path| path.as_path() != except && self.symbols.scopes.covers(dir, path))
            .cloned()
            .collect();
        tracing::debug!(
            "[Compiler] configuration of '{}' changed, re-linking {} files",
            dir.display(),
            below.len()
        );
        for rel in below {
            self.link(&rel, false);
        }
    }

    fn invalidate_validation(&mut self) {
        for state in self.files.values_mut() {
            if state.stage > FileStage::Linked {
                state.stage = FileStage::Linked;
            }
        }
    }

    /// Scan and link one file from editor or watcher text. Returns false when the
    /// path is not a document of this project.
    pub fn scan_and_link(&mut self, path: &Path, text: &str) -> bool {
        let rel = self.relative(path);
        if !self.config.includes(&rel) {
            tracing::debug!("[Compiler] ignoring {}", rel.display());
            return false;
        }
        let state = self.scan(&rel, text);
        self.files.insert(rel.clone(), state);
        self.link(&rel, true);
        self.invalidate_validation();
        true
    }

    /// Incremental recompile: Scan and Link `path`, then Validate the project.
    pub fn update_file(&mut self, path: &Path, text: &str) -> DiagnosticReport {
        if self.scan_and_link(path, text) {
            self.revalidate();
        }
        self.diagnostics()
    }

    /// Drop a document's Scan and Link products. Returns false for unknown paths.
    pub fn forget_file(&mut self, path: &Path) -> bool {
        let rel = self.relative(path);
        if self.files.remove(&rel).is_none() {
            return false;
        }
        self.symbols.scopes.remove_file(&rel);
        if is_directory_config(&rel) {
            let dir = rel.parent().unwrap_or(Path::new("")).to_path_buf();
            if let Some(scope) = self.symbols.scopes.existing_directory_scope(&dir) {
                self.symbols.scopes.get_mut(scope).inherited_vars.clear();
            }
            self.relink_below(&dir, &rel);
        }
        self.invalidate_validation();
        true
    }

    /// Forget a document, then Validate the project.
    pub fn remove_file(&mut self, path: &Path) -> DiagnosticReport {
        if self.forget_file(path) {
            self.revalidate();
        }
        self.diagnostics()
    }

    /// Project-wide Validate over the Linked per-file state.
    #[tracing::instrument(skip_all)]
    pub fn validate(&mut self) -> &ValidationOutput {
        let matcher = self.matcher();
        let products: Vec<FileProducts<'_>> = self
            .files
            .iter()
            .map(|(path, state)| FileProducts {
                path,
                blocks: &state.blocks,
                entities: &state.entities,
                linked: &state.linked,
            })
            .collect();
        let builder = GraphBuilder::new(
            &*self.engine,
            self.config.resolver.fuzzy.then_some(&*matcher),
            &self.config.resolver,
        );
        self.validation = builder.build(&mut self.symbols, &products);
        self.spec_diagnostics.clear();
        for state in self.files.values_mut() {
            if state.stage >= FileStage::Linked {
                state.stage = FileStage::Validated;
            }
        }
        &self.validation
    }

    /// Run the rule blocks. Skipped (returning false) while the project has errors.
    #[tracing::instrument(skip_all)]
    pub fn run_specs(&mut self) -> bool {
        let blocking = self.diagnostics().errors().count();
        if blocking > 0 {
            tracing::debug!("[Compiler] {} errors, not running specs", blocking);
            return false;
        }
        let snapshot = ProjectSnapshot {
            entities: self.validation.entities.values().cloned().collect(),
            rules: self.validation.rules.clone(),
            schema_names: self.symbols.schema_names().cloned().collect(),
        };
        self.spec_diagnostics = self.spec_runner.run_specs(&snapshot);
        for state in self.files.values_mut() {
            if state.stage == FileStage::Validated {
                state.stage = FileStage::SpecRun;
            }
        }
        true
    }

    /// Validate, then run the rules if configured to.
    pub fn revalidate(&mut self) -> DiagnosticReport {
        self.validate();
        if self.run_specs.unwrap_or(self.config.compiler.run_specs) {
            self.run_specs();
        }
        self.diagnostics()
    }

    pub fn stage(&self, path: &Path) -> FileStage {
        self.files
            .get(&self.relative(path))
            .map(|state| state.stage)
            .unwrap_or_default()
    }

    pub fn files(&self) -> impl Iterator<Item = &PathBuf> {
        self.files.keys()
    }

    /// Entities of the last validation, in source order.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.validation.entities.values()
    }

    fn entity_key(&self, id: &str) -> Option<&EntityKey> {
        self.symbols
            .lookup_id(id)
            .and_then(|target| target.as_entity())
            .or_else(|| self.symbols.lookup_hash(id))
    }

    /// Entity by logical id or content hash.
    pub fn entity(&self, id: &str) -> Option<&Entity> {
        self.entity_key(id)
            .and_then(|key| self.validation.entities.get(key))
    }

    pub fn entity_by_key(&self, key: &EntityKey) -> Option<&Entity> {
        self.validation.entities.get(key)
    }

    pub fn block(&self, key: &BlockKey) -> Option<&Block> {
        self.files
            .get(&key.path)
            .and_then(|state| state.blocks.get(key.ordinal))
    }

    /// Every diagnostic of the project, sorted.
    pub fn diagnostics(&self) -> DiagnosticReport {
        let mut report: DiagnosticReport = self
            .system_diagnostics
            .iter()
            .chain(self.files.values().flat_map(|state| {
                state
                    .scan_diagnostics
                    .iter()
                    .chain(state.linked.diagnostics.iter())
            }))
            .chain(self.validation.diagnostics.iter())
            .chain(self.spec_diagnostics.iter())
            .cloned()
            .collect();
        report.sort();
        report
    }

    /// Resolve `query` as if written in `context_path`.
    pub fn resolve_reference(&self, query: &str, context_path: &Path) -> ResolutionResult {
        let reference = match Reference::parse(query) {
            Ok(reference) => reference,
            Err(e) => return ResolutionResult::NotFound(e.to_string()),
        };
        let matcher = self.matcher();
        let resolver = Resolver::new(
            &self.symbols,
            &self.validation.evolution,
            self.config.resolver.fuzzy.then_some(&*matcher),
        );
        let scope = self.symbols.scopes.scope_for(&self.relative(context_path));
        resolver.resolve(&reference, scope, &self.validation.entities)
    }

    /// Where the entity with logical id or hash `entity_id` is referenced: field
    /// references, plain links and evolution links.
    pub fn find_references(&self, entity_id: &str) -> Vec<SourceLocation> {
        match self.entity_key(entity_id) {
            Some(key) => self.find_references_to(key),
            None => vec![],
        }
    }

    pub fn find_references_to(&self, key: &EntityKey) -> Vec<SourceLocation> {
        let mut locations = BTreeSet::new();
        for (referrer, _) in self.validation.graph.referrers(key) {
            let Some(block) = self.block(&referrer) else {
                continue;
            };
            let mut needles: Vec<String> = self
                .validation
                .links
                .get(&referrer)
                .into_iter()
                .flatten()
                .filter(|(_, head)| head.entity() == Some(key))
                .map(|(query, _)| format!("[[{query}"))
                .collect();
            if let Some(entity) = self.validation.entities.get(&referrer) {
                for (link, name) in [(&entity.former, FORMER_KEY), (&entity.derived_from, DERIVED_FROM_KEY)] {
                    if link.as_ref().and_then(|l| l.target.as_ref()) == Some(key) {
                        needles.push(format!("{name}:"));
                    }
                }
            }
            for needle in needles {
                locations.insert(block.location.at_line(block.line_of(&needle)));
            }
        }
        locations.into_iter().collect()
    }
}

impl std::fmt::Debug for ProjectCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectCompiler")
            .field("root", &self.root)
            .field("files", &self.files.len())
            .field("entities", &self.validation.entities.len())
            .finish()
    }
}

/// Batch compile of the project at `root`.
pub fn compile(root: impl AsRef<Path>) -> Result<CompileOutput, WeaveError> {
    Ok(ProjectCompiler::new(root)?.compile())
}

fn is_directory_config(path: &Path) -> bool {
    path.file_name()
        .map(|name| name == DIRECTORY_CONFIG_NAME)
        .unwrap_or(false)
}

/// Parse an instance body. `None` means the body is not structured data and the
/// entity falls back to a text hash.
/// Front matter is a YAML map. Anything else is reported and ignored.
fn scan_front_matter(rel: &Path, matter: &str, diagnostics: &mut Vec<Diagnostic>) -> BTreeMap<String, Value> {
    match serde_yaml::from_str::<Value>(matter) {
        Ok(Value::Object(map)) => map.into_iter().collect(),
        Ok(Value::Null) => BTreeMap::new(),
        Ok(other) => {
            diagnostics.push(
                Diagnostic::new(
                    DiagnosticCode::E0101,
                    format!("front matter must be a map, found {}", value_kind(&other)),
                )
                .at(SourceLocation::file(rel)),
            );
            BTreeMap::new()
        }
        Err(e) => {
            // the opening fence is line 1
            let line = e.location().map(|l| 1 + l.line()).unwrap_or(1);
            diagnostics.push(
                Diagnostic::new(DiagnosticCode::E0101, format!("front matter is not valid YAML: {e}"))
                    .at(SourceLocation::new(rel, line, line)),
            );
            BTreeMap::new()
        }
    }
}

fn scan_body(block: &Block, diagnostics: &mut Vec<Diagnostic>) -> Option<Fields> {
    if block.raw_body.trim().is_empty() {
        return Some(Fields::new());
    }
    let value = match serde_yaml::from_str::<Value>(&block.raw_body) {
        Ok(value) => desugar(value),
        Err(e) => {
            let line = e
                .location()
                .map(|l| block.location.line_start + l.line())
                .unwrap_or(block.location.line_start);
            diagnostics.push(
                Diagnostic::new(
                    DiagnosticCode::E0101,
                    format!("body of '{}' is not valid YAML: {e}", block.handle),
                )
                .at(block.location.at_line(line)),
            );
            return None;
        }
    };
    match value {
        Value::Object(fields) => {
            for (field, value) in &fields {
                if has_nested_list(value) {
                    diagnostics.push(
                        Diagnostic::new(
                            DiagnosticCode::E0103,
                            format!("'{}.{field}' is a list of lists; use a list of maps", block.handle),
                        )
                        .at(block.location.at_line(block.line_of(&format!("{field}:")))),
                    );
                }
            }
            Some(fields)
        }
        Value::Null => Some(Fields::new()),
        other => {
            diagnostics.push(
                Diagnostic::new(
                    DiagnosticCode::E0101,
                    format!("body of '{}' must be a map, found {}", block.handle, value_kind(&other)),
                )
                .at(block.location.clone()),
            );
            None
        }
    }
}
