//! # Language Service - Shared Workspace, Coordinator and File Watching
//!
//! The `watch` module serves a [`ProjectCompiler`] to an editor session and a
//! filesystem watcher at the same time.
//!
//! ## Overview
//!
//! - [`Workspace`]: the compiler state behind a single reader/writer lock, plus the
//!   generation counter that orders validations
//! - [`LanguageService`]: the coordinator thread; applies editor edits and watcher
//!   notifications in arrival order and schedules debounced project validations
//! - [`FileWatcher`]: `notify-debouncer-full` watcher forwarding document and
//!   `weave.toml` changes to the coordinator
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::{path::Path, sync::mpsc::channel};
//! use weave_core::{event::CompileEvent, watch::LanguageService};
//!
//! let (tx, rx) = channel::<CompileEvent>();
//! let mut service = LanguageService::open("docs", tx)?;
//! service.watch()?;
//!
//! service.did_change(Path::new("docs/people.td"), "```entity User: alice\nname: Alice\n```\n".to_string())?;
//! for event in rx {
//!     if let CompileEvent::Published { diagnostics, .. } = event {
//!         println!("{diagnostics}");
//!     }
//! }
//! # Ok::<(), weave_core::WeaveError>(())
//! ```
//!
//! ## Threading Model
//!
//! 1. **Coordinator thread** (`LanguageService`)
//!    - Consumes one FIFO channel of [`ServiceMessage`]s
//!    - Runs Scan and Link for the changed file under the writer lock
//!    - Bumps the generation counter and schedules a validation
//!
//! 2. **File watcher thread** (from `notify-debouncer-full`)
//!    - Filters create / modify / remove events by document extension
//!    - Ignores dot files
//!    - Stamps each change with the time it was observed
//!
//! 3. **Validation tasks** (tokio runtime owned by the coordinator)
//!    - Sleep for `compiler.debounce_ms`
//!    - Drop themselves when a newer generation exists, before and after running
//!    - Run Validate (and the rules) on a blocking thread under the writer lock
//!
//! ## Ordering
//!
//! - Messages for the same file are applied in the order received.
//! - A watcher change observed before the latest editor edit of that file is
//!   coalesced into the edit; while a file has an open editor overlay, watcher
//!   changes for it are ignored.
//! - A `weave.toml` change recompiles from disk and re-applies every open overlay,
//!   then refreshes the watcher's document filter.
//! - Read-only queries take the reader lock and see the last committed snapshot.

use crate::{
    codec::{
        compiler::{CompileOutput, ProjectCompiler},
        diagnostic::DiagnosticReport,
    },
    config::{get_content, PROJECT_CONFIG_NAME},
    error::WeaveError,
    event::{CompileEvent, EventOrigin},
    properties::SourceLocation,
    query::{self, CompletionItem, Hover},
    resolver::ResolutionResult,
};

use notify_debouncer_full::{
    new_debouncer,
    notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher},
    DebounceEventResult, Debouncer, FileIdMap,
};
use parking_lot::{RwLock, RwLockReadGuard};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::{channel, Receiver, Sender},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};
use tokio::runtime::Runtime;

/// A file system watcher with debouncing for one project
type ProjectWatcher = Debouncer<RecommendedWatcher, FileIdMap>;

/// Shared compiler state.
///
/// Writers (edits, removals, recompiles) bump the generation; a validation scheduled
/// for an older generation is stale.
#[derive(Clone)]
pub struct Workspace {
    compiler: Arc<RwLock<ProjectCompiler>>,
    generation: Arc<AtomicU64>,
}

impl Workspace {
    pub fn new(compiler: ProjectCompiler) -> Self {
        Workspace {
            compiler: Arc::new(RwLock::new(compiler)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Compile the project at `root` and wrap it.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, WeaveError> {
        let mut compiler = ProjectCompiler::new(root)?;
        compiler.compile();
        Ok(Workspace::new(compiler))
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Invalidate every validation scheduled so far. Returns the new generation.
    pub fn bump(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Reader access to the last committed state.
    pub fn read(&self) -> RwLockReadGuard<'_, ProjectCompiler> {
        self.compiler.read()
    }

    pub fn compile(&self) -> CompileOutput {
        self.bump();
        self.compiler.write().compile()
    }

    /// Scan, Link and Validate synchronously.
    pub fn update_file(&self, path: &Path, text: &str) -> DiagnosticReport {
        self.bump();
        self.compiler.write().update_file(path, text)
    }

    pub fn remove_file(&self, path: &Path) -> DiagnosticReport {
        self.bump();
        self.compiler.write().remove_file(path)
    }

    pub fn diagnostics(&self) -> DiagnosticReport {
        self.compiler.read().diagnostics()
    }

    pub fn resolve_reference(&self, query: &str, context_path: &Path) -> ResolutionResult {
        self.compiler.read().resolve_reference(query, context_path)
    }

    pub fn find_references(&self, entity_id: &str) -> Vec<SourceLocation> {
        self.compiler.read().find_references(entity_id)
    }

    pub fn completion(&self, prefix: &str, context_path: &Path) -> Vec<CompletionItem> {
        query::completion(&self.compiler.read(), prefix, context_path)
    }

    pub fn hover(&self, query: &str, context_path: &Path) -> Option<Hover> {
        query::hover(&self.compiler.read(), query, context_path)
    }

    pub fn goto_definition(&self, query: &str, context_path: &Path) -> Option<SourceLocation> {
        query::goto_definition(&self.compiler.read(), query, context_path)
    }
}

/// Work items of the coordinator, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceMessage {
    /// Editor text for a file; opens an overlay.
    Edit { path: PathBuf, text: String },
    /// The editor closed the file; its on-disk content applies again.
    Close { path: PathBuf },
    /// The watcher saw a document change at `observed`.
    FileChanged { path: PathBuf, observed: Instant },
    /// `weave.toml` changed.
    ProjectConfigChanged,
    Shutdown,
}

/// Coordinator of editor and watcher updates over a [`Workspace`].
pub struct LanguageService {
    workspace: Workspace,
    messages: Sender<ServiceMessage>,
    coordinator: Option<JoinHandle<()>>,
    watcher: Option<FileWatcher>,
    filter: DocumentFilter,
}

impl LanguageService {
    /// Start the coordinator over an already compiled workspace.
    pub fn start(workspace: Workspace, events: Sender<CompileEvent>) -> Result<Self, WeaveError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .build()?;
        let filter = DocumentFilter::new(workspace.read().config().compiler.extensions.clone());
        let (messages, inbox) = channel();
        let coordinator = Coordinator {
            workspace: workspace.clone(),
            events,
            runtime,
            filter: filter.clone(),
            overlays: BTreeMap::new(),
            last_edit: BTreeMap::new(),
        };
        let handle = std::thread::Builder::new()
            .name("weave-coordinator".to_string())
            .spawn(move || coordinator.run(inbox))?;
        Ok(LanguageService {
            workspace,
            messages,
            coordinator: Some(handle),
            watcher: None,
            filter,
        })
    }

    /// Compile the project at `root` and start serving it.
    pub fn open(root: impl AsRef<Path>, events: Sender<CompileEvent>) -> Result<Self, WeaveError> {
        LanguageService::start(Workspace::open(root)?, events)
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Watch the project root for changes made outside the editor.
    pub fn watch(&mut self) -> Result<(), WeaveError> {
        if self.watcher.is_some() {
            return Err(WeaveError::Service("already watching".to_string()));
        }
        let root = self.workspace.read().root().to_path_buf();
        self.watcher = Some(FileWatcher::start(&root, self.filter.clone(), self.messages.clone())?);
        Ok(())
    }

    pub fn did_change(&self, path: &Path, text: String) -> Result<(), WeaveError> {
        self.send(ServiceMessage::Edit {
            path: path.to_path_buf(),
            text,
        })
    }

    pub fn did_close(&self, path: &Path) -> Result<(), WeaveError> {
        self.send(ServiceMessage::Close {
            path: path.to_path_buf(),
        })
    }

    /// Report an on-disk change, as the watcher would.
    pub fn file_changed(&self, path: &Path) -> Result<(), WeaveError> {
        self.send(ServiceMessage::FileChanged {
            path: path.to_path_buf(),
            observed: Instant::now(),
        })
    }

    pub fn send(&self, message: ServiceMessage) -> Result<(), WeaveError> {
        Ok(self.messages.send(message)?)
    }

    /// Stop watching, drain the coordinator and wait for it.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.watcher = None;
        let _ = self.messages.send(ServiceMessage::Shutdown);
        if let Some(handle) = self.coordinator.take() {
            if handle.join().is_err() {
                tracing::error!("[Coordinator] thread panicked");
            }
        }
    }
}

impl Drop for LanguageService {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Coordinator {
    workspace: Workspace,
    events: Sender<CompileEvent>,
    runtime: Runtime,
    filter: DocumentFilter,
    /// Unsaved editor text by file.
    overlays: BTreeMap<PathBuf, String>,
    last_edit: BTreeMap<PathBuf, Instant>,
}

impl Coordinator {
    fn run(mut self, inbox: Receiver<ServiceMessage>) {
        tracing::debug!("[Coordinator] started");
        while let Ok(message) = inbox.recv() {
            match message {
                ServiceMessage::Edit { path, text } => {
                    let path = self.workspace.read().relative(&path);
                    self.overlays.insert(path.clone(), text.clone());
                    self.last_edit.insert(path.clone(), Instant::now());
                    self.stage(&path, Some(text), EventOrigin::Editor);
                }
                ServiceMessage::Close { path } => {
                    let path = self.workspace.read().relative(&path);
                    if self.overlays.remove(&path).is_some() {
                        self.stage_from_disk(&path, EventOrigin::Editor);
                    }
                }
                ServiceMessage::FileChanged { path, observed } => {
                    let path = self.workspace.read().relative(&path);
                    if self.overlays.contains_key(&path) {
                        tracing::debug!("[Coordinator] {} has an editor overlay, ignoring disk change", path.display());
                        continue;
                    }
                    if self.last_edit.get(&path).is_some_and(|edited| *edited >= observed) {
                        tracing::debug!("[Coordinator] disk change of {} superseded by an edit", path.display());
                        continue;
                    }
                    self.stage_from_disk(&path, EventOrigin::Watcher);
                }
                ServiceMessage::ProjectConfigChanged => self.reload(),
                ServiceMessage::Shutdown => break,
            }
        }
        self.runtime.shutdown_timeout(Duration::from_secs(1));
        tracing::debug!("[Coordinator] stopped");
    }

    /// Recompile from disk, then put the open editor overlays back on top.
    fn reload(&mut self) {
        let generation = self.workspace.bump();
        let output = {
            let mut compiler = self.workspace.compiler.write();
            let output = compiler.compile();
            for (path, text) in &self.overlays {
                compiler.scan_and_link(path, text);
            }
            self.filter.update(compiler.config().compiler.extensions.clone());
            output
        };
        tracing::info!(
            "[Coordinator] project configuration changed, recompiled with {} open overlays",
            self.overlays.len()
        );
        self.emit(CompileEvent::ProjectReloaded(output.diagnostics));
        if !self.overlays.is_empty() {
            self.schedule_validation(generation);
        }
    }

    fn stage_from_disk(&mut self, path: &Path, origin: EventOrigin) {
        let absolute = self.workspace.read().root().join(path);
        if absolute.is_file() {
            match get_content(&absolute) {
                Ok(text) => self.stage(path, Some(text), origin),
                Err(e) => tracing::warn!("[Coordinator] cannot read {}: {e}", path.display()),
            }
        } else {
            self.stage(path, None, origin);
        }
    }

    /// Scan and Link one file (or forget it), then schedule a validation.
    fn stage(&mut self, path: &Path, text: Option<String>, origin: EventOrigin) {
        let generation = self.workspace.bump();
        let changed = {
            let mut compiler = self.workspace.compiler.write();
            match &text {
                Some(text) => compiler.scan_and_link(path, text),
                None => compiler.forget_file(path),
            }
        };
        if !changed {
            return;
        }
        self.emit(match text {
            Some(_) => CompileEvent::FileStaged(path.to_path_buf(), origin),
            None => CompileEvent::FileRemoved(path.to_path_buf(), origin),
        });
        self.schedule_validation(generation);
    }

    fn schedule_validation(&self, generation: u64) {
        let workspace = self.workspace.clone();
        let events = self.events.clone();
        let delay = Duration::from_millis(self.workspace.read().config().compiler.debounce_ms);
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if workspace.generation() != generation {
                let _ = events.send(CompileEvent::Discarded { generation });
                return;
            }
            let task_workspace = workspace.clone();
            let result = tokio::task::spawn_blocking(move || {
                let mut compiler = task_workspace.compiler.write();
                if task_workspace.generation() != generation {
                    return None;
                }
                Some(compiler.revalidate())
            })
            .await;
            let event = match result {
                Ok(Some(diagnostics)) if workspace.generation() == generation => {
                    tracing::debug!("[Coordinator] publishing generation {}: {} diagnostics", generation, diagnostics.len());
                    CompileEvent::Published {
                        generation,
                        diagnostics,
                    }
                }
                Ok(_) => CompileEvent::Discarded { generation },
                Err(e) => {
                    tracing::error!("[Coordinator] validation task failed: {e}");
                    return;
                }
            };
            let _ = events.send(event);
        });
    }

    fn emit(&self, event: CompileEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("[Coordinator] event receiver dropped");
        }
    }
}

/// Which changed paths are documents. Shared between the watcher thread and the
/// coordinator, which refreshes it when `weave.toml` is reloaded.
#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    extensions: Arc<RwLock<Vec<String>>>,
}

impl DocumentFilter {
    pub fn new(extensions: Vec<String>) -> Self {
        DocumentFilter {
            extensions: Arc::new(RwLock::new(extensions)),
        }
    }

    pub fn update(&self, extensions: Vec<String>) {
        *self.extensions.write() = extensions;
    }

    pub fn accepts(&self, path: &Path) -> bool {
        !is_dot_file(path)
            && path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| self.extensions.read().iter().any(|e| e == ext))
    }
}

/// Filesystem watcher of one project root.
pub struct FileWatcher {
    debouncer: ProjectWatcher,
    root: PathBuf,
}

impl FileWatcher {
    pub fn start(root: &Path, filter: DocumentFilter, sink: Sender<ServiceMessage>) -> Result<Self, WeaveError> {
        let mut debouncer = new_debouncer(
            Duration::from_millis(200),
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    let observed = Instant::now();
                    let mut config_changed = false;
                    let mut changed = BTreeSet::new();
                    for event in events.iter() {
                        if !matches!(
                            event.event.kind,
                            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                        ) {
                            continue;
                        }
                        for path in event.paths.iter().filter(|p| !is_dot_file(p)) {
                            if path.file_name().is_some_and(|name| name == PROJECT_CONFIG_NAME) {
                                config_changed = true;
                            } else if filter.accepts(path) {
                                changed.insert(path.clone());
                            }
                        }
                    }
                    if config_changed {
                        tracing::info!("[Watch] {} changed", PROJECT_CONFIG_NAME);
                        let _ = sink.send(ServiceMessage::ProjectConfigChanged);
                        return;
                    }
                    if !changed.is_empty() {
                        tracing::info!("[Watch] {} files changed", changed.len());
                    }
                    for path in changed {
                        if sink.send(ServiceMessage::FileChanged { path, observed }).is_err() {
                            tracing::debug!("[Watch] coordinator gone");
                            return;
                        }
                    }
                }
                Err(errors) => {
                    tracing::error!("[Watch] notify debouncer returned errors: {:?}", errors);
                }
            },
        )?;
        debouncer.watcher().watch(root, RecursiveMode::Recursive)?;
        tracing::debug!("[Watch] watching {}", root.display());
        Ok(FileWatcher {
            debouncer,
            root: root.to_path_buf(),
        })
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        let unwatch_res = self.debouncer.watcher().unwatch(&self.root);
        tracing::debug!("[Watch] unwatch({:?}) = {:?}", self.root, unwatch_res);
    }
}

fn is_dot_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}
