use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use serde_json::Value;

use crate::{
    properties::{BlockKey, SourceLocation, Target},
    symbols::SymbolError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScopeId(usize);

impl ScopeId {
    pub const GLOBAL: ScopeId = ScopeId(0);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeKind {
    Global,
    Directory(PathBuf),
    File(PathBuf),
}

/// What a handle is bound to, and which block introduced the binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub target: Target,
    pub owner: BlockKey,
    pub location: Option<SourceLocation>,
}

#[derive(Debug, Clone)]
pub struct Scope {
    pub kind: ScopeKind,
    pub parent: Option<ScopeId>,
    bindings: BTreeMap<String, Binding>,
    /// Variables set at this level. Descendants see them through
    /// [`ScopeTree::effective_vars`].
    pub inherited_vars: BTreeMap<String, Value>,
    pub is_boundary: bool,
}

impl Scope {
    fn new(kind: ScopeKind, parent: Option<ScopeId>, is_boundary: bool) -> Self {
        Scope {
            kind,
            parent,
            bindings: BTreeMap::new(),
            inherited_vars: BTreeMap::new(),
            is_boundary,
        }
    }

    pub fn get(&self, handle: &str) -> Option<&Binding> {
        self.bindings.get(handle)
    }

    pub fn bindings(&self) -> impl Iterator<Item = (&String, &Binding)> {
        self.bindings.iter()
    }
}

/// Lexical scopes of a project: global → directories → files.
///
/// Scopes are kept in an arena indexed by [`ScopeId`]. Directory scopes are created
/// on demand along with their ancestors; a directory registered as a boundary
/// terminates upward lookup and variable inheritance.
#[derive(Debug, Clone)]
pub struct ScopeTree {
    scopes: Vec<Scope>,
    dirs: BTreeMap<PathBuf, ScopeId>,
    files: BTreeMap<PathBuf, ScopeId>,
    boundaries: BTreeSet<PathBuf>,
    /// Slots of removed file scopes, reused by the next new file.
    free: Vec<ScopeId>,
}

impl Default for ScopeTree {
    fn default() -> Self {
        ScopeTree {
            scopes: vec![Scope::new(ScopeKind::Global, None, false)],
            dirs: BTreeMap::new(),
            files: BTreeMap::new(),
            boundaries: BTreeSet::new(),
            free: vec![],
        }
    }
}

impl ScopeTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0]
    }

    pub fn get_mut(&mut self, id: ScopeId) -> &mut Scope {
        &mut self.scopes[id.0]
    }

    /// Mark a project-relative directory as an independent sub-project.
    pub fn add_boundary(&mut self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        if let Some(id) = self.dirs.get(&dir) {
            self.scopes[id.0].is_boundary = true;
        }
        self.boundaries.insert(dir);
    }

    pub fn is_boundary_dir(&self, dir: &Path) -> bool {
        self.boundaries.contains(dir)
    }

    /// Scope of a project-relative directory (`""` is the project root).
    pub fn directory_scope(&mut self, dir: &Path) -> ScopeId {
        if let Some(id) = self.dirs.get(dir) {
            return *id;
        }
        let parent = match dir.parent() {
            Some(parent) if dir != Path::new("") => self.directory_scope(parent),
            _ => ScopeId::GLOBAL,
        };
        let id = ScopeId(self.scopes.len());
        let is_boundary = self.boundaries.contains(dir);
        self.scopes.push(Scope::new(
            ScopeKind::Directory(dir.to_path_buf()),
            Some(parent),
            is_boundary,
        ));
        self.dirs.insert(dir.to_path_buf(), id);
        id
    }

    /// Scope of a project-relative file, created as a child of its directory's scope.
    pub fn file_scope(&mut self, file: &Path) -> ScopeId {
        if let Some(id) = self.files.get(file) {
            return *id;
        }
        let dir = file.parent().unwrap_or(Path::new("")).to_path_buf();
        let parent = self.directory_scope(&dir);
        let scope = Scope::new(ScopeKind::File(file.to_path_buf()), Some(parent), false);
        let id = match self.free.pop() {
            Some(id) => {
                self.scopes[id.0] = scope;
                id
            }
            None => {
                self.scopes.push(scope);
                ScopeId(self.scopes.len() - 1)
            }
        };
        self.files.insert(file.to_path_buf(), id);
        id
    }

    /// Existing scope for a path: its file scope, or the nearest existing directory.
    pub fn scope_for(&self, path: &Path) -> ScopeId {
        if let Some(id) = self.files.get(path) {
            return *id;
        }
        let mut current = Some(path);
        while let Some(dir) = current {
            if let Some(id) = self.dirs.get(dir) {
                return *id;
            }
            current = dir.parent();
        }
        self.dirs.get(Path::new("")).copied().unwrap_or(ScopeId::GLOBAL)
    }

    pub fn existing_file_scope(&self, file: &Path) -> Option<ScopeId> {
        self.files.get(file).copied()
    }

    pub fn existing_directory_scope(&self, dir: &Path) -> Option<ScopeId> {
        self.dirs.get(dir).copied()
    }

    /// Drop a file scope. Its arena slot goes to the next file scope created.
    pub fn remove_file(&mut self, file: &Path) {
        if let Some(id) = self.files.remove(file) {
            let scope = &mut self.scopes[id.0];
            scope.bindings.clear();
            scope.inherited_vars.clear();
            self.free.push(id);
        }
    }

    /// Number of arena slots, live or free.
    pub fn slot_count(&self) -> usize {
        self.scopes.len()
    }

    /// Project-relative path a scope stands for; the project root for the global scope.
    pub fn path_of(&self, id: ScopeId) -> &Path {
        match &self.get(id).kind {
            ScopeKind::Global => Path::new(""),
            ScopeKind::Directory(path) | ScopeKind::File(path) => path,
        }
    }

    /// Innermost boundary directory containing `path`; `None` for the top-level
    /// project.
    pub fn sub_project(&self, path: &Path) -> Option<&Path> {
        self.boundaries
            .iter()
            .filter(|dir| path.starts_with(dir))
            .max_by_key(|dir| dir.components().count())
            .map(PathBuf::as_path)
    }

    pub fn bind(&mut self, id: ScopeId, handle: &str, binding: Binding) -> Result<(), SymbolError> {
        let scope = &mut self.scopes[id.0];
        if let Some(existing) = scope.bindings.get(handle) {
            return Err(SymbolError::DuplicateHandle {
                handle: handle.to_string(),
                existing: existing.owner.clone(),
            });
        }
        scope.bindings.insert(handle.to_string(), binding);
        Ok(())
    }

    /// Remove every handle binding, keeping scope structure and variables.
    pub fn clear_bindings(&mut self) {
        for scope in self.scopes.iter_mut() {
            scope.bindings.clear();
        }
    }

    /// Scopes visible from `id`, nearest first. Stops after the first boundary.
    pub fn chain(&self, id: ScopeId) -> Vec<ScopeId> {
        let mut chain = vec![];
        let mut current = Some(id);
        while let Some(scope_id) = current {
            chain.push(scope_id);
            let scope = self.get(scope_id);
            if scope.is_boundary {
                break;
            }
            current = scope.parent;
        }
        chain
    }

    /// Nearest binding of `handle`, honouring shadowing.
    pub fn lookup(&self, id: ScopeId, handle: &str) -> Option<&Binding> {
        self.chain(id)
            .into_iter()
            .find_map(|scope_id| self.get(scope_id).get(handle))
    }

    /// Nearest binding of `handle` that satisfies `pred`.
    pub fn lookup_where(
        &self,
        id: ScopeId,
        handle: &str,
        pred: impl Fn(&Binding) -> bool,
    ) -> Option<&Binding> {
        self.chain(id)
            .into_iter()
            .filter_map(|scope_id| self.get(scope_id).get(handle))
            .find(|binding| pred(binding))
    }

    /// Variables visible from `id`; nearer scopes override.
    pub fn effective_vars(&self, id: ScopeId) -> BTreeMap<String, Value> {
        let mut vars = BTreeMap::new();
        for scope_id in self.chain(id).into_iter().rev() {
            vars.extend(
                self.get(scope_id)
                    .inherited_vars
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
        }
        vars
    }

    /// Every handle visible from `id`, nearest binding winning.
    pub fn visible(&self, id: ScopeId) -> BTreeMap<String, &Binding> {
        let mut visible = BTreeMap::new();
        for scope_id in self.chain(id) {
            for (handle, binding) in self.get(scope_id).bindings() {
                visible.entry(handle.clone()).or_insert(binding);
            }
        }
        visible
    }

    /// Whether configuration of `dir` reaches the file at `path`, i.e. `path` lies
    /// below `dir` without crossing a nested boundary.
    pub fn covers(&self, dir: &Path, path: &Path) -> bool {
        if !path.starts_with(dir) {
            return false;
        }
        let mut current = path.parent();
        while let Some(parent) = current {
            if parent == dir {
                return true;
            }
            if self.boundaries.contains(parent) {
                return false;
            }
            current = parent.parent();
        }
        dir == Path::new("")
    }
}
