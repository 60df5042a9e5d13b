//! Registry mapping script identities to workspaces.
//!
//! Edits are published by building a new [`Solution`] and swapping the
//! shared pointer, so readers holding a snapshot are never blocked and
//! never observe partial state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use rustc_hash::FxHashMap;

use super::unit::{CompilationUnit, OpenArgs, ScriptId};
use crate::error::{Error, Result};

fn lock_error<T>(e: PoisonError<T>) -> Error {
    Error::InvalidOperation(format!("workspace lock poisoned (thread panicked): {e}"))
}

/// One open document inside a workspace.
#[derive(Debug, Clone)]
pub struct Document {
    /// Current compilation snapshot.
    pub unit: Arc<CompilationUnit>,
    /// Parent submission whose declarations this document sees, if any.
    pub parent: Option<ScriptId>,
}

/// Immutable view of a workspace's documents.
#[derive(Debug, Default)]
pub struct Solution {
    documents: FxHashMap<ScriptId, Document>,
}

impl Solution {
    pub fn get(&self, id: ScriptId) -> Option<&Document> {
        self.documents.get(&id)
    }

    pub fn contains(&self, id: ScriptId) -> bool {
        self.documents.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Documents that name `id` as their parent.
    pub fn dependents_of(&self, id: ScriptId) -> Vec<ScriptId> {
        let mut ids: Vec<ScriptId> = self
            .documents
            .iter()
            .filter(|(_, doc)| doc.parent == Some(id))
            .map(|(child, _)| *child)
            .collect();
        ids.sort();
        ids
    }
}

/// Solution container shared by one or more related scripts.
///
/// Alive exactly while at least one document inside it is open; dropped
/// when the registry releases the last referencing identity.
pub struct Workspace {
    solution: RwLock<Arc<Solution>>,
}

impl Workspace {
    fn new() -> Self {
        Self {
            solution: RwLock::new(Arc::new(Solution::default())),
        }
    }

    /// Current solution snapshot.
    ///
    /// Readers hold the lock only long enough to clone the pointer.
    pub fn solution(&self) -> Result<Arc<Solution>> {
        Ok(self.solution.read().map_err(lock_error)?.clone())
    }

    /// Build a new solution from the current one and publish it.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut FxHashMap<ScriptId, Document>) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.solution.write().map_err(lock_error)?;
        let mut documents = guard.documents.clone();
        let value = f(&mut documents)?;
        *guard = Arc::new(Solution { documents });
        Ok(value)
    }
}

/// Maps each open script identity to its workspace.
///
/// Workspace lifetime is reference-counted at the workspace level: related
/// identities hold clones of one `Arc<Workspace>`, and the workspace is
/// torn down when the last of them closes.
pub struct WorkspaceRegistry {
    scripts: RwLock<FxHashMap<ScriptId, Arc<Workspace>>>,
    next_id: AtomicU64,
}

impl WorkspaceRegistry {
    pub fn new() -> Self {
        Self {
            scripts: RwLock::new(FxHashMap::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn allocate_id(&self) -> ScriptId {
        ScriptId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Open a new script in a fresh workspace.
    pub fn open(&self, args: OpenArgs) -> Result<ScriptId> {
        args.validate()?;
        let id = self.allocate_id();
        let workspace = Arc::new(Workspace::new());
        let unit = Arc::new(CompilationUnit::from_args(id, args));
        workspace.mutate(|docs| {
            docs.insert(id, Document { unit, parent: None });
            Ok(())
        })?;
        self.scripts.write().map_err(lock_error)?.insert(id, workspace);
        Ok(id)
    }

    /// Open a script related to `parent`, sharing the parent's workspace.
    ///
    /// With `link_parent` the new document records a reference edge to the
    /// parent so the parent's declarations are visible at compile time.
    pub fn open_related(
        &self,
        parent: ScriptId,
        args: OpenArgs,
        link_parent: bool,
    ) -> Result<ScriptId> {
        args.validate()?;
        let workspace = self
            .scripts
            .read()
            .map_err(lock_error)?
            .get(&parent)
            .cloned()
            .ok_or(Error::UnknownParent(parent))?;
        let id = self.allocate_id();
        let unit = Arc::new(CompilationUnit::from_args(id, args));
        workspace.mutate(|docs| {
            docs.insert(
                id,
                Document {
                    unit,
                    parent: link_parent.then_some(parent),
                },
            );
            Ok(())
        })?;
        self.scripts.write().map_err(lock_error)?.insert(id, workspace);
        Ok(id)
    }

    /// Replace the script's source text with a fresh snapshot.
    pub fn update(&self, id: ScriptId, new_source: &str) -> Result<()> {
        let workspace = self.workspace(id)?;
        workspace.mutate(|docs| {
            let doc = docs.get_mut(&id).ok_or(Error::UnknownScript(id))?;
            doc.unit = Arc::new(doc.unit.with_source(new_source));
            Ok(())
        })
    }

    /// Add a diagnostic suppression to the script's snapshot.
    pub fn add_suppression(&self, id: ScriptId, name: &str) -> Result<()> {
        let workspace = self.workspace(id)?;
        workspace.mutate(|docs| {
            let doc = docs.get_mut(&id).ok_or(Error::UnknownScript(id))?;
            doc.unit = Arc::new(doc.unit.with_suppression(name));
            Ok(())
        })
    }

    /// Close a script identity.
    ///
    /// Refused with [`Error::DocumentReferenced`] while related scripts
    /// still reference the document. If this was the workspace's last
    /// document, the workspace itself is dropped; otherwise only the
    /// document graph is pruned.
    pub fn close(&self, id: ScriptId) -> Result<()> {
        let mut scripts = self.scripts.write().map_err(lock_error)?;
        let workspace = scripts
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownScript(id))?;
        if !workspace.solution()?.dependents_of(id).is_empty() {
            return Err(Error::DocumentReferenced(id));
        }
        workspace.mutate(|docs| {
            docs.remove(&id);
            Ok(())
        })?;
        scripts.remove(&id);
        Ok(())
    }

    /// Current snapshot for a live identity.
    pub fn get(&self, id: ScriptId) -> Result<Arc<CompilationUnit>> {
        let workspace = self.workspace(id)?;
        let solution = workspace.solution()?;
        solution
            .get(id)
            .map(|doc| doc.unit.clone())
            .ok_or(Error::UnknownScript(id))
    }

    /// The workspace owning `id`.
    pub fn workspace(&self, id: ScriptId) -> Result<Arc<Workspace>> {
        self.scripts
            .read()
            .map_err(lock_error)?
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownScript(id))
    }

    /// Parent-chain snapshots for `id`, oldest ancestor first.
    pub fn ancestors(&self, id: ScriptId) -> Result<Vec<Arc<CompilationUnit>>> {
        let workspace = self.workspace(id)?;
        let solution = workspace.solution()?;
        let mut chain = Vec::new();
        let mut current = solution.get(id).ok_or(Error::UnknownScript(id))?.parent;
        while let Some(parent_id) = current {
            let Some(doc) = solution.get(parent_id) else {
                break;
            };
            chain.push(doc.unit.clone());
            current = doc.parent;
        }
        chain.reverse();
        Ok(chain)
    }

    /// Identities that reference `id` as their parent.
    pub fn dependents(&self, id: ScriptId) -> Result<Vec<ScriptId>> {
        let workspace = self.workspace(id)?;
        Ok(workspace.solution()?.dependents_of(id))
    }

    pub fn contains(&self, id: ScriptId) -> bool {
        self.scripts
            .read()
            .map(|scripts| scripts.contains_key(&id))
            .unwrap_or(false)
    }

    /// Number of open script identities.
    pub fn open_count(&self) -> usize {
        self.scripts.read().map(|scripts| scripts.len()).unwrap_or(0)
    }
}

impl Default for WorkspaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
