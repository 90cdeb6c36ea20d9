//! Graph Registry
//!
//! Associates every live graph with the document it was built for, so that
//! tagging a datablock of a document reaches every graph that cares.
//!
//! # Thread Safety
//!
//! Graphs of different documents are created and destroyed concurrently by
//! different callers, so the association lives in a concurrent map. The
//! registry only holds weak references: dropping the last handle of a graph
//! is enough for it to disappear from iteration.
//!
//! A process-wide instance is available through [`GraphRegistry::global`],
//! and tests can inject their own with [`GraphRegistry::new`].
//!
//! # Editor Callbacks
//!
//! The registry also holds the two editor notification slots. They are
//! installed once by the embedding application and invoked after a flush,
//! never while a graph or document lock is held.

use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::trace;

use crate::graph::Depsgraph;
use crate::scene::{MainId, SessionUuid};

/// A graph shared between its handle and the registry.
pub type SharedGraph = Arc<RwLock<Depsgraph>>;

/// Called for every datablock the user modified, once per flush.
pub type IdUpdateCallback = Arc<dyn Fn(MainId, SessionUuid) + Send + Sync>;

/// Called once per flush of an active graph; the flag tells whether anything
/// was modified.
pub type SceneUpdateCallback = Arc<dyn Fn(MainId, bool) + Send + Sync>;

/// Editor notification slots.
#[derive(Clone, Default)]
pub struct EditorCallbacks {
    pub id_update: Option<IdUpdateCallback>,
    pub scene_update: Option<SceneUpdateCallback>,
}

impl EditorCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_id_update<F>(mut self, callback: F) -> Self
    where
        F: Fn(MainId, SessionUuid) + Send + Sync + 'static,
    {
        self.id_update = Some(Arc::new(callback));
        self
    }

    pub fn on_scene_update<F>(mut self, callback: F) -> Self
    where
        F: Fn(MainId, bool) + Send + Sync + 'static,
    {
        self.scene_update = Some(Arc::new(callback));
        self
    }
}

impl std::fmt::Debug for EditorCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditorCallbacks")
            .field("id_update", &self.id_update.is_some())
            .field("scene_update", &self.scene_update.is_some())
            .finish()
    }
}

/// Document → live graphs association.
#[derive(Debug, Default)]
pub struct GraphRegistry {
    graphs: DashMap<MainId, Vec<Weak<RwLock<Depsgraph>>>>,
    editor: RwLock<EditorCallbacks>,
}

static GLOBAL: OnceLock<Arc<GraphRegistry>> = OnceLock::new();

impl GraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> Arc<GraphRegistry> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(GraphRegistry::new())))
    }

    pub fn register(&self, main: MainId, graph: &SharedGraph) {
        trace!(?main, "register graph");
        self.graphs
            .entry(main)
            .or_default()
            .push(Arc::downgrade(graph));
    }

    pub fn unregister(&self, main: MainId, graph: &SharedGraph) {
        trace!(?main, "unregister graph");
        let target = Arc::downgrade(graph);
        let now_empty = match self.graphs.get_mut(&main) {
            Some(mut graphs) => {
                graphs.retain(|weak| !weak.ptr_eq(&target) && weak.strong_count() > 0);
                graphs.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.graphs.remove_if(&main, |_, graphs| graphs.is_empty());
        }
    }

    /// Live graphs of a document.
    pub fn graphs(&self, main: MainId) -> Vec<SharedGraph> {
        match self.graphs.get_mut(&main) {
            Some(mut graphs) => {
                graphs.retain(|weak| weak.strong_count() > 0);
                graphs.iter().filter_map(Weak::upgrade).collect()
            }
            None => Vec::new(),
        }
    }

    /// Install the editor notification slots, replacing previous ones.
    pub fn set_editor_callbacks(&self, callbacks: EditorCallbacks) {
        *self.editor.write() = callbacks;
    }

    pub fn editor_callbacks(&self) -> EditorCallbacks {
        self.editor.read().clone()
    }

    /// Number of live graphs of a document.
    pub fn count(&self, main: MainId) -> usize {
        self.graphs
            .get(&main)
            .map(|graphs| graphs.iter().filter(|weak| weak.strong_count() > 0).count())
            .unwrap_or(0)
    }
}
