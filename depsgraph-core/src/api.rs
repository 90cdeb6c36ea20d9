//! Public Façade
//!
//! [`GraphHandle`] is what an embedding application holds on to: one
//! evaluated view of a scene and view layer of a document. Everything else
//! in the crate is reachable through it, or through the free functions that
//! fan out to every graph of a document.
//!
//! # Example
//!
//! ```rust,ignore
//! use depsgraph_core::api::{id_tag_update, GraphHandle};
//! use depsgraph_core::scene::IdRecalc;
//!
//! let graph = GraphHandle::create(main.clone(), scene, "ViewLayer")?;
//! graph.evaluate_at_frame(1.0)?;
//!
//! // An edit in the editor.
//! id_tag_update(&main, cube, IdRecalc::TRANSFORM);
//! assert!(!graph.is_fully_evaluated());
//! graph.evaluate_refresh()?;
//! ```
//!
//! # Locking
//!
//! The graph lock is always taken before the document lock. Editor callbacks
//! run once both are released.

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use tracing::{debug, debug_span};

use crate::builder::rna::PropertyResolver;
use crate::builder::{build_graph, validate_view_layer, GraphSummary};
use crate::config::GraphConfig;
use crate::error::{Error, Result};
use crate::eval::tag::{tag_id, tag_time_source, UpdateSource};
use crate::eval::{evaluate, EvaluationReport, FlushSummary, OperationCallbacks};
use crate::graph::{Depsgraph, GraphStats};
use crate::registry::{EditorCallbacks, GraphRegistry, SharedGraph};
use crate::scene::{Datablock, IdRecalc, IdType, MainId, SessionUuid, SharedMain};

/// An evaluated view of one scene and view layer.
///
/// The graph unregisters itself when the handle is dropped.
pub struct GraphHandle {
    graph: SharedGraph,
    registry: Arc<GraphRegistry>,
}

impl GraphHandle {
    /// Build a graph and register it with the process-wide registry.
    pub fn create(main: SharedMain, scene: SessionUuid, view_layer: &str) -> Result<Self> {
        Self::create_in(GraphRegistry::global(), main, scene, view_layer)
    }

    /// Build a graph and register it with `registry`.
    pub fn create_in(
        registry: Arc<GraphRegistry>,
        main: SharedMain,
        scene: SessionUuid,
        view_layer: &str,
    ) -> Result<Self> {
        Self::create_with(registry, main, scene, view_layer, GraphConfig::from_env())
    }

    /// Build a graph with an explicit configuration.
    pub fn create_with(
        registry: Arc<GraphRegistry>,
        main: SharedMain,
        scene: SessionUuid,
        view_layer: &str,
        config: GraphConfig,
    ) -> Result<Self> {
        let _span = debug_span!("create_graph", view_layer).entered();
        let mut graph = Depsgraph::new(main, scene, view_layer);
        graph.config = config;
        build_graph(&mut graph, &GraphSummary::default())?;

        let main_id = graph.main_id();
        let graph = Arc::new(RwLock::new(graph));
        registry.register(main_id, &graph);
        Ok(Self { graph, registry })
    }

    /// Rebind the graph to another document, scene or view layer.
    ///
    /// Nothing is rebuilt here; relations are marked stale and the next
    /// evaluation rebuilds them.
    pub fn retarget(&self, main: SharedMain, scene: SessionUuid, view_layer: &str) -> Result<()> {
        validate_view_layer(&main.read(), scene, view_layer)?;
        let new_main = main.read().id();
        let old_main = {
            let mut graph = self.graph.write();
            let old_main = graph.main_id();
            graph.retarget(main, scene, view_layer.to_owned());
            graph.need_update_relations = true;
            old_main
        };
        if old_main != new_main {
            self.registry.unregister(old_main, &self.graph);
            self.registry.register(new_main, &self.graph);
        }
        debug!(?old_main, ?new_main, view_layer, "graph retargeted");
        Ok(())
    }

    /// Unregister and free the graph.
    pub fn destroy(self) {
        drop(self);
    }

    // ------------------------------------------------------------------------
    // Tagging
    // ------------------------------------------------------------------------

    /// Tag a datablock of this graph as changed by the user.
    ///
    /// An empty `recalc` tags every component except animation. Returns
    /// false when the datablock is not part of the graph.
    pub fn tag_update(&self, uuid: SessionUuid, recalc: IdRecalc) -> bool {
        tag_id(&mut self.graph.write(), uuid, recalc, UpdateSource::UserEdit)
    }

    /// Mark relations as stale.
    pub fn tag_relations_update(&self) {
        self.graph.write().need_update_relations = true;
    }

    /// Rebuild the graph when its relations are stale.
    ///
    /// Returns whether a rebuild happened.
    pub fn rebuild_relations_if_stale(&self) -> Result<bool> {
        let mut graph = self.graph.write();
        rebuild_if_stale(&mut graph)
    }

    // ------------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------------

    /// Move to `frame` and evaluate everything time dependent along with
    /// pending edits.
    pub fn evaluate_at_frame(&self, frame: f32) -> Result<EvaluationReport> {
        let report = {
            let mut graph = self.graph.write();
            rebuild_if_stale(&mut graph)?;
            graph.frame = frame;
            let tagged = tag_time_source(&mut graph);
            debug!(frame, tagged, "frame change");
            run_evaluation(&mut graph)
        };
        self.notify_editors(&report.flush);
        Ok(report)
    }

    /// Evaluate pending edits at the current frame.
    pub fn evaluate_refresh(&self) -> Result<EvaluationReport> {
        let report = {
            let mut graph = self.graph.write();
            rebuild_if_stale(&mut graph)?;
            run_evaluation(&mut graph)
        };
        self.notify_editors(&report.flush);
        Ok(report)
    }

    fn notify_editors(&self, flush: &FlushSummary) {
        let (main_id, is_active) = {
            let graph = self.graph.read();
            (graph.main_id(), graph.is_active)
        };
        let callbacks = self.registry.editor_callbacks();
        if let Some(id_update) = &callbacks.id_update {
            for &uuid in &flush.notify_ids {
                id_update(main_id, uuid);
            }
        }
        if !is_active || flush.visited.is_empty() {
            return;
        }
        if let Some(scene_update) = &callbacks.scene_update {
            scene_update(main_id, flush.updated);
        }
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn is_active(&self) -> bool {
        self.graph.read().is_active
    }

    /// Active graphs notify the editor about the changes they flush.
    pub fn set_active(&self, active: bool) {
        self.graph.write().is_active = active;
    }

    /// Relations are fresh and nothing is waiting to be flushed.
    pub fn is_fully_evaluated(&self) -> bool {
        let graph = self.graph.read();
        !graph.need_update_relations && !graph.has_entry_tags()
    }

    /// Evaluated copy of a datablock, or the original when it has none.
    pub fn get_evaluated(&self, uuid: SessionUuid) -> Option<Datablock> {
        let graph = self.graph.read();
        if let Some(snapshot) = graph.evaluated_snapshot(uuid) {
            return Some(snapshot.clone());
        }
        let main = graph.main().read();
        main.get(uuid).cloned()
    }

    /// Original of a datablock of this graph's document.
    pub fn get_original(&self, datablock: &Datablock) -> Option<Datablock> {
        let main = self.graph.read().main().clone();
        get_original(&main, datablock)
    }

    pub fn id_type_was_updated(&self, id_type: IdType) -> bool {
        self.graph.read().id_type_was_updated(id_type)
    }

    pub fn frame(&self) -> f32 {
        self.graph.read().frame()
    }

    pub fn main_id(&self) -> MainId {
        self.graph.read().main_id()
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    pub fn config(&self) -> GraphConfig {
        self.graph.read().config().clone()
    }

    pub fn set_config(&self, config: GraphConfig) {
        self.graph.write().config = config;
    }

    /// Replace the operation callbacks. They are bound to operations when
    /// the graph is built, so relations are marked stale.
    pub fn set_callbacks(&self, callbacks: OperationCallbacks) {
        let mut graph = self.graph.write();
        graph.callbacks = callbacks;
        graph.need_update_relations = true;
    }

    /// Replace the property path resolver. Relations are marked stale.
    pub fn set_resolver(&self, resolver: Arc<dyn PropertyResolver>) {
        let mut graph = self.graph.write();
        graph.resolver = resolver;
        graph.need_update_relations = true;
    }

    // ------------------------------------------------------------------------
    // Debugging
    // ------------------------------------------------------------------------

    pub fn stats(&self) -> GraphStats {
        self.graph.read().stats()
    }

    /// JSON dump of every node and relation.
    pub fn to_json(&self) -> serde_json::Result<String> {
        crate::debug::to_json(&self.graph.read())
    }

    /// Graphviz description of the operation graph.
    pub fn to_graphviz(&self) -> String {
        crate::debug::to_graphviz(&self.graph.read())
    }

    /// Read access to the underlying graph.
    pub fn read(&self) -> RwLockReadGuard<'_, Depsgraph> {
        self.graph.read()
    }

    pub fn shared(&self) -> &SharedGraph {
        &self.graph
    }
}

impl Drop for GraphHandle {
    fn drop(&mut self) {
        let main_id = self.graph.read().main_id();
        self.registry.unregister(main_id, &self.graph);
    }
}

impl std::fmt::Debug for GraphHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("GraphHandle").field(&*self.graph.read()).finish()
    }
}

fn rebuild_if_stale(graph: &mut Depsgraph) -> Result<bool> {
    if !graph.need_update_relations {
        return Ok(false);
    }
    // Capturing clears the graph, so a scene that cannot be built must not
    // cost the current snapshots.
    validate_view_layer(&graph.main().read(), graph.scene(), graph.view_layer())?;
    let summary = GraphSummary::capture(graph);
    build_graph(graph, &summary)?;
    Ok(true)
}

fn run_evaluation(graph: &mut Depsgraph) -> EvaluationReport {
    let main_handle = graph.main().clone();
    let mut main = main_handle.write();
    evaluate(graph, &mut main)
}

// ----------------------------------------------------------------------------
// Document-wide operations
// ----------------------------------------------------------------------------

/// Tag a datablock in every graph of its document.
///
/// Also records the recalc flags on the original. Returns how many graphs
/// contain the datablock.
pub fn id_tag_update(main: &SharedMain, uuid: SessionUuid, recalc: IdRecalc) -> usize {
    id_tag_update_in(&GraphRegistry::global(), main, uuid, recalc)
}

pub fn id_tag_update_in(
    registry: &GraphRegistry,
    main: &SharedMain,
    uuid: SessionUuid,
    recalc: IdRecalc,
) -> usize {
    let main_id = {
        let mut main = main.write();
        if let Some(datablock) = main.get_mut(uuid) {
            datablock.runtime.recalc |= if recalc.is_empty() { IdRecalc::ALL } else { recalc };
        }
        main.id()
    };
    registry
        .graphs(main_id)
        .iter()
        .filter(|graph| tag_id(&mut graph.write(), uuid, recalc, UpdateSource::UserEdit))
        .count()
}

/// Mark the relations of every graph of a document as stale.
pub fn relations_tag_update(main: MainId) {
    relations_tag_update_in(&GraphRegistry::global(), main);
}

pub fn relations_tag_update_in(registry: &GraphRegistry, main: MainId) {
    for graph in registry.graphs(main) {
        graph.write().need_update_relations = true;
    }
}

/// Install the process-wide editor notification slots.
pub fn set_editor_callbacks(callbacks: EditorCallbacks) {
    GraphRegistry::global().set_editor_callbacks(callbacks);
}

/// Original of an evaluated datablock.
///
/// Originals are returned as they are.
pub fn get_original(main: &SharedMain, datablock: &Datablock) -> Option<Datablock> {
    let uuid = datablock.runtime.orig_id.unwrap_or(datablock.session_uuid);
    main.read().get(uuid).cloned()
}

/// Fail when `uuid` does not name a datablock of the graph.
pub fn ensure_in_graph(graph: &GraphHandle, uuid: SessionUuid) -> Result<()> {
    if graph.read().find_id_node(uuid).is_some() {
        Ok(())
    } else {
        Err(Error::DatablockNotFound(uuid))
    }
}
