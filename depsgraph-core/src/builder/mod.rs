//! Graph Building
//!
//! A graph is built from a scene and view layer in two passes:
//!
//! 1. The [node builder](nodes) walks the scene hierarchy and creates ID,
//!    component and operation nodes.
//! 2. The [relation builder](relations) walks the same hierarchy again and
//!    adds the relations between operations.
//!
//! # Rebuilds
//!
//! Rebuilding discards every node. What survives is captured beforehand in a
//! [`GraphSummary`]: the evaluated snapshots, the mask of components that
//! were visible, and the entry tags not flushed yet. All of it is keyed by
//! session identifier and semantic key, never by node handle. A rebuild is
//! therefore `(summary, scene) -> graph`:
//!
//! ```text
//! let summary = GraphSummary::capture(&mut graph);
//! build_graph(&mut graph, &summary)?;
//! ```
//!
//! After both passes the build is finalized: cycles are broken, unused
//! no-ops dropped, visibility flushed, and everything new or newly visible
//! tagged for evaluation.

mod keys;
pub mod nodes;
pub mod relations;
pub mod rna;

use std::collections::HashMap;

use bitflags::bitflags;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, debug_span};

use crate::error::{Error, Result};
use crate::eval::cow;
use crate::eval::tag::{tag_component, tag_operation, UpdateSource};
use crate::eval::visibility::{flush_visibility, visible_components_mask};
use crate::graph::{detect_cycles, remove_unused_noops, Depsgraph};
use crate::node::{NodeHandle, NodeType, OperationIdKey};
use crate::scene::{Datablock, Main, SessionUuid};

pub use keys::{ComponentKey, OperationKey, RelationKey, TimeSourceKey};
pub use nodes::DepsgraphNodeBuilder;
pub use relations::DepsgraphRelationBuilder;

bitflags! {
    /// Parts of a datablock already built in the current pass.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BuilderTags: u8 {
        const PARAMETERS = 1 << 0;
        const ANIMATION  = 1 << 1;
        const COMPLETE   = 1 << 2;
    }
}

/// Visited set of one builder pass.
///
/// Shared datablocks are reached several times while walking the scene;
/// only the first visit builds them.
#[derive(Debug, Default)]
pub struct BuilderMap {
    visited: HashMap<SessionUuid, BuilderTags>,
}

impl BuilderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_is_built(&self, uuid: SessionUuid, tag: BuilderTags) -> bool {
        self.visited
            .get(&uuid)
            .is_some_and(|tags| tags.contains(tag))
    }

    pub fn tag(&mut self, uuid: SessionUuid, tag: BuilderTags) {
        *self.visited.entry(uuid).or_default() |= tag;
    }

    /// Whether `tag` was already built, tagging it when it was not.
    pub fn check_is_built_and_tag(&mut self, uuid: SessionUuid, tag: BuilderTags) -> bool {
        let tags = self.visited.entry(uuid).or_default();
        let built = tags.contains(tag);
        *tags |= tag;
        built
    }

    pub fn len(&self) -> usize {
        self.visited.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visited.is_empty()
    }
}

/// What a datablock carries over from the previous build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SavedIdState {
    pub id_cow: Option<Datablock>,
    pub previously_visible_components_mask: u64,
}

/// Identity of an operation that was tagged before the rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedEntryTag {
    pub uuid: SessionUuid,
    pub node_type: NodeType,
    pub component_name: String,
    pub operation: OperationIdKey,
}

/// State of a graph that survives a rebuild.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSummary {
    pub ids: IndexMap<SessionUuid, SavedIdState>,
    pub entry_tags: Vec<SavedEntryTag>,
}

impl GraphSummary {
    /// Move the salvageable state out of a graph and clear it for rebuild.
    pub fn capture(graph: &mut Depsgraph) -> Self {
        let mut summary = GraphSummary::default();

        let ids: Vec<NodeHandle> = graph.id_nodes().collect();
        for id in ids {
            let mask = visible_components_mask(graph, id);
            let node = graph.id_node_mut(id);
            summary.ids.insert(
                node.id_orig,
                SavedIdState {
                    id_cow: node.id_cow.take(),
                    previously_visible_components_mask: mask,
                },
            );
        }

        for operation in graph.entry_tags() {
            let op = graph.operation(operation);
            let id = graph.id_node(graph.component(op.owner).owner);
            let Some((key, _)) = id.components.iter().find(|(_, &handle)| handle == op.owner) else {
                continue;
            };
            summary.entry_tags.push(SavedEntryTag {
                uuid: id.id_orig,
                node_type: key.node_type,
                component_name: key.name.clone(),
                operation: op.key(),
            });
        }

        graph.clear_all_nodes();
        summary
    }

    pub fn saved(&self, uuid: SessionUuid) -> Option<&SavedIdState> {
        self.ids.get(&uuid)
    }
}

/// Build the graph of its scene and view layer from scratch.
///
/// `summary` carries what survives from the previous build.
pub fn build_graph(graph: &mut Depsgraph, summary: &GraphSummary) -> Result<()> {
    let _span = debug_span!("build_graph", view_layer = graph.view_layer()).entered();
    let main_handle = graph.main().clone();
    let main = main_handle.read();
    let scene = graph.scene();
    let view_layer = graph.view_layer().to_owned();
    validate_view_layer(&main, scene, &view_layer)?;

    graph.clear_all_nodes();
    {
        let mut builder = DepsgraphNodeBuilder::new(graph, &main, summary);
        builder.build_view_layer(scene, &view_layer);
    }
    {
        let mut builder = DepsgraphRelationBuilder::new(graph, &main);
        builder.build_view_layer(scene, &view_layer);
    }
    end_build(graph, summary);
    Ok(())
}

/// Check that the scene exists and has the view layer.
pub(crate) fn validate_view_layer(main: &Main, scene: SessionUuid, view_layer: &str) -> Result<()> {
    let datablock = main.get(scene).ok_or(Error::SceneNotFound(scene))?;
    let scene_data = datablock.as_scene().ok_or(Error::NotAScene(scene))?;
    if scene_data.view_layer(view_layer).is_none() {
        return Err(Error::ViewLayerNotFound {
            scene,
            name: view_layer.to_owned(),
        });
    }
    Ok(())
}

/// Tag what is new or newly visible since the previous build.
fn tag_visible_updates(graph: &mut Depsgraph, summary: &GraphSummary) {
    let ids: Vec<NodeHandle> = graph.id_nodes().collect();
    for id in ids {
        let node = graph.id_node(id);
        let is_new = match node.id_cow {
            Some(_) => !node.is_cow_expanded(),
            None => summary.saved(node.id_orig).is_none(),
        };
        let newly_visible = node.visible_components_mask & !node.previously_visible_components_mask;
        let components: Vec<NodeHandle> = node
            .components
            .iter()
            .filter(|(key, _)| is_new || newly_visible & key.node_type.component_bit() != 0)
            .map(|(_, &handle)| handle)
            .collect();
        if is_new {
            debug!(id = %graph.node(id).name, "tag new datablock");
        }
        let source = if is_new {
            UpdateSource::Relations
        } else {
            UpdateSource::Visibility
        };
        for component in components {
            tag_component(graph, component, source);
        }
    }
}

fn restore_entry_tags(graph: &mut Depsgraph, summary: &GraphSummary) {
    for saved in &summary.entry_tags {
        let found = graph.find_operation(
            saved.uuid,
            saved.node_type,
            &saved.component_name,
            &saved.operation,
        );
        match found {
            Some(operation) => tag_operation(graph, operation, UpdateSource::UserEdit),
            None => debug!(operation = %saved.operation.identifier(), "saved entry tag is gone"),
        }
    }
}

/// Finalize a build once both passes ran.
fn end_build(graph: &mut Depsgraph, summary: &GraphSummary) {
    let cycles = detect_cycles(graph);
    let removed = if graph.config().remove_unused_noops {
        remove_unused_noops(graph)
    } else {
        0
    };

    flush_visibility(graph);
    let ids: Vec<NodeHandle> = graph.id_nodes().collect();
    for &id in &ids {
        let mask = visible_components_mask(graph, id);
        graph.id_node_mut(id).visible_components_mask = mask;
    }

    tag_visible_updates(graph, summary);
    let invalid = cow::tag_invalid_pointers(graph);
    restore_entry_tags(graph, summary);
    graph.need_update_relations = false;

    let stats = graph.stats();
    debug!(
        ids = stats.ids,
        operations = stats.operations,
        relations = stats.relations,
        cycles,
        removed,
        invalid,
        "graph built"
    );
}
