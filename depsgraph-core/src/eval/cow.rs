//! Copy-on-Write Snapshots
//!
//! Evaluation never writes into the document. Every datablock whose type
//! needs it gets an evaluated snapshot owned by its ID node, and evaluation
//! callbacks work on that snapshot instead.
//!
//! # Snapshot States
//!
//! ```text
//! NOT_NEEDED                   (type is evaluated in place)
//! PLACEHOLDER --expand-->  EXPANDED
//!      ^                      |
//!      +-------- free --------+
//! ```
//!
//! A placeholder is an unnamed shell. Expansion copies the original over it,
//! marks it as a snapshot of that original and remaps its references to the
//! snapshots of the referenced datablocks. Freeing drops the content and the
//! expanded flag but keeps the allocation and the snapshot marker for the
//! next expansion.
//!
//! Meshes share their vertex buffer with the original until the evaluation
//! replaces it, so expanding a mesh never duplicates geometry.

use tracing::{debug, trace};

use super::tag::{tag_component, UpdateSource};
use crate::graph::Depsgraph;
use crate::node::{NodeHandle, NodeType};
use crate::scene::{Datablock, IdData, IdPtr, IdType, Main};

/// Whether datablocks of this type are evaluated on a separate snapshot.
pub fn copy_on_write_is_needed(id_type: IdType) -> bool {
    !matches!(id_type, IdType::Image)
}

/// Whether the graph holds a snapshot for the referenced datablock.
fn has_snapshot(graph: &Depsgraph, ptr: &IdPtr) -> bool {
    graph
        .find_id_node(ptr.uuid())
        .is_some_and(|id| graph.id_node(id).id_cow.is_some())
}

fn remap_references(graph: &Depsgraph, copy: &mut Datablock) {
    copy.foreach_id_mut(|ptr| {
        if let IdPtr::Original(uuid) = *ptr {
            if has_snapshot(graph, ptr) {
                *ptr = IdPtr::Evaluated(uuid);
            }
        }
    });
}

/// Type specific fixups once references are remapped.
fn post_expand_fixups(graph: &Depsgraph, original: &Datablock, copy: &mut Datablock) {
    match &mut copy.data {
        IdData::Object(object) => {
            object.runtime.data_orig = original
                .as_object()
                .and_then(|orig| orig.data)
                .map(|data| data.uuid());
        }
        IdData::Scene(scene) => {
            let view_layer = graph.view_layer();
            scene.view_layers.retain(|layer| layer.name == view_layer);
            for layer in &mut scene.view_layers {
                layer
                    .bases
                    .retain(|base| graph.find_id_node(base.object.uuid()).is_some());
            }
        }
        _ => {}
    }
}

/// Expand the snapshot of an ID node from its original.
///
/// Does nothing for types evaluated in place, for snapshots already expanded
/// and for datablocks no longer in the document.
pub fn expand(graph: &mut Depsgraph, main: &Main, id: NodeHandle) {
    let node = graph.id_node(id);
    if node.id_cow.is_none() {
        return;
    }
    if node.is_cow_expanded() {
        trace!(id = %graph.node(id).name, "snapshot already expanded");
        return;
    }
    let uuid = node.id_orig;
    let Some(original) = main.get(uuid) else {
        debug!(?uuid, "original of snapshot is gone");
        return;
    };

    let mut copy = original.clone();
    copy.runtime.is_cow = true;
    copy.runtime.expanded = true;
    copy.runtime.orig_id = Some(uuid);
    copy.runtime.recalc = node.id_cow.as_ref().map(|cow| cow.runtime.recalc).unwrap_or_default();
    remap_references(graph, &mut copy);
    post_expand_fixups(graph, original, &mut copy);

    if graph.config().debug.contains(crate::config::DebugFlags::COW) {
        debug!(id = %graph.node(id).name, "expand snapshot");
    }
    graph.id_node_mut(id).id_cow = Some(copy);
}

/// Drop the content of an expanded snapshot, keeping it reusable.
pub fn free(snapshot: &mut Datablock) {
    if !snapshot.runtime.expanded {
        return;
    }
    let mut placeholder = Datablock::placeholder(snapshot.id_type(), snapshot.session_uuid);
    placeholder.runtime = snapshot.runtime.clone();
    placeholder.runtime.expanded = false;
    *snapshot = placeholder;
}

/// Runtime fields surviving re-expansion.
#[derive(Debug, Default)]
struct RuntimeBackup {
    batch_cache: Option<u64>,
}

impl RuntimeBackup {
    fn take(snapshot: &Datablock) -> Self {
        let batch_cache = match &snapshot.data {
            IdData::Object(object) => object.runtime.batch_cache,
            IdData::Mesh(mesh) => mesh.runtime.batch_cache,
            _ => None,
        };
        Self { batch_cache }
    }

    fn restore(self, snapshot: &mut Datablock) {
        match &mut snapshot.data {
            IdData::Object(object) => object.runtime.batch_cache = self.batch_cache,
            IdData::Mesh(mesh) => mesh.runtime.batch_cache = self.batch_cache,
            _ => {}
        }
    }
}

/// Re-expand a snapshot from its original, preserving runtime caches.
pub fn update(graph: &mut Depsgraph, main: &Main, id: NodeHandle) {
    let backup = match graph.id_node_mut(id).id_cow.as_mut() {
        None => return,
        Some(snapshot) => {
            let backup = RuntimeBackup::take(snapshot);
            free(snapshot);
            backup
        }
    };
    expand(graph, main, id);
    if let Some(snapshot) = graph.id_node_mut(id).id_cow.as_mut() {
        if snapshot.runtime.expanded {
            backup.restore(snapshot);
        }
    }
}

/// Whether an expanded snapshot references something inconsistent with the
/// current graph.
fn has_invalid_references(graph: &Depsgraph, snapshot: &Datablock) -> bool {
    let mut invalid = false;
    snapshot.foreach_id(|ptr| match ptr {
        IdPtr::Original(_) => invalid |= has_snapshot(graph, ptr),
        IdPtr::Evaluated(uuid) => invalid |= graph.find_id_node(*uuid).is_none(),
    });
    invalid
}

/// Tag snapshots whose references went stale during a rebuild.
///
/// Only datablocks visible in the previous build are checked, and only when
/// their copy-on-write operation is not tagged already. Returns the number of
/// datablocks tagged.
pub fn tag_invalid_pointers(graph: &mut Depsgraph) -> usize {
    let ids: Vec<NodeHandle> = graph.id_nodes().collect();
    let mut tagged = 0;
    for id in ids {
        let node = graph.id_node(id);
        if node.previously_visible_components_mask == 0 || !node.is_cow_expanded() {
            continue;
        }
        let Some(cow) = node.find_component(NodeType::CopyOnWrite, "") else {
            continue;
        };
        let already_tagged = graph
            .component(cow)
            .operations
            .values()
            .any(|&op| graph.operation(op).needs_update());
        if already_tagged {
            continue;
        }
        let invalid = node
            .id_cow
            .as_ref()
            .is_some_and(|snapshot| has_invalid_references(graph, snapshot));
        if invalid {
            debug!(id = %graph.node(id).name, "snapshot references are stale");
            tag_component(graph, cow, UpdateSource::Relations);
            tagged += 1;
        }
    }
    tagged
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::graph::tests_support::empty_graph;
    use crate::node::{OperationCode, OperationIdKey};
    use crate::scene::{Image, Mesh, Object, SessionUuid};

    fn add_snapshot_node(graph: &mut Depsgraph, datablock: &Datablock) -> NodeHandle {
        let id_type = datablock.id_type();
        let cow = copy_on_write_is_needed(id_type)
            .then(|| Datablock::placeholder(id_type, datablock.session_uuid));
        let id = graph.add_id_node(&datablock.prefixed_name(), datablock.session_uuid, id_type, cow);
        if copy_on_write_is_needed(id_type) {
            let component = graph.ensure_component(id, NodeType::CopyOnWrite, "");
            graph.add_operation(component, OperationIdKey::from_opcode(OperationCode::CopyOnWrite), None);
        }
        id
    }

    /// Document with an object using a mesh, both in the graph.
    fn object_and_mesh() -> (Depsgraph, NodeHandle, NodeHandle, SessionUuid) {
        let mut graph = empty_graph();
        let mesh = Datablock::mesh("Cube", Mesh::from_vertices(vec![[0.0; 3]; 8]));
        let mesh_uuid = mesh.session_uuid;
        let object = Datablock::object(
            "Cube",
            Object {
                data: Some(IdPtr::Original(mesh_uuid)),
                ..Object::default()
            },
        );
        let object_id = add_snapshot_node(&mut graph, &object);
        let mesh_id = add_snapshot_node(&mut graph, &mesh);
        {
            let mut main = graph.main().write();
            main.add(mesh);
            main.add(object);
        }
        (graph, object_id, mesh_id, mesh_uuid)
    }

    #[test]
    fn images_are_evaluated_in_place() {
        assert!(!copy_on_write_is_needed(IdType::Image));
        assert!(copy_on_write_is_needed(IdType::Object));

        let mut graph = empty_graph();
        let image = Datablock::image("Grid", Image::default());
        let id = add_snapshot_node(&mut graph, &image);
        let main = graph.main().clone();
        expand(&mut graph, &main.read(), id);
        assert!(graph.id_node(id).id_cow.is_none());
    }

    #[test]
    fn expand_remaps_references() {
        let (mut graph, object_id, _, mesh_uuid) = object_and_mesh();
        let main = graph.main().clone();
        expand(&mut graph, &main.read(), object_id);

        let snapshot = graph.id_node(object_id).id_cow.as_ref().unwrap();
        assert!(snapshot.runtime.is_cow);
        assert_eq!(snapshot.name, "Cube");
        let object = snapshot.as_object().unwrap();
        assert_eq!(object.data, Some(IdPtr::Evaluated(mesh_uuid)));
        assert_eq!(object.runtime.data_orig, Some(mesh_uuid));

        // The original is untouched.
        let main = main.read();
        let orig = main.get(snapshot.session_uuid).unwrap();
        assert_eq!(orig.as_object().unwrap().data, Some(IdPtr::Original(mesh_uuid)));
        assert!(!orig.runtime.is_cow);
    }

    #[test]
    fn unnamed_datablocks_expand() {
        let mut graph = empty_graph();
        let object = Datablock::object("", Object::default());
        let id = add_snapshot_node(&mut graph, &object);
        graph.main().write().add(object);
        let main = graph.main().clone();

        expand(&mut graph, &main.read(), id);
        assert_eq!(graph.id_node(id).cow_state(), crate::node::CowState::Expanded);

        free(graph.id_node_mut(id).id_cow.as_mut().unwrap());
        assert_eq!(graph.id_node(id).cow_state(), crate::node::CowState::Placeholder);
        expand(&mut graph, &main.read(), id);
        assert!(graph.id_node(id).is_cow_expanded());
    }

    #[test]
    fn mesh_expansion_shares_vertices() {
        let (mut graph, _, mesh_id, mesh_uuid) = object_and_mesh();
        let main = graph.main().clone();
        expand(&mut graph, &main.read(), mesh_id);
        let snapshot = graph.id_node(mesh_id).id_cow.as_ref().unwrap();
        let main = main.read();
        let orig = main.get(mesh_uuid).unwrap();
        assert!(Arc::ptr_eq(
            &snapshot.as_mesh().unwrap().vertices,
            &orig.as_mesh().unwrap().vertices
        ));
    }

    #[test]
    fn free_keeps_snapshot_marker() {
        let (mut graph, object_id, _, _) = object_and_mesh();
        let main = graph.main().clone();
        expand(&mut graph, &main.read(), object_id);
        let node = graph.id_node_mut(object_id);
        free(node.id_cow.as_mut().unwrap());
        let snapshot = node.id_cow.as_ref().unwrap();
        assert!(snapshot.runtime.is_cow);
        assert!(!snapshot.runtime.expanded);
        assert!(snapshot.name.is_empty());
        assert!(!node.is_cow_expanded());
    }

    #[test]
    fn update_keeps_draw_cache() {
        let (mut graph, object_id, _, _) = object_and_mesh();
        let main = graph.main().clone();
        expand(&mut graph, &main.read(), object_id);
        if let Some(object) = graph.id_node_mut(object_id).id_cow.as_mut().and_then(Datablock::as_object_mut) {
            object.runtime.batch_cache = Some(42);
            object.location = [1.0, 2.0, 3.0];
        }
        update(&mut graph, &main.read(), object_id);
        let object = graph.id_node(object_id).id_cow.as_ref().and_then(Datablock::as_object).unwrap();
        assert_eq!(object.runtime.batch_cache, Some(42));
        assert_eq!(object.location, [0.0; 3]);
    }

    #[test]
    fn stale_references_are_tagged() {
        let (mut graph, object_id, _, mesh_uuid) = object_and_mesh();
        let main = graph.main().clone();
        expand(&mut graph, &main.read(), object_id);
        graph.id_node_mut(object_id).previously_visible_components_mask = 1;
        assert_eq!(tag_invalid_pointers(&mut graph), 0);

        // Pretend the snapshot was made while the mesh had no snapshot.
        if let Some(object) = graph.id_node_mut(object_id).id_cow.as_mut().and_then(Datablock::as_object_mut) {
            object.data = Some(IdPtr::Original(mesh_uuid));
        }
        assert_eq!(tag_invalid_pointers(&mut graph), 1);
        assert!(graph.has_entry_tags());
        // Already tagged: not tagged twice.
        assert_eq!(tag_invalid_pointers(&mut graph), 0);
    }

    #[test]
    fn references_to_removed_snapshots_are_tagged() {
        let (mut graph, object_id, _, _) = object_and_mesh();
        let main = graph.main().clone();
        expand(&mut graph, &main.read(), object_id);
        graph.id_node_mut(object_id).previously_visible_components_mask = 1;
        if let Some(object) = graph.id_node_mut(object_id).id_cow.as_mut().and_then(Datablock::as_object_mut) {
            object.parent = Some(IdPtr::Evaluated(SessionUuid::new()));
        }
        assert_eq!(tag_invalid_pointers(&mut graph), 1);
    }
}
