//! Tagging
//!
//! Translates "this datablock changed in this way" into entry tags on the
//! operations that must re-run. Nothing propagates here; that is the job of
//! [`flush_updates`](super::flush_updates).
//!
//! # Recalc Flags
//!
//! | flag | component |
//! |---|---|
//! | `TRANSFORM` | transform |
//! | `GEOMETRY` | geometry (pose evaluation for armature objects) |
//! | `ANIMATION` | animation |
//! | `COPY_ON_WRITE` | copy-on-write |
//!
//! An empty flag set keeps its legacy meaning: every component except
//! animation is tagged.

use tracing::{debug, trace};

use crate::graph::Depsgraph;
use crate::node::factory::type_info;
use crate::node::{NodeHandle, NodeType, OperationFlags};
use crate::scene::{IdRecalc, IdType, SessionUuid};

/// Where a tag comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    /// Frame change.
    Time,
    /// Edit made by the user through the editor.
    UserEdit,
    /// Graph relations were rebuilt.
    Relations,
    /// Something became visible.
    Visibility,
}

/// Tag a single operation and register it as an entry tag.
pub fn tag_operation(graph: &mut Depsgraph, operation: NodeHandle, source: UpdateSource) {
    let op = graph.operation_mut(operation);
    op.flag |= OperationFlags::NEEDS_UPDATE | OperationFlags::DIRECTLY_MODIFIED;
    if source == UpdateSource::UserEdit {
        op.flag |= OperationFlags::USER_MODIFIED;
    }
    graph.add_entry_tag(operation);
}

/// Tag every operation of a component.
///
/// Components whose type asks for it also tag the copy-on-write component
/// of their datablock, so the evaluated snapshot is refreshed first.
pub fn tag_component(graph: &mut Depsgraph, component: NodeHandle, source: UpdateSource) {
    let (owner, operations) = {
        let comp = graph.component(component);
        let operations: Vec<NodeHandle> = comp.operations.values().copied().collect();
        (comp.owner, operations)
    };
    trace!(component = %graph.node(component).name, ?source, "tag component");
    for operation in operations {
        tag_operation(graph, operation, source);
    }

    let node_type = graph.node(component).node_type;
    if type_info(node_type).tags_cow_on_update {
        if let Some(cow) = graph.id_node(owner).find_component(NodeType::CopyOnWrite, "") {
            if cow != component {
                tag_component(graph, cow, source);
            }
        }
    }
}

/// Component addressed by a single recalc flag.
fn component_for_flag(graph: &Depsgraph, id: NodeHandle, flag: IdRecalc) -> Option<NodeType> {
    let node = graph.id_node(id);
    let node_type = if flag == IdRecalc::TRANSFORM {
        NodeType::Transform
    } else if flag == IdRecalc::GEOMETRY {
        if node.id_type == IdType::Object && node.find_component(NodeType::EvalPose, "").is_some() {
            NodeType::EvalPose
        } else {
            NodeType::Geometry
        }
    } else if flag == IdRecalc::ANIMATION {
        NodeType::Animation
    } else if flag == IdRecalc::COPY_ON_WRITE {
        NodeType::CopyOnWrite
    } else {
        return None;
    };
    Some(node_type)
}

/// Tag a datablock of this graph.
///
/// Returns false when the datablock is not part of the graph.
pub fn tag_id(graph: &mut Depsgraph, uuid: SessionUuid, recalc: IdRecalc, source: UpdateSource) -> bool {
    let Some(id) = graph.find_id_node(uuid) else {
        debug!(?uuid, "tagged datablock is not in the graph");
        return false;
    };
    if graph.config().debug.contains(crate::config::DebugFlags::TAG) {
        debug!(id = %graph.node(id).name, ?recalc, ?source, "tag datablock");
    }
    if source == UpdateSource::UserEdit {
        graph.id_node_mut(id).is_user_modified = true;
    }

    if recalc.is_empty() {
        tag_all_but_animation(graph, id, source);
        return true;
    }

    for flag in recalc.iter() {
        let Some(node_type) = component_for_flag(graph, id, flag) else {
            continue;
        };
        match graph.id_node(id).find_component(node_type, "") {
            Some(component) => tag_component(graph, component, source),
            None => debug!(
                id = %graph.node(id).name,
                component = node_type.name(),
                "tagged component does not exist"
            ),
        }
    }
    true
}

fn tag_all_but_animation(graph: &mut Depsgraph, id: NodeHandle, source: UpdateSource) {
    let components: Vec<NodeHandle> = graph
        .id_node(id)
        .components
        .iter()
        .filter(|(key, _)| key.node_type != NodeType::Animation)
        .map(|(_, &handle)| handle)
        .collect();
    for component in components {
        tag_component(graph, component, source);
    }
}

/// Tag every operation driven directly by the time source.
pub fn tag_time_source(graph: &mut Depsgraph) -> usize {
    let Some(time_source) = graph.time_source() else {
        return 0;
    };
    let targets: Vec<NodeHandle> = graph
        .node(time_source)
        .outlinks
        .iter()
        .map(|&rel| graph.relation(rel).to)
        .filter(|&to| graph.node(to).is_operation())
        .collect();
    for &operation in &targets {
        tag_operation(graph, operation, UpdateSource::Time);
    }
    targets.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests_support::empty_graph;
    use crate::node::{OperationCode, OperationIdKey};

    fn object_with(graph: &mut Depsgraph, types: &[NodeType]) -> SessionUuid {
        let uuid = SessionUuid::new();
        let id = graph.add_id_node("OBTest", uuid, IdType::Object, None);
        for &node_type in types {
            let component = graph.ensure_component(id, node_type, "");
            graph.add_operation(component, OperationIdKey::from_opcode(OperationCode::Operation), None);
        }
        uuid
    }

    fn component_tagged(graph: &Depsgraph, uuid: SessionUuid, node_type: NodeType) -> bool {
        let Some(component) = graph.find_component(uuid, node_type, "") else {
            return false;
        };
        graph
            .component(component)
            .operations
            .values()
            .all(|&op| graph.operation(op).needs_update())
    }

    #[test]
    fn transform_flag_tags_transform_only() {
        let mut graph = empty_graph();
        let uuid = object_with(&mut graph, &[NodeType::Transform, NodeType::Geometry]);
        assert!(tag_id(&mut graph, uuid, IdRecalc::TRANSFORM, UpdateSource::UserEdit));
        assert!(component_tagged(&graph, uuid, NodeType::Transform));
        assert!(!component_tagged(&graph, uuid, NodeType::Geometry));
        assert!(graph.has_entry_tags());

        let id = graph.find_id_node(uuid).unwrap();
        assert!(graph.id_node(id).is_user_modified);
    }

    #[test]
    fn geometry_also_tags_copy_on_write() {
        let mut graph = empty_graph();
        let uuid = object_with(&mut graph, &[NodeType::CopyOnWrite, NodeType::Geometry]);
        tag_id(&mut graph, uuid, IdRecalc::GEOMETRY, UpdateSource::Relations);
        assert!(component_tagged(&graph, uuid, NodeType::Geometry));
        assert!(component_tagged(&graph, uuid, NodeType::CopyOnWrite));
    }

    #[test]
    fn empty_flags_skip_animation() {
        let mut graph = empty_graph();
        let uuid = object_with(
            &mut graph,
            &[NodeType::Transform, NodeType::Animation, NodeType::Parameters],
        );
        tag_id(&mut graph, uuid, IdRecalc::empty(), UpdateSource::UserEdit);
        assert!(component_tagged(&graph, uuid, NodeType::Transform));
        assert!(component_tagged(&graph, uuid, NodeType::Parameters));
        assert!(!component_tagged(&graph, uuid, NodeType::Animation));
    }

    #[test]
    fn user_edit_sets_user_modified() {
        let mut graph = empty_graph();
        let uuid = object_with(&mut graph, &[NodeType::Transform]);
        tag_id(&mut graph, uuid, IdRecalc::TRANSFORM, UpdateSource::Time);
        let op = graph.entry_tags().next().unwrap();
        assert!(!graph.operation(op).flag.contains(OperationFlags::USER_MODIFIED));

        tag_id(&mut graph, uuid, IdRecalc::TRANSFORM, UpdateSource::UserEdit);
        assert!(graph.operation(op).flag.contains(OperationFlags::USER_MODIFIED));
        assert!(graph.operation(op).flag.contains(OperationFlags::DIRECTLY_MODIFIED));
    }

    #[test]
    fn missing_components_and_ids_are_tolerated() {
        let mut graph = empty_graph();
        let uuid = object_with(&mut graph, &[NodeType::Transform]);
        assert!(tag_id(&mut graph, uuid, IdRecalc::ANIMATION, UpdateSource::UserEdit));
        assert!(!graph.has_entry_tags());
        assert!(!tag_id(&mut graph, SessionUuid::new(), IdRecalc::ALL, UpdateSource::UserEdit));
    }
}
