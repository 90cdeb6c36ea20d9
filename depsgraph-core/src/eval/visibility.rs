//! Visibility Flush
//!
//! Determines which components affect something directly visible. Runs once
//! per rebuild, before any update flush.
//!
//! Every component starts with the visibility of its datablock. Operations
//! are then processed dependents first (Kahn's algorithm over the operation
//! subgraph, ignoring cyclic relations), and each processed operation passes
//! visibility on to the operations it depends on.
//!
//! Visibility components are special twice over: once any dependent reaches
//! them they are visible themselves, and they forward visibility to every
//! component of their datablock rather than only to themselves.

use std::collections::VecDeque;

use tracing::debug_span;

use crate::graph::Depsgraph;
use crate::node::{NodeHandle, NodeType};

fn counts_for_ordering(graph: &Depsgraph, rel: crate::node::RelationHandle) -> bool {
    let relation = graph.relation(rel);
    !relation.is_cyclic()
        && graph.node(relation.from).is_operation()
        && graph.node(relation.to).is_operation()
}

/// Seed every component with its datablock's visibility.
fn prepare_components(graph: &mut Depsgraph) {
    let ids: Vec<NodeHandle> = graph.id_nodes().collect();
    for id in ids {
        let (visible, components) = {
            let node = graph.id_node(id);
            let components: Vec<NodeHandle> = node.components.values().copied().collect();
            (node.is_directly_visible, components)
        };
        for component in components {
            let forced = graph.node(component).node_type == NodeType::Synchronization;
            let comp = graph.component_mut(component);
            comp.affects_directly_visible |= visible || forced;
        }
    }
}

fn mark_all_components(graph: &mut Depsgraph, id: NodeHandle) {
    let components: Vec<NodeHandle> = graph.id_node(id).components.values().copied().collect();
    for component in components {
        graph.component_mut(component).affects_directly_visible = true;
    }
}

/// Propagate "affects directly visible" backwards along relations.
pub fn flush_visibility(graph: &mut Depsgraph) {
    let _span = debug_span!("flush_visibility").entered();
    prepare_components(graph);

    let operations: Vec<NodeHandle> = graph.operations().collect();
    let mut queued = vec![false; graph.node_handles().last().map_or(0, |h| h.index() + 1)];
    let mut queue = VecDeque::new();

    for &operation in &operations {
        let pending = graph
            .node(operation)
            .outlinks
            .iter()
            .filter(|&&rel| counts_for_ordering(graph, rel))
            .count();
        let pending = u32::try_from(pending).unwrap_or(u32::MAX);
        graph.node_mut(operation).custom_flags = pending;
        if pending == 0 {
            queue.push_back(operation);
            queued[operation.index()] = true;
        }
    }

    while let Some(operation) = queue.pop_front() {
        let target_visible = {
            let component = graph.operation(operation).owner;
            graph.component(component).affects_directly_visible
        };
        let inlinks: Vec<_> = graph.node(operation).inlinks.iter().copied().collect();
        for rel in inlinks {
            let (from, cyclic) = {
                let relation = graph.relation(rel);
                (relation.from, relation.is_cyclic())
            };
            if !graph.node(from).is_operation() {
                continue;
            }
            let comp_from = graph.operation(from).owner;
            if target_visible {
                if graph.node(comp_from).node_type == NodeType::Visibility {
                    let id_from = graph.component(comp_from).owner;
                    mark_all_components(graph, id_from);
                } else {
                    graph.component_mut(comp_from).affects_directly_visible = true;
                }
            }
            if !cyclic {
                let node = graph.node_mut(from);
                debug_assert!(node.custom_flags > 0, "pending relation count underflow");
                node.custom_flags = node.custom_flags.saturating_sub(1);
            }
            if graph.node(from).custom_flags == 0 && !queued[from.index()] {
                queued[from.index()] = true;
                queue.push_back(from);
            }
        }
    }
}

/// Bit mask of the visible components of a datablock.
pub fn visible_components_mask(graph: &Depsgraph, id: NodeHandle) -> u64 {
    graph
        .id_node(id)
        .components
        .iter()
        .filter(|(_, &component)| graph.component(component).affects_directly_visible)
        .fold(0, |mask, (key, _)| mask | key.node_type.component_bit())
}
