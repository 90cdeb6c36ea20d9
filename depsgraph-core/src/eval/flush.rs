//! Update Flushing
//!
//! Propagates the entry tags of a graph to every operation that depends on
//! them, and accumulates which components and datablocks were affected.
//!
//! # Algorithm
//!
//! 1. Reset per-pass scratch state on every node (in parallel).
//! 2. Seed a queue with the entry tags.
//! 3. Pop an operation and mark it for update, together with its datablock
//!    and, once per pass, every operation of its component. A bone component
//!    also schedules the pose entry of its datablock at the front of the
//!    queue, since changing one bone invalidates the whole IK solution.
//! 4. Walk outgoing relations. Relations flagged `NO_FLUSH` are skipped, as
//!    are `FLUSH_USER_EDIT_ONLY` relations when the source was not modified
//!    by the user. The first unscheduled child continues the walk directly,
//!    the others go to the front of the queue.
//! 5. Accumulate the recalc flags of every finished component onto its
//!    datablock.
//!
//! Clearing is a separate step ([`clear_updates`]) that must only run once
//! the flushed operations were actually evaluated.

use std::collections::VecDeque;

use rayon::prelude::*;
use tracing::{debug, debug_span, trace};

use crate::graph::Depsgraph;
use crate::node::factory::type_info;
use crate::node::{
    ComponentState, IdState, Node, NodeHandle, NodeKind, NodeType, OperationFlags, RelationFlags,
};
use crate::scene::{IdRecalc, SessionUuid};

const OP_PROCESSED: u32 = 1;

/// Outcome of one flush.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushSummary {
    /// Operations in the order they were processed.
    pub visited: Vec<NodeHandle>,
    /// Datablocks with at least one component updated.
    pub modified_ids: Vec<SessionUuid>,
    /// Modified datablocks to report to the editor (active graphs only).
    pub notify_ids: Vec<SessionUuid>,
    /// Whether anything was flushed at all.
    pub updated: bool,
}

fn reset_node(node: &mut Node) {
    node.custom_flags = 0;
    match &mut node.kind {
        NodeKind::Operation(op) => op.scheduled = false,
        NodeKind::Component(component) => component.state = ComponentState::None,
        NodeKind::Id(id) => id.state = IdState::None,
        NodeKind::TimeSource(_) => {}
    }
}

fn reset_scratch(graph: &mut Depsgraph) {
    let parallel = graph.config().parallel_reset;
    let nodes = graph.nodes_mut();
    if parallel {
        nodes.par_iter_mut().for_each(|slot| {
            if let Some(node) = slot {
                reset_node(node);
            }
        });
    } else {
        nodes.iter_mut().flatten().for_each(reset_node);
    }
}

fn handle_operation(graph: &mut Depsgraph, operation: NodeHandle, queue: &mut VecDeque<NodeHandle>) {
    graph.operation_mut(operation).flag |= OperationFlags::NEEDS_UPDATE;

    let component = graph.operation(operation).owner;
    let id = graph.component(component).owner;
    graph.id_node_mut(id).state = IdState::Modified;

    if graph.component(component).state == ComponentState::Done {
        return;
    }
    graph.component_mut(component).state = ComponentState::Done;
    let siblings: Vec<NodeHandle> = graph.component(component).operations.values().copied().collect();
    for sibling in siblings {
        graph.operation_mut(sibling).flag |= OperationFlags::NEEDS_UPDATE;
    }

    if graph.node(component).node_type == NodeType::Bone {
        let Some(pose) = graph.id_node(id).find_component(NodeType::EvalPose, "") else {
            panic!("bone component of {} without pose component", graph.node(id).name);
        };
        if graph.component(pose).state == ComponentState::None {
            if let Some(entry) = graph.component(pose).entry() {
                queue.push_front(entry);
                graph.operation_mut(entry).scheduled = true;
            }
            graph.component_mut(pose).state = ComponentState::Scheduled;
        }
    }
}

/// Schedule the children of `operation`, returning the one to continue with.
fn schedule_children(
    graph: &mut Depsgraph,
    operation: NodeHandle,
    queue: &mut VecDeque<NodeHandle>,
) -> Option<NodeHandle> {
    let flag = graph.operation(operation).flag;
    let outlinks: Vec<_> = graph.node(operation).outlinks.iter().copied().collect();
    let mut next = None;
    for rel in outlinks {
        let relation = graph.relation(rel);
        if relation.flag.contains(RelationFlags::NO_FLUSH) {
            continue;
        }
        if relation.flag.contains(RelationFlags::FLUSH_USER_EDIT_ONLY)
            && !flag.contains(OperationFlags::USER_MODIFIED)
        {
            continue;
        }
        let to = relation.to;
        let Some(child) = graph.node_mut(to).as_operation_mut() else {
            continue;
        };
        child.flag |= flag & OperationFlags::FLUSH;
        if child.scheduled {
            continue;
        }
        child.scheduled = true;
        if next.is_none() {
            next = Some(to);
        } else {
            queue.push_front(to);
        }
    }
    next
}

/// Accumulate recalc flags of finished components onto their datablocks.
fn accumulate_recalc(graph: &mut Depsgraph, summary: &mut FlushSummary) {
    let ids: Vec<NodeHandle> = graph.id_nodes().collect();
    for id in ids {
        if graph.id_node(id).state != IdState::Modified {
            continue;
        }
        let recalc = graph
            .id_node(id)
            .components
            .values()
            .filter(|&&component| graph.component(component).state == ComponentState::Done)
            .fold(IdRecalc::empty(), |recalc, &component| {
                recalc | type_info(graph.node(component).node_type).recalc
            });

        let is_active = graph.is_active;
        let node = graph.id_node_mut(id);
        node.eval_recalc |= recalc;
        if let Some(cow) = node.id_cow.as_mut() {
            cow.runtime.recalc |= recalc;
        }
        let uuid = node.id_orig;
        let id_type = node.id_type;
        let notify = is_active && node.is_user_modified;
        graph.id_type_updated |= 1 << id_type.index();

        summary.modified_ids.push(uuid);
        if notify {
            summary.notify_ids.push(uuid);
        }
    }
}

/// Flush entry tags through the graph.
pub fn flush_updates(graph: &mut Depsgraph) -> FlushSummary {
    let mut summary = FlushSummary::default();
    if !graph.has_entry_tags() {
        return summary;
    }
    let _span = debug_span!("flush_updates").entered();

    reset_scratch(graph);

    let mut queue: VecDeque<NodeHandle> = graph.entry_tags().collect();
    for &operation in &queue {
        graph.operation_mut(operation).scheduled = true;
    }

    while let Some(popped) = queue.pop_front() {
        let mut current = Some(popped);
        while let Some(operation) = current {
            if graph.node(operation).custom_flags == OP_PROCESSED {
                break;
            }
            graph.node_mut(operation).custom_flags = OP_PROCESSED;
            trace!(operation = %graph.node(operation).name, "flush");
            summary.visited.push(operation);

            handle_operation(graph, operation, &mut queue);
            current = schedule_children(graph, operation, &mut queue);
        }
    }

    accumulate_recalc(graph, &mut summary);
    summary.updated = !summary.modified_ids.is_empty();
    debug!(
        operations = summary.visited.len(),
        ids = summary.modified_ids.len(),
        "flushed updates"
    );
    summary
}

/// Forget every update tag. Runs after evaluation.
pub fn clear_updates(graph: &mut Depsgraph) {
    let operations: Vec<NodeHandle> = graph.operations().collect();
    for operation in operations {
        graph.operation_mut(operation).flag -= OperationFlags::CLEAR_ON_EVAL;
    }
    let ids: Vec<NodeHandle> = graph.id_nodes().collect();
    for id in ids {
        graph.id_node_mut(id).is_user_modified = false;
    }
    graph.clear_entry_tags();
}
