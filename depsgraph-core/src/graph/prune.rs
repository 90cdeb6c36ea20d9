//! Removal of operations nothing depends on.

use tracing::trace;

use super::Depsgraph;
use crate::node::{NodeHandle, OperationFlags};

fn is_unused(graph: &Depsgraph, operation: NodeHandle) -> bool {
    let Some(node) = graph.try_node(operation) else {
        return false;
    };
    let Some(op) = node.as_operation() else {
        return false;
    };
    op.is_noop()
        && node.outlinks.is_empty()
        && !op
            .flag
            .intersects(OperationFlags::PINNED | OperationFlags::ENTRY | OperationFlags::EXIT)
}

/// Remove no-op operations without dependents.
///
/// Pinned operations and component entry/exit operations are kept. Removal
/// cascades to parents that become unused. Returns the number removed.
pub fn remove_unused_noops(graph: &mut Depsgraph) -> usize {
    let mut queue: Vec<NodeHandle> = graph
        .operations()
        .filter(|&op| is_unused(graph, op))
        .collect();

    let mut removed = 0;
    while let Some(operation) = queue.pop() {
        if !is_unused(graph, operation) {
            continue;
        }
        let parents: Vec<NodeHandle> = graph
            .node(operation)
            .inlinks
            .iter()
            .map(|&rel| graph.relation(rel).from)
            .collect();
        trace!(operation = %graph.node(operation).name, "remove unused no-op");
        graph.remove_operation(operation);
        removed += 1;
        queue.extend(parents.into_iter().filter(|&p| is_unused(graph, p)));
    }
    removed
}
