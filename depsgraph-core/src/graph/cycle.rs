//! Cycle detection over the operation subgraph.
//!
//! A depth-first walk marks one relation of every cycle it meets as
//! [`RelationFlags::CYCLIC`]. Ordering passes ignore such relations, which
//! turns the remaining operation graph into a DAG.

use tracing::warn;

use super::Depsgraph;
use crate::node::{NodeHandle, RelationFlags, RelationHandle};

const NOT_VISITED: u32 = 0;
const IN_STACK: u32 = 1;
const DONE: u32 = 2;

struct Frame {
    node: NodeHandle,
    /// Relation through which the walk entered `node`.
    via: Option<RelationHandle>,
    next: usize,
}

/// Mark cycle-closing relations, returning the number of cycles found.
///
/// Sparing a godmode relation breaks its cycle elsewhere, which can leave an
/// overlapping cycle the walk already passed, so walks repeat while the
/// previous one had to spare a godmode relation.
pub fn detect_cycles(graph: &mut Depsgraph) -> usize {
    let operations: Vec<NodeHandle> = graph.operations().collect();
    let mut total = 0;
    loop {
        let (found, spared_godmode) = detect_cycles_pass(graph, &operations);
        total += found;
        if !spared_godmode {
            return total;
        }
    }
}

/// One depth-first walk. Returns the cycles found and whether any of them
/// was broken somewhere other than its closing relation.
fn detect_cycles_pass(graph: &mut Depsgraph, operations: &[NodeHandle]) -> (usize, bool) {
    for &operation in operations {
        graph.node_mut(operation).custom_flags = NOT_VISITED;
    }

    let mut num_cycles = 0;
    let mut spared_godmode = false;
    for &root in operations {
        if graph.node(root).custom_flags != NOT_VISITED {
            continue;
        }
        graph.node_mut(root).custom_flags = IN_STACK;
        let mut stack = vec![Frame {
            node: root,
            via: None,
            next: 0,
        }];

        while let Some(frame) = stack.last_mut() {
            let node = frame.node;
            let Some(rel) = graph.node(node).outlinks.get(frame.next).copied() else {
                graph.node_mut(node).custom_flags = DONE;
                stack.pop();
                continue;
            };
            frame.next += 1;

            let relation = graph.relation(rel);
            if relation.is_cyclic() {
                continue;
            }
            let to = relation.to;
            if !graph.node(to).is_operation() {
                continue;
            }
            match graph.node(to).custom_flags {
                NOT_VISITED => {
                    graph.node_mut(to).custom_flags = IN_STACK;
                    stack.push(Frame {
                        node: to,
                        via: Some(rel),
                        next: 0,
                    });
                }
                IN_STACK => {
                    let victim = choose_victim(graph, &stack, to, rel);
                    report_cycle(graph, &stack, to);
                    graph.relation_mut(victim).flag |= RelationFlags::CYCLIC;
                    spared_godmode |= victim != rel;
                    num_cycles += 1;
                }
                _ => {}
            }
        }
    }
    (num_cycles, spared_godmode)
}

/// Relations forming the cycle that closes at `to` through `closing`.
fn cycle_relations(stack: &[Frame], to: NodeHandle, closing: RelationHandle) -> Vec<RelationHandle> {
    let start = stack
        .iter()
        .position(|frame| frame.node == to)
        .unwrap_or_else(|| panic!("cycle target {to:?} is not on the walk stack"));
    stack[start + 1..]
        .iter()
        .filter_map(|frame| frame.via)
        .chain(std::iter::once(closing))
        .collect()
}

/// Pick the relation to break, avoiding relations flagged as godmode.
fn choose_victim(
    graph: &Depsgraph,
    stack: &[Frame],
    to: NodeHandle,
    closing: RelationHandle,
) -> RelationHandle {
    if !graph.relation(closing).flag.contains(RelationFlags::GODMODE) {
        return closing;
    }
    cycle_relations(stack, to, closing)
        .into_iter()
        .find(|&rel| !graph.relation(rel).flag.contains(RelationFlags::GODMODE))
        .unwrap_or(closing)
}

fn report_cycle(graph: &Depsgraph, stack: &[Frame], to: NodeHandle) {
    let start = stack
        .iter()
        .position(|frame| frame.node == to)
        .unwrap_or(0);
    let path: Vec<String> = stack[start..]
        .iter()
        .map(|frame| {
            let id = graph.operation_id_node(frame.node);
            format!("{}/{}", graph.node(id).name, graph.node(frame.node).name)
        })
        .collect();
    warn!(cycle = %path.join(" -> "), "dependency cycle detected");
}
