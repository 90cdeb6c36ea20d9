//! Evaluation Driver
//!
//! Runs the operations tagged by a flush, dependencies first, then forgets
//! the tags.
//!
//! # Algorithm
//!
//! 1. Reset the recalc flags accumulated by the previous evaluation.
//! 2. Flush entry tags.
//! 3. Order the operations needing an update topologically (Kahn's
//!    algorithm, ignoring cyclic relations). Anything left on an unmarked
//!    cycle goes last with a warning rather than being dropped.
//! 4. Run each callback. Operations of components affecting nothing visible
//!    are skipped, except copy-on-write which every reader relies on.
//! 5. Clear update tags.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, debug_span, trace, warn};

use super::flush::{clear_updates, flush_updates, FlushSummary};
use super::{cow, EvalContext};
use crate::config::DebugFlags;
use crate::graph::Depsgraph;
use crate::node::{EvalCallback, NodeHandle, OperationCode};
use crate::scene::{IdRecalc, Main};

/// Outcome of one evaluation run.
#[derive(Debug, Clone, Default)]
pub struct EvaluationReport {
    pub flush: FlushSummary,
    /// Operations whose callback ran, in execution order.
    pub executed: Vec<NodeHandle>,
    /// Tagged operations skipped because nothing visible depends on them.
    pub skipped: usize,
}

/// Body of the operations the graph evaluates itself.
pub(crate) fn builtin_callback(opcode: OperationCode) -> Option<EvalCallback> {
    let callback: EvalCallback = match opcode {
        OperationCode::CopyOnWrite => Arc::new(evaluate_copy_on_write),
        OperationCode::SynchronizeToOriginal => Arc::new(synchronize_to_original),
        OperationCode::ViewLayerEval => Arc::new(evaluate_view_layer),
        _ => return None,
    };
    Some(callback)
}

fn evaluate_copy_on_write(ctx: &mut EvalContext<'_>) {
    let id = ctx.id_node();
    cow::update(ctx.graph, ctx.main, id);
}

/// Copy the evaluated results the editor shows back onto the original.
fn synchronize_to_original(ctx: &mut EvalContext<'_>) {
    let Some(runtime) = ctx
        .evaluated()
        .and_then(|snapshot| snapshot.as_object())
        .map(|object| object.runtime.clone())
    else {
        return;
    };
    if let Some(object) = ctx.original_mut().and_then(|orig| orig.as_object_mut()) {
        object.runtime.world_location = runtime.world_location;
        object.runtime.base_flags = runtime.base_flags;
    }
}

/// Push the base flags of the view layer onto the evaluated objects.
fn evaluate_view_layer(ctx: &mut EvalContext<'_>) {
    let view_layer = ctx.graph.view_layer().to_owned();
    let Some(bases) = ctx
        .evaluated()
        .and_then(|snapshot| snapshot.as_scene())
        .and_then(|scene| scene.view_layer(&view_layer))
        .map(|layer| layer.bases.clone())
    else {
        return;
    };
    for base in bases {
        let Some(id) = ctx.graph.find_id_node(base.object.uuid()) else {
            continue;
        };
        if let Some(object) = ctx
            .graph
            .id_node_mut(id)
            .id_cow
            .as_mut()
            .and_then(|snapshot| snapshot.as_object_mut())
        {
            object.runtime.base_flags = base.flags;
        }
    }
}

/// Order `operations` so that every operation comes after its dependencies.
///
/// Only relations between operations of the set count; cyclic relations
/// are ignored. Operations stuck on a cycle nobody marked are appended in
/// the order given.
pub fn topological_order(graph: &Depsgraph, operations: &[NodeHandle]) -> Vec<NodeHandle> {
    let set: HashSet<NodeHandle> = operations.iter().copied().collect();
    let mut in_degree: HashMap<NodeHandle, usize> = HashMap::new();
    let mut queue = VecDeque::new();
    let mut result = Vec::with_capacity(operations.len());

    for &operation in operations {
        let degree = graph
            .node(operation)
            .inlinks
            .iter()
            .map(|&rel| graph.relation(rel))
            .filter(|relation| !relation.is_cyclic() && set.contains(&relation.from))
            .count();
        in_degree.insert(operation, degree);
        if degree == 0 {
            queue.push_back(operation);
        }
    }

    while let Some(operation) = queue.pop_front() {
        result.push(operation);
        for &rel in &graph.node(operation).outlinks {
            let relation = graph.relation(rel);
            if relation.is_cyclic() {
                continue;
            }
            if let Some(degree) = in_degree.get_mut(&relation.to) {
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    queue.push_back(relation.to);
                }
            }
        }
    }

    if result.len() < operations.len() {
        let ordered: HashSet<NodeHandle> = result.iter().copied().collect();
        let leftover: Vec<NodeHandle> = operations
            .iter()
            .copied()
            .filter(|op| !ordered.contains(op))
            .collect();
        if let Some(&first) = leftover.first() {
            warn!(
                count = leftover.len(),
                first = %graph.node(first).name,
                "operations left on an unbroken cycle, appended in graph order"
            );
            result.extend(leftover);
        }
    }
    result
}

fn reset_recalc(graph: &mut Depsgraph) {
    let ids: Vec<NodeHandle> = graph.id_nodes().collect();
    for id in ids {
        let node = graph.id_node_mut(id);
        node.eval_recalc = IdRecalc::empty();
        if let Some(cow) = node.id_cow.as_mut() {
            cow.runtime.recalc = IdRecalc::empty();
        }
    }
    graph.id_type_updated = 0;
}

fn should_run(graph: &Depsgraph, operation: NodeHandle) -> bool {
    let op = graph.operation(operation);
    op.opcode == OperationCode::CopyOnWrite || graph.component(op.owner).affects_directly_visible
}

/// Flush, run every tagged operation, and clear the tags.
pub fn evaluate(graph: &mut Depsgraph, main: &mut Main) -> EvaluationReport {
    let _span = debug_span!("evaluate", frame = graph.frame()).entered();
    reset_recalc(graph);
    let flush = flush_updates(graph);

    let tagged: Vec<NodeHandle> = graph
        .operations()
        .filter(|&op| graph.operation(op).needs_update())
        .collect();
    let order = topological_order(graph, &tagged);
    let trace_eval = graph.config().debug.contains(DebugFlags::EVAL);

    let mut report = EvaluationReport {
        flush,
        ..EvaluationReport::default()
    };
    for operation in order {
        if !should_run(graph, operation) {
            report.skipped += 1;
            continue;
        }
        let Some(callback) = graph.operation(operation).evaluate.clone() else {
            continue;
        };
        if trace_eval {
            debug!(operation = %graph.node(operation).name, "evaluate");
        } else {
            trace!(operation = %graph.node(operation).name, "evaluate");
        }
        let mut ctx = EvalContext::new(graph, main, operation);
        callback(&mut ctx);
        report.executed.push(operation);
    }

    clear_updates(graph);
    debug!(
        executed = report.executed.len(),
        skipped = report.skipped,
        "evaluation finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::tag::{tag_operation, UpdateSource};
    use crate::graph::tests_support::graph_with_chain;
    use crate::node::RelationFlags;

    #[test]
    fn order_respects_dependencies() {
        let (graph, ops) = graph_with_chain(4);
        let reversed: Vec<_> = ops.iter().rev().copied().collect();
        assert_eq!(topological_order(&graph, &reversed), ops);
    }

    #[test]
    fn cyclic_relations_are_ignored() {
        let (mut graph, ops) = graph_with_chain(3);
        graph.add_relation(ops[2], ops[0], "Back", RelationFlags::CYCLIC);
        assert_eq!(topological_order(&graph, &ops), ops);
    }

    #[test]
    fn unmarked_cycle_keeps_every_operation() {
        let (mut graph, ops) = graph_with_chain(3);
        graph.add_relation(ops[2], ops[0], "Back", RelationFlags::empty());
        assert_eq!(topological_order(&graph, &ops), ops);
    }

    #[test]
    fn overlapping_godmode_cycles_still_evaluate() {
        let (mut graph, ops) = graph_with_chain(3);
        graph.add_relation(ops[0], ops[2], "Direct", RelationFlags::empty());
        graph.add_relation(ops[2], ops[0], "Back", RelationFlags::GODMODE);
        crate::graph::detect_cycles(&mut graph);

        let component = graph.operation(ops[0]).owner;
        graph.component_mut(component).affects_directly_visible = true;
        let callback: EvalCallback = Arc::new(|_: &mut EvalContext<'_>| {});
        for &op in &ops {
            graph.operation_mut(op).evaluate = Some(callback.clone());
        }

        let main_handle = graph.main().clone();
        let mut main = main_handle.write();
        tag_operation(&mut graph, ops[0], UpdateSource::Relations);
        let report = evaluate(&mut graph, &mut main);
        assert_eq!(report.executed, vec![ops[1], ops[2], ops[0]]);
        assert!(!graph.has_entry_tags());
    }

    #[test]
    fn invisible_components_are_skipped() {
        let (mut graph, ops) = graph_with_chain(2);
        let main_handle = graph.main().clone();
        let mut main = main_handle.write();
        tag_operation(&mut graph, ops[0], UpdateSource::Relations);
        let report = evaluate(&mut graph, &mut main);
        assert_eq!(report.skipped, 2);
        assert!(report.executed.is_empty());
        assert!(!graph.has_entry_tags());
    }

    #[test]
    fn callbacks_run_in_order() {
        use std::sync::Mutex;

        let (mut graph, ops) = graph_with_chain(3);
        let component = graph.operation(ops[0]).owner;
        graph.component_mut(component).affects_directly_visible = true;

        let log = Arc::new(Mutex::new(Vec::new()));
        for &op in &ops {
            let log = Arc::clone(&log);
            let callback: EvalCallback = Arc::new(move |ctx: &mut EvalContext<'_>| {
                log.lock().unwrap().push(ctx.operation);
            });
            graph.operation_mut(op).evaluate = Some(callback);
        }

        let main_handle = graph.main().clone();
        let mut main = main_handle.write();
        tag_operation(&mut graph, ops[0], UpdateSource::Relations);
        let report = evaluate(&mut graph, &mut main);
        assert_eq!(report.executed, ops);
        assert_eq!(*log.lock().unwrap(), ops);
        assert!(graph.operations().all(|op| !graph.operation(op).needs_update()));
    }
}
