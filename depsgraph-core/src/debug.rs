//! Debug Export
//!
//! Serializes a graph for inspection: a JSON dump of every node and relation
//! and a graphviz description of the operation graph, clustered by datablock
//! and component.

use std::fmt::Write as _;

use serde::Serialize;

use crate::graph::{Depsgraph, GraphStats};
use crate::node::{NodeHandle, NodeKind, NodeType, OperationFlags, RelationFlags};
use crate::scene::SessionUuid;

#[derive(Debug, Serialize)]
struct OperationDump {
    handle: u32,
    name: String,
    opcode: String,
    flags: OperationFlags,
}

#[derive(Debug, Serialize)]
struct ComponentDump {
    node_type: NodeType,
    name: String,
    affects_directly_visible: bool,
    operations: Vec<OperationDump>,
}

#[derive(Debug, Serialize)]
struct IdDump {
    name: String,
    session_uuid: SessionUuid,
    linked_state: crate::node::LinkedState,
    is_directly_visible: bool,
    visible_components_mask: u64,
    components: Vec<ComponentDump>,
}

#[derive(Debug, Serialize)]
struct RelationDump {
    from: String,
    to: String,
    name: String,
    flags: RelationFlags,
}

#[derive(Debug, Serialize)]
struct GraphDump {
    view_layer: String,
    frame: f32,
    stats: GraphStats,
    ids: Vec<IdDump>,
    relations: Vec<RelationDump>,
}

fn handle_index(handle: NodeHandle) -> u32 {
    u32::try_from(handle.index()).unwrap_or(u32::MAX)
}

fn dump(graph: &Depsgraph) -> GraphDump {
    let ids = graph
        .id_nodes()
        .map(|id| {
            let node = graph.id_node(id);
            let components = node
                .components
                .iter()
                .map(|(key, &component)| {
                    let comp = graph.component(component);
                    ComponentDump {
                        node_type: key.node_type,
                        name: key.name.clone(),
                        affects_directly_visible: comp.affects_directly_visible,
                        operations: comp
                            .operations
                            .values()
                            .map(|&operation| {
                                let op = graph.operation(operation);
                                OperationDump {
                                    handle: handle_index(operation),
                                    name: graph.node(operation).name.clone(),
                                    opcode: op.opcode.to_string(),
                                    flags: op.flag,
                                }
                            })
                            .collect(),
                    }
                })
                .collect();
            IdDump {
                name: graph.node(id).name.clone(),
                session_uuid: node.id_orig,
                linked_state: node.linked_state,
                is_directly_visible: node.is_directly_visible,
                visible_components_mask: node.visible_components_mask,
                components,
            }
        })
        .collect();

    let relations = graph
        .relation_handles()
        .map(|handle| {
            let relation = graph.relation(handle);
            RelationDump {
                from: graph.node(relation.from).name.clone(),
                to: graph.node(relation.to).name.clone(),
                name: relation.name.clone(),
                flags: relation.flag,
            }
        })
        .collect();

    GraphDump {
        view_layer: graph.view_layer().to_owned(),
        frame: graph.frame(),
        stats: graph.stats(),
        ids,
        relations,
    }
}

/// JSON dump of every node and relation.
pub fn to_json(graph: &Depsgraph) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&dump(graph))
}

fn escape(label: &str) -> String {
    label.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Graphviz description of the operation graph.
///
/// Cyclic relations are drawn red, relations that do not flush dashed.
pub fn to_graphviz(graph: &Depsgraph) -> String {
    let mut out = String::from("digraph depsgraph {\n  rankdir=LR;\n  node [shape=box];\n");

    for (index, id) in graph.id_nodes().enumerate() {
        let _ = writeln!(out, "  subgraph cluster_{index} {{");
        let _ = writeln!(out, "    label=\"{}\";", escape(&graph.node(id).name));
        for (sub, (key, &component)) in graph.id_node(id).components.iter().enumerate() {
            let _ = writeln!(out, "    subgraph cluster_{index}_{sub} {{");
            let label = if key.name.is_empty() {
                key.node_type.name().to_owned()
            } else {
                format!("{} {}", key.node_type.name(), key.name)
            };
            let _ = writeln!(out, "      label=\"{}\";", escape(&label));
            if graph.component(component).affects_directly_visible {
                let _ = writeln!(out, "      style=filled; fillcolor=\"#eef6ff\";");
            }
            for &operation in graph.component(component).operations.values() {
                let _ = writeln!(
                    out,
                    "      n{} [label=\"{}\"];",
                    operation.index(),
                    escape(&graph.node(operation).name)
                );
            }
            out.push_str("    }\n");
        }
        out.push_str("  }\n");
    }

    if let Some(time_source) = graph.time_source() {
        let _ = writeln!(out, "  n{} [label=\"Time Source\", shape=ellipse];", time_source.index());
    }

    for handle in graph.relation_handles() {
        let relation = graph.relation(handle);
        let mut attributes = vec![format!("label=\"{}\"", escape(&relation.name))];
        if relation.is_cyclic() {
            attributes.push("color=red".to_owned());
        }
        if relation.flag.contains(RelationFlags::NO_FLUSH) {
            attributes.push("style=dashed".to_owned());
        }
        let _ = writeln!(
            out,
            "  n{} -> n{} [{}];",
            relation.from.index(),
            relation.to.index(),
            attributes.join(", ")
        );
    }
    out.push_str("}\n");
    out
}

/// Names of the operations of a graph, for assertions and logging.
pub fn operation_names(graph: &Depsgraph) -> Vec<String> {
    graph
        .node_handles()
        .filter(|&handle| matches!(graph.node(handle).kind, NodeKind::Operation(_)))
        .map(|handle| graph.node(handle).name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests_support::graph_with_chain;

    #[test]
    fn json_lists_operations_and_relations() {
        let (graph, _) = graph_with_chain(2);
        let json = to_json(&graph).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["ids"].as_array().unwrap().len(), 1);
        assert_eq!(value["ids"][0]["components"][0]["operations"].as_array().unwrap().len(), 2);
        assert_eq!(value["relations"][0]["name"], "Chain");
        assert_eq!(value["stats"]["relations"], 1);
    }

    #[test]
    fn graphviz_marks_cycles_and_no_flush() {
        let (mut graph, ops) = graph_with_chain(2);
        graph.add_relation(ops[1], ops[0], "Back", RelationFlags::CYCLIC | RelationFlags::NO_FLUSH);
        let dot = to_graphviz(&graph);
        assert!(dot.starts_with("digraph depsgraph {"));
        assert!(dot.contains("label=\"Back\", color=red, style=dashed"));
        assert!(dot.contains(&format!("n{} -> n{}", ops[0].index(), ops[1].index())));
        assert_eq!(operation_names(&graph).len(), 2);
    }
}
