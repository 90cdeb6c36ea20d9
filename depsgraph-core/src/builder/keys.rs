//! Abstract node keys used by the relation builder.
//!
//! A key names a node by datablock and semantic identity rather than by
//! handle, so relations can be described before knowing whether the nodes
//! exist. Resolution to a handle depends on which end of a relation the key
//! sits: a component is left through its exit operation and entered through
//! its entry operation.

use std::fmt;

use crate::graph::Depsgraph;
use crate::node::{NodeHandle, NodeType, OperationCode, OperationIdKey};
use crate::scene::SessionUuid;

/// Something a relation can start or end at.
pub trait RelationKey: fmt::Display {
    /// Node a relation starting at this key leaves from.
    fn find_from(&self, graph: &Depsgraph) -> Option<NodeHandle>;

    /// Node a relation ending at this key arrives at.
    fn find_to(&self, graph: &Depsgraph) -> Option<NodeHandle>;
}

/// The graph's time source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeSourceKey;

impl fmt::Display for TimeSourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TimeSourceKey")
    }
}

impl RelationKey for TimeSourceKey {
    fn find_from(&self, graph: &Depsgraph) -> Option<NodeHandle> {
        graph.time_source()
    }

    fn find_to(&self, _graph: &Depsgraph) -> Option<NodeHandle> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComponentKey {
    pub uuid: SessionUuid,
    pub node_type: NodeType,
    pub name: String,
}

impl ComponentKey {
    pub fn new(uuid: SessionUuid, node_type: NodeType) -> Self {
        Self::named(uuid, node_type, "")
    }

    pub fn named(uuid: SessionUuid, node_type: NodeType, name: impl Into<String>) -> Self {
        Self {
            uuid,
            node_type,
            name: name.into(),
        }
    }

    pub fn find(&self, graph: &Depsgraph) -> Option<NodeHandle> {
        graph.find_component(self.uuid, self.node_type, &self.name)
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentKey({:?}, {:?}", self.uuid, self.node_type)?;
        if !self.name.is_empty() {
            write!(f, ", '{}'", self.name)?;
        }
        f.write_str(")")
    }
}

impl RelationKey for ComponentKey {
    fn find_from(&self, graph: &Depsgraph) -> Option<NodeHandle> {
        graph.component(self.find(graph)?).exit()
    }

    fn find_to(&self, graph: &Depsgraph) -> Option<NodeHandle> {
        graph.component(self.find(graph)?).entry()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationKey {
    pub uuid: SessionUuid,
    pub node_type: NodeType,
    pub component_name: String,
    pub operation: OperationIdKey,
}

impl OperationKey {
    pub fn new(uuid: SessionUuid, node_type: NodeType, opcode: OperationCode) -> Self {
        Self::in_component(uuid, node_type, "", opcode)
    }

    /// Operation inside a named component, e.g. a bone.
    pub fn in_component(
        uuid: SessionUuid,
        node_type: NodeType,
        component_name: impl Into<String>,
        opcode: OperationCode,
    ) -> Self {
        Self {
            uuid,
            node_type,
            component_name: component_name.into(),
            operation: OperationIdKey::from_opcode(opcode),
        }
    }

    /// Operation disambiguated by name and tag, e.g. a driver.
    pub fn tagged(
        uuid: SessionUuid,
        node_type: NodeType,
        opcode: OperationCode,
        name: impl Into<String>,
        name_tag: i32,
    ) -> Self {
        Self {
            uuid,
            node_type,
            component_name: String::new(),
            operation: OperationIdKey::new(opcode, name, name_tag),
        }
    }

    pub fn opcode(&self) -> OperationCode {
        self.operation.opcode
    }

    pub fn component(&self) -> ComponentKey {
        ComponentKey::named(self.uuid, self.node_type, self.component_name.clone())
    }

    pub fn find(&self, graph: &Depsgraph) -> Option<NodeHandle> {
        graph.find_operation(self.uuid, self.node_type, &self.component_name, &self.operation)
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OperationKey({:?}, {:?}", self.uuid, self.node_type)?;
        if !self.component_name.is_empty() {
            write!(f, ", '{}'", self.component_name)?;
        }
        write!(f, ", {})", self.operation.identifier())
    }
}

impl RelationKey for OperationKey {
    fn find_from(&self, graph: &Depsgraph) -> Option<NodeHandle> {
        self.find(graph)
    }

    fn find_to(&self, graph: &Depsgraph) -> Option<NodeHandle> {
        self.find(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests_support::empty_graph;
    use crate::scene::IdType;

    #[test]
    fn component_keys_resolve_to_entry_and_exit() {
        let mut graph = empty_graph();
        let uuid = SessionUuid::new();
        let id = graph.add_id_node("OBKey", uuid, IdType::Object, None);
        let component = graph.ensure_component(id, NodeType::Transform, "");
        let init = graph.add_operation(component, OperationIdKey::from_opcode(OperationCode::TransformInit), None);
        let done = graph.add_operation(component, OperationIdKey::from_opcode(OperationCode::TransformFinal), None);
        graph.set_entry_operation(component, init);
        graph.set_exit_operation(component, done);

        let key = ComponentKey::new(uuid, NodeType::Transform);
        assert_eq!(key.find_to(&graph), Some(init));
        assert_eq!(key.find_from(&graph), Some(done));

        let op = OperationKey::new(uuid, NodeType::Transform, OperationCode::TransformFinal);
        assert_eq!(op.find_from(&graph), Some(done));
        assert_eq!(op.component(), key);
    }

    #[test]
    fn missing_nodes_resolve_to_none() {
        let graph = empty_graph();
        let uuid = SessionUuid::new();
        assert!(ComponentKey::new(uuid, NodeType::Geometry).find_to(&graph).is_none());
        assert!(OperationKey::new(uuid, NodeType::Geometry, OperationCode::GeometryEval)
            .find_from(&graph)
            .is_none());
        assert!(TimeSourceKey.find_from(&graph).is_none());
    }

    #[test]
    fn display_names_the_node() {
        let uuid = SessionUuid::from(7);
        let key = OperationKey::in_component(uuid, NodeType::Bone, "Arm", OperationCode::BoneDone);
        assert_eq!(
            key.to_string(),
            "OperationKey(SessionUuid(7), Bone, 'Arm', BONE_DONE)"
        );
    }
}
