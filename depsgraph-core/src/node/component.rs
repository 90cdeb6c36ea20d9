//! Component nodes: one aspect of a datablock's evaluation.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::{NodeHandle, NodeType, OperationIdKey};

/// Identity of a component inside its ID node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentIdKey {
    pub node_type: NodeType,
    /// Sub-name, e.g. the bone name of a bone component.
    pub name: String,
}

impl ComponentIdKey {
    pub fn new(node_type: NodeType, name: impl Into<String>) -> Self {
        Self {
            node_type,
            name: name.into(),
        }
    }
}

/// Per-flush state of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComponentState {
    #[default]
    None,
    Scheduled,
    Done,
}

/// Payload of a component node.
#[derive(Debug)]
pub struct ComponentNode {
    /// Owning ID node.
    pub owner: NodeHandle,
    pub operations: IndexMap<OperationIdKey, NodeHandle>,
    pub entry_operation: Option<NodeHandle>,
    pub exit_operation: Option<NodeHandle>,
    /// Some operation of this component feeds something that is displayed.
    pub affects_directly_visible: bool,
    pub state: ComponentState,
}

impl ComponentNode {
    pub fn new(owner: NodeHandle) -> Self {
        Self {
            owner,
            operations: IndexMap::new(),
            entry_operation: None,
            exit_operation: None,
            affects_directly_visible: false,
            state: ComponentState::None,
        }
    }

    pub fn find_operation(&self, key: &OperationIdKey) -> Option<NodeHandle> {
        self.operations.get(key).copied()
    }

    /// Operation through which whole-component dependencies enter.
    ///
    /// Falls back to the only operation when the component has just one.
    pub fn entry(&self) -> Option<NodeHandle> {
        self.entry_operation.or_else(|| self.single_operation())
    }

    /// Operation through which whole-component dependencies leave.
    pub fn exit(&self) -> Option<NodeHandle> {
        self.exit_operation.or_else(|| self.single_operation())
    }

    fn single_operation(&self) -> Option<NodeHandle> {
        if self.operations.len() == 1 {
            self.operations.values().next().copied()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::OperationCode;

    #[test]
    fn single_operation_is_entry_and_exit() {
        let mut component = ComponentNode::new(NodeHandle::from_index(0));
        assert_eq!(component.entry(), None);

        let op = NodeHandle::from_index(7);
        component
            .operations
            .insert(OperationIdKey::from_opcode(OperationCode::Visibility), op);
        assert_eq!(component.entry(), Some(op));
        assert_eq!(component.exit(), Some(op));
    }

    #[test]
    fn explicit_entry_wins() {
        let mut component = ComponentNode::new(NodeHandle::from_index(0));
        let init = NodeHandle::from_index(1);
        let done = NodeHandle::from_index(2);
        component
            .operations
            .insert(OperationIdKey::from_opcode(OperationCode::GeometryEvalInit), init);
        component
            .operations
            .insert(OperationIdKey::from_opcode(OperationCode::GeometryEvalDone), done);
        assert_eq!(component.entry(), None);

        component.entry_operation = Some(init);
        component.exit_operation = Some(done);
        assert_eq!(component.entry(), Some(init));
        assert_eq!(component.exit(), Some(done));
    }
}
