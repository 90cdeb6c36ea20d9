//! Graph Nodes
//!
//! This module defines the vertices and edges of the dependency graph.
//!
//! # Overview
//!
//! Every vertex is a [`Node`]: the fields shared by all kinds (name, type tag,
//! adjacency lists, a traversal scratch flag) plus a [`NodeKind`] payload:
//!
//! - [`IdNode`] wraps one datablock and owns its components.
//! - [`ComponentNode`] is one aspect of a datablock's evaluation (transform,
//!   geometry, pose, ...) and owns its operations.
//! - [`OperationNode`] is one schedulable unit of evaluation work.
//! - [`TimeSourceNode`] is the root of time-dependent propagation.
//!
//! Nodes live in an arena owned by the graph and are addressed by
//! [`NodeHandle`]. Edges are [`Relation`]s stored in a second arena and
//! addressed by [`RelationHandle`]; a node's `inlinks`/`outlinks` hold
//! relation handles.

mod component;
pub mod factory;
mod id;
mod operation;
mod relation;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub use component::{ComponentIdKey, ComponentNode, ComponentState};
pub use id::{CowState, IdNode, IdState, LinkedState};
pub use operation::{EvalCallback, OperationCode, OperationFlags, OperationIdKey, OperationNode};
pub use relation::{Relation, RelationFlags};

/// Stable handle of a node inside a graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeHandle(u32);

impl NodeHandle {
    pub(crate) fn from_index(index: usize) -> Self {
        Self(u32::try_from(index).unwrap_or_else(|_| panic!("node arena exceeds u32 handles")))
    }

    /// Index into the node arena.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Stable handle of a relation inside a graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationHandle(u32);

impl RelationHandle {
    pub(crate) fn from_index(index: usize) -> Self {
        Self(u32::try_from(index).unwrap_or_else(|_| panic!("relation arena exceeds u32 handles")))
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Type tag of a node.
///
/// Component types double as the bit positions of the visible component
/// masks kept on ID nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeType {
    // Components.
    Parameters,
    Animation,
    Transform,
    Geometry,
    EvalPose,
    Bone,
    LayerCollections,
    CopyOnWrite,
    ObjectFromLayer,
    Visibility,
    Synchronization,
    // Non-component nodes.
    TimeSource,
    IdRef,
    Operation,
}

impl NodeType {
    /// Every component type.
    pub const COMPONENTS: [NodeType; 11] = [
        NodeType::Parameters,
        NodeType::Animation,
        NodeType::Transform,
        NodeType::Geometry,
        NodeType::EvalPose,
        NodeType::Bone,
        NodeType::LayerCollections,
        NodeType::CopyOnWrite,
        NodeType::ObjectFromLayer,
        NodeType::Visibility,
        NodeType::Synchronization,
    ];

    /// Whether this type names a component.
    pub fn is_component(self) -> bool {
        !matches!(
            self,
            NodeType::TimeSource | NodeType::IdRef | NodeType::Operation
        )
    }

    /// Bit of this component type in a visible component mask.
    pub fn component_bit(self) -> u64 {
        debug_assert!(self.is_component(), "{self:?} is not a component type");
        1u64 << (self as u32)
    }

    /// Display name used in debug output.
    pub fn name(self) -> &'static str {
        factory::type_info(self).name
    }
}

/// Time source payload. There is exactly one per graph.
#[derive(Debug, Clone, Default)]
pub struct TimeSourceNode;

/// Kind specific part of a node.
#[derive(Debug)]
pub enum NodeKind {
    TimeSource(TimeSourceNode),
    Id(IdNode),
    Component(ComponentNode),
    Operation(OperationNode),
}

/// A vertex of the dependency graph.
#[derive(Debug)]
pub struct Node {
    /// Display name, for debugging only.
    pub name: String,
    pub node_type: NodeType,
    pub inlinks: SmallVec<[RelationHandle; 4]>,
    pub outlinks: SmallVec<[RelationHandle; 4]>,
    /// Scratch value owned by whichever traversal is running. Reset before use.
    pub custom_flags: u32,
    pub kind: NodeKind,
}

impl Node {
    pub(crate) fn new(node_type: NodeType, name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            node_type,
            inlinks: SmallVec::new(),
            outlinks: SmallVec::new(),
            custom_flags: 0,
            kind,
        }
    }

    /// Whether this node is an operation.
    pub fn is_operation(&self) -> bool {
        matches!(self.kind, NodeKind::Operation(_))
    }

    /// ID payload, if this is an ID node.
    pub fn as_id(&self) -> Option<&IdNode> {
        match &self.kind {
            NodeKind::Id(id) => Some(id),
            _ => None,
        }
    }

    /// Mutable ID payload, if this is an ID node.
    pub fn as_id_mut(&mut self) -> Option<&mut IdNode> {
        match &mut self.kind {
            NodeKind::Id(id) => Some(id),
            _ => None,
        }
    }

    /// Component payload, if this is a component.
    pub fn as_component(&self) -> Option<&ComponentNode> {
        match &self.kind {
            NodeKind::Component(component) => Some(component),
            _ => None,
        }
    }

    /// Mutable component payload, if this is a component.
    pub fn as_component_mut(&mut self) -> Option<&mut ComponentNode> {
        match &mut self.kind {
            NodeKind::Component(component) => Some(component),
            _ => None,
        }
    }

    /// Operation payload, if this is an operation.
    pub fn as_operation(&self) -> Option<&OperationNode> {
        match &self.kind {
            NodeKind::Operation(operation) => Some(operation),
            _ => None,
        }
    }

    /// Mutable operation payload, if this is an operation.
    pub fn as_operation_mut(&mut self) -> Option<&mut OperationNode> {
        match &mut self.kind {
            NodeKind::Operation(operation) => Some(operation),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_bits_are_distinct() {
        let mut mask = 0u64;
        for node_type in NodeType::COMPONENTS {
            assert!(node_type.is_component());
            assert_eq!(mask & node_type.component_bit(), 0);
            mask |= node_type.component_bit();
        }
        assert_eq!(mask.count_ones() as usize, NodeType::COMPONENTS.len());
    }

    #[test]
    fn non_component_types() {
        assert!(!NodeType::Operation.is_component());
        assert!(!NodeType::IdRef.is_component());
        assert!(!NodeType::TimeSource.is_component());
    }

    #[test]
    fn kind_accessors() {
        let node = factory::create_time_source();
        assert_eq!(node.node_type, NodeType::TimeSource);
        assert!(node.as_id().is_none());
        assert!(node.as_component().is_none());
        assert!(!node.is_operation());
    }
}
