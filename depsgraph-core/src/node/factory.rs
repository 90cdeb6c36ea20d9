//! Node Factory
//!
//! Per node type metadata and construction of nodes of each kind.
//!
//! The metadata answers two questions the rest of the graph keeps asking
//! about a node type: what to call it in debug output, and which recalc flag
//! a change to a component of that type corresponds to.

use super::{
    ComponentNode, EvalCallback, IdNode, Node, NodeHandle, NodeKind, NodeType, OperationIdKey,
    OperationNode, TimeSourceNode,
};
use crate::scene::{Datablock, IdRecalc, IdType, SessionUuid};

/// Broad class of a node type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeClass {
    Generic,
    Component,
    Operation,
}

/// Static metadata of a node type.
#[derive(Debug)]
pub struct NodeTypeInfo {
    pub node_type: NodeType,
    pub class: NodeClass,
    pub name: &'static str,
    /// Recalc flag accumulated on the datablock when this component changes.
    pub recalc: IdRecalc,
    /// Tagging this component also tags the copy-on-write component.
    pub tags_cow_on_update: bool,
}

macro_rules! type_info {
    ($node_type:ident, $class:ident, $name:literal, $recalc:expr, $cow:literal) => {
        NodeTypeInfo {
            node_type: NodeType::$node_type,
            class: NodeClass::$class,
            name: $name,
            recalc: $recalc,
            tags_cow_on_update: $cow,
        }
    };
}

static PARAMETERS: NodeTypeInfo =
    type_info!(Parameters, Component, "Parameters Component", IdRecalc::empty(), true);
static ANIMATION: NodeTypeInfo =
    type_info!(Animation, Component, "Animation Component", IdRecalc::ANIMATION, false);
static TRANSFORM: NodeTypeInfo =
    type_info!(Transform, Component, "Transform Component", IdRecalc::TRANSFORM, false);
static GEOMETRY: NodeTypeInfo =
    type_info!(Geometry, Component, "Geometry Component", IdRecalc::GEOMETRY, true);
static EVAL_POSE: NodeTypeInfo =
    type_info!(EvalPose, Component, "Pose Eval Component", IdRecalc::GEOMETRY, true);
static BONE: NodeTypeInfo =
    type_info!(Bone, Component, "Bone Component", IdRecalc::GEOMETRY, false);
static LAYER_COLLECTIONS: NodeTypeInfo = type_info!(
    LayerCollections,
    Component,
    "Layer Collections Component",
    IdRecalc::empty(),
    false
);
static COPY_ON_WRITE: NodeTypeInfo = type_info!(
    CopyOnWrite,
    Component,
    "Copy-on-Write Component",
    IdRecalc::COPY_ON_WRITE,
    false
);
static OBJECT_FROM_LAYER: NodeTypeInfo = type_info!(
    ObjectFromLayer,
    Component,
    "Object from Layer Component",
    IdRecalc::empty(),
    false
);
static VISIBILITY: NodeTypeInfo =
    type_info!(Visibility, Component, "Visibility Component", IdRecalc::empty(), false);
static SYNCHRONIZATION: NodeTypeInfo = type_info!(
    Synchronization,
    Component,
    "Synchronization Component",
    IdRecalc::empty(),
    false
);
static TIME_SOURCE: NodeTypeInfo =
    type_info!(TimeSource, Generic, "Time Source", IdRecalc::empty(), false);
static ID_REF: NodeTypeInfo = type_info!(IdRef, Generic, "ID Node", IdRecalc::empty(), false);
static OPERATION: NodeTypeInfo =
    type_info!(Operation, Operation, "Operation", IdRecalc::empty(), false);

/// Metadata of the given node type.
pub fn type_info(node_type: NodeType) -> &'static NodeTypeInfo {
    match node_type {
        NodeType::Parameters => &PARAMETERS,
        NodeType::Animation => &ANIMATION,
        NodeType::Transform => &TRANSFORM,
        NodeType::Geometry => &GEOMETRY,
        NodeType::EvalPose => &EVAL_POSE,
        NodeType::Bone => &BONE,
        NodeType::LayerCollections => &LAYER_COLLECTIONS,
        NodeType::CopyOnWrite => &COPY_ON_WRITE,
        NodeType::ObjectFromLayer => &OBJECT_FROM_LAYER,
        NodeType::Visibility => &VISIBILITY,
        NodeType::Synchronization => &SYNCHRONIZATION,
        NodeType::TimeSource => &TIME_SOURCE,
        NodeType::IdRef => &ID_REF,
        NodeType::Operation => &OPERATION,
    }
}

pub fn create_time_source() -> Node {
    Node::new(
        NodeType::TimeSource,
        type_info(NodeType::TimeSource).name,
        NodeKind::TimeSource(TimeSourceNode),
    )
}

/// Create an ID node. `id_cow` is `None` for types evaluated in place.
pub fn create_id(
    name: &str,
    id_orig: SessionUuid,
    id_type: IdType,
    id_cow: Option<Datablock>,
) -> Node {
    Node::new(
        NodeType::IdRef,
        name,
        NodeKind::Id(IdNode::new(id_orig, id_type, id_cow)),
    )
}

/// Create a component node of the given component type.
///
/// # Panics
///
/// Panics when `node_type` is not a component type.
pub fn create_component(node_type: NodeType, owner: NodeHandle, name: &str) -> Node {
    let info = type_info(node_type);
    assert_eq!(
        info.class,
        NodeClass::Component,
        "{node_type:?} is not a component type"
    );
    let display = if name.is_empty() {
        info.name.to_owned()
    } else {
        format!("{} ({})", info.name, name)
    };
    Node::new(
        node_type,
        display,
        NodeKind::Component(ComponentNode::new(owner)),
    )
}

pub fn create_operation(
    owner: NodeHandle,
    key: OperationIdKey,
    evaluate: Option<EvalCallback>,
) -> Node {
    Node::new(
        NodeType::Operation,
        key.identifier(),
        NodeKind::Operation(OperationNode::new(owner, key, evaluate)),
    )
}
