//! Property Path Resolution
//!
//! Animation curves and drivers address data by property path, such as
//! `location` or `pose.bones["Arm"].rotation_quaternion`. The relation
//! builder needs to know which node reads or writes that property.
//!
//! The full mapping belongs to the embedder's property system, so it is
//! behind the [`PropertyResolver`] trait. [`PathResolver`] covers the paths
//! the graph itself knows about:
//!
//! | path | node |
//! |---|---|
//! | `pose.bones["X"]...` | bone component `X` (local on entry, done on exit) |
//! | `location`, `rotation_*`, `scale`, `delta_*` | transform local on entry, transform component on exit |
//! | `matrix_world` | transform component |
//! | `data`, `data.*` | geometry of the object data |
//! | `hide_viewport`, `hide_render`, `hide_select` | object from layer |
//! | `modifiers[...]` | geometry |
//! | anything else | parameters evaluation |

use std::fmt;

use super::keys::{ComponentKey, OperationKey, RelationKey};
use crate::graph::Depsgraph;
use crate::node::{NodeHandle, NodeType, OperationCode};
use crate::scene::{Datablock, IdData, SessionUuid};

/// Which side of a relation the resolved node sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RnaPointerSource {
    /// The property is written: resolve to where its evaluation starts.
    Entry,
    /// The property is read: resolve to where its value is final.
    Exit,
}

/// Node a property path resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RnaTarget {
    Component(ComponentKey),
    Operation(OperationKey),
}

impl RnaTarget {
    pub fn uuid(&self) -> SessionUuid {
        match self {
            RnaTarget::Component(key) => key.uuid,
            RnaTarget::Operation(key) => key.uuid,
        }
    }

    /// Animating a single bone would add one relation per bone; the whole
    /// pose is re-initialized instead.
    pub fn redirect_bone_local(self) -> Self {
        match self {
            RnaTarget::Operation(key) if key.opcode() == OperationCode::BoneLocal => RnaTarget::Operation(
                OperationKey::new(key.uuid, NodeType::EvalPose, OperationCode::PoseInit),
            ),
            other => other,
        }
    }
}

impl fmt::Display for RnaTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RnaTarget::Component(key) => fmt::Display::fmt(key, f),
            RnaTarget::Operation(key) => fmt::Display::fmt(key, f),
        }
    }
}

impl RelationKey for RnaTarget {
    fn find_from(&self, graph: &Depsgraph) -> Option<NodeHandle> {
        match self {
            RnaTarget::Component(key) => key.find_from(graph),
            RnaTarget::Operation(key) => key.find_from(graph),
        }
    }

    fn find_to(&self, graph: &Depsgraph) -> Option<NodeHandle> {
        match self {
            RnaTarget::Component(key) => key.find_to(graph),
            RnaTarget::Operation(key) => key.find_to(graph),
        }
    }
}

/// Maps a property path of a datablock to a graph node.
pub trait PropertyResolver: Send + Sync {
    fn resolve(&self, owner: &Datablock, rna_path: &str, source: RnaPointerSource) -> Option<RnaTarget>;
}

const TRANSFORM_PROPERTIES: &[&str] = &[
    "location",
    "rotation_euler",
    "rotation_quaternion",
    "rotation_axis_angle",
    "rotation_mode",
    "scale",
    "delta_location",
    "delta_rotation_euler",
    "delta_rotation_quaternion",
    "delta_scale",
];

const VISIBILITY_PROPERTIES: &[&str] = &["hide_viewport", "hide_render", "hide_select"];

/// Resolver for the property paths of the built-in datablock types.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathResolver;

/// First path segment, without any array subscript.
fn head(rna_path: &str) -> &str {
    let end = rna_path.find(|c: char| c == '.' || c == '[').unwrap_or(rna_path.len());
    &rna_path[..end]
}

/// Bone name of a `pose.bones["name"]` path.
fn pose_bone_name(rna_path: &str) -> Option<&str> {
    let rest = rna_path.strip_prefix("pose.bones[\"")?;
    let end = rest.find("\"]")?;
    Some(&rest[..end])
}

impl PathResolver {
    fn resolve_object(owner: &Datablock, rna_path: &str, source: RnaPointerSource) -> RnaTarget {
        let uuid = owner.session_uuid;
        if let Some(bone) = pose_bone_name(rna_path) {
            let opcode = match source {
                RnaPointerSource::Entry => OperationCode::BoneLocal,
                RnaPointerSource::Exit => OperationCode::BoneDone,
            };
            return RnaTarget::Operation(OperationKey::in_component(uuid, NodeType::Bone, bone, opcode));
        }

        let head = head(rna_path);
        if TRANSFORM_PROPERTIES.contains(&head) {
            return match source {
                RnaPointerSource::Entry => RnaTarget::Operation(OperationKey::new(
                    uuid,
                    NodeType::Transform,
                    OperationCode::TransformLocal,
                )),
                RnaPointerSource::Exit => RnaTarget::Component(ComponentKey::new(uuid, NodeType::Transform)),
            };
        }
        if head == "matrix_world" {
            return RnaTarget::Component(ComponentKey::new(uuid, NodeType::Transform));
        }
        if head == "data" {
            let data = owner.as_object().and_then(|object| object.data);
            let target = data.map_or(uuid, |ptr| ptr.uuid());
            return RnaTarget::Component(ComponentKey::new(target, NodeType::Geometry));
        }
        if VISIBILITY_PROPERTIES.contains(&head) {
            return RnaTarget::Component(ComponentKey::new(uuid, NodeType::ObjectFromLayer));
        }
        if head == "modifiers" {
            return RnaTarget::Component(ComponentKey::new(uuid, NodeType::Geometry));
        }
        Self::parameters(owner)
    }

    fn parameters(owner: &Datablock) -> RnaTarget {
        RnaTarget::Operation(OperationKey::new(
            owner.session_uuid,
            NodeType::Parameters,
            OperationCode::ParametersEval,
        ))
    }
}

impl PropertyResolver for PathResolver {
    fn resolve(&self, owner: &Datablock, rna_path: &str, source: RnaPointerSource) -> Option<RnaTarget> {
        if rna_path.is_empty() {
            return None;
        }
        let target = match &owner.data {
            IdData::Object(_) => Self::resolve_object(owner, rna_path, source),
            IdData::Mesh(_) => RnaTarget::Component(ComponentKey::new(owner.session_uuid, NodeType::Geometry)),
            _ => Self::parameters(owner),
        };
        Some(target)
    }
}
