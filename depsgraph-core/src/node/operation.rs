//! Operation nodes: the unit of scheduling.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::NodeHandle;
use crate::eval::EvalContext;

/// Evaluation callback of an operation.
///
/// Callbacks never capture graph state directly. Everything they need is
/// resolved through the [`EvalContext`] at call time.
pub type EvalCallback = Arc<dyn Fn(&mut EvalContext<'_>) + Send + Sync>;

/// What an operation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationCode {
    /// Generic operation without a dedicated code.
    Operation,

    ParametersEntry,
    ParametersEval,
    ParametersExit,
    Driver,

    AnimationEntry,
    AnimationEval,
    AnimationExit,

    TransformInit,
    TransformLocal,
    TransformParent,
    TransformEval,
    TransformFinal,

    GeometryEvalInit,
    GeometryEval,
    GeometryEvalDone,

    PoseInit,
    PoseInitIk,
    PoseCleanup,
    PoseDone,

    BoneLocal,
    BonePoseParent,
    BoneReady,
    BoneDone,

    ViewLayerEval,

    CopyOnWrite,

    ObjectFromLayerEntry,
    ObjectBaseFlags,
    ObjectFromLayerExit,

    Visibility,

    SynchronizeToOriginal,
}

impl OperationCode {
    pub fn name(self) -> &'static str {
        match self {
            OperationCode::Operation => "OPERATION",
            OperationCode::ParametersEntry => "PARAMETERS_ENTRY",
            OperationCode::ParametersEval => "PARAMETERS_EVAL",
            OperationCode::ParametersExit => "PARAMETERS_EXIT",
            OperationCode::Driver => "DRIVER",
            OperationCode::AnimationEntry => "ANIMATION_ENTRY",
            OperationCode::AnimationEval => "ANIMATION_EVAL",
            OperationCode::AnimationExit => "ANIMATION_EXIT",
            OperationCode::TransformInit => "TRANSFORM_INIT",
            OperationCode::TransformLocal => "TRANSFORM_LOCAL",
            OperationCode::TransformParent => "TRANSFORM_PARENT",
            OperationCode::TransformEval => "TRANSFORM_EVAL",
            OperationCode::TransformFinal => "TRANSFORM_FINAL",
            OperationCode::GeometryEvalInit => "GEOMETRY_EVAL_INIT",
            OperationCode::GeometryEval => "GEOMETRY_EVAL",
            OperationCode::GeometryEvalDone => "GEOMETRY_EVAL_DONE",
            OperationCode::PoseInit => "POSE_INIT",
            OperationCode::PoseInitIk => "POSE_INIT_IK",
            OperationCode::PoseCleanup => "POSE_CLEANUP",
            OperationCode::PoseDone => "POSE_DONE",
            OperationCode::BoneLocal => "BONE_LOCAL",
            OperationCode::BonePoseParent => "BONE_POSE_PARENT",
            OperationCode::BoneReady => "BONE_READY",
            OperationCode::BoneDone => "BONE_DONE",
            OperationCode::ViewLayerEval => "VIEW_LAYER_EVAL",
            OperationCode::CopyOnWrite => "COPY_ON_WRITE",
            OperationCode::ObjectFromLayerEntry => "OBJECT_FROM_LAYER_ENTRY",
            OperationCode::ObjectBaseFlags => "OBJECT_BASE_FLAGS",
            OperationCode::ObjectFromLayerExit => "OBJECT_FROM_LAYER_EXIT",
            OperationCode::Visibility => "VISIBILITY",
            OperationCode::SynchronizeToOriginal => "SYNCHRONIZE_TO_ORIGINAL",
        }
    }
}

impl fmt::Display for OperationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// State bits of an operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct OperationFlags: u32 {
        /// Must be evaluated on the next evaluation run.
        const NEEDS_UPDATE      = 1 << 0;
        /// Tagged explicitly rather than reached by a flush.
        const DIRECTLY_MODIFIED = 1 << 1;
        /// The change came from an edit made by the user.
        const USER_MODIFIED     = 1 << 2;
        /// Never removed by the unused node pass.
        const PINNED            = 1 << 3;
        /// Entry operation of its component.
        const ENTRY             = 1 << 4;
        /// Exit operation of its component.
        const EXIT              = 1 << 5;

        /// Bits copied from an operation onto its children during flush.
        const FLUSH = Self::USER_MODIFIED.bits();
        /// Bits cleared once evaluation has run.
        const CLEAR_ON_EVAL = Self::NEEDS_UPDATE.bits()
            | Self::DIRECTLY_MODIFIED.bits()
            | Self::USER_MODIFIED.bits();
    }
}

/// Identity of an operation inside its component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationIdKey {
    pub opcode: OperationCode,
    pub name: String,
    pub name_tag: i32,
}

impl OperationIdKey {
    pub fn new(opcode: OperationCode, name: impl Into<String>, name_tag: i32) -> Self {
        Self {
            opcode,
            name: name.into(),
            name_tag,
        }
    }

    pub fn from_opcode(opcode: OperationCode) -> Self {
        Self::new(opcode, "", -1)
    }

    /// Human readable identifier, e.g. `DRIVER(location)[0]`.
    pub fn identifier(&self) -> String {
        let mut result = self.opcode.name().to_owned();
        if !self.name.is_empty() {
            result.push('(');
            result.push_str(&self.name);
            result.push(')');
        }
        if self.name_tag != -1 {
            result.push_str(&format!("[{}]", self.name_tag));
        }
        result
    }
}

/// Payload of an operation node.
pub struct OperationNode {
    /// Owning component node.
    pub owner: NodeHandle,
    pub opcode: OperationCode,
    pub name: String,
    pub name_tag: i32,
    pub flag: OperationFlags,
    pub evaluate: Option<EvalCallback>,
    /// Already enqueued during the current flush.
    pub scheduled: bool,
}

impl OperationNode {
    pub fn new(owner: NodeHandle, key: OperationIdKey, evaluate: Option<EvalCallback>) -> Self {
        Self {
            owner,
            opcode: key.opcode,
            name: key.name,
            name_tag: key.name_tag,
            flag: OperationFlags::empty(),
            evaluate,
            scheduled: false,
        }
    }

    pub fn key(&self) -> OperationIdKey {
        OperationIdKey::new(self.opcode, self.name.clone(), self.name_tag)
    }

    /// An operation without a callback only exists for ordering.
    pub fn is_noop(&self) -> bool {
        self.evaluate.is_none()
    }

    pub fn needs_update(&self) -> bool {
        self.flag.contains(OperationFlags::NEEDS_UPDATE)
    }
}

impl fmt::Debug for OperationNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationNode")
            .field("owner", &self.owner)
            .field("opcode", &self.opcode)
            .field("name", &self.name)
            .field("name_tag", &self.name_tag)
            .field("flag", &self.flag)
            .field("has_callback", &self.evaluate.is_some())
            .field("scheduled", &self.scheduled)
            .finish()
    }
}
