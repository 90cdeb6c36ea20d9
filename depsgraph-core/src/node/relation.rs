//! Relations: directed edges between nodes.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::NodeHandle;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct RelationFlags: u32 {
        /// Closes a detected cycle. Ignored by ordering passes.
        const CYCLIC               = 1 << 0;
        /// Dirtiness never crosses this relation.
        const NO_FLUSH             = 1 << 1;
        /// Dirtiness crosses only when the source was modified by the user.
        const FLUSH_USER_EDIT_ONLY = 1 << 2;
        /// Never chosen when breaking a cycle.
        const GODMODE              = 1 << 3;
        /// Reuse an existing relation with the same target and name.
        const CHECK_BEFORE_ADD     = 1 << 4;
    }
}

/// A directed edge: `from` must happen before `to`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relation {
    pub from: NodeHandle,
    pub to: NodeHandle,
    /// Label, for debugging only.
    pub name: String,
    pub flag: RelationFlags,
}

impl Relation {
    pub fn new(from: NodeHandle, to: NodeHandle, name: impl Into<String>) -> Self {
        Self {
            from,
            to,
            name: name.into(),
            flag: RelationFlags::empty(),
        }
    }

    pub fn is_cyclic(&self) -> bool {
        self.flag.contains(RelationFlags::CYCLIC)
    }
}
