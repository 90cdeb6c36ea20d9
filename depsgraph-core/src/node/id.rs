//! ID nodes: the graph's view of one datablock.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::{ComponentIdKey, NodeHandle, NodeType};
use crate::scene::{Datablock, IdRecalc, IdType, SessionUuid};

/// How a datablock got into the graph. Later variants win when combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum LinkedState {
    /// Only reachable through another datablock.
    #[default]
    Indirectly,
    /// Part of a background set scene.
    ViaSet,
    /// Directly part of the view layer.
    Directly,
}

/// Per-flush state of an ID node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdState {
    #[default]
    None,
    Modified,
}

/// Lifecycle stage of a copy-on-write snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CowState {
    /// The evaluated datablock is the original.
    NotNeeded,
    /// Allocated but empty.
    Placeholder,
    /// A full, remapped duplicate of the original.
    Expanded,
}

/// Payload of an ID node.
#[derive(Debug)]
pub struct IdNode {
    pub id_orig: SessionUuid,
    pub id_type: IdType,
    /// Copy-on-write snapshot. `None` when the type does not need one.
    pub id_cow: Option<Datablock>,
    pub components: IndexMap<ComponentIdKey, NodeHandle>,
    pub linked_state: LinkedState,
    pub is_directly_visible: bool,
    pub is_user_modified: bool,
    pub state: IdState,
    /// Recalc flags accumulated by the last flush.
    pub eval_recalc: IdRecalc,
    /// Components affecting something visible in this build.
    pub visible_components_mask: u64,
    /// Same mask, as it was at the end of the previous build.
    pub previously_visible_components_mask: u64,
}

impl IdNode {
    pub fn new(id_orig: SessionUuid, id_type: IdType, id_cow: Option<Datablock>) -> Self {
        Self {
            id_orig,
            id_type,
            id_cow,
            components: IndexMap::new(),
            linked_state: LinkedState::Indirectly,
            is_directly_visible: false,
            is_user_modified: false,
            state: IdState::None,
            eval_recalc: IdRecalc::empty(),
            visible_components_mask: 0,
            previously_visible_components_mask: 0,
        }
    }

    /// Component of this datablock by type and name.
    pub fn find_component(&self, node_type: NodeType, name: &str) -> Option<NodeHandle> {
        self.components
            .get(&ComponentIdKey::new(node_type, name))
            .copied()
    }

    /// Lifecycle stage of the snapshot.
    pub fn cow_state(&self) -> CowState {
        match &self.id_cow {
            None => CowState::NotNeeded,
            Some(cow) if cow.runtime.is_cow && cow.runtime.expanded => CowState::Expanded,
            Some(_) => CowState::Placeholder,
        }
    }

    pub fn is_cow_expanded(&self) -> bool {
        self.cow_state() == CowState::Expanded
    }

    /// Combine the linked state of another path into this datablock.
    pub fn link(&mut self, linked_state: LinkedState) {
        self.linked_state = self.linked_state.max(linked_state);
    }
}
