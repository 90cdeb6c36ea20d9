//! Dependency Graph Container
//!
//! [`Depsgraph`] owns every node and relation of one graph instance, the
//! index from datablock to ID node, the time source, and the set of entry
//! tags (operations marked dirty since the last flush).
//!
//! # Storage
//!
//! Nodes and relations live in two arenas addressed by [`NodeHandle`] and
//! [`RelationHandle`]. Handles stay valid until the graph is cleared for a
//! rebuild. Removing an operation (see [`prune`]) leaves an empty slot behind
//! so other handles never shift.
//!
//! # Invariants
//!
//! - An operation's identity key is unique within its component, and a
//!   component's key is unique within its ID node.
//! - Every operation belongs to exactly one component, which belongs to
//!   exactly one ID node.
//! - Every ID node has an entry in the datablock index.

mod cycle;
mod prune;

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use tracing::trace;

use crate::builder::rna::{PathResolver, PropertyResolver};
use crate::config::GraphConfig;
use crate::eval::OperationCallbacks;
use crate::node::factory;
use crate::node::{
    ComponentIdKey, ComponentNode, EvalCallback, IdNode, Node, NodeHandle, NodeType,
    OperationFlags, OperationIdKey, OperationNode, Relation, RelationFlags, RelationHandle,
};
use crate::scene::{Datablock, IdType, MainId, SessionUuid, SharedMain};

pub use cycle::detect_cycles;
pub use prune::remove_unused_noops;

/// Counts of what a graph contains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct GraphStats {
    pub ids: usize,
    pub components: usize,
    pub operations: usize,
    pub relations: usize,
    pub cyclic_relations: usize,
}

/// One dependency graph, built for one view layer of one scene.
pub struct Depsgraph {
    nodes: Vec<Option<Node>>,
    relations: Vec<Option<Relation>>,
    id_nodes: IndexMap<SessionUuid, NodeHandle>,
    time_source: Option<NodeHandle>,
    entry_tags: IndexSet<NodeHandle>,

    main: SharedMain,
    main_id: MainId,
    scene: SessionUuid,
    view_layer: String,

    pub(crate) frame: f32,
    pub(crate) is_active: bool,
    pub(crate) need_update_relations: bool,
    /// Bit per [`IdType`] updated by the last flush.
    pub(crate) id_type_updated: u32,

    pub(crate) config: GraphConfig,
    pub(crate) callbacks: OperationCallbacks,
    pub(crate) resolver: Arc<dyn PropertyResolver>,
}

impl Depsgraph {
    /// Create an empty graph bound to a scene and view layer of a document.
    ///
    /// Relations are marked stale so the first rebuild populates the graph.
    pub fn new(main: SharedMain, scene: SessionUuid, view_layer: impl Into<String>) -> Self {
        let main_id = main.read().id();
        Self {
            nodes: Vec::new(),
            relations: Vec::new(),
            id_nodes: IndexMap::new(),
            time_source: None,
            entry_tags: IndexSet::new(),
            main,
            main_id,
            scene,
            view_layer: view_layer.into(),
            frame: 0.0,
            is_active: false,
            need_update_relations: true,
            id_type_updated: 0,
            config: GraphConfig::default(),
            callbacks: OperationCallbacks::default(),
            resolver: Arc::new(PathResolver),
        }
    }

    /// The document this graph was built from.
    pub fn main(&self) -> &SharedMain {
        &self.main
    }

    /// Identifier of the document, as registered.
    pub fn main_id(&self) -> MainId {
        self.main_id
    }

    /// Session identifier of the evaluated scene.
    pub fn scene(&self) -> SessionUuid {
        self.scene
    }

    /// Name of the evaluated view layer.
    pub fn view_layer(&self) -> &str {
        &self.view_layer
    }

    /// Current frame of the time source.
    pub fn frame(&self) -> f32 {
        self.frame
    }

    /// Behaviour switches of this graph.
    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Bind the graph to another document, scene or view layer.
    pub(crate) fn retarget(&mut self, main: SharedMain, scene: SessionUuid, view_layer: String) {
        self.main_id = main.read().id();
        self.main = main;
        self.scene = scene;
        self.view_layer = view_layer;
    }

    // ------------------------------------------------------------------------
    // Node access
    // ------------------------------------------------------------------------

    /// Get a node. Panics when the handle refers to a removed node.
    pub fn node(&self, handle: NodeHandle) -> &Node {
        self.nodes[handle.index()]
            .as_ref()
            .unwrap_or_else(|| panic!("node {handle:?} was removed"))
    }

    /// Mutable access to a live node.
    ///
    /// # Panics
    ///
    /// Panics if the handle does not refer to a live node.
    pub fn node_mut(&mut self, handle: NodeHandle) -> &mut Node {
        self.nodes[handle.index()]
            .as_mut()
            .unwrap_or_else(|| panic!("node {handle:?} was removed"))
    }

    /// The node behind `handle`, or `None` once it was removed.
    pub fn try_node(&self, handle: NodeHandle) -> Option<&Node> {
        self.nodes.get(handle.index()).and_then(Option::as_ref)
    }

    /// ID payload of a node.
    ///
    /// # Panics
    ///
    /// Panics if the node is not an ID node.
    pub fn id_node(&self, handle: NodeHandle) -> &IdNode {
        self.node(handle)
            .as_id()
            .unwrap_or_else(|| panic!("node {handle:?} is not an ID node"))
    }

    /// Mutable ID payload of a node.
    pub fn id_node_mut(&mut self, handle: NodeHandle) -> &mut IdNode {
        self.node_mut(handle)
            .as_id_mut()
            .unwrap_or_else(|| panic!("node {handle:?} is not an ID node"))
    }

    /// Component payload of a node.
    ///
    /// # Panics
    ///
    /// Panics if the node is not a component.
    pub fn component(&self, handle: NodeHandle) -> &ComponentNode {
        self.node(handle)
            .as_component()
            .unwrap_or_else(|| panic!("node {handle:?} is not a component node"))
    }

    /// Mutable component payload of a node.
    pub fn component_mut(&mut self, handle: NodeHandle) -> &mut ComponentNode {
        self.node_mut(handle)
            .as_component_mut()
            .unwrap_or_else(|| panic!("node {handle:?} is not a component node"))
    }

    /// Operation payload of a node.
    ///
    /// # Panics
    ///
    /// Panics if the node is not an operation.
    pub fn operation(&self, handle: NodeHandle) -> &OperationNode {
        self.node(handle)
            .as_operation()
            .unwrap_or_else(|| panic!("node {handle:?} is not an operation node"))
    }

    /// Mutable operation payload of a node.
    pub fn operation_mut(&mut self, handle: NodeHandle) -> &mut OperationNode {
        self.node_mut(handle)
            .as_operation_mut()
            .unwrap_or_else(|| panic!("node {handle:?} is not an operation node"))
    }

    /// Every live node handle.
    pub fn node_handles(&self) -> impl Iterator<Item = NodeHandle> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| NodeHandle::from_index(index))
    }

    /// Every live operation handle.
    pub fn operations(&self) -> impl Iterator<Item = NodeHandle> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.as_ref().is_some_and(Node::is_operation))
            .map(|(index, _)| NodeHandle::from_index(index))
    }

    /// Every ID node handle, in creation order.
    pub fn id_nodes(&self) -> impl Iterator<Item = NodeHandle> + '_ {
        self.id_nodes.values().copied()
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut [Option<Node>] {
        &mut self.nodes
    }

    /// ID node of a datablock, if the datablock is part of this graph.
    pub fn find_id_node(&self, uuid: SessionUuid) -> Option<NodeHandle> {
        self.id_nodes.get(&uuid).copied()
    }

    /// Component of a datablock by type and name.
    pub fn find_component(
        &self,
        uuid: SessionUuid,
        node_type: NodeType,
        name: &str,
    ) -> Option<NodeHandle> {
        let id = self.find_id_node(uuid)?;
        self.id_node(id).find_component(node_type, name)
    }

    /// Operation of a datablock by component and operation identity.
    pub fn find_operation(
        &self,
        uuid: SessionUuid,
        node_type: NodeType,
        component_name: &str,
        key: &OperationIdKey,
    ) -> Option<NodeHandle> {
        let component = self.find_component(uuid, node_type, component_name)?;
        self.component(component).find_operation(key)
    }

    /// ID node owning an operation.
    pub fn operation_id_node(&self, operation: NodeHandle) -> NodeHandle {
        let component = self.operation(operation).owner;
        self.component(component).owner
    }

    /// The time source, once something time dependent was built.
    pub fn time_source(&self) -> Option<NodeHandle> {
        self.time_source
    }

    // ------------------------------------------------------------------------
    // Node creation
    // ------------------------------------------------------------------------

    fn push_node(&mut self, node: Node) -> NodeHandle {
        let handle = NodeHandle::from_index(self.nodes.len());
        self.nodes.push(Some(node));
        handle
    }

    /// The time source, created on first use.
    pub fn ensure_time_source(&mut self) -> NodeHandle {
        if let Some(handle) = self.time_source {
            return handle;
        }
        let handle = self.push_node(factory::create_time_source());
        self.time_source = Some(handle);
        handle
    }

    /// Insert an ID node for a datablock not yet in the graph.
    ///
    /// # Panics
    ///
    /// Panics when the datablock already has an ID node.
    pub fn add_id_node(
        &mut self,
        name: &str,
        uuid: SessionUuid,
        id_type: IdType,
        id_cow: Option<Datablock>,
    ) -> NodeHandle {
        assert!(
            !self.id_nodes.contains_key(&uuid),
            "datablock {uuid:?} already has an ID node"
        );
        let handle = self.push_node(factory::create_id(name, uuid, id_type, id_cow));
        self.id_nodes.insert(uuid, handle);
        handle
    }

    /// Find or create a component of an ID node.
    pub fn ensure_component(
        &mut self,
        id: NodeHandle,
        node_type: NodeType,
        name: &str,
    ) -> NodeHandle {
        if let Some(existing) = self.id_node(id).find_component(node_type, name) {
            return existing;
        }
        let handle = self.push_node(factory::create_component(node_type, id, name));
        self.id_node_mut(id)
            .components
            .insert(ComponentIdKey::new(node_type, name), handle);
        handle
    }

    /// Create an operation inside a component.
    ///
    /// # Panics
    ///
    /// Panics when an operation with the same key already exists.
    pub fn add_operation(
        &mut self,
        component: NodeHandle,
        key: OperationIdKey,
        evaluate: Option<EvalCallback>,
    ) -> NodeHandle {
        if let Some(existing) = self.component(component).find_operation(&key) {
            let existing = self.node(existing);
            panic!(
                "operation {} already exists in {}",
                existing.name,
                self.node(component).name
            );
        }
        let handle = self.push_node(factory::create_operation(component, key.clone(), evaluate));
        self.component_mut(component).operations.insert(key, handle);
        handle
    }

    /// Designate the entry operation of a component.
    pub fn set_entry_operation(&mut self, component: NodeHandle, operation: NodeHandle) {
        debug_assert_eq!(self.operation(operation).owner, component);
        self.component_mut(component).entry_operation = Some(operation);
        self.operation_mut(operation).flag |= OperationFlags::ENTRY;
    }

    /// Designate the exit operation of a component.
    pub fn set_exit_operation(&mut self, component: NodeHandle, operation: NodeHandle) {
        debug_assert_eq!(self.operation(operation).owner, component);
        self.component_mut(component).exit_operation = Some(operation);
        self.operation_mut(operation).flag |= OperationFlags::EXIT;
    }

    // ------------------------------------------------------------------------
    // Relations
    // ------------------------------------------------------------------------

    /// A live relation.
    ///
    /// # Panics
    ///
    /// Panics if the relation was removed.
    pub fn relation(&self, handle: RelationHandle) -> &Relation {
        self.relations[handle.index()]
            .as_ref()
            .unwrap_or_else(|| panic!("relation {handle:?} was removed"))
    }

    /// Mutable access to a live relation.
    pub fn relation_mut(&mut self, handle: RelationHandle) -> &mut Relation {
        self.relations[handle.index()]
            .as_mut()
            .unwrap_or_else(|| panic!("relation {handle:?} was removed"))
    }

    /// Every live relation handle.
    pub fn relation_handles(&self) -> impl Iterator<Item = RelationHandle> + '_ {
        self.relations
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| RelationHandle::from_index(index))
    }

    /// Existing relation between two nodes with the given label.
    pub fn check_relation(&self, from: NodeHandle, to: NodeHandle, name: &str) -> Option<RelationHandle> {
        self.node(from).outlinks.iter().copied().find(|&handle| {
            let relation = self.relation(handle);
            relation.to == to && relation.name == name
        })
    }

    /// Add a relation `from -> to`.
    ///
    /// With [`RelationFlags::CHECK_BEFORE_ADD`] an existing relation with the
    /// same target and label is reused and gets the new flags OR-ed in.
    pub fn add_relation(
        &mut self,
        from: NodeHandle,
        to: NodeHandle,
        name: &str,
        flags: RelationFlags,
    ) -> RelationHandle {
        if flags.contains(RelationFlags::CHECK_BEFORE_ADD) {
            if let Some(existing) = self.check_relation(from, to, name) {
                self.relation_mut(existing).flag |= flags - RelationFlags::CHECK_BEFORE_ADD;
                return existing;
            }
        }
        let handle = RelationHandle::from_index(self.relations.len());
        let mut relation = Relation::new(from, to, name);
        relation.flag = flags - RelationFlags::CHECK_BEFORE_ADD;
        trace!(
            from = %self.node(from).name,
            to = %self.node(to).name,
            name,
            "add relation"
        );
        self.relations.push(Some(relation));
        self.node_mut(from).outlinks.push(handle);
        self.node_mut(to).inlinks.push(handle);
        handle
    }

    pub(crate) fn remove_relation(&mut self, handle: RelationHandle) {
        let Some(relation) = self.relations[handle.index()].take() else {
            return;
        };
        if let Some(Some(from)) = self.nodes.get_mut(relation.from.index()) {
            from.outlinks.retain(|h| *h != handle);
        }
        if let Some(Some(to)) = self.nodes.get_mut(relation.to.index()) {
            to.inlinks.retain(|h| *h != handle);
        }
    }

    /// Remove an operation together with its relations.
    pub(crate) fn remove_operation(&mut self, operation: NodeHandle) {
        let node = self.node(operation);
        let links: Vec<RelationHandle> = node.inlinks.iter().chain(&node.outlinks).copied().collect();
        for relation in links {
            self.remove_relation(relation);
        }
        let (owner, key) = {
            let op = self.operation(operation);
            (op.owner, op.key())
        };
        let component = self.component_mut(owner);
        component.operations.shift_remove(&key);
        if component.entry_operation == Some(operation) {
            component.entry_operation = None;
        }
        if component.exit_operation == Some(operation) {
            component.exit_operation = None;
        }
        self.entry_tags.shift_remove(&operation);
        self.nodes[operation.index()] = None;
    }

    /// Operation nodes directly feeding `operation`.
    pub fn operation_parents(&self, operation: NodeHandle) -> impl Iterator<Item = NodeHandle> + '_ {
        self.node(operation)
            .inlinks
            .iter()
            .map(|&rel| self.relation(rel).from)
            .filter(|&from| self.node(from).is_operation())
    }

    // ------------------------------------------------------------------------
    // Entry tags
    // ------------------------------------------------------------------------

    /// Remember `operation` as a starting point of the next flush.
    pub fn add_entry_tag(&mut self, operation: NodeHandle) {
        self.entry_tags.insert(operation);
    }

    /// Operations the next flush starts from, in tagging order.
    pub fn entry_tags(&self) -> impl Iterator<Item = NodeHandle> + '_ {
        self.entry_tags.iter().copied()
    }

    /// Whether anything is waiting to be flushed.
    pub fn has_entry_tags(&self) -> bool {
        !self.entry_tags.is_empty()
    }

    pub(crate) fn clear_entry_tags(&mut self) {
        self.entry_tags.clear();
    }

    // ------------------------------------------------------------------------
    // Whole-graph operations
    // ------------------------------------------------------------------------

    /// Drop every node and relation, ahead of a rebuild.
    pub(crate) fn clear_all_nodes(&mut self) {
        self.nodes.clear();
        self.relations.clear();
        self.id_nodes.clear();
        self.time_source = None;
        self.entry_tags.clear();
    }

    /// Evaluated snapshot of a datablock, if it has an expanded one.
    pub fn evaluated_snapshot(&self, uuid: SessionUuid) -> Option<&Datablock> {
        let id = self.find_id_node(uuid)?;
        let node = self.id_node(id);
        if node.is_cow_expanded() {
            node.id_cow.as_ref()
        } else {
            None
        }
    }

    /// Whether a datablock of this type was updated by the last flush.
    pub fn id_type_was_updated(&self, id_type: IdType) -> bool {
        self.id_type_updated & (1 << id_type.index()) != 0
    }

    /// Node and relation counts.
    pub fn stats(&self) -> GraphStats {
        let mut stats = GraphStats {
            ids: self.id_nodes.len(),
            ..GraphStats::default()
        };
        for node in self.nodes.iter().flatten() {
            if node.as_component().is_some() {
                stats.components += 1;
            } else if node.is_operation() {
                stats.operations += 1;
            }
        }
        for relation in self.relations.iter().flatten() {
            stats.relations += 1;
            if relation.is_cyclic() {
                stats.cyclic_relations += 1;
            }
        }
        stats
    }
}

impl std::fmt::Debug for Depsgraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Depsgraph")
            .field("main_id", &self.main_id)
            .field("scene", &self.scene)
            .field("view_layer", &self.view_layer)
            .field("stats", &self.stats())
            .field("entry_tags", &self.entry_tags.len())
            .field("is_active", &self.is_active)
            .finish()
    }
}
