//! Node Builder
//!
//! First build pass: walks the scene and creates the ID, component and
//! operation nodes, each operation wired to its evaluation callback.
//!
//! # Traversal
//!
//! Every `build_*` function is memoized through a [`BuilderMap`]. A datablock
//! reached a second time is not rebuilt, but the visit still accumulates
//! linked state and visibility onto its ID node.
//!
//! # Snapshots
//!
//! ID nodes of types needing copy-on-write get their snapshot from the
//! [`GraphSummary`] of the previous build when there is one, and a fresh
//! placeholder otherwise.

use tracing::{debug, debug_span, warn};

use super::{BuilderMap, BuilderTags, GraphSummary};
use crate::config::DebugFlags;
use crate::eval::cow::copy_on_write_is_needed;
use crate::graph::Depsgraph;
use crate::node::{LinkedState, NodeHandle, NodeType, OperationCode, OperationFlags, OperationIdKey};
use crate::scene::{BaseFlags, Datablock, IdData, IdPtr, IdType, Main, SessionUuid};

/// First pass of graph building.
pub struct DepsgraphNodeBuilder<'a> {
    graph: &'a mut Depsgraph,
    main: &'a Main,
    summary: &'a GraphSummary,
    built_map: BuilderMap,
}

impl<'a> DepsgraphNodeBuilder<'a> {
    pub fn new(graph: &'a mut Depsgraph, main: &'a Main, summary: &'a GraphSummary) -> Self {
        Self {
            graph,
            main,
            summary,
            built_map: BuilderMap::new(),
        }
    }

    fn lookup_miss(&self, uuid: SessionUuid, what: &str) {
        if self.graph.config().debug.contains(DebugFlags::BUILD) {
            warn!(?uuid, what, "referenced datablock not found");
        } else {
            debug!(?uuid, what, "referenced datablock not found");
        }
    }

    // ------------------------------------------------------------------------
    // Node creation
    // ------------------------------------------------------------------------

    /// Find or create the ID node of a datablock.
    ///
    /// Types needing copy-on-write get a copy-on-write component and a
    /// visibility component, each with one pinned operation.
    pub fn add_id_node(&mut self, datablock: &Datablock) -> NodeHandle {
        let uuid = datablock.session_uuid;
        if let Some(existing) = self.graph.find_id_node(uuid) {
            return existing;
        }
        let id_type = datablock.id_type();
        let saved = self.summary.saved(uuid);
        let id_cow = copy_on_write_is_needed(id_type).then(|| {
            saved
                .and_then(|state| state.id_cow.clone())
                .unwrap_or_else(|| Datablock::placeholder(id_type, uuid))
        });
        let id = self
            .graph
            .add_id_node(&datablock.prefixed_name(), uuid, id_type, id_cow);
        if let Some(state) = saved {
            self.graph.id_node_mut(id).previously_visible_components_mask =
                state.previously_visible_components_mask;
        }

        if copy_on_write_is_needed(id_type) {
            for (node_type, opcode) in [
                (NodeType::CopyOnWrite, OperationCode::CopyOnWrite),
                (NodeType::Visibility, OperationCode::Visibility),
            ] {
                let operation =
                    self.add_operation_node(id, node_type, "", OperationIdKey::from_opcode(opcode));
                self.graph.operation_mut(operation).flag |= OperationFlags::PINNED;
            }
        }
        id
    }

    /// Create an operation, failing loudly when it already exists.
    ///
    /// # Panics
    ///
    /// Panics when an operation with the same identity exists in the
    /// component. Use [`ensure_operation_node`](Self::ensure_operation_node)
    /// for lookup-or-create.
    pub fn add_operation_node(
        &mut self,
        id: NodeHandle,
        node_type: NodeType,
        component_name: &str,
        key: OperationIdKey,
    ) -> NodeHandle {
        let component = self.graph.ensure_component(id, node_type, component_name);
        let callback = self.graph.callbacks.resolve(key.opcode);
        self.graph.add_operation(component, key, callback)
    }

    pub fn find_operation_node(
        &self,
        id: NodeHandle,
        node_type: NodeType,
        component_name: &str,
        key: &OperationIdKey,
    ) -> Option<NodeHandle> {
        let component = self.graph.id_node(id).find_component(node_type, component_name)?;
        self.graph.component(component).find_operation(key)
    }

    pub fn has_operation_node(
        &self,
        id: NodeHandle,
        node_type: NodeType,
        component_name: &str,
        key: &OperationIdKey,
    ) -> bool {
        self.find_operation_node(id, node_type, component_name, key)
            .is_some()
    }

    pub fn ensure_operation_node(
        &mut self,
        id: NodeHandle,
        node_type: NodeType,
        component_name: &str,
        key: OperationIdKey,
    ) -> NodeHandle {
        match self.find_operation_node(id, node_type, component_name, &key) {
            Some(existing) => existing,
            None => self.add_operation_node(id, node_type, component_name, key),
        }
    }

    /// Create a chain of operations in one component, the first as entry
    /// and the last as exit.
    fn add_staged_component(
        &mut self,
        id: NodeHandle,
        node_type: NodeType,
        component_name: &str,
        stages: &[OperationCode],
    ) {
        let operations: Vec<NodeHandle> = stages
            .iter()
            .map(|&opcode| {
                self.ensure_operation_node(id, node_type, component_name, OperationIdKey::from_opcode(opcode))
            })
            .collect();
        let component = self.graph.ensure_component(id, node_type, component_name);
        if let (Some(&entry), Some(&exit)) = (operations.first(), operations.last()) {
            self.graph.set_entry_operation(component, entry);
            self.graph.set_exit_operation(component, exit);
        }
    }

    // ------------------------------------------------------------------------
    // Scene
    // ------------------------------------------------------------------------

    /// Build everything the view layer of a scene needs.
    pub fn build_view_layer(&mut self, scene: SessionUuid, view_layer: &str) {
        let _span = debug_span!("build_nodes").entered();
        self.graph.ensure_time_source();
        self.build_scene(scene, view_layer, LinkedState::Directly);
    }

    fn build_scene(&mut self, uuid: SessionUuid, view_layer: &str, linked_state: LinkedState) {
        let main = self.main;
        let Some(datablock) = main.get(uuid) else {
            self.lookup_miss(uuid, "scene");
            return;
        };
        let Some(scene) = datablock.as_scene() else {
            return;
        };
        if self.built_map.check_is_built_and_tag(uuid, BuilderTags::COMPLETE) {
            return;
        }
        let id = self.add_id_node(datablock);
        {
            let node = self.graph.id_node_mut(id);
            node.link(linked_state);
            node.is_directly_visible = true;
        }
        self.build_parameters(datablock);
        self.add_staged_component(id, NodeType::LayerCollections, "", &[OperationCode::ViewLayerEval]);
        self.build_animdata(datablock);

        if let Some(layer) = scene.view_layer(view_layer) {
            for base in &layer.bases {
                let visible = base.flags.contains(BaseFlags::VISIBLE);
                self.build_object(base.object.uuid(), linked_state, visible, true);
            }
        }
        if let Some(collection) = scene.master_collection {
            self.build_collection(collection.uuid());
        }
        if let Some(set) = scene.background_set {
            self.build_background_set(set.uuid());
        }
    }

    /// Objects of a background set scene are linked via the set.
    fn build_background_set(&mut self, uuid: SessionUuid) {
        let main = self.main;
        let Some(scene) = main.get(uuid).and_then(Datablock::as_scene) else {
            self.lookup_miss(uuid, "background set");
            return;
        };
        let Some(layer) = scene.view_layers.first() else {
            return;
        };
        self.build_scene(uuid, &layer.name, LinkedState::ViaSet);
    }

    // ------------------------------------------------------------------------
    // Objects
    // ------------------------------------------------------------------------

    /// Build an object.
    ///
    /// `from_base` is set when the object is built for a base of the view
    /// layer, which gives it base flag evaluation.
    pub fn build_object(
        &mut self,
        uuid: SessionUuid,
        linked_state: LinkedState,
        is_visible: bool,
        from_base: bool,
    ) {
        let main = self.main;
        let Some(datablock) = main.get(uuid) else {
            self.lookup_miss(uuid, "object");
            return;
        };
        let Some(object) = datablock.as_object() else {
            return;
        };

        if self.built_map.check_is_built_and_tag(uuid, BuilderTags::COMPLETE) {
            if let Some(id) = self.graph.find_id_node(uuid) {
                let node = self.graph.id_node_mut(id);
                node.link(linked_state);
                node.is_directly_visible |= is_visible;
                if from_base {
                    self.build_object_flags(id);
                }
            }
            return;
        }

        let id = self.add_id_node(datablock);
        {
            let node = self.graph.id_node_mut(id);
            node.link(linked_state);
            node.is_directly_visible = is_visible;
        }

        self.build_object_from_layer(id);
        if from_base {
            self.build_object_flags(id);
        }
        self.build_object_transform(id, object.parent.is_some());
        if let Some(parent) = object.parent {
            self.build_object(parent.uuid(), LinkedState::Indirectly, is_visible, false);
        }
        for modifier in &object.modifiers {
            if let Some(target) = modifier.target {
                self.build_id(target);
            }
        }
        if let Some(data) = object.data {
            self.build_object_data(id, data);
        }
        self.build_parameters(datablock);
        self.build_animdata(datablock);
        self.add_operation_node(
            id,
            NodeType::Synchronization,
            "",
            OperationIdKey::from_opcode(OperationCode::SynchronizeToOriginal),
        );
    }

    fn build_object_from_layer(&mut self, id: NodeHandle) {
        self.add_staged_component(
            id,
            NodeType::ObjectFromLayer,
            "",
            &[OperationCode::ObjectFromLayerEntry, OperationCode::ObjectFromLayerExit],
        );
    }

    fn build_object_flags(&mut self, id: NodeHandle) {
        self.ensure_operation_node(
            id,
            NodeType::ObjectFromLayer,
            "",
            OperationIdKey::from_opcode(OperationCode::ObjectBaseFlags),
        );
    }

    fn build_object_transform(&mut self, id: NodeHandle, has_parent: bool) {
        let mut stages = vec![OperationCode::TransformInit, OperationCode::TransformLocal];
        if has_parent {
            stages.push(OperationCode::TransformParent);
        }
        stages.extend([OperationCode::TransformEval, OperationCode::TransformFinal]);
        self.add_staged_component(id, NodeType::Transform, "", &stages);
    }

    fn build_object_data(&mut self, object: NodeHandle, data: IdPtr) {
        let main = self.main;
        let Some(datablock) = main.get(data.uuid()) else {
            self.lookup_miss(data.uuid(), "object data");
            return;
        };
        match &datablock.data {
            IdData::Mesh(_) => {
                self.build_mesh(datablock);
                self.add_staged_component(
                    object,
                    NodeType::Geometry,
                    "",
                    &[
                        OperationCode::GeometryEvalInit,
                        OperationCode::GeometryEval,
                        OperationCode::GeometryEvalDone,
                    ],
                );
            }
            IdData::Armature(_) => {
                self.build_armature(datablock);
                self.build_rig(object, datablock);
            }
            _ => debug!(data = %datablock.prefixed_name(), "object data has no evaluation"),
        }
    }

    /// Pose sub-graph of an armature object.
    ///
    /// The pose component brackets one component per bone:
    ///
    /// ```text
    /// POSE_INIT -> POSE_INIT_IK -> [bones] -> POSE_CLEANUP -> POSE_DONE
    /// bone:        BONE_LOCAL -> BONE_POSE_PARENT -> BONE_READY -> BONE_DONE
    /// ```
    fn build_rig(&mut self, object: NodeHandle, armature: &Datablock) {
        self.add_staged_component(
            object,
            NodeType::EvalPose,
            "",
            &[
                OperationCode::PoseInit,
                OperationCode::PoseInitIk,
                OperationCode::PoseCleanup,
                OperationCode::PoseDone,
            ],
        );
        let Some(armature) = armature.as_armature() else {
            return;
        };
        for bone in &armature.bones {
            self.add_staged_component(
                object,
                NodeType::Bone,
                &bone.name,
                &[
                    OperationCode::BoneLocal,
                    OperationCode::BonePoseParent,
                    OperationCode::BoneReady,
                    OperationCode::BoneDone,
                ],
            );
        }
    }

    // ------------------------------------------------------------------------
    // Other datablocks
    // ------------------------------------------------------------------------

    /// Build whatever a reference points at.
    pub fn build_id(&mut self, ptr: IdPtr) {
        let uuid = ptr.uuid();
        let main = self.main;
        let Some(datablock) = main.get(uuid) else {
            self.lookup_miss(uuid, "reference");
            return;
        };
        match datablock.id_type() {
            IdType::Object => self.build_object(uuid, LinkedState::Indirectly, false, false),
            IdType::Mesh => self.build_mesh(datablock),
            IdType::Armature => self.build_armature(datablock),
            IdType::Collection => self.build_collection(uuid),
            IdType::Action => self.build_action(datablock),
            IdType::Image => self.build_image(datablock),
            IdType::Scene => {
                if let Some(layer) = datablock.as_scene().and_then(|scene| scene.view_layers.first()) {
                    let name = layer.name.clone();
                    self.build_scene(uuid, &name, LinkedState::Indirectly);
                }
            }
        }
    }

    fn build_mesh(&mut self, datablock: &Datablock) {
        if self
            .built_map
            .check_is_built_and_tag(datablock.session_uuid, BuilderTags::COMPLETE)
        {
            return;
        }
        let id = self.add_id_node(datablock);
        self.add_staged_component(
            id,
            NodeType::Geometry,
            "",
            &[
                OperationCode::GeometryEvalInit,
                OperationCode::GeometryEval,
                OperationCode::GeometryEvalDone,
            ],
        );
        self.build_parameters(datablock);
        self.build_animdata(datablock);
    }

    fn build_armature(&mut self, datablock: &Datablock) {
        if self
            .built_map
            .check_is_built_and_tag(datablock.session_uuid, BuilderTags::COMPLETE)
        {
            return;
        }
        self.add_id_node(datablock);
        self.build_parameters(datablock);
        self.build_animdata(datablock);
    }

    fn build_image(&mut self, datablock: &Datablock) {
        if self
            .built_map
            .check_is_built_and_tag(datablock.session_uuid, BuilderTags::COMPLETE)
        {
            return;
        }
        self.add_id_node(datablock);
        self.build_parameters(datablock);
    }

    /// Collections are containers: building one builds its objects and
    /// child collections.
    pub fn build_collection(&mut self, uuid: SessionUuid) {
        let main = self.main;
        let Some(datablock) = main.get(uuid) else {
            self.lookup_miss(uuid, "collection");
            return;
        };
        let Some(collection) = datablock.as_collection() else {
            return;
        };
        if self.built_map.check_is_built_and_tag(uuid, BuilderTags::COMPLETE) {
            return;
        }
        self.add_id_node(datablock);
        self.build_parameters(datablock);
        for object in &collection.objects {
            self.build_object(object.uuid(), LinkedState::Indirectly, false, false);
        }
        for child in &collection.children {
            self.build_collection(child.uuid());
        }
    }

    fn build_action(&mut self, datablock: &Datablock) {
        if self
            .built_map
            .check_is_built_and_tag(datablock.session_uuid, BuilderTags::COMPLETE)
        {
            return;
        }
        let id = self.add_id_node(datablock);
        self.add_staged_component(id, NodeType::Animation, "", &[OperationCode::AnimationEval]);
    }

    // ------------------------------------------------------------------------
    // Generic per-datablock components
    // ------------------------------------------------------------------------

    pub fn build_parameters(&mut self, datablock: &Datablock) {
        let uuid = datablock.session_uuid;
        if self.built_map.check_is_built_and_tag(uuid, BuilderTags::PARAMETERS) {
            return;
        }
        let Some(id) = self.graph.find_id_node(uuid) else {
            return;
        };
        self.add_staged_component(
            id,
            NodeType::Parameters,
            "",
            &[
                OperationCode::ParametersEntry,
                OperationCode::ParametersEval,
                OperationCode::ParametersExit,
            ],
        );
    }

    /// Animation and drivers of a datablock.
    pub fn build_animdata(&mut self, datablock: &Datablock) {
        let uuid = datablock.session_uuid;
        let Some(anim) = &datablock.anim else {
            return;
        };
        if self.built_map.check_is_built_and_tag(uuid, BuilderTags::ANIMATION) {
            return;
        }
        let Some(id) = self.graph.find_id_node(uuid) else {
            return;
        };

        if let Some(action) = anim.action {
            self.build_id(action);
            self.add_staged_component(
                id,
                NodeType::Animation,
                "",
                &[
                    OperationCode::AnimationEntry,
                    OperationCode::AnimationEval,
                    OperationCode::AnimationExit,
                ],
            );
        }

        for driver in &anim.drivers {
            let name_tag = i32::try_from(driver.array_index).unwrap_or(i32::MAX);
            self.ensure_operation_node(
                id,
                NodeType::Parameters,
                "",
                OperationIdKey::new(OperationCode::Driver, driver.rna_path.clone(), name_tag),
            );
            for variable in &driver.variables {
                self.build_id(variable.target);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests_support::empty_graph;
    use crate::scene::{Mesh, Object};

    #[test]
    fn add_id_node_creates_pinned_copy_on_write() {
        let mut graph = empty_graph();
        let main_handle = graph.main().clone();
        let main = main_handle.read();
        let summary = GraphSummary::default();
        let mesh = Datablock::mesh("Cube", Mesh::default());

        let mut builder = DepsgraphNodeBuilder::new(&mut graph, &main, &summary);
        let id = builder.add_id_node(&mesh);
        assert_eq!(builder.add_id_node(&mesh), id);

        let node = graph.id_node(id);
        assert!(node.id_cow.is_some());
        assert!(!node.is_cow_expanded());
        for node_type in [NodeType::CopyOnWrite, NodeType::Visibility] {
            let component = node.find_component(node_type, "").unwrap();
            let op = graph.component(component).entry().unwrap();
            assert!(graph.operation(op).flag.contains(OperationFlags::PINNED));
        }
        let cow = node.find_component(NodeType::CopyOnWrite, "").unwrap();
        let op = graph.component(cow).entry().unwrap();
        assert!(graph.operation(op).evaluate.is_some());
    }

    #[test]
    fn images_have_no_snapshot() {
        let mut graph = empty_graph();
        let main_handle = graph.main().clone();
        let main = main_handle.read();
        let summary = GraphSummary::default();
        let image = Datablock::image("Grid", Default::default());
        let mut builder = DepsgraphNodeBuilder::new(&mut graph, &main, &summary);
        let id = builder.add_id_node(&image);
        assert!(graph.id_node(id).id_cow.is_none());
        assert!(graph.id_node(id).components.is_empty());
    }

    #[test]
    #[should_panic(expected = "already exists")]
    fn add_operation_node_rejects_duplicates() {
        let mut graph = empty_graph();
        let main_handle = graph.main().clone();
        let main = main_handle.read();
        let summary = GraphSummary::default();
        let object = Datablock::object("Cube", Object::default());
        let mut builder = DepsgraphNodeBuilder::new(&mut graph, &main, &summary);
        let id = builder.add_id_node(&object);
        let key = OperationIdKey::from_opcode(OperationCode::TransformLocal);
        builder.add_operation_node(id, NodeType::Transform, "", key.clone());
        builder.add_operation_node(id, NodeType::Transform, "", key);
    }

    #[test]
    fn ensure_operation_node_is_idempotent() {
        let mut graph = empty_graph();
        let main_handle = graph.main().clone();
        let main = main_handle.read();
        let summary = GraphSummary::default();
        let object = Datablock::object("Cube", Object::default());
        let mut builder = DepsgraphNodeBuilder::new(&mut graph, &main, &summary);
        let id = builder.add_id_node(&object);
        let key = OperationIdKey::from_opcode(OperationCode::TransformLocal);
        let first = builder.ensure_operation_node(id, NodeType::Transform, "", key.clone());
        let second = builder.ensure_operation_node(id, NodeType::Transform, "", key.clone());
        assert_eq!(first, second);
        assert!(builder.has_operation_node(id, NodeType::Transform, "", &key));
    }

    #[test]
    fn salvaged_snapshot_is_reused() {
        let mut graph = empty_graph();
        let main_handle = graph.main().clone();
        let main = main_handle.read();
        let object = Datablock::object("Cube", Object::default());
        let mut snapshot = object.clone();
        snapshot.runtime.is_cow = true;
        snapshot.runtime.expanded = true;

        let mut summary = GraphSummary::default();
        summary.ids.insert(
            object.session_uuid,
            super::super::SavedIdState {
                id_cow: Some(snapshot.clone()),
                previously_visible_components_mask: 0b11,
            },
        );
        let mut builder = DepsgraphNodeBuilder::new(&mut graph, &main, &summary);
        let id = builder.add_id_node(&object);
        let node = graph.id_node(id);
        assert_eq!(node.id_cow.as_ref(), Some(&snapshot));
        assert!(node.is_cow_expanded());
        assert_eq!(node.previously_visible_components_mask, 0b11);
    }
}
