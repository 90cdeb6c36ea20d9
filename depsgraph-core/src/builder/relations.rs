//! Relation Builder
//!
//! Second build pass: walks the same scene as the node builder and adds the
//! relations between operations. Nodes are addressed through keys, so a
//! relation between nodes the first pass did not create is dropped with a
//! diagnostic instead of failing.
//!
//! # Copy-On-Write Fan-In
//!
//! Once the scene is walked, every datablock with an evaluated snapshot gets
//! a relation from its copy-on-write operation into each other component.
//! These relations order evaluation but do not flush, except into the
//! parameters and view layer components whose updates must cross the
//! snapshot boundary.

use std::sync::Arc;

use tracing::{debug, debug_span, warn};

use super::keys::{ComponentKey, OperationKey, RelationKey, TimeSourceKey};
use super::rna::{PropertyResolver, RnaPointerSource, RnaTarget};
use super::{BuilderMap, BuilderTags};
use crate::config::DebugFlags;
use crate::graph::Depsgraph;
use crate::node::{NodeHandle, NodeType, OperationCode, RelationFlags, RelationHandle};
use crate::scene::{Datablock, Driver, IdData, IdPtr, IdType, Main, SessionUuid};

const TRANSFORM_STAGES: [OperationCode; 4] = [
    OperationCode::TransformInit,
    OperationCode::TransformLocal,
    OperationCode::TransformEval,
    OperationCode::TransformFinal,
];

const GEOMETRY_STAGES: [OperationCode; 3] = [
    OperationCode::GeometryEvalInit,
    OperationCode::GeometryEval,
    OperationCode::GeometryEvalDone,
];

const BONE_STAGES: [OperationCode; 4] = [
    OperationCode::BoneLocal,
    OperationCode::BonePoseParent,
    OperationCode::BoneReady,
    OperationCode::BoneDone,
];

/// Second pass of graph building.
pub struct DepsgraphRelationBuilder<'a> {
    graph: &'a mut Depsgraph,
    main: &'a Main,
    resolver: Arc<dyn PropertyResolver>,
    built_map: BuilderMap,
}

impl<'a> DepsgraphRelationBuilder<'a> {
    pub fn new(graph: &'a mut Depsgraph, main: &'a Main) -> Self {
        let resolver = Arc::clone(&graph.resolver);
        Self {
            graph,
            main,
            resolver,
            built_map: BuilderMap::new(),
        }
    }

    // ------------------------------------------------------------------------
    // Relation primitives
    // ------------------------------------------------------------------------

    /// Add a relation between the nodes two keys resolve to.
    ///
    /// Returns `None` without touching the graph when either end is missing.
    pub fn add_relation<F, T>(
        &mut self,
        from: &F,
        to: &T,
        description: &str,
        flags: RelationFlags,
    ) -> Option<RelationHandle>
    where
        F: RelationKey + ?Sized,
        T: RelationKey + ?Sized,
    {
        match (from.find_from(self.graph), to.find_to(self.graph)) {
            (Some(from_node), Some(to_node)) => {
                Some(self.graph.add_relation(from_node, to_node, description, flags))
            }
            (from_node, to_node) => {
                if self.graph.config().debug.contains(DebugFlags::BUILD) {
                    warn!(
                        %from,
                        %to,
                        description,
                        from_found = from_node.is_some(),
                        to_found = to_node.is_some(),
                        "skipping relation between missing nodes"
                    );
                } else {
                    debug!(%from, %to, description, "skipping relation between missing nodes");
                }
                None
            }
        }
    }

    fn has_component(&self, key: &ComponentKey) -> bool {
        key.find(self.graph).is_some()
    }

    fn has_operation(&self, key: &OperationKey) -> bool {
        key.find(self.graph).is_some()
    }

    /// Chain consecutive stages of one component.
    fn add_chain(&mut self, uuid: SessionUuid, node_type: NodeType, component_name: &str, stages: &[OperationCode]) {
        for pair in stages.windows(2) {
            let from = OperationKey::in_component(uuid, node_type, component_name, pair[0]);
            let to = OperationKey::in_component(uuid, node_type, component_name, pair[1]);
            let description = format!("{} -> {}", pair[0], pair[1]);
            self.add_relation(&from, &to, &description, RelationFlags::empty());
        }
    }

    /// Order `to` after the evaluated snapshot of `uuid` exists, without
    /// letting updates of the snapshot flow into it.
    fn add_cow_ordering<T: RelationKey>(&mut self, uuid: SessionUuid, to: &T, description: &str) {
        let cow = OperationKey::new(uuid, NodeType::CopyOnWrite, OperationCode::CopyOnWrite);
        if !self.has_operation(&cow) {
            return;
        }
        self.add_relation(
            &cow,
            to,
            description,
            RelationFlags::NO_FLUSH | RelationFlags::CHECK_BEFORE_ADD,
        );
    }

    // ------------------------------------------------------------------------
    // Scene
    // ------------------------------------------------------------------------

    pub fn build_view_layer(&mut self, scene: SessionUuid, view_layer: &str) {
        let _span = debug_span!("build_relations").entered();
        self.build_scene(scene, view_layer);
        self.build_copy_on_write_relations();
    }

    fn build_scene(&mut self, uuid: SessionUuid, view_layer: &str) {
        let main = self.main;
        let Some(datablock) = main.get(uuid) else {
            return;
        };
        let Some(scene) = datablock.as_scene() else {
            return;
        };
        if self.built_map.check_is_built_and_tag(uuid, BuilderTags::COMPLETE) {
            return;
        }
        self.build_parameters(datablock);
        let view_layer_eval = OperationKey::new(uuid, NodeType::LayerCollections, OperationCode::ViewLayerEval);
        self.add_relation(
            &ComponentKey::new(uuid, NodeType::Parameters),
            &view_layer_eval,
            "Scene Parameters -> View Layer",
            RelationFlags::empty(),
        );
        self.build_animdata(datablock);

        if let Some(layer) = scene.view_layer(view_layer) {
            for base in &layer.bases {
                let object = base.object.uuid();
                self.build_object(object);
                self.add_relation(
                    &view_layer_eval,
                    &OperationKey::new(object, NodeType::ObjectFromLayer, OperationCode::ObjectFromLayerEntry),
                    "View Layer -> Object From Layer",
                    RelationFlags::CHECK_BEFORE_ADD,
                );
            }
        }
        if let Some(collection) = scene.master_collection {
            self.build_collection(collection.uuid());
        }
        if let Some(set) = scene.background_set {
            let set_layer = main
                .get(set.uuid())
                .and_then(Datablock::as_scene)
                .and_then(|scene| scene.view_layers.first())
                .map(|layer| layer.name.clone());
            if let Some(set_layer) = set_layer {
                self.build_scene(set.uuid(), &set_layer);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Objects
    // ------------------------------------------------------------------------

    pub fn build_object(&mut self, uuid: SessionUuid) {
        let main = self.main;
        let Some(datablock) = main.get(uuid) else {
            return;
        };
        let Some(object) = datablock.as_object() else {
            return;
        };
        if self.built_map.check_is_built_and_tag(uuid, BuilderTags::COMPLETE) {
            return;
        }

        self.build_object_transform(uuid, object.parent.is_some());
        self.build_object_from_layer(uuid);

        if let Some(parent) = object.parent {
            self.build_object(parent.uuid());
            self.add_relation(
                &ComponentKey::new(parent.uuid(), NodeType::Transform),
                &OperationKey::new(uuid, NodeType::Transform, OperationCode::TransformParent),
                "Parent Transform -> Child Transform",
                RelationFlags::empty(),
            );
        }
        for modifier in &object.modifiers {
            if let Some(target) = modifier.target {
                self.build_id(target);
                self.build_modifier_target(uuid, &modifier.name, target.uuid());
            }
        }
        if let Some(data) = object.data {
            self.build_object_data(uuid, data);
        }
        self.build_parameters(datablock);
        self.build_animdata(datablock);
        self.build_synchronization(uuid);
    }

    fn build_object_transform(&mut self, uuid: SessionUuid, has_parent: bool) {
        let mut stages = TRANSFORM_STAGES.to_vec();
        if has_parent {
            stages.insert(2, OperationCode::TransformParent);
        }
        self.add_chain(uuid, NodeType::Transform, "", &stages);
        self.add_relation(
            &ComponentKey::new(uuid, NodeType::Parameters),
            &OperationKey::new(uuid, NodeType::Transform, OperationCode::TransformInit),
            "Object Parameters -> Transform",
            RelationFlags::empty(),
        );
    }

    fn build_object_from_layer(&mut self, uuid: SessionUuid) {
        let base_flags = OperationKey::new(uuid, NodeType::ObjectFromLayer, OperationCode::ObjectBaseFlags);
        if self.has_operation(&base_flags) {
            self.add_chain(
                uuid,
                NodeType::ObjectFromLayer,
                "",
                &[
                    OperationCode::ObjectFromLayerEntry,
                    OperationCode::ObjectBaseFlags,
                    OperationCode::ObjectFromLayerExit,
                ],
            );
        } else {
            self.add_chain(
                uuid,
                NodeType::ObjectFromLayer,
                "",
                &[OperationCode::ObjectFromLayerEntry, OperationCode::ObjectFromLayerExit],
            );
        }
    }

    /// Relations from an object a modifier references into the geometry of
    /// the modifier's owner.
    fn build_modifier_target(&mut self, owner: SessionUuid, modifier: &str, target: SessionUuid) {
        let geometry = ComponentKey::new(owner, NodeType::Geometry);
        if !self.has_component(&geometry) {
            debug!(modifier, "modifier owner has no geometry");
            return;
        }
        let main = self.main;
        let Some(datablock) = main.get(target) else {
            return;
        };
        if datablock.id_type() != IdType::Object {
            self.add_relation(
                &ComponentKey::new(target, NodeType::Parameters),
                &geometry,
                "Modifier Target -> Geometry",
                RelationFlags::empty(),
            );
            return;
        }
        self.add_relation(
            &ComponentKey::new(target, NodeType::Transform),
            &geometry,
            "Modifier Target Transform -> Geometry",
            RelationFlags::empty(),
        );
        let target_geometry = ComponentKey::new(target, NodeType::Geometry);
        if self.has_component(&target_geometry) {
            self.add_relation(
                &target_geometry,
                &geometry,
                "Modifier Target Geometry -> Geometry",
                RelationFlags::empty(),
            );
        }
        self.add_relation(
            &ComponentKey::new(target, NodeType::Visibility),
            &geometry,
            "Modifier Target Visibility -> Geometry",
            RelationFlags::empty(),
        );
    }

    fn build_object_data(&mut self, object: SessionUuid, data: IdPtr) {
        let main = self.main;
        let Some(datablock) = main.get(data.uuid()) else {
            return;
        };
        match &datablock.data {
            IdData::Mesh(_) => {
                self.build_mesh(datablock);
                self.add_chain(object, NodeType::Geometry, "", &GEOMETRY_STAGES);
                let geometry = ComponentKey::new(object, NodeType::Geometry);
                self.add_relation(
                    &ComponentKey::new(data.uuid(), NodeType::Geometry),
                    &geometry,
                    "Object Data Geometry -> Object Geometry",
                    RelationFlags::empty(),
                );
                self.add_relation(
                    &OperationKey::new(object, NodeType::Visibility, OperationCode::Visibility),
                    &geometry,
                    "Visibility -> Geometry",
                    RelationFlags::empty(),
                );
                self.add_relation(
                    &OperationKey::new(data.uuid(), NodeType::CopyOnWrite, OperationCode::CopyOnWrite),
                    &OperationKey::new(object, NodeType::CopyOnWrite, OperationCode::CopyOnWrite),
                    "Object Data CoW -> Object CoW",
                    RelationFlags::NO_FLUSH | RelationFlags::GODMODE,
                );
            }
            IdData::Armature(_) => {
                self.build_armature(datablock);
                self.build_rig(object, datablock);
            }
            _ => {}
        }
    }

    /// Pose relations of an armature object.
    ///
    /// Every bone waits for the pose initialization and for the done stage
    /// of its parent bone, and pose cleanup waits for every bone.
    fn build_rig(&mut self, object: SessionUuid, armature: &Datablock) {
        let pose_init = OperationKey::new(object, NodeType::EvalPose, OperationCode::PoseInit);
        let pose_init_ik = OperationKey::new(object, NodeType::EvalPose, OperationCode::PoseInitIk);
        let pose_cleanup = OperationKey::new(object, NodeType::EvalPose, OperationCode::PoseCleanup);
        let pose_done = OperationKey::new(object, NodeType::EvalPose, OperationCode::PoseDone);

        self.add_relation(&pose_init, &pose_init_ik, "Pose Init -> Pose Init IK", RelationFlags::empty());
        self.add_relation(&pose_cleanup, &pose_done, "Pose Cleanup -> Pose Done", RelationFlags::empty());
        self.add_relation(
            &ComponentKey::new(armature.session_uuid, NodeType::Parameters),
            &pose_init,
            "Armature Parameters -> Pose Init",
            RelationFlags::empty(),
        );
        self.add_relation(
            &ComponentKey::new(object, NodeType::Transform),
            &pose_init,
            "Transform -> Pose Init",
            RelationFlags::empty(),
        );
        self.add_relation(
            &OperationKey::new(object, NodeType::Visibility, OperationCode::Visibility),
            &pose_init,
            "Visibility -> Pose Init",
            RelationFlags::empty(),
        );

        let Some(armature) = armature.as_armature() else {
            return;
        };
        if armature.bones.is_empty() {
            self.add_relation(&pose_init_ik, &pose_cleanup, "Pose Init IK -> Pose Cleanup", RelationFlags::empty());
        }
        for bone in &armature.bones {
            let name = bone.name.as_str();
            self.add_chain(object, NodeType::Bone, name, &BONE_STAGES);
            self.add_relation(
                &pose_init_ik,
                &OperationKey::in_component(object, NodeType::Bone, name, OperationCode::BoneLocal),
                "Pose Init IK -> Bone Local",
                RelationFlags::empty(),
            );
            if let Some(parent) = bone.parent.as_deref() {
                if armature.find_bone(parent).is_some() {
                    self.add_relation(
                        &OperationKey::in_component(object, NodeType::Bone, parent, OperationCode::BoneDone),
                        &OperationKey::in_component(object, NodeType::Bone, name, OperationCode::BonePoseParent),
                        "Parent Bone -> Child Bone",
                        RelationFlags::empty(),
                    );
                }
            }
            self.add_relation(
                &OperationKey::in_component(object, NodeType::Bone, name, OperationCode::BoneDone),
                &pose_cleanup,
                "Bone Done -> Pose Cleanup",
                RelationFlags::empty(),
            );
        }
    }

    fn build_synchronization(&mut self, uuid: SessionUuid) {
        let sync = OperationKey::new(uuid, NodeType::Synchronization, OperationCode::SynchronizeToOriginal);
        for node_type in [NodeType::Transform, NodeType::Geometry, NodeType::EvalPose, NodeType::ObjectFromLayer] {
            let source = ComponentKey::new(uuid, node_type);
            if self.has_component(&source) {
                let description = format!("{} -> Synchronize to Original", node_type.name());
                self.add_relation(&source, &sync, &description, RelationFlags::empty());
            }
        }
    }

    // ------------------------------------------------------------------------
    // Other datablocks
    // ------------------------------------------------------------------------

    pub fn build_id(&mut self, ptr: IdPtr) {
        let uuid = ptr.uuid();
        let main = self.main;
        let Some(datablock) = main.get(uuid) else {
            return;
        };
        match datablock.id_type() {
            IdType::Object => self.build_object(uuid),
            IdType::Mesh => self.build_mesh(datablock),
            IdType::Armature => self.build_armature(datablock),
            IdType::Collection => self.build_collection(uuid),
            IdType::Action => {
                self.built_map.tag(uuid, BuilderTags::COMPLETE);
            }
            IdType::Image => self.build_image(datablock),
            IdType::Scene => {
                if let Some(layer) = datablock.as_scene().and_then(|scene| scene.view_layers.first()) {
                    let name = layer.name.clone();
                    self.build_scene(uuid, &name);
                }
            }
        }
    }

    fn build_mesh(&mut self, datablock: &Datablock) {
        let uuid = datablock.session_uuid;
        if self.built_map.check_is_built_and_tag(uuid, BuilderTags::COMPLETE) {
            return;
        }
        self.add_chain(uuid, NodeType::Geometry, "", &GEOMETRY_STAGES);
        self.add_relation(
            &ComponentKey::new(uuid, NodeType::Parameters),
            &ComponentKey::new(uuid, NodeType::Geometry),
            "Geometry Parameters -> Geometry",
            RelationFlags::empty(),
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
        self.build_parameters(datablock);
    }

    pub fn build_collection(&mut self, uuid: SessionUuid) {
        let main = self.main;
        let Some(datablock) = main.get(uuid) else {
            return;
        };
        let Some(collection) = datablock.as_collection() else {
            return;
        };
        if self.built_map.check_is_built_and_tag(uuid, BuilderTags::COMPLETE) {
            return;
        }
        self.build_parameters(datablock);
        for object in &collection.objects {
            self.build_object(object.uuid());
        }
        for child in &collection.children {
            self.build_collection(child.uuid());
        }
    }

    // ------------------------------------------------------------------------
    // Generic per-datablock components
    // ------------------------------------------------------------------------

    pub fn build_parameters(&mut self, datablock: &Datablock) {
        let uuid = datablock.session_uuid;
        if self.built_map.check_is_built_and_tag(uuid, BuilderTags::PARAMETERS) {
            return;
        }
        self.add_chain(
            uuid,
            NodeType::Parameters,
            "",
            &[
                OperationCode::ParametersEntry,
                OperationCode::ParametersEval,
                OperationCode::ParametersExit,
            ],
        );
    }

    pub fn build_animdata(&mut self, datablock: &Datablock) {
        let Some(anim) = &datablock.anim else {
            return;
        };
        let uuid = datablock.session_uuid;
        if self.built_map.check_is_built_and_tag(uuid, BuilderTags::ANIMATION) {
            return;
        }
        if let Some(action) = anim.action {
            self.build_id(action);
            self.add_chain(
                uuid,
                NodeType::Animation,
                "",
                &[
                    OperationCode::AnimationEntry,
                    OperationCode::AnimationEval,
                    OperationCode::AnimationExit,
                ],
            );
            self.add_relation(
                &TimeSourceKey,
                &OperationKey::new(uuid, NodeType::Animation, OperationCode::AnimationEval),
                "TimeSrc -> Animation",
                RelationFlags::empty(),
            );
            self.add_relation(
                &ComponentKey::new(action.uuid(), NodeType::Animation),
                &OperationKey::new(uuid, NodeType::Animation, OperationCode::AnimationEntry),
                "Action -> Animation",
                RelationFlags::empty(),
            );
            self.build_animation_curves(datablock, action.uuid());
        }
        for driver in &anim.drivers {
            self.build_driver(datablock, driver);
        }
    }

    /// Relations from the animation of `owner` to every property its action
    /// animates.
    fn build_animation_curves(&mut self, owner: &Datablock, action: SessionUuid) {
        let main = self.main;
        let Some(action) = main.get(action).and_then(Datablock::as_action) else {
            return;
        };
        let uuid = owner.session_uuid;
        let animation_exit = OperationKey::new(uuid, NodeType::Animation, OperationCode::AnimationExit);
        let animation_entry = OperationKey::new(uuid, NodeType::Animation, OperationCode::AnimationEntry);
        for fcurve in &action.fcurves {
            let Some(target) = self
                .resolver
                .resolve(owner, &fcurve.rna_path, RnaPointerSource::Entry)
                .map(RnaTarget::redirect_bone_local)
            else {
                debug!(rna_path = %fcurve.rna_path, "animated property does not resolve");
                continue;
            };
            self.add_relation(
                &animation_exit,
                &target,
                "Animation -> Property",
                RelationFlags::CHECK_BEFORE_ADD,
            );
            if target.uuid() != uuid {
                self.add_cow_ordering(target.uuid(), &animation_entry, "Animated CoW -> Animation");
            }
        }
    }

    fn build_driver(&mut self, owner: &Datablock, driver: &Driver) {
        let uuid = owner.session_uuid;
        let name_tag = i32::try_from(driver.array_index).unwrap_or(i32::MAX);
        let driver_key = OperationKey::tagged(
            uuid,
            NodeType::Parameters,
            OperationCode::Driver,
            driver.rna_path.clone(),
            name_tag,
        );

        let driven = self
            .resolver
            .resolve(owner, &driver.rna_path, RnaPointerSource::Entry)
            .map(RnaTarget::redirect_bone_local);
        match &driven {
            Some(target) => {
                self.add_relation(
                    &driver_key,
                    target,
                    "Driver -> Driven Property",
                    RelationFlags::CHECK_BEFORE_ADD,
                );
                if target.uuid() != uuid {
                    self.add_cow_ordering(target.uuid(), &driver_key, "Target CoW -> Driver");
                }
            }
            None => debug!(rna_path = %driver.rna_path, "driven property does not resolve"),
        }

        let main = self.main;
        for variable in &driver.variables {
            let Some(target) = main.get(variable.target.uuid()) else {
                debug!(variable = %variable.name, "driver variable target not found");
                continue;
            };
            self.build_id(variable.target);
            let source = self
                .resolver
                .resolve(target, &variable.rna_path, RnaPointerSource::Exit)
                .unwrap_or_else(|| {
                    RnaTarget::Component(ComponentKey::new(target.session_uuid, NodeType::Parameters))
                });
            // A variable reading the property its own driver writes.
            if target.session_uuid == uuid && driven.as_ref() == Some(&source) {
                continue;
            }
            self.add_relation(
                &source,
                &driver_key,
                "Driver Variable -> Driver",
                RelationFlags::CHECK_BEFORE_ADD,
            );
        }

        if driver.uses_time {
            self.add_relation(&TimeSourceKey, &driver_key, "TimeSrc -> Driver", RelationFlags::empty());
        }
    }

    // ------------------------------------------------------------------------
    // Copy-on-write
    // ------------------------------------------------------------------------

    fn build_copy_on_write_relations(&mut self) {
        let ids: Vec<NodeHandle> = self.graph.id_nodes().collect();
        for id in ids {
            self.build_copy_on_write_relations_for(id);
        }
    }

    /// Make every component of a datablock wait for its evaluated snapshot.
    ///
    /// Relations go into the component entry and into every operation
    /// nothing else leads to.
    fn build_copy_on_write_relations_for(&mut self, id: NodeHandle) {
        let node = self.graph.id_node(id);
        let Some(cow_component) = node.find_component(NodeType::CopyOnWrite, "") else {
            return;
        };
        let Some(cow) = self.graph.component(cow_component).entry() else {
            return;
        };
        let components: Vec<(NodeType, NodeHandle)> = node
            .components
            .iter()
            .filter(|(key, _)| key.node_type != NodeType::CopyOnWrite)
            .map(|(key, &component)| (key.node_type, component))
            .collect();

        for (node_type, component) in components {
            let mut flags = RelationFlags::NO_FLUSH | RelationFlags::GODMODE | RelationFlags::CHECK_BEFORE_ADD;
            if matches!(node_type, NodeType::Parameters | NodeType::LayerCollections) {
                flags.remove(RelationFlags::NO_FLUSH);
            }
            let targets: Vec<NodeHandle> = {
                let comp = self.graph.component(component);
                let entry = comp.entry();
                entry
                    .into_iter()
                    .chain(
                        comp.operations
                            .values()
                            .copied()
                            .filter(|&op| Some(op) != entry && self.graph.node(op).inlinks.is_empty()),
                    )
                    .collect()
            };
            for target in targets {
                self.graph.add_relation(cow, target, "CoW Dependency", flags);
            }
        }
    }
}
