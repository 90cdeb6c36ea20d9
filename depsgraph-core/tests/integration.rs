//! Integration Tests for Graph Building and Evaluation
//!
//! These tests build graphs from small documents through the public API and
//! check what building, tagging, flushing and evaluation do together.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use depsgraph_core::api::{id_tag_update_in, GraphHandle};
use depsgraph_core::builder::{ComponentKey, OperationKey};
use depsgraph_core::eval::cow;
use depsgraph_core::eval::tag::{tag_id, tag_operation, UpdateSource};
use depsgraph_core::eval::{flush_updates, OperationCallbacks};
use depsgraph_core::graph::Depsgraph;
use depsgraph_core::node::{
    CowState, NodeHandle, NodeType, OperationCode, OperationIdKey, RelationFlags,
};
use depsgraph_core::registry::{EditorCallbacks, GraphRegistry};
use depsgraph_core::scene::{
    Action, AnimData, Armature, Base, Bone, Datablock, FCurve, IdPtr, IdRecalc, Main, Mesh,
    IdType, Modifier, ModifierKind, Object, Scene, SessionUuid, SharedMain, ViewLayer,
};
use proptest::prelude::*;

const VIEW_LAYER: &str = "ViewLayer";

fn add_scene(main: &mut Main, bases: Vec<Base>) -> SessionUuid {
    let layer = bases
        .into_iter()
        .fold(ViewLayer::new(VIEW_LAYER), ViewLayer::with_base);
    main.add(Datablock::scene(
        "Scene",
        Scene {
            view_layers: vec![layer],
            ..Scene::default()
        },
    ))
}

fn object_with_data(name: &str, data: SessionUuid) -> Datablock {
    Datablock::object(
        name,
        Object {
            data: Some(IdPtr::Original(data)),
            ..Object::default()
        },
    )
}

fn handle(main: SharedMain, scene: SessionUuid) -> GraphHandle {
    GraphHandle::create_in(Arc::new(GraphRegistry::new()), main, scene, VIEW_LAYER)
        .unwrap_or_else(|e| panic!("graph creation failed: {e}"))
}

fn op(graph: &Depsgraph, uuid: SessionUuid, node_type: NodeType, opcode: OperationCode) -> NodeHandle {
    OperationKey::new(uuid, node_type, opcode)
        .find(graph)
        .unwrap_or_else(|| panic!("missing {opcode} on {node_type:?}"))
}

fn bone_op(graph: &Depsgraph, uuid: SessionUuid, bone: &str, opcode: OperationCode) -> NodeHandle {
    OperationKey::in_component(uuid, NodeType::Bone, bone, opcode)
        .find(graph)
        .unwrap_or_else(|| panic!("missing {opcode} on bone {bone}"))
}

fn needs_update(graph: &Depsgraph, operation: NodeHandle) -> bool {
    graph.operation(operation).needs_update()
}

/// Scenario A: a mesh shared by two objects is built once.
#[test]
fn shared_mesh_is_built_once() {
    let mut main = Main::new();
    let mesh = main.add(Datablock::mesh("Cube", Mesh::from_vertices(vec![[0.0; 3]; 8])));
    let first = main.add(object_with_data("First", mesh));
    let second = main.add(object_with_data("Second", mesh));
    let scene = add_scene(
        &mut main,
        vec![Base::visible(IdPtr::Original(first)), Base::visible(IdPtr::Original(second))],
    );
    let graph = handle(main.into_shared(), scene);
    let graph = graph.read();

    let mesh_id = graph.find_id_node(mesh).unwrap();
    let geometry_components = graph
        .id_node(mesh_id)
        .components
        .keys()
        .filter(|key| key.node_type == NodeType::Geometry)
        .count();
    assert_eq!(geometry_components, 1);

    let mesh_done = op(&graph, mesh, NodeType::Geometry, OperationCode::GeometryEvalDone);
    for object in [first, second] {
        let entry = ComponentKey::new(object, NodeType::Geometry).find(&graph).unwrap();
        let entry = graph.component(entry).entry().unwrap();
        assert!(
            graph.operation_parents(entry).any(|parent| parent == mesh_done),
            "object geometry does not depend on the mesh"
        );
    }
}

/// Scenario B: a tag leaves the graph not fully evaluated until it is
/// evaluated.
#[test]
fn tagged_graph_is_not_fully_evaluated() {
    let mut main = Main::new();
    let cube = main.add(Datablock::object("Cube", Object::default()));
    let scene = add_scene(&mut main, vec![Base::visible(IdPtr::Original(cube))]);
    let graph = handle(main.into_shared(), scene);
    graph.evaluate_refresh().unwrap();
    assert!(graph.is_fully_evaluated());

    assert!(graph.tag_update(cube, IdRecalc::TRANSFORM));
    assert!(!graph.is_fully_evaluated());

    graph.evaluate_refresh().unwrap();
    assert!(graph.is_fully_evaluated());
}

fn rig_document() -> (SharedMain, SessionUuid, SessionUuid) {
    let mut main = Main::new();
    let armature = main.add(Datablock::armature(
        "Skeleton",
        Armature {
            bones: vec![Bone::new("A", None), Bone::new("B", Some("A")), Bone::new("C", None)],
        },
    ));
    let rig = main.add(object_with_data("Rig", armature));
    let scene = add_scene(&mut main, vec![Base::visible(IdPtr::Original(rig))]);
    (main.into_shared(), scene, rig)
}

/// Scenario C: the child bone follows its parent's done stage, and the
/// parent is flushed once.
#[test]
fn parent_bone_flushes_into_child() {
    let (main, scene, rig) = rig_document();
    let graph = handle(main, scene);
    graph.evaluate_refresh().unwrap();

    let mut shared = graph.shared().write();
    let a_done = bone_op(&shared, rig, "A", OperationCode::BoneDone);
    tag_operation(&mut shared, a_done, UpdateSource::UserEdit);
    let summary = flush_updates(&mut shared);

    for opcode in [OperationCode::BonePoseParent, OperationCode::BoneReady, OperationCode::BoneDone] {
        assert!(needs_update(&shared, bone_op(&shared, rig, "B", opcode)), "{opcode}");
    }
    assert_eq!(summary.visited.iter().filter(|&&visited| visited == a_done).count(), 1);
    assert!(needs_update(
        &shared,
        op(&shared, rig, NodeType::EvalPose, OperationCode::PoseDone)
    ));
}

/// Scenario D: an empty recalc tags everything but animation.
#[test]
fn legacy_tag_skips_animation() {
    let mut main = Main::new();
    let action = main.add(Datablock::action(
        "Bounce",
        Action {
            fcurves: vec![FCurve::new("location", 2)],
        },
    ));
    let cube = main.add(Datablock::object("Cube", Object::default()).with_anim(AnimData {
        action: Some(IdPtr::Original(action)),
        drivers: Vec::new(),
    }));
    let scene = add_scene(&mut main, vec![Base::visible(IdPtr::Original(cube))]);
    let graph = handle(main.into_shared(), scene);
    graph.evaluate_refresh().unwrap();

    let mut shared = graph.shared().write();
    assert!(tag_id(&mut shared, cube, IdRecalc::empty(), UpdateSource::UserEdit));
    let id = shared.find_id_node(cube).unwrap();
    let components: Vec<(NodeType, NodeHandle)> = shared
        .id_node(id)
        .components
        .iter()
        .map(|(key, &component)| (key.node_type, component))
        .collect();
    assert!(components.iter().any(|(node_type, _)| *node_type == NodeType::Animation));
    let check_tags = |graph: &Depsgraph| {
        for &(node_type, component) in &components {
            let operations = &graph.component(component).operations;
            let all_tagged = operations.values().all(|&operation| needs_update(graph, operation));
            let any_tagged = operations.values().any(|&operation| needs_update(graph, operation));
            if node_type == NodeType::Animation {
                assert!(!any_tagged, "animation was tagged");
            } else {
                assert!(all_tagged, "{node_type:?} was not tagged");
            }
        }
    };
    check_tags(&shared);

    // Animation drives the transform, never the other way round, so the
    // flush leaves it alone too.
    let summary = flush_updates(&mut shared);
    assert!(summary.modified_ids.contains(&cube));
    check_tags(&shared);
    let recalc = shared.id_node(id).eval_recalc;
    assert!(recalc.contains(IdRecalc::TRANSFORM | IdRecalc::COPY_ON_WRITE));
    assert!(!recalc.contains(IdRecalc::ANIMATION));
    drop(shared);

    let report = graph.evaluate_refresh().unwrap();
    let shared = graph.read();
    assert!(report.executed.iter().all(|&operation| {
        let component = shared.operation(operation).owner;
        shared.node(component).node_type != NodeType::Animation
    }));
    assert!(shared.operations().all(|operation| !needs_update(&shared, operation)));
    assert!(!shared.has_entry_tags());
}

/// Identity of an operation that survives rebuilds.
fn operation_identity(graph: &Depsgraph, operation: NodeHandle) -> (SessionUuid, NodeType, String, OperationIdKey) {
    let component = graph.operation(operation).owner;
    let id = graph.component(component).owner;
    let (key, _) = graph
        .id_node(id)
        .components
        .iter()
        .find(|(_, &handle)| handle == component)
        .unwrap();
    (
        graph.id_node(id).id_orig,
        key.node_type,
        key.name.clone(),
        graph.operation(operation).key(),
    )
}

fn full_document() -> (SharedMain, SessionUuid, SessionUuid, SessionUuid, SessionUuid) {
    let mut main = Main::new();
    let mesh = main.add(Datablock::mesh("Plane", Mesh::from_vertices(vec![[0.0; 3]; 4])));
    let armature = main.add(Datablock::armature(
        "Skeleton",
        Armature {
            bones: vec![Bone::new("Root", None), Bone::new("Tip", Some("Root"))],
        },
    ));
    let action = main.add(Datablock::action(
        "Idle",
        Action {
            fcurves: vec![FCurve::new("location", 0), FCurve::new("pose.bones[\"Tip\"].scale", 1)],
        },
    ));
    let rig = main.add(object_with_data("Rig", armature).with_anim(AnimData {
        action: Some(IdPtr::Original(action)),
        drivers: Vec::new(),
    }));
    let empty = main.add(Datablock::object("Hook", Object::default()));
    let plane = main.add(Datablock::object(
        "Plane",
        Object {
            data: Some(IdPtr::Original(mesh)),
            parent: Some(IdPtr::Original(rig)),
            modifiers: vec![Modifier::new("Hook", ModifierKind::Hook).with_target(IdPtr::Original(empty))],
            ..Object::default()
        },
    ));
    let scene = add_scene(
        &mut main,
        vec![Base::visible(IdPtr::Original(plane)), Base::visible(IdPtr::Original(rig))],
    );
    (main.into_shared(), scene, plane, mesh, empty)
}

/// Operation identities are unique within a build.
#[test]
fn operation_identities_are_unique() {
    let (main, scene, ..) = full_document();
    let graph = handle(main, scene);
    let graph = graph.read();
    let mut seen = HashSet::new();
    for operation in graph.operations() {
        let identity = operation_identity(&graph, operation);
        assert!(seen.insert(identity.clone()), "duplicate operation {identity:?}");
    }
    assert!(seen.len() > 20);
}

fn component_pairs(graph: &Depsgraph) -> BTreeSet<(u64, NodeType, String)> {
    graph
        .id_nodes()
        .flat_map(|id| {
            let node = graph.id_node(id);
            node.components
                .keys()
                .map(move |key| (node.id_orig.raw(), key.node_type, key.name.clone()))
        })
        .collect()
}

/// Rebuilding the same scene produces the same components and carries the
/// visible masks over.
#[test]
fn rebuild_is_idempotent() {
    let (main, scene, ..) = full_document();
    let graph = handle(main, scene);
    graph.evaluate_refresh().unwrap();

    let (pairs, masks) = {
        let graph = graph.read();
        let masks: HashMap<SessionUuid, u64> = graph
            .id_nodes()
            .map(|id| (graph.id_node(id).id_orig, graph.id_node(id).visible_components_mask))
            .collect();
        (component_pairs(&graph), masks)
    };

    graph.tag_relations_update();
    assert!(graph.rebuild_relations_if_stale().unwrap());

    let rebuilt = graph.read();
    assert_eq!(component_pairs(&rebuilt), pairs);
    for id in rebuilt.id_nodes() {
        let node = rebuilt.id_node(id);
        assert_eq!(node.previously_visible_components_mask, masks[&node.id_orig]);
        assert_eq!(node.visible_components_mask, masks[&node.id_orig]);
        if node.id_cow.is_some() {
            assert_eq!(node.cow_state(), CowState::Expanded, "snapshot was not salvaged");
        }
    }
    // Nothing became visible or new, so nothing is re-evaluated.
    assert!(!rebuilt.has_entry_tags());
}

/// A datablock without a name is expanded, evaluated and salvaged like any
/// other.
#[test]
fn unnamed_datablocks_are_evaluated_and_salvaged() {
    let mut main = Main::new();
    let unnamed = main.add(Datablock::object("", Object::default()));
    let scene = add_scene(&mut main, vec![Base::visible(IdPtr::Original(unnamed))]);
    let graph = handle(main.into_shared(), scene);
    graph.evaluate_refresh().unwrap();

    let evaluated = graph.get_evaluated(unnamed).unwrap();
    assert!(evaluated.runtime.is_cow);
    assert_eq!(evaluated.runtime.orig_id, Some(unnamed));
    {
        let shared = graph.read();
        let id = shared.find_id_node(unnamed).unwrap();
        assert_eq!(shared.id_node(id).cow_state(), CowState::Expanded);
    }

    graph.tag_relations_update();
    assert!(graph.rebuild_relations_if_stale().unwrap());
    assert!(graph.is_fully_evaluated());
}

/// Expanding a snapshot again after freeing it remaps references the same
/// way.
#[test]
fn snapshot_round_trip_remaps_identically() {
    let (main, scene, plane, mesh, empty) = full_document();
    let graph = handle(main, scene);
    graph.evaluate_refresh().unwrap();

    let mut shared = graph.shared().write();
    let id = shared.find_id_node(plane).unwrap();
    let references = |graph: &Depsgraph| {
        let mut refs = Vec::new();
        graph.id_node(id).id_cow.as_ref().unwrap().foreach_id(|ptr| refs.push(*ptr));
        refs
    };
    let first = references(&shared);
    assert!(first.contains(&IdPtr::Evaluated(mesh)));
    assert!(first.contains(&IdPtr::Evaluated(empty)));

    cow::free(shared.id_node_mut(id).id_cow.as_mut().unwrap());
    assert_eq!(shared.id_node(id).cow_state(), CowState::Placeholder);

    let main_handle = shared.main().clone();
    let main = main_handle.read();
    cow::expand(&mut shared, &main, id);
    assert_eq!(shared.id_node(id).cow_state(), CowState::Expanded);
    assert_eq!(references(&shared), first);
}

/// Data reached only through a visible object's modifier becomes visible.
#[test]
fn visibility_reaches_modifier_targets() {
    let (main, scene, plane, mesh, empty) = full_document();
    let graph = handle(main, scene);
    let graph = graph.read();

    let empty_id = graph.find_id_node(empty).unwrap();
    assert!(!graph.id_node(empty_id).is_directly_visible);
    for &component in graph.id_node(empty_id).components.values() {
        assert!(
            graph.component(component).affects_directly_visible,
            "{} is not visible",
            graph.node(component).name
        );
    }

    let mesh_geometry = ComponentKey::new(mesh, NodeType::Geometry).find(&graph).unwrap();
    assert!(graph.component(mesh_geometry).affects_directly_visible);
    let plane_id = graph.find_id_node(plane).unwrap();
    assert_ne!(graph.id_node(plane_id).visible_components_mask, 0);
}

/// Hidden objects are not directly visible, but their results are still
/// synchronized back to the original, which keeps their transform running.
#[test]
fn hidden_objects_still_synchronize() {
    let mut main = Main::new();
    let shown = main.add(Datablock::object("Shown", Object::default()));
    let hidden = main.add(Datablock::object("Hidden", Object::default()));
    let scene = add_scene(
        &mut main,
        vec![Base::visible(IdPtr::Original(shown)), Base::hidden(IdPtr::Original(hidden))],
    );
    let graph = handle(main.into_shared(), scene);

    let evaluated = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&evaluated);
    graph.set_callbacks(OperationCallbacks::new().with(OperationCode::TransformEval, move |ctx| {
        log.lock().unwrap().push(ctx.id_orig());
    }));
    graph.evaluate_refresh().unwrap();

    {
        let shared = graph.read();
        let id = shared.find_id_node(hidden).unwrap();
        assert!(!shared.id_node(id).is_directly_visible);
        for node_type in [NodeType::Synchronization, NodeType::Transform] {
            let component = ComponentKey::new(hidden, node_type).find(&shared).unwrap();
            assert!(shared.component(component).affects_directly_visible, "{node_type:?}");
        }
    }
    let mut evaluated = evaluated.lock().unwrap().clone();
    evaluated.sort();
    let mut expected = vec![shown, hidden];
    expected.sort();
    assert_eq!(evaluated, expected);
}

#[test]
fn edits_reach_the_original_through_synchronization() {
    let mut main = Main::new();
    let cube = main.add(Datablock::object("Cube", Object::default()));
    let scene = add_scene(&mut main, vec![Base::visible(IdPtr::Original(cube))]);
    let main = main.into_shared();
    let graph = handle(main.clone(), scene);
    graph.set_callbacks(OperationCallbacks::new().with(OperationCode::TransformEval, |ctx| {
        if let Some(object) = ctx.evaluated_mut().and_then(Datablock::as_object_mut) {
            object.runtime.world_location = object.location;
        }
    }));
    graph.evaluate_refresh().unwrap();

    if let Some(object) = main.write().get_mut(cube).and_then(Datablock::as_object_mut) {
        object.location = [1.0, 2.0, 3.0];
    }
    // The editor tags copy-on-write along with the edited property.
    graph.tag_update(cube, IdRecalc::TRANSFORM | IdRecalc::COPY_ON_WRITE);
    graph.evaluate_refresh().unwrap();

    let evaluated = graph.get_evaluated(cube).unwrap();
    assert_eq!(evaluated.as_object().unwrap().runtime.world_location, [1.0, 2.0, 3.0]);
    let original = main.read().get(cube).cloned().unwrap();
    assert_eq!(original.as_object().unwrap().runtime.world_location, [1.0, 2.0, 3.0]);
}

#[test]
fn frame_change_flushes_animation() {
    let (main, scene, ..) = full_document();
    let rig = main.read().find(IdType::Object, "Rig").unwrap().session_uuid;
    let graph = handle(main, scene);
    graph.evaluate_refresh().unwrap();

    let report = graph.evaluate_at_frame(12.0).unwrap();
    assert_eq!(graph.frame(), 12.0);
    let shared = graph.read();
    let visited: HashSet<NodeHandle> = report.flush.visited.iter().copied().collect();
    assert!(visited.contains(&op(&shared, rig, NodeType::Animation, OperationCode::AnimationEval)));
    assert!(visited.contains(&op(&shared, rig, NodeType::Transform, OperationCode::TransformLocal)));
    assert!(visited.contains(&op(&shared, rig, NodeType::EvalPose, OperationCode::PoseInit)));
    assert!(graph.is_fully_evaluated());
}

#[test]
fn editor_callbacks_follow_user_edits() {
    let registry = Arc::new(GraphRegistry::new());
    let mut main = Main::new();
    let cube = main.add(Datablock::object("Cube", Object::default()));
    let scene = add_scene(&mut main, vec![Base::visible(IdPtr::Original(cube))]);
    let main = main.into_shared();
    let graph = GraphHandle::create_in(Arc::clone(&registry), main.clone(), scene, VIEW_LAYER).unwrap();
    graph.set_active(true);
    graph.evaluate_refresh().unwrap();

    let ids = Arc::new(Mutex::new(Vec::new()));
    let scene_updates = Arc::new(AtomicUsize::new(0));
    let (ids_log, scene_log) = (Arc::clone(&ids), Arc::clone(&scene_updates));
    registry.set_editor_callbacks(
        EditorCallbacks::new()
            .on_id_update(move |_, uuid| ids_log.lock().unwrap().push(uuid))
            .on_scene_update(move |_, updated| {
                assert!(updated);
                scene_log.fetch_add(1, Ordering::SeqCst);
            }),
    );

    assert_eq!(id_tag_update_in(&registry, &main, cube, IdRecalc::TRANSFORM), 1);
    graph.evaluate_refresh().unwrap();
    assert_eq!(*ids.lock().unwrap(), vec![cube]);
    assert_eq!(scene_updates.load(Ordering::SeqCst), 1);

    // Nothing tagged, nothing reported.
    graph.evaluate_refresh().unwrap();
    assert_eq!(scene_updates.load(Ordering::SeqCst), 1);

    graph.set_active(false);
    graph.tag_update(cube, IdRecalc::TRANSFORM);
    graph.evaluate_refresh().unwrap();
    assert_eq!(ids.lock().unwrap().len(), 1);
}

/// Random DAG over `n` operations, each in its own component. Edges always
/// point from a lower to a higher index; the flag marks relations that do
/// not flush.
fn dag() -> impl Strategy<Value = (usize, Vec<(usize, usize, bool)>)> {
    (2usize..12).prop_flat_map(|n| {
        let edges = prop::collection::vec((0..n, 0..n, any::<bool>()), 0..32).prop_map(|edges| {
            edges
                .into_iter()
                .filter(|(a, b, _)| a != b)
                .map(|(a, b, no_flush)| (a.min(b), a.max(b), no_flush))
                .collect::<Vec<_>>()
        });
        (Just(n), edges)
    })
}

fn dag_graph(n: usize, edges: &[(usize, usize, bool)]) -> (Depsgraph, Vec<NodeHandle>) {
    let mut main = Main::new();
    let scene = main.add(Datablock::scene("Scene", Scene::default()));
    let mut graph = Depsgraph::new(main.into_shared(), scene, VIEW_LAYER);
    let id = graph.add_id_node("OBDag", SessionUuid::new(), IdType::Object, None);
    let ops = (0..n)
        .map(|i| {
            let component = graph.ensure_component(id, NodeType::Parameters, &format!("c{i}"));
            graph.add_operation(component, OperationIdKey::from_opcode(OperationCode::Operation), None)
        })
        .collect::<Vec<_>>();
    for &(from, to, no_flush) in edges {
        let flags = if no_flush {
            RelationFlags::NO_FLUSH
        } else {
            RelationFlags::empty()
        };
        graph.add_relation(ops[from], ops[to], "Edge", flags);
    }
    (graph, ops)
}

fn reachable(n: usize, edges: &[(usize, usize, bool)]) -> BTreeSet<usize> {
    let mut seen = BTreeSet::from([0]);
    let mut stack = vec![0];
    while let Some(current) = stack.pop() {
        for &(from, to, no_flush) in edges {
            if from == current && !no_flush && to < n && seen.insert(to) {
                stack.push(to);
            }
        }
    }
    seen
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

    #[test]
    fn flush_tags_exactly_the_flushable_descendants((n, edges) in dag()) {
        let (mut graph, ops) = dag_graph(n, &edges);
        tag_operation(&mut graph, ops[0], UpdateSource::UserEdit);
        let summary = flush_updates(&mut graph);

        let tagged: BTreeSet<usize> = (0..n).filter(|&i| needs_update(&graph, ops[i])).collect();
        prop_assert_eq!(&tagged, &reachable(n, &edges));

        let visited: HashSet<NodeHandle> = summary.visited.iter().copied().collect();
        prop_assert_eq!(visited.len(), summary.visited.len());
        prop_assert_eq!(visited.len(), tagged.len());
    }
}
