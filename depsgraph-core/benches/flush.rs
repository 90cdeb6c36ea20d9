use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use depsgraph_core::builder::{build_graph, GraphSummary};
use depsgraph_core::eval::tag::{tag_operation, UpdateSource};
use depsgraph_core::eval::{clear_updates, flush_updates};
use depsgraph_core::node::{NodeHandle, NodeType, OperationCode, OperationIdKey, RelationFlags};
use depsgraph_core::scene::{
    Armature, Base, Bone, Datablock, IdPtr, IdType, Main, Mesh, Object, Scene, SessionUuid,
    ViewLayer,
};
use depsgraph_core::Depsgraph;

#[derive(Clone)]
struct Lcg(u64);

impl Lcg {
    fn next_usize(&mut self, upper_exclusive: usize) -> usize {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1);
        ((self.0 >> 32) as usize) % upper_exclusive.max(1)
    }
}

/// Operations spread over components of eight per datablock, with edges
/// only from lower to higher indices.
fn dag_graph(n: usize, edges_per_node: usize, seed: u64) -> (Depsgraph, Vec<NodeHandle>) {
    let mut main = Main::new();
    let scene = main.add(Datablock::scene("Scene", Scene::default()));
    let mut graph = Depsgraph::new(main.into_shared(), scene, "ViewLayer");
    let mut rng = Lcg(seed);
    let mut ops = Vec::with_capacity(n);
    for chunk in 0..n.div_ceil(8) {
        let id = graph.add_id_node(&format!("OB{chunk}"), SessionUuid::new(), IdType::Object, None);
        for slot in 0..8.min(n - chunk * 8) {
            let component = graph.ensure_component(id, NodeType::Parameters, &format!("c{slot}"));
            ops.push(graph.add_operation(
                component,
                OperationIdKey::from_opcode(OperationCode::Operation),
                None,
            ));
        }
    }
    for to in 1..n {
        for _ in 0..edges_per_node.min(to) {
            let from = rng.next_usize(to);
            graph.add_relation(ops[from], ops[to], "Edge", RelationFlags::CHECK_BEFORE_ADD);
        }
    }
    (graph, ops)
}

fn scene_main(objects: usize) -> (Main, SessionUuid) {
    let mut main = Main::new();
    let mesh = main.add(Datablock::mesh("Mesh", Mesh::from_vertices(vec![[0.0; 3]; 64])));
    let armature = main.add(Datablock::armature(
        "Skeleton",
        Armature {
            bones: vec![
                Bone::new("Root", None),
                Bone::new("Spine", Some("Root")),
                Bone::new("Head", Some("Spine")),
            ],
        },
    ));
    let rig = main.add(Datablock::object(
        "Rig",
        Object {
            data: Some(IdPtr::Original(armature)),
            ..Object::default()
        },
    ));
    let mut layer = ViewLayer::new("ViewLayer").with_base(Base::visible(IdPtr::Original(rig)));
    for i in 0..objects {
        let object = main.add(Datablock::object(
            format!("Object{i}"),
            Object {
                data: Some(IdPtr::Original(mesh)),
                parent: Some(IdPtr::Original(rig)),
                ..Object::default()
            },
        ));
        layer = layer.with_base(Base::visible(IdPtr::Original(object)));
    }
    let scene = main.add(Datablock::scene(
        "Scene",
        Scene {
            view_layers: vec![layer],
            ..Scene::default()
        },
    ));
    (main, scene)
}

fn bench_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("flush");
    for &(n, edges) in &[(1_000usize, 2usize), (10_000, 4)] {
        let (mut graph, ops) = dag_graph(n, edges, 0x5eed);
        group.bench_function(format!("dag_{n}_{edges}"), |b| {
            b.iter(|| {
                clear_updates(&mut graph);
                tag_operation(&mut graph, ops[0], UpdateSource::UserEdit);
                black_box(flush_updates(&mut graph).visited.len())
            });
        });
    }
    group.finish();
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("build");
    for &objects in &[10usize, 200] {
        let (main, scene) = scene_main(objects);
        let main = main.into_shared();
        group.bench_function(format!("objects_{objects}"), |b| {
            b.iter_batched(
                || Depsgraph::new(main.clone(), scene, "ViewLayer"),
                |mut graph| {
                    if let Err(err) = build_graph(&mut graph, &GraphSummary::default()) {
                        panic!("build failed: {err}");
                    }
                    black_box(graph.stats())
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_flush, bench_build);
criterion_main!(benches);
