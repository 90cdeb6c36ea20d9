//! Depsgraph Core
//!
//! This crate provides the dependency graph of a 3D scene authoring
//! application: given a document of datablocks (objects, meshes, armatures,
//! collections, scenes, ...), it works out which evaluation steps depend on
//! which, what has to re-run after an edit, and keeps an evaluated
//! copy-on-write snapshot of every datablock apart from the originals the
//! user edits.
//!
//! It implements:
//!
//! - A node model of datablocks, components and operations
//! - Graph building in two passes (nodes, then relations)
//! - Tagging and flushing of updates along relations
//! - Visibility flushing, so hidden data is not evaluated
//! - Copy-on-write snapshots with reference remapping
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `scene`: The document model the graph is built from
//! - `node`: Node kinds, flags and the node factory
//! - `graph`: The graph container, cycle detection and pruning
//! - `builder`: Node and relation builders
//! - `eval`: Tagging, flushing, visibility, copy-on-write and evaluation
//! - `registry`: Document → live graphs association
//! - `api`: The public façade
//!
//! # Example
//!
//! ```rust,ignore
//! use depsgraph_core::api::GraphHandle;
//! use depsgraph_core::scene::{Base, Datablock, IdPtr, IdRecalc, Main, Object, Scene, ViewLayer};
//!
//! let mut main = Main::new();
//! let cube = main.add(Datablock::object("Cube", Object::default()));
//! let scene = main.add(Datablock::scene("Scene", Scene {
//!     view_layers: vec![ViewLayer::new("ViewLayer").with_base(Base::visible(IdPtr::Original(cube)))],
//!     ..Scene::default()
//! }));
//!
//! let graph = GraphHandle::create(main.into_shared(), scene, "ViewLayer")?;
//! graph.evaluate_refresh()?;
//!
//! graph.tag_update(cube, IdRecalc::TRANSFORM);
//! let report = graph.evaluate_refresh()?;
//! ```

pub mod api;
pub mod builder;
pub mod config;
pub mod debug;
pub mod error;
pub mod eval;
pub mod graph;
pub mod node;
pub mod registry;
pub mod scene;

pub use api::{id_tag_update, GraphHandle};
pub use config::{DebugFlags, GraphConfig};
pub use error::{Error, Result};
pub use eval::{EvalContext, EvaluationReport, OperationCallbacks};
pub use graph::{Depsgraph, GraphStats};
pub use registry::{EditorCallbacks, GraphRegistry};
