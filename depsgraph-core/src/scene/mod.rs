//! Scene Data Model
//!
//! The depsgraph consumes the document as a collection of datablocks with an
//! identity and a type tag. This module provides the minimal shape of that
//! document which the builders need to walk: objects, meshes, armatures,
//! collections, scenes, actions and images.
//!
//! # Identity
//!
//! Every datablock carries a [`SessionUuid`]. It is unique for the lifetime
//! of the process and stable across graph rebuilds, which is what allows the
//! graph to salvage copy-on-write snapshots.
//!
//! # References
//!
//! Datablocks refer to each other through [`IdPtr`]. Originals only ever hold
//! [`IdPtr::Original`]; evaluated snapshots have their references remapped to
//! [`IdPtr::Evaluated`] when the referenced datablock has a snapshot of its own.

mod types;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub use types::{
    Action, AnimData, Armature, Base, BaseFlags, Bone, Collection, Driver, DriverVariable, FCurve,
    Image, Mesh, MeshRuntime, Modifier, ModifierKind, Object, ObjectRuntime, Scene, ViewLayer,
};

/// Process-unique identifier of a datablock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionUuid(u64);

impl SessionUuid {
    /// Generate a new unique session identifier.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw identifier value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for SessionUuid {
    fn default() -> Self {
        Self::new()
    }
}

impl From<u64> for SessionUuid {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Identifier of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MainId(u64);

impl MainId {
    /// Generate a new unique document identifier.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw identifier value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for MainId {
    fn default() -> Self {
        Self::new()
    }
}

/// Type tag of a datablock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdType {
    Object,
    Mesh,
    Armature,
    Collection,
    Scene,
    Action,
    Image,
}

impl IdType {
    /// All datablock types, in declaration order.
    pub const ALL: [IdType; 7] = [
        IdType::Object,
        IdType::Mesh,
        IdType::Armature,
        IdType::Collection,
        IdType::Scene,
        IdType::Action,
        IdType::Image,
    ];

    /// Two letter code used as a name prefix in debug output.
    pub fn code(self) -> &'static str {
        match self {
            IdType::Object => "OB",
            IdType::Mesh => "ME",
            IdType::Armature => "AR",
            IdType::Collection => "GR",
            IdType::Scene => "SC",
            IdType::Action => "AC",
            IdType::Image => "IM",
        }
    }

    /// Dense index of the type, usable as a bit position.
    pub fn index(self) -> usize {
        self as usize
    }
}

bitflags! {
    /// Recalculation flags of a datablock.
    ///
    /// An empty value passed to tagging has the legacy meaning "everything
    /// except animation".
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct IdRecalc: u32 {
        const TRANSFORM     = 1 << 0;
        const GEOMETRY      = 1 << 1;
        const ANIMATION     = 1 << 2;
        const COPY_ON_WRITE = 1 << 3;
        const ALL = Self::TRANSFORM.bits()
            | Self::GEOMETRY.bits()
            | Self::ANIMATION.bits()
            | Self::COPY_ON_WRITE.bits();
    }
}

/// Reference from one datablock to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdPtr {
    /// Points at the original datablock in the document.
    Original(SessionUuid),
    /// Points at the evaluated snapshot owned by a graph.
    Evaluated(SessionUuid),
}

impl IdPtr {
    /// Session identifier of the referenced datablock.
    pub fn uuid(&self) -> SessionUuid {
        match *self {
            IdPtr::Original(uuid) | IdPtr::Evaluated(uuid) => uuid,
        }
    }

    pub fn is_evaluated(&self) -> bool {
        matches!(self, IdPtr::Evaluated(_))
    }
}

/// Runtime bookkeeping carried by every datablock.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdRuntime {
    /// Set on snapshots made by the copy-on-write evaluator.
    pub is_cow: bool,
    /// Set while a snapshot holds a full copy of its original.
    pub expanded: bool,
    /// For snapshots: the original this snapshot was made from.
    pub orig_id: Option<SessionUuid>,
    /// Accumulated recalculation flags since the last evaluation.
    pub recalc: IdRecalc,
}

/// Type specific payload of a datablock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IdData {
    Object(Object),
    Mesh(Mesh),
    Armature(Armature),
    Collection(Collection),
    Scene(Scene),
    Action(Action),
    Image(Image),
}

impl IdData {
    /// Empty payload for the given type.
    pub fn empty(id_type: IdType) -> Self {
        match id_type {
            IdType::Object => IdData::Object(Object::default()),
            IdType::Mesh => IdData::Mesh(Mesh::default()),
            IdType::Armature => IdData::Armature(Armature::default()),
            IdType::Collection => IdData::Collection(Collection::default()),
            IdType::Scene => IdData::Scene(Scene::default()),
            IdType::Action => IdData::Action(Action::default()),
            IdType::Image => IdData::Image(Image::default()),
        }
    }

    pub fn id_type(&self) -> IdType {
        match self {
            IdData::Object(_) => IdType::Object,
            IdData::Mesh(_) => IdType::Mesh,
            IdData::Armature(_) => IdType::Armature,
            IdData::Collection(_) => IdType::Collection,
            IdData::Scene(_) => IdType::Scene,
            IdData::Action(_) => IdType::Action,
            IdData::Image(_) => IdType::Image,
        }
    }
}

/// A named, shareable unit of document data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datablock {
    pub name: String,
    pub session_uuid: SessionUuid,
    pub anim: Option<AnimData>,
    pub data: IdData,
    pub runtime: IdRuntime,
}

impl Datablock {
    /// Create a datablock with a fresh session identifier.
    pub fn new(name: impl Into<String>, data: IdData) -> Self {
        Self {
            name: name.into(),
            session_uuid: SessionUuid::new(),
            anim: None,
            data,
            runtime: IdRuntime::default(),
        }
    }

    pub fn object(name: impl Into<String>, object: Object) -> Self {
        Self::new(name, IdData::Object(object))
    }

    pub fn mesh(name: impl Into<String>, mesh: Mesh) -> Self {
        Self::new(name, IdData::Mesh(mesh))
    }

    pub fn armature(name: impl Into<String>, armature: Armature) -> Self {
        Self::new(name, IdData::Armature(armature))
    }

    pub fn collection(name: impl Into<String>, collection: Collection) -> Self {
        Self::new(name, IdData::Collection(collection))
    }

    pub fn scene(name: impl Into<String>, scene: Scene) -> Self {
        Self::new(name, IdData::Scene(scene))
    }

    pub fn action(name: impl Into<String>, action: Action) -> Self {
        Self::new(name, IdData::Action(action))
    }

    pub fn image(name: impl Into<String>, image: Image) -> Self {
        Self::new(name, IdData::Image(image))
    }

    /// Attach animation data, builder style.
    pub fn with_anim(mut self, anim: AnimData) -> Self {
        self.anim = Some(anim);
        self
    }

    /// Empty, unnamed shell of the given type.
    ///
    /// Used as the allocation a copy-on-write snapshot is expanded into.
    pub fn placeholder(id_type: IdType, session_uuid: SessionUuid) -> Self {
        Self {
            name: String::new(),
            session_uuid,
            anim: None,
            data: IdData::empty(id_type),
            runtime: IdRuntime::default(),
        }
    }

    pub fn id_type(&self) -> IdType {
        self.data.id_type()
    }

    /// Display name with the type code prefix, e.g. `OBCube`.
    pub fn prefixed_name(&self) -> String {
        format!("{}{}", self.id_type().code(), self.name)
    }

    pub fn as_object(&self) -> Option<&Object> {
        match &self.data {
            IdData::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut Object> {
        match &mut self.data {
            IdData::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn as_mesh(&self) -> Option<&Mesh> {
        match &self.data {
            IdData::Mesh(mesh) => Some(mesh),
            _ => None,
        }
    }

    pub fn as_mesh_mut(&mut self) -> Option<&mut Mesh> {
        match &mut self.data {
            IdData::Mesh(mesh) => Some(mesh),
            _ => None,
        }
    }

    pub fn as_armature(&self) -> Option<&Armature> {
        match &self.data {
            IdData::Armature(armature) => Some(armature),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&Collection> {
        match &self.data {
            IdData::Collection(collection) => Some(collection),
            _ => None,
        }
    }

    pub fn as_scene(&self) -> Option<&Scene> {
        match &self.data {
            IdData::Scene(scene) => Some(scene),
            _ => None,
        }
    }

    pub fn as_scene_mut(&mut self) -> Option<&mut Scene> {
        match &mut self.data {
            IdData::Scene(scene) => Some(scene),
            _ => None,
        }
    }

    pub fn as_action(&self) -> Option<&Action> {
        match &self.data {
            IdData::Action(action) => Some(action),
            _ => None,
        }
    }

    /// Visit every datablock reference held by this datablock.
    pub fn foreach_id(&self, mut f: impl FnMut(&IdPtr)) {
        if let Some(anim) = &self.anim {
            anim.foreach_id(&mut f);
        }
        match &self.data {
            IdData::Object(object) => object.foreach_id(&mut f),
            IdData::Collection(collection) => collection.foreach_id(&mut f),
            IdData::Scene(scene) => scene.foreach_id(&mut f),
            IdData::Mesh(_) | IdData::Armature(_) | IdData::Action(_) | IdData::Image(_) => {}
        }
    }

    /// Visit every datablock reference held by this datablock, mutably.
    pub fn foreach_id_mut(&mut self, mut f: impl FnMut(&mut IdPtr)) {
        if let Some(anim) = &mut self.anim {
            anim.foreach_id_mut(&mut f);
        }
        match &mut self.data {
            IdData::Object(object) => object.foreach_id_mut(&mut f),
            IdData::Collection(collection) => collection.foreach_id_mut(&mut f),
            IdData::Scene(scene) => scene.foreach_id_mut(&mut f),
            IdData::Mesh(_) | IdData::Armature(_) | IdData::Action(_) | IdData::Image(_) => {}
        }
    }
}

/// The document: every datablock, indexed by session identifier.
#[derive(Debug)]
pub struct Main {
    id: MainId,
    ids: IndexMap<SessionUuid, Datablock>,
}

/// A document shared between the embedder and its graphs.
pub type SharedMain = Arc<RwLock<Main>>;

impl Main {
    pub fn new() -> Self {
        Self {
            id: MainId::new(),
            ids: IndexMap::new(),
        }
    }

    pub fn id(&self) -> MainId {
        self.id
    }

    /// Add a datablock, returning its session identifier.
    pub fn add(&mut self, datablock: Datablock) -> SessionUuid {
        let uuid = datablock.session_uuid;
        self.ids.insert(uuid, datablock);
        uuid
    }

    pub fn get(&self, uuid: SessionUuid) -> Option<&Datablock> {
        self.ids.get(&uuid)
    }

    pub fn get_mut(&mut self, uuid: SessionUuid) -> Option<&mut Datablock> {
        self.ids.get_mut(&uuid)
    }

    pub fn remove(&mut self, uuid: SessionUuid) -> Option<Datablock> {
        self.ids.shift_remove(&uuid)
    }

    pub fn contains(&self, uuid: SessionUuid) -> bool {
        self.ids.contains_key(&uuid)
    }

    /// Find a datablock by type and name.
    pub fn find(&self, id_type: IdType, name: &str) -> Option<&Datablock> {
        self.ids
            .values()
            .find(|id| id.id_type() == id_type && id.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Datablock> {
        self.ids.values()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Wrap the document for sharing with graphs.
    pub fn into_shared(self) -> SharedMain {
        Arc::new(RwLock::new(self))
    }
}

impl Default for Main {
    fn default() -> Self {
        Self::new()
    }
}
