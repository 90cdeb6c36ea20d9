//! Concrete datablock payloads.

use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::{IdPtr, SessionUuid};

bitflags! {
    /// Per-base flags of an object inside a view layer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct BaseFlags: u32 {
        const VISIBLE          = 1 << 0;
        const SELECTED         = 1 << 1;
        const FROM_SET         = 1 << 2;
        const ENABLED_VIEWPORT = 1 << 3;
    }
}

/// Runtime state of an object, partially synchronized back to the original.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectRuntime {
    /// Original object data, recorded on evaluated snapshots.
    pub data_orig: Option<SessionUuid>,
    pub world_location: [f32; 3],
    pub base_flags: BaseFlags,
    /// Draw cache key, kept across snapshot re-expansion.
    pub batch_cache: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModifierKind {
    Boolean,
    Armature,
    Hook,
    Subdivision,
}

/// An entry of an object's modifier stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Modifier {
    pub name: String,
    pub kind: ModifierKind,
    pub target: Option<IdPtr>,
}

impl Modifier {
    pub fn new(name: impl Into<String>, kind: ModifierKind) -> Self {
        Self {
            name: name.into(),
            kind,
            target: None,
        }
    }

    pub fn with_target(mut self, target: IdPtr) -> Self {
        self.target = Some(target);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub parent: Option<IdPtr>,
    pub data: Option<IdPtr>,
    pub modifiers: Vec<Modifier>,
    pub location: [f32; 3],
    pub rotation_euler: [f32; 3],
    pub scale: [f32; 3],
    pub hide_viewport: bool,
    pub runtime: ObjectRuntime,
}

impl Default for Object {
    fn default() -> Self {
        Self {
            parent: None,
            data: None,
            modifiers: Vec::new(),
            location: [0.0; 3],
            rotation_euler: [0.0; 3],
            scale: [1.0; 3],
            hide_viewport: false,
            runtime: ObjectRuntime::default(),
        }
    }
}

impl Object {
    pub(super) fn foreach_id(&self, f: &mut impl FnMut(&IdPtr)) {
        if let Some(parent) = &self.parent {
            f(parent);
        }
        if let Some(data) = &self.data {
            f(data);
        }
        for modifier in &self.modifiers {
            if let Some(target) = &modifier.target {
                f(target);
            }
        }
    }

    pub(super) fn foreach_id_mut(&mut self, f: &mut impl FnMut(&mut IdPtr)) {
        if let Some(parent) = &mut self.parent {
            f(parent);
        }
        if let Some(data) = &mut self.data {
            f(data);
        }
        for modifier in &mut self.modifiers {
            if let Some(target) = &mut modifier.target {
                f(target);
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshRuntime {
    /// Draw cache key, kept across snapshot re-expansion.
    pub batch_cache: Option<u64>,
}

/// Mesh geometry.
///
/// Vertex data is shared between the original and its snapshots until one
/// side writes to it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mesh {
    pub vertices: Arc<Vec<[f32; 3]>>,
    pub runtime: MeshRuntime,
}

impl Mesh {
    pub fn from_vertices(vertices: Vec<[f32; 3]>) -> Self {
        Self {
            vertices: Arc::new(vertices),
            runtime: MeshRuntime::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bone {
    pub name: String,
    pub parent: Option<String>,
}

impl Bone {
    pub fn new(name: impl Into<String>, parent: Option<&str>) -> Self {
        Self {
            name: name.into(),
            parent: parent.map(str::to_owned),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Armature {
    pub bones: Vec<Bone>,
}

impl Armature {
    pub fn find_bone(&self, name: &str) -> Option<&Bone> {
        self.bones.iter().find(|bone| bone.name == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub objects: Vec<IdPtr>,
    pub children: Vec<IdPtr>,
}

impl Collection {
    pub(super) fn foreach_id(&self, f: &mut impl FnMut(&IdPtr)) {
        self.objects.iter().chain(&self.children).for_each(f);
    }

    pub(super) fn foreach_id_mut(&mut self, f: &mut impl FnMut(&mut IdPtr)) {
        self.objects.iter_mut().chain(&mut self.children).for_each(f);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Base {
    pub object: IdPtr,
    pub flags: BaseFlags,
}

impl Base {
    pub fn visible(object: IdPtr) -> Self {
        Self {
            object,
            flags: BaseFlags::VISIBLE | BaseFlags::ENABLED_VIEWPORT,
        }
    }

    pub fn hidden(object: IdPtr) -> Self {
        Self {
            object,
            flags: BaseFlags::empty(),
        }
    }
}

/// Selection of the objects participating in one view of a scene.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewLayer {
    pub name: String,
    pub bases: Vec<Base>,
}

impl ViewLayer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bases: Vec::new(),
        }
    }

    pub fn with_base(mut self, base: Base) -> Self {
        self.bases.push(base);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub master_collection: Option<IdPtr>,
    pub view_layers: Vec<ViewLayer>,
    /// Scene whose objects are shown as a background set.
    pub background_set: Option<IdPtr>,
    pub frame: f32,
}

impl Scene {
    pub fn view_layer(&self, name: &str) -> Option<&ViewLayer> {
        self.view_layers.iter().find(|layer| layer.name == name)
    }

    pub(super) fn foreach_id(&self, f: &mut impl FnMut(&IdPtr)) {
        if let Some(collection) = &self.master_collection {
            f(collection);
        }
        for layer in &self.view_layers {
            for base in &layer.bases {
                f(&base.object);
            }
        }
        if let Some(set) = &self.background_set {
            f(set);
        }
    }

    pub(super) fn foreach_id_mut(&mut self, f: &mut impl FnMut(&mut IdPtr)) {
        if let Some(collection) = &mut self.master_collection {
            f(collection);
        }
        for layer in &mut self.view_layers {
            for base in &mut layer.bases {
                f(&mut base.object);
            }
        }
        if let Some(set) = &mut self.background_set {
            f(set);
        }
    }
}

/// Animation curve bound to a property path of its owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FCurve {
    pub rna_path: String,
    pub array_index: usize,
}

impl FCurve {
    pub fn new(rna_path: impl Into<String>, array_index: usize) -> Self {
        Self {
            rna_path: rna_path.into(),
            array_index,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub fcurves: Vec<FCurve>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverVariable {
    pub name: String,
    pub target: IdPtr,
    pub rna_path: String,
}

/// A driver computing one property from other properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Driver {
    pub rna_path: String,
    pub array_index: usize,
    pub variables: Vec<DriverVariable>,
    /// The driver expression reads the current frame.
    pub uses_time: bool,
}

impl Driver {
    pub fn new(rna_path: impl Into<String>, array_index: usize) -> Self {
        Self {
            rna_path: rna_path.into(),
            array_index,
            variables: Vec::new(),
            uses_time: false,
        }
    }

    pub fn with_variable(
        mut self,
        name: impl Into<String>,
        target: IdPtr,
        rna_path: impl Into<String>,
    ) -> Self {
        self.variables.push(DriverVariable {
            name: name.into(),
            target,
            rna_path: rna_path.into(),
        });
        self
    }
}

/// Animation attached to a datablock.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnimData {
    pub action: Option<IdPtr>,
    pub drivers: Vec<Driver>,
}

impl AnimData {
    pub(super) fn foreach_id(&self, f: &mut impl FnMut(&IdPtr)) {
        if let Some(action) = &self.action {
            f(action);
        }
        for driver in &self.drivers {
            for variable in &driver.variables {
                f(&variable.target);
            }
        }
    }

    pub(super) fn foreach_id_mut(&mut self, f: &mut impl FnMut(&mut IdPtr)) {
        if let Some(action) = &mut self.action {
            f(action);
        }
        for driver in &mut self.drivers {
            for variable in &mut driver.variables {
                f(&mut variable.target);
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub filepath: String,
}
