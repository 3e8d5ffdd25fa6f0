//! Visuals: scene nodes with geometry, material and metadata.

use crate::{material::Material, mesh::TriMesh, metadata::MetadataMap, metadata::Value};
use glam::Mat4;
use std::sync::Arc;

/// Stable identifier of a visual.
///
/// Renderables and sensor-side caches store only this id and resolve it
/// through the [`Scene`](crate::Scene); nothing holds a pointer back into the
/// scene graph.
///
/// Segmentation masks carry only the low 16 bits; ids above 65535 alias in
/// the mask and the encoding warns about them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VisualId(pub u32);

impl std::fmt::Display for VisualId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "visual#{}", self.0)
    }
}

/// A renderable scene object.
#[derive(Debug, Clone)]
pub struct Visual {
    /// Stable id, assigned by the scene at creation.
    pub id: VisualId,
    /// Human-readable name, used in logs only. Multi-link objects merge
    /// into one bounding box via their top-level ancestor's id.
    pub name: String,
    /// Parent visual; `None` for top-level visuals (children of the root).
    pub parent: Option<VisualId>,
    /// Local transform relative to the parent.
    pub local_transform: Mat4,
    /// Attached geometry; visuals without geometry are skipped by scene
    /// passes.
    pub mesh: Option<Arc<TriMesh>>,
    /// Current material.
    pub material: Material,
    /// Visibility mask; a pass renders the visual only when the pass mask
    /// and this mask share a bit.
    pub visibility: u32,
    /// Open-ended sensor annotations.
    pub metadata: MetadataMap,
}

/// All visibility bits set; visuals are visible to every pass by default.
pub const VISIBILITY_ALL: u32 = u32::MAX;

impl Visual {
    /// Reads a metadata value.
    pub fn metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Sets a metadata value, replacing any previous value for `key`.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }
}
