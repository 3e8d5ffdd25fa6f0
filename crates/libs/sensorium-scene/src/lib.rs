//! Scene substrate consumed by the sensorium sensor pipelines.
//!
//! The sensors treat the scene as a read-only source of renderable objects
//! and their annotations; the only mutation they ever perform is the scoped
//! material switch during one render pass, and that through the scene's own
//! accessors. Scene-graph editing beyond what the sensors need (create a
//! visual, attach a mesh, set metadata) is out of scope here.

pub mod material;
pub mod mesh;
pub mod metadata;
pub mod visual;

pub use material::Material;
pub use mesh::{Aabb, Obb, TriMesh};
pub use metadata::{keys, MetadataMap, Value};
pub use visual::{Visual, VisualId, VISIBILITY_ALL};

use glam::Mat4;
use std::{collections::BTreeMap, sync::Arc};

/// The scene: a registry of visuals keyed by stable id.
///
/// Iteration order is the id order (BTreeMap), which keeps pass recording
/// and CPU decode deterministic across frames.
#[derive(Debug, Default)]
pub struct Scene {
    visuals: BTreeMap<VisualId, Visual>,
    next_id: u32,
}

impl Scene {
    /// Creates an empty scene.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a visual and returns its id.
    pub fn create_visual(&mut self, name: impl Into<String>) -> VisualId {
        let id = VisualId(self.next_id);
        self.next_id += 1;
        self.visuals.insert(
            id,
            Visual {
                id,
                name: name.into(),
                parent: None,
                local_transform: Mat4::IDENTITY,
                mesh: None,
                material: Material::default(),
                visibility: VISIBILITY_ALL,
                metadata: MetadataMap::new(),
            },
        );
        id
    }

    /// Creates a visual parented to `parent`.
    pub fn create_child_visual(&mut self, name: impl Into<String>, parent: VisualId) -> VisualId {
        let id = self.create_visual(name);
        if self.visuals.contains_key(&parent) {
            self.visuals.get_mut(&id).unwrap().parent = Some(parent);
        } else {
            log::error!("Parent {parent} does not exist, created top-level visual instead");
        }
        id
    }

    /// Removes a visual. Children are re-parented to the root.
    pub fn destroy_visual(&mut self, id: VisualId) {
        if self.visuals.remove(&id).is_none() {
            return;
        }
        for v in self.visuals.values_mut() {
            if v.parent == Some(id) {
                v.parent = None;
            }
        }
    }

    /// Resolves an id to its visual.
    pub fn visual(&self, id: VisualId) -> Option<&Visual> {
        self.visuals.get(&id)
    }

    /// Resolves an id to its visual, mutably.
    pub fn visual_mut(&mut self, id: VisualId) -> Option<&mut Visual> {
        self.visuals.get_mut(&id)
    }

    /// Iterates over all visuals in id order.
    pub fn visuals(&self) -> impl Iterator<Item = &Visual> {
        self.visuals.values()
    }

    /// Iterates over all visuals mutably, in id order.
    pub fn visuals_mut(&mut self) -> impl Iterator<Item = &mut Visual> {
        self.visuals.values_mut()
    }

    /// Number of visuals.
    pub fn len(&self) -> usize {
        self.visuals.len()
    }

    /// Whether the scene has no visuals.
    pub fn is_empty(&self) -> bool {
        self.visuals.is_empty()
    }

    /// Attaches a mesh to a visual.
    pub fn attach_mesh(&mut self, id: VisualId, mesh: Arc<TriMesh>) {
        match self.visuals.get_mut(&id) {
            Some(v) => v.mesh = Some(mesh),
            None => log::error!("Cannot attach mesh, {id} does not exist"),
        }
    }

    /// World transform of a visual, composed by walking parent links.
    ///
    /// Cycles cannot occur: parents are validated at creation time and
    /// re-parenting is not exposed.
    pub fn world_transform(&self, id: VisualId) -> Mat4 {
        let mut m = Mat4::IDENTITY;
        let mut cur = self.visuals.get(&id);
        while let Some(v) = cur {
            m = v.local_transform * m;
            cur = v.parent.and_then(|p| self.visuals.get(&p));
        }
        m
    }

    /// The top-level ancestor of a visual: the last node reached by walking
    /// parent links before the (implicit) scene root. A visual without a
    /// parent is its own top-level ancestor.
    pub fn top_level_ancestor(&self, id: VisualId) -> Option<&Visual> {
        let mut cur = self.visuals.get(&id)?;
        while let Some(parent) = cur.parent.and_then(|p| self.visuals.get(&p)) {
            cur = parent;
        }
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn world_transform_composes_parent_chain() {
        let mut scene = Scene::new();
        let a = scene.create_visual("base");
        let b = scene.create_child_visual("arm", a);
        scene.visual_mut(a).unwrap().local_transform =
            Mat4::from_translation(Vec3::new(1.0, 0.0, 0.0));
        scene.visual_mut(b).unwrap().local_transform =
            Mat4::from_translation(Vec3::new(0.0, 2.0, 0.0));
        let world = scene.world_transform(b);
        assert_eq!(
            world.transform_point3(Vec3::ZERO),
            Vec3::new(1.0, 2.0, 0.0)
        );
    }

    #[test]
    fn top_level_ancestor_walks_to_root() {
        let mut scene = Scene::new();
        let a = scene.create_visual("robot");
        let b = scene.create_child_visual("link1", a);
        let c = scene.create_child_visual("link1_collision", b);
        assert_eq!(scene.top_level_ancestor(c).unwrap().id, a);
        assert_eq!(scene.top_level_ancestor(a).unwrap().id, a);
    }

    #[test]
    fn destroy_reparents_children_to_root() {
        let mut scene = Scene::new();
        let a = scene.create_visual("a");
        let b = scene.create_child_visual("b", a);
        scene.destroy_visual(a);
        assert!(scene.visual(a).is_none());
        assert_eq!(scene.visual(b).unwrap().parent, None);
    }

    #[test]
    fn metadata_round_trip() {
        let mut scene = Scene::new();
        let id = scene.create_visual("box");
        scene
            .visual_mut(id)
            .unwrap()
            .set_metadata(keys::LABEL, 12i64);
        assert_eq!(
            scene.visual(id).unwrap().metadata(keys::LABEL),
            Some(&Value::Int(12))
        );
        assert_eq!(scene.visual(id).unwrap().metadata(keys::TEMPERATURE), None);
    }
}
