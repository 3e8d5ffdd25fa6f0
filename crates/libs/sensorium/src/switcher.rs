//! Material switching for metadata-encoding passes.
//!
//! Several sensors need per-object metadata visible to a fragment shader for
//! exactly one pass: the segmentation and bounding-box cameras encode
//! `(id, label)`, the thermal camera a temperature, the lidar a
//! retro-reflectivity. The switcher walks every visual right before the pass,
//! encodes the relevant value into the material's custom `vec4` parameter,
//! and restores the original materials when the pass is over. Restoration is
//! tied to a guard's `Drop`, so the scene is whole again even when the pass
//! body bails out early.

use glam::Vec4;
use scene::{Scene, Value, Visual, VisualId};

/// What to do with a visual whose metadata key is missing or non-numeric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnresolvedPolicy {
    /// Leave the visual untouched; it renders with its own material and the
    /// decode stage sees whatever that produces (thermal, bounding-box).
    Skip,
    /// Encode the given background/sentinel vector instead (segmentation).
    Background(Vec4),
}

/// Encoder turning one visual's metadata into a shader-visible `vec4`.
///
/// Returning `None` means "no encoding for this visual"; the
/// [`UnresolvedPolicy`] then decides what happens.
pub type EncodeFn = dyn Fn(&Visual, Option<&Value>) -> Option<Vec4>;

/// Per-pass material switcher configuration.
pub struct MaterialSwitcher {
    /// Metadata key read from every visual.
    pub key: &'static str,
    /// Encoder from metadata to the custom shader parameter.
    pub encode: Box<EncodeFn>,
    /// Policy for visuals the encoder declines.
    pub unresolved: UnresolvedPolicy,
}

impl MaterialSwitcher {
    /// Creates a switcher reading `key` and encoding with `encode`.
    pub fn new(
        key: &'static str,
        unresolved: UnresolvedPolicy,
        encode: impl Fn(&Visual, Option<&Value>) -> Option<Vec4> + 'static,
    ) -> Self {
        Self {
            key,
            encode: Box::new(encode),
            unresolved,
        }
    }
}

/// Scope guard holding the switched scene.
///
/// Constructed by [`ScopedMaterialSwitch::apply`]; while alive, every visual
/// the switcher resolved carries the encoded custom parameter. Dropping the
/// guard restores all saved materials, in any order. At most one guard can
/// exist per scene at a time since it borrows the scene mutably, which is
/// exactly the "one active switcher" invariant the render loop relies on.
pub struct ScopedMaterialSwitch<'a> {
    scene: &'a mut Scene,
    saved: Vec<(VisualId, scene::Material)>,
}

impl<'a> ScopedMaterialSwitch<'a> {
    /// Switches every visual's material according to `switcher`.
    pub fn apply(scene_graph: &'a mut Scene, switcher: &MaterialSwitcher) -> Self {
        let mut saved = Vec::with_capacity(scene_graph.len());
        let mut skipped = 0usize;
        for visual in scene_graph.visuals_mut() {
            let value = visual.metadata.get(switcher.key);
            let encoded = (switcher.encode)(visual, value);
            let param = match (encoded, switcher.unresolved) {
                (Some(param), _) => param,
                (None, UnresolvedPolicy::Background(param)) => param,
                (None, UnresolvedPolicy::Skip) => {
                    skipped += 1;
                    continue;
                }
            };
            saved.push((visual.id, visual.material.clone()));
            visual.material = visual.material.clone().with_custom_param(param);
        }
        if skipped > 0 {
            log::debug!(
                "Material switch '{}' skipped {skipped} unresolved visual(s)",
                switcher.key
            );
        }
        Self {
            scene: scene_graph,
            saved,
        }
    }

    /// The scene with switched materials, for pass recording.
    pub fn scene(&self) -> &Scene {
        self.scene
    }

    /// Number of visuals that were switched.
    pub fn switched(&self) -> usize {
        self.saved.len()
    }
}

impl Drop for ScopedMaterialSwitch<'_> {
    fn drop(&mut self) {
        for (id, material) in self.saved.drain(..) {
            match self.scene.visual_mut(id) {
                Some(visual) => visual.material = material,
                // Destroying a visual mid-pass is not supported, but failing
                // to restore the rest of the scene over it would be worse.
                None => log::error!("Cannot restore material, {id} vanished during the pass"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scene::keys;

    fn scene_with_labels() -> (Scene, VisualId, VisualId) {
        let mut s = Scene::new();
        let a = s.create_visual("a");
        let b = s.create_visual("b");
        s.visual_mut(a).unwrap().set_metadata(keys::LABEL, 3i64);
        (s, a, b)
    }

    fn label_switcher(unresolved: UnresolvedPolicy) -> MaterialSwitcher {
        MaterialSwitcher::new(keys::LABEL, unresolved, |_, value| {
            value
                .and_then(Value::as_i64)
                .map(|label| Vec4::new(label as f32, 0.0, 0.0, 1.0))
        })
    }

    #[test]
    fn materials_restored_after_drop() {
        let (mut s, a, b) = scene_with_labels();
        let before_a = s.visual(a).unwrap().material.clone();
        let before_b = s.visual(b).unwrap().material.clone();
        {
            let switched = ScopedMaterialSwitch::apply(&mut s, &label_switcher(UnresolvedPolicy::Skip));
            assert_eq!(switched.switched(), 1);
            let mat = &switched.scene().visual(a).unwrap().material;
            assert_eq!(mat.custom_param, Some(Vec4::new(3.0, 0.0, 0.0, 1.0)));
        }
        assert_eq!(s.visual(a).unwrap().material, before_a);
        assert_eq!(s.visual(b).unwrap().material, before_b);
    }

    #[test]
    fn skip_policy_leaves_unlabelled_untouched() {
        let (mut s, _, b) = scene_with_labels();
        let switched = ScopedMaterialSwitch::apply(&mut s, &label_switcher(UnresolvedPolicy::Skip));
        assert_eq!(
            switched.scene().visual(b).unwrap().material.custom_param,
            None
        );
    }

    #[test]
    fn background_policy_encodes_sentinel() {
        let (mut s, _, b) = scene_with_labels();
        let sentinel = Vec4::new(255.0, 255.0, 255.0, 1.0);
        let switched = ScopedMaterialSwitch::apply(
            &mut s,
            &label_switcher(UnresolvedPolicy::Background(sentinel)),
        );
        assert_eq!(switched.switched(), 2);
        assert_eq!(
            switched.scene().visual(b).unwrap().material.custom_param,
            Some(sentinel)
        );
    }

    #[test]
    fn restored_even_when_pass_body_panics() {
        let (mut s, a, _) = scene_with_labels();
        let before = s.visual(a).unwrap().material.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _switched =
                ScopedMaterialSwitch::apply(&mut s, &label_switcher(UnresolvedPolicy::Skip));
            panic!("pass body failed");
        }));
        assert!(result.is_err());
        assert_eq!(s.visual(a).unwrap().material, before);
    }
}
