//! Bounding-box camera.
//!
//! Renders the same ID mask as the segmentation camera, then extracts
//! structured boxes on the CPU: per-pixel extents in visible-box mode,
//! per-vertex projection in full-box mode, oriented camera-space boxes in
//! 3D mode. Links sharing a top-level ancestor merge into one box.

use glam::{Mat4, Vec3};
use gxtk::{Camera, ColorAttachment, DepthAttachment, GpuContext, Projection};
use scene::{Scene, VisualId};

use crate::{
    decode::{
        camera_space_points, full_extent, merge_boxes_2d, merge_boxes_3d, visible_extents,
        BoundingBox2d, BoundingBox3d, Extent2,
    },
    error::Error,
    events::{Connection, EventHub},
    params::{BoundingBoxCameraParams, BoundingBoxType},
    pipeline::{collect_objects, MeshCache, PipelineState, ScenePass},
    sensors::{segmentation::id_label_switcher, Sensor},
    switcher::ScopedMaterialSwitch,
};

/// Decoded boxes of one frame, 2D or 3D depending on the configured mode.
#[derive(Debug, Clone)]
pub enum BoundingBoxes {
    /// Screen-space boxes (visible-box and full-box modes).
    TwoDim(Vec<BoundingBox2d>),
    /// Oriented camera-space boxes.
    ThreeDim(Vec<BoundingBox3d>),
}

impl Default for BoundingBoxes {
    fn default() -> Self {
        BoundingBoxes::TwoDim(Vec::new())
    }
}

/// Extracts structured boxes from a tightly packed RGBA8 ID mask.
///
/// Split out of the sensor so the decode semantics are exercisable without
/// a GPU; `post_render` feeds it the read-back mask.
fn extract_boxes(
    scene_graph: &Scene,
    view: Mat4,
    projection: &Projection,
    mask: &[u8],
    width: u32,
    height: u32,
    params: &BoundingBoxCameraParams,
) -> BoundingBoxes {
    let mut entries: Vec<(u16, (Extent2, u8))> =
        visible_extents(mask, width, height, params.background_label)
            .into_iter()
            .collect();
    // Stable merge-group order regardless of hash iteration.
    entries.sort_by_key(|(id, _)| *id);

    let mut skipped = 0usize;
    let group_key = |id: VisualId| {
        scene_graph
            .top_level_ancestor(id)
            .map(|ancestor| ancestor.id)
            .unwrap_or(id)
    };
    let boxes = match params.box_type {
        BoundingBoxType::VisibleBox2d => {
            let links = entries
                .into_iter()
                .map(|(id, (extent, label))| (group_key(VisualId(id as u32)), extent, label))
                .collect();
            BoundingBoxes::TwoDim(merge_boxes_2d(links))
        }
        BoundingBoxType::FullBox2d => {
            let view_proj = projection.matrix() * view;
            let mut links = Vec::new();
            for (id, (_, label)) in entries {
                let visual_id = VisualId(id as u32);
                let Some(visual) = scene_graph.visual(visual_id) else {
                    skipped += 1;
                    continue;
                };
                let Some(mesh) = &visual.mesh else { continue };
                let model = scene_graph.world_transform(visual_id);
                if let Some(extent) = full_extent(mesh, model, view_proj, width, height) {
                    links.push((group_key(visual_id), extent, label));
                }
            }
            BoundingBoxes::TwoDim(merge_boxes_2d(links))
        }
        BoundingBoxType::Box3d => {
            let mut links = Vec::new();
            for (id, (_, label)) in entries {
                let visual_id = VisualId(id as u32);
                let Some(visual) = scene_graph.visual(visual_id) else {
                    skipped += 1;
                    continue;
                };
                let Some(mesh) = &visual.mesh else { continue };
                let model = scene_graph.world_transform(visual_id);
                let points = camera_space_points(mesh, model, view);
                if !points.iter().any(|p| projection.contains_view_point(*p)) {
                    continue;
                }
                links.push((group_key(visual_id), points, label));
            }
            BoundingBoxes::ThreeDim(merge_boxes_3d(links))
        }
    };
    if skipped > 0 {
        log::debug!("Bounding-box decode skipped {skipped} unresolved visual(s)");
    }
    boxes
}

/// A camera producing structured bounding boxes instead of a pixel buffer.
pub struct BoundingBoxCamera {
    name: String,
    params: BoundingBoxCameraParams,
    /// Camera pose; free to change between frames.
    pub camera: Camera,
    state: PipelineState,
    meshes: MeshCache,
    scene_pass: Option<ScenePass>,
    mask: Option<ColorAttachment>,
    depth_target: Option<DepthAttachment>,
    rgba: Vec<u8>,
    boxes: BoundingBoxes,
    frames: EventHub<BoundingBoxes>,
}

impl BoundingBoxCamera {
    /// Creates a bounding-box camera with validated parameters.
    pub fn new(name: impl Into<String>, params: BoundingBoxCameraParams) -> Result<Self, Error> {
        Ok(Self {
            name: name.into(),
            params: params.validate()?,
            camera: Camera::new(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y),
            state: PipelineState::Unbuilt,
            meshes: MeshCache::default(),
            scene_pass: None,
            mask: None,
            depth_target: None,
            rgba: Vec::new(),
            boxes: BoundingBoxes::default(),
            frames: EventHub::new(),
        })
    }

    /// Subscribes to per-frame structured boxes.
    pub fn connect(
        &self,
        callback: impl FnMut(&BoundingBoxes) + Send + 'static,
    ) -> Connection<BoundingBoxes> {
        self.frames.connect(callback)
    }

    fn projection(&self) -> Projection {
        let c = &self.params.camera;
        Projection::new(c.fov_y, c.aspect(), c.near_clip, c.far_clip)
    }

    fn build(&mut self, ctx: &GpuContext) -> Result<(), Error> {
        let device = &ctx.device;
        let (w, h) = (self.params.camera.width, self.params.camera.height);
        let mask = ColorAttachment::new(
            device,
            w,
            h,
            wgpu::TextureFormat::Rgba8Unorm,
            &format!("{}-mask", self.name),
        )
        .ok_or_else(|| Error::ResourceCreation("mask attachment".into()))?;
        let depth_target = DepthAttachment::new(device, w, h, &format!("{}-depth", self.name))
            .ok_or_else(|| Error::ResourceCreation("depth attachment".into()))?;
        self.scene_pass = Some(ScenePass::new(
            device,
            Some(mask.format),
            &format!("{}-scene", self.name),
        ));
        self.mask = Some(mask);
        self.depth_target = Some(depth_target);
        self.state = PipelineState::Ready;
        log::debug!("Built bounding-box camera '{}' pipeline ({w}x{h})", self.name);
        Ok(())
    }
}

impl Sensor for BoundingBoxCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self) -> Result<(), Error> {
        if self.state == PipelineState::Destroyed {
            return Err(Error::Destroyed);
        }
        Ok(())
    }

    fn wants_data(&self) -> bool {
        self.frames.has_subscribers()
    }

    fn pre_render(&mut self, ctx: &GpuContext, scene_graph: &Scene) -> Result<(), Error> {
        if self.state == PipelineState::Destroyed {
            return Err(Error::Destroyed);
        }
        if self.state == PipelineState::Unbuilt {
            self.build(ctx)?;
        }
        self.meshes.sync(&ctx.device, scene_graph);
        Ok(())
    }

    fn render(&mut self, ctx: &GpuContext, scene_graph: &mut Scene) {
        if self.state != PipelineState::Ready {
            log::error!(
                "Bounding-box camera '{}' rendered before pre_render",
                self.name
            );
            return;
        }
        let view_proj = self.projection().matrix() * self.camera.view_matrix();
        let switcher = id_label_switcher(self.params.background_label);
        let switched = ScopedMaterialSwitch::apply(scene_graph, &switcher);
        let (objects, ids) =
            collect_objects(switched.scene(), self.params.camera.visibility_mask);
        let draws: Vec<_> = ids
            .iter()
            .enumerate()
            .filter_map(|(slot, id)| self.meshes.get(*id).map(|m| (slot as u32, m)))
            .collect();

        let scene_pass = self.scene_pass.as_mut().unwrap();
        scene_pass.upload(&ctx.device, &ctx.queue, view_proj, &objects);
        let clear = wgpu::Color {
            r: 0.0,
            g: 0.0,
            b: self.params.background_label as f64 / 255.0,
            a: 1.0,
        };
        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(&format!("{}-encoder", self.name)),
            });
        scene_pass.record(
            &mut encoder,
            Some((&self.mask.as_ref().unwrap().view, clear)),
            &self.depth_target.as_ref().unwrap().view,
            &draws,
        );
        ctx.queue.submit(std::iter::once(encoder.finish()));
        drop(switched);
    }

    fn post_render(&mut self, ctx: &GpuContext, scene_graph: &Scene) {
        if self.state != PipelineState::Ready || !self.wants_data() {
            return;
        }
        let mask = self.mask.as_ref().unwrap();
        let (w, h) = (self.params.camera.width, self.params.camera.height);

        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(&format!("{}-readback", self.name)),
            });
        mask.copy_to_storage(&mut encoder);
        ctx.queue.submit(std::iter::once(encoder.finish()));

        self.rgba.resize((w * h * 4) as usize, 0);
        mask.read_back(&ctx.device, &mut self.rgba);
        self.boxes = extract_boxes(
            scene_graph,
            self.camera.view_matrix(),
            &self.projection(),
            &self.rgba,
            w,
            h,
            &self.params,
        );
        self.frames.emit(&self.boxes);
    }

    fn destroy(&mut self) {
        if self.state == PipelineState::Destroyed {
            return;
        }
        self.scene_pass = None;
        self.mask = None;
        self.depth_target = None;
        self.meshes.clear();
        self.state = PipelineState::Destroyed;
        log::debug!("Destroyed bounding-box camera '{}'", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::pack_id_label;
    use crate::params::CameraParams;
    use approx::assert_relative_eq;
    use scene::TriMesh;
    use std::sync::Arc;

    fn params(box_type: BoundingBoxType) -> BoundingBoxCameraParams {
        BoundingBoxCameraParams {
            camera: CameraParams {
                width: 32,
                height: 32,
                near_clip: 0.1,
                far_clip: 100.0,
                fov_y: std::f32::consts::FRAC_PI_2,
                visibility_mask: scene::VISIBILITY_ALL,
            },
            box_type,
            background_label: 255,
        }
    }

    /// Paints `extent` (inclusive pixel bounds) with one visual's encoding.
    fn paint(mask: &mut [u8], width: u32, id: u16, label: u8, x: (u32, u32), y: (u32, u32)) {
        let px = pack_id_label(id, label);
        for yy in y.0..=y.1 {
            for xx in x.0..=x.1 {
                let at = 4 * (yy * width + xx) as usize;
                mask[at..at + 4].copy_from_slice(&px);
            }
        }
    }

    fn background_mask(width: u32, height: u32, label: u8) -> Vec<u8> {
        let px = pack_id_label(0, label);
        px.iter()
            .copied()
            .cycle()
            .take((width * height * 4) as usize)
            .collect()
    }

    #[test]
    fn visible_mode_merges_links_of_one_object() {
        let mut s = Scene::new();
        let root = s.create_visual("robot");
        let left = s.create_child_visual("left", root);
        let right = s.create_child_visual("right", root);
        let p = params(BoundingBoxType::VisibleBox2d);

        let mut mask = background_mask(32, 32, 255);
        paint(&mut mask, 32, left.0 as u16, 5, (8, 12), (8, 12));
        paint(&mut mask, 32, right.0 as u16, 5, (18, 22), (8, 12));

        let view = Mat4::IDENTITY;
        let proj = Projection::new(1.0, 1.0, 0.1, 100.0);
        let boxes = extract_boxes(&s, view, &proj, &mask, 32, 32, &p);
        let BoundingBoxes::TwoDim(boxes) = boxes else {
            panic!("expected 2d boxes")
        };
        assert_eq!(boxes.len(), 1);
        assert_relative_eq!(boxes[0].center.x, 15.0);
        assert_relative_eq!(boxes[0].center.y, 10.0);
        assert_relative_eq!(boxes[0].size.x, 14.0);
        assert_relative_eq!(boxes[0].size.y, 4.0);
        assert_eq!(boxes[0].label, 5);
    }

    #[test]
    fn visible_mode_output_is_reversed_id_order() {
        let mut s = Scene::new();
        let a = s.create_visual("first");
        let b = s.create_visual("second");
        let p = params(BoundingBoxType::VisibleBox2d);

        let mut mask = background_mask(32, 32, 255);
        paint(&mut mask, 32, a.0 as u16, 1, (0, 3), (0, 3));
        paint(&mut mask, 32, b.0 as u16, 2, (10, 13), (10, 13));

        let proj = Projection::new(1.0, 1.0, 0.1, 100.0);
        let BoundingBoxes::TwoDim(boxes) =
            extract_boxes(&s, Mat4::IDENTITY, &proj, &mask, 32, 32, &p)
        else {
            panic!("expected 2d boxes")
        };
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].label, 2);
        assert_eq!(boxes[1].label, 1);
    }

    #[test]
    fn full_mode_projects_occluded_geometry() {
        let mut s = Scene::new();
        let id = s.create_visual("cube");
        s.attach_mesh(id, Arc::new(TriMesh::cuboid(Vec3::ONE)));
        s.visual_mut(id).unwrap().local_transform =
            Mat4::from_translation(Vec3::new(0.0, 0.0, -10.0));
        let p = params(BoundingBoxType::FullBox2d);

        // A single visible pixel; the full box still comes from the mesh.
        let mut mask = background_mask(32, 32, 255);
        paint(&mut mask, 32, id.0 as u16, 7, (16, 16), (16, 16));

        let proj = Projection::new(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 100.0);
        let BoundingBoxes::TwoDim(boxes) =
            extract_boxes(&s, Mat4::IDENTITY, &proj, &mask, 32, 32, &p)
        else {
            panic!("expected 2d boxes")
        };
        assert_eq!(boxes.len(), 1);
        // Unit cube at distance 10 under 90 degree fov: half extent of
        // 0.5 / 9.5 in ndc of the near face, a handful of pixels wide.
        assert_relative_eq!(boxes[0].center.x, 16.0, epsilon = 0.1);
        assert!(boxes[0].size.x > 1.0 && boxes[0].size.x < 4.0);
    }

    #[test]
    fn box3d_mode_produces_oriented_camera_space_box() {
        let mut s = Scene::new();
        let id = s.create_visual("crate");
        s.attach_mesh(id, Arc::new(TriMesh::cuboid(Vec3::new(2.0, 1.0, 1.0))));
        s.visual_mut(id).unwrap().local_transform =
            Mat4::from_translation(Vec3::new(0.0, 0.0, -5.0));
        let p = params(BoundingBoxType::Box3d);

        let mut mask = background_mask(32, 32, 255);
        paint(&mut mask, 32, id.0 as u16, 9, (10, 20), (10, 20));

        let proj = Projection::new(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 100.0);
        let BoundingBoxes::ThreeDim(boxes) =
            extract_boxes(&s, Mat4::IDENTITY, &proj, &mask, 32, 32, &p)
        else {
            panic!("expected 3d boxes")
        };
        assert_eq!(boxes.len(), 1);
        assert_relative_eq!(boxes[0].center.z, -5.0, epsilon = 1e-4);
        let mut dims = [boxes[0].size.x, boxes[0].size.y, boxes[0].size.z];
        dims.sort_by(f32::total_cmp);
        assert_relative_eq!(dims[2], 2.0, epsilon = 1e-3);
    }

    #[test]
    fn out_of_frustum_object_is_filtered_in_3d_mode() {
        let mut s = Scene::new();
        let id = s.create_visual("behind");
        s.attach_mesh(id, Arc::new(TriMesh::cuboid(Vec3::ONE)));
        s.visual_mut(id).unwrap().local_transform =
            Mat4::from_translation(Vec3::new(0.0, 0.0, 5.0));
        let p = params(BoundingBoxType::Box3d);

        // Stale mask entry for an object behind the camera.
        let mut mask = background_mask(32, 32, 255);
        paint(&mut mask, 32, id.0 as u16, 1, (0, 1), (0, 1));

        let proj = Projection::new(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 100.0);
        let BoundingBoxes::ThreeDim(boxes) =
            extract_boxes(&s, Mat4::IDENTITY, &proj, &mask, 32, 32, &p)
        else {
            panic!("expected 3d boxes")
        };
        assert!(boxes.is_empty());
    }

    #[test]
    fn data_wanted_only_while_a_subscriber_is_connected() {
        let cam = BoundingBoxCamera::new("b", params(BoundingBoxType::VisibleBox2d)).unwrap();
        assert!(!cam.wants_data());
        let c = cam.connect(|_| {});
        assert!(cam.wants_data());
        drop(c);
        assert!(!cam.wants_data());
    }

    #[test]
    fn destroy_is_idempotent() {
        let mut cam = BoundingBoxCamera::new("b", params(BoundingBoxType::VisibleBox2d)).unwrap();
        cam.destroy();
        cam.destroy();
        assert!(matches!(cam.init(), Err(Error::Destroyed)));
    }
}
