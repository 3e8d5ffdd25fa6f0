//! Segmentation camera.
//!
//! The material switcher encodes every labelled visual's id and label into
//! the colour channels of an `Rgba8Unorm` ID mask: id split across two
//! 8-bit channels, label in the third. Unlabelled visuals and uncovered
//! pixels carry the background label. The mask is read back directly; the
//! CPU side exposes it both as a raw 3-channel buffer and as a decoded
//! [`LabelMap`].

use glam::{Vec3, Vec4};
use gxtk::{Camera, ColorAttachment, DepthAttachment, GpuContext, Projection};
use scene::{keys, Scene, Value, Visual};

use crate::{
    decode::{pack_id_label, LabelMap},
    error::Error,
    events::{Connection, EventHub, Frame},
    params::SegmentationCameraParams,
    pipeline::{collect_objects, MeshCache, PipelineState, ScenePass},
    sensors::Sensor,
    switcher::{MaterialSwitcher, ScopedMaterialSwitch, UnresolvedPolicy},
};

/// Encodes one visual's id and label the way the ID-mask shader expects:
/// unorm channels carrying `(id / 256, id % 256, label)`.
pub(crate) fn encode_id_label(visual: &Visual, label: u8) -> Vec4 {
    if visual.id.0 > 0xffff {
        log::warn!(
            "{} exceeds the 16-bit mask id range, aliased to {}",
            visual.id,
            visual.id.0 & 0xffff
        );
    }
    let id = (visual.id.0 & 0xffff) as u16;
    let px = pack_id_label(id, label);
    Vec4::new(
        px[0] as f32 / 255.0,
        px[1] as f32 / 255.0,
        px[2] as f32 / 255.0,
        1.0,
    )
}

/// Builds the id/label switcher shared with the bounding-box camera.
pub(crate) fn id_label_switcher(background_label: u8) -> MaterialSwitcher {
    let background = Vec4::new(0.0, 0.0, background_label as f32 / 255.0, 1.0);
    MaterialSwitcher::new(
        keys::LABEL,
        UnresolvedPolicy::Background(background),
        |visual, value| {
            let label = value.and_then(Value::as_i64)?;
            if !(0..=255).contains(&label) {
                log::warn!("{} has out-of-range label {label}, treated as unlabelled", visual.id);
                return None;
            }
            Some(encode_id_label(visual, label as u8))
        },
    )
}

/// A segmentation camera producing a per-pixel ID mask.
pub struct SegmentationCamera {
    name: String,
    params: SegmentationCameraParams,
    /// Camera pose; free to change between frames.
    pub camera: Camera,
    state: PipelineState,
    meshes: MeshCache,
    scene_pass: Option<ScenePass>,
    mask: Option<ColorAttachment>,
    depth_target: Option<DepthAttachment>,
    rgba: Vec<u8>,
    frame: Frame<u8>,
    frames: EventHub<Frame<u8>>,
}

impl SegmentationCamera {
    /// Creates a segmentation camera with validated parameters.
    pub fn new(name: impl Into<String>, params: SegmentationCameraParams) -> Result<Self, Error> {
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
            frame: Frame::default(),
            frames: EventHub::new(),
        })
    }

    /// Subscribes to raw ID-mask frames (3 channels, `PF_R8G8B8`:
    /// id / 256, id % 256, label). Use [`LabelMap::from_colored_buffer`]
    /// to split them into id and label planes.
    pub fn connect(
        &self,
        callback: impl FnMut(&Frame<u8>) + Send + 'static,
    ) -> Connection<Frame<u8>> {
        self.frames.connect(callback)
    }

    /// Decodes the most recent frame into a label map. Empty before the
    /// first subscribed `post_render`.
    pub fn label_map(&self) -> LabelMap {
        LabelMap::from_colored_buffer(&self.frame.data, 3)
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
        log::debug!("Built segmentation camera '{}' pipeline ({w}x{h})", self.name);
        Ok(())
    }
}

impl Sensor for SegmentationCamera {
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
                "Segmentation camera '{}' rendered before pre_render",
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
        // Uncovered pixels decode to (id 0, background label).
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

    fn post_render(&mut self, ctx: &GpuContext, _scene_graph: &Scene) {
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
        self.frame.data.clear();
        self.frame
            .data
            .extend(self.rgba.chunks_exact(4).flat_map(|px| &px[..3]));
        self.frame.width = w;
        self.frame.height = h;
        self.frame.channels = 3;
        self.frame.format = "PF_R8G8B8";
        self.frames.emit(&self.frame);
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
        log::debug!("Destroyed segmentation camera '{}'", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::CameraParams;

    fn params() -> SegmentationCameraParams {
        SegmentationCameraParams {
            camera: CameraParams {
                width: 64,
                height: 48,
                near_clip: 0.1,
                far_clip: 100.0,
                fov_y: 1.0,
                visibility_mask: scene::VISIBILITY_ALL,
            },
            background_label: 255,
        }
    }

    #[test]
    fn labelled_visual_encodes_id_and_label() {
        let mut s = Scene::new();
        let id = s.create_visual("car");
        s.visual_mut(id).unwrap().set_metadata(keys::LABEL, 3i64);

        let switcher = id_label_switcher(255);
        let switched = ScopedMaterialSwitch::apply(&mut s, &switcher);
        let param = switched.scene().visual(id).unwrap().material.custom_param.unwrap();
        let expected = encode_id_label(switched.scene().visual(id).unwrap(), 3);
        assert_eq!(param, expected);
        // Label channel carries the class.
        assert_eq!((param.z * 255.0).round() as u8, 3);
    }

    #[test]
    fn unlabelled_visual_gets_background_sentinel() {
        let mut s = Scene::new();
        let id = s.create_visual("unlabelled");
        let switcher = id_label_switcher(255);
        let switched = ScopedMaterialSwitch::apply(&mut s, &switcher);
        let param = switched.scene().visual(id).unwrap().material.custom_param.unwrap();
        assert_eq!((param.z * 255.0).round() as u8, 255);
        assert_eq!((param.x * 255.0).round() as u8, 0);
    }

    #[test]
    fn out_of_range_label_treated_as_background() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut s = Scene::new();
        let id = s.create_visual("weird");
        s.visual_mut(id).unwrap().set_metadata(keys::LABEL, 4096i64);
        let switcher = id_label_switcher(255);
        let switched = ScopedMaterialSwitch::apply(&mut s, &switcher);
        let param = switched.scene().visual(id).unwrap().material.custom_param.unwrap();
        assert_eq!((param.z * 255.0).round() as u8, 255);
    }

    #[test]
    fn oversized_id_aliases_into_the_16_bit_mask_range() {
        let _ = env_logger::builder().is_test(true).try_init();
        let visual = Visual {
            id: scene::VisualId(0x1_0007),
            name: "clone".into(),
            parent: None,
            local_transform: glam::Mat4::IDENTITY,
            mesh: None,
            material: scene::Material::default(),
            visibility: scene::VISIBILITY_ALL,
            metadata: scene::MetadataMap::new(),
        };
        // Ids above 65535 wrap into the mask range (with a warning); the
        // encoded channels carry the low 16 bits.
        let px = encode_id_label(&visual, 1);
        assert_eq!((px.x * 255.0).round() as u8, 0);
        assert_eq!((px.y * 255.0).round() as u8, 7);
        assert_eq!((px.z * 255.0).round() as u8, 1);
    }

    #[test]
    fn data_wanted_only_while_a_subscriber_is_connected() {
        let cam = SegmentationCamera::new("s", params()).unwrap();
        assert!(!cam.wants_data());
        let c = cam.connect(|_| {});
        assert!(cam.wants_data());
        drop(c);
        assert!(!cam.wants_data());
    }

    #[test]
    fn destroy_is_idempotent() {
        let mut cam = SegmentationCamera::new("s", params()).unwrap();
        cam.destroy();
        cam.destroy();
        assert!(matches!(cam.init(), Err(Error::Destroyed)));
    }
}
