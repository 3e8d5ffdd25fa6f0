//! Thermal camera.
//!
//! The material switcher encodes each visual's `"temperature"` annotation
//! into the custom shader parameter; surfaces without one render at the
//! ambient temperature, optionally derived from their material colour. The
//! scene pass writes (temperature, heat-source flag) into an `Rg32Float`
//! target, a full-screen pass adds noise to non-heat-source pixels and
//! clamps, and the CPU quantises the result into 16-bit counts.

use glam::{Vec3, Vec4};
use gxtk::{Camera, ColorAttachment, DepthAttachment, GpuContext, Projection, RenderPass};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use scene::{keys, Scene, Value};

use crate::{
    decode,
    error::Error,
    events::{Connection, EventHub, Frame},
    params::ThermalCameraParams,
    pipeline::{collect_objects, record_quad_pass, MeshCache, PipelineState, ScenePass},
    sensors::Sensor,
    switcher::{MaterialSwitcher, ScopedMaterialSwitch, UnresolvedPolicy},
};

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct ThermalPostUniforms {
    min_t: f32,
    max_t: f32,
    half_width: f32,
    seed: u32,
}

/// A thermal camera synthesising per-pixel temperatures in kelvin.
pub struct ThermalCamera {
    name: String,
    params: ThermalCameraParams,
    /// Camera pose; free to change between frames.
    pub camera: Camera,
    state: PipelineState,
    rng: ChaCha8Rng,
    meshes: MeshCache,
    scene_pass: Option<ScenePass>,
    scene_target: Option<ColorAttachment>,
    depth_target: Option<DepthAttachment>,
    post: Option<RenderPass>,
    output: Option<ColorAttachment>,
    kelvin: Vec<f32>,
    frame: Frame<u16>,
    frames: EventHub<Frame<u16>>,
}

impl ThermalCamera {
    /// Creates a thermal camera with validated parameters.
    pub fn new(name: impl Into<String>, params: ThermalCameraParams) -> Result<Self, Error> {
        Ok(Self {
            name: name.into(),
            params: params.validate()?,
            camera: Camera::new(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y),
            state: PipelineState::Unbuilt,
            rng: ChaCha8Rng::seed_from_u64(0),
            meshes: MeshCache::default(),
            scene_pass: None,
            scene_target: None,
            depth_target: None,
            post: None,
            output: None,
            kelvin: Vec::new(),
            frame: Frame::default(),
            frames: EventHub::new(),
        })
    }

    /// Re-seeds the ambient noise sequence.
    pub fn set_noise_seed(&mut self, seed: u64) {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
    }

    /// Subscribes to decoded thermal frames (1 channel, `L16`, counts of
    /// `linear_resolution` kelvin).
    pub fn connect(
        &self,
        callback: impl FnMut(&Frame<u16>) + Send + 'static,
    ) -> Connection<Frame<u16>> {
        self.frames.connect(callback)
    }

    fn projection(&self) -> Projection {
        let c = &self.params.camera;
        Projection::new(c.fov_y, c.aspect(), c.near_clip, c.far_clip)
    }

    fn switcher(&self) -> MaterialSwitcher {
        let p = self.params;
        let ambient = Vec4::new(p.ambient_temperature, 0.0, 0.0, 1.0);
        MaterialSwitcher::new(
            keys::TEMPERATURE,
            UnresolvedPolicy::Background(ambient),
            move |visual, value| {
                if let Some(t) = value.and_then(Value::as_f32) {
                    return Some(Vec4::new(t, 1.0, 0.0, 1.0));
                }
                if p.ambient_from_color {
                    let c = visual.material.color;
                    let luminance = 0.2126 * c.x + 0.7152 * c.y + 0.0722 * c.z;
                    let t = p.ambient_temperature
                        + (luminance - 0.5) * p.ambient_temperature_range;
                    return Some(Vec4::new(t, 0.0, 0.0, 1.0));
                }
                None
            },
        )
    }

    fn build(&mut self, ctx: &GpuContext) -> Result<(), Error> {
        let device = &ctx.device;
        let (w, h) = (self.params.camera.width, self.params.camera.height);
        let scene_target = ColorAttachment::new(
            device,
            w,
            h,
            wgpu::TextureFormat::Rg32Float,
            &format!("{}-scene-target", self.name),
        )
        .ok_or_else(|| Error::ResourceCreation("scene attachment".into()))?;
        let depth_target = DepthAttachment::new(device, w, h, &format!("{}-depth", self.name))
            .ok_or_else(|| Error::ResourceCreation("depth attachment".into()))?;
        let output = ColorAttachment::new(
            device,
            w,
            h,
            wgpu::TextureFormat::R32Float,
            &format!("{}-output", self.name),
        )
        .ok_or_else(|| Error::ResourceCreation("output attachment".into()))?;
        let scene_pass = ScenePass::new(
            device,
            Some(scene_target.format),
            &format!("{}-scene", self.name),
        );

        let shader = device.create_shader_module(wgpu::include_wgsl!("../shaders/thermal.wgsl"));
        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&format!("{}-post-uniforms", self.name)),
            size: std::mem::size_of::<ThermalPostUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(&format!("{}-post-bind-group-layout", self.name)),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: wgpu::BufferSize::new(std::mem::size_of::<
                            ThermalPostUniforms,
                        >() as u64),
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
            ],
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&format!("{}-post-bind-group", self.name)),
            layout: &layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&scene_target.view),
                },
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(&format!("{}-post-pipeline-layout", self.name)),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(&format!("{}-post-pipeline", self.name)),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: "vs_quad",
                compilation_options: Default::default(),
                buffers: &[],
            },
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: "fs_thermal",
                compilation_options: Default::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: output.format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            multiview: None,
            cache: None,
        });

        self.scene_target = Some(scene_target);
        self.depth_target = Some(depth_target);
        self.output = Some(output);
        self.scene_pass = Some(scene_pass);
        self.post = Some(RenderPass {
            pipeline,
            bind_groups: vec![bind_group],
            uniform_buffer: Some(uniform_buffer),
        });
        self.state = PipelineState::Ready;
        log::debug!("Built thermal camera '{}' pipeline ({w}x{h})", self.name);
        Ok(())
    }
}

impl Sensor for ThermalCamera {
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
            log::error!("Thermal camera '{}' rendered before pre_render", self.name);
            return;
        }
        let view_proj = self.projection().matrix() * self.camera.view_matrix();
        let switcher = self.switcher();
        let uniforms = ThermalPostUniforms {
            min_t: self.params.min_temperature,
            max_t: self.params.max_temperature,
            half_width: self.params.ambient_temperature_range,
            seed: self.rng.gen(),
        };

        let switched = ScopedMaterialSwitch::apply(scene_graph, &switcher);
        let (objects, ids) =
            collect_objects(switched.scene(), self.params.camera.visibility_mask);

        let scene_pass = self.scene_pass.as_mut().unwrap();
        scene_pass.upload(&ctx.device, &ctx.queue, view_proj, &objects);
        let post = self.post.as_ref().unwrap();
        ctx.queue.write_buffer(
            post.uniform_buffer.as_ref().unwrap(),
            0,
            bytemuck::bytes_of(&uniforms),
        );

        let draws: Vec<_> = ids
            .iter()
            .enumerate()
            .filter_map(|(slot, id)| self.meshes.get(*id).map(|m| (slot as u32, m)))
            .collect();
        let clear = wgpu::Color {
            r: self.params.ambient_temperature as f64,
            g: 0.0,
            b: 0.0,
            a: 1.0,
        };
        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(&format!("{}-encoder", self.name)),
            });
        scene_pass.record(
            &mut encoder,
            Some((&self.scene_target.as_ref().unwrap().view, clear)),
            &self.depth_target.as_ref().unwrap().view,
            &draws,
        );
        record_quad_pass(
            &mut encoder,
            &format!("{}-post", self.name),
            post,
            &self.output.as_ref().unwrap().view,
            wgpu::Color::BLACK,
        );
        ctx.queue.submit(std::iter::once(encoder.finish()));
        // Materials restore here, after submission.
        drop(switched);
    }

    fn post_render(&mut self, ctx: &GpuContext, _scene_graph: &Scene) {
        if self.state != PipelineState::Ready || !self.wants_data() {
            return;
        }
        let output = self.output.as_ref().unwrap();
        let (w, h) = (self.params.camera.width, self.params.camera.height);

        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(&format!("{}-readback", self.name)),
            });
        output.copy_to_storage(&mut encoder);
        ctx.queue.submit(std::iter::once(encoder.finish()));

        self.kelvin.resize((w * h) as usize, 0.0);
        output.read_back(&ctx.device, bytemuck::cast_slice_mut(&mut self.kelvin));
        self.frame.data = decode::quantise_temperatures(&self.kelvin, &self.params);
        self.frame.width = w;
        self.frame.height = h;
        self.frame.channels = 1;
        self.frame.format = "L16";
        self.frames.emit(&self.frame);
    }

    fn destroy(&mut self) {
        if self.state == PipelineState::Destroyed {
            return;
        }
        self.post = None;
        self.scene_pass = None;
        self.output = None;
        self.scene_target = None;
        self.depth_target = None;
        self.meshes.clear();
        self.state = PipelineState::Destroyed;
        log::debug!("Destroyed thermal camera '{}'", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::CameraParams;
    use approx::assert_relative_eq;

    fn params(ambient_from_color: bool) -> ThermalCameraParams {
        ThermalCameraParams {
            camera: CameraParams {
                width: 16,
                height: 16,
                near_clip: 0.1,
                far_clip: 50.0,
                fov_y: 1.0,
                visibility_mask: scene::VISIBILITY_ALL,
            },
            min_temperature: 250.0,
            max_temperature: 400.0,
            ambient_temperature: 300.0,
            ambient_temperature_range: 4.0,
            linear_resolution: 0.01,
            ambient_from_color,
        }
    }

    #[test]
    fn switcher_marks_heat_sources() {
        let cam = ThermalCamera::new("t", params(false)).unwrap();
        let mut s = Scene::new();
        let hot = s.create_visual("stove");
        s.visual_mut(hot).unwrap().set_metadata(keys::TEMPERATURE, 360.0f32);
        let cold = s.create_visual("wall");

        let switcher = cam.switcher();
        let switched = ScopedMaterialSwitch::apply(&mut s, &switcher);
        let hot_param = switched.scene().visual(hot).unwrap().material.custom_param.unwrap();
        assert_relative_eq!(hot_param.x, 360.0);
        assert_relative_eq!(hot_param.y, 1.0);
        let cold_param = switched.scene().visual(cold).unwrap().material.custom_param.unwrap();
        assert_relative_eq!(cold_param.x, 300.0);
        assert_relative_eq!(cold_param.y, 0.0);
    }

    #[test]
    fn ambient_from_color_follows_luminance() {
        let cam = ThermalCamera::new("t", params(true)).unwrap();
        let mut s = Scene::new();
        let bright = s.create_visual("white-wall");
        s.visual_mut(bright).unwrap().material.color = Vec4::new(1.0, 1.0, 1.0, 1.0);
        let switcher = cam.switcher();
        let switched = ScopedMaterialSwitch::apply(&mut s, &switcher);
        let param = switched.scene().visual(bright).unwrap().material.custom_param.unwrap();
        // Full luminance sits half a band above the ambient temperature.
        assert_relative_eq!(param.x, 302.0);
    }

    #[test]
    fn data_wanted_only_while_a_subscriber_is_connected() {
        let cam = ThermalCamera::new("t", params(false)).unwrap();
        assert!(!cam.wants_data());
        let c = cam.connect(|_| {});
        assert!(cam.wants_data());
        drop(c);
        assert!(!cam.wants_data());
    }

    #[test]
    fn destroy_is_idempotent() {
        let mut cam = ThermalCamera::new("t", params(false)).unwrap();
        cam.destroy();
        cam.destroy();
        assert!(matches!(cam.init(), Err(Error::Destroyed)));
    }
}
