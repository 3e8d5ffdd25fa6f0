//! Depth camera.
//!
//! Pass chain: depth-only scene pass, then a full-screen pass linearising
//! the depth buffer into view distances written to an `R32Float` target.
//! The read-back is clamped into the configured depth window on the CPU;
//! an optional second output repacks the frame as a camera-space point
//! cloud.

use glam::Vec3;
use gxtk::{Camera, ColorAttachment, DepthAttachment, GpuContext, Projection, RenderPass};
use scene::Scene;

use crate::{
    decode,
    error::Error,
    events::{Connection, EventHub, Frame},
    params::DepthCameraParams,
    pipeline::{collect_objects, record_quad_pass, MeshCache, PipelineState, ScenePass},
    sensors::Sensor,
};

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct DepthPostUniforms {
    a: f32,
    b: f32,
    _pad: [f32; 2],
}

/// A depth camera synthesising per-pixel view distances.
pub struct DepthCamera {
    name: String,
    params: DepthCameraParams,
    /// Camera pose; free to change between frames.
    pub camera: Camera,
    state: PipelineState,
    meshes: MeshCache,
    scene_pass: Option<ScenePass>,
    depth_target: Option<DepthAttachment>,
    post: Option<RenderPass>,
    output: Option<ColorAttachment>,
    frame: Frame<f32>,
    points: Frame<f32>,
    frames: EventHub<Frame<f32>>,
    point_frames: EventHub<Frame<f32>>,
}

impl DepthCamera {
    /// Creates a depth camera with validated parameters.
    pub fn new(name: impl Into<String>, params: DepthCameraParams) -> Result<Self, Error> {
        Ok(Self {
            name: name.into(),
            params: params.validate()?,
            camera: Camera::new(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y),
            state: PipelineState::Unbuilt,
            meshes: MeshCache::default(),
            scene_pass: None,
            depth_target: None,
            post: None,
            output: None,
            frame: Frame::default(),
            points: Frame::default(),
            frames: EventHub::new(),
            point_frames: EventHub::new(),
        })
    }

    /// Subscribes to decoded depth frames (1 channel, `FLOAT32`).
    pub fn connect(
        &self,
        callback: impl FnMut(&Frame<f32>) + Send + 'static,
    ) -> Connection<Frame<f32>> {
        self.frames.connect(callback)
    }

    /// Subscribes to the point-cloud output (4 channels per sample,
    /// `PF_FLOAT32_RGBA`: x, y, z in camera space plus a packed colour).
    pub fn connect_points(
        &self,
        callback: impl FnMut(&Frame<f32>) + Send + 'static,
    ) -> Connection<Frame<f32>> {
        self.point_frames.connect(callback)
    }

    fn projection(&self) -> Projection {
        let c = &self.params.camera;
        Projection::new(c.fov_y, c.aspect(), c.near_clip, c.far_clip)
    }

    fn build(&mut self, ctx: &GpuContext) -> Result<(), Error> {
        let device = &ctx.device;
        let (w, h) = (self.params.camera.width, self.params.camera.height);
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
        let scene_pass = ScenePass::new(device, None, &format!("{}-scene", self.name));

        let shader = device.create_shader_module(wgpu::include_wgsl!("../shaders/depth.wgsl"));
        let (a, b) = self.projection().depth_coefficients();
        let uniforms = DepthPostUniforms {
            a,
            b,
            _pad: [0.0; 2],
        };
        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&format!("{}-post-uniforms", self.name)),
            size: std::mem::size_of::<DepthPostUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        ctx.queue
            .write_buffer(&uniform_buffer, 0, bytemuck::bytes_of(&uniforms));
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor::default());
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
                            DepthPostUniforms,
                        >() as u64),
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Depth,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::NonFiltering),
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
                    resource: wgpu::BindingResource::TextureView(&depth_target.view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(&sampler),
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
                entry_point: "fs_depth",
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

        self.depth_target = Some(depth_target);
        self.output = Some(output);
        self.scene_pass = Some(scene_pass);
        self.post = Some(RenderPass {
            pipeline,
            bind_groups: vec![bind_group],
            uniform_buffer: Some(uniform_buffer),
        });
        self.state = PipelineState::Ready;
        log::debug!("Built depth camera '{}' pipeline ({w}x{h})", self.name);
        Ok(())
    }
}

impl Sensor for DepthCamera {
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
        self.frames.has_subscribers() || self.point_frames.has_subscribers()
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
            log::error!("Depth camera '{}' rendered before pre_render", self.name);
            return;
        }
        let view_proj = self.projection().matrix() * self.camera.view_matrix();
        let scene_pass = self.scene_pass.as_mut().unwrap();
        let depth_target = self.depth_target.as_ref().unwrap();
        let output = self.output.as_ref().unwrap();

        let (uniforms, ids) = collect_objects(scene_graph, self.params.camera.visibility_mask);
        scene_pass.upload(&ctx.device, &ctx.queue, view_proj, &uniforms);
        let draws: Vec<_> = ids
            .iter()
            .enumerate()
            .filter_map(|(slot, id)| self.meshes.get(*id).map(|m| (slot as u32, m)))
            .collect();

        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(&format!("{}-encoder", self.name)),
            });
        scene_pass.record(&mut encoder, None, &depth_target.view, &draws);
        record_quad_pass(
            &mut encoder,
            &format!("{}-post", self.name),
            self.post.as_ref().unwrap(),
            &output.view,
            wgpu::Color::BLACK,
        );
        ctx.queue.submit(std::iter::once(encoder.finish()));
    }

    fn post_render(&mut self, ctx: &GpuContext, _scene_graph: &Scene) {
        if self.state != PipelineState::Ready || !self.wants_data() {
            return;
        }
        let want_depth = self.frames.has_subscribers();
        let want_points = self.point_frames.has_subscribers();
        let output = self.output.as_ref().unwrap();
        let (w, h) = (self.params.camera.width, self.params.camera.height);

        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(&format!("{}-readback", self.name)),
            });
        output.copy_to_storage(&mut encoder);
        ctx.queue.submit(std::iter::once(encoder.finish()));

        self.frame.data.resize((w * h) as usize, 0.0);
        output.read_back(&ctx.device, bytemuck::cast_slice_mut(&mut self.frame.data));
        decode::clamp_depth(&mut self.frame.data, &self.params);
        self.frame.width = w;
        self.frame.height = h;
        self.frame.channels = 1;
        self.frame.format = "FLOAT32";
        if want_depth {
            self.frames.emit(&self.frame);
        }
        if want_points {
            let cloud = decode::depth_point_cloud(
                &self.frame.data,
                w,
                h,
                self.params.camera.fov_y,
                u32::MAX,
            );
            self.points.data.clear();
            self.points.data.extend(cloud.iter().flatten());
            self.points.width = w;
            self.points.height = h;
            self.points.channels = 4;
            self.points.format = "PF_FLOAT32_RGBA";
            self.point_frames.emit(&self.points);
        }
    }

    fn destroy(&mut self) {
        if self.state == PipelineState::Destroyed {
            return;
        }
        self.post = None;
        self.scene_pass = None;
        self.output = None;
        self.depth_target = None;
        self.meshes.clear();
        self.state = PipelineState::Destroyed;
        log::debug!("Destroyed depth camera '{}'", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::CameraParams;

    fn params() -> DepthCameraParams {
        DepthCameraParams {
            camera: CameraParams {
                width: 32,
                height: 24,
                near_clip: 0.1,
                far_clip: 100.0,
                fov_y: 1.0,
                visibility_mask: scene::VISIBILITY_ALL,
            },
            min_depth: 0.2,
            max_depth: 50.0,
        }
    }

    #[test]
    fn destroy_is_idempotent() {
        let mut cam = DepthCamera::new("d", params()).unwrap();
        cam.destroy();
        cam.destroy();
        assert!(matches!(cam.init(), Err(Error::Destroyed)));
    }

    #[test]
    fn init_is_idempotent() {
        let mut cam = DepthCamera::new("d", params()).unwrap();
        cam.init().unwrap();
        cam.init().unwrap();
    }

    #[test]
    fn data_wanted_only_while_a_subscriber_is_connected() {
        let cam = DepthCamera::new("d", params()).unwrap();
        assert!(!cam.wants_data());
        let c = cam.connect(|_| {});
        assert!(cam.wants_data());
        drop(c);
        assert!(!cam.wants_data());
        // Either output keeps the read-back alive.
        let p = cam.connect_points(|_| {});
        assert!(cam.wants_data());
        drop(p);
        assert!(!cam.wants_data());
    }

    #[test]
    fn invalid_params_rejected() {
        let mut p = params();
        p.camera.width = 0;
        assert!(DepthCamera::new("d", p).is_err());
    }
}
