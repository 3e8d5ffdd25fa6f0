//! Wide-angle camera.
//!
//! Renders all six cube faces at 90 degrees each, then projects the cube
//! through a configurable lens mapping into the output image. The CPU-side
//! [`WideAngleCamera::project_point`] replicates the shader's face
//! selection and distortion math for hit-testing.

use glam::{Quat, Vec2, Vec3};
use gxtk::{ColorAttachment, GpuContext, Projection, RenderPass};
use scene::Scene;

use crate::{
    cubemap::{CubeFace, LensMapping},
    error::Error,
    events::{Connection, EventHub, Frame},
    params::WideAngleCameraParams,
    pipeline::{collect_objects, record_quad_pass, MeshCache, PipelineState, ScenePass},
    sensors::Sensor,
};

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct WidePostUniforms {
    coeffs: [f32; 4],
    misc: [f32; 4],
    center: [f32; 4],
}

struct FaceTarget {
    face: CubeFace,
    color_view: wgpu::TextureView,
    depth_view: wgpu::TextureView,
}

/// A wide-angle colour camera with an analytic lens distortion.
pub struct WideAngleCamera {
    name: String,
    params: WideAngleCameraParams,
    /// Sensor position in world space.
    pub position: Vec3,
    /// Sensor orientation; the optical axis is local `+X`, up is `+Z`.
    pub orientation: Quat,
    state: PipelineState,
    meshes: MeshCache,
    scene_pass: Option<ScenePass>,
    faces: Vec<FaceTarget>,
    post: Option<RenderPass>,
    output: Option<ColorAttachment>,
    rgba: Vec<u8>,
    frame: Frame<u8>,
    frames: EventHub<Frame<u8>>,
}

impl WideAngleCamera {
    /// Creates a wide-angle camera with validated parameters.
    pub fn new(name: impl Into<String>, params: WideAngleCameraParams) -> Result<Self, Error> {
        Ok(Self {
            name: name.into(),
            params: params.validate()?,
            position: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            state: PipelineState::Unbuilt,
            meshes: MeshCache::default(),
            scene_pass: None,
            faces: Vec::new(),
            post: None,
            output: None,
            rgba: Vec::new(),
            frame: Frame::default(),
            frames: EventHub::new(),
        })
    }

    /// Subscribes to decoded colour frames (3 channels, `PF_R8G8B8`).
    pub fn connect(
        &self,
        callback: impl FnMut(&Frame<u8>) + Send + 'static,
    ) -> Connection<Frame<u8>> {
        self.frames.connect(callback)
    }

    fn lens(&self) -> LensMapping {
        LensMapping {
            c1: self.params.c1,
            c2: self.params.c2,
            c3: self.params.c3,
            focal_length: self.params.focal_length,
            fun: self.params.lens_fun,
        }
    }

    /// Projects a world-space point to output-image pixel coordinates,
    /// using the same per-face selection and distortion math as the
    /// resampling shader. `None` outside the lens cutoff.
    pub fn project_point(&self, point: Vec3) -> Option<Vec2> {
        let local = self.orientation.inverse() * (point - self.position);
        self.lens().project(
            local,
            self.params.camera.width,
            self.params.camera.height,
            self.params.camera.fov_y,
        )
    }

    fn face_projection(&self) -> Projection {
        Projection::new(
            std::f32::consts::FRAC_PI_2,
            1.0,
            self.params.camera.near_clip,
            self.params.camera.far_clip,
        )
    }

    fn build(&mut self, ctx: &GpuContext) -> Result<(), Error> {
        let device = &ctx.device;
        let (w, h) = (self.params.camera.width, self.params.camera.height);
        let face_size = self.params.face_size;

        let face_extent = wgpu::Extent3d {
            width: face_size,
            height: face_size,
            depth_or_array_layers: 6,
        };
        let color_tex = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&format!("{}-faces-color", self.name)),
            size: face_extent,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let depth_tex = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&format!("{}-faces-depth", self.name)),
            size: face_extent,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Depth32Float,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        let layer_view = |tex: &wgpu::Texture, face: CubeFace, what: &str| {
            tex.create_view(&wgpu::TextureViewDescriptor {
                label: Some(&format!("{}-{what}-{}", self.name, face.layer())),
                dimension: Some(wgpu::TextureViewDimension::D2),
                base_array_layer: face.layer(),
                array_layer_count: Some(1),
                ..Default::default()
            })
        };
        self.faces = CubeFace::ALL
            .into_iter()
            .map(|face| FaceTarget {
                face,
                color_view: layer_view(&color_tex, face, "color"),
                depth_view: layer_view(&depth_tex, face, "depth"),
            })
            .collect();
        let color_array = color_tex.create_view(&wgpu::TextureViewDescriptor {
            dimension: Some(wgpu::TextureViewDimension::D2Array),
            ..Default::default()
        });

        let output = ColorAttachment::new(
            device,
            w,
            h,
            wgpu::TextureFormat::Rgba8Unorm,
            &format!("{}-output", self.name),
        )
        .ok_or_else(|| Error::ResourceCreation("output attachment".into()))?;
        let scene_pass = ScenePass::new(
            device,
            Some(wgpu::TextureFormat::Rgba8Unorm),
            &format!("{}-scene", self.name),
        );

        let shader =
            device.create_shader_module(wgpu::include_wgsl!("../shaders/wide_angle.wgsl"));
        let cutoff = self.params.camera.fov_y;
        let half = 0.5 * w.min(h) as f32;
        let scale = half / self.lens().radius(cutoff * 0.5);
        let fun_id = match self.params.lens_fun {
            crate::params::LensFun::Sin => 0.0,
            crate::params::LensFun::Tan => 1.0,
            crate::params::LensFun::Id => 2.0,
        };
        let uniforms = WidePostUniforms {
            coeffs: [
                self.params.c1,
                self.params.c2,
                self.params.c3,
                self.params.focal_length,
            ],
            misc: [cutoff * 0.5, scale, fun_id, face_size as f32],
            center: [w as f32 * 0.5, h as f32 * 0.5, 0.0, 0.0],
        };
        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&format!("{}-post-uniforms", self.name)),
            size: std::mem::size_of::<WidePostUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        ctx.queue
            .write_buffer(&uniform_buffer, 0, bytemuck::bytes_of(&uniforms));
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
                            WidePostUniforms,
                        >() as u64),
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2Array,
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
                    resource: wgpu::BindingResource::TextureView(&color_array),
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
                entry_point: "fs_wide",
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

        self.output = Some(output);
        self.scene_pass = Some(scene_pass);
        self.post = Some(RenderPass {
            pipeline,
            bind_groups: vec![bind_group],
            uniform_buffer: Some(uniform_buffer),
        });
        self.state = PipelineState::Ready;
        log::debug!(
            "Built wide-angle camera '{}' pipeline ({w}x{h}, faces {face_size}x{face_size})",
            self.name
        );
        Ok(())
    }
}

impl Sensor for WideAngleCamera {
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
                "Wide-angle camera '{}' rendered before pre_render",
                self.name
            );
            return;
        }
        let proj = self.face_projection().matrix();
        let (objects, ids) = collect_objects(scene_graph, self.params.camera.visibility_mask);
        let draws: Vec<_> = ids
            .iter()
            .enumerate()
            .filter_map(|(slot, id)| self.meshes.get(*id).map(|m| (slot as u32, m)))
            .collect();

        let scene_pass = self.scene_pass.as_mut().unwrap();
        for target in &self.faces {
            let view = target.face.view_matrix(self.position, self.orientation);
            scene_pass.upload(&ctx.device, &ctx.queue, proj * view, &objects);
            let mut encoder = ctx
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some(&format!("{}-face-{}", self.name, target.face.layer())),
                });
            scene_pass.record(
                &mut encoder,
                Some((&target.color_view, wgpu::Color::BLACK)),
                &target.depth_view,
                &draws,
            );
            ctx.queue.submit(std::iter::once(encoder.finish()));
        }

        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(&format!("{}-resample", self.name)),
            });
        record_quad_pass(
            &mut encoder,
            &format!("{}-resample-pass", self.name),
            self.post.as_ref().unwrap(),
            &self.output.as_ref().unwrap().view,
            wgpu::Color::BLACK,
        );
        ctx.queue.submit(std::iter::once(encoder.finish()));
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

        self.rgba.resize((w * h * 4) as usize, 0);
        output.read_back(&ctx.device, &mut self.rgba);
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
        self.post = None;
        self.scene_pass = None;
        self.output = None;
        self.faces.clear();
        self.meshes.clear();
        self.state = PipelineState::Destroyed;
        log::debug!("Destroyed wide-angle camera '{}'", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{CameraParams, LensFun};
    use approx::assert_relative_eq;

    fn params() -> WideAngleCameraParams {
        WideAngleCameraParams {
            camera: CameraParams {
                width: 200,
                height: 200,
                near_clip: 0.1,
                far_clip: 100.0,
                fov_y: std::f32::consts::PI,
                visibility_mask: scene::VISIBILITY_ALL,
            },
            c1: 1.0,
            c2: 1.0,
            c3: 0.0,
            focal_length: 1.0,
            lens_fun: LensFun::Id,
            face_size: 64,
        }
    }

    #[test]
    fn forward_point_projects_to_image_center() {
        let cam = WideAngleCamera::new("w", params()).unwrap();
        let p = cam.project_point(Vec3::new(10.0, 0.0, 0.0)).unwrap();
        assert_relative_eq!(p.x, 100.0, epsilon = 1e-3);
        assert_relative_eq!(p.y, 100.0, epsilon = 1e-3);
    }

    #[test]
    fn point_behind_cutoff_is_rejected() {
        let cam = WideAngleCamera::new("w", params()).unwrap();
        assert!(cam.project_point(Vec3::new(-10.0, 0.1, 0.0)).is_none());
    }

    #[test]
    fn projection_follows_sensor_pose() {
        let mut cam = WideAngleCamera::new("w", params()).unwrap();
        cam.position = Vec3::new(5.0, 0.0, 0.0);
        // Rotated to look along +Y.
        cam.orientation = Quat::from_rotation_z(std::f32::consts::FRAC_PI_2);
        let p = cam.project_point(Vec3::new(5.0, 10.0, 0.0)).unwrap();
        assert_relative_eq!(p.x, 100.0, epsilon = 1e-3);
        assert_relative_eq!(p.y, 100.0, epsilon = 1e-3);
    }

    #[test]
    fn left_of_axis_lands_left_of_center() {
        let cam = WideAngleCamera::new("w", params()).unwrap();
        // +Y is left in the sensor frame, which maps to image -x.
        let p = cam.project_point(Vec3::new(10.0, 1.0, 0.0)).unwrap();
        assert!(p.x < 100.0);
        assert_relative_eq!(p.y, 100.0, epsilon = 1e-3);
    }

    #[test]
    fn data_wanted_only_while_a_subscriber_is_connected() {
        let cam = WideAngleCamera::new("w", params()).unwrap();
        assert!(!cam.wants_data());
        let c = cam.connect(|_| {});
        assert!(cam.wants_data());
        drop(c);
        assert!(!cam.wants_data());
    }

    #[test]
    fn destroy_is_idempotent() {
        let mut cam = WideAngleCamera::new("w", params()).unwrap();
        cam.destroy();
        cam.destroy();
        assert!(matches!(cam.init(), Err(Error::Destroyed)));
    }
}
