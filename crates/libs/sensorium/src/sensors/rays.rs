//! GPU lidar.
//!
//! Two-stage pipeline: the scene is rendered into the cube faces the
//! configured angular field touches, with the material switcher encoding
//! each visual's `"laser_retro"` annotation; a resampling pass then maps
//! every output pixel through the precomputed (u, v, face, 1/cos) lookup
//! texture to produce the (range, retro) scan. The lookup table is built
//! once from the angle ranges, never per frame.

use glam::{Quat, Vec3, Vec4};
use gxtk::{ColorAttachment, GpuContext, Projection, RenderPass};
use scene::{keys, Scene, Value};

use crate::{
    cubemap::{CubeFace, RayLookupTable},
    decode,
    error::Error,
    events::{Connection, EventHub, Frame},
    params::GpuRaysParams,
    pipeline::{collect_objects, record_quad_pass, MeshCache, PipelineState, ScenePass},
    sensors::Sensor,
    switcher::{MaterialSwitcher, ScopedMaterialSwitch, UnresolvedPolicy},
};

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct RaysPostUniforms {
    a: f32,
    b: f32,
    face_size: f32,
    _pad: f32,
}

/// One renderable cube face: its layer views into the shared array textures.
struct FaceTarget {
    face: CubeFace,
    color_view: wgpu::TextureView,
    depth_view: wgpu::TextureView,
}

/// A GPU lidar producing a (range, retro, 0) scan.
pub struct GpuRays {
    name: String,
    params: GpuRaysParams,
    /// Sensor position in world space.
    pub position: Vec3,
    /// Sensor orientation; the scan frame is `+X` forward, `+Z` up.
    pub orientation: Quat,
    state: PipelineState,
    meshes: MeshCache,
    scene_pass: Option<ScenePass>,
    faces: Vec<FaceTarget>,
    post: Option<RenderPass>,
    output: Option<ColorAttachment>,
    raw: Vec<f32>,
    frame: Frame<f32>,
    frames: EventHub<Frame<f32>>,
}

impl GpuRays {
    /// Creates a lidar with validated parameters.
    pub fn new(name: impl Into<String>, params: GpuRaysParams) -> Result<Self, Error> {
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
            raw: Vec::new(),
            frame: Frame::default(),
            frames: EventHub::new(),
        })
    }

    /// Subscribes to decoded scans (3 channels, `PF_FLOAT32_RGB`:
    /// range, retro, unused).
    pub fn connect(
        &self,
        callback: impl FnMut(&Frame<f32>) + Send + 'static,
    ) -> Connection<Frame<f32>> {
        self.frames.connect(callback)
    }

    /// Projection of the 90-degree face cameras. The near plane is pinned
    /// away from zero so `min_range = 0` stays renderable; nearer hits are
    /// clipped, not clamped.
    fn face_projection(&self) -> Projection {
        Projection::new(
            std::f32::consts::FRAC_PI_2,
            1.0,
            self.params.min_range.max(0.01),
            self.params.max_range,
        )
    }

    fn switcher(&self) -> MaterialSwitcher {
        MaterialSwitcher::new(
            keys::LASER_RETRO,
            UnresolvedPolicy::Background(Vec4::new(0.0, 0.0, 0.0, 1.0)),
            |_, value| {
                value
                    .and_then(Value::as_f32)
                    .map(|retro| Vec4::new(retro, 0.0, 0.0, 1.0))
            },
        )
    }

    fn build(&mut self, ctx: &GpuContext) -> Result<(), Error> {
        let device = &ctx.device;
        let (w, h) = (self.params.horizontal_samples, self.params.vertical_samples);
        let face_size = self.params.face_size;
        let table = RayLookupTable::build(&self.params);

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
            format: wgpu::TextureFormat::Rg32Float,
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
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
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
        self.faces = table
            .faces
            .iter()
            .map(|&face| FaceTarget {
                face,
                color_view: layer_view(&color_tex, face, "color"),
                depth_view: layer_view(&depth_tex, face, "depth"),
            })
            .collect();
        log::debug!(
            "Lidar '{}' renders {} of 6 cube faces at {face_size}x{face_size}",
            self.name,
            self.faces.len()
        );
        let array_view = |tex: &wgpu::Texture| {
            tex.create_view(&wgpu::TextureViewDescriptor {
                dimension: Some(wgpu::TextureViewDimension::D2Array),
                ..Default::default()
            })
        };
        let color_array = array_view(&color_tex);
        let depth_array = array_view(&depth_tex);

        let lookup_tex = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&format!("{}-lookup", self.name)),
            size: wgpu::Extent3d {
                width: w,
                height: h,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba32Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        ctx.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &lookup_tex,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(&table.texels),
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(w * 16),
                rows_per_image: Some(h),
            },
            wgpu::Extent3d {
                width: w,
                height: h,
                depth_or_array_layers: 1,
            },
        );
        let lookup_view = lookup_tex.create_view(&wgpu::TextureViewDescriptor::default());

        let output = ColorAttachment::new(
            device,
            w,
            h,
            wgpu::TextureFormat::Rgba32Float,
            &format!("{}-output", self.name),
        )
        .ok_or_else(|| Error::ResourceCreation("output attachment".into()))?;
        let scene_pass = ScenePass::new(
            device,
            Some(wgpu::TextureFormat::Rg32Float),
            &format!("{}-scene", self.name),
        );

        let shader = device.create_shader_module(wgpu::include_wgsl!("../shaders/rays.wgsl"));
        let (a, b) = self.face_projection().depth_coefficients();
        let uniforms = RaysPostUniforms {
            a,
            b,
            face_size: face_size as f32,
            _pad: 0.0,
        };
        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&format!("{}-post-uniforms", self.name)),
            size: std::mem::size_of::<RaysPostUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        ctx.queue
            .write_buffer(&uniform_buffer, 0, bytemuck::bytes_of(&uniforms));
        let texture_entry = |binding, sample_type, dimension| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type,
                view_dimension: dimension,
                multisampled: false,
            },
            count: None,
        };
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
                            RaysPostUniforms,
                        >() as u64),
                    },
                    count: None,
                },
                texture_entry(
                    1,
                    wgpu::TextureSampleType::Float { filterable: false },
                    wgpu::TextureViewDimension::D2,
                ),
                texture_entry(
                    2,
                    wgpu::TextureSampleType::Float { filterable: false },
                    wgpu::TextureViewDimension::D2Array,
                ),
                texture_entry(
                    3,
                    wgpu::TextureSampleType::Depth,
                    wgpu::TextureViewDimension::D2Array,
                ),
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
                    resource: wgpu::BindingResource::TextureView(&lookup_view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&color_array),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(&depth_array),
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
                entry_point: "fs_rays",
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
        Ok(())
    }
}

impl Sensor for GpuRays {
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
            log::error!("Lidar '{}' rendered before pre_render", self.name);
            return;
        }
        let proj = self.face_projection().matrix();
        let switcher = self.switcher();
        let switched = ScopedMaterialSwitch::apply(scene_graph, &switcher);
        let (objects, ids) = collect_objects(switched.scene(), self.params.visibility_mask);
        let draws: Vec<_> = ids
            .iter()
            .enumerate()
            .filter_map(|(slot, id)| self.meshes.get(*id).map(|m| (slot as u32, m)))
            .collect();

        // The face passes share one camera uniform buffer, so each face is
        // uploaded and submitted separately; they still execute in order.
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
        drop(switched);
    }

    fn post_render(&mut self, ctx: &GpuContext, _scene_graph: &Scene) {
        if self.state != PipelineState::Ready || !self.wants_data() {
            return;
        }
        let output = self.output.as_ref().unwrap();
        let (w, h) = (self.params.horizontal_samples, self.params.vertical_samples);

        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(&format!("{}-readback", self.name)),
            });
        output.copy_to_storage(&mut encoder);
        ctx.queue.submit(std::iter::once(encoder.finish()));

        self.raw.resize((w * h * 4) as usize, 0.0);
        output.read_back(&ctx.device, bytemuck::cast_slice_mut(&mut self.raw));
        self.frame.data = decode::finalize_ray_scan(&self.raw, &self.params);
        self.frame.width = w;
        self.frame.height = h;
        self.frame.channels = 3;
        self.frame.format = "PF_FLOAT32_RGB";
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
        log::debug!("Destroyed lidar '{}'", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::NoHitPolicy;

    fn params() -> GpuRaysParams {
        GpuRaysParams {
            horizontal_samples: 64,
            vertical_samples: 4,
            horizontal_min_angle: -1.0,
            horizontal_max_angle: 1.0,
            vertical_min_angle: -0.2,
            vertical_max_angle: 0.2,
            min_range: 0.2,
            max_range: 30.0,
            no_hit: NoHitPolicy::MaxRange,
            face_size: 128,
            visibility_mask: scene::VISIBILITY_ALL,
        }
    }

    #[test]
    fn destroy_is_idempotent() {
        let mut lidar = GpuRays::new("l", params()).unwrap();
        lidar.destroy();
        lidar.destroy();
        assert!(matches!(lidar.init(), Err(Error::Destroyed)));
    }

    #[test]
    fn retro_switcher_defaults_to_zero() {
        let lidar = GpuRays::new("l", params()).unwrap();
        let mut s = Scene::new();
        let reflective = s.create_visual("sign");
        s.visual_mut(reflective)
            .unwrap()
            .set_metadata(keys::LASER_RETRO, 0.8f32);
        let plain = s.create_visual("tree");

        let switcher = lidar.switcher();
        let switched = ScopedMaterialSwitch::apply(&mut s, &switcher);
        let r = switched.scene().visual(reflective).unwrap().material.custom_param.unwrap();
        assert_eq!(r.x, 0.8);
        let p = switched.scene().visual(plain).unwrap().material.custom_param.unwrap();
        assert_eq!(p.x, 0.0);
    }

    #[test]
    fn data_wanted_only_while_a_subscriber_is_connected() {
        let lidar = GpuRays::new("l", params()).unwrap();
        assert!(!lidar.wants_data());
        let c = lidar.connect(|_| {});
        assert!(lidar.wants_data());
        drop(c);
        assert!(!lidar.wants_data());
    }

    #[test]
    fn angle_ranges_outside_vertical_limits_rejected() {
        let mut p = params();
        p.vertical_max_angle = 2.0;
        assert!(GpuRays::new("l", p).is_err());
    }
}
