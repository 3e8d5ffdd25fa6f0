//! Shared multi-pass pipeline plumbing.
//!
//! Every sensor pipeline is the same directed chain — clear, scene pass with
//! optionally switched materials, full-screen post-process, read-back — and
//! differs only in attachment formats and shaders. The pieces every variant
//! shares live here: the pipeline state machine, the scene pass with its
//! per-object dynamic-offset uniforms, the mesh cache and the quad-pass
//! recording helper.

use glam::Mat4;
use gxtk::{GpuMesh, RenderPass};
use scene::{Scene, VisualId};
use std::collections::HashMap;

/// Lifecycle of a sensor's GPU resources.
///
/// `Unbuilt` until the first `pre_render`, `Ready` afterwards, `Destroyed`
/// once released. A parameter change that invalidates the attachments drops
/// the pipeline back to `Unbuilt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// No GPU resources allocated yet.
    Unbuilt,
    /// Attachments and pipelines exist; renderable.
    Ready,
    /// Resources released; terminal.
    Destroyed,
}

/// Camera uniforms of a scene pass.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GlobalUniforms {
    /// View-projection matrix.
    pub view_proj: [f32; 16],
}

/// Per-object uniforms of a scene pass, one 256-byte slot per object.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ObjectUniforms {
    /// Model (object-to-world) matrix.
    pub model: [f32; 16],
    /// Encoded metadata from the material switcher; `w < 0` means "not
    /// switched", the shader falls back to the base colour.
    pub custom: [f32; 4],
    /// Base material colour.
    pub color: [f32; 4],
}

/// Slot stride of the per-object uniform buffer. 256 satisfies
/// `min_uniform_buffer_offset_alignment` on every backend wgpu supports.
pub const OBJECT_UNIFORM_STRIDE: u64 = 256;

/// Gathers the draw list of one scene pass: every visual with geometry whose
/// visibility mask intersects `mask`, in id order.
pub fn collect_objects(scene_graph: &Scene, mask: u32) -> (Vec<ObjectUniforms>, Vec<VisualId>) {
    let mut uniforms = Vec::new();
    let mut ids = Vec::new();
    for visual in scene_graph.visuals() {
        if visual.mesh.is_none() || visual.visibility & mask == 0 {
            continue;
        }
        let custom = visual
            .material
            .custom_param
            .map(|p| p.to_array())
            .unwrap_or([0.0, 0.0, 0.0, -1.0]);
        uniforms.push(ObjectUniforms {
            model: scene_graph.world_transform(visual.id).to_cols_array(),
            custom,
            color: visual.material.color.to_array(),
        });
        ids.push(visual.id);
    }
    (uniforms, ids)
}

/// Cache of GPU meshes keyed by visual id.
///
/// Uploaded lazily on first use and pruned when the visual disappears; a
/// mesh swap on a live visual is not tracked (attach a new visual instead).
#[derive(Default)]
pub struct MeshCache {
    meshes: HashMap<VisualId, GpuMesh>,
}

impl MeshCache {
    /// Uploads meshes for every visual in the scene that has geometry but no
    /// cached GPU mesh yet, and drops cache entries of removed visuals.
    pub fn sync(&mut self, device: &wgpu::Device, scene_graph: &Scene) {
        self.meshes
            .retain(|id, _| scene_graph.visual(*id).is_some());
        for visual in scene_graph.visuals() {
            let Some(mesh) = &visual.mesh else { continue };
            self.meshes.entry(visual.id).or_insert_with(|| {
                log::debug!("Uploading mesh of {} ({} indices)", visual.id, mesh.indices.len());
                GpuMesh::new(
                    device,
                    &mesh.positions,
                    &mesh.indices,
                    &format!("{}-mesh", visual.id),
                )
            });
        }
    }

    /// Looks up the GPU mesh of a visual.
    pub fn get(&self, id: VisualId) -> Option<&GpuMesh> {
        self.meshes.get(&id)
    }

    /// Drops every cached mesh.
    pub fn clear(&mut self) {
        self.meshes.clear();
    }
}

/// The scene pass: draws every collected object with the shared scene shader
/// into a color and/or depth attachment.
pub struct ScenePass {
    inner: RenderPass,
    object_buffer: wgpu::Buffer,
    capacity: usize,
    has_color_target: bool,
    label: String,
}

impl ScenePass {
    const INITIAL_CAPACITY: usize = 64;

    /// Creates the scene pass pipeline.
    ///
    /// `color_format` is `None` for depth-only passes (the depth camera's
    /// scene pass has no color attachment at all).
    pub fn new(
        device: &wgpu::Device,
        color_format: Option<wgpu::TextureFormat>,
        label: &str,
    ) -> Self {
        let shader = device.create_shader_module(wgpu::include_wgsl!("./shaders/scene.wgsl"));
        let global_buffer_size = std::mem::size_of::<GlobalUniforms>() as wgpu::BufferAddress;
        let global_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&format!("{label}-globals")),
            size: global_buffer_size,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let object_buffer = Self::create_object_buffer(device, label, Self::INITIAL_CAPACITY);
        let bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(&format!("{label}-bind-group-layout")),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::VERTEX,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: false,
                            min_binding_size: wgpu::BufferSize::new(global_buffer_size),
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: true,
                            min_binding_size: wgpu::BufferSize::new(
                                std::mem::size_of::<ObjectUniforms>() as u64,
                            ),
                        },
                        count: None,
                    },
                ],
            });
        let bind_group = Self::create_bind_group(
            device,
            &bind_group_layout,
            &global_buffer,
            &object_buffer,
            label,
        );
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(&format!("{label}-pipeline-layout")),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let targets = [color_format.map(|format| wgpu::ColorTargetState {
            format,
            blend: None,
            write_mask: wgpu::ColorWrites::ALL,
        })];
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(&format!("{label}-pipeline")),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: "vs_scene",
                compilation_options: Default::default(),
                buffers: &[GpuMesh::VERTEX_LAYOUT],
            },
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                unclipped_depth: false,
                polygon_mode: wgpu::PolygonMode::Fill,
                conservative: false,
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: gxtk::DepthAttachment::FORMAT,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::LessEqual,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState {
                count: 1,
                mask: !0,
                alpha_to_coverage_enabled: false,
            },
            fragment: color_format.map(|_| wgpu::FragmentState {
                module: &shader,
                entry_point: "fs_scene",
                compilation_options: Default::default(),
                targets: &targets,
            }),
            multiview: None,
            cache: None,
        });
        Self {
            inner: RenderPass {
                pipeline,
                bind_groups: vec![bind_group],
                uniform_buffer: Some(global_buffer),
            },
            object_buffer,
            capacity: Self::INITIAL_CAPACITY,
            has_color_target: color_format.is_some(),
            label: label.to_owned(),
        }
    }

    fn create_object_buffer(device: &wgpu::Device, label: &str, capacity: usize) -> wgpu::Buffer {
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&format!("{label}-objects")),
            size: OBJECT_UNIFORM_STRIDE * capacity as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    fn create_bind_group(
        device: &wgpu::Device,
        layout: &wgpu::BindGroupLayout,
        global_buffer: &wgpu::Buffer,
        object_buffer: &wgpu::Buffer,
        label: &str,
    ) -> wgpu::BindGroup {
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&format!("{label}-bind-group")),
            layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: global_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: object_buffer,
                        offset: 0,
                        size: wgpu::BufferSize::new(std::mem::size_of::<ObjectUniforms>() as u64),
                    }),
                },
            ],
        })
    }

    /// Writes the camera and per-object uniforms, growing the object buffer
    /// when the scene outgrew it.
    pub fn upload(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        view_proj: Mat4,
        objects: &[ObjectUniforms],
    ) {
        if objects.len() > self.capacity {
            self.capacity = objects.len().next_power_of_two();
            log::debug!(
                "Growing '{}' object buffer to {} slots",
                self.label,
                self.capacity
            );
            self.object_buffer = Self::create_object_buffer(device, &self.label, self.capacity);
            let layout = self.inner.pipeline.get_bind_group_layout(0);
            self.inner.bind_groups[0] = Self::create_bind_group(
                device,
                &layout,
                self.inner.uniform_buffer.as_ref().unwrap(),
                &self.object_buffer,
                &self.label,
            );
        }
        queue.write_buffer(
            self.inner.uniform_buffer.as_ref().unwrap(),
            0,
            bytemuck::cast_slice(&[GlobalUniforms {
                view_proj: view_proj.to_cols_array(),
            }]),
        );
        // One aligned slot per object.
        let mut staged = vec![0u8; objects.len() * OBJECT_UNIFORM_STRIDE as usize];
        for (i, object) in objects.iter().enumerate() {
            let offset = i * OBJECT_UNIFORM_STRIDE as usize;
            staged[offset..offset + std::mem::size_of::<ObjectUniforms>()]
                .copy_from_slice(bytemuck::bytes_of(object));
        }
        queue.write_buffer(&self.object_buffer, 0, &staged);
    }

    /// Records the scene pass: clears the attachments to the given sentinel
    /// values and draws every object in the draw list.
    pub fn record(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        color: Option<(&wgpu::TextureView, wgpu::Color)>,
        depth: &wgpu::TextureView,
        draws: &[(u32, &GpuMesh)],
    ) {
        debug_assert_eq!(self.has_color_target, color.is_some());
        let color_attachments = [color.map(|(view, clear)| wgpu::RenderPassColorAttachment {
            view,
            resolve_target: None,
            ops: wgpu::Operations {
                load: wgpu::LoadOp::Clear(clear),
                store: wgpu::StoreOp::Store,
            },
        })];
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some(self.label.as_str()),
            color_attachments: if self.has_color_target {
                color_attachments.as_slice()
            } else {
                &[]
            },
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: depth,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(1.0),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(&self.inner.pipeline);
        for (slot, mesh) in draws {
            let offset = *slot * OBJECT_UNIFORM_STRIDE as u32;
            pass.set_bind_group(0, &self.inner.bind_groups[0], &[offset]);
            pass.set_vertex_buffer(0, mesh.vertex_buffer.slice(..));
            pass.set_index_buffer(mesh.index_buffer.slice(..), GpuMesh::INDEX_FORMAT);
            pass.draw_indexed(0..mesh.index_count, 0, 0..1);
        }
    }
}

/// Records a full-screen post-process pass: binds the pass's groups and
/// draws the three-vertex quad, clearing the target first.
pub fn record_quad_pass(
    encoder: &mut wgpu::CommandEncoder,
    label: &str,
    pass_bundle: &RenderPass,
    target: &wgpu::TextureView,
    clear: wgpu::Color,
) {
    let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
        label: Some(label),
        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
            view: target,
            resolve_target: None,
            ops: wgpu::Operations {
                load: wgpu::LoadOp::Clear(clear),
                store: wgpu::StoreOp::Store,
            },
        })],
        depth_stencil_attachment: None,
        timestamp_writes: None,
        occlusion_query_set: None,
    });
    pass.set_pipeline(&pass_bundle.pipeline);
    for (i, group) in pass_bundle.bind_groups.iter().enumerate() {
        pass.set_bind_group(i as u32, group, &[]);
    }
    pass.draw(0..3, 0..1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;
    use scene::TriMesh;
    use std::sync::Arc;

    #[test]
    fn collect_objects_respects_visibility_and_geometry() {
        let mut s = Scene::new();
        let a = s.create_visual("seen");
        s.attach_mesh(a, Arc::new(TriMesh::cuboid(glam::Vec3::ONE)));
        let b = s.create_visual("masked-out");
        s.attach_mesh(b, Arc::new(TriMesh::cuboid(glam::Vec3::ONE)));
        s.visual_mut(b).unwrap().visibility = 0x2;
        let _empty = s.create_visual("no-geometry");

        let (uniforms, ids) = collect_objects(&s, 0x1);
        assert_eq!(ids, vec![a]);
        assert_eq!(uniforms.len(), 1);
        // Unswitched material: custom sentinel w < 0.
        assert!(uniforms[0].custom[3] < 0.0);
    }

    #[test]
    fn collect_objects_carries_switched_param() {
        let mut s = Scene::new();
        let a = s.create_visual("switched");
        s.attach_mesh(a, Arc::new(TriMesh::cuboid(glam::Vec3::ONE)));
        s.visual_mut(a).unwrap().material.custom_param = Some(Vec4::new(1.0, 2.0, 3.0, 1.0));
        let (uniforms, _) = collect_objects(&s, scene::VISIBILITY_ALL);
        assert_eq!(uniforms[0].custom, [1.0, 2.0, 3.0, 1.0]);
    }
}
