//! Graphics toolkit for the sensorium sensor pipelines.
//!
//! Wraps the handful of wgpu concepts the sensor pipelines need: an offscreen
//! [`GpuContext`], render-target attachments with synchronous CPU read-back
//! ([`attachment`]), render-pass bundles ([`pass`]), GPU meshes ([`mesh`]) and
//! a camera with the projection maths shared by every sensor ([`camera`]).

pub mod attachment;
pub mod camera;
pub mod context;
pub mod mesh;
pub mod pass;

pub use attachment::{ColorAttachment, DepthAttachment};
pub use camera::{Camera, Projection};
pub use context::{GpuContext, WgpuConfig};
pub use mesh::GpuMesh;
pub use pass::{tex_fmt_bpp, RenderPass};
