//! GPU-synthesised sensors over a retained scene graph.
//!
//! Each sensor renders the scene through a dedicated pipeline, optionally
//! swapping materials for metadata-derived encodings first, then decodes
//! the render target into its output format on the CPU:
//!
//! - [`sensors::DepthCamera`] — linearised depth images and point clouds,
//! - [`sensors::ThermalCamera`] — quantised temperature images with noise,
//! - [`sensors::GpuRays`] — lidar-style range scans resampled from a cubemap,
//! - [`sensors::SegmentationCamera`] — per-pixel object id and label masks,
//! - [`sensors::BoundingBoxCamera`] — 2D and 3D boxes from the same masks,
//! - [`sensors::WideAngleCamera`] — colour images through an analytic lens.
//!
//! Sensors share a frame protocol ([`Sensor`]): `pre_render` builds GPU
//! resources lazily, `render` records and submits passes, `post_render`
//! reads back and decodes only when someone is connected, and `destroy`
//! releases everything and is idempotent.

pub mod cubemap;
pub mod debug;
pub mod decode;
pub mod error;
pub mod events;
pub mod params;
pub mod pipeline;
pub mod sensors;
pub mod switcher;

pub use error::Error;
pub use events::{Connection, EventHub, Frame};
pub use params::SensorParams;
pub use sensors::{
    BoundingBoxCamera, BoundingBoxes, DepthCamera, GpuRays, SegmentationCamera, Sensor,
    ThermalCamera, WideAngleCamera,
};
