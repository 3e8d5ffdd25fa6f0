//! Sensor façades.
//!
//! Each sensor owns its own pipeline, attachments and subscriber hub, and
//! follows the same lifecycle: `init` once, then per frame `pre_render`
//! (lazily builds the GPU pipeline), `render` (records and submits the pass
//! chain), `post_render` (reads back and decodes, skipped entirely without
//! subscribers), and finally `destroy`.
//!
//! Sensors are single-threaded with respect to the GPU context: a sensor's
//! `pre_render -> render -> post_render` sequence must not interleave with
//! another call into the same sensor. Different sensors own independent
//! resources and may run in any order.

use gxtk::GpuContext;
use scene::Scene;

use crate::error::Error;

pub mod bbox;
pub mod depth;
pub mod rays;
pub mod segmentation;
pub mod thermal;
pub mod wide_angle;

pub use bbox::{BoundingBoxCamera, BoundingBoxes};
pub use depth::DepthCamera;
pub use rays::GpuRays;
pub use segmentation::SegmentationCamera;
pub use thermal::ThermalCamera;
pub use wide_angle::WideAngleCamera;

/// The lifecycle contract shared by every sensor kind.
pub trait Sensor {
    /// The sensor's name; GPU resource labels derive from it.
    fn name(&self) -> &str;

    /// Marks the sensor live. Idempotent; fails only on a destroyed sensor.
    fn init(&mut self) -> Result<(), Error>;

    /// Builds the GPU pipeline if it does not exist yet and uploads any
    /// scene resources the pass chain needs.
    fn pre_render(&mut self, ctx: &GpuContext, scene_graph: &Scene) -> Result<(), Error>;

    /// Whether any subscriber currently wants this sensor's output.
    /// `post_render` is a no-op while this is false.
    fn wants_data(&self) -> bool;

    /// Records and submits the sensor's pass chain. The scene is borrowed
    /// mutably for the scoped material switch; it is unchanged on return.
    ///
    /// Failures degrade to an error log, never a panic; a mis-rendered
    /// frame produces a stale or zeroed buffer downstream.
    fn render(&mut self, ctx: &GpuContext, scene_graph: &mut Scene);

    /// Reads back and decodes the frame, then invokes every subscriber
    /// synchronously. Without subscribers this performs no GPU read-back
    /// and no decode at all.
    fn post_render(&mut self, ctx: &GpuContext, scene_graph: &Scene);

    /// Releases all GPU resources. Safe to call more than once; the sensor
    /// stays destroyed.
    fn destroy(&mut self);
}
