//! Error type for sensor construction and rendering.

use thiserror::Error;

/// Errors surfaced by the sensor façades.
///
/// Per-frame failures (a visual that fails to resolve, a mismatched point
/// count) are not errors; they are logged and the affected object or update
/// is skipped for that frame.
#[derive(Debug, Error)]
pub enum Error {
    /// Sensor parameters failed validation.
    #[error("invalid sensor parameters: {0}")]
    InvalidParameters(String),

    /// A GPU resource (texture, buffer, pipeline) could not be created.
    #[error("resource creation failed: {0}")]
    ResourceCreation(String),

    /// Operation on a destroyed sensor.
    #[error("sensor has been destroyed")]
    Destroyed,

    /// De/serialisation of a sensor description failed.
    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_yaml::Error),

    /// Filesystem error while loading a description or saving a debug image.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Image encoding error from the debug dump helpers.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// Rendering hardware interface error.
    #[error("rhi error: {0}")]
    Rhi(Box<dyn std::error::Error + Send + Sync + 'static>),
}

macro_rules! impl_from_wgpu_errors {
    ($($err:ty),* $(,)?) => {
        $(
            impl From<$err> for Error {
                fn from(source: $err) -> Self {
                    Error::Rhi(Box::new(source))
                }
            }
        )*
    };
}

impl_from_wgpu_errors!(
    wgpu::Error,
    wgpu::RequestDeviceError,
    wgpu::BufferAsyncError,
);
