//! Offscreen GPU context creation.

use std::sync::Arc;

/// Aggregates all the wgpu objects needed to use the GPU.
///
/// Sensor rendering is headless, so unlike a windowed renderer there is no
/// surface here; every pass targets an offscreen attachment.
pub struct GpuContext {
    /// Context for wgpu objects.
    pub instance: wgpu::Instance,

    /// Adapter for wgpu: the physical device + graphics api.
    pub adapter: wgpu::Adapter,

    /// GPU logical device.
    pub device: Arc<wgpu::Device>,

    /// GPU command queue to execute drawing or computing commands.
    pub queue: Arc<wgpu::Queue>,
}

/// Configuration for the [`GpuContext`].
pub struct WgpuConfig {
    /// Device requirements for requesting a device.
    pub device_descriptor: wgpu::DeviceDescriptor<'static>,
    /// Backend API to use.
    pub backends: wgpu::Backends,
    /// Power preference for the GPU.
    pub power_preference: wgpu::PowerPreference,
}

impl Default for WgpuConfig {
    fn default() -> Self {
        Self {
            device_descriptor: wgpu::DeviceDescriptor {
                label: Some("sensorium-default-device"),
                required_features: wgpu::Features::default(),
                required_limits: wgpu::Limits::default(),
                memory_hints: Default::default(),
            },
            backends: wgpu::Backends::PRIMARY,
            power_preference: wgpu::PowerPreference::HighPerformance,
        }
    }
}

impl GpuContext {
    /// Creates a new offscreen rendering context.
    pub async fn offscreen(config: &WgpuConfig) -> Self {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: config.backends,
            flags: Default::default(),
            dx12_shader_compiler: Default::default(),
            gles_minor_version: Default::default(),
        });
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: config.power_preference,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .unwrap_or_else(|| {
                panic!(
                    "Failed to request physical device! {}",
                    concat!(file!(), ":", line!())
                )
            });

        let adapter_limits = adapter.limits();
        log::debug!("Adapter limits: {:#?}", adapter_limits);

        let (device, queue) = if config
            .device_descriptor
            .required_limits
            .check_limits(&adapter_limits)
        {
            adapter.request_device(&config.device_descriptor, None)
        } else {
            log::debug!("Requested limits exceed adapter limits, clamping to adapter limits");
            adapter.request_device(
                &wgpu::DeviceDescriptor {
                    label: config.device_descriptor.label,
                    required_features: config.device_descriptor.required_features,
                    required_limits: adapter_limits,
                    memory_hints: Default::default(),
                },
                None,
            )
        }
        .await
        .unwrap_or_else(|_| {
            panic!(
                "Failed to request logical device! {}",
                concat!(file!(), ":", line!())
            )
        });

        log::debug!("Device limits: {:#?}", device.limits());

        Self {
            instance,
            adapter,
            device: Arc::new(device),
            queue: Arc::new(queue),
        }
    }

    /// Creates an offscreen context with the default configuration, blocking
    /// the calling thread until the device is ready.
    pub fn offscreen_blocking() -> Self {
        pollster::block_on(Self::offscreen(&WgpuConfig::default()))
    }
}
