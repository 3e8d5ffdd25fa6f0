//! Render pass bundle.

/// A render pipeline bundled with the resources it draws with.
pub struct RenderPass {
    /// The render pipeline.
    pub pipeline: wgpu::RenderPipeline,
    /// Bind groups, in set order.
    pub bind_groups: Vec<wgpu::BindGroup>,
    /// Uniform buffer backing bind group 0, when the pass owns one.
    pub uniform_buffer: Option<wgpu::Buffer>,
}

/// Bytes per pixel of the texture formats used by the sensor pipelines.
pub const fn tex_fmt_bpp(format: wgpu::TextureFormat) -> u32 {
    match format {
        wgpu::TextureFormat::R8Unorm | wgpu::TextureFormat::R8Uint => 1,
        wgpu::TextureFormat::R16Uint | wgpu::TextureFormat::R16Unorm => 2,
        wgpu::TextureFormat::Rgba8Unorm
        | wgpu::TextureFormat::Rgba8UnormSrgb
        | wgpu::TextureFormat::Bgra8Unorm
        | wgpu::TextureFormat::Rgb10a2Unorm
        | wgpu::TextureFormat::R32Float
        | wgpu::TextureFormat::Depth32Float => 4,
        wgpu::TextureFormat::Rg32Float => 8,
        wgpu::TextureFormat::Rgba32Float => 16,
        _ => panic!("unsupported texture format"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_per_pixel() {
        assert_eq!(tex_fmt_bpp(wgpu::TextureFormat::Rgba8Unorm), 4);
        assert_eq!(tex_fmt_bpp(wgpu::TextureFormat::Depth32Float), 4);
        assert_eq!(tex_fmt_bpp(wgpu::TextureFormat::Rgba32Float), 16);
        assert_eq!(tex_fmt_bpp(wgpu::TextureFormat::R16Uint), 2);
    }
}
