//! Render-target attachments with synchronous CPU read-back.
//!
//! Every sensor pass renders into one of these instead of a window surface.
//! The attachment owns both the GPU texture and a `MAP_READ` staging buffer
//! sized for it, so the texture-to-buffer copy and the row-pitch handling
//! live in exactly one place.

use crate::pass::tex_fmt_bpp;

/// Rows of a texture-to-buffer copy must be aligned to
/// `wgpu::COPY_BYTES_PER_ROW_ALIGNMENT` (256). Reading the staging buffer
/// back with `width * bpp` instead of this padded pitch shears the image,
/// which is why the read-back below strips the padding itself instead of
/// handing out the raw mapped bytes.
pub const fn padded_bytes_per_row(width: u32, format: wgpu::TextureFormat) -> u32 {
    let unpadded = width * tex_fmt_bpp(format);
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    (unpadded + align - 1) / align * align
}

/// A color render target plus its staging buffer.
pub struct ColorAttachment {
    /// The texture rendered into.
    pub texture: wgpu::Texture,
    /// View over the whole texture.
    pub view: wgpu::TextureView,
    /// Staging buffer the texture is copied into for read-back.
    storage: wgpu::Buffer,
    /// Texture format.
    pub format: wgpu::TextureFormat,
    /// Extent of the texture.
    pub extent: wgpu::Extent3d,
    /// Bytes per row of the staging buffer, 256-byte aligned.
    padded_bytes_per_row: u32,
}

impl ColorAttachment {
    /// Creates a new color attachment.
    ///
    /// Returns `None` when either dimension is zero; callers are expected to
    /// check, creation failures never panic.
    pub fn new(
        device: &wgpu::Device,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
        label: &str,
    ) -> Option<Self> {
        if width == 0 || height == 0 {
            log::error!("Attachment '{label}' requested with zero size ({width}x{height})");
            return None;
        }
        let extent = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: extent,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let padded = padded_bytes_per_row(width, format);
        let storage = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&format!("{label}-storage")),
            size: padded as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        Some(Self {
            texture,
            view,
            storage,
            format,
            extent,
            padded_bytes_per_row: padded,
        })
    }

    /// Records the texture-to-staging copy into `encoder`.
    pub fn copy_to_storage(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &self.storage,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(self.padded_bytes_per_row),
                    rows_per_image: Some(self.extent.height),
                },
            },
            self.extent,
        );
    }

    /// Maps the staging buffer and copies its contents into `dst` with the
    /// row padding stripped, so `dst` ends up tightly packed
    /// (`width * bpp * height` bytes).
    ///
    /// Blocks until the GPU has finished all submitted work, which also
    /// guarantees the copy recorded by [`Self::copy_to_storage`] completed.
    pub fn read_back(&self, device: &wgpu::Device, dst: &mut [u8]) {
        let unpadded = (self.extent.width * tex_fmt_bpp(self.format)) as usize;
        debug_assert_eq!(dst.len(), unpadded * self.extent.height as usize);
        {
            let slice = self.storage.slice(..);
            let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
            slice.map_async(wgpu::MapMode::Read, move |result| {
                sender.send(result).unwrap();
            });
            device.poll(wgpu::Maintain::Wait);
            pollster::block_on(async {
                receiver.receive().await.unwrap().unwrap();
            });

            let view = slice.get_mapped_range();
            let padded = self.padded_bytes_per_row as usize;
            for (row, dst_row) in dst.chunks_exact_mut(unpadded).enumerate() {
                let start = row * padded;
                dst_row.copy_from_slice(&view[start..start + unpadded]);
            }
        }
        self.storage.unmap();
    }

    /// Size of the tightly packed read-back, in bytes.
    pub fn unpadded_size_in_bytes(&self) -> usize {
        (self.extent.width * tex_fmt_bpp(self.format) * self.extent.height) as usize
    }
}

/// A depth render target plus its staging buffer.
///
/// Same shape as [`ColorAttachment`], kept separate because the usage flags
/// and the sampler semantics differ (depth textures are sampled with a
/// non-filtering sampler in the post-process passes).
pub struct DepthAttachment {
    /// The depth texture.
    pub texture: wgpu::Texture,
    /// View over the whole texture.
    pub view: wgpu::TextureView,
    /// Sampler used to read the depth texture from post-process shaders.
    pub sampler: wgpu::Sampler,
    storage: wgpu::Buffer,
    /// Extent of the texture.
    pub extent: wgpu::Extent3d,
    padded_bytes_per_row: u32,
}

impl DepthAttachment {
    /// Texture format used for every depth attachment.
    pub const FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

    /// Creates a new depth attachment; `None` on zero size.
    pub fn new(device: &wgpu::Device, width: u32, height: u32, label: &str) -> Option<Self> {
        if width == 0 || height == 0 {
            log::error!("Depth attachment '{label}' requested with zero size ({width}x{height})");
            return None;
        }
        let extent = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: extent,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: Self::FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });
        let padded = padded_bytes_per_row(width, Self::FORMAT);
        let storage = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&format!("{label}-storage")),
            size: padded as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        Some(Self {
            texture,
            view,
            sampler,
            storage,
            extent,
            padded_bytes_per_row: padded,
        })
    }

    /// Records the texture-to-staging copy into `encoder`.
    pub fn copy_to_storage(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &self.storage,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(self.padded_bytes_per_row),
                    rows_per_image: Some(self.extent.height),
                },
            },
            self.extent,
        );
    }

    /// Reads the depth buffer back as `f32` values, stripping row padding.
    pub fn read_back(&self, device: &wgpu::Device, dst: &mut [f32]) {
        let width = self.extent.width as usize;
        debug_assert_eq!(dst.len(), width * self.extent.height as usize);
        {
            let slice = self.storage.slice(..);
            let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
            slice.map_async(wgpu::MapMode::Read, move |result| {
                sender.send(result).unwrap();
            });
            device.poll(wgpu::Maintain::Wait);
            pollster::block_on(async {
                receiver.receive().await.unwrap().unwrap();
            });

            let view = slice.get_mapped_range();
            let padded = self.padded_bytes_per_row as usize;
            for (row, dst_row) in dst.chunks_exact_mut(width).enumerate() {
                let bytes = &view[row * padded..row * padded + width * 4];
                dst_row.copy_from_slice(bytemuck::cast_slice(bytes));
            }
        }
        self.storage.unmap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_padding() {
        // 4 bytes per pixel, 30 pixels wide: 120 bytes padded up to 256.
        assert_eq!(
            padded_bytes_per_row(30, wgpu::TextureFormat::Rgba8Unorm),
            256
        );
        // Already aligned widths stay untouched.
        assert_eq!(
            padded_bytes_per_row(64, wgpu::TextureFormat::Rgba8Unorm),
            256
        );
        assert_eq!(
            padded_bytes_per_row(128, wgpu::TextureFormat::Rgba32Float),
            2048
        );
    }
}
