// gpu/texture.rs - GPU copy of a bitmap and CPU↔GPU byte transfer.
//
// `GpuTexture` is the GPU-side half of a `Bitmap`: a 2D texture with the
// same size and a texel format matching the bitmap's `PixelFormat`. The
// content lock never talks to it directly; it goes through
// `PixelTransfer` (implemented by `GpuDevice`), which calls `upload` and
// `readback` here.
//
// ROW ALIGNMENT
// ─────────────
// wgpu's buffer↔texture copies require `bytes_per_row` to be a multiple of
// 256. Bitmap rows are tightly packed (`width * bytes_per_pixel`), so both
// directions go through a staging buffer whose rows are padded:
//
//   bitmap row:   [p0 p1 p2 ... p(w-1)]
//   staging row:  [p0 p1 p2 ... p(w-1) | zero padding up to 256·k bytes]
//
// Readback strips the padding again.

use wgpu::util::DeviceExt;

use crate::bitmap::{Bitmap, PixelFormat};
use crate::gpu::device::GpuDevice;
use crate::gpu::GpuError;

const COPY_ALIGNMENT: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

/// Texel format used to store `format` on the GPU.
///
/// `Rgb8` has no 3-channel texel format in WebGPU and is rejected; expand
/// such inputs to `Rgba8` on the CPU first.
pub fn texture_format(format: PixelFormat) -> Result<wgpu::TextureFormat, GpuError> {
    match format {
        PixelFormat::Gray8 | PixelFormat::Binary => Ok(wgpu::TextureFormat::R8Unorm),
        PixelFormat::Rgba8 => Ok(wgpu::TextureFormat::Rgba8Unorm),
        PixelFormat::GrayF32 => Ok(wgpu::TextureFormat::R32Float),
        PixelFormat::RgbaF32 => Ok(wgpu::TextureFormat::Rgba32Float),
        PixelFormat::Rgb8 => Err(GpuError::UnsupportedFormat(format)),
    }
}

/// Usages of every texture created for a bitmap: sampled by shaders and
/// copied in both directions. Not a storage binding, which `R8Unorm` does
/// not support.
pub fn texture_usages() -> wgpu::TextureUsages {
    wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST | wgpu::TextureUsages::COPY_SRC
}

/// A bitmap's pixels resident on the GPU as a 2D texture.
///
/// Owns its wgpu resources; dropping it releases the texture memory.
pub struct GpuTexture {
    pub texture: wgpu::Texture,
    /// Full-texture view, for binding to shaders.
    pub view: wgpu::TextureView,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl GpuTexture {
    /// Allocate an uninitialized texture for a `width x height` bitmap.
    pub fn create(gpu: &GpuDevice, width: u32, height: u32, format: PixelFormat) -> Result<Self, GpuError> {
        let texel = texture_format(format)?;
        let max = gpu.max_texture_dimension();
        if width == 0 || height == 0 || width > max || height > max {
            return Err(GpuError::TextureSize { width, height, max });
        }

        let texture = gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("GpuTexture"),
            size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: texel,
            usage: texture_usages(),
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        Ok(GpuTexture { texture, view, width, height, format })
    }

    /// Whether this texture can hold `bitmap` without reallocation.
    pub fn matches(&self, bitmap: &Bitmap) -> bool {
        self.width as usize == bitmap.width() && self.height as usize == bitmap.height() && self.format == bitmap.format()
    }

    fn row_bytes(&self) -> u32 {
        self.width * self.format.bytes_per_pixel() as u32
    }

    /// Copy tightly packed bitmap bytes into the texture.
    ///
    /// The copy is submitted but not waited on; later submissions on the
    /// same queue observe it.
    pub fn upload(&self, gpu: &GpuDevice, bytes: &[u8]) {
        let row = self.row_bytes() as usize;
        let staging = pad_rows(bytes, row, self.height as usize);
        let aligned = padded_row(self.row_bytes());

        let staging_buf = gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("GpuTexture::staging"),
            contents: &staging,
            usage: wgpu::BufferUsages::COPY_SRC,
        });

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("GpuTexture::upload") });
        encoder.copy_buffer_to_texture(
            wgpu::ImageCopyBuffer {
                buffer: &staging_buf,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(aligned),
                    rows_per_image: Some(self.height),
                },
            },
            wgpu::ImageCopyTexture {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::Extent3d { width: self.width, height: self.height, depth_or_array_layers: 1 },
        );
        gpu.queue.submit(std::iter::once(encoder.finish()));
    }

    /// Read the texture back as tightly packed bytes. Blocks until the GPU
    /// copy completes.
    pub fn readback(&self, gpu: &GpuDevice) -> Result<Vec<u8>, GpuError> {
        let aligned = padded_row(self.row_bytes());
        let readback_buf = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("GpuTexture::readback"),
            size: aligned as u64 * self.height as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("GpuTexture::readback") });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &readback_buf,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(aligned),
                    rows_per_image: Some(self.height),
                },
            },
            wgpu::Extent3d { width: self.width, height: self.height, depth_or_array_layers: 1 },
        );
        gpu.queue.submit(std::iter::once(encoder.finish()));

        let slice = readback_buf.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            // The receiver outlives the poll below; a send error cannot happen.
            let _ = sender.send(result);
        });
        gpu.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|_| GpuError::MapFailed("map callback never fired".into()))?
            .map_err(|e| GpuError::MapFailed(e.to_string()))?;

        let out = {
            let mapped = slice.get_mapped_range();
            strip_rows(&mapped, aligned as usize, self.row_bytes() as usize, self.height as usize)
        };
        readback_buf.unmap();
        Ok(out)
    }
}

/// Copy `height` packed rows of `row` bytes into rows padded to the copy
/// alignment.
fn pad_rows(bytes: &[u8], row: usize, height: usize) -> Vec<u8> {
    let aligned = padded_row(row as u32) as usize;
    let mut staging = vec![0u8; aligned * height];
    for y in 0..height {
        staging[y * aligned..y * aligned + row].copy_from_slice(&bytes[y * row..(y + 1) * row]);
    }
    staging
}

/// Inverse of `pad_rows`.
fn strip_rows(padded: &[u8], aligned: usize, row: usize, height: usize) -> Vec<u8> {
    let mut out = vec![0u8; row * height];
    for y in 0..height {
        out[y * row..(y + 1) * row].copy_from_slice(&padded[y * aligned..y * aligned + row]);
    }
    out
}

/// Bytes per staging row for a packed row of `row` bytes.
#[inline]
fn padded_row(row: u32) -> u32 {
    row.div_ceil(COPY_ALIGNMENT) * COPY_ALIGNMENT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_rows_are_copy_aligned() {
        // empty, 1 px Gray8, 64 px Gray8, 64 px Rgba8, 65 px GrayF32
        for (row, want) in [(0, 0), (1, 256), (64, 256), (256, 256), (260, 512)] {
            assert_eq!(padded_row(row), want, "row of {row} bytes");
        }
    }

    #[test]
    fn test_texture_formats() {
        assert_eq!(texture_format(PixelFormat::Gray8).unwrap(), wgpu::TextureFormat::R8Unorm);
        assert_eq!(texture_format(PixelFormat::Binary).unwrap(), wgpu::TextureFormat::R8Unorm);
        assert_eq!(texture_format(PixelFormat::RgbaF32).unwrap(), wgpu::TextureFormat::Rgba32Float);
        assert!(matches!(
            texture_format(PixelFormat::Rgb8),
            Err(GpuError::UnsupportedFormat(PixelFormat::Rgb8))
        ));
    }

    #[test]
    fn test_usages_valid_for_mask_textures() {
        let usages = texture_usages();
        assert!(!usages.contains(wgpu::TextureUsages::STORAGE_BINDING));
        assert!(usages.contains(wgpu::TextureUsages::COPY_DST | wgpu::TextureUsages::COPY_SRC));
    }

    #[test]
    fn test_pad_and_strip_rows() {
        // 3 rows of 5 bytes (e.g. 5 Gray8 pixels).
        let bytes: Vec<u8> = (1..=15).collect();
        let padded = pad_rows(&bytes, 5, 3);
        assert_eq!(padded.len(), 256 * 3);
        assert_eq!(&padded[0..5], &[1, 2, 3, 4, 5]);
        assert_eq!(&padded[256..261], &[6, 7, 8, 9, 10]);
        assert!(padded[5..256].iter().all(|&b| b == 0));
        assert_eq!(strip_rows(&padded, 256, 5, 3), bytes);
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_upload_round_trip_f32() {
        let gpu = GpuDevice::new().expect("need Vulkan GPU");
        let values: Vec<f32> = (0..70 * 3).map(|i| i as f32 / 256.0).collect();
        let bytes: Vec<u8> = bytemuck::cast_slice(&values).to_vec();
        let tex = GpuTexture::create(&gpu, 70, 3, PixelFormat::GrayF32).unwrap();
        tex.upload(&gpu, &bytes);
        assert_eq!(tex.readback(&gpu).unwrap(), bytes);
    }
}
