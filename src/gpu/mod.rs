// gpu/mod.rs - GPU residency layer.
//
// Bitmaps may have a second copy of their pixels on the GPU. This module
// owns that copy (`GpuTexture`) and the device that moves bytes between the
// two (`GpuDevice`, which implements `PixelTransfer`). Shaders are not part
// of this crate: GPU-side tasks bind `GpuTexture::view` themselves.

pub mod device;
pub mod texture;

pub use device::GpuDevice;
pub use texture::GpuTexture;

use thiserror::Error;

use crate::bitmap::PixelFormat;

/// Errors from GPU device setup and pixel transfers.
#[derive(Debug, Error)]
pub enum GpuError {
    /// No Vulkan adapter found. On WSL2: check that `vulkaninfo` lists a
    /// real GPU.
    #[error("no suitable Vulkan adapter found")]
    NoSuitableAdapter,

    #[error("device request failed: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),

    #[error("pixel format {0:?} has no GPU texel format")]
    UnsupportedFormat(PixelFormat),

    #[error("texture {width}x{height} exceeds device limit {max} (or is empty)")]
    TextureSize { width: u32, height: u32, max: u32 },

    #[error("readback buffer map failed: {0}")]
    MapFailed(String),

    #[error("bitmap has no GPU texture to read from")]
    TextureMissing,
}
