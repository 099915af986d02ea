// gpu/device.rs - wgpu device that moves bitmap pixels to and from the GPU.
//
// `GpuDevice` is what a `ThreadPool` gets as its GPU pipeline. The content
// lock calls its `PixelTransfer` methods whenever a bitmap is locked on a
// device whose copy is stale:
//
//   push_pixels   CPU bytes ──upload──▶ GpuTexture   (created on demand)
//   pull_pixels   GpuTexture ──readback──▶ CPU bytes
//
// Adapters are enumerated explicitly instead of via `request_adapter`: on
// WSL2 the software rasterizer shows up as a regular Vulkan device and the
// power-preference heuristic may pick it. Adapters are ranked by device
// type and the best one is used.

use std::fmt;

use tracing::{debug, info};

use crate::bitmap::Bitmap;
use crate::error::Result;
use crate::gpu::texture::GpuTexture;
use crate::gpu::GpuError;
use crate::lock::PixelTransfer;

/// Adapter, device and queue used for bitmap transfers.
///
/// Creating one is slow; build it once and share it as `Arc<GpuDevice>`.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter: wgpu::AdapterInfo,
    pub limits: wgpu::Limits,
    // Dropped last: dzn (D3D12 behind Vulkan on WSL2) crashes if the
    // instance goes away before the device.
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// Open the best Vulkan adapter with default limits.
    pub fn new() -> Result<Self, GpuError> {
        pollster::block_on(Self::open(wgpu::Limits::default()))
    }

    /// Like `new`, but textures larger than `max` pixels per side are
    /// refused. Use it to reproduce a small target's limits on a big GPU.
    pub fn with_max_texture_dimension(max: u32) -> Result<Self, GpuError> {
        let limits = wgpu::Limits { max_texture_dimension_2d: max, ..wgpu::Limits::default() };
        pollster::block_on(Self::open(limits))
    }

    async fn open(limits: wgpu::Limits) -> Result<Self, GpuError> {
        // dzn reports itself as non-conformant; without this flag wgpu hides
        // it and only llvmpipe is left. Texture copies do not care.
        let mut flags = wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER;
        if cfg!(debug_assertions) {
            flags |= wgpu::InstanceFlags::VALIDATION;
        }
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::VULKAN,
            flags,
            ..Default::default()
        });

        let adapter = instance
            .enumerate_adapters(wgpu::Backends::VULKAN)
            .into_iter()
            .inspect(|a| {
                let i = a.get_info();
                debug!(name = %i.name, device_type = ?i.device_type, "vulkan adapter found");
            })
            .max_by_key(|a| adapter_rank(a.get_info().device_type))
            .ok_or(GpuError::NoSuitableAdapter)?;
        let info = adapter.get_info();

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("floodmask"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits.clone(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await?;

        info!(
            adapter = %info.name,
            device_type = ?info.device_type,
            max_texture = limits.max_texture_dimension_2d,
            "gpu device ready"
        );
        Ok(GpuDevice { device, queue, adapter: info, limits, _instance: instance })
    }

    /// Largest texture side this device accepts.
    pub fn max_texture_dimension(&self) -> u32 {
        self.limits.max_texture_dimension_2d
    }
}

/// Preference order among adapters; higher wins. Software rasterizers
/// come last but are still used when nothing else exists.
fn adapter_rank(device_type: wgpu::DeviceType) -> u8 {
    match device_type {
        wgpu::DeviceType::DiscreteGpu => 4,
        wgpu::DeviceType::IntegratedGpu => 3,
        wgpu::DeviceType::VirtualGpu => 2,
        wgpu::DeviceType::Other => 1,
        wgpu::DeviceType::Cpu => 0,
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, max texture {})", self.adapter.name, self.adapter.device_type, self.max_texture_dimension())
    }
}

impl PixelTransfer for GpuDevice {
    /// Upload the CPU bytes, (re)creating the texture when the bitmap has
    /// none yet or its shape changed.
    fn push_pixels(&self, bitmap: &Bitmap) -> Result<()> {
        let bytes = bitmap.read_bytes();
        let mut slot = bitmap.gpu_slot().lock();
        if !slot.as_ref().is_some_and(|t| t.matches(bitmap)) {
            *slot = Some(GpuTexture::create(self, bitmap.width() as u32, bitmap.height() as u32, bitmap.format())?);
        }
        let texture = slot.as_ref().ok_or(GpuError::TextureMissing)?;
        texture.upload(self, &bytes);
        debug!(bitmap = %bitmap.id(), bytes = bytes.len(), "pixels pushed to gpu");
        Ok(())
    }

    fn pull_pixels(&self, bitmap: &Bitmap) -> Result<()> {
        let bytes = {
            let slot = bitmap.gpu_slot().lock();
            slot.as_ref().ok_or(GpuError::TextureMissing)?.readback(self)?
        };
        bitmap.write_bytes(&bytes)?;
        debug!(bitmap = %bitmap.id(), bytes = bytes.len(), "pixels pulled from gpu");
        Ok(())
    }
}
