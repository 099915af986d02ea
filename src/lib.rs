// floodmask: parallel multi-seed flood fill over CPU/GPU resident bitmaps
//
// Layers, bottom up:
//
//   geometry, image        integer points/rects, typed pixel buffers
//   bitmap                 shared pixel storage with residency and pin state
//   lock                   per-task content locks, cross-device transfers
//   task, pool             three-phase task contract, scoped worker pool
//   fill, contour          the flood-fill task and its contour tracer
//   gpu                    wgpu device and textures backing `PixelTransfer`

pub mod error;
pub mod config;
pub mod geometry;
pub mod image;
pub mod bitmap;
pub mod lock;
pub mod task;
pub mod pool;
pub mod fill;
pub mod contour;
pub mod gpu;

pub use bitmap::{Bitmap, Color, PixelFormat, Residency, ResourceId};
pub use config::{Config, FloodFillConfig, PoolConfig};
pub use contour::{trace_contours, ContourTracer, IntegerContour};
pub use error::{CornerPattern, Error, Result};
pub use fill::{BorderMorphology, FloodFill};
pub use geometry::{IntPoint, IntRect};
pub use gpu::{GpuDevice, GpuError, GpuTexture};
pub use image::{Image, Pixel};
pub use lock::{ContentLock, LockDescriptor, LockKind, PixelTransfer};
pub use pool::{AbortHandle, ThreadPool};
pub use task::{Device, DeviceRequirement, Task, WorkerContext};
