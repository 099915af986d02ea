// error.rs - Crate-wide error taxonomy.
//
// Four families, matching how far an error unwinds:
//
//   configuration   raised in `before_processing`, nothing runs
//   lock conflict   raised when a content lock is acquired
//   consistency     raised mid-walk by the contour tracer
//   range           checked pixel / channel / contour index access
//
// plus the execution-side variants the pool uses to report worker failures.
// None of these are retried anywhere in the crate.

use thiserror::Error;

use crate::bitmap::{PixelFormat, ResourceId};
use crate::gpu::GpuError;
use crate::lock::LockKind;
use crate::task::Device;

/// Errors produced by tasks, locks, bitmaps and the contour tracer.
#[derive(Debug, Error)]
pub enum Error {
    // --- configuration ---
    #[error("required resource not set: {what}")]
    MissingResource { what: &'static str },

    #[error("size mismatch: {what} ({detail})")]
    SizeMismatch { what: &'static str, detail: String },

    #[error("pixel format {format:?} cannot be used as {role}")]
    UnsupportedFormat { format: PixelFormat, role: &'static str },

    #[error("no seeds given")]
    NoSeeds,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    // --- lock conflicts ---
    #[error("lock conflict on {resource}: held {held}, requested {requested:?} on {device:?}")]
    LockConflict {
        resource: ResourceId,
        held: String,
        requested: LockKind,
        device: Device,
    },

    #[error("{resource} is not locked")]
    NotLocked { resource: ResourceId },

    #[error("{resource} needs a cross-device transfer but no pixel transfer pipeline is available")]
    NoPipeline { resource: ResourceId },

    #[error("gpu: {0}")]
    Gpu(#[from] GpuError),

    // --- algorithmic consistency ---
    #[error("bad seed point ({x},{y}), pattern lt={} rt={} lb={} rb={}",
        pattern.lt, pattern.rt, pattern.lb, pattern.rb)]
    BadSeedPoint { x: i32, y: i32, pattern: CornerPattern },

    #[error("contour starting at ({x},{y}) did not close after {steps} steps")]
    UnclosedContour { x: i32, y: i32, steps: usize },

    // --- range ---
    #[error("pixel ({x},{y}) out of range for {width}x{height}")]
    OutOfRange { x: i64, y: i64, width: usize, height: usize },

    #[error("channel {channel} out of range ({channels} channels)")]
    BadChannel { channel: usize, channels: usize },

    #[error("bad contour index {index} ({count} contours; contour computation may be disabled)")]
    BadContourIndex { index: usize, count: usize },

    // --- execution ---
    #[error("task requires a GPU but none is attached to the pool")]
    GpuRequired,

    #[error("another worker failed")]
    AnotherWorkerFailed,

    #[error("worker {worker} panicked")]
    WorkerPanicked { worker: usize },

    #[error("task state missing: {0}")]
    NotPrepared(&'static str),
}

/// Binarized 2x2 neighbourhood around a contour corner point.
///
/// `lt` is the pixel up-left of the corner, `rb` the pixel at the corner's
/// own coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CornerPattern {
    pub lt: bool,
    pub rt: bool,
    pub lb: bool,
    pub rb: bool,
}

impl CornerPattern {
    /// Lookup table index: `lt rt lb rb` as a 4-bit number, `lt` highest.
    #[inline]
    pub fn index(self) -> usize {
        (self.lt as usize) << 3 | (self.rt as usize) << 2 | (self.lb as usize) << 1 | self.rb as usize
    }

    /// All four set or none set: no boundary passes through this corner.
    #[inline]
    pub fn is_uniform(self) -> bool {
        let n = self.lt as u8 + self.rt as u8 + self.lb as u8 + self.rb as u8;
        n == 0 || n == 4
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
