// bitmap.rs - Shared pixel resource with CPU/GPU residency tracking.
//
// A `Bitmap` is the unit that tasks lock, read and write. It owns:
//
//   - a CPU copy of the pixels, stored as `[AtomicU8]` so several workers can
//     write the same mask at once (mask updates are fetch_max / fetch_min,
//     which makes concurrent writes order independent);
//   - an optional GPU copy (`GpuTexture`, filled by a `PixelTransfer`);
//   - two residency flags saying which of the copies is current;
//   - a pin counter, raised while a content lock needs the CPU bytes.
//
// Nothing here decides *when* to transfer. That is the content lock's job
// (lock.rs); the bitmap only stores state.
//
// PIXEL LAYOUTS
// ─────────────
// Each `PixelFormat` has a zero-sized layout type implementing `PixelLayout`.
// Readers are generic over the layout, so the per-pixel decode is
// monomorphized. The format tag is matched exactly once, at the call
// boundary, with `with_layout!`.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::gpu::GpuTexture;
use crate::image::{Image, Pixel};
use crate::task::Device;

/// Run `$body` with `$L` bound to the layout type of `$format`.
///
/// ```ignore
/// let c = with_layout!(bitmap.format(), L => PixelReader::<L>::new(&bitmap)?.at(0, 0));
/// ```
macro_rules! with_layout {
    ($format:expr, $L:ident => $body:expr) => {
        match $format {
            $crate::bitmap::PixelFormat::Gray8 => {
                type $L = $crate::bitmap::Gray8;
                $body
            }
            $crate::bitmap::PixelFormat::Binary => {
                type $L = $crate::bitmap::BinaryLayout;
                $body
            }
            $crate::bitmap::PixelFormat::Rgb8 => {
                type $L = $crate::bitmap::Rgb8;
                $body
            }
            $crate::bitmap::PixelFormat::Rgba8 => {
                type $L = $crate::bitmap::Rgba8;
                $body
            }
            $crate::bitmap::PixelFormat::GrayF32 => {
                type $L = $crate::bitmap::GrayF32;
                $body
            }
            $crate::bitmap::PixelFormat::RgbaF32 => {
                type $L = $crate::bitmap::RgbaF32;
                $body
            }
        }
    };
}
pub(crate) use with_layout;

// ---------------------------------------------------------------------------
// Formats
// ---------------------------------------------------------------------------

/// Pixel layout of a bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// One byte per pixel, 0..=255.
    Gray8,
    /// One byte per pixel holding 0 or 1. Usable as a mask of range 1.
    Binary,
    /// Three bytes per pixel.
    Rgb8,
    /// Four bytes per pixel.
    Rgba8,
    /// One native-endian f32 per pixel, nominally in [0, 1].
    GrayF32,
    /// Four native-endian f32 per pixel.
    RgbaF32,
}

impl PixelFormat {
    pub const fn channels(self) -> usize {
        match self {
            PixelFormat::Gray8 | PixelFormat::Binary | PixelFormat::GrayF32 => 1,
            PixelFormat::Rgb8 => 3,
            PixelFormat::Rgba8 | PixelFormat::RgbaF32 => 4,
        }
    }

    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Gray8 | PixelFormat::Binary => 1,
            PixelFormat::Rgb8 => 3,
            PixelFormat::Rgba8 | PixelFormat::GrayF32 => 4,
            PixelFormat::RgbaF32 => 16,
        }
    }

    /// Largest stored value when the format is used as a mask, `None` if it
    /// cannot be a mask.
    pub const fn mask_range(self) -> Option<u8> {
        match self {
            PixelFormat::Gray8 => Some(u8::MAX),
            PixelFormat::Binary => Some(1),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Identity and residency
// ---------------------------------------------------------------------------

/// Process-unique identity of a bitmap. Content locks key on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ResourceId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bitmap#{}", self.0)
    }
}

/// Which copies of the pixel data are current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Residency {
    pub cpu: bool,
    pub gpu: bool,
}

impl Residency {
    #[inline]
    pub fn is_up_to_date(self, device: Device) -> bool {
        match device {
            Device::Cpu => self.cpu,
            Device::Gpu => self.gpu,
        }
    }

    #[inline]
    pub fn mark_up_to_date(&mut self, device: Device) {
        match device {
            Device::Cpu => self.cpu = true,
            Device::Gpu => self.gpu = true,
        }
    }
}

// ---------------------------------------------------------------------------
// Bitmap
// ---------------------------------------------------------------------------

/// A shared 2D pixel buffer with a CPU copy, an optional GPU copy and
/// residency flags. Share it between tasks as `Arc<Bitmap>`.
pub struct Bitmap {
    id: ResourceId,
    format: PixelFormat,
    width: usize,
    height: usize,
    /// Row-major, tightly packed: `width * bytes_per_pixel` bytes per row.
    pixels: Box<[AtomicU8]>,
    residency: Mutex<Residency>,
    gpu: Mutex<Option<GpuTexture>>,
    pins: AtomicUsize,
}

impl Bitmap {
    /// A zero-filled bitmap, current on CPU only.
    pub fn new(format: PixelFormat, width: usize, height: usize) -> Self {
        let len = width * height * format.bytes_per_pixel();
        Self::from_atomic(format, width, height, (0..len).map(|_| AtomicU8::new(0)).collect())
    }

    /// Wrap tightly packed bytes.
    pub fn from_bytes(format: PixelFormat, width: usize, height: usize, bytes: Vec<u8>) -> Result<Self> {
        let expected = width * height * format.bytes_per_pixel();
        if bytes.len() != expected {
            return Err(Error::SizeMismatch {
                what: "bitmap bytes",
                detail: format!("expected {expected} bytes for {width}x{height} {format:?}, got {}", bytes.len()),
            });
        }
        Ok(Self::from_atomic(format, width, height, bytes.into_iter().map(AtomicU8::new).collect()))
    }

    /// Pack a single-channel image. Stride padding is dropped.
    pub fn from_image<T: Pixel>(img: &Image<T>) -> Self {
        let mut bytes = Vec::with_capacity(img.width() * img.height() * T::FORMAT.bytes_per_pixel());
        for y in 0..img.height() {
            for &v in img.row(y) {
                v.pack(&mut bytes);
            }
        }
        Self::from_atomic(T::FORMAT, img.width(), img.height(), bytes.into_iter().map(AtomicU8::new).collect())
    }

    /// Pack a 0/non-zero image into a `Binary` bitmap.
    pub fn binary_from_image(img: &Image<u8>) -> Self {
        let bytes = img.pixels().map(|(_, _, v)| AtomicU8::new((v != 0) as u8)).collect();
        Self::from_atomic(PixelFormat::Binary, img.width(), img.height(), bytes)
    }

    fn from_atomic(format: PixelFormat, width: usize, height: usize, pixels: Box<[AtomicU8]>) -> Self {
        Bitmap {
            id: ResourceId::next(),
            format,
            width,
            height,
            pixels,
            residency: Mutex::new(Residency { cpu: true, gpu: false }),
            gpu: Mutex::new(None),
            pins: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn id(&self) -> ResourceId {
        self.id
    }

    #[inline]
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.format.channels()
    }

    /// Snapshot of the residency flags.
    pub fn residency(&self) -> Residency {
        *self.residency.lock()
    }

    pub fn is_up_to_date(&self, device: Device) -> bool {
        self.residency.lock().is_up_to_date(device)
    }

    /// `true` while at least one content lock holds the CPU bytes.
    pub fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }

    /// Copy of the CPU bytes, tightly packed.
    pub fn read_bytes(&self) -> Vec<u8> {
        self.pixels.iter().map(|b| b.load(Ordering::Relaxed)).collect()
    }

    /// Overwrite the CPU bytes. Residency flags are left to the caller.
    pub fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.pixels.len() {
            return Err(Error::SizeMismatch {
                what: "bitmap bytes",
                detail: format!("expected {} bytes, got {}", self.pixels.len(), bytes.len()),
            });
        }
        for (dst, &src) in self.pixels.iter().zip(bytes) {
            dst.store(src, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Zero the CPU copy. The CPU copy becomes the only current one.
    pub fn zero(&self) {
        for b in self.pixels.iter() {
            b.store(0, Ordering::Relaxed);
        }
        *self.residency.lock() = Residency { cpu: true, gpu: false };
    }

    /// Mark the copy on `device` stale, leaving the other copy as the only
    /// current one. For writers that update a copy outside a content lock.
    pub fn invalidate(&self, device: Device) {
        let mut r = self.residency.lock();
        *r = match device {
            Device::Cpu => Residency { cpu: false, gpu: true },
            Device::Gpu => Residency { cpu: true, gpu: false },
        };
    }

    /// Unpack into an owned image. `T` must match the bitmap format.
    pub fn to_image<T: Pixel>(&self) -> Result<Image<T>> {
        if !T::unpacks_from(self.format) {
            return Err(Error::UnsupportedFormat { format: self.format, role: "image element type" });
        }
        let bpp = self.format.bytes_per_pixel();
        let bytes = self.read_bytes();
        let data = bytes.chunks_exact(bpp).map(T::unpack).collect();
        Ok(Image::from_vec(self.width, self.height, data))
    }

    /// Checked, normalized pixel read.
    pub fn pixel(&self, x: usize, y: usize) -> Result<Color> {
        if x >= self.width || y >= self.height {
            return Err(Error::OutOfRange {
                x: x as i64,
                y: y as i64,
                width: self.width,
                height: self.height,
            });
        }
        Ok(with_layout!(self.format, L => PixelReader::<L>::new(self)?.at(x, y)))
    }

    /// Number of pixels with any non-zero byte. Meant for masks.
    pub fn count_nonzero(&self) -> usize {
        let bpp = self.format.bytes_per_pixel();
        self.pixels
            .chunks_exact(bpp)
            .filter(|px| px.iter().any(|b| b.load(Ordering::Relaxed) != 0))
            .count()
    }

    // --- crate-internal state used by the content lock and GPU transfers ---

    pub(crate) fn residency_guard(&self) -> MutexGuard<'_, Residency> {
        self.residency.lock()
    }

    pub(crate) fn gpu_slot(&self) -> &Mutex<Option<GpuTexture>> {
        &self.gpu
    }

    pub(crate) fn pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unpin(&self) {
        let prev = self.pins.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpinning {} which is not pinned", self.id);
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("id", &self.id)
            .field("format", &self.format)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("residency", &self.residency())
            .field("pinned", &self.is_pinned())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Color
// ---------------------------------------------------------------------------

/// Normalized pixel value: up to four channels in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    values: [f32; 4],
    channels: usize,
}

impl Color {
    pub fn new(values: &[f32]) -> Self {
        debug_assert!(!values.is_empty() && values.len() <= 4);
        let mut v = [0.0; 4];
        v[..values.len()].copy_from_slice(values);
        Color { values: v, channels: values.len() }
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn channel(&self, channel: usize) -> Result<f32> {
        if channel >= self.channels {
            return Err(Error::BadChannel { channel, channels: self.channels });
        }
        Ok(self.values[channel])
    }

    /// Largest per-channel absolute difference. NaN if any channel
    /// difference is NaN.
    #[inline]
    pub fn max_abs_diff(&self, other: &Color) -> f32 {
        self.values[..self.channels]
            .iter()
            .zip(&other.values[..self.channels])
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, |acc, d| if d.is_nan() || d > acc { d } else { acc })
    }

    pub fn mean(&self) -> f32 {
        self.values[..self.channels].iter().sum::<f32>() / self.channels as f32
    }
}

// ---------------------------------------------------------------------------
// Layouts and readers
// ---------------------------------------------------------------------------

/// Decode rule for one `PixelFormat`.
pub trait PixelLayout: Send + Sync + 'static {
    const FORMAT: PixelFormat;

    /// Decode one pixel from its `FORMAT.bytes_per_pixel()` bytes.
    fn load(bytes: &[AtomicU8]) -> Color;
}

#[inline(always)]
fn byte(b: &AtomicU8) -> u8 {
    b.load(Ordering::Relaxed)
}

#[inline(always)]
fn f32_at(bytes: &[AtomicU8], i: usize) -> f32 {
    let o = i * 4;
    f32::from_ne_bytes([byte(&bytes[o]), byte(&bytes[o + 1]), byte(&bytes[o + 2]), byte(&bytes[o + 3])])
}

pub struct Gray8;
pub struct BinaryLayout;
pub struct Rgb8;
pub struct Rgba8;
pub struct GrayF32;
pub struct RgbaF32;

impl PixelLayout for Gray8 {
    const FORMAT: PixelFormat = PixelFormat::Gray8;

    #[inline]
    fn load(bytes: &[AtomicU8]) -> Color {
        Color::new(&[byte(&bytes[0]) as f32 / 255.0])
    }
}

impl PixelLayout for BinaryLayout {
    const FORMAT: PixelFormat = PixelFormat::Binary;

    #[inline]
    fn load(bytes: &[AtomicU8]) -> Color {
        Color::new(&[if byte(&bytes[0]) != 0 { 1.0 } else { 0.0 }])
    }
}

impl PixelLayout for Rgb8 {
    const FORMAT: PixelFormat = PixelFormat::Rgb8;

    #[inline]
    fn load(bytes: &[AtomicU8]) -> Color {
        Color::new(&[
            byte(&bytes[0]) as f32 / 255.0,
            byte(&bytes[1]) as f32 / 255.0,
            byte(&bytes[2]) as f32 / 255.0,
        ])
    }
}

impl PixelLayout for Rgba8 {
    const FORMAT: PixelFormat = PixelFormat::Rgba8;

    #[inline]
    fn load(bytes: &[AtomicU8]) -> Color {
        Color::new(&[
            byte(&bytes[0]) as f32 / 255.0,
            byte(&bytes[1]) as f32 / 255.0,
            byte(&bytes[2]) as f32 / 255.0,
            byte(&bytes[3]) as f32 / 255.0,
        ])
    }
}

impl PixelLayout for GrayF32 {
    const FORMAT: PixelFormat = PixelFormat::GrayF32;

    #[inline]
    fn load(bytes: &[AtomicU8]) -> Color {
        Color::new(&[f32_at(bytes, 0)])
    }
}

impl PixelLayout for RgbaF32 {
    const FORMAT: PixelFormat = PixelFormat::RgbaF32;

    #[inline]
    fn load(bytes: &[AtomicU8]) -> Color {
        Color::new(&[f32_at(bytes, 0), f32_at(bytes, 1), f32_at(bytes, 2), f32_at(bytes, 3)])
    }
}

/// Read cursor over a bitmap with a statically known layout.
pub struct PixelReader<'a, L: PixelLayout> {
    bitmap: &'a Bitmap,
    /// Pixel index of the cursor.
    pos: usize,
    _layout: PhantomData<L>,
}

impl<'a, L: PixelLayout> PixelReader<'a, L> {
    pub fn new(bitmap: &'a Bitmap) -> Result<Self> {
        if bitmap.format() != L::FORMAT {
            return Err(Error::UnsupportedFormat { format: bitmap.format(), role: "reader layout" });
        }
        Ok(PixelReader { bitmap, pos: 0, _layout: PhantomData })
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.bitmap.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.bitmap.height
    }

    #[inline]
    pub fn channels(&self) -> usize {
        L::FORMAT.channels()
    }

    /// Move the cursor to (x, y).
    #[inline]
    pub fn go_to(&mut self, x: usize, y: usize) {
        debug_assert!(x < self.width() && y < self.height(), "cursor ({x},{y}) out of range");
        self.pos = y * self.bitmap.width + x;
    }

    /// Step the cursor one pixel to the right (wrapping to the next row).
    #[inline]
    pub fn advance(&mut self) {
        self.pos += 1;
    }

    /// Pixel under the cursor.
    #[inline]
    pub fn current(&self) -> Color {
        self.load_index(self.pos)
    }

    /// Pixel at (x, y). Range is only checked in debug builds.
    #[inline]
    pub fn at(&self, x: usize, y: usize) -> Color {
        debug_assert!(x < self.width() && y < self.height(), "read ({x},{y}) out of range");
        self.load_index(y * self.bitmap.width + x)
    }

    #[inline]
    fn load_index(&self, i: usize) -> Color {
        let bpp = L::FORMAT.bytes_per_pixel();
        L::load(&self.bitmap.pixels[i * bpp..(i + 1) * bpp])
    }
}

// ---------------------------------------------------------------------------
// Mask writer
// ---------------------------------------------------------------------------

/// Monotonic writer over a one-byte-per-pixel mask bitmap.
///
/// `raise` and `lower` are atomic max / min, so any number of workers may
/// write the same mask concurrently and the final content does not depend
/// on their interleaving.
#[derive(Clone, Copy)]
pub struct MaskWriter<'a> {
    bitmap: &'a Bitmap,
    range: u8,
}

impl<'a> MaskWriter<'a> {
    pub fn new(bitmap: &'a Bitmap) -> Result<Self> {
        let range = bitmap
            .format()
            .mask_range()
            .ok_or(Error::UnsupportedFormat { format: bitmap.format(), role: "mask" })?;
        Ok(MaskWriter { bitmap, range })
    }

    /// Largest storable value (255 for Gray8, 1 for Binary).
    #[inline]
    pub fn range(&self) -> u8 {
        self.range
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.bitmap.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.bitmap.height
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> u8 {
        byte(&self.bitmap.pixels[y * self.bitmap.width + x])
    }

    /// Store `max(current, value)`. Returns `true` if the value went up.
    #[inline]
    pub fn raise(&self, x: usize, y: usize, value: u8) -> bool {
        let value = value.min(self.range);
        self.bitmap.pixels[y * self.bitmap.width + x].fetch_max(value, Ordering::Relaxed) < value
    }

    /// Store `min(current, value)`. Returns `true` if the value went down.
    #[inline]
    pub fn lower(&self, x: usize, y: usize, value: u8) -> bool {
        self.bitmap.pixels[y * self.bitmap.width + x].fetch_min(value, Ordering::Relaxed) > value
    }
}
