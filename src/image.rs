// image.rs - Single-owner typed pixel buffer for building inputs and
// inspecting masks.
//
// Tasks never share an `Image<T>`; they share `Bitmap`s. Images cross over
// through `Bitmap::from_image` (packs rows, drops padding) and
// `Bitmap::to_image` (unpacks into a tightly packed image).
//
// Rows may be padded (`stride > width`), as when wrapping a buffer that
// came from elsewhere:
//
//   width 4, stride 5     ■ ■ ■ ■ · | ■ ■ ■ ■ · | ■ ■ ■ ■ ·

use crate::bitmap::PixelFormat;

/// Element type of an `Image`, with its single-channel bitmap encoding.
pub trait Pixel: Copy + Default + Send + Sync + PartialOrd + 'static {
    /// Format of a bitmap packed from `Image<Self>`.
    const FORMAT: PixelFormat;

    fn unpacks_from(format: PixelFormat) -> bool {
        format == Self::FORMAT
    }

    /// Append the encoded bytes of `self`.
    fn pack(self, out: &mut Vec<u8>);

    /// Decode from `FORMAT.bytes_per_pixel()` bytes.
    fn unpack(bytes: &[u8]) -> Self;
}

impl Pixel for u8 {
    const FORMAT: PixelFormat = PixelFormat::Gray8;

    fn unpacks_from(format: PixelFormat) -> bool {
        // Binary masks are one byte per pixel too.
        matches!(format, PixelFormat::Gray8 | PixelFormat::Binary)
    }

    #[inline]
    fn pack(self, out: &mut Vec<u8>) {
        out.push(self);
    }

    #[inline]
    fn unpack(bytes: &[u8]) -> Self {
        bytes[0]
    }
}

impl Pixel for f32 {
    const FORMAT: PixelFormat = PixelFormat::GrayF32;

    #[inline]
    fn pack(self, out: &mut Vec<u8>) {
        out.extend_from_slice(bytemuck::bytes_of(&self));
    }

    #[inline]
    fn unpack(bytes: &[u8]) -> Self {
        bytemuck::pod_read_unaligned(&bytes[..4])
    }
}

/// Row-major 2D buffer of `T`.
#[derive(Debug, Clone, PartialEq)]
pub struct Image<T: Pixel> {
    data: Vec<T>,
    width: usize,
    height: usize,
    /// Elements per row, padding included.
    stride: usize,
}

impl<T: Pixel> Image<T> {
    /// `width x height` pixels of `T::default()`.
    pub fn new(width: usize, height: usize) -> Self {
        Self::filled(width, height, T::default())
    }

    pub fn filled(width: usize, height: usize, value: T) -> Self {
        Image { data: vec![value; width * height], width, height, stride: width }
    }

    /// Wrap tightly packed row-major pixels.
    ///
    /// # Panics
    /// Panics if `data.len() != width * height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<T>) -> Self {
        Self::from_vec_with_stride(width, height, width, data)
    }

    /// Wrap row-major pixels whose rows are `stride` elements apart.
    ///
    /// # Panics
    /// Panics if `stride < width` or `data.len() != height * stride`.
    pub fn from_vec_with_stride(width: usize, height: usize, stride: usize, data: Vec<T>) -> Self {
        assert!(stride >= width, "stride {stride} shorter than width {width}");
        assert_eq!(data.len(), height * stride, "{width}x{height} image with stride {stride} needs {} elements", height * stride);
        Image { data, width, height, stride }
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
    pub fn stride(&self) -> usize {
        self.stride
    }

    #[inline]
    fn offset(&self, x: usize, y: usize) -> usize {
        assert!(
            x < self.width && y < self.height,
            "pixel ({x},{y}) out of bounds for {}x{} image",
            self.width,
            self.height
        );
        y * self.stride + x
    }

    /// # Panics
    /// Panics if `(x, y)` is outside the image.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> T {
        self.data[self.offset(x, y)]
    }

    /// # Panics
    /// Panics if `(x, y)` is outside the image.
    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: T) {
        let i = self.offset(x, y);
        self.data[i] = value;
    }

    /// Set every pixel of `[x, x + w) x [y, y + h)` to `value`.
    ///
    /// # Panics
    /// Panics if the block does not fit in the image.
    pub fn fill_rect(&mut self, x: usize, y: usize, w: usize, h: usize, value: T) {
        assert!(
            x + w <= self.width && y + h <= self.height,
            "block {w}x{h} at ({x},{y}) does not fit in {}x{} image",
            self.width,
            self.height
        );
        for row in y..y + h {
            let start = row * self.stride + x;
            self.data[start..start + w].fill(value);
        }
    }

    /// Pixels of row `y`, without padding.
    pub fn row(&self, y: usize) -> &[T] {
        assert!(y < self.height, "row {y} out of bounds for height {}", self.height);
        let start = y * self.stride;
        &self.data[start..start + self.width]
    }

    /// `(x, y, value)` for every pixel, row by row.
    pub fn pixels(&self) -> impl Iterator<Item = (usize, usize, T)> + '_ {
        (0..self.height).flat_map(move |y| self.row(y).iter().enumerate().map(move |(x, &v)| (x, y, v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_default_filled() {
        let img: Image<u8> = Image::new(10, 5);
        assert_eq!((img.width(), img.height(), img.stride()), (10, 5, 10));
        assert!(img.pixels().all(|(_, _, v)| v == 0));
        assert_eq!(img.pixels().count(), 50);
    }

    #[test]
    fn test_from_vec_is_row_major() {
        let img = Image::from_vec(4, 3, (0..12u8).collect());
        assert_eq!(img.get(3, 0), 3);
        assert_eq!(img.get(0, 1), 4);
        assert_eq!(img.get(3, 2), 11);
    }

    #[test]
    fn test_fill_rect_and_set() {
        let mut img: Image<u8> = Image::new(6, 4);
        img.fill_rect(1, 1, 3, 2, 9);
        img.set(0, 0, 1);
        assert_eq!(img.pixels().filter(|&(_, _, v)| v == 9).count(), 6);
        assert_eq!(img.get(3, 2), 9);
        assert_eq!(img.get(4, 2), 0);
        assert_eq!(img.get(0, 0), 1);
    }

    #[test]
    fn test_padding_is_invisible() {
        let mut img = Image::from_vec_with_stride(3, 2, 4, vec![1u8, 2, 3, 99, 4, 5, 6, 99]);
        assert_eq!(img.row(1), &[4, 5, 6]);
        img.fill_rect(0, 0, 3, 2, 0);
        assert!(img.pixels().all(|(_, _, v)| v == 0));
    }

    #[test]
    fn test_pixel_codecs() {
        let mut bytes = Vec::new();
        0.25f32.pack(&mut bytes);
        assert_eq!(f32::unpack(&bytes), 0.25);
        assert!(u8::unpacks_from(PixelFormat::Binary));
        assert!(!u8::unpacks_from(PixelFormat::Rgb8));
        assert!(!f32::unpacks_from(PixelFormat::Gray8));
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_get_out_of_bounds() {
        let img: Image<u8> = Image::new(4, 4);
        img.get(4, 0);
    }

    #[test]
    #[should_panic(expected = "shorter than width")]
    fn test_stride_shorter_than_width() {
        Image::from_vec_with_stride(10, 1, 8, vec![0u8; 8]);
    }
}
