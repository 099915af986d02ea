// geometry.rs - Integer points and rectangles.
//
// Rectangles are inclusive on both corners: `IntRect { x0: 2, x1: 4, .. }`
// covers columns 2, 3 and 4. This matches how region bounds are built: the
// rectangle is grown point by point from accepted pixels, so an inclusive
// representation never needs a "+1".

use serde::{Deserialize, Serialize};

/// An integer 2D point. `x` is the column, `y` the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct IntPoint {
    pub x: i32,
    pub y: i32,
}

impl IntPoint {
    #[inline]
    pub const fn new(x: i32, y: i32) -> Self {
        IntPoint { x, y }
    }

    #[inline]
    pub fn offset(self, dx: i32, dy: i32) -> Self {
        IntPoint { x: self.x + dx, y: self.y + dy }
    }

    /// Chebyshev distance (max of |dx|, |dy|).
    #[inline]
    pub fn chebyshev(self, other: IntPoint) -> i32 {
        (self.x - other.x).abs().max((self.y - other.y).abs())
    }

    /// Euclidean distance.
    #[inline]
    pub fn distance(self, other: IntPoint) -> f32 {
        let dx = (self.x - other.x) as f32;
        let dy = (self.y - other.y) as f32;
        (dx * dx + dy * dy).sqrt()
    }
}

impl std::ops::Sub for IntPoint {
    type Output = IntPoint;

    #[inline]
    fn sub(self, rhs: IntPoint) -> IntPoint {
        IntPoint { x: self.x - rhs.x, y: self.y - rhs.y }
    }
}

impl std::ops::Add for IntPoint {
    type Output = IntPoint;

    #[inline]
    fn add(self, rhs: IntPoint) -> IntPoint {
        IntPoint { x: self.x + rhs.x, y: self.y + rhs.y }
    }
}

impl From<(i32, i32)> for IntPoint {
    fn from((x, y): (i32, i32)) -> Self {
        IntPoint { x, y }
    }
}

/// Axis-aligned integer rectangle, inclusive corners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntRect {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

impl IntRect {
    pub const fn new(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        IntRect { x0, y0, x1, y1 }
    }

    /// A rectangle covering exactly one point.
    pub const fn point(p: IntPoint) -> Self {
        IntRect { x0: p.x, y0: p.y, x1: p.x, y1: p.y }
    }

    /// Rectangle covering a `width x height` grid anchored at (0, 0).
    ///
    /// # Panics
    /// Panics if either dimension is zero.
    pub fn of_size(width: usize, height: usize) -> Self {
        assert!(width > 0 && height > 0, "empty grid {width}x{height} has no rectangle");
        IntRect { x0: 0, y0: 0, x1: width as i32 - 1, y1: height as i32 - 1 }
    }

    #[inline]
    pub fn width(&self) -> i32 {
        self.x1 - self.x0 + 1
    }

    #[inline]
    pub fn height(&self) -> i32 {
        self.y1 - self.y0 + 1
    }

    #[inline]
    pub fn contains(&self, p: IntPoint) -> bool {
        p.x >= self.x0 && p.x <= self.x1 && p.y >= self.y0 && p.y <= self.y1
    }

    /// Extend to cover `p`.
    #[inline]
    pub fn include(&mut self, p: IntPoint) {
        self.x0 = self.x0.min(p.x);
        self.y0 = self.y0.min(p.y);
        self.x1 = self.x1.max(p.x);
        self.y1 = self.y1.max(p.y);
    }

    /// Smallest rectangle covering both.
    pub fn union(&self, other: &IntRect) -> IntRect {
        IntRect {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    /// Move every side outwards by `r` (inwards when `r < 0`).
    ///
    /// Returns `None` when shrinking leaves nothing.
    pub fn grown(&self, r: i32) -> Option<IntRect> {
        let out = IntRect {
            x0: self.x0 - r,
            y0: self.y0 - r,
            x1: self.x1 + r,
            y1: self.y1 + r,
        };
        (out.x0 <= out.x1 && out.y0 <= out.y1).then_some(out)
    }

    /// Clip to `frame`. Returns `None` if the two do not intersect.
    pub fn limited(&self, frame: &IntRect) -> Option<IntRect> {
        let out = IntRect {
            x0: self.x0.max(frame.x0),
            y0: self.y0.max(frame.y0),
            x1: self.x1.min(frame.x1),
            y1: self.y1.min(frame.y1),
        };
        (out.x0 <= out.x1 && out.y0 <= out.y1).then_some(out)
    }
}

/// Fold `p` into an optional rectangle, starting one if there is none yet.
#[inline]
pub fn include_point(bounds: &mut Option<IntRect>, p: IntPoint) {
    match bounds {
        Some(r) => r.include(p),
        None => *bounds = Some(IntRect::point(p)),
    }
}

/// Union of two optional rectangles.
pub fn merge_bounds(a: Option<IntRect>, b: Option<IntRect>) -> Option<IntRect> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.union(&b)),
        (a, None) => a,
        (None, b) => b,
    }
}
