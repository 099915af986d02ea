// contour.rs - Closed boundary polylines traced on a mask.
//
// Contour points live on the *corner* grid: corner (x, y) is the top-left
// corner of pixel (x, y), so a W×H mask has (W+1)×(H+1) corners. A corner
// is classified by the four pixels around it:
//
//        lt | rt          lt = (x-1, y-1)   rt = (x, y-1)
//       ----+----         lb = (x-1, y  )   rb = (x, y  )
//        lb | rb
//
// each "inside" when it lies in the mask and its value is above the level.
// The walk keeps the inside on its right-hand side (clockwise around filled
// regions, y pointing down) and ends when it is about to repeat its first
// step.
//
// Every step leaves a corner along one grid edge, and each directed boundary
// edge belongs to exactly one contour. The tracer records the directions
// already taken out of every corner; a candidate whose first step is already
// recorded lies on a traced contour and is skipped.

use tracing::debug;

use crate::bitmap::{Bitmap, MaskWriter};
use crate::error::{CornerPattern, Error, Result};
use crate::geometry::{IntPoint, IntRect};
use crate::image::Image;

/// Marker for the two diagonal patterns, resolved from the previous step.
const AMBIGUOUS: (i32, i32) = (i32::MAX, i32::MAX);

/// Step direction per corner pattern, indexed by `CornerPattern::index()`.
/// Entries 0 and 15 are never used: uniform corners are rejected first.
const STEP: [(i32, i32); 16] = [
    (0, 0),    // ....
    (1, 0),    // ...rb
    (0, 1),    // ..lb.
    (1, 0),    // ..lb rb
    (0, -1),   // .rt..
    (0, -1),   // .rt.rb
    AMBIGUOUS, // .rt lb.
    (0, -1),   // .rt lb rb
    (-1, 0),   // lt...
    AMBIGUOUS, // lt..rb
    (0, 1),    // lt.lb.
    (1, 0),    // lt.lb rb
    (-1, 0),   // lt rt..
    (-1, 0),   // lt rt.rb
    (0, 1),    // lt rt lb.
    (0, 0),    // lt rt lb rb
];

/// Bit recorded in the traced-corner map for a step direction.
#[inline]
fn step_bit(d: (i32, i32)) -> u8 {
    match d {
        (1, 0) => 1,
        (0, 1) => 2,
        (-1, 0) => 4,
        _ => 8,
    }
}

// ---------------------------------------------------------------------------
// IntegerContour
// ---------------------------------------------------------------------------

/// A closed polyline on the corner grid. The last point repeats the first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntegerContour {
    points: Vec<IntPoint>,
    length: f32,
}

impl IntegerContour {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    /// Sum of segment lengths.
    pub fn length(&self) -> f32 {
        self.length
    }

    /// Point `index`, wrapping modulo the point count. `None` when empty.
    pub fn point(&self, index: usize) -> Option<IntPoint> {
        if self.points.is_empty() {
            return None;
        }
        Some(self.points[index % self.points.len()])
    }

    pub fn points(&self) -> &[IntPoint] {
        &self.points
    }

    pub fn clear(&mut self) {
        self.points.clear();
        self.length = 0.0;
    }

    /// Smallest rectangle containing every point.
    pub fn bounding_box(&self) -> Option<IntRect> {
        let (first, rest) = self.points.split_first()?;
        let mut r = IntRect::point(*first);
        for &p in rest {
            r.include(p);
        }
        Some(r)
    }

    /// Append `p`, simplifying the tail.
    ///
    /// Once there are more than two points, `p` replaces the last point
    /// instead of being appended when the last point is redundant: `p` lies
    /// on the line through the last two points, or `p` and the last two
    /// points all fit in one pixel neighbourhood. A repeat of the last point
    /// is dropped.
    pub fn add_point(&mut self, p: IntPoint) {
        let n = self.points.len();
        if n > 2 {
            let p1 = self.points[n - 1];
            let p2 = self.points[n - 2];
            if p == p1 {
                return;
            }
            let local = p.chebyshev(p1) <= 1 && p.chebyshev(p2) <= 1;
            let on_line_x = p.x != p1.x && (p1.y - p.y) * (p2.x - p1.x) == (p2.y - p1.y) * (p1.x - p.x);
            let on_line_y = p.y != p1.y && (p1.x - p.x) * (p2.y - p1.y) == (p2.x - p1.x) * (p1.y - p.y);
            if local || on_line_x || on_line_y {
                self.length += p.distance(p2) - p1.distance(p2);
                self.points[n - 1] = p;
                return;
            }
        }
        if let Some(&last) = self.points.last() {
            self.length += p.distance(last);
        }
        self.points.push(p);
    }
}

// ---------------------------------------------------------------------------
// Tracer
// ---------------------------------------------------------------------------

/// Boundary follower over a one-byte mask.
///
/// Keeps a map of the steps taken out of every corner, so each boundary is
/// traced once per tracer no matter how many of its pixels are offered as
/// start candidates.
pub struct ContourTracer<'a> {
    mask: MaskWriter<'a>,
    width: i32,
    height: i32,
    /// Pixel values strictly above this are inside.
    threshold: f32,
    /// `(width + 1) x (height + 1)` corners, `step_bit`s of steps taken.
    traced: Image<u8>,
}

impl<'a> ContourTracer<'a> {
    /// Tracer over `mask` (Gray8 or Binary). A pixel is inside when
    /// `value / range > level`.
    pub fn new(mask: &'a Bitmap, level: f32) -> Result<Self> {
        let writer = MaskWriter::new(mask)?;
        Ok(ContourTracer {
            mask: writer,
            width: mask.width() as i32,
            height: mask.height() as i32,
            threshold: level * writer.range() as f32,
            traced: Image::new(mask.width() + 1, mask.height() + 1),
        })
    }

    #[inline]
    fn in_grid(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && x < self.width && y < self.height
    }

    #[inline]
    fn inside(&self, x: i32, y: i32) -> bool {
        self.in_grid(x, y) && self.mask.get(x as usize, y as usize) as f32 > self.threshold
    }

    fn corner(&self, p: IntPoint) -> CornerPattern {
        CornerPattern {
            lt: self.inside(p.x - 1, p.y - 1),
            rt: self.inside(p.x, p.y - 1),
            lb: self.inside(p.x - 1, p.y),
            rb: self.inside(p.x, p.y),
        }
    }

    /// Whether a walk already left corner `p` in direction `d`.
    fn is_traced(&self, p: IntPoint, d: (i32, i32)) -> bool {
        self.traced.get(p.x as usize, p.y as usize) & step_bit(d) != 0
    }

    fn mark_traced(&mut self, p: IntPoint, d: (i32, i32)) {
        let bits = self.traced.get(p.x as usize, p.y as usize) | step_bit(d);
        self.traced.set(p.x as usize, p.y as usize, bits);
    }

    /// Trace one contour per start candidate in `candidates` (pixel
    /// coordinates, usually the recorded border points) not already on a
    /// traced contour.
    ///
    /// A candidate starts a walk at its top-left corner when its pixel is
    /// inside and at least one of the other three pixels around that corner
    /// is not. On a diagonal corner the walk starts along the top edge of
    /// the candidate. `aborted` is polled between candidates.
    pub fn trace_all(&mut self, candidates: &[IntPoint], aborted: impl Fn() -> bool) -> Result<Vec<IntegerContour>> {
        let mut contours = Vec::new();
        for &p in candidates {
            if aborted() {
                break;
            }
            if !self.in_grid(p.x, p.y) {
                continue;
            }
            let c = self.corner(p);
            if !c.rb || c.is_uniform() {
                continue;
            }
            // With rb inside, the only ambiguous pattern is lt + rb.
            let first = match STEP[c.index()] {
                AMBIGUOUS => (1, 0),
                d => d,
            };
            if self.is_traced(p, first) {
                continue;
            }
            contours.push(self.walk(p, first)?);
        }
        debug!(candidates = candidates.len(), contours = contours.len(), "contours traced");
        Ok(contours)
    }

    /// Walk the boundary through corner `start` until it closes.
    ///
    /// Fails with `BadSeedPoint` when no boundary passes through `start`,
    /// or when `start` is a diagonal corner: with no previous step there is
    /// no way to tell which of its two boundaries is meant.
    pub fn trace_from(&mut self, start: IntPoint) -> Result<IntegerContour> {
        let c = self.corner(start);
        match STEP[c.index()] {
            _ if c.is_uniform() => Err(Error::BadSeedPoint { x: start.x, y: start.y, pattern: c }),
            AMBIGUOUS => Err(Error::BadSeedPoint { x: start.x, y: start.y, pattern: c }),
            first => self.walk(start, first),
        }
    }

    fn walk(&mut self, start: IntPoint, first: (i32, i32)) -> Result<IntegerContour> {
        let mut contour = IntegerContour::new();
        let max_steps = 2 * (self.width as usize + 1) * (self.height as usize + 1) + 1;
        let mut p = start;
        let mut prev: Option<(i32, i32)> = None;

        for step in 0..max_steps {
            let c = self.corner(p);
            if c.is_uniform() {
                return Err(Error::BadSeedPoint { x: p.x, y: p.y, pattern: c });
            }
            let d = match (STEP[c.index()], prev) {
                (AMBIGUOUS, Some((dx, dy))) => (-dy, dx),
                (AMBIGUOUS, None) => first,
                (d, _) => d,
            };
            if step > 0 && p == start && d == first {
                contour.add_point(start);
                return Ok(contour);
            }
            contour.add_point(p);
            self.mark_traced(p, d);
            p = p.offset(d.0, d.1);
            prev = Some(d);
        }
        Err(Error::UnclosedContour { x: start.x, y: start.y, steps: max_steps })
    }
}

/// Trace every contour reachable from `candidates` on `mask`.
pub fn trace_contours(mask: &Bitmap, candidates: &[IntPoint], level: f32) -> Result<Vec<IntegerContour>> {
    ContourTracer::new(mask, level)?.trace_all(candidates, || false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_point_rectangle_sequence() {
        // Corner walk around a 3x2 block of pixels at (1, 1).
        let walk = [
            (1, 1), (2, 1), (3, 1), (4, 1), (4, 2), (4, 3), (3, 3), (2, 3), (1, 3), (1, 2), (1, 1),
        ];
        let mut c = IntegerContour::new();
        for (x, y) in walk {
            c.add_point(IntPoint::new(x, y));
        }
        let expect: Vec<IntPoint> = [(1, 1), (2, 1), (4, 1), (4, 3), (1, 3), (1, 1)]
            .into_iter()
            .map(IntPoint::from)
            .collect();
        assert_eq!(c.points(), expect.as_slice());
        assert!((c.length() - 10.0).abs() < 1e-5);
        assert_eq!(c.bounding_box(), Some(IntRect::new(1, 1, 4, 3)));
    }

    #[test]
    fn test_point_wraps() {
        let mut c = IntegerContour::new();
        assert_eq!(c.point(0), None);
        c.add_point(IntPoint::new(0, 0));
        c.add_point(IntPoint::new(1, 0));
        assert_eq!(c.point(2), Some(IntPoint::new(0, 0)));
        assert_eq!(c.point(3), Some(IntPoint::new(1, 0)));
        c.clear();
        assert_eq!(c.point_count(), 0);
        assert_eq!(c.length(), 0.0);
    }

    #[test]
    fn test_repeat_point_dropped() {
        let mut c = IntegerContour::new();
        for (x, y) in [(0, 0), (5, 0), (5, 5), (5, 5)] {
            c.add_point(IntPoint::new(x, y));
        }
        assert_eq!(c.point_count(), 3);
    }

    #[test]
    fn test_square_block() {
        let mut img = Image::<u8>::new(5, 5);
        img.fill_rect(1, 1, 3, 3, 255);
        let mask = Bitmap::from_image(&img);
        let contours = trace_contours(&mask, &[IntPoint::new(1, 1)], 0.0).unwrap();
        assert_eq!(contours.len(), 1);
        assert_eq!(contours[0].bounding_box(), Some(IntRect::new(1, 1, 4, 4)));
        assert!((contours[0].length() - 12.0).abs() < 1e-5);
    }

    #[test]
    fn test_single_pixel_collapses() {
        // Every corner of a lone pixel lies in the neighbourhood of the
        // previous two, so the tail keeps being replaced.
        let mut img = Image::<u8>::new(3, 3);
        img.set(1, 1, 255);
        let mask = Bitmap::from_image(&img);
        let contours = trace_contours(&mask, &[IntPoint::new(1, 1)], 0.0).unwrap();
        assert_eq!(contours.len(), 1);
        let c = &contours[0];
        assert_eq!(c.points().first(), Some(&IntPoint::new(1, 1)));
        assert_eq!(c.points().first(), c.points().last());
    }

    #[test]
    fn test_uniform_start_is_bad_seed() {
        let mask = Bitmap::new(crate::bitmap::PixelFormat::Gray8, 4, 4);
        let mut tracer = ContourTracer::new(&mask, 0.0).unwrap();
        let err = tracer.trace_from(IntPoint::new(2, 2)).unwrap_err();
        assert!(matches!(err, Error::BadSeedPoint { x: 2, y: 2, pattern } if pattern.index() == 0));
    }

    #[test]
    fn test_ambiguous_first_step_is_bad_seed() {
        // Diagonal pair: corner (1, 1) sees lt and rb only.
        let mut img = Image::<u8>::new(2, 2);
        img.set(0, 0, 255);
        img.set(1, 1, 255);
        let mask = Bitmap::from_image(&img);
        let mut tracer = ContourTracer::new(&mask, 0.0).unwrap();
        let err = tracer.trace_from(IntPoint::new(1, 1)).unwrap_err();
        assert!(matches!(err, Error::BadSeedPoint { x: 1, y: 1, pattern } if pattern.index() == 9));
    }

    #[test]
    fn test_ambiguity_resolved_mid_walk() {
        // Same diagonal pair, started from pixel (0, 0): the walk reaches
        // the ambiguous corner with a previous direction and turns.
        let mut img = Image::<u8>::new(2, 2);
        img.set(0, 0, 255);
        img.set(1, 1, 255);
        let mask = Bitmap::from_image(&img);
        let mut tracer = ContourTracer::new(&mask, 0.0).unwrap();
        let c = tracer.trace_from(IntPoint::new(0, 0)).unwrap();
        assert_eq!(c.points().first(), c.points().last());
        assert!(c.points().contains(&IntPoint::new(1, 0)));
        assert!(c.points().iter().all(|p| IntRect::new(0, 0, 1, 1).contains(*p)));
    }

    #[test]
    fn test_level_thresholds_mask() {
        let mut img = Image::<u8>::new(4, 1);
        img.set(1, 0, 100);
        img.set(2, 0, 200);
        let mask = Bitmap::from_image(&img);
        // At level 0.5 (127.5) only pixel 2 is inside.
        let contours = trace_contours(&mask, &[IntPoint::new(1, 0), IntPoint::new(2, 0)], 0.5).unwrap();
        assert_eq!(contours.len(), 1);
        assert_eq!(contours[0].point(0), Some(IntPoint::new(2, 0)));
    }
}
