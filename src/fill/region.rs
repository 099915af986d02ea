// fill/region.rs - Per-seed breadth-first region growing.
//
// Each seed grows independently: a pixel joins the seed's region when it is
// 4-connected to it through accepted pixels and every channel is within
// `tolerance` of the seed pixel. Which pixels were accepted is tracked in a
// per-worker visited map, not read back from the mask, so the region of a
// seed does not depend on what other seeds (or previous runs) wrote.
//
// Mask writes are `MaskWriter::raise` (atomic max). Overlapping regions from
// different workers therefore settle on the highest value regardless of
// order.

use std::collections::VecDeque;

use crate::bitmap::{Color, MaskWriter, PixelLayout, PixelReader};
use crate::geometry::{include_point, IntPoint, IntRect};

/// 4-neighbourhood offsets.
const NEIGHBOURS: [(i32, i32); 4] = [(1, 0), (-1, 0), (0, 1), (0, -1)];

/// Border points and bounds produced by one worker.
#[derive(Debug, Clone, Default)]
pub struct Partial {
    /// Border pixels, mask coordinates.
    pub border: Vec<IntPoint>,
    pub bounds: Option<IntRect>,
}

impl Partial {
    /// Append `other` (used by the reduction, in worker order).
    pub fn merge(&mut self, other: Partial) {
        self.border.extend(other.border);
        self.bounds = crate::geometry::merge_bounds(self.bounds, other.bounds);
    }
}

/// Parameters shared by all seeds of a run.
#[derive(Clone, Copy)]
pub struct GrowParams<'a> {
    pub mask: MaskWriter<'a>,
    /// Mask (0, 0) in input coordinates.
    pub mask_pos: IntPoint,
    /// Mask area in input coordinates. Lies inside the input.
    pub mask_rect: IntRect,
    pub tolerance: f32,
}

/// Mask value of a pixel accepted with channel deviation `diff`.
///
/// Full `range` at zero deviation (or zero tolerance), falling linearly
/// towards 1 as `diff` approaches `tolerance`. Never 0 for an accepted pixel.
#[inline]
pub fn mask_value(range: u8, tolerance: f32, diff: f32) -> u8 {
    if tolerance <= 0.0 || diff <= 0.0 {
        return range;
    }
    let scaled = (range as f32 * (tolerance - diff) / tolerance).floor() as i32 + 1;
    scaled.clamp(1, range as i32) as u8
}

/// Reusable per-worker growing state.
pub struct RegionGrower {
    width: usize,
    /// `visited[i] == stamp` marks pixel i accepted for the current seed.
    visited: Vec<u32>,
    stamp: u32,
    queue: VecDeque<IntPoint>,
}

impl RegionGrower {
    /// Grower for an input of `width x height` pixels.
    pub fn new(width: usize, height: usize) -> Self {
        RegionGrower { width, visited: vec![0; width * height], stamp: 0, queue: VecDeque::new() }
    }

    fn next_stamp(&mut self) {
        if self.stamp == u32::MAX {
            self.visited.fill(0);
            self.stamp = 0;
        }
        self.stamp += 1;
    }

    #[inline]
    fn index(&self, p: IntPoint) -> usize {
        p.y as usize * self.width + p.x as usize
    }

    #[inline]
    fn visit(&mut self, p: IntPoint) -> bool {
        let i = self.index(p);
        if self.visited[i] == self.stamp {
            return false;
        }
        self.visited[i] = self.stamp;
        true
    }

    /// Grow the region of `seed` (input coordinates) into the mask.
    ///
    /// Seeds outside the mask area are skipped. Border pixels and bounds
    /// are appended to `out` in mask coordinates. Returns `false` if
    /// `aborted` fired before the region was complete.
    pub fn grow<L: PixelLayout>(
        &mut self,
        input: &PixelReader<'_, L>,
        params: &GrowParams<'_>,
        seed: IntPoint,
        out: &mut Partial,
        aborted: &dyn Fn() -> bool,
    ) -> bool {
        if !params.mask_rect.contains(seed) {
            return true;
        }
        self.next_stamp();
        self.queue.clear();

        let range = params.mask.range();
        let reference: Color = input.at(seed.x as usize, seed.y as usize);
        let to_mask = |p: IntPoint| p - params.mask_pos;

        self.visit(seed);
        let m = to_mask(seed);
        params.mask.raise(m.x as usize, m.y as usize, range);
        self.queue.push_back(seed);

        while let Some(p) = self.queue.pop_front() {
            if aborted() {
                self.queue.clear();
                return false;
            }
            let mut on_border = false;
            for (dx, dy) in NEIGHBOURS {
                let n = p.offset(dx, dy);
                if !params.mask_rect.contains(n) {
                    on_border = true;
                    continue;
                }
                if self.visited[self.index(n)] == self.stamp {
                    continue;
                }
                let diff = input.at(n.x as usize, n.y as usize).max_abs_diff(&reference);
                if diff.is_nan() || diff > params.tolerance {
                    on_border = true;
                    continue;
                }
                self.visit(n);
                let m = to_mask(n);
                params.mask.raise(m.x as usize, m.y as usize, mask_value(range, params.tolerance, diff));
                self.queue.push_back(n);
            }
            if on_border {
                let m = to_mask(p);
                out.border.push(m);
                include_point(&mut out.bounds, m);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::{Bitmap, Gray8, GrayF32, PixelFormat};
    use crate::image::Image;

    fn params(mask: &Bitmap, tolerance: f32) -> GrowParams<'_> {
        GrowParams {
            mask: MaskWriter::new(mask).unwrap(),
            mask_pos: IntPoint::new(0, 0),
            mask_rect: IntRect::of_size(mask.width(), mask.height()),
            tolerance,
        }
    }

    #[test]
    fn test_mask_value_encoding() {
        assert_eq!(mask_value(255, 0.0, 0.0), 255);
        assert_eq!(mask_value(255, 0.5, 0.0), 255);
        // Half the tolerance used: floor(255 * 0.5) + 1.
        assert_eq!(mask_value(255, 0.5, 0.25), 128);
        // At the tolerance edge the value bottoms out at 1.
        assert_eq!(mask_value(255, 0.5, 0.5), 1);
        assert_eq!(mask_value(1, 0.5, 0.25), 1);
    }

    #[test]
    fn test_grow_uniform_block() {
        let mut img = Image::<u8>::new(6, 5);
        img.fill_rect(1, 1, 3, 2, 200);
        let input = Bitmap::from_image(&img);
        let mask = Bitmap::new(PixelFormat::Gray8, 6, 5);
        let reader = PixelReader::<Gray8>::new(&input).unwrap();

        let mut grower = RegionGrower::new(6, 5);
        let mut out = Partial::default();
        assert!(grower.grow(&reader, &params(&mask, 0.0), IntPoint::new(2, 1), &mut out, &|| false));

        assert_eq!(mask.count_nonzero(), 6);
        // Every pixel of a 3x2 block touches a rejected neighbour.
        assert_eq!(out.border.len(), 6);
        assert_eq!(out.bounds, Some(IntRect::new(1, 1, 3, 2)));
    }

    #[test]
    fn test_nan_pixels_rejected() {
        let mut img = Image::<f32>::new(3, 1);
        img.set(0, 0, 0.5);
        img.set(1, 0, f32::NAN);
        img.set(2, 0, 0.5);
        let input = Bitmap::from_image(&img);
        let mask = Bitmap::new(PixelFormat::Gray8, 3, 1);
        let reader = PixelReader::<GrayF32>::new(&input).unwrap();

        let mut grower = RegionGrower::new(3, 1);
        let mut out = Partial::default();
        grower.grow(&reader, &params(&mask, 0.5), IntPoint::new(0, 0), &mut out, &|| false);
        let img = mask.to_image::<u8>().unwrap();
        assert_eq!([img.get(0, 0), img.get(1, 0), img.get(2, 0)], [255, 0, 0]);
        assert_eq!(out.border, vec![IntPoint::new(0, 0)]);
    }

    #[test]
    fn test_seed_outside_mask_skipped() {
        let input = Bitmap::new(PixelFormat::Gray8, 4, 4);
        let mask = Bitmap::new(PixelFormat::Gray8, 2, 2);
        let reader = PixelReader::<Gray8>::new(&input).unwrap();
        let p = GrowParams {
            mask: MaskWriter::new(&mask).unwrap(),
            mask_pos: IntPoint::new(2, 2),
            mask_rect: IntRect::new(2, 2, 3, 3),
            tolerance: 0.0,
        };
        let mut grower = RegionGrower::new(4, 4);
        let mut out = Partial::default();
        grower.grow(&reader, &p, IntPoint::new(0, 0), &mut out, &|| false);
        assert_eq!(mask.count_nonzero(), 0);
        assert!(out.bounds.is_none());

        grower.grow(&reader, &p, IntPoint::new(3, 3), &mut out, &|| false);
        assert_eq!(mask.count_nonzero(), 4);
        assert_eq!(out.bounds, Some(IntRect::new(0, 0, 1, 1)));
    }

    #[test]
    fn test_abort_stops_growth() {
        let input = Bitmap::new(PixelFormat::Gray8, 8, 8);
        let mask = Bitmap::new(PixelFormat::Gray8, 8, 8);
        let reader = PixelReader::<Gray8>::new(&input).unwrap();
        let mut grower = RegionGrower::new(8, 8);
        let mut out = Partial::default();
        let done = grower.grow(&reader, &params(&mask, 0.0), IntPoint::new(0, 0), &mut out, &|| true);
        assert!(!done);
        assert!(mask.count_nonzero() < 64);
    }

    #[test]
    fn test_stamp_wrap_clears_visited() {
        let mut grower = RegionGrower::new(2, 1);
        grower.stamp = u32::MAX;
        grower.visited[0] = 1;
        grower.next_stamp();
        assert_eq!(grower.stamp, 1);
        assert_eq!(grower.visited, vec![0, 0]);
    }
}
