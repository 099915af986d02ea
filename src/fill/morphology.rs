// fill/morphology.rs - Circular dilate / erode kernel stamped at border points.
//
// Profile of the kernel as a function of distance d from the border point:
//
//   value
//   range ┤━━━━━━━━━━┓
//         │          ┃╲
//         │          ┃  ╲            dilate: max(mask, value)
//         │          ┃    ╲          erode:  min(mask, range - value)
//       0 ┤──────────┸──────╲────── d
//         0         hold   release
//
// Inside `hold` the kernel is flat; between `hold` and `release` it falls
// off linearly. The offsets and values are computed once per run.

use crate::bitmap::MaskWriter;
use crate::geometry::IntPoint;

use super::BorderMorphology;

/// `(hold, release)` with `0 <= hold <= release`.
pub fn normalized_radii(hold: f32, release: f32) -> (f32, f32) {
    let hold = hold.max(0.0);
    (hold, release.max(hold))
}

/// Precomputed kernel for one run.
#[derive(Debug, Clone)]
pub struct Kernel {
    mode: BorderMorphology,
    /// `(dx, dy, value)`; offsets the kernel does not affect are omitted.
    taps: Vec<(i32, i32, u8)>,
}

impl Kernel {
    /// `None` for `BorderMorphology::None`.
    ///
    /// Offsets are limited to `max_reach` on each axis; a mask of that size
    /// cannot be touched any further out. Radii must be finite.
    pub fn new(mode: BorderMorphology, hold: f32, release: f32, range: u8, max_reach: i32) -> Option<Self> {
        if mode == BorderMorphology::None {
            return None;
        }
        let (hold, release) = normalized_radii(hold, release);
        let reach = ((hold + release).ceil() as i32).min(max_reach.max(0));
        let val = range as f32;
        let mut taps = Vec::new();

        for dy in -reach..=reach {
            for dx in -reach..=reach {
                let d2 = (dx * dx + dy * dy) as f32;
                let value = if d2 < hold * hold {
                    match mode {
                        BorderMorphology::Erode => 0.0,
                        _ => val,
                    }
                } else if d2 < release * release {
                    let t = (d2.sqrt() - hold) / (release - hold);
                    match mode {
                        BorderMorphology::Erode => (val * t).round(),
                        _ => (val * (1.0 - t)).round(),
                    }
                } else {
                    continue;
                };
                let value = value.clamp(0.0, val) as u8;
                // max with 0 and min with range change nothing.
                let useful = match mode {
                    BorderMorphology::Erode => value < range,
                    _ => value > 0,
                };
                if useful {
                    taps.push((dx, dy, value));
                }
            }
        }
        Some(Kernel { mode, taps })
    }

    pub fn mode(&self) -> BorderMorphology {
        self.mode
    }

    /// Number of mask pixels one stamp may touch.
    pub fn tap_count(&self) -> usize {
        self.taps.len()
    }

    /// Stamp the kernel centred on `p` (mask coordinates), clipped to the
    /// mask.
    pub fn apply(&self, mask: &MaskWriter<'_>, p: IntPoint) {
        let (w, h) = (mask.width() as i32, mask.height() as i32);
        for &(dx, dy, value) in &self.taps {
            let (x, y) = (p.x + dx, p.y + dy);
            if x < 0 || y < 0 || x >= w || y >= h {
                continue;
            }
            match self.mode {
                BorderMorphology::Erode => {
                    mask.lower(x as usize, y as usize, value);
                }
                _ => {
                    mask.raise(x as usize, y as usize, value);
                }
            }
        }
    }
}
