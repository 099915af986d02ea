// fill/mod.rs - Multi-seed flood fill task.
//
// Run layout (N workers, seeds distributed round-robin):
//
//   before_processing   validate, write-lock output, read-lock input (CPU)
//
//   process, worker i
//     1. grow seeds i, i+N, i+2N, ...          -> own Partial
//     2. synchronize
//     3. worker 0: merge partials in worker order into the shared border
//        list and bounds; trace contours on the grown mask if enabled
//     4. synchronize
//     5. stamp the morphology kernel on border points i, i+N, ...
//
//   after_processing    adjust bounds for morphology, publish outputs,
//                       release locks
//
// The mask is the only state written by several workers at once, and it is
// only ever combined with atomic max (growth, dilation) or min (erosion).
// Border lists and bounds are not shared during growth; they are reduced
// once, single-threaded, after the first barrier.

mod morphology;
mod region;

pub use morphology::{normalized_radii, Kernel};
pub use region::{mask_value, GrowParams, Partial, RegionGrower};

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bitmap::{with_layout, Bitmap, MaskWriter, PixelReader};
use crate::config::FloodFillConfig;
use crate::contour::{ContourTracer, IntegerContour};
use crate::error::{Error, Result};
use crate::geometry::{IntPoint, IntRect};
use crate::lock::{ContentLock, PixelTransfer};
use crate::task::{Device, DeviceRequirement, Task, WorkerContext};

/// Post-processing applied around border points after growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BorderMorphology {
    #[default]
    None,
    Dilate,
    Erode,
}

/// Merged result of the growth phase.
#[derive(Debug, Default)]
struct Merged {
    border: Vec<IntPoint>,
    bounds: Option<IntRect>,
}

/// State that lives from `before_processing` to `after_processing`.
struct RunState {
    partials: Mutex<Vec<Option<Partial>>>,
    merged: OnceLock<Merged>,
    contours: Mutex<Vec<IntegerContour>>,
    kernel: Option<Kernel>,
}

/// Tolerance-based flood fill from a set of seeds into a mask bitmap.
///
/// Input may be any `PixelFormat`; the output mask must be `Gray8` or
/// `Binary`. The mask covers the input area starting at `mask_pos` and is
/// written in place: values only ever go up during growth, so an existing
/// mask is refined rather than replaced.
pub struct FloodFill {
    input: Option<Arc<Bitmap>>,
    output: Option<Arc<Bitmap>>,
    seeds: Vec<IntPoint>,
    mask_pos: IntPoint,
    tolerance: f32,
    morphology: BorderMorphology,
    hold_radius: f32,
    release_radius: f32,
    compute_contours: bool,
    contour_level: f32,

    lock: ContentLock,
    run: Option<RunState>,

    border: Vec<IntPoint>,
    bounds: Option<IntRect>,
    contours: Vec<IntegerContour>,
}

impl Default for FloodFill {
    fn default() -> Self {
        Self::from_config(&FloodFillConfig::default())
    }
}

impl FloodFill {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(cfg: &FloodFillConfig) -> Self {
        FloodFill {
            input: None,
            output: None,
            seeds: Vec::new(),
            mask_pos: cfg.mask_pos,
            tolerance: cfg.tolerance,
            morphology: cfg.morphology,
            hold_radius: cfg.hold_radius,
            release_radius: cfg.release_radius,
            compute_contours: cfg.compute_contours,
            contour_level: cfg.contour_level,
            lock: ContentLock::new(),
            run: None,
            border: Vec::new(),
            bounds: None,
            contours: Vec::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------

    pub fn set_input(&mut self, input: Arc<Bitmap>) {
        self.input = Some(input);
    }

    pub fn set_output(&mut self, output: Arc<Bitmap>) {
        self.output = Some(output);
    }

    /// Seeds in input coordinates.
    pub fn set_seeds(&mut self, seeds: &[IntPoint]) {
        self.seeds = seeds.to_vec();
    }

    /// Seeds as a flat `[x0, y0, x1, y1, ...]` array.
    pub fn set_seeds_xy(&mut self, xy: &[i32]) -> Result<()> {
        if xy.len() % 2 != 0 {
            return Err(Error::InvalidConfig(format!(
                "seed coordinate array has odd length {}",
                xy.len()
            )));
        }
        self.seeds = xy.chunks_exact(2).map(|c| IntPoint::new(c[0], c[1])).collect();
        Ok(())
    }

    /// Position of the mask's (0, 0) in input coordinates.
    pub fn set_mask_pos(&mut self, pos: IntPoint) {
        self.mask_pos = pos;
    }

    /// Largest per-channel deviation from the seed value, normalized units.
    pub fn set_tolerance(&mut self, tolerance: f32) {
        self.tolerance = tolerance;
    }

    /// Border post-processing. Radii are normalized at run time:
    /// `hold >= 0`, `release >= hold`.
    pub fn set_border_postprocessing(&mut self, mode: BorderMorphology, hold_radius: f32, release_radius: f32) {
        self.morphology = mode;
        self.hold_radius = hold_radius;
        self.release_radius = release_radius;
    }

    pub fn set_compute_contours(&mut self, enabled: bool) {
        self.compute_contours = enabled;
    }

    /// Mask level in [0, 1) above which a pixel is inside a contour.
    pub fn set_contour_level(&mut self, level: f32) {
        self.contour_level = level;
    }

    pub fn input(&self) -> Option<&Arc<Bitmap>> {
        self.input.as_ref()
    }

    pub fn output(&self) -> Option<&Arc<Bitmap>> {
        self.output.as_ref()
    }

    pub fn seeds(&self) -> &[IntPoint] {
        &self.seeds
    }

    pub fn mask_pos(&self) -> IntPoint {
        self.mask_pos
    }

    pub fn tolerance(&self) -> f32 {
        self.tolerance
    }

    pub fn morphology(&self) -> BorderMorphology {
        self.morphology
    }

    pub fn compute_contours(&self) -> bool {
        self.compute_contours
    }

    // -----------------------------------------------------------------------
    // Outputs
    // -----------------------------------------------------------------------

    /// Bounding box of affected mask pixels, morphology included. `None` if
    /// nothing was grown.
    pub fn bounds(&self) -> Option<IntRect> {
        self.bounds
    }

    /// Border points of the last run, mask coordinates, in worker order.
    pub fn border(&self) -> &[IntPoint] {
        &self.border
    }

    pub fn contour_count(&self) -> usize {
        self.contours.len()
    }

    pub fn contour(&self, index: usize) -> Result<&IntegerContour> {
        self.contours
            .get(index)
            .ok_or(Error::BadContourIndex { index, count: self.contours.len() })
    }

    pub fn contours(&self) -> &[IntegerContour] {
        &self.contours
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn validate(&self) -> Result<(&Arc<Bitmap>, &Arc<Bitmap>)> {
        let input = self.input.as_ref().ok_or(Error::MissingResource { what: "input" })?;
        let output = self.output.as_ref().ok_or(Error::MissingResource { what: "output" })?;
        if input.id() == output.id() {
            return Err(Error::InvalidConfig("input and output must be different bitmaps".into()));
        }
        if output.format().mask_range().is_none() {
            return Err(Error::UnsupportedFormat { format: output.format(), role: "flood fill mask" });
        }
        if input.width() == 0 || input.height() == 0 || output.width() == 0 || output.height() == 0 {
            return Err(Error::SizeMismatch {
                what: "flood fill bitmaps",
                detail: "input and mask must not be empty".into(),
            });
        }
        let p = self.mask_pos;
        let fits = p.x >= 0
            && p.y >= 0
            && p.x as usize + output.width() <= input.width()
            && p.y as usize + output.height() <= input.height();
        if !fits {
            return Err(Error::SizeMismatch {
                what: "mask",
                detail: format!(
                    "{}x{} mask at ({}, {}) exceeds {}x{} input",
                    output.width(),
                    output.height(),
                    p.x,
                    p.y,
                    input.width(),
                    input.height()
                ),
            });
        }
        if self.seeds.is_empty() {
            return Err(Error::NoSeeds);
        }
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            return Err(Error::InvalidConfig(format!("tolerance must be non-negative, got {}", self.tolerance)));
        }
        if !self.hold_radius.is_finite() || !self.release_radius.is_finite() {
            return Err(Error::InvalidConfig(format!(
                "border radii must be finite, got hold {} and release {}",
                self.hold_radius, self.release_radius
            )));
        }
        if self.compute_contours && !(0.0..1.0).contains(&self.contour_level) {
            return Err(Error::InvalidConfig(format!("contour level must be in [0, 1), got {}", self.contour_level)));
        }
        Ok((input, output))
    }

    /// Mask grid in mask coordinates.
    fn mask_rect(&self, mask: &Bitmap) -> IntRect {
        IntRect::of_size(mask.width(), mask.height())
    }

    /// Mask grid in input coordinates.
    fn mask_area(&self, mask: &Bitmap) -> IntRect {
        let p = self.mask_pos;
        IntRect::new(p.x, p.y, p.x + mask.width() as i32 - 1, p.y + mask.height() as i32 - 1)
    }

    /// Bounds after the morphology kernel has been stamped on the border.
    fn adjusted_bounds(&self, bounds: Option<IntRect>, mask: &Bitmap) -> Option<IntRect> {
        let bounds = bounds?;
        let (hold, release) = normalized_radii(self.hold_radius, self.release_radius);
        match self.morphology {
            BorderMorphology::None => Some(bounds),
            BorderMorphology::Dilate => bounds
                .grown((hold + release).ceil() as i32)
                .and_then(|r| r.limited(&self.mask_rect(mask))),
            BorderMorphology::Erode => bounds.grown(-(hold.floor() as i32)),
        }
    }

    /// Grow this worker's seeds.
    fn grow_seeds(&self, ctx: &WorkerContext<'_>, input: &Bitmap, params: &GrowParams<'_>) -> Result<Partial> {
        let mut partial = Partial::default();
        let aborted = || ctx.is_aborted();
        with_layout!(input.format(), L => {
            let reader = PixelReader::<L>::new(input)?;
            let mut grower = RegionGrower::new(input.width(), input.height());
            for &seed in self.seeds.iter().skip(ctx.index()).step_by(ctx.worker_count()) {
                if !grower.grow(&reader, params, seed, &mut partial, &aborted) {
                    break;
                }
            }
        });
        Ok(partial)
    }
}

impl Task for FloodFill {
    fn before_processing(
        &mut self,
        workers: usize,
        _device: Device,
        gpu: Option<Arc<dyn PixelTransfer>>,
    ) -> Result<()> {
        self.border.clear();
        self.bounds = None;
        self.contours.clear();

        let (input, output) = self.validate()?;
        let (input, output) = (Arc::clone(input), Arc::clone(output));
        let range = output.format().mask_range().unwrap_or(u8::MAX);
        let max_reach = output.width().max(output.height()) as i32;
        let kernel = Kernel::new(self.morphology, self.hold_radius, self.release_radius, range, max_reach);

        self.lock.set_transfer(gpu);
        // Fails only on conflicts or missing transfers; nothing to undo
        // except what lock_all already rolled back.
        self.lock.lock_all(&[&input], &[&output], Device::Cpu)?;

        self.run = Some(RunState {
            partials: Mutex::new(vec![None; workers]),
            merged: OnceLock::new(),
            contours: Mutex::new(Vec::new()),
            kernel,
        });
        debug!(
            workers,
            seeds = self.seeds.len(),
            input = %input.id(),
            output = %output.id(),
            tolerance = self.tolerance,
            "flood fill prepared"
        );
        Ok(())
    }

    fn process(&self, ctx: &WorkerContext<'_>) -> Result<()> {
        let run = self.run.as_ref().ok_or(Error::NotPrepared("flood fill run state"))?;
        let input = self.input.as_deref().ok_or(Error::MissingResource { what: "input" })?;
        let output = self.output.as_deref().ok_or(Error::MissingResource { what: "output" })?;
        let mask = MaskWriter::new(output)?;
        let params = GrowParams {
            mask,
            mask_pos: self.mask_pos,
            mask_rect: self.mask_area(output),
            tolerance: self.tolerance,
        };

        let partial = self.grow_seeds(ctx, input, &params)?;
        run.partials.lock()[ctx.index()] = Some(partial);

        ctx.synchronize()?;

        if ctx.is_managing() {
            let mut merged = Partial::default();
            for p in run.partials.lock().iter_mut().filter_map(Option::take) {
                merged.merge(p);
            }
            if self.compute_contours && !ctx.is_aborted() {
                let mut tracer = ContourTracer::new(output, self.contour_level)?;
                *run.contours.lock() = tracer.trace_all(&merged.border, || ctx.is_aborted())?;
            }
            // Set once per run; a second set cannot happen.
            let _ = run.merged.set(Merged { border: merged.border, bounds: merged.bounds });
        }

        ctx.synchronize()?;

        if let Some(kernel) = &run.kernel {
            let merged = run.merged.get().ok_or(Error::NotPrepared("merged border"))?;
            for &p in merged.border.iter().skip(ctx.index()).step_by(ctx.worker_count()) {
                if ctx.is_aborted() {
                    break;
                }
                kernel.apply(&mask, p);
            }
        }
        Ok(())
    }

    fn after_processing(&mut self, _workers: usize, _device: Device, aborted: bool) -> Result<()> {
        self.lock.unlock_all();
        let Some(run) = self.run.take() else {
            return Ok(());
        };
        if let Some(merged) = run.merged.into_inner() {
            self.bounds = match self.output.as_deref() {
                Some(mask) => self.adjusted_bounds(merged.bounds, mask),
                None => merged.bounds,
            };
            self.border = merged.border;
        }
        self.contours = run.contours.into_inner();
        debug!(
            aborted,
            border = self.border.len(),
            contours = self.contours.len(),
            bounds = ?self.bounds,
            "flood fill finished"
        );
        Ok(())
    }

    fn max_workers(&self) -> usize {
        self.seeds.len().max(1)
    }

    fn device_requirement(&self) -> DeviceRequirement {
        DeviceRequirement::CpuOnly
    }
}
