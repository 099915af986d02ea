// config.rs - TOML configuration for pools and flood-fill tasks.
//
// Every section and field has a default, so an empty file is a valid
// configuration:
//
// [pool]
// workers = 4
//
// [flood_fill]
// tolerance = 0.05
// mask_pos = { x = 0, y = 0 }
// morphology = "dilate"
// hold_radius = 1.5
// release_radius = 3.0
// compute_contours = true
// contour_level = 0.0

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::fill::BorderMorphology;
use crate::geometry::IntPoint;

/// Environment variable naming a config file for `Config::load_or_default`.
pub const CONFIG_ENV: &str = "FLOODMASK_CONFIG";

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub flood_fill: FloodFillConfig,
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!(path = %path.display(), "loaded floodmask configuration");
        Ok(config)
    }

    /// The file named by `FLOODMASK_CONFIG` if it loads, else defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "{CONFIG_ENV} set but file could not be loaded, using defaults"
                ),
            }
        }
        debug!("no config file, using compiled-in defaults");
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.workers == Some(0) {
            return Err(Error::InvalidConfig("pool.workers must be at least 1".into()));
        }
        self.flood_fill.validate()
    }
}

/// Worker pool sizing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Worker count. `None` uses `std::thread::available_parallelism`.
    pub workers: Option<usize>,
}

/// Flood-fill parameters. See `FloodFill` for their meaning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FloodFillConfig {
    /// Largest per-channel deviation from the seed value, in normalized
    /// [0, 1] units.
    pub tolerance: f32,
    /// Position of the mask's (0, 0) in input coordinates.
    pub mask_pos: IntPoint,
    pub morphology: BorderMorphology,
    pub hold_radius: f32,
    pub release_radius: f32,
    pub compute_contours: bool,
    /// Mask level, in [0, 1), above which a pixel is inside a contour.
    pub contour_level: f32,
}

impl Default for FloodFillConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.0,
            mask_pos: IntPoint::default(),
            morphology: BorderMorphology::None,
            hold_radius: 0.0,
            release_radius: 0.0,
            compute_contours: false,
            contour_level: 0.0,
        }
    }
}

impl FloodFillConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "flood_fill.tolerance must be a non-negative number, got {}",
                self.tolerance
            )));
        }
        if !self.hold_radius.is_finite() || !self.release_radius.is_finite() {
            return Err(Error::InvalidConfig("flood_fill radii must be finite".into()));
        }
        if !(0.0..1.0).contains(&self.contour_level) {
            return Err(Error::InvalidConfig(format!(
                "flood_fill.contour_level must be in [0, 1), got {}",
                self.contour_level
            )));
        }
        Ok(())
    }
}
