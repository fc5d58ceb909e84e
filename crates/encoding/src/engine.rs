//! Boundary to the raster engine that reprojects tiles and builds overviews.
//!
//! The encoding policy never does projection math itself; it hands rasters
//! to an engine and inspects the structured metadata the engine reports
//! afterwards.

use std::path::Path;

use serde::{Deserialize, Serialize};

use wx_common::{BoundingBox, OutputMode};

use crate::error::Result;
use crate::policy::Resampling;

/// An in-memory band stack on a regular lat/lon grid, north-up.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    pub width: usize,
    pub height: usize,
    /// Outer edges of the grid in degrees.
    pub bounds: BoundingBox,
    pub mode: OutputMode,
    pub bands: Vec<Vec<u8>>,
}

impl Raster {
    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }
}

/// One reprojection call.
#[derive(Debug, Clone)]
pub struct ReprojectRequest<'a> {
    pub src: &'a Path,
    pub dst: &'a Path,
    pub dst_bounds: BoundingBox,
    /// Width, height in pixels.
    pub dst_size: (usize, usize),
    pub resampling: Resampling,
    /// Nodata convention of the source bands.
    pub nodata: OutputMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandMetadata {
    pub index: usize,
    pub is_alpha: bool,
    /// Number of overview pyramids attached to the band.
    pub overview_sets: usize,
    pub overview_levels: Vec<u32>,
}

/// What the engine reports about a raster on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterMetadata {
    pub width: usize,
    pub height: usize,
    pub mode: OutputMode,
    pub bands: Vec<BandMetadata>,
    /// Whether an internal mask band carries its own overviews.
    pub mask_overviews: bool,
    /// Kernel used to produce the base level, when it was reprojected.
    pub resampling: Option<Resampling>,
    /// Kernel used for the overviews, if any were built.
    pub overview_resampling: Option<Resampling>,
}

impl RasterMetadata {
    pub fn band_count(&self) -> usize {
        self.bands.len()
    }
}

/// A raster engine. All calls are blocking.
pub trait RasterEngine: Send + Sync {
    /// Write `raster` to `path`, without overviews.
    fn write(&self, path: &Path, raster: &Raster) -> Result<()>;

    /// Read the base level of a raster.
    fn read(&self, path: &Path) -> Result<Raster>;

    /// Reproject `src` into the target bounds and size, writing `dst`.
    fn reproject(&self, request: &ReprojectRequest<'_>) -> Result<()>;

    /// Build an internal overview set at `levels`.
    ///
    /// `bands` restricts the pass to a band subset; `None` is a full pass that
    /// also builds the internal mask overviews when the raster has a mask.
    fn build_overviews(
        &self,
        path: &Path,
        resampling: Resampling,
        levels: &[u32],
        bands: Option<&[usize]>,
    ) -> Result<()>;

    /// Drop every overview set.
    fn clear_overviews(&self, path: &Path) -> Result<()>;

    fn metadata(&self, path: &Path) -> Result<RasterMetadata>;

    /// Whether full-pass overview builds can carry an internal mask band.
    fn supports_mask_overviews(&self) -> bool;
}
