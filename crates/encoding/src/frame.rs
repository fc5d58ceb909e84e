//! One decoded field to one tile on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, instrument};

use ingestion::{DecodedField, VariableSpec};
use wx_common::{BoundingBox, OutputMode, PaletteKind, Region};

use crate::encode::{encode, normalize_bands, EncodedRaster};
use crate::engine::{Raster, RasterEngine, ReprojectRequest};
use crate::error::{EncodingError, Result};
use crate::overviews::{build_and_validate, OverviewStrategy};
use crate::policy::{EncodingPolicy, Resampling};

/// Largest tile edge in pixels.
pub const MAX_TILE_DIM: usize = 4096;

/// Where and how large the encoded tile should be.
#[derive(Debug, Clone)]
pub struct FrameTarget {
    pub region: Region,
    pub size: (usize, usize),
    pub path: PathBuf,
}

/// What was written.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedFrame {
    pub tile_path: PathBuf,
    pub output_mode: OutputMode,
    pub palette_kind: PaletteKind,
    pub resampling: Resampling,
    pub units: Option<String>,
    pub overviews: OverviewStrategy,
}

/// Tile size matching the source resolution over `bounds`, capped at
/// [`MAX_TILE_DIM`] on the long edge.
pub fn target_size(field: &DecodedField, bounds: &BoundingBox) -> (usize, usize) {
    let cell_w = field.bounds.width() / field.width.max(1) as f64;
    let cell_h = field.bounds.height() / field.height.max(1) as f64;
    let mut w = (bounds.width() / cell_w).ceil().max(1.0);
    let mut h = (bounds.height() / cell_h).ceil().max(1.0);
    let longest = w.max(h);
    if longest > MAX_TILE_DIM as f64 {
        let scale = MAX_TILE_DIM as f64 / longest;
        w = (w * scale).round().max(1.0);
        h = (h * scale).round().max(1.0);
    }
    (w as usize, h as usize)
}

/// Whether `region` overlaps `grid`, allowing for 0..360 longitudes.
pub fn overlaps(grid: &BoundingBox, region: &BoundingBox) -> bool {
    [0.0, 360.0, -360.0].iter().any(|shift| {
        let shifted = BoundingBox::new(
            region.min_x + shift,
            region.min_y,
            region.max_x + shift,
            region.max_y,
        );
        grid.intersects(&shifted)
    })
}

pub struct FrameEncoder {
    engine: Arc<dyn RasterEngine>,
    policy: EncodingPolicy,
}

impl FrameEncoder {
    pub fn new(engine: Arc<dyn RasterEngine>, policy: EncodingPolicy) -> Self {
        Self { engine, policy }
    }

    pub fn policy(&self) -> &EncodingPolicy {
        &self.policy
    }

    pub fn engine(&self) -> &dyn RasterEngine {
        self.engine.as_ref()
    }

    /// Encode, reproject into the target region and build overviews.
    ///
    /// Blocking; runs to completion or failure once started.
    #[instrument(skip_all, fields(var = %spec.id, region = %target.region.id))]
    pub fn encode_frame(
        &self,
        field: &DecodedField,
        spec: &VariableSpec,
        target: &FrameTarget,
    ) -> Result<EncodedFrame> {
        let bounds = target.region.bounds;
        if !bounds.is_valid() || target.size.0 == 0 || target.size.1 == 0 {
            return Err(EncodingError::InvalidBounds(format!(
                "{} {}x{} over {:?}",
                target.region.id, target.size.0, target.size.1, bounds
            )));
        }
        if !overlaps(&field.bounds, &bounds) {
            return Err(EncodingError::OutsideSource {
                region: target.region.id.clone(),
            });
        }

        let EncodedRaster {
            width,
            height,
            bounds: src_bounds,
            bands,
            meta,
        } = encode(field, spec)?;
        let (mode, bands) = normalize_bands(bands, [0, 1, 2, 3])?;
        let resampling = self.policy.resampling_for(meta.palette_kind);

        let src_path = source_path(&target.path);
        self.engine.write(
            &src_path,
            &Raster {
                width,
                height,
                bounds: src_bounds,
                mode,
                bands,
            },
        )?;
        let reprojected = self.engine.reproject(&ReprojectRequest {
            src: &src_path,
            dst: &target.path,
            dst_bounds: bounds,
            dst_size: target.size,
            resampling,
            nodata: mode,
        });
        std::fs::remove_file(&src_path).ok();
        reprojected?;

        let overviews = build_and_validate(
            self.engine.as_ref(),
            &target.path,
            resampling,
            self.policy.overview_levels(),
        )?;

        debug!(
            path = %target.path.display(),
            %resampling,
            masked = meta.masked_pixels,
            "Encoded frame"
        );
        Ok(EncodedFrame {
            tile_path: target.path.clone(),
            output_mode: mode,
            palette_kind: meta.palette_kind,
            resampling,
            units: meta.units,
            overviews,
        })
    }
}

/// Hidden scratch file for the unprojected source raster.
fn source_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.src.tmp", name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(bounds: BoundingBox, width: usize, height: usize) -> DecodedField {
        DecodedField::new("tmp2m", width, height, bounds, vec![280.0; width * height])
    }

    #[test]
    fn test_target_size_follows_resolution() {
        let f = field(BoundingBox::new(0.0, 0.0, 10.0, 10.0), 40, 40);
        assert_eq!(target_size(&f, &BoundingBox::new(2.0, 2.0, 4.0, 3.0)), (8, 4));
    }

    #[test]
    fn test_target_size_is_capped() {
        let f = field(BoundingBox::new(-180.0, -90.0, 180.0, 90.0), 36000, 18000);
        let (w, h) = target_size(&f, &BoundingBox::new(-180.0, -90.0, 180.0, 90.0));
        assert_eq!(w, MAX_TILE_DIM);
        assert_eq!(h, MAX_TILE_DIM / 2);
    }

    #[test]
    fn test_overlap_across_longitude_conventions() {
        let gfs = BoundingBox::new(-0.125, -90.125, 359.875, 90.125);
        assert!(overlaps(&gfs, &Region::conus().bounds));
        let hrrr = BoundingBox::new(-134.1, 21.1, -60.9, 52.7);
        assert!(!overlaps(&hrrr, &BoundingBox::new(-15.0, 35.0, 45.0, 72.0)));
    }

    #[test]
    fn test_source_path_is_hidden_sibling() {
        let p = source_path(Path::new("/data/staging/x/006.tif"));
        assert_eq!(p, Path::new("/data/staging/x/.006.tif.src.tmp"));
    }
}
