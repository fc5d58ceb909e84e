//! Overview pyramid build and validation.
//!
//! A full pass (all bands plus the internal mask) is tried first. Engines
//! that cannot carry an internal mask get explicit band subsets instead:
//! colour bands in one pass, mask-dependent bands in another. Overviews left
//! over from an earlier build are cleared and rebuilt from a full pass.

use std::path::Path;

use tracing::{debug, warn};

use crate::engine::{RasterEngine, RasterMetadata};
use crate::error::{EncodingError, EngineFault, Result};
use crate::policy::Resampling;
use wx_common::OutputMode;

/// How the overviews ended up being built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverviewStrategy {
    FullPass,
    BandSubsets,
    /// Stale overviews were cleared first.
    Rebuilt(Fallback),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    FullPass,
    BandSubsets,
}

impl OverviewStrategy {
    pub fn used_band_subsets(&self) -> bool {
        matches!(
            self,
            OverviewStrategy::BandSubsets | OverviewStrategy::Rebuilt(Fallback::BandSubsets)
        )
    }
}

/// Build overviews at `levels`, then validate them.
pub fn build_and_validate(
    engine: &dyn RasterEngine,
    path: &Path,
    resampling: Resampling,
    levels: &[u32],
) -> Result<OverviewStrategy> {
    let strategy = match build_once(engine, path, resampling, levels) {
        Ok(fallback) => match fallback {
            Fallback::FullPass => OverviewStrategy::FullPass,
            Fallback::BandSubsets => OverviewStrategy::BandSubsets,
        },
        Err(e) if matches!(e.fault(), Some(EngineFault::OverviewConflict { .. })) => {
            warn!(path = %path.display(), error = %e, "Existing overviews conflict, rebuilding");
            engine.clear_overviews(path)?;
            OverviewStrategy::Rebuilt(build_once(engine, path, resampling, levels)?)
        }
        Err(e) => return Err(e),
    };

    let metadata = engine.metadata(path)?;
    let mask_expected = engine.supports_mask_overviews()
        && metadata.mode != OutputMode::Rgba
        && !strategy.used_band_subsets();
    validate(path, &metadata, levels, mask_expected)?;
    debug!(path = %path.display(), ?strategy, "Overviews built");
    Ok(strategy)
}

fn build_once(
    engine: &dyn RasterEngine,
    path: &Path,
    resampling: Resampling,
    levels: &[u32],
) -> Result<Fallback> {
    match engine.build_overviews(path, resampling, levels, None) {
        Ok(()) => Ok(Fallback::FullPass),
        Err(e) if matches!(e.fault(), Some(EngineFault::MaskUnsupported)) => {
            debug!(path = %path.display(), "No internal mask overviews, building band subsets");
            let metadata = engine.metadata(path)?;
            let (alpha, colour): (Vec<usize>, Vec<usize>) = metadata
                .bands
                .iter()
                .map(|b| b.index)
                .partition(|&i| metadata.bands[i].is_alpha);
            for subset in [colour, alpha] {
                if !subset.is_empty() {
                    engine.build_overviews(path, resampling, levels, Some(subset.as_slice()))?;
                }
            }
            Ok(Fallback::BandSubsets)
        }
        Err(e) => Err(e),
    }
}

/// Every band carries exactly one overview set at `levels`, and the mask has
/// overviews when `mask_expected`.
///
/// An alpha band with no overviews is accepted as long as every colour band
/// has its set.
pub fn validate(
    path: &Path,
    metadata: &RasterMetadata,
    levels: &[u32],
    mask_expected: bool,
) -> Result<()> {
    let fail = |detail: String| EncodingError::OverviewValidation {
        path: path.to_path_buf(),
        detail,
    };

    let mut colour_bands = 0;
    for band in metadata.bands.iter().filter(|b| !b.is_alpha) {
        colour_bands += 1;
        if band.overview_sets != 1 {
            return Err(fail(format!(
                "band {} has {} overview sets",
                band.index, band.overview_sets
            )));
        }
        if band.overview_levels != levels {
            return Err(fail(format!(
                "band {} has levels {:?}, expected {:?}",
                band.index, band.overview_levels, levels
            )));
        }
    }
    if colour_bands == 0 {
        return Err(fail("no colour bands".into()));
    }

    for band in metadata.bands.iter().filter(|b| b.is_alpha) {
        match band.overview_sets {
            0 => {}
            1 if band.overview_levels == levels => {}
            n => {
                return Err(fail(format!(
                    "alpha band {} has {} overview sets at {:?}",
                    band.index, n, band.overview_levels
                )))
            }
        }
    }

    if mask_expected && !metadata.mask_overviews {
        return Err(fail("mask band has no overviews".into()));
    }
    Ok(())
}
