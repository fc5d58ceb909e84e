//! Raster encoding for weather tiles.
//!
//! Decoded fields become byte bands with a 255 nodata sentinel plus an alpha
//! band, are reprojected into the target region by a [`RasterEngine`], and
//! get an internal overview pyramid.
//!
//! - [`policy`]: palette kind and resampling choice per variable.
//! - [`encode`]: value scaling, significance masking, band-count conventions.
//! - [`engine`]: the raster engine boundary.
//! - [`overviews`]: pyramid build with mask and conflict fallbacks, validation.
//! - [`local`]: an in-process engine.
//! - [`frame`]: the whole path for one frame.

pub mod encode;
pub mod engine;
pub mod error;
pub mod frame;
pub mod local;
pub mod overviews;
pub mod policy;
pub mod resample;

pub use encode::{encode, normalize_bands, opacity, EncodeMeta, EncodedRaster, NODATA};
pub use engine::{BandMetadata, Raster, RasterEngine, RasterMetadata, ReprojectRequest};
pub use error::{EncodingError, EngineFault, Result};
pub use frame::{target_size, EncodedFrame, FrameEncoder, FrameTarget};
pub use local::LocalRasterEngine;
pub use overviews::{build_and_validate, OverviewStrategy};
pub use policy::{palette_kind, EncodingPolicy, Resampling, OVERVIEW_LEVELS};
