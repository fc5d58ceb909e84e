//! Raster metadata vocabulary shared by encoding, staging and discovery.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How a frame's values map to colours downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaletteKind {
    /// Smooth colour ramp; resampled with bilinear or better.
    Continuous,
    /// Category indices; resampled with nearest neighbour only.
    Discrete,
}

impl fmt::Display for PaletteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaletteKind::Continuous => f.write_str("continuous"),
            PaletteKind::Discrete => f.write_str("discrete"),
        }
    }
}

/// Band layout of an encoded tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// One byte band; opacity follows the 255 nodata sentinel.
    SingleBand,
    /// Byte band plus explicit alpha band.
    ByteAlpha,
    /// Pre-composited colour, passed through.
    Rgba,
}

impl OutputMode {
    pub fn band_count(&self) -> usize {
        match self {
            OutputMode::SingleBand => 1,
            OutputMode::ByteAlpha => 2,
            OutputMode::Rgba => 4,
        }
    }
}
