//! Decoded fields to byte bands.
//!
//! Band 1 holds the value scaled onto `0..=254`; 255 is the nodata sentinel.
//! Band 2 is per-pixel opacity. Whatever the band count, a pixel whose
//! band 1 is 255 is transparent (RGBA sources excepted, which carry their
//! own alpha).

use ingestion::{DecodedField, VariableSpec};
use wx_common::{BoundingBox, OutputMode, PaletteKind};

use crate::error::{EncodingError, Result};
use crate::policy::palette_kind;

/// Reserved byte for "no data" on the primary band.
pub const NODATA: u8 = 255;
/// Largest byte a real value can map to.
pub const MAX_VALUE_BYTE: u8 = 254;

pub const OPAQUE: u8 = 255;
pub const TRANSPARENT: u8 = 0;

/// Metadata carried with an encoded raster.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeMeta {
    pub palette_kind: PaletteKind,
    pub output_mode: OutputMode,
    pub units: Option<String>,
    /// Value range mapped onto `0..=254`; `None` for categorical bytes.
    pub scale: Option<(f32, f32)>,
    /// Pixels encoded as nodata, including masked sub-threshold values.
    pub masked_pixels: usize,
}

/// Byte bands on the source grid.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedRaster {
    pub width: usize,
    pub height: usize,
    pub bounds: BoundingBox,
    pub bands: Vec<Vec<u8>>,
    pub meta: EncodeMeta,
}

impl EncodedRaster {
    pub fn value_band(&self) -> &[u8] {
        &self.bands[0]
    }

    pub fn alpha_band(&self) -> Option<&[u8]> {
        match self.meta.output_mode {
            OutputMode::ByteAlpha => Some(&self.bands[1]),
            OutputMode::Rgba => Some(&self.bands[3]),
            OutputMode::SingleBand => None,
        }
    }
}

/// Encode a decoded field as a byte band plus an alpha band.
///
/// Categorical values (flags, palette indices) are rounded to bytes as-is.
/// Continuous values are scaled by the variable's value range, or the
/// field's own range when the variable has none. Continuous values below the
/// variable's significance threshold are masked transparent.
pub fn encode(field: &DecodedField, spec: &VariableSpec) -> Result<EncodedRaster> {
    if field.width == 0 || field.height == 0 || field.values.len() != field.width * field.height {
        return Err(EncodingError::InvalidBounds(format!(
            "field '{}' has {} values for a {}x{} grid",
            field.var_id,
            field.values.len(),
            field.width,
            field.height
        )));
    }

    let kind = palette_kind(spec);
    let hints = &spec.selectors.hints;
    let scale = match kind {
        PaletteKind::Discrete => None,
        PaletteKind::Continuous => Some(
            hints
                .value_range
                .or_else(|| field.value_range())
                .unwrap_or((0.0, 1.0)),
        ),
    };
    let threshold = match kind {
        PaletteKind::Continuous => hints.min_significant,
        // Composite indices are already masked during derivation.
        PaletteKind::Discrete => None,
    };

    let mut value_band = Vec::with_capacity(field.values.len());
    let mut masked = 0;
    for &v in &field.values {
        let insignificant = threshold.is_some_and(|t| v < t);
        let byte = if !v.is_finite() || insignificant {
            None
        } else {
            Some(match scale {
                Some((lo, hi)) => scale_to_byte(v, lo, hi),
                None => v.round().clamp(0.0, MAX_VALUE_BYTE as f32) as u8,
            })
        };
        match byte {
            Some(b) => value_band.push(b),
            None => {
                masked += 1;
                value_band.push(NODATA);
            }
        }
    }
    let alpha_band = alpha_from_sentinel(&value_band);

    Ok(EncodedRaster {
        width: field.width,
        height: field.height,
        bounds: field.bounds,
        bands: vec![value_band, alpha_band],
        meta: EncodeMeta {
            palette_kind: kind,
            output_mode: OutputMode::ByteAlpha,
            units: hints.units.clone().or_else(|| field.units.clone()),
            scale,
            masked_pixels: masked,
        },
    })
}

/// Map `v` linearly from `lo..=hi` onto `0..=254`.
pub fn scale_to_byte(v: f32, lo: f32, hi: f32) -> u8 {
    if hi <= lo {
        return 0;
    }
    let t = ((v - lo) / (hi - lo)).clamp(0.0, 1.0);
    (t * MAX_VALUE_BYTE as f32).round() as u8
}

/// Inverse of [`scale_to_byte`]; `None` for the sentinel.
pub fn byte_to_value(b: u8, lo: f32, hi: f32) -> Option<f32> {
    (b != NODATA).then(|| lo + (b as f32 / MAX_VALUE_BYTE as f32) * (hi - lo))
}

fn alpha_from_sentinel(values: &[u8]) -> Vec<u8> {
    values
        .iter()
        .map(|&b| if b == NODATA { TRANSPARENT } else { OPAQUE })
        .collect()
}

/// Bring an arbitrary band stack into one of the supported output modes.
///
/// * 1 band: kept as is; opacity is all-or-nothing from the sentinel.
/// * 2 bands: band 2 is alpha, forced to 0 wherever band 1 is 255.
/// * 4+ bands: pre-composited colour, reordered to RGBA by `rgba_order`
///   (source band index for R, G, B, A). Values are never touched.
pub fn normalize_bands(
    mut bands: Vec<Vec<u8>>,
    rgba_order: [usize; 4],
) -> Result<(OutputMode, Vec<Vec<u8>>)> {
    let len = bands.first().map(|b| b.len()).unwrap_or(0);
    if bands.iter().any(|b| b.len() != len) {
        return Err(EncodingError::UnsupportedBandLayout { bands: bands.len() });
    }
    match bands.len() {
        1 => Ok((OutputMode::SingleBand, bands)),
        2 => {
            let (value, alpha) = bands.split_at_mut(1);
            for (v, a) in value[0].iter().zip(alpha[0].iter_mut()) {
                if *v == NODATA {
                    *a = TRANSPARENT;
                }
            }
            Ok((OutputMode::ByteAlpha, bands))
        }
        n if n >= 4 => {
            if rgba_order.iter().any(|&i| i >= n) {
                return Err(EncodingError::UnsupportedBandLayout { bands: n });
            }
            let reordered = rgba_order.iter().map(|&i| bands[i].clone()).collect();
            Ok((OutputMode::Rgba, reordered))
        }
        n => Err(EncodingError::UnsupportedBandLayout { bands: n }),
    }
}

/// Opacity of pixel `i` under the mode's nodata convention.
pub fn opacity(mode: OutputMode, bands: &[Vec<u8>], i: usize) -> u8 {
    match mode {
        OutputMode::SingleBand => {
            if bands[0][i] == NODATA {
                TRANSPARENT
            } else {
                OPAQUE
            }
        }
        OutputMode::ByteAlpha => {
            if bands[0][i] == NODATA {
                TRANSPARENT
            } else {
                bands[1][i]
            }
        }
        OutputMode::Rgba => bands[3][i],
    }
}
