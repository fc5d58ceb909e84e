//! Boundary to the external GRIB2 decoder.
//!
//! Acquisition only decides *what* to select; turning a GRIB2 message into
//! numbers is delegated to a [`FieldDecoder`]. [`GribDecoder`] is the
//! production implementation backed by the `grib` crate; tests script their
//! own decoders.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use wx_common::BoundingBox;

/// Filter keys dropped one at a time, in this order, when nothing matches.
pub const RELAXATION_ORDER: &[&str] = &["typeOfLevel", "level", "stepType"];

/// Errors reported by a decoder.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("no valid message found in {path} for filters {filters}")]
    NoMatchingMessage { path: PathBuf, filters: String },

    #[error("truncated GRIB2 data in {path}: {detail}")]
    Truncated { path: PathBuf, detail: String },

    #[error("unsupported grid in {path}: {detail}")]
    UnsupportedGrid { path: PathBuf, detail: String },

    #[error("malformed GRIB2 data in {path}: {detail}")]
    Malformed { path: PathBuf, detail: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A decoded 2-D field on a regular latitude/longitude grid.
///
/// Values are row-major, north to south then west to east. Missing points
/// are `NaN`.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedField {
    pub var_id: String,
    pub width: usize,
    pub height: usize,
    /// Outer edges of the grid in degrees; longitudes may be 0..360.
    pub bounds: BoundingBox,
    pub values: Vec<f32>,
    pub units: Option<String>,
    /// Non-dimensional coordinates (level, step, ...) carried by the decoder.
    pub coords: BTreeMap<String, f64>,
}

impl DecodedField {
    pub fn new(
        var_id: impl Into<String>,
        width: usize,
        height: usize,
        bounds: BoundingBox,
        values: Vec<f32>,
    ) -> Self {
        Self {
            var_id: var_id.into(),
            width,
            height,
            bounds,
            values,
            units: None,
            coords: BTreeMap::new(),
        }
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    pub fn with_coord(mut self, name: impl Into<String>, value: f64) -> Self {
        self.coords.insert(name.into(), value);
        self
    }

    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.values[y * self.width + x]
    }

    /// Whether two fields can be combined point by point.
    ///
    /// Only the spatial dimensions count; non-dimensional coordinates such as
    /// the height of a wind component are ignored.
    pub fn spatially_aligned(&self, other: &DecodedField) -> bool {
        const EPS: f64 = 1e-6;
        self.width == other.width
            && self.height == other.height
            && (self.bounds.min_x - other.bounds.min_x).abs() < EPS
            && (self.bounds.min_y - other.bounds.min_y).abs() < EPS
            && (self.bounds.max_x - other.bounds.max_x).abs() < EPS
            && (self.bounds.max_y - other.bounds.max_y).abs() < EPS
    }

    /// Min and max over non-missing values.
    pub fn value_range(&self) -> Option<(f32, f32)> {
        self.values
            .iter()
            .filter(|v| v.is_finite())
            .fold(None, |acc, &v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }
}

/// The external decoder.
///
/// Implementations are blocking; async callers run them on the blocking pool.
pub trait FieldDecoder: Send + Sync {
    fn decode(
        &self,
        path: &Path,
        filter_keys: &BTreeMap<String, String>,
        search: &[String],
    ) -> Result<DecodedField, DecodeError>;
}

/// Decode, dropping disambiguating filter keys one at a time while nothing
/// matches. Any other error is returned immediately.
pub fn decode_with_relaxation(
    decoder: &dyn FieldDecoder,
    path: &Path,
    filter_keys: &BTreeMap<String, String>,
    search: &[String],
) -> Result<DecodedField, DecodeError> {
    let mut keys = filter_keys.clone();
    let mut result = decoder.decode(path, &keys, search);

    for key in RELAXATION_ORDER {
        match &result {
            Err(DecodeError::NoMatchingMessage { .. }) => {}
            _ => break,
        }
        if keys.remove(*key).is_none() {
            continue;
        }
        debug!(path = %path.display(), dropped = key, "Relaxing decoder filters");
        result = decoder.decode(path, &keys, search);
    }

    result
}

/// `(discipline, category, number)` for each short name the decoder knows.
const PARAMETERS: &[(&str, (u8, u8, u8))] = &[
    ("2t", (0, 0, 0)),
    ("t", (0, 0, 0)),
    ("2d", (0, 0, 6)),
    ("10u", (0, 2, 2)),
    ("10v", (0, 2, 3)),
    ("gust", (0, 2, 22)),
    ("prmsl", (0, 3, 1)),
    ("prate", (0, 1, 7)),
    ("crain", (0, 1, 192)),
    ("cfrzr", (0, 1, 193)),
    ("cicep", (0, 1, 194)),
    ("csnow", (0, 1, 195)),
    ("refc", (0, 16, 196)),
];

/// First fixed surface type for each `typeOfLevel`.
const LEVEL_TYPES: &[(&str, u8)] = &[
    ("surface", 1),
    ("meanSea", 101),
    ("heightAboveGround", 103),
    ("atmosphere", 10),
];

fn lookup<T: Copy>(table: &[(&str, T)], key: &str) -> Option<T> {
    table.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

/// Production decoder backed by the `grib` crate.
///
/// Selection uses `shortName`, `typeOfLevel` and `level`; only regular
/// latitude/longitude grids are supported.
#[derive(Debug, Clone, Copy, Default)]
pub struct GribDecoder;

impl GribDecoder {
    fn malformed(path: &Path, detail: impl ToString) -> DecodeError {
        let detail = detail.to_string();
        // The grib crate reports short reads as generic parse failures.
        if detail.to_lowercase().contains("eof") || detail.to_lowercase().contains("length") {
            DecodeError::Truncated {
                path: path.to_path_buf(),
                detail,
            }
        } else {
            DecodeError::Malformed {
                path: path.to_path_buf(),
                detail,
            }
        }
    }
}

impl FieldDecoder for GribDecoder {
    fn decode(
        &self,
        path: &Path,
        filter_keys: &BTreeMap<String, String>,
        _search: &[String],
    ) -> Result<DecodedField, DecodeError> {
        let no_match = || DecodeError::NoMatchingMessage {
            path: path.to_path_buf(),
            filters: format!("{:?}", filter_keys),
        };

        let short_name = filter_keys.get("shortName").ok_or_else(no_match)?;
        let (discipline, category, number) = lookup(PARAMETERS, short_name).ok_or_else(no_match)?;
        let level_type = filter_keys
            .get("typeOfLevel")
            .and_then(|t| lookup(LEVEL_TYPES, t));
        let level: Option<f64> = filter_keys.get("level").and_then(|l| l.parse().ok());

        let file = File::open(path).map_err(|source| DecodeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let grib_file =
            grib::from_reader(BufReader::new(file)).map_err(|e| Self::malformed(path, e))?;

        for (_index, submsg) in grib_file.iter() {
            if submsg.indicator().discipline != discipline {
                continue;
            }
            let prod_def = submsg.prod_def();
            if prod_def.parameter_category() != Some(category)
                || prod_def.parameter_number() != Some(number)
            {
                continue;
            }
            let surface = prod_def.fixed_surfaces().map(|(first, _)| first);
            if let Some(want) = level_type {
                if surface.as_ref().map(|s| s.surface_type) != Some(want) {
                    continue;
                }
            }
            if let Some(want) = level {
                let have = surface.as_ref().map(|s| s.value() as f64);
                if have.map_or(true, |h| (h - want).abs() > 1e-3) {
                    continue;
                }
            }

            let grid_def = submsg.grid_def();
            if grid_def.grid_tmpl_num() != 0 {
                return Err(DecodeError::UnsupportedGrid {
                    path: path.to_path_buf(),
                    detail: format!("grid template {}", grid_def.grid_tmpl_num()),
                });
            }
            let (width, height) = submsg.grid_shape().map_err(|e| Self::malformed(path, e))?;
            let points: Vec<(f32, f32)> = submsg
                .latlons()
                .map_err(|e| Self::malformed(path, e))?
                .collect();
            let bounds = grid_bounds(&points, width, height).ok_or_else(|| {
                Self::malformed(path, "grid has fewer than 2x2 points")
            })?;
            let north_first = points[0].0 >= points[points.len() - 1].0;

            let decoder =
                grib::Grib2SubmessageDecoder::from(submsg).map_err(|e| Self::malformed(path, e))?;
            let mut values: Vec<f32> = decoder
                .dispatch()
                .map_err(|e| Self::malformed(path, e))?
                .collect();
            if values.len() != width * height {
                return Err(DecodeError::Truncated {
                    path: path.to_path_buf(),
                    detail: format!("expected {} values, got {}", width * height, values.len()),
                });
            }
            if !north_first {
                flip_rows(&mut values, width);
            }

            debug!(path = %path.display(), short_name = %short_name, width, height, "Decoded field");
            let mut field = DecodedField::new(short_name.clone(), width, height, bounds, values);
            if let Some(s) = surface {
                field = field.with_coord("level", s.value() as f64);
            }
            return Ok(field);
        }

        Err(no_match())
    }
}

/// Cell-edge bounds of a regular grid from its cell-centre coordinates.
fn grid_bounds(points: &[(f32, f32)], width: usize, height: usize) -> Option<BoundingBox> {
    if width < 2 || height < 2 || points.len() != width * height {
        return None;
    }
    let (lat_a, lon_a) = points[0];
    let (lat_b, lon_b) = points[points.len() - 1];
    let (lat_lo, lat_hi) = (lat_a.min(lat_b) as f64, lat_a.max(lat_b) as f64);
    let (lon_lo, mut lon_hi) = (lon_a as f64, lon_b as f64);
    if lon_hi < lon_lo {
        lon_hi += 360.0;
    }
    let dx = (lon_hi - lon_lo) / (width - 1) as f64;
    let dy = (lat_hi - lat_lo) / (height - 1) as f64;
    Some(BoundingBox::new(
        lon_lo - dx / 2.0,
        lat_lo - dy / 2.0,
        lon_hi + dx / 2.0,
        lat_hi + dy / 2.0,
    ))
}

fn flip_rows(values: &mut [f32], width: usize) {
    let height = values.len() / width;
    for y in 0..height / 2 {
        let (top, bottom) = values.split_at_mut((height - 1 - y) * width);
        top[y * width..(y + 1) * width].swap_with_slice(&mut bottom[..width]);
    }
}
