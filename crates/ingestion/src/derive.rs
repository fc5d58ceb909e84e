//! Combine functions for composite variables.
//!
//! Composite outputs for the precipitation-type products are palette indices:
//! four blocks of [`PTYPE_LEVELS`] entries, one block per [`PrecipType`], with
//! the intensity bin inside the block. Points below the significance
//! threshold come out as `NaN` and are encoded transparent.

use std::collections::BTreeMap;

use crate::decoder::DecodedField;
use crate::error::{IngestionError, Result};
use crate::models::{Model, PrecipType};
use crate::registry::DeriveKind;

/// Metres per second to miles per hour.
pub const MPS_TO_MPH: f32 = 2.23694;

/// kg m-2 s-1 of water to mm/hr.
pub const KG_M2_S_TO_MM_HR: f32 = 3600.0;

/// Reflectivity below this is not drawn.
pub const MIN_REFLECTIVITY_DBZ: f32 = 10.0;
pub const MAX_REFLECTIVITY_DBZ: f32 = 75.0;

/// Precipitation rates below this are not drawn.
pub const MIN_PRECIP_RATE_MM_HR: f32 = 0.1;
pub const MAX_PRECIP_RATE_MM_HR: f32 = 50.0;

/// Palette entries per precipitation type.
pub const PTYPE_LEVELS: u8 = 60;

pub fn wind_speed_mph(u: f32, v: f32) -> f32 {
    (u * u + v * v).sqrt() * MPS_TO_MPH
}

pub fn precip_rate_to_mm_hr(rate: f32) -> f32 {
    rate * KG_M2_S_TO_MM_HR
}

/// Palette index for a value inside a precipitation type block.
pub fn ptype_palette_index(ptype: PrecipType, value: f32, min: f32, max: f32) -> f32 {
    let t = ((value - min) / (max - min)).clamp(0.0, 1.0);
    let bin = (t * (PTYPE_LEVELS - 1) as f32).round();
    (ptype.index() as f32) * PTYPE_LEVELS as f32 + bin
}

/// Split a palette index back into its type and bin.
pub fn ptype_from_palette_index(index: u8) -> Option<(PrecipType, u8)> {
    let block = index / PTYPE_LEVELS;
    PrecipType::ALL
        .get(block as usize)
        .map(|t| (*t, index % PTYPE_LEVELS))
}

/// Build a composite from its decoded components, keyed by role.
///
/// Only the precipitation-type flags the model publishes are consulted; a
/// flag the model should have but that is missing from `components` is an
/// error rather than silently treated as "never set".
pub fn derive_composite(
    model: Model,
    kind: DeriveKind,
    var_id: &str,
    components: &BTreeMap<String, DecodedField>,
) -> Result<DecodedField> {
    if !model.supports_derive(kind) {
        return Err(IngestionError::UnsupportedForModel {
            model: model.to_string(),
            variable: var_id.to_string(),
            reason: format!("{:?} composite needs fields the model lacks", kind),
        });
    }

    let role = |name: &str| {
        components.get(name).ok_or_else(|| IngestionError::Derivation {
            variable: var_id.to_string(),
            reason: format!("missing component '{}'", name),
        })
    };

    let base = role(kind.required_roles()[0])?;
    for (name, field) in components {
        if !base.spatially_aligned(field) {
            return Err(IngestionError::Derivation {
                variable: var_id.to_string(),
                reason: format!("component '{}' is on a different grid", name),
            });
        }
    }

    let values = match kind {
        DeriveKind::WindSpeed => {
            let u = role("u")?;
            let v = role("v")?;
            u.values
                .iter()
                .zip(&v.values)
                .map(|(&u, &v)| wind_speed_mph(u, v))
                .collect()
        }
        DeriveKind::RadarPtype => {
            let flags = ptype_flags(model, var_id, components)?;
            base.values
                .iter()
                .enumerate()
                .map(|(i, &dbz)| {
                    if !(dbz >= MIN_REFLECTIVITY_DBZ) {
                        return f32::NAN;
                    }
                    let ptype = dominant_ptype(&flags, i);
                    ptype_palette_index(ptype, dbz, MIN_REFLECTIVITY_DBZ, MAX_REFLECTIVITY_DBZ)
                })
                .collect()
        }
        DeriveKind::PrecipTypeIntensity => {
            let flags = ptype_flags(model, var_id, components)?;
            base.values
                .iter()
                .enumerate()
                .map(|(i, &rate)| {
                    let mm_hr = precip_rate_to_mm_hr(rate);
                    if !(mm_hr >= MIN_PRECIP_RATE_MM_HR) {
                        return f32::NAN;
                    }
                    let ptype = dominant_ptype(&flags, i);
                    ptype_palette_index(ptype, mm_hr, MIN_PRECIP_RATE_MM_HR, MAX_PRECIP_RATE_MM_HR)
                })
                .collect()
        }
    };

    let units = match kind {
        DeriveKind::WindSpeed => "mph",
        DeriveKind::RadarPtype => "dBZ",
        DeriveKind::PrecipTypeIntensity => "mm/hr",
    };

    // Spatial dims only; component coordinates do not carry over.
    Ok(DecodedField::new(var_id, base.width, base.height, base.bounds, values).with_units(units))
}

fn ptype_flags<'a>(
    model: Model,
    var_id: &str,
    components: &'a BTreeMap<String, DecodedField>,
) -> Result<Vec<(PrecipType, &'a DecodedField)>> {
    model
        .precip_types()
        .iter()
        .map(|ptype| {
            components
                .get(ptype.role())
                .map(|field| (*ptype, field))
                .ok_or_else(|| IngestionError::Derivation {
                    variable: var_id.to_string(),
                    reason: format!("{} publishes '{}' but it was not fetched", model, ptype.role()),
                })
        })
        .collect()
}

/// Most severe type whose flag is set at `i`; rain when none is.
fn dominant_ptype(flags: &[(PrecipType, &DecodedField)], i: usize) -> PrecipType {
    flags
        .iter()
        .filter(|(_, field)| field.values.get(i).is_some_and(|v| *v >= 0.5))
        .map(|(ptype, _)| *ptype)
        .max_by_key(|ptype| ptype.severity())
        .unwrap_or(PrecipType::Rain)
}
