//! Supported NWP models and their capabilities.
//!
//! The model set is small and fixed, so model-specific behaviour lives in
//! `match` arms on a closed enum rather than in runtime-registered plugins.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};

use wx_common::{BoundingBox, Region, RunId};

use crate::error::IngestionError;
use crate::registry::{DeriveKind, FieldSelection, VariableSpec};

/// Categorical precipitation type flags found in NWP output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecipType {
    Rain,
    Snow,
    Sleet,
    FreezingRain,
}

impl PrecipType {
    /// Order used for palette indices.
    pub const ALL: [PrecipType; 4] = [
        PrecipType::Rain,
        PrecipType::Snow,
        PrecipType::Sleet,
        PrecipType::FreezingRain,
    ];

    /// Palette block index.
    pub fn index(&self) -> u8 {
        match self {
            PrecipType::Rain => 0,
            PrecipType::Snow => 1,
            PrecipType::Sleet => 2,
            PrecipType::FreezingRain => 3,
        }
    }

    /// Component role name used in derivation recipes.
    pub fn role(&self) -> &'static str {
        match self {
            PrecipType::Rain => "rain",
            PrecipType::Snow => "snow",
            PrecipType::Sleet => "sleet",
            PrecipType::FreezingRain => "frzr",
        }
    }

    pub fn from_role(role: &str) -> Option<Self> {
        PrecipType::ALL.into_iter().find(|t| t.role() == role)
    }

    /// When several flags are set at one point the most hazardous wins.
    pub fn severity(&self) -> u8 {
        match self {
            PrecipType::Rain => 0,
            PrecipType::Snow => 1,
            PrecipType::Sleet => 2,
            PrecipType::FreezingRain => 3,
        }
    }
}

/// Static facts about a model that gate derivation and scheduling.
#[derive(Debug, Clone, Copy)]
pub struct ModelCapabilities {
    /// Hours between cycles (6 for GFS, 1 for HRRR).
    pub cycle_interval_hours: u32,
    /// How long after initialization the first files usually appear.
    pub availability_lag_hours: u32,
    pub max_forecast_hour: u32,
    pub forecast_step_hours: u32,
    /// Precipitation type flags the model publishes.
    pub precip_types: &'static [PrecipType],
    /// First forecast hour with a meaningful precipitation rate, and the
    /// cadence after it. Models without sub-stepped output only carry
    /// interval averages on this cadence.
    pub precip_rate_start: u32,
    pub precip_rate_step: u32,
    /// Native domain.
    pub domain: BoundingBox,
}

/// A supported model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Model {
    Gfs,
    Hrrr,
    Nam,
}

impl Model {
    pub const ALL: [Model; 3] = [Model::Gfs, Model::Hrrr, Model::Nam];

    pub fn id(&self) -> &'static str {
        match self {
            Model::Gfs => "gfs",
            Model::Hrrr => "hrrr",
            Model::Nam => "nam",
        }
    }

    pub fn capabilities(&self) -> ModelCapabilities {
        match self {
            Model::Gfs => ModelCapabilities {
                cycle_interval_hours: 6,
                availability_lag_hours: 4,
                max_forecast_hour: 120,
                forecast_step_hours: 3,
                // GFS does not carry the ice-pellet flag in its surface set.
                precip_types: &[PrecipType::Rain, PrecipType::Snow, PrecipType::FreezingRain],
                precip_rate_start: 6,
                precip_rate_step: 6,
                domain: BoundingBox::new(-180.0, -90.0, 180.0, 90.0),
            },
            Model::Hrrr => ModelCapabilities {
                cycle_interval_hours: 1,
                availability_lag_hours: 1,
                max_forecast_hour: 18,
                forecast_step_hours: 1,
                precip_types: &PrecipType::ALL,
                precip_rate_start: 1,
                precip_rate_step: 1,
                domain: BoundingBox::new(-134.1, 21.1, -60.9, 52.7),
            },
            Model::Nam => ModelCapabilities {
                cycle_interval_hours: 6,
                availability_lag_hours: 2,
                max_forecast_hour: 84,
                forecast_step_hours: 3,
                precip_types: &PrecipType::ALL,
                precip_rate_start: 3,
                precip_rate_step: 3,
                domain: BoundingBox::new(-152.9, 12.2, -49.4, 61.2),
            },
        }
    }

    /// Canonicalize a requested variable id for this model.
    ///
    /// Model-specific spellings are handled here; generic aliases are left to
    /// the registry.
    pub fn normalize_var_id(&self, requested: &str) -> String {
        let lowered = requested.trim().to_ascii_lowercase();
        let mapped = match (self, lowered.as_str()) {
            // HRRR users say "refd" for the 1 km reflectivity product; we serve
            // composite reflectivity for both.
            (Model::Hrrr, "refd") | (Model::Hrrr, "refd1km") => "refc",
            (_, "2t") | (_, "t2m") => "tmp2m",
            (_, "2d") | (_, "d2m") => "dpt2m",
            (_, "10u") | (_, "u10") => "ugrd10m",
            (_, "10v") | (_, "v10") => "vgrd10m",
            _ => lowered.as_str(),
        };
        mapped.to_string()
    }

    /// Selection parameters passed to the decoder and providers.
    pub fn select_field(&self, spec: &VariableSpec) -> FieldSelection {
        let mut selection = FieldSelection {
            var_id: spec.id.clone(),
            filter_keys: spec.selectors.filter_keys.clone(),
            search: spec.selectors.search.clone(),
        };
        // GFS only publishes interval-averaged precipitation rate; HRRR and
        // NAM carry the instantaneous field.
        if spec.id == "prate" {
            let step_type = match self {
                Model::Gfs => "avg",
                Model::Hrrr | Model::Nam => "instant",
            };
            selection
                .filter_keys
                .insert("stepType".to_string(), step_type.to_string());
        }
        selection
    }

    /// Whether this model can produce a composite at all.
    pub fn supports_derive(&self, kind: DeriveKind) -> bool {
        let caps = self.capabilities();
        match kind {
            DeriveKind::WindSpeed => true,
            DeriveKind::RadarPtype | DeriveKind::PrecipTypeIntensity => !caps.precip_types.is_empty(),
        }
    }

    /// Precipitation types present in this model's output.
    pub fn precip_types(&self) -> &'static [PrecipType] {
        self.capabilities().precip_types
    }

    /// Forecast hours worth building for a variable.
    pub fn target_forecast_hours(&self, spec: &VariableSpec) -> Vec<u32> {
        let caps = self.capabilities();
        match spec.derive {
            Some(DeriveKind::PrecipTypeIntensity) => (caps.precip_rate_start
                ..=caps.max_forecast_hour)
                .step_by(caps.precip_rate_step.max(1) as usize)
                .collect(),
            _ if spec.id == "prate" => (caps.precip_rate_start..=caps.max_forecast_hour)
                .step_by(caps.precip_rate_step.max(1) as usize)
                .collect(),
            _ => (0..=caps.max_forecast_hour)
                .step_by(caps.forecast_step_hours.max(1) as usize)
                .collect(),
        }
    }

    /// Whether `fhr` is one of [`Model::target_forecast_hours`].
    pub fn has_forecast_hour(&self, spec: &VariableSpec, fhr: u32) -> bool {
        self.target_forecast_hours(spec).contains(&fhr)
    }

    /// Most recent cycle that should have started publishing by `now`.
    pub fn latest_cycle(&self, now: DateTime<Utc>) -> RunId {
        let caps = self.capabilities();
        let available = now - Duration::hours(caps.availability_lag_hours as i64);
        let hour = available.hour() - available.hour() % caps.cycle_interval_hours;
        let cycle = available
            .date_naive()
            .and_hms_opt(hour, 0, 0)
            .map(|naive| naive.and_utc())
            .unwrap_or(available);
        RunId::from_datetime(cycle)
    }

    /// Whether a region overlaps the model domain.
    pub fn covers(&self, region: &Region) -> bool {
        self.capabilities().domain.intersects(&region.bounds)
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Model {
    type Err = IngestionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Model::ALL
            .into_iter()
            .find(|m| m.id().eq_ignore_ascii_case(s))
            .ok_or_else(|| IngestionError::UnknownModel(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::VariableRegistry;
    use chrono::TimeZone;

    #[test]
    fn test_parse_model() {
        assert_eq!("gfs".parse::<Model>().unwrap(), Model::Gfs);
        assert_eq!("HRRR".parse::<Model>().unwrap(), Model::Hrrr);
        assert!("ecmwf".parse::<Model>().is_err());
    }

    #[test]
    fn test_normalize_aliases() {
        assert_eq!(Model::Gfs.normalize_var_id("2t"), "tmp2m");
        assert_eq!(Model::Hrrr.normalize_var_id("T2M"), "tmp2m");
        assert_eq!(Model::Hrrr.normalize_var_id("refd"), "refc");
        assert_eq!(Model::Gfs.normalize_var_id("refd"), "refd");
    }

    #[test]
    fn test_precip_type_presence_is_per_model() {
        assert!(Model::Hrrr.precip_types().contains(&PrecipType::Sleet));
        assert!(!Model::Gfs.precip_types().contains(&PrecipType::Sleet));
    }

    #[test]
    fn test_precip_rate_cadence() {
        let registry = VariableRegistry::builtin().unwrap();
        let spec = registry.get("precip_ptype").unwrap();
        let gfs = Model::Gfs.target_forecast_hours(spec);
        assert_eq!(&gfs[..3], &[6, 12, 18]);
        assert!(!gfs.contains(&0));
        let hrrr = Model::Hrrr.target_forecast_hours(spec);
        assert_eq!(hrrr.first(), Some(&1));
        assert_eq!(hrrr.len(), 18);
    }

    #[test]
    fn test_latest_cycle() {
        let now = Utc.with_ymd_and_hms(2026, 2, 7, 11, 30, 0).unwrap();
        // 11:30 - 4h lag = 07:30 -> 06z
        assert_eq!(Model::Gfs.latest_cycle(now).as_str(), "20260207_06z");
        // 11:30 - 1h lag = 10:30 -> 10z
        assert_eq!(Model::Hrrr.latest_cycle(now).as_str(), "20260207_10z");

        let early = Utc.with_ymd_and_hms(2026, 2, 7, 2, 0, 0).unwrap();
        assert_eq!(Model::Gfs.latest_cycle(early).as_str(), "20260206_18z");
    }

    #[test]
    fn test_prate_step_type_per_model() {
        let registry = VariableRegistry::builtin().unwrap();
        let spec = registry.get("prate").unwrap();
        assert_eq!(Model::Gfs.select_field(spec).filter_keys["stepType"], "avg");
        assert_eq!(Model::Hrrr.select_field(spec).filter_keys["stepType"], "instant");
    }

    #[test]
    fn test_domain_coverage() {
        assert!(Model::Hrrr.covers(&Region::conus()));
        let europe = Region::new("europe", BoundingBox::new(-15.0, 35.0, 45.0, 72.0)).unwrap();
        assert!(!Model::Hrrr.covers(&europe));
        assert!(Model::Gfs.covers(&europe));
    }
}
