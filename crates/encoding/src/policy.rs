//! Per-variable encoding decisions.
//!
//! Categorical variables (precipitation type masks, reflectivity by type) are
//! resampled nearest-neighbour at every step and get a discrete palette.
//! Everything else is continuous and is always resampled smoothly.

use serde::{Deserialize, Serialize};

use ingestion::VariableSpec;
use wx_common::PaletteKind;

use crate::error::{EncodingError, Result};

/// Overview decimation factors built into every tile.
pub const OVERVIEW_LEVELS: [u32; 6] = [2, 4, 8, 16, 32, 64];

/// Resampling kernel used for reprojection and overviews.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Resampling {
    Nearest,
    #[default]
    Bilinear,
    Cubic,
}

impl Resampling {
    /// Whether the kernel blends neighbouring values.
    pub fn is_smooth(&self) -> bool {
        !matches!(self, Resampling::Nearest)
    }
}

impl std::fmt::Display for Resampling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resampling::Nearest => write!(f, "nearest"),
            Resampling::Bilinear => write!(f, "bilinear"),
            Resampling::Cubic => write!(f, "cubic"),
        }
    }
}

/// Palette kind for a variable.
pub fn palette_kind(spec: &VariableSpec) -> PaletteKind {
    if spec.is_categorical() {
        PaletteKind::Discrete
    } else {
        PaletteKind::Continuous
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodingPolicy {
    continuous_resampling: Resampling,
    overview_levels: Vec<u32>,
}

impl Default for EncodingPolicy {
    fn default() -> Self {
        Self {
            continuous_resampling: Resampling::Bilinear,
            overview_levels: OVERVIEW_LEVELS.to_vec(),
        }
    }
}

impl EncodingPolicy {
    /// Pick the smooth kernel for continuous variables.
    pub fn with_continuous_resampling(mut self, resampling: Resampling) -> Result<Self> {
        if !resampling.is_smooth() {
            return Err(EncodingError::InvalidPolicy(
                "continuous variables need a smooth resampling kernel".into(),
            ));
        }
        self.continuous_resampling = resampling;
        Ok(self)
    }

    pub fn overview_levels(&self) -> &[u32] {
        &self.overview_levels
    }

    pub fn resampling_for(&self, kind: PaletteKind) -> Resampling {
        match kind {
            PaletteKind::Discrete => Resampling::Nearest,
            PaletteKind::Continuous => self.continuous_resampling,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingestion::VariableRegistry;

    #[test]
    fn test_palette_kind_follows_categorical_hint() {
        let registry = VariableRegistry::builtin().unwrap();
        assert_eq!(palette_kind(registry.get("radar_ptype").unwrap()), PaletteKind::Discrete);
        assert_eq!(palette_kind(registry.get("precip_ptype").unwrap()), PaletteKind::Discrete);
        assert_eq!(palette_kind(registry.get("csnow").unwrap()), PaletteKind::Discrete);
        assert_eq!(palette_kind(registry.get("tmp2m").unwrap()), PaletteKind::Continuous);
        assert_eq!(palette_kind(registry.get("wspd10m").unwrap()), PaletteKind::Continuous);
    }

    #[test]
    fn test_resampling_per_kind() {
        let policy = EncodingPolicy::default();
        assert_eq!(policy.resampling_for(PaletteKind::Discrete), Resampling::Nearest);
        assert!(policy.resampling_for(PaletteKind::Continuous).is_smooth());

        let cubic = policy.with_continuous_resampling(Resampling::Cubic).unwrap();
        assert_eq!(cubic.resampling_for(PaletteKind::Continuous), Resampling::Cubic);
        assert_eq!(cubic.resampling_for(PaletteKind::Discrete), Resampling::Nearest);
    }

    #[test]
    fn test_nearest_rejected_for_continuous() {
        let err = EncodingPolicy::default()
            .with_continuous_resampling(Resampling::Nearest)
            .unwrap_err();
        assert!(matches!(err, EncodingError::InvalidPolicy(_)));
    }

    #[test]
    fn test_default_overview_levels() {
        assert_eq!(EncodingPolicy::default().overview_levels(), &[2, 4, 8, 16, 32, 64]);
    }
}
