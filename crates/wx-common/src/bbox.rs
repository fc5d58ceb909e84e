//! Geographic bounding boxes and named output regions.

use serde::{Deserialize, Serialize};

use crate::error::{WxError, WxResult};
use crate::ids::validate_segment;

/// A geographic bounding box in degrees (EPSG:4326).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    /// Create a new bounding box from corner coordinates.
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Width of the bounding box in coordinate units.
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    /// Height of the bounding box in coordinate units.
    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// A box is usable as a raster extent only if it has positive area and
    /// finite corners.
    pub fn is_valid(&self) -> bool {
        [self.min_x, self.min_y, self.max_x, self.max_y]
            .iter()
            .all(|v| v.is_finite())
            && self.width() > 0.0
            && self.height() > 0.0
    }

    /// Check if this bbox intersects another.
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x < other.max_x
            && self.max_x > other.min_x
            && self.min_y < other.max_y
            && self.max_y > other.min_y
    }
}

/// A named output region: the extent frames are reprojected into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub id: String,
    pub bounds: BoundingBox,
}

impl Region {
    pub fn new(id: impl Into<String>, bounds: BoundingBox) -> WxResult<Self> {
        let id = id.into();
        validate_segment(&id)?;
        if !bounds.is_valid() {
            return Err(WxError::InternalError(format!(
                "region '{}' has degenerate bounds {:?}",
                id, bounds
            )));
        }
        Ok(Self { id, bounds })
    }

    /// Continental United States.
    pub fn conus() -> Self {
        Self {
            id: "conus".to_string(),
            bounds: BoundingBox::new(-134.0, 21.0, -60.0, 53.0),
        }
    }

    /// Whole globe.
    pub fn global() -> Self {
        Self {
            id: "global".to_string(),
            bounds: BoundingBox::new(-180.0, -90.0, 180.0, 90.0),
        }
    }

    /// Look up a built-in region by id.
    pub fn builtin(id: &str) -> Option<Self> {
        match id {
            "conus" => Some(Self::conus()),
            "global" => Some(Self::global()),
            _ => None,
        }
    }
}
