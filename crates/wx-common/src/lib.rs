//! Common types and utilities shared across the weather tile pipeline.

pub mod bbox;
pub mod clock;
pub mod error;
pub mod ids;
pub mod raster;
pub mod time;

pub use bbox::{BoundingBox, Region};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{WxError, WxResult};
pub use ids::{validate_segment, FrameId, RunId, RunSelector};
pub use raster::{OutputMode, PaletteKind};
pub use time::ValidTime;
