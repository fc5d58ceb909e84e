//! Weather frame ingester.
//!
//! Polls upstream model output, builds map frames through the staging
//! pipeline and publishes them for the tile and frame servers.

pub mod config;
pub mod scheduler;

pub use config::IngesterConfig;
pub use scheduler::{ModelPlan, ModelReport, Scheduler};
