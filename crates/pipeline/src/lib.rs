//! Staging and publish orchestration.
//!
//! A [`Pipeline`] turns a (model, run, variable, forecast hour) request into
//! a staged frame: the acquisition engine fetches the upstream fields, the
//! decoder and derivation produce one field, the frame encoder writes the
//! tile, and the staging area records it. Completed variables are promoted
//! by the publisher, and retention keeps the store bounded.

pub mod build;
pub mod error;
pub mod orchestrator;
pub mod retention;
pub mod stage;

pub use build::BuildReport;
pub use error::{PipelineError, Result};
pub use orchestrator::{Pipeline, PipelineConfig};
pub use retention::RetentionReport;
pub use stage::{StageOutcome, StagedFrame};
