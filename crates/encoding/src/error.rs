//! Error types for raster encoding.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// What a raster engine reports when an operation fails.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineFault {
    /// The overview builder cannot carry an internal mask band.
    #[error("internal mask overviews are not supported")]
    MaskUnsupported,

    /// The band already has an overview set.
    #[error("band {band} already has overviews")]
    OverviewConflict { band: usize },

    #[error("{0}")]
    Failed(String),
}

/// Errors that abort encoding of a single frame.
#[derive(Error, Debug)]
pub enum EncodingError {
    #[error("Invalid target bounds: {0}")]
    InvalidBounds(String),

    #[error("Target region '{region}' does not overlap the source grid")]
    OutsideSource { region: String },

    #[error("Unsupported band layout: {bands} bands")]
    UnsupportedBandLayout { bands: usize },

    #[error("Invalid encoding policy: {0}")]
    InvalidPolicy(String),

    #[error("Raster engine {op} failed for {}: {fault}", path.display())]
    Engine {
        op: &'static str,
        path: PathBuf,
        fault: EngineFault,
    },

    #[error("Overview validation failed for {}: {detail}", path.display())]
    OverviewValidation { path: PathBuf, detail: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed raster {}: {detail}", path.display())]
    Format { path: PathBuf, detail: String },
}

impl EncodingError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| EncodingError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn engine(op: &'static str, path: &Path, fault: EngineFault) -> Self {
        EncodingError::Engine {
            op,
            path: path.to_path_buf(),
            fault,
        }
    }

    /// The engine fault, if this error came from the raster engine.
    pub fn fault(&self) -> Option<&EngineFault> {
        match self {
            EncodingError::Engine { fault, .. } => Some(fault),
            _ => None,
        }
    }

    /// Get the HTTP status code for this error.
    pub fn http_status_code(&self) -> u16 {
        match self {
            EncodingError::InvalidBounds(_) | EncodingError::OutsideSource { .. } => 400,
            _ => 500,
        }
    }
}

/// Result type for encoding operations.
pub type Result<T> = std::result::Result<T, EncodingError>;
