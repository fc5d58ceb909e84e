//! Error types for the ingestion crate.

use thiserror::Error;

use crate::decoder::DecodeError;
use crate::providers::UpstreamError;

/// Errors that can occur during acquisition and derivation.
///
/// "Upstream not ready" is deliberately absent: it is reported through
/// [`crate::FetchResult::not_ready_reason`] instead of an error.
#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Unknown variable '{variable}' for model {model}")]
    UnknownVariable { model: String, variable: String },

    #[error("Variable '{variable}' is not available for model {model}: {reason}")]
    UnsupportedForModel {
        model: String,
        variable: String,
        reason: String,
    },

    #[error("Variable '{variable}' has no data at forecast hour {forecast_hour} for model {model}")]
    UnsupportedForecastHour {
        model: String,
        variable: String,
        forecast_hour: u32,
    },

    #[error("Region '{region}' is outside the {model} domain")]
    RegionOutsideDomain { model: String, region: String },

    #[error("Fatal fetch error from provider '{provider}': {source}")]
    FatalFetch {
        provider: String,
        #[source]
        source: UpstreamError,
    },

    #[error("Failed to decode field '{variable}': {source}")]
    Decode {
        variable: String,
        #[source]
        source: DecodeError,
    },

    #[error("Cannot derive '{variable}': {reason}")]
    Derivation { variable: String, reason: String },

    #[error("Invalid variable configuration: {0}")]
    InvalidConfig(String),

    #[error("Cache I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Id(#[from] wx_common::WxError),

    #[error(transparent)]
    Store(#[from] storage::StoreError),
}

impl IngestionError {
    /// Get the HTTP status code for this error.
    pub fn http_status_code(&self) -> u16 {
        match self {
            IngestionError::UnknownModel(_) | IngestionError::UnknownVariable { .. } => 404,
            IngestionError::UnsupportedForModel { .. }
            | IngestionError::UnsupportedForecastHour { .. }
            | IngestionError::RegionOutsideDomain { .. } => 400,
            IngestionError::Id(e) => e.http_status_code(),
            IngestionError::Store(e) => e.http_status_code(),
            _ => 500,
        }
    }
}

/// Result type for ingestion operations.
pub type Result<T> = std::result::Result<T, IngestionError>;
