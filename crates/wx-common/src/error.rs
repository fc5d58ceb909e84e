//! Error types for weather tile services.

use thiserror::Error;

/// Result type alias using WxError.
pub type WxResult<T> = Result<T, WxError>;

/// Primary error type for identifier parsing and read-side lookups.
#[derive(Debug, Error)]
pub enum WxError {
    // === Request Errors ===
    #[error("Invalid path segment '{0}': expected [a-z0-9_-]+")]
    InvalidSegment(String),

    #[error("Invalid run id '{0}': expected YYYYMMDD_HHz")]
    InvalidRunId(String),

    #[error("Invalid frame id '{0}': expected a zero-padded 3-digit forecast hour")]
    InvalidFrameId(String),

    #[error("Forecast hour {0} is out of range (0-999)")]
    ForecastHourOutOfRange(u32),

    // === Lookup Errors ===
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Run not found: {model}/{run}")]
    RunNotFound { model: String, run: String },

    #[error("Variable not found: {model}/{run}/{var}")]
    VariableNotFound {
        model: String,
        run: String,
        var: String,
    },

    // === Infrastructure Errors ===
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl WxError {
    /// Get the HTTP status code for this error.
    pub fn http_status_code(&self) -> u16 {
        match self {
            WxError::InvalidSegment(_)
            | WxError::InvalidRunId(_)
            | WxError::InvalidFrameId(_)
            | WxError::ForecastHourOutOfRange(_) => 400,

            WxError::ModelNotFound(_)
            | WxError::RunNotFound { .. }
            | WxError::VariableNotFound { .. } => 404,

            WxError::InternalError(_) => 500,
        }
    }
}

impl From<std::io::Error> for WxError {
    fn from(err: std::io::Error) -> Self {
        WxError::InternalError(err.to_string())
    }
}

impl From<serde_json::Error> for WxError {
    fn from(err: serde_json::Error) -> Self {
        WxError::InternalError(format!("JSON error: {}", err))
    }
}
