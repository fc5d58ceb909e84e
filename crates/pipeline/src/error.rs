//! Error types for the pipeline.

use thiserror::Error;

use encoding::EncodingError;
use ingestion::IngestionError;
use storage::StoreError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Ingestion(#[from] IngestionError),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Upstream not ready for {model}/{run}/{var} f{fhr:03}: {reason}")]
    NotReady {
        model: String,
        run: String,
        var: String,
        fhr: u32,
        reason: String,
    },

    #[error("Worker task failed: {0}")]
    Worker(String),
}

impl PipelineError {
    /// Get the HTTP status code for this error.
    pub fn http_status_code(&self) -> u16 {
        match self {
            PipelineError::Ingestion(e) => e.http_status_code(),
            PipelineError::Encoding(e) => e.http_status_code(),
            PipelineError::Store(e) => e.http_status_code(),
            PipelineError::NotReady { .. } => 503,
            PipelineError::Worker(_) => 500,
        }
    }

    /// Whether the failure concerns one frame only.
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            PipelineError::Encoding(_)
                | PipelineError::NotReady { .. }
                | PipelineError::Ingestion(IngestionError::Decode { .. })
                | PipelineError::Ingestion(IngestionError::Derivation { .. })
        )
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(e: tokio::task::JoinError) -> Self {
        PipelineError::Worker(e.to_string())
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
