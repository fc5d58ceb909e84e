//! Error types for the store.

use std::path::{Path, PathBuf};

use thiserror::Error;
use wx_common::WxError;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Publish gate not met for {model}/{run}/{var}: {staged} staged, {gate} required")]
    GateNotMet {
        model: String,
        run: String,
        var: String,
        staged: usize,
        gate: usize,
    },

    #[error("Manifest contract violation: {0}")]
    ContractViolation(String),

    #[error("No rollback snapshot for model {0}")]
    NoRollbackSnapshot(String),

    #[error(transparent)]
    Lookup(#[from] WxError),
}

impl StoreError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
        move |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn json(path: &Path) -> impl FnOnce(serde_json::Error) -> StoreError + '_ {
        move |source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether the error means "nothing there" rather than a broken store.
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::Io { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            StoreError::Lookup(e) => e.http_status_code() == 404,
            _ => false,
        }
    }

    /// Get the HTTP status code for this error.
    pub fn http_status_code(&self) -> u16 {
        match self {
            StoreError::Lookup(e) => e.http_status_code(),
            StoreError::GateNotMet { .. } => 409,
            _ if self.is_not_found() => 404,
            _ => 500,
        }
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let missing = StoreError::Io {
            path: "x".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(missing.is_not_found());
        assert_eq!(missing.http_status_code(), 404);
        assert_eq!(
            StoreError::Lookup(WxError::InvalidSegment("A".into())).http_status_code(),
            400
        );
        assert_eq!(StoreError::ContractViolation("x".into()).http_status_code(), 500);
    }
}
