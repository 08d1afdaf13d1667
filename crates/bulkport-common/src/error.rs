//! Error types shared across the workspace

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised by the shared utilities
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid resource path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Invalid byte size '{0}'")]
    InvalidSize(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CommonError {
    pub(crate) fn invalid_path(path: &str, reason: impl Into<String>) -> Self {
        CommonError::InvalidPath {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}
