//! Error types and handling.

use thiserror::Error;

use crate::zk::ZkError;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Store operation failed after retries
    #[error("Storage error: {0}")]
    Storage(#[from] sea_orm::DbErr),

    /// Device protocol or network failure
    #[error("Device error: {0}")]
    Device(#[from] ZkError),

    /// Backend transport failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Backend rejected an upload
    #[error("Upload rejected: {0}")]
    Upload(String),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(String),

    /// File I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for AppError
pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Create a config error with message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an upload error with message
    pub fn upload(msg: impl Into<String>) -> Self {
        Self::Upload(msg.into())
    }
}
