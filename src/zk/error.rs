//! ZK protocol error types.

use thiserror::Error;

/// Errors that can occur during ZK protocol communication.
#[derive(Error, Debug)]
pub enum ZkError {
    /// Socket-level failure (connect, send, recv).
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Device did not answer within the hard timeout.
    #[error("timeout waiting for device response")]
    Timeout,

    /// Device rejected the communication password.
    #[error("device rejected password")]
    Unauthenticated,

    /// Bad magic, bad checksum, truncated frame, or unexpected command code.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Operation attempted without an established session.
    #[error("device not connected")]
    NotConnected,
}

impl ZkError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

/// Result type for ZK protocol operations.
pub type Result<T> = std::result::Result<T, ZkError>;
