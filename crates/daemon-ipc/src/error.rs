//! IPC error types.

use thiserror::Error;

/// IPC error type.
#[derive(Error, Debug)]
pub enum IpcError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Socket-level error
    #[error("Socket error: {0}")]
    Socket(String),

    /// The server refused the handshake.
    #[error("handshake rejected: {0:?}")]
    HandshakeRejected(crate::StatusCode),
}

/// Result type alias using IpcError.
pub type IpcResult<T> = Result<T, IpcError>;
