//! Monitor error types.

use daemon_registry::RegistryError;
use thiserror::Error;

/// Smartcard monitor error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MonitorError {
    /// Handle lookup failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The smartcard layer reported a failure.
    #[error("pcsc layer error: {0}")]
    Pcsc(String),

    /// The helper daemon could not be launched.
    #[error("helper launch failed: {0}")]
    Launch(String),

    /// Internal child automaton misuse.
    #[error("invalid helper state transition: {0}")]
    InvalidStateTransition(String),
}

/// Result type alias using MonitorError.
pub type MonitorResult<T> = Result<T, MonitorError>;
