//! Registry error types.

use crate::Handle;
use thiserror::Error;

/// Registry error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Handle is unknown, refers to a dead object, or names the wrong type.
    #[error("invalid handle: {0}")]
    InvalidHandle(Handle),
}

/// Result type alias using RegistryError.
pub type RegistryResult<T> = Result<T, RegistryError>;
