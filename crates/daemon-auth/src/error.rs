//! Authorization error types.

use daemon_registry::RegistryError;
use thiserror::Error;

/// Authorization error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Handle lookup failed (unknown, dead, or wrong type).
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Credential set does not satisfy the requested rights.
    #[error("credential set does not satisfy requested rights")]
    InvalidCredentials,

    /// Policy refused to externalize the token.
    #[error("token externalization denied")]
    ExternalizeDenied,

    /// Policy refused to internalize the token.
    #[error("token internalization denied")]
    InternalizeDenied,

    /// The calling process does not reference this authorization.
    #[error("process does not reference this authorization")]
    InvalidTokenRef,

    /// The authorization database has no rule under this name.
    #[error("no such rule: {0}")]
    UnknownRule(String),
}

/// Result type alias using AuthError.
pub type AuthResult<T> = Result<T, AuthError>;
