//! Keychain error types.

use daemon_registry::RegistryError;
use keychain_crypto::CryptoError;
use thiserror::Error;

/// Keychain error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    /// Handle lookup failed (unknown, dead, or wrong type).
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Cryptographic operation failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Operation requires an unlocked container.
    #[error("keychain is locked")]
    Locked,

    /// Supplied passphrase does not match the container.
    #[error("invalid passphrase")]
    InvalidPassphrase,

    /// Too many failed passphrase attempts for one unlock request.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// The blob image cannot be parsed.
    #[error("malformed keychain blob: {0}")]
    MalformedBlob(String),

    /// The container's access-control list refused the operation.
    #[error("access denied by keychain ACL")]
    AclDenied,

    /// Internal lock automaton misuse.
    #[error("invalid lock state transition: {0}")]
    InvalidStateTransition(String),
}

/// Result type alias using DbError.
pub type DbResult<T> = Result<T, DbError>;
