//! Session and process error types.

use daemon_auth::AuthError;
use daemon_registry::RegistryError;
use keychain_db::DbError;
use thiserror::Error;

/// Session error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Handle lookup failed (unknown, dead, or wrong type).
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Authorization subsystem failure.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Keychain subsystem failure.
    #[error(transparent)]
    Db(#[from] DbError),

    /// Protocol sentinel matched neither byte order.
    #[error("protocol version sentinel not recognized")]
    IncompatibleVersion,

    /// Code signature unavailable and required.
    #[error("client code identity could not be established")]
    InsufficientClientIdentification,

    /// Caller is not the session originator (or the session is already set
    /// up).
    #[error("caller may not configure this session")]
    SessionAuthorizationDenied,

    /// Queried a session value before it was set.
    #[error("session value not set")]
    ValueNotSet,

    /// Attempt to set non-settable session attribute bits.
    #[error("invalid session attributes")]
    InvalidAttributes,

    /// No session is registered under this service port.
    #[error("no session for port {0}")]
    NoSuchSession(u32),

    /// Agent host could not be launched.
    #[error("agent launch failed: {0}")]
    AgentLaunch(String),
}

/// Result type alias using SessionError.
pub type SessionResult<T> = Result<T, SessionError>;
