//! The wire-level status taxonomy.
//!
//! Every daemon error is mapped into one of these codes before crossing the
//! request port; nothing else leaks to clients.

use daemon_auth::AuthError;
use daemon_registry::RegistryError;
use daemon_sessions::SessionError;
use keychain_db::DbError;
use serde::{Deserialize, Serialize};

/// Status of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Ok,
    /// Handle not in the registry or object is killed.
    InvalidHandle,
    /// Protocol sentinel matched neither byte order.
    IncompatibleVersion,
    /// Code signature unavailable and required.
    InsufficientClientIdentification,
    /// Passphrase wrong after the allowed attempts.
    AuthenticationFailed,
    /// Operation requires an unlocked container.
    Locked,
    /// Credential set does not satisfy the requested rights.
    InvalidCredentials,
    /// Policy refused token externalization.
    ExternalizeDenied,
    /// Policy refused token internalization.
    InternalizeDenied,
    /// Caller is not the session originator.
    SessionAuthorizationDenied,
    /// Queried value has not been set.
    ValueNotSet,
    /// Attempt to set non-settable session attribute bits.
    InvalidAttributes,
    /// Collaborator returned a retryable status.
    Transient,
    /// Malformed request or parameters.
    InvalidRequest,
    /// Unknown method.
    MethodNotFound,
    /// Unclassified daemon-side failure.
    Internal,
}

impl StatusCode {
    pub fn is_ok(&self) -> bool {
        *self == StatusCode::Ok
    }
}

impl From<&RegistryError> for StatusCode {
    fn from(error: &RegistryError) -> Self {
        match error {
            RegistryError::InvalidHandle(_) => StatusCode::InvalidHandle,
        }
    }
}

impl From<&AuthError> for StatusCode {
    fn from(error: &AuthError) -> Self {
        match error {
            AuthError::Registry(inner) => inner.into(),
            AuthError::InvalidCredentials => StatusCode::InvalidCredentials,
            AuthError::ExternalizeDenied => StatusCode::ExternalizeDenied,
            AuthError::InternalizeDenied => StatusCode::InternalizeDenied,
            AuthError::InvalidTokenRef => StatusCode::InvalidHandle,
            AuthError::UnknownRule(_) => StatusCode::InvalidRequest,
        }
    }
}

impl From<&DbError> for StatusCode {
    fn from(error: &DbError) -> Self {
        match error {
            DbError::Registry(inner) => inner.into(),
            DbError::Crypto(_) => StatusCode::Internal,
            DbError::Locked => StatusCode::Locked,
            DbError::InvalidPassphrase => StatusCode::AuthenticationFailed,
            DbError::AuthenticationFailed => StatusCode::AuthenticationFailed,
            DbError::MalformedBlob(_) => StatusCode::InvalidRequest,
            DbError::AclDenied => StatusCode::InvalidCredentials,
            DbError::InvalidStateTransition(_) => StatusCode::Internal,
        }
    }
}

impl From<&SessionError> for StatusCode {
    fn from(error: &SessionError) -> Self {
        match error {
            SessionError::Registry(inner) => inner.into(),
            SessionError::Auth(inner) => inner.into(),
            SessionError::Db(inner) => inner.into(),
            SessionError::IncompatibleVersion => StatusCode::IncompatibleVersion,
            SessionError::InsufficientClientIdentification => {
                StatusCode::InsufficientClientIdentification
            }
            SessionError::SessionAuthorizationDenied => StatusCode::SessionAuthorizationDenied,
            SessionError::ValueNotSet => StatusCode::ValueNotSet,
            SessionError::InvalidAttributes => StatusCode::InvalidAttributes,
            SessionError::NoSuchSession(_) => StatusCode::InvalidHandle,
            SessionError::AgentLaunch(_) => StatusCode::Transient,
        }
    }
}
