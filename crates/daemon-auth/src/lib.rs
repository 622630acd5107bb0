//! Credentials, authorization tokens, and the rights authority seam.
//!
//! An authorization token is a capability bundle: the credentials it has
//! accumulated, audit context, and the multiset of client processes that
//! currently reference it. Tokens live in a session; the rights decisions
//! themselves are delegated to an [`Authority`] implementation.

mod authority;
mod credential;
mod error;
mod token;

pub use authority::{AuthItem, AuthRule, Authority, AuthorityDecision, LocalAuthority};
pub use credential::{Credential, CredentialSet};
pub use error::{AuthError, AuthResult};
pub use token::{AuditInfo, AuthFlags, AuthorizationToken};
