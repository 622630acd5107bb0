//! Authorization tokens.

use crate::{AuthError, AuthItem, AuthResult, CredentialSet};
use daemon_registry::{DaemonObject, Handle, ObjectCore, Registry, RegistryError};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::ops::BitOr;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Authorization request flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthFlags(u32);

impl AuthFlags {
    pub const NONE: AuthFlags = AuthFlags(0);
    /// The daemon may prompt the user through the agent.
    pub const INTERACTION_ALLOWED: AuthFlags = AuthFlags(1 << 0);
    /// Newly established credentials extend the session's shared pool.
    pub const EXTEND_RIGHTS: AuthFlags = AuthFlags(1 << 1);
    /// A partial grant is acceptable; do not fail on the first denied right.
    pub const PARTIAL_RIGHTS: AuthFlags = AuthFlags(1 << 2);
    /// Invalidate the shared credentials the token holds.
    pub const DESTROY_RIGHTS: AuthFlags = AuthFlags(1 << 3);

    pub fn contains(&self, other: AuthFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        AuthFlags(bits)
    }
}

impl BitOr for AuthFlags {
    type Output = AuthFlags;

    fn bitor(self, rhs: AuthFlags) -> AuthFlags {
        AuthFlags(self.0 | rhs.0)
    }
}

/// Audit context captured when a token is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditInfo {
    pub pid: u32,
    pub uid: u32,
}

#[derive(Default)]
struct TokenState {
    credentials: CredentialSet,
    /// Owning processes; a process may reference the token more than once.
    owners: BTreeMap<Handle, usize>,
    /// Context info attached by the authority, grouped by tag.
    info: BTreeMap<String, Vec<AuthItem>>,
}

/// A capability bundle: credentials, audit context, and the processes that
/// reference it.
///
/// Tokens are owned by their session (they die no later than it) and carry a
/// multiset of owning-process handles. The token must be destroyed by its
/// caller once [`end_process`](AuthorizationToken::end_process) reports the
/// multiset empty.
pub struct AuthorizationToken {
    core: ObjectCore,
    session: Handle,
    creator_uid: u32,
    audit: AuditInfo,
    state: Mutex<TokenState>,
}

impl AuthorizationToken {
    /// Create a token in `session`, register its handle, and link it under
    /// the session in the object tree.
    pub fn create(
        registry: &Registry,
        session: Handle,
        initial_creds: CredentialSet,
        audit: AuditInfo,
    ) -> AuthResult<Arc<Self>> {
        let token = registry.register(|handle| {
            Arc::new(Self {
                core: ObjectCore::new(handle),
                session,
                creator_uid: audit.uid,
                audit,
                state: Mutex::new(TokenState {
                    credentials: initial_creds,
                    ..TokenState::default()
                }),
            })
        });
        registry.adopt(session, token.handle())?;
        debug!(token = %token.handle(), session = %session, "authorization created");
        Ok(token)
    }

    pub fn handle(&self) -> Handle {
        self.core.handle()
    }

    /// The session this token lives in.
    pub fn session(&self) -> Handle {
        self.session
    }

    /// The uid of the process that created the token.
    pub fn creator_uid(&self) -> u32 {
        self.creator_uid
    }

    pub fn audit(&self) -> AuditInfo {
        self.audit
    }

    fn check_alive(&self) -> AuthResult<()> {
        if self.core.is_dead() {
            Err(AuthError::Registry(RegistryError::InvalidHandle(
                self.handle(),
            )))
        } else {
            Ok(())
        }
    }

    /// Record one more reference from `process`.
    pub fn add_process(&self, process: Handle) -> AuthResult<()> {
        self.check_alive()?;
        let mut state = self.state.lock().unwrap();
        *state.owners.entry(process).or_insert(0) += 1;
        Ok(())
    }

    /// Release one reference from `process`.
    ///
    /// Returns true iff the owner multiset became empty; the caller must
    /// then destroy the token. This remains callable on a killed token so
    /// that process teardown can release references regardless of teardown
    /// order.
    pub fn end_process(&self, process: Handle) -> AuthResult<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(count) = state.owners.get_mut(&process) else {
            return Err(AuthError::InvalidTokenRef);
        };
        if *count > 1 {
            *count -= 1;
            return Ok(false);
        }
        state.owners.remove(&process);
        Ok(state.owners.is_empty())
    }

    /// Whether `process` currently references this token.
    pub fn is_owned_by(&self, process: Handle) -> bool {
        self.state.lock().unwrap().owners.contains_key(&process)
    }

    /// Total number of process references (multiset cardinality).
    pub fn owner_count(&self) -> usize {
        self.state.lock().unwrap().owners.values().sum()
    }

    /// Merge credentials into the token's set (all-or-nothing).
    pub fn merge_credentials(&self, incoming: &CredentialSet) -> AuthResult<()> {
        self.check_alive()?;
        let mut state = self.state.lock().unwrap();
        state.credentials.merge(incoming);
        Ok(())
    }

    /// Snapshot of the token's current credentials.
    pub fn effective_creds(&self) -> CredentialSet {
        self.state.lock().unwrap().credentials.clone()
    }

    /// Invalidate every shared credential the token holds.
    pub fn invalidate_shared_credentials(&self) {
        let state = self.state.lock().unwrap();
        for cred in state.credentials.iter() {
            if cred.is_shared() {
                cred.invalidate();
            }
        }
    }

    /// Attach context info under a tag, replacing previous values.
    pub fn set_info(&self, tag: &str, items: Vec<AuthItem>) -> AuthResult<()> {
        self.check_alive()?;
        let mut state = self.state.lock().unwrap();
        state.info.insert(tag.to_string(), items);
        Ok(())
    }

    /// Context info for `tag`, or everything when no tag is given.
    pub fn info_set(&self, tag: Option<&str>) -> Vec<AuthItem> {
        let state = self.state.lock().unwrap();
        match tag {
            Some(tag) => state.info.get(tag).cloned().unwrap_or_default(),
            None => state.info.values().flatten().cloned().collect(),
        }
    }

    /// Whether `caller` may externalize this token.
    pub fn may_externalize(&self, caller: Handle) -> bool {
        self.is_owned_by(caller)
    }

    /// Whether a process with `caller_uid` may internalize this token.
    pub fn may_internalize(&self, caller_uid: u32) -> bool {
        caller_uid == self.creator_uid || caller_uid == 0
    }
}

impl DaemonObject for AuthorizationToken {
    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Credential;
    use daemon_registry::Registry;

    struct Root {
        core: ObjectCore,
    }

    impl DaemonObject for Root {
        fn core(&self) -> &ObjectCore {
            &self.core
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    fn setup() -> (Arc<Registry>, Handle) {
        let registry = Registry::new();
        let session = registry.register(|handle| {
            Arc::new(Root {
                core: ObjectCore::new(handle),
            })
        });
        (registry.clone(), session.core().handle())
    }

    fn audit() -> AuditInfo {
        AuditInfo { pid: 42, uid: 501 }
    }

    #[test]
    fn test_create_registers_under_session() {
        let (registry, session) = setup();
        let token =
            AuthorizationToken::create(&registry, session, CredentialSet::new(), audit())
                .unwrap();

        assert_eq!(token.session(), session);
        assert_eq!(token.creator_uid(), 501);
        let found = registry
            .lookup::<AuthorizationToken>(token.handle())
            .unwrap();
        assert_eq!(found.handle(), token.handle());
        assert_eq!(
            registry.lookup_raw(session).unwrap().core().children(),
            vec![token.handle()]
        );
    }

    #[test]
    fn test_process_multiset() {
        let (registry, session) = setup();
        let token =
            AuthorizationToken::create(&registry, session, CredentialSet::new(), audit())
                .unwrap();
        let p = Handle::from_raw(77);

        token.add_process(p).unwrap();
        token.add_process(p).unwrap();
        assert_eq!(token.owner_count(), 2);

        assert!(!token.end_process(p).unwrap());
        assert!(token.is_owned_by(p));
        assert!(token.end_process(p).unwrap());
        assert!(!token.is_owned_by(p));
    }

    #[test]
    fn test_end_process_without_reference_fails() {
        let (registry, session) = setup();
        let token =
            AuthorizationToken::create(&registry, session, CredentialSet::new(), audit())
                .unwrap();
        assert_eq!(
            token.end_process(Handle::from_raw(9)).unwrap_err(),
            AuthError::InvalidTokenRef
        );
    }

    #[test]
    fn test_empty_multiset_only_after_all_owners_gone() {
        let (registry, session) = setup();
        let token =
            AuthorizationToken::create(&registry, session, CredentialSet::new(), audit())
                .unwrap();
        let p1 = Handle::from_raw(1);
        let p2 = Handle::from_raw(2);

        token.add_process(p1).unwrap();
        token.add_process(p2).unwrap();
        assert!(!token.end_process(p1).unwrap());
        assert!(token.end_process(p2).unwrap());
    }

    #[test]
    fn test_operations_on_killed_token_fail() {
        let (registry, session) = setup();
        let token =
            AuthorizationToken::create(&registry, session, CredentialSet::new(), audit())
                .unwrap();
        registry.kill(token.handle());

        assert!(matches!(
            token.add_process(Handle::from_raw(1)),
            Err(AuthError::Registry(_))
        ));
        assert!(matches!(
            token.merge_credentials(&CredentialSet::new()),
            Err(AuthError::Registry(_))
        ));
        assert!(matches!(
            token.set_info("tag", vec![]),
            Err(AuthError::Registry(_))
        ));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let (registry, session) = setup();
        let token =
            AuthorizationToken::create(&registry, session, CredentialSet::new(), audit())
                .unwrap();
        let mut incoming = CredentialSet::new();
        incoming.insert(Credential::new(501, "alice", true));

        token.merge_credentials(&incoming).unwrap();
        token.merge_credentials(&incoming).unwrap();
        assert_eq!(token.effective_creds().len(), 1);
    }

    #[test]
    fn test_info_set_by_tag() {
        let (registry, session) = setup();
        let token =
            AuthorizationToken::create(&registry, session, CredentialSet::new(), audit())
                .unwrap();

        token
            .set_info(
                "login",
                vec![AuthItem::new("username", Some("alice".into()))],
            )
            .unwrap();
        token
            .set_info("env", vec![AuthItem::new("shell", Some("/bin/sh".into()))])
            .unwrap();

        assert_eq!(token.info_set(Some("login")).len(), 1);
        assert_eq!(token.info_set(Some("missing")).len(), 0);
        assert_eq!(token.info_set(None).len(), 2);
    }

    #[test]
    fn test_externalize_policy() {
        let (registry, session) = setup();
        let token =
            AuthorizationToken::create(&registry, session, CredentialSet::new(), audit())
                .unwrap();
        let p = Handle::from_raw(5);

        assert!(!token.may_externalize(p));
        token.add_process(p).unwrap();
        assert!(token.may_externalize(p));

        // Internalization: creator uid or root.
        assert!(token.may_internalize(501));
        assert!(token.may_internalize(0));
        assert!(!token.may_internalize(502));
    }

    #[test]
    fn test_destroy_rights_invalidates_only_shared() {
        let (registry, session) = setup();
        let mut creds = CredentialSet::new();
        let shared = Credential::new(501, "alice", true);
        let private = Credential::new(502, "bob", false);
        creds.insert(shared.clone());
        creds.insert(private.clone());

        let token =
            AuthorizationToken::create(&registry, session, creds, audit()).unwrap();
        token.invalidate_shared_credentials();

        assert!(!shared.is_valid());
        assert!(private.is_valid());
    }
}
