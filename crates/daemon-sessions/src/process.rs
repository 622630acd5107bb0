//! Client processes.

use crate::server::Server;
use crate::session::SessionRole;
use crate::{Port, SessionError, SessionResult};
use daemon_auth::{AuthError, AuthorizationToken};
use daemon_registry::{DaemonObject, Handle, ObjectCore, Registry};
use keychain_db::TempDatabase;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};

/// The request-protocol version sentinel. A client sends this in its setup
/// frame; a byte-swapped match means the client runs with opposite
/// endianness and its wire words need flipping.
pub const PROTOCOL_VERSION: u32 = 0x0003_0001;

/// The client's setup frame, sent once per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSetupInfo {
    pub version: u32,
}

/// The kernel task identity backing a client process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskRef(u32);

impl TaskRef {
    pub fn from_raw(raw: u32) -> Self {
        TaskRef(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task:{}", self.0)
    }
}

/// Progress of client code identification. `Deferred` moves to `Known` or
/// `Unknown` at most once; both end states are final.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientIdent {
    Deferred,
    Known(Vec<u8>),
    Unknown,
}

/// Computes a client's code signature from its identity string.
///
/// The real verifier is an external collaborator; this seam keeps the
/// daemon testable without one.
pub trait CodeSigner: Send + Sync {
    fn sign(&self, identity: &str) -> Option<Vec<u8>>;
}

/// Digest-of-executable signer: good enough where no platform verifier is
/// wired in.
pub struct FileDigestSigner;

impl CodeSigner for FileDigestSigner {
    fn sign(&self, identity: &str) -> Option<Vec<u8>> {
        let bytes = std::fs::read(identity).ok()?;
        Some(Sha256::digest(&bytes).to_vec())
    }
}

/// One active request running on behalf of a process (external
/// collaborator; interface only).
pub trait Connection: Send + Sync {
    /// The process this request acts for.
    fn process(&self) -> Handle;

    /// Mark the request long-term so the server can spawn replacement
    /// workers while it blocks.
    fn mark_long_term(&self);
}

/// One client process attached to the daemon.
#[derive(Debug)]
pub struct Process {
    core: ObjectCore,
    registry: Weak<Registry>,
    task: TaskRef,
    pid: u32,
    uid: u32,
    gid: u32,
    byte_flipped: bool,
    client_path: Option<String>,
    ident: Mutex<ClientIdent>,
    local_store: Mutex<Option<Arc<TempDatabase>>>,
    /// Token handles this process references; multiset semantics.
    authorizations: Mutex<BTreeMap<Handle, usize>>,
}

impl Process {
    /// Attach a new client process.
    ///
    /// The setup frame's version sentinel decides byte order: an exact
    /// match runs native, a byte-swapped match marks the client flipped,
    /// anything else is `IncompatibleVersion`. The session is found by
    /// service port and must exist.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        server: &Server,
        service_port: Port,
        task: TaskRef,
        setup: &ClientSetupInfo,
        identity: &str,
        pid: u32,
        uid: u32,
        gid: u32,
    ) -> SessionResult<Arc<Self>> {
        let byte_flipped = if setup.version == PROTOCOL_VERSION {
            false
        } else if setup.version.swap_bytes() == PROTOCOL_VERSION {
            true
        } else {
            return Err(SessionError::IncompatibleVersion);
        };

        let session = server.find_session(service_port)?;

        let (client_path, initial_ident) = if identity.is_empty() {
            // No chance to establish a code identity for this client.
            (None, ClientIdent::Unknown)
        } else {
            (Some(identity.to_string()), ClientIdent::Deferred)
        };

        let registry = server.registry();
        let process = registry.register(|handle| {
            Arc::new(Self {
                core: ObjectCore::new(handle),
                registry: Arc::downgrade(registry),
                task,
                pid,
                uid,
                gid,
                byte_flipped,
                client_path,
                ident: Mutex::new(initial_ident),
                local_store: Mutex::new(None),
                authorizations: Mutex::new(BTreeMap::new()),
            })
        });
        registry.adopt(session.base().handle(), process.handle())?;

        info!(
            process = %process.handle(),
            pid,
            uid,
            gid,
            session = %session.base().handle(),
            byte_flipped,
            client = identity,
            "process attached"
        );
        Ok(process)
    }

    pub fn handle(&self) -> Handle {
        self.core.handle()
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    pub fn task(&self) -> TaskRef {
        self.task
    }

    pub fn byte_flipped(&self) -> bool {
        self.byte_flipped
    }

    /// The session this process currently belongs to.
    pub fn session_handle(&self) -> SessionResult<Handle> {
        self.core
            .parent()
            .ok_or_else(|| SessionError::Registry(daemon_registry::RegistryError::InvalidHandle(
                self.handle(),
            )))
    }

    /// Current identification state.
    pub fn client_ident(&self) -> ClientIdent {
        self.ident.lock().unwrap().clone()
    }

    /// The client's code signature, computed on first use.
    ///
    /// `Deferred` transitions to `Known` on success or `Unknown` on
    /// failure; both are final, and `Unknown` always fails.
    pub fn code_signature(&self, signer: &dyn CodeSigner) -> SessionResult<Vec<u8>> {
        let mut ident = self.ident.lock().unwrap();
        match &*ident {
            ClientIdent::Known(signature) => Ok(signature.clone()),
            ClientIdent::Unknown => Err(SessionError::InsufficientClientIdentification),
            ClientIdent::Deferred => {
                let path = self.client_path.as_deref().unwrap_or_default();
                match signer.sign(path) {
                    Some(signature) => {
                        debug!(process = %self.handle(), "client code signature computed");
                        *ident = ClientIdent::Known(signature.clone());
                        Ok(signature)
                    }
                    None => {
                        debug!(process = %self.handle(), "no code signature; client is anonymous");
                        *ident = ClientIdent::Unknown;
                        Err(SessionError::InsufficientClientIdentification)
                    }
                }
            }
        }
    }

    /// The per-process scratch database, created on first use.
    pub fn local_store(&self) -> SessionResult<Arc<TempDatabase>> {
        let mut store = self.local_store.lock().unwrap();
        if let Some(existing) = store.as_ref() {
            return Ok(existing.clone());
        }
        let registry = self.registry.upgrade().ok_or_else(|| {
            SessionError::Registry(daemon_registry::RegistryError::InvalidHandle(self.handle()))
        })?;
        let created = TempDatabase::create(&registry, self.handle())?;
        *store = Some(created.clone());
        Ok(created)
    }

    /// Record one reference to `token`.
    pub fn add_authorization(&self, token: &Arc<AuthorizationToken>) -> SessionResult<()> {
        let mut authorizations = self.authorizations.lock().unwrap();
        token.add_process(self.handle())?;
        *authorizations.entry(token.handle()).or_insert(0) += 1;
        Ok(())
    }

    /// Verify this process references `token`.
    pub fn check_authorization(&self, token: &Arc<AuthorizationToken>) -> SessionResult<()> {
        let authorizations = self.authorizations.lock().unwrap();
        if authorizations.contains_key(&token.handle()) {
            Ok(())
        } else {
            Err(AuthError::InvalidTokenRef.into())
        }
    }

    /// Release one reference to `token`.
    ///
    /// Returns true iff the token's owner multiset emptied and the caller
    /// must destroy it. Removing a token this process does not reference
    /// fails loudly.
    pub fn remove_authorization(
        &self,
        token: &Arc<AuthorizationToken>,
    ) -> SessionResult<bool> {
        let mut authorizations = self.authorizations.lock().unwrap();
        let Some(count) = authorizations.get_mut(&token.handle()) else {
            warn!(
                process = %self.handle(),
                token = %token.handle(),
                "process is missing authorization to remove"
            );
            return Err(AuthError::InvalidTokenRef.into());
        };
        if *count > 1 {
            *count -= 1;
            return Ok(false);
        }
        authorizations.remove(&token.handle());
        Ok(token.end_process(self.handle())?)
    }

    /// Number of references this process holds on `token`.
    pub fn authorization_count(&self, token: Handle) -> usize {
        self.authorizations
            .lock()
            .unwrap()
            .get(&token)
            .copied()
            .unwrap_or(0)
    }

    /// Re-parent this process to the session answering on `port`
    /// (SessionCreate from a running client).
    pub fn change_session(&self, server: &Server, port: Port) -> SessionResult<()> {
        let session = server.find_session(port)?;
        server
            .registry()
            .adopt(session.base().handle(), self.handle())?;
        debug!(process = %self.handle(), session = %session.base().handle(), "process changed session");
        Ok(())
    }
}

impl DaemonObject for Process {
    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn on_kill(&self) {
        // Children (the local store among them) are already dead; drop the
        // reference.
        *self.local_store.lock().unwrap() = None;

        // Release every authorization exactly once per distinct token and
        // destroy tokens whose owner multiset empties.
        let released: Vec<Handle> = {
            let mut authorizations = self.authorizations.lock().unwrap();
            let handles = authorizations.keys().copied().collect();
            authorizations.clear();
            handles
        };
        if released.is_empty() {
            debug!(process = %self.handle(), "process detached");
            return;
        }

        info!(
            process = %self.handle(),
            count = released.len(),
            "process releasing authorizations"
        );
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        for token_handle in released {
            let Ok(token) = registry.lookup::<AuthorizationToken>(token_handle) else {
                continue; // token died first (session teardown)
            };
            let mut destroy = false;
            while token.is_owned_by(self.handle()) {
                match token.end_process(self.handle()) {
                    Ok(last) => destroy = last,
                    Err(_) => break,
                }
            }
            if destroy {
                registry.kill(token.handle());
            }
        }
        // The task reference dies with us.
        debug!(task = %self.task, "task reference destroyed");
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{attach, test_server, FakeAuthority, FakeSigner, PRIMARY_PORT};
    use daemon_auth::{AuditInfo, CredentialSet};

    fn make_process(server: &Server, version: u32) -> SessionResult<Arc<Process>> {
        Process::create(
            server,
            PRIMARY_PORT,
            TaskRef::from_raw(42),
            &ClientSetupInfo { version },
            "/usr/bin/client",
            1234,
            501,
            20,
        )
    }

    #[test]
    fn test_native_byte_order() {
        let server = test_server(Arc::new(FakeAuthority::new()));
        let process = make_process(&server, PROTOCOL_VERSION).unwrap();
        assert!(!process.byte_flipped());
        assert_eq!(process.pid(), 1234);
        assert_eq!(process.uid(), 501);
        assert_eq!(process.gid(), 20);
    }

    #[test]
    fn test_swapped_byte_order() {
        let server = test_server(Arc::new(FakeAuthority::new()));
        let process = make_process(&server, PROTOCOL_VERSION.swap_bytes()).unwrap();
        assert!(process.byte_flipped());
    }

    #[test]
    fn test_unsupported_version_is_rejected() {
        let server = test_server(Arc::new(FakeAuthority::new()));
        assert_eq!(
            make_process(&server, 0xdead_beef).unwrap_err(),
            SessionError::IncompatibleVersion
        );
    }

    #[test]
    fn test_unknown_service_port_is_rejected() {
        let server = test_server(Arc::new(FakeAuthority::new()));
        let result = Process::create(
            &server,
            Port::from_raw(999),
            TaskRef::from_raw(1),
            &ClientSetupInfo {
                version: PROTOCOL_VERSION,
            },
            "",
            1,
            0,
            0,
        );
        assert_eq!(result.unwrap_err(), SessionError::NoSuchSession(999));
    }

    #[test]
    fn test_process_is_child_of_its_session() {
        let server = test_server(Arc::new(FakeAuthority::new()));
        let process = attach(&server, PRIMARY_PORT, 1, 501);
        assert_eq!(
            process.session_handle().unwrap(),
            server.root_session().base().handle()
        );
    }

    #[test]
    fn test_code_signature_deferred_to_known() {
        let server = test_server(Arc::new(FakeAuthority::new()));
        let process = attach(&server, PRIMARY_PORT, 1, 501);
        assert_eq!(process.client_ident(), ClientIdent::Deferred);

        let signature = process
            .code_signature(&FakeSigner(Some(vec![0xAB; 20])))
            .unwrap();
        assert_eq!(signature, vec![0xAB; 20]);
        assert_eq!(process.client_ident(), ClientIdent::Known(vec![0xAB; 20]));

        // Known is final: a now-failing signer does not regress the state.
        let cached = process.code_signature(&FakeSigner(None)).unwrap();
        assert_eq!(cached, vec![0xAB; 20]);
    }

    #[test]
    fn test_code_signature_deferred_to_unknown_is_final() {
        let server = test_server(Arc::new(FakeAuthority::new()));
        let process = attach(&server, PRIMARY_PORT, 1, 501);

        assert_eq!(
            process.code_signature(&FakeSigner(None)).unwrap_err(),
            SessionError::InsufficientClientIdentification
        );
        assert_eq!(process.client_ident(), ClientIdent::Unknown);

        // Unknown is final even if a signature would now be available.
        assert_eq!(
            process
                .code_signature(&FakeSigner(Some(vec![1])))
                .unwrap_err(),
            SessionError::InsufficientClientIdentification
        );
    }

    #[test]
    fn test_empty_identity_is_anonymous_from_the_start() {
        let server = test_server(Arc::new(FakeAuthority::new()));
        let process = Process::create(
            &server,
            PRIMARY_PORT,
            TaskRef::from_raw(9),
            &ClientSetupInfo {
                version: PROTOCOL_VERSION,
            },
            "",
            1,
            501,
            20,
        )
        .unwrap();
        assert_eq!(process.client_ident(), ClientIdent::Unknown);
    }

    #[test]
    fn test_local_store_is_lazy_and_stable() {
        let server = test_server(Arc::new(FakeAuthority::new()));
        let process = attach(&server, PRIMARY_PORT, 1, 501);

        let first = process.local_store().unwrap();
        let second = process.local_store().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        // The store is a child of the process and dies with it.
        assert_eq!(first.core().parent(), Some(process.handle()));
        server.registry().kill(process.handle());
        assert!(first.core().is_dead());
    }

    #[test]
    fn test_authorization_multiset() {
        let server = test_server(Arc::new(FakeAuthority::new()));
        let process = attach(&server, PRIMARY_PORT, 1, 501);
        let token = daemon_auth::AuthorizationToken::create(
            server.registry(),
            server.root_session().base().handle(),
            CredentialSet::new(),
            AuditInfo { pid: 1, uid: 501 },
        )
        .unwrap();

        process.add_authorization(&token).unwrap();
        process.add_authorization(&token).unwrap();
        assert_eq!(process.authorization_count(token.handle()), 2);
        process.check_authorization(&token).unwrap();

        // First release keeps the reference alive.
        assert!(!process.remove_authorization(&token).unwrap());
        assert_eq!(process.authorization_count(token.handle()), 1);

        // Second release empties the multiset; caller must destroy.
        assert!(process.remove_authorization(&token).unwrap());
        assert_eq!(process.authorization_count(token.handle()), 0);

        // Removing again fails loudly.
        assert!(matches!(
            process.remove_authorization(&token),
            Err(SessionError::Auth(AuthError::InvalidTokenRef))
        ));
    }

    #[test]
    fn test_kill_releases_authorizations_and_destroys_orphans() {
        let server = test_server(Arc::new(FakeAuthority::new()));
        let process = attach(&server, PRIMARY_PORT, 1, 501);
        let token = daemon_auth::AuthorizationToken::create(
            server.registry(),
            server.root_session().base().handle(),
            CredentialSet::new(),
            AuditInfo { pid: 1, uid: 501 },
        )
        .unwrap();

        // Duplicate references collapse to one release at teardown.
        process.add_authorization(&token).unwrap();
        process.add_authorization(&token).unwrap();

        server.registry().kill(process.handle());

        // The process was the only owner, so the token died with it.
        assert!(server.registry().lookup_raw(token.handle()).is_err());
        assert!(token.core().is_dead());
    }

    #[test]
    fn test_kill_spares_tokens_with_other_owners() {
        let server = test_server(Arc::new(FakeAuthority::new()));
        let first = attach(&server, PRIMARY_PORT, 1, 501);
        let second = attach(&server, PRIMARY_PORT, 2, 501);
        let token = daemon_auth::AuthorizationToken::create(
            server.registry(),
            server.root_session().base().handle(),
            CredentialSet::new(),
            AuditInfo { pid: 1, uid: 501 },
        )
        .unwrap();

        first.add_authorization(&token).unwrap();
        second.add_authorization(&token).unwrap();

        server.registry().kill(first.handle());

        // Still owned by the second process.
        assert!(server.registry().lookup_raw(token.handle()).is_ok());
        assert!(token.is_owned_by(second.handle()));
        assert!(!token.is_owned_by(first.handle()));
    }

    #[test]
    fn test_change_session() {
        let server = test_server(Arc::new(FakeAuthority::new()));
        let process = attach(&server, PRIMARY_PORT, 1, 501);
        let session = server
            .create_dynamic_session(&process, Port::from_raw(5))
            .unwrap();

        process.change_session(&server, Port::from_raw(5)).unwrap();
        assert_eq!(process.session_handle().unwrap(), session.base().handle());

        assert_eq!(
            process
                .change_session(&server, Port::from_raw(404))
                .unwrap_err(),
            SessionError::NoSuchSession(404)
        );
    }
}
