//! Authentication sessions.
//!
//! Two variants share the contract: the root session (created at daemon
//! start, eternal) and dynamic sessions (created on demand by a client; the
//! creating process is the *originator* and alone may configure the
//! session). Authorization operations live here because their merge rules
//! touch the session's shared credential pool.

use crate::agent::{AgentInstance, AgentKind};
use crate::process::Process;
use crate::server::Server;
use crate::{Port, SessionAttributes, SessionError, SessionResult};
use daemon_auth::{
    AuditInfo, AuthError, AuthFlags, AuthItem, AuthRule, AuthorizationToken, CredentialSet,
};
use daemon_registry::{DaemonObject, Handle, ObjectCore, Registry};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// The externalized form of an authorization: enough for another process in
/// the same daemon to find and re-bind the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalForm {
    pub token: Handle,
    pub session_port: Port,
}

#[derive(Default)]
struct Agents {
    interface: Option<Arc<dyn AgentInstance>>,
    privileged: Option<Arc<dyn AgentInstance>>,
}

/// State and operations shared by both session variants.
///
/// Three locks with distinct scopes: the object's lifecycle links (in
/// [`ObjectCore`]), the credential pool (`creds`), and the agent hosts
/// (`agents`). Authority calls run with no lock held; merges re-acquire
/// `creds` afterward.
pub struct SessionBase {
    core: ObjectCore,
    service_port: Port,
    attributes: Mutex<SessionAttributes>,
    creds: Mutex<CredentialSet>,
    agents: Mutex<Agents>,
}

impl SessionBase {
    fn new(handle: Handle, service_port: Port, attributes: SessionAttributes) -> Self {
        Self {
            core: ObjectCore::new(handle),
            service_port,
            attributes: Mutex::new(attributes),
            creds: Mutex::new(CredentialSet::new()),
            agents: Mutex::new(Agents::default()),
        }
    }

    pub fn handle(&self) -> Handle {
        self.core.handle()
    }

    pub fn service_port(&self) -> Port {
        self.service_port
    }

    pub fn attributes(&self) -> SessionAttributes {
        *self.attributes.lock().unwrap()
    }

    /// Attributes only accumulate; there is no clear operation.
    pub(crate) fn add_attributes(&self, attrs: SessionAttributes) {
        let mut current = self.attributes.lock().unwrap();
        *current = *current | attrs;
    }

    /// Copy of the shared credential pool (copy-out-then-operate).
    pub fn shared_creds_snapshot(&self) -> CredentialSet {
        self.creds.lock().unwrap().clone()
    }

    /// Merge authority-produced credentials into the shared pool; rewrites
    /// `incoming` so callers merge the pool's own objects into tokens.
    fn merge_shared_credentials(&self, incoming: &mut CredentialSet) {
        self.creds.lock().unwrap().merge_shared(incoming);
    }

    /// Authorize `rights` for `caller`, creating a fresh token.
    ///
    /// The authority runs against a snapshot of the shared pool with no
    /// session lock held. With `EXTEND_RIGHTS` (and not `DESTROY_RIGHTS`),
    /// new credentials flow into both the pool and the token.
    pub fn authorize(
        &self,
        server: &Server,
        caller: &Arc<Process>,
        rights: &[String],
        environment: &[AuthItem],
        flags: AuthFlags,
    ) -> SessionResult<(Handle, Vec<String>)> {
        let audit = AuditInfo {
            pid: caller.pid(),
            uid: caller.uid(),
        };
        let token = AuthorizationToken::create(
            server.registry(),
            self.handle(),
            CredentialSet::new(),
            audit,
        )?;

        let snapshot = self.shared_creds_snapshot();
        let decision = match server
            .authority()
            .authorize(rights, environment, flags, &snapshot, &audit)
        {
            Ok(decision) => decision,
            Err(error) => {
                server.registry().kill(token.handle());
                return Err(error.into());
            }
        };

        let mut new_creds = decision.new_creds;
        if flags.contains(AuthFlags::EXTEND_RIGHTS) && !flags.contains(AuthFlags::DESTROY_RIGHTS)
        {
            self.merge_shared_credentials(&mut new_creds);
            token.merge_credentials(&new_creds)?;
        }

        caller.add_authorization(&token)?;
        debug!(
            token = %token.handle(),
            granted = decision.granted.len(),
            asked = rights.len(),
            "authorization granted"
        );
        Ok((token.handle(), decision.granted))
    }

    /// Release the caller's reference to a token; with `DESTROY_RIGHTS`,
    /// invalidate the shared credentials it holds first.
    pub fn auth_free(
        &self,
        server: &Server,
        caller: &Arc<Process>,
        token_handle: Handle,
        flags: AuthFlags,
    ) -> SessionResult<()> {
        let token = server
            .registry()
            .lookup::<AuthorizationToken>(token_handle)?;
        caller.check_authorization(&token)?;

        if flags.contains(AuthFlags::DESTROY_RIGHTS) {
            token.invalidate_shared_credentials();
        }

        if caller.remove_authorization(&token)? {
            server.registry().kill(token.handle());
        }
        Ok(())
    }

    /// Re-evaluate rights on an existing token (same merge rules as
    /// [`authorize`](Self::authorize)).
    pub fn auth_get_rights(
        &self,
        server: &Server,
        caller: &Arc<Process>,
        token_handle: Handle,
        rights: &[String],
        environment: &[AuthItem],
        flags: AuthFlags,
    ) -> SessionResult<Vec<String>> {
        let token = server
            .registry()
            .lookup::<AuthorizationToken>(token_handle)?;
        caller.check_authorization(&token)?;

        let effective = token.effective_creds();
        let decision =
            server
                .authority()
                .authorize(rights, environment, flags, &effective, &token.audit())?;

        let mut new_creds = decision.new_creds;
        if flags.contains(AuthFlags::EXTEND_RIGHTS) && !flags.contains(AuthFlags::DESTROY_RIGHTS)
        {
            self.merge_shared_credentials(&mut new_creds);
            token.merge_credentials(&new_creds)?;
        }
        Ok(decision.granted)
    }

    /// Context info attached to a token; `None` returns everything.
    pub fn auth_get_info(
        &self,
        server: &Server,
        caller: &Arc<Process>,
        token_handle: Handle,
        tag: Option<&str>,
    ) -> SessionResult<Vec<AuthItem>> {
        let token = server
            .registry()
            .lookup::<AuthorizationToken>(token_handle)?;
        caller.check_authorization(&token)?;
        Ok(token.info_set(tag))
    }

    /// Externalize a token the caller owns.
    pub fn auth_externalize(
        &self,
        server: &Server,
        caller: &Arc<Process>,
        token_handle: Handle,
    ) -> SessionResult<ExternalForm> {
        let token = server
            .registry()
            .lookup::<AuthorizationToken>(token_handle)?;
        caller.check_authorization(&token)?;
        if !token.may_externalize(caller.handle()) {
            return Err(AuthError::ExternalizeDenied.into());
        }
        debug!(token = %token.handle(), "authorization externalized");
        Ok(ExternalForm {
            token: token.handle(),
            session_port: self.service_port,
        })
    }

    /// Re-bind an externalized token to the calling process.
    pub fn auth_internalize(
        &self,
        server: &Server,
        caller: &Arc<Process>,
        form: &ExternalForm,
    ) -> SessionResult<Handle> {
        let token = server.registry().lookup::<AuthorizationToken>(form.token)?;
        if !token.may_internalize(caller.uid()) {
            return Err(AuthError::InternalizeDenied.into());
        }
        caller.add_authorization(&token)?;
        debug!(token = %token.handle(), "authorization internalized");
        Ok(token.handle())
    }

    /// Authorization database read; no token required.
    pub fn authorizationdb_get(&self, server: &Server, name: &str) -> SessionResult<AuthRule> {
        Ok(server.authority().get_rule(name)?)
    }

    /// Authorization database write, on the caller's token credentials.
    pub fn authorizationdb_set(
        &self,
        server: &Server,
        caller: &Arc<Process>,
        token_handle: Handle,
        name: &str,
        rule: AuthRule,
    ) -> SessionResult<()> {
        let token = server
            .registry()
            .lookup::<AuthorizationToken>(token_handle)?;
        caller.check_authorization(&token)?;

        let effective = token.effective_creds();
        let decision = server.authority().set_rule(name, rule, &effective)?;

        let mut new_creds = decision.new_creds;
        self.merge_shared_credentials(&mut new_creds);
        token.merge_credentials(&new_creds)?;
        Ok(())
    }

    /// Authorization database removal, on the caller's token credentials.
    pub fn authorizationdb_remove(
        &self,
        server: &Server,
        caller: &Arc<Process>,
        token_handle: Handle,
        name: &str,
    ) -> SessionResult<()> {
        let token = server
            .registry()
            .lookup::<AuthorizationToken>(token_handle)?;
        caller.check_authorization(&token)?;

        let effective = token.effective_creds();
        let decision = server.authority().remove_rule(name, &effective)?;

        let mut new_creds = decision.new_creds;
        self.merge_shared_credentials(&mut new_creds);
        token.merge_credentials(&new_creds)?;
        Ok(())
    }

    /// A live agent host of the requested flavor, relaunching dead
    /// instances (or unconditionally with `restart`).
    pub fn authhost(
        &self,
        server: &Server,
        kind: AgentKind,
        restart: bool,
    ) -> SessionResult<Arc<dyn AgentInstance>> {
        let mut agents = self.agents.lock().unwrap();
        let slot = match kind {
            AgentKind::Interface => &mut agents.interface,
            AgentKind::Privileged => &mut agents.privileged,
        };

        if restart || slot.as_ref().map_or(true, |agent| !agent.is_alive()) {
            if let Some(old) = slot.take() {
                old.terminate();
            }
            *slot = Some(server.agent_launcher().launch(kind)?);
        }
        Ok(slot.as_ref().expect("agent just ensured").clone())
    }

    /// Session teardown: drop agent hosts, then invalidate every shared
    /// credential. The pool members stay shared with tokens, so
    /// invalidation reaches them too.
    fn release(&self) {
        {
            let mut agents = self.agents.lock().unwrap();
            if let Some(agent) = agents.interface.take() {
                agent.terminate();
            }
            if let Some(agent) = agents.privileged.take() {
                agent.terminate();
            }
        }
        {
            let creds = self.creds.lock().unwrap();
            if !creds.is_empty() {
                info!(
                    session = %self.handle(),
                    count = creds.len(),
                    "invalidating shared session credentials"
                );
            }
            creds.invalidate_all();
        }
    }
}

/// Contract shared by the session variants. Configuration operations fail
/// on the base (root sessions cannot be set up by a client); the dynamic
/// variant overrides them with originator checks.
pub trait SessionRole: DaemonObject {
    fn base(&self) -> &SessionBase;

    /// The uid recorded by the session originator.
    fn originator_uid(&self) -> SessionResult<u32>;

    fn setup_attributes(
        &self,
        caller: Handle,
        _flags: u32,
        _attrs: SessionAttributes,
    ) -> SessionResult<()> {
        let _ = caller;
        Err(SessionError::SessionAuthorizationDenied)
    }

    fn set_originator_uid(&self, caller: Handle, _uid: u32) -> SessionResult<()> {
        let _ = caller;
        Err(SessionError::SessionAuthorizationDenied)
    }

    fn set_user_prefs(&self, caller: Handle, _prefs: Vec<u8>) -> SessionResult<()> {
        let _ = caller;
        Err(SessionError::SessionAuthorizationDenied)
    }

    fn copy_user_prefs(&self) -> Option<Vec<u8>> {
        None
    }
}

/// The singleton startup session. Eternal; `originator_uid` is root.
pub struct RootSession {
    base: SessionBase,
}

impl RootSession {
    pub(crate) fn create(
        registry: &Registry,
        server: Handle,
        service_port: Port,
        extra_attrs: SessionAttributes,
    ) -> SessionResult<Arc<Self>> {
        let session = registry.register(|handle| {
            Arc::new(Self {
                base: SessionBase::new(
                    handle,
                    service_port,
                    SessionAttributes::IS_ROOT
                        | SessionAttributes::WAS_INITIALIZED
                        | extra_attrs,
                ),
            })
        });
        registry.adopt(server, session.base.handle())?;
        info!(session = %session.base.handle(), port = %service_port, "root session created");
        Ok(session)
    }
}

impl SessionRole for RootSession {
    fn base(&self) -> &SessionBase {
        &self.base
    }

    fn originator_uid(&self) -> SessionResult<u32> {
        Ok(0)
    }
}

impl DaemonObject for RootSession {
    fn core(&self) -> &ObjectCore {
        &self.base.core
    }

    fn on_kill(&self) {
        self.base.release();
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A session created on demand by a client process (the originator).
pub struct DynamicSession {
    base: SessionBase,
    originator: Handle,
    originator_uid: Mutex<Option<u32>>,
    user_prefs: Mutex<Option<Vec<u8>>>,
}

impl DynamicSession {
    pub(crate) fn create(
        registry: &Registry,
        server: Handle,
        originator: Handle,
        service_port: Port,
    ) -> SessionResult<Arc<Self>> {
        let session = registry.register(|handle| {
            Arc::new(Self {
                base: SessionBase::new(handle, service_port, SessionAttributes::NONE),
                originator,
                originator_uid: Mutex::new(None),
                user_prefs: Mutex::new(None),
            })
        });
        registry.adopt(server, session.base.handle())?;
        info!(
            session = %session.base.handle(),
            originator = %originator,
            port = %service_port,
            "dynamic session created"
        );
        Ok(session)
    }

    fn check_originator(&self, caller: Handle) -> SessionResult<()> {
        if caller == self.originator {
            Ok(())
        } else {
            Err(SessionError::SessionAuthorizationDenied)
        }
    }
}

impl SessionRole for DynamicSession {
    fn base(&self) -> &SessionBase {
        &self.base
    }

    fn originator_uid(&self) -> SessionResult<u32> {
        self.originator_uid
            .lock()
            .unwrap()
            .ok_or(SessionError::ValueNotSet)
    }

    /// One-shot session setup, by the originator only.
    fn setup_attributes(
        &self,
        caller: Handle,
        flags: u32,
        attrs: SessionAttributes,
    ) -> SessionResult<()> {
        debug!(session = %self.base.handle(), flags, attrs = attrs.bits(), "session setup");
        if attrs.outside(SessionAttributes::SETTABLE) {
            return Err(SessionError::InvalidAttributes);
        }
        self.check_originator(caller)?;
        if self
            .base
            .attributes()
            .contains(SessionAttributes::WAS_INITIALIZED)
        {
            return Err(SessionError::SessionAuthorizationDenied);
        }
        self.base
            .add_attributes(attrs | SessionAttributes::WAS_INITIALIZED);
        Ok(())
    }

    /// The originator uid carries no daemon semantics; it is write-once
    /// storage for the originator's benefit.
    fn set_originator_uid(&self, caller: Handle, uid: u32) -> SessionResult<()> {
        self.check_originator(caller)?;
        let mut originator_uid = self.originator_uid.lock().unwrap();
        if originator_uid.is_some() {
            return Err(SessionError::SessionAuthorizationDenied);
        }
        *originator_uid = Some(uid);
        debug!(session = %self.base.handle(), uid, "session originator uid set");
        Ok(())
    }

    fn set_user_prefs(&self, caller: Handle, prefs: Vec<u8>) -> SessionResult<()> {
        self.check_originator(caller)?;
        *self.user_prefs.lock().unwrap() = Some(prefs);
        Ok(())
    }

    fn copy_user_prefs(&self) -> Option<Vec<u8>> {
        self.user_prefs.lock().unwrap().clone()
    }
}

impl DaemonObject for DynamicSession {
    fn core(&self) -> &ObjectCore {
        &self.base.core
    }

    fn on_kill(&self) {
        self.base.release();
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
