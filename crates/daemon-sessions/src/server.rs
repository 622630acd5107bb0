//! The daemon root object.

use crate::agent::AgentLauncher;
use crate::process::Process;
use crate::session::{DynamicSession, RootSession, SessionRole};
use crate::{Port, SessionAttributes, SessionError, SessionMap, SessionResult};
use daemon_auth::Authority;
use daemon_registry::{DaemonObject, Handle, ObjectCore, Registry};
use keychain_db::CommonPool;
use std::any::Any;
use std::sync::{Arc, OnceLock};
use timer_wheel::TimerWheel;
use tracing::{info, warn};

/// The global nexus of the object mesh.
///
/// Owns every session, and carries the collaborators shared across the
/// graph: handle registry, timer wheel, keychain common pool, the rights
/// authority, and the agent launcher.
pub struct Server {
    core: ObjectCore,
    registry: Arc<Registry>,
    wheel: Arc<TimerWheel>,
    pool: Arc<CommonPool>,
    authority: Arc<dyn Authority>,
    launcher: Arc<dyn AgentLauncher>,
    sessions: SessionMap,
    root: OnceLock<Arc<RootSession>>,
}

impl Server {
    /// Bring up the daemon root: registers the server object and allocates
    /// the root session on `primary_port`. Failure here is fatal to the
    /// daemon.
    pub fn create(
        registry: Arc<Registry>,
        wheel: Arc<TimerWheel>,
        pool: Arc<CommonPool>,
        authority: Arc<dyn Authority>,
        launcher: Arc<dyn AgentLauncher>,
        primary_port: Port,
    ) -> SessionResult<Arc<Self>> {
        let server = registry.register(|handle| {
            Arc::new(Self {
                core: ObjectCore::new(handle),
                registry: registry.clone(),
                wheel,
                pool,
                authority,
                launcher,
                sessions: SessionMap::new(),
                root: OnceLock::new(),
            })
        });

        let root = RootSession::create(
            &server.registry,
            server.handle(),
            primary_port,
            SessionAttributes::NONE,
        )?;
        server.sessions.insert(primary_port, root.clone());
        server
            .root
            .set(root)
            .unwrap_or_else(|_| unreachable!("root session set once"));

        info!(server = %server.handle(), port = %primary_port, "server created");
        Ok(server)
    }

    pub fn handle(&self) -> Handle {
        self.core.handle()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn wheel(&self) -> &Arc<TimerWheel> {
        &self.wheel
    }

    pub fn pool(&self) -> &Arc<CommonPool> {
        &self.pool
    }

    pub fn authority(&self) -> &Arc<dyn Authority> {
        &self.authority
    }

    pub fn agent_launcher(&self) -> &Arc<dyn AgentLauncher> {
        &self.launcher
    }

    pub fn sessions(&self) -> &SessionMap {
        &self.sessions
    }

    /// The eternal root session.
    pub fn root_session(&self) -> Arc<RootSession> {
        self.root.get().expect("root session exists").clone()
    }

    /// Locate the session answering on `port`.
    pub fn find_session(&self, port: Port) -> SessionResult<Arc<dyn SessionRole>> {
        self.sessions.find(port)
    }

    /// Locate a session by object handle (e.g. from a process's parent
    /// link).
    pub fn session_by_handle(&self, handle: Handle) -> SessionResult<Arc<dyn SessionRole>> {
        self.sessions
            .find_by_handle(handle)
            .ok_or(SessionError::Registry(
                daemon_registry::RegistryError::InvalidHandle(handle),
            ))
    }

    /// Create a dynamic session originated by `originator` on `port`.
    pub fn create_dynamic_session(
        &self,
        originator: &Arc<Process>,
        port: Port,
    ) -> SessionResult<Arc<DynamicSession>> {
        let session =
            DynamicSession::create(&self.registry, self.handle(), originator.handle(), port)?;
        self.sessions.insert(port, session.clone());
        Ok(session)
    }

    /// Handle a death notification on a session's service port: unregister
    /// the session and tear it down.
    pub fn destroy_session(&self, port: Port) {
        match self.sessions.remove(port) {
            Some(session) => {
                info!(session = %session.base().handle(), port = %port, "session destroyed");
                self.registry.kill(session.base().handle());
            }
            None => warn!(port = %port, "destroy for unknown session port"),
        }
    }

    /// System is going to sleep: broadcast to every keychain container in
    /// every session.
    pub fn process_system_sleep(&self) {
        self.pool.sleep_processing_all();
    }

    /// Lock every keychain container belonging to one session.
    pub fn process_lock_all(&self, session: Handle) {
        self.pool.lock_all(session);
    }
}

impl DaemonObject for Server {
    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
