//! Shared in-memory fakes for session-graph tests.

use crate::agent::{AgentInstance, AgentKind, AgentLauncher};
use crate::process::{ClientSetupInfo, CodeSigner, Process, TaskRef, PROTOCOL_VERSION};
use crate::server::Server;
use crate::{Port, SessionResult};
use daemon_auth::{
    AuditInfo, AuthError, AuthFlags, AuthItem, AuthResult, AuthRule, Authority,
    AuthorityDecision, CredentialSet,
};
use daemon_registry::Registry;
use keychain_db::CommonPool;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use timer_wheel::TimerWheel;

/// Grants whatever is asked and hands out a canned credential set.
pub(crate) struct FakeAuthority {
    pub new_creds: Mutex<CredentialSet>,
    pub deny: AtomicBool,
}

impl FakeAuthority {
    pub fn new() -> Self {
        Self {
            new_creds: Mutex::new(CredentialSet::new()),
            deny: AtomicBool::new(false),
        }
    }

    pub fn with_creds(creds: CredentialSet) -> Self {
        Self {
            new_creds: Mutex::new(creds),
            deny: AtomicBool::new(false),
        }
    }
}

impl Authority for FakeAuthority {
    fn authorize(
        &self,
        rights: &[String],
        _environment: &[AuthItem],
        _flags: AuthFlags,
        _creds: &CredentialSet,
        _audit: &AuditInfo,
    ) -> AuthResult<AuthorityDecision> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(AuthError::InvalidCredentials);
        }
        Ok(AuthorityDecision {
            granted: rights.to_vec(),
            new_creds: self.new_creds.lock().unwrap().clone(),
        })
    }

    fn get_rule(&self, name: &str) -> AuthResult<AuthRule> {
        Err(AuthError::UnknownRule(name.to_string()))
    }

    fn set_rule(
        &self,
        _name: &str,
        _rule: AuthRule,
        _creds: &CredentialSet,
    ) -> AuthResult<AuthorityDecision> {
        Ok(AuthorityDecision::default())
    }

    fn remove_rule(&self, _name: &str, _creds: &CredentialSet) -> AuthResult<AuthorityDecision> {
        Ok(AuthorityDecision::default())
    }
}

pub(crate) struct FakeAgent {
    alive: AtomicBool,
}

impl AgentInstance for FakeAgent {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn terminate(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

pub(crate) struct FakeLauncher {
    pub launches: AtomicUsize,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self {
            launches: AtomicUsize::new(0),
        }
    }
}

impl AgentLauncher for FakeLauncher {
    fn launch(&self, _kind: AgentKind) -> SessionResult<Arc<dyn AgentInstance>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeAgent {
            alive: AtomicBool::new(true),
        }))
    }
}

/// Signs every identity with a fixed signature, or refuses.
pub(crate) struct FakeSigner(pub Option<Vec<u8>>);

impl CodeSigner for FakeSigner {
    fn sign(&self, _identity: &str) -> Option<Vec<u8>> {
        self.0.clone()
    }
}

pub(crate) const PRIMARY_PORT: Port = Port::from_raw(1);

pub(crate) fn test_server(authority: Arc<dyn Authority>) -> Arc<Server> {
    Server::create(
        Registry::new(),
        Arc::new(TimerWheel::start()),
        CommonPool::new(),
        authority,
        Arc::new(FakeLauncher::new()),
        PRIMARY_PORT,
    )
    .unwrap()
}

/// Attach a client process to the session at `port`.
pub(crate) fn attach(server: &Server, port: Port, pid: u32, uid: u32) -> Arc<Process> {
    Process::create(
        server,
        port,
        TaskRef::from_raw(7000 + pid),
        &ClientSetupInfo {
            version: PROTOCOL_VERSION,
        },
        "/usr/bin/test-client",
        pid,
        uid,
        20,
    )
    .unwrap()
}
