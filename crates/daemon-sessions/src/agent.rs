//! Per-session agent hosts.
//!
//! Each session may run up to two helper host processes: the interface
//! agent (user prompts) and the privileged host. The daemon only tracks
//! liveness and restarts; what runs inside is the agent's business.

use crate::{SessionError, SessionResult};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Which flavor of agent host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    /// The user-facing interface agent.
    Interface,
    /// The privileged authorization host.
    Privileged,
}

/// A live agent host instance.
pub trait AgentInstance: Send + Sync {
    /// Whether the host process is still running.
    fn is_alive(&self) -> bool;

    /// Ask the host to terminate; idempotent.
    fn terminate(&self);
}

/// Launches agent hosts for a session.
pub trait AgentLauncher: Send + Sync {
    fn launch(&self, kind: AgentKind) -> SessionResult<Arc<dyn AgentInstance>>;
}

struct CommandAgent {
    child: Mutex<std::process::Child>,
}

impl AgentInstance for CommandAgent {
    fn is_alive(&self) -> bool {
        let mut child = self.child.lock().unwrap();
        matches!(child.try_wait(), Ok(None))
    }

    fn terminate(&self) {
        let mut child = self.child.lock().unwrap();
        if matches!(child.try_wait(), Ok(None)) {
            if let Err(error) = child.kill() {
                warn!(error = %error, "failed to terminate agent host");
            }
            let _ = child.wait();
        }
    }
}

/// Launches agent hosts by executing configured binaries.
pub struct CommandAgentLauncher {
    pub interface_path: PathBuf,
    pub privileged_path: PathBuf,
}

impl AgentLauncher for CommandAgentLauncher {
    fn launch(&self, kind: AgentKind) -> SessionResult<Arc<dyn AgentInstance>> {
        let path = match kind {
            AgentKind::Interface => &self.interface_path,
            AgentKind::Privileged => &self.privileged_path,
        };
        debug!(path = %path.display(), ?kind, "launching agent host");
        let child = Command::new(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| SessionError::AgentLaunch(e.to_string()))?;
        info!(pid = child.id(), ?kind, "agent host launched");
        Ok(Arc::new(CommandAgent {
            child: Mutex::new(child),
        }))
    }
}
