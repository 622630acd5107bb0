//! Daemon runtime state: the wired-together object graph.

use daemon_config_and_utils::{Config, Paths};
use daemon_auth::LocalAuthority;
use daemon_registry::Registry;
use daemon_sessions::{CommandAgentLauncher, Port, Server};
use keychain_db::CommonPool;
use smartcard_monitor::{
    CommandChildLauncher, HelperConfig, HelperSupervisor, PcscClient, ReaderSnapshot,
    SmartcardMonitor,
};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use timer_wheel::TimerWheel;
use tokio::sync::broadcast;

/// The primary service port, owned by the root session.
pub const PRIMARY_SERVICE_PORT: Port = Port::from_raw(1);

/// Default interface-agent binary.
const AGENT_PATH: &str = "/usr/libexec/keywarden-agent";
/// Default privileged-host binary.
const PRIVILEGED_AGENT_PATH: &str = "/usr/libexec/keywarden-authhost";

/// Placeholder smartcard-layer client until the helper's socket protocol is
/// wired in: reports no readers, which keeps idle accounting correct.
struct DisconnectedPcsc;

impl PcscClient for DisconnectedPcsc {
    fn list_readers(&self) -> smartcard_monitor::MonitorResult<Vec<ReaderSnapshot>> {
        Ok(Vec::new())
    }
}

/// Everything the request handlers need, shared across connections.
pub struct DaemonState {
    pub config: Config,
    pub server: Arc<Server>,
    pub monitor: Arc<SmartcardMonitor>,
    /// Wired after the IPC server exists; `shutdown` requests go here.
    pub shutdown: OnceLock<broadcast::Sender<()>>,
}

impl DaemonState {
    /// Build the object graph. A failure here (root session allocation
    /// included) is fatal to the daemon.
    pub fn build(config: Config, _paths: &Paths) -> anyhow::Result<Arc<Self>> {
        let registry = Registry::new();
        let wheel = Arc::new(TimerWheel::start());
        let pool = CommonPool::new();
        let authority = Arc::new(LocalAuthority::new());
        let launcher = Arc::new(CommandAgentLauncher {
            interface_path: PathBuf::from(AGENT_PATH),
            privileged_path: PathBuf::from(PRIVILEGED_AGENT_PATH),
        });

        let server = Server::create(
            registry.clone(),
            wheel.clone(),
            pool,
            authority,
            launcher,
            PRIMARY_SERVICE_PORT,
        )
        .map_err(|e| anyhow::anyhow!("cannot allocate root session: {e}"))?;

        let supervisor = HelperSupervisor::new(
            Box::new(CommandChildLauncher),
            HelperConfig {
                exec_path: PathBuf::from(&config.helper_path),
                ..HelperConfig::default()
            },
        );
        let monitor = SmartcardMonitor::new(
            registry,
            wheel,
            Arc::new(DisconnectedPcsc),
            supervisor,
            config.service_level,
            Duration::from_secs(config.helper_idle_shutdown_secs),
        );

        Ok(Arc::new(Self {
            config,
            server,
            monitor,
            shutdown: OnceLock::new(),
        }))
    }

    /// System sleep notification: lock keychains, quiet the monitor.
    pub fn system_will_sleep(&self) {
        self.server.process_system_sleep();
        self.monitor.system_will_sleep();
    }

    /// System wake notification.
    pub fn system_is_waking(&self) {
        self.monitor.system_is_waking();
    }
}
