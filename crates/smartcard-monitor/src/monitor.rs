//! The smartcard monitor proper.

use crate::device::{device_support, DeviceEvent, DeviceSupport};
use crate::reader::Reader;
use crate::supervisor::{HelperState, HelperSupervisor};
use crate::MonitorResult;
use daemon_config_and_utils::ServiceLevel;
use daemon_registry::Registry;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use timer_wheel::{TimerAction, TimerSlot, TimerWheel};
use tracing::{debug, info, warn};

/// One reader's state as reported by the smartcard layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderSnapshot {
    pub name: String,
    /// A card is present in the reader.
    pub present: bool,
    /// The state changed since the previous poll.
    pub changed: bool,
}

/// Access to the helper daemon's reader state (seam over the pcsc socket).
pub trait PcscClient: Send + Sync {
    fn list_readers(&self) -> MonitorResult<Vec<ReaderSnapshot>>;
}

// The monitor's single timer serves two purposes in sequence: the initial
// setup shortly after startup, then idle-shutdown accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerMode {
    InitialSetup,
    NoDeviceTimeout,
}

struct MonitorState {
    readers: BTreeMap<String, Arc<Reader>>,
    going_to_sleep: bool,
    timer_mode: TimerMode,
}

/// Watches reader events and supervises the helper daemon.
///
/// The monitor plays several roles at once: notification listener for
/// helper events, timer client for idle shutdown, receiver of device-attach
/// events, power-event listener, and child supervisor. Each role is a
/// method group on this one core.
pub struct SmartcardMonitor {
    registry: Arc<Registry>,
    wheel: Arc<TimerWheel>,
    pcsc: Arc<dyn PcscClient>,
    supervisor: HelperSupervisor,
    service_level: ServiceLevel,
    idle_shutdown: Duration,
    slot: OnceLock<TimerSlot>,
    state: Mutex<MonitorState>,
}

impl SmartcardMonitor {
    pub fn new(
        registry: Arc<Registry>,
        wheel: Arc<TimerWheel>,
        pcsc: Arc<dyn PcscClient>,
        supervisor: HelperSupervisor,
        service_level: ServiceLevel,
        idle_shutdown: Duration,
    ) -> Arc<Self> {
        let monitor = Arc::new(Self {
            registry,
            wheel,
            pcsc,
            supervisor,
            service_level,
            idle_shutdown,
            slot: OnceLock::new(),
            state: Mutex::new(MonitorState {
                readers: BTreeMap::new(),
                going_to_sleep: false,
                timer_mode: TimerMode::InitialSetup,
            }),
        });
        let slot = monitor
            .wheel
            .slot(Arc::downgrade(&monitor) as Weak<dyn TimerAction>);
        monitor
            .slot
            .set(slot)
            .unwrap_or_else(|_| unreachable!("slot initialized once"));
        monitor
    }

    /// Kick off the monitor: the hard work happens in a timer action so
    /// startup is not held up.
    pub fn start(&self) {
        self.wheel.set_timer(self.slot(), Duration::ZERO);
    }

    pub fn service_level(&self) -> ServiceLevel {
        self.service_level
    }

    pub fn supervisor(&self) -> &HelperSupervisor {
        &self.supervisor
    }

    /// Whether the idle-shutdown timer is currently armed.
    pub fn idle_timer_scheduled(&self) -> bool {
        self.wheel.scheduled(self.slot())
    }

    /// Live reader objects, by name order.
    pub fn readers(&self) -> Vec<Arc<Reader>> {
        self.state.lock().unwrap().readers.values().cloned().collect()
    }

    pub fn reader(&self, name: &str) -> Option<Arc<Reader>> {
        self.state.lock().unwrap().readers.get(name).cloned()
    }

    fn slot(&self) -> &TimerSlot {
        self.slot.get().expect("slot initialized at new")
    }

    /// A notification arrived from the helper daemon: re-enumerate readers
    /// and re-arm the idle timer iff nothing is attached and we are awake.
    pub fn poll_notification(&self) -> MonitorResult<()> {
        let mut state = self.state.lock().unwrap();
        self.poll_readers(&mut state)?;
        let enable = state.readers.is_empty() && !state.going_to_sleep;
        drop(state);
        self.schedule_timer(enable);
        Ok(())
    }

    /// Poll reader state and diff against the known reader map.
    fn poll_readers(&self, state: &mut MonitorState) -> MonitorResult<()> {
        let snapshots = self.pcsc.list_readers()?;
        debug!(count = snapshots.len(), "readers in system");

        let mut vanished: BTreeMap<String, Arc<Reader>> = state.readers.clone();
        for snapshot in &snapshots {
            match state.readers.get(&snapshot.name) {
                Some(reader) => {
                    if snapshot.changed {
                        reader.update(&self.registry, snapshot);
                    }
                    vanished.remove(&snapshot.name);
                }
                None => {
                    let reader = Reader::create(&self.registry, &snapshot.name);
                    reader.update(&self.registry, snapshot);
                    state.readers.insert(snapshot.name.clone(), reader);
                }
            }
        }

        for (name, reader) in vanished {
            info!(reader = %name, "token reader removed from system");
            self.registry.kill(reader.handle());
            state.readers.remove(&name);
        }
        Ok(())
    }

    /// Arm or clear the idle-shutdown timer. Only meaningful while we run
    /// the helper ourselves.
    fn schedule_timer(&self, enable: bool) {
        if self.supervisor.state() != HelperState::Alive {
            return;
        }
        if enable {
            debug!(secs = self.idle_shutdown.as_secs(), "arming helper idle timer");
            self.wheel.set_timer(self.slot(), self.idle_shutdown);
        } else if self.wheel.scheduled(self.slot()) {
            debug!("clearing helper idle timer");
            self.wheel.clear_timer(self.slot());
        }
    }

    /// A device was attached. Decide whether it warrants launching the
    /// helper under the configured service level.
    pub fn device_attached(&self, event: &DeviceEvent) {
        if matches!(
            self.service_level,
            ServiceLevel::ForcedOff | ServiceLevel::ExternalDaemon
        ) {
            return;
        }
        if self.supervisor.state() == HelperState::Alive {
            debug!("helper is alive; ignoring device insertion");
            return;
        }

        let launch = match device_support(event) {
            DeviceSupport::Definite => true,
            DeviceSupport::Possible => self.service_level == ServiceLevel::Aggressive,
            DeviceSupport::Impossible => false,
        };

        if launch {
            if let Err(error) = self.launch_helper() {
                warn!(error = %error, "helper launch on device attach failed");
            }
        } else {
            debug!(path = %event.path, "no relevant device");
        }
    }

    /// Launch the helper and arm the idle timer; if it never reports a
    /// reader, the timer reaps it.
    pub fn launch_helper(&self) -> MonitorResult<()> {
        debug!("launching helper to handle smartcard devices");
        self.supervisor.launch()?;
        self.schedule_timer(true);
        Ok(())
    }

    /// System sleep: remember the marker and stop idle accounting (don't
    /// reap the helper merely because nothing happens while asleep).
    pub fn system_will_sleep(&self) {
        let mut state = self.state.lock().unwrap();
        debug!(readers = state.readers.len(), "setting sleep marker");
        state.going_to_sleep = true;
        drop(state);
        self.wheel.clear_timer(self.slot());
    }

    /// System wake: clear the marker and resume idle accounting if no
    /// readers are present.
    pub fn system_is_waking(&self) {
        let mut state = self.state.lock().unwrap();
        debug!(readers = state.readers.len(), "clearing sleep marker");
        state.going_to_sleep = false;
        let enable = state.readers.is_empty();
        drop(state);
        self.schedule_timer(enable);
    }

    /// Detect and handle an unexpected helper death. All reader and token
    /// objects are orphaned and must go.
    pub fn check_helper(&self) -> bool {
        if !self.supervisor.reap() {
            return false;
        }
        let mut state = self.state.lock().unwrap();
        if !state.readers.is_empty() {
            warn!(
                readers = state.readers.len(),
                "readers were present when the helper died"
            );
            let orphaned: Vec<Arc<Reader>> = state.readers.values().cloned().collect();
            state.readers.clear();
            drop(state);
            for reader in orphaned {
                debug!(reader = %reader.name(), "removing orphaned reader");
                self.registry.kill(reader.handle());
            }
        }
        // A relaunch would go here; deliberately left to the next trigger.
        true
    }

    /// Initial setup, run from the first timer firing once the event loop
    /// is up.
    fn initial_setup(&self) {
        match self.service_level {
            ServiceLevel::ForcedOff => {
                info!("smartcard operation is forced off");
            }
            ServiceLevel::ForcedOn => {
                info!("helper launch is forced on");
                if let Err(error) = self.launch_helper() {
                    warn!(error = %error, "forced helper launch failed");
                }
            }
            ServiceLevel::ExternalDaemon => {
                info!("using external helper (if any); no launch operations");
            }
            ServiceLevel::Conservative | ServiceLevel::Aggressive => {
                info!(
                    aggressive = self.service_level == ServiceLevel::Aggressive,
                    "automatic smartcard management enabled"
                );
                // Device-attach notifications arrive via `device_attached`;
                // the helper tells us about readers once it runs.
            }
        }
    }

    /// No recognized devices for the whole idle interval: reap the helper.
    fn no_device_timeout(&self) {
        info!(
            secs = self.idle_shutdown.as_secs(),
            "no smartcard devices present; terminating helper"
        );
        debug_assert!(self.state.lock().unwrap().readers.is_empty());
        self.supervisor.terminate();
    }
}

impl TimerAction for SmartcardMonitor {
    fn action(&self) {
        let mode = {
            let mut state = self.state.lock().unwrap();
            let mode = state.timer_mode;
            state.timer_mode = TimerMode::NoDeviceTimeout;
            mode
        };
        match mode {
            TimerMode::InitialSetup => self.initial_setup(),
            TimerMode::NoDeviceTimeout => self.no_device_timeout(),
        }
    }
}
