//! Helper-daemon child supervision.

use crate::{MonitorError, MonitorResult};
use daemon_config_and_utils::{HELPER_EXEC_PATH, HELPER_PATH_ENV, HELPER_WORKING_DIR};
use rust_fsm::*;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use tracing::{debug, info, warn};

// Child lifecycle automaton. `Starting` covers the window between the
// launch decision and a confirmed spawn; a spawn failure drops straight to
// Dead.
state_machine! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub helper_machine(NotRunning)

    NotRunning => {
        LaunchRequested => Starting
    },
    Starting => {
        Started => Alive,
        Exited => Dead
    },
    Alive => {
        TerminateRequested => Terminating,
        Exited => Dead
    },
    Terminating => {
        Exited => Dead
    },
    Dead => {
        LaunchRequested => Starting
    }
}

use helper_machine::Input as HelperInput;
use helper_machine::StateMachine as HelperMachine;

/// Public view of the child automaton state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperState {
    NotRunning,
    Starting,
    Alive,
    Terminating,
    Dead,
}

impl From<&helper_machine::State> for HelperState {
    fn from(state: &helper_machine::State) -> Self {
        match state {
            helper_machine::State::NotRunning => HelperState::NotRunning,
            helper_machine::State::Starting => HelperState::Starting,
            helper_machine::State::Alive => HelperState::Alive,
            helper_machine::State::Terminating => HelperState::Terminating,
            helper_machine::State::Dead => HelperState::Dead,
        }
    }
}

/// A running helper child.
pub trait ChildHandle: Send + Sync {
    fn pid(&self) -> u32;
    fn is_alive(&self) -> bool;
    /// Send the termination signal; idempotent.
    fn terminate(&self);
}

/// Spawns helper children (seam for tests).
pub trait ChildLauncher: Send + Sync {
    fn spawn(&self, config: &HelperConfig) -> MonitorResult<Box<dyn ChildHandle>>;
}

/// Fixed helper configuration.
#[derive(Debug, Clone)]
pub struct HelperConfig {
    /// Helper executable; `$PCSCDAEMON` overrides the built-in default.
    pub exec_path: PathBuf,
    /// The helper's working directory, moved aside before each launch.
    pub working_dir: PathBuf,
}

impl Default for HelperConfig {
    fn default() -> Self {
        let exec_path = std::env::var(HELPER_PATH_ENV)
            .ok()
            .filter(|path| !path.trim().is_empty())
            .unwrap_or_else(|| HELPER_EXEC_PATH.to_string());
        Self {
            exec_path: PathBuf::from(exec_path),
            working_dir: PathBuf::from(HELPER_WORKING_DIR),
        }
    }
}

struct CommandChild {
    child: Mutex<std::process::Child>,
    pid: u32,
}

impl ChildHandle for CommandChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&self) -> bool {
        let mut child = self.child.lock().unwrap();
        matches!(child.try_wait(), Ok(None))
    }

    fn terminate(&self) {
        let mut child = self.child.lock().unwrap();
        if matches!(child.try_wait(), Ok(None)) {
            if let Err(error) = child.kill() {
                warn!(pid = self.pid, error = %error, "failed to signal helper");
            }
            let _ = child.wait();
        }
    }
}

/// Launches the real helper binary in the foreground (`-f`).
pub struct CommandChildLauncher;

impl CommandChildLauncher {
    /// Move any old play area aside so the helper starts clean.
    fn move_working_dir_aside(config: &HelperConfig) {
        if !config.working_dir.exists() {
            return;
        }
        let stamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let aside = std::env::temp_dir().join(format!("pcscd.{stamp}"));
        match std::fs::rename(&config.working_dir, &aside) {
            Ok(()) => debug!(aside = %aside.display(), "old helper working directory moved aside"),
            Err(error) => {
                warn!(
                    dir = %config.working_dir.display(),
                    error = %error,
                    "failed to move helper working directory"
                );
            }
        }
    }
}

impl ChildLauncher for CommandChildLauncher {
    fn spawn(&self, config: &HelperConfig) -> MonitorResult<Box<dyn ChildHandle>> {
        Self::move_working_dir_aside(config);

        let mut command = Command::new(&config.exec_path);
        command.arg("-f").stdin(Stdio::null()).stderr(Stdio::null());

        // Quiet the helper's stdout chatter into a debug log.
        if cfg!(debug_assertions) {
            match std::fs::File::options()
                .create(true)
                .append(true)
                .open("/tmp/pcsc.debuglog")
            {
                Ok(log) => {
                    command.stdout(log);
                }
                Err(_) => {
                    command.stdout(Stdio::null());
                }
            }
        } else {
            command.stdout(Stdio::null());
        }

        let child = command
            .spawn()
            .map_err(|e| MonitorError::Launch(e.to_string()))?;
        let pid = child.id();
        info!(pid, path = %config.exec_path.display(), "helper daemon launched");
        Ok(Box::new(CommandChild {
            child: Mutex::new(child),
            pid,
        }))
    }
}

struct SupervisorState {
    machine: HelperMachine,
    child: Option<Box<dyn ChildHandle>>,
}

/// Tracks exactly one helper child through its lifecycle.
///
/// At most one child is alive at any time: `launch` refuses while the
/// automaton is in Starting, Alive, or Terminating.
pub struct HelperSupervisor {
    launcher: Box<dyn ChildLauncher>,
    config: HelperConfig,
    state: Mutex<SupervisorState>,
}

impl HelperSupervisor {
    pub fn new(launcher: Box<dyn ChildLauncher>, config: HelperConfig) -> Self {
        Self {
            launcher,
            config,
            state: Mutex::new(SupervisorState {
                machine: HelperMachine::new(),
                child: None,
            }),
        }
    }

    pub fn state(&self) -> HelperState {
        HelperState::from(self.state.lock().unwrap().machine.state())
    }

    pub fn is_alive(&self) -> bool {
        self.state() == HelperState::Alive
    }

    pub fn child_pid(&self) -> Option<u32> {
        self.state
            .lock()
            .unwrap()
            .child
            .as_ref()
            .map(|child| child.pid())
    }

    /// Launch the helper. Fails if a child is already starting or running.
    pub fn launch(&self) -> MonitorResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .machine
            .consume(&HelperInput::LaunchRequested)
            .map_err(|_| {
                MonitorError::InvalidStateTransition(format!(
                    "launch while {:?}",
                    HelperState::from(state.machine.state())
                ))
            })?;

        // Reset prior state before forking again.
        state.child = None;

        match self.launcher.spawn(&self.config) {
            Ok(child) => {
                state
                    .machine
                    .consume(&HelperInput::Started)
                    .expect("Starting accepts Started");
                state.child = Some(child);
                Ok(())
            }
            Err(error) => {
                state
                    .machine
                    .consume(&HelperInput::Exited)
                    .expect("Starting accepts Exited");
                warn!(error = %error, "helper spawn failed");
                Err(error)
            }
        }
    }

    /// Send the termination signal to an alive child.
    pub fn terminate(&self) {
        let mut state = self.state.lock().unwrap();
        if state.machine.consume(&HelperInput::TerminateRequested).is_err() {
            return; // nothing alive to terminate
        }
        if let Some(child) = state.child.as_ref() {
            info!(pid = child.pid(), "terminating helper daemon");
            child.terminate();
        }
    }

    /// Check for an exited child. Returns true exactly once per death,
    /// when the automaton transitions into Dead.
    pub fn reap(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let running = matches!(
            HelperState::from(state.machine.state()),
            HelperState::Alive | HelperState::Terminating
        );
        if !running {
            return false;
        }
        let child_dead = state
            .child
            .as_ref()
            .map(|child| !child.is_alive())
            .unwrap_or(true);
        if !child_dead {
            return false;
        }
        state
            .machine
            .consume(&HelperInput::Exited)
            .expect("running states accept Exited");
        state.child = None;
        info!("helper daemon exited");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    pub(crate) struct FakeChild {
        pid: u32,
        alive: Arc<AtomicBool>,
    }

    impl ChildHandle for FakeChild {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn terminate(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    pub(crate) struct FakeLauncher {
        next_pid: AtomicU32,
        pub fail: AtomicBool,
        pub last_alive: Mutex<Option<Arc<AtomicBool>>>,
    }

    impl FakeLauncher {
        pub fn new() -> Self {
            Self {
                next_pid: AtomicU32::new(100),
                fail: AtomicBool::new(false),
                last_alive: Mutex::new(None),
            }
        }
    }

    impl ChildLauncher for FakeLauncher {
        fn spawn(&self, _config: &HelperConfig) -> MonitorResult<Box<dyn ChildHandle>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(MonitorError::Launch("spawn refused".into()));
            }
            let alive = Arc::new(AtomicBool::new(true));
            *self.last_alive.lock().unwrap() = Some(alive.clone());
            Ok(Box::new(FakeChild {
                pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
                alive,
            }))
        }
    }

    fn supervisor() -> (Arc<FakeLauncher>, HelperSupervisor) {
        let launcher = Arc::new(FakeLauncher::new());
        let supervisor = HelperSupervisor::new(
            Box::new(SharedLauncher(launcher.clone())),
            HelperConfig::default(),
        );
        (launcher, supervisor)
    }

    struct SharedLauncher(Arc<FakeLauncher>);

    impl ChildLauncher for SharedLauncher {
        fn spawn(&self, config: &HelperConfig) -> MonitorResult<Box<dyn ChildHandle>> {
            self.0.spawn(config)
        }
    }

    #[test]
    fn test_launch_transitions_to_alive() {
        let (_launcher, supervisor) = supervisor();
        assert_eq!(supervisor.state(), HelperState::NotRunning);

        supervisor.launch().unwrap();
        assert_eq!(supervisor.state(), HelperState::Alive);
        assert!(supervisor.child_pid().is_some());
    }

    #[test]
    fn test_at_most_one_child_alive() {
        let (_launcher, supervisor) = supervisor();
        supervisor.launch().unwrap();
        let first_pid = supervisor.child_pid();

        assert!(matches!(
            supervisor.launch(),
            Err(MonitorError::InvalidStateTransition(_))
        ));
        assert_eq!(supervisor.child_pid(), first_pid);
    }

    #[test]
    fn test_spawn_failure_lands_in_dead_and_allows_retry() {
        let (launcher, supervisor) = supervisor();
        launcher.fail.store(true, Ordering::SeqCst);
        assert!(supervisor.launch().is_err());
        assert_eq!(supervisor.state(), HelperState::Dead);

        launcher.fail.store(false, Ordering::SeqCst);
        supervisor.launch().unwrap();
        assert_eq!(supervisor.state(), HelperState::Alive);
    }

    #[test]
    fn test_terminate_then_reap() {
        let (_launcher, supervisor) = supervisor();
        supervisor.launch().unwrap();

        supervisor.terminate();
        assert_eq!(supervisor.state(), HelperState::Terminating);

        assert!(supervisor.reap());
        assert_eq!(supervisor.state(), HelperState::Dead);
        assert!(!supervisor.reap()); // one death, one report
    }

    #[test]
    fn test_reap_detects_unexpected_death() {
        let (launcher, supervisor) = supervisor();
        supervisor.launch().unwrap();

        // The child dies without the supervisor's involvement.
        launcher
            .last_alive
            .lock()
            .unwrap()
            .as_ref()
            .unwrap()
            .store(false, Ordering::SeqCst);

        assert!(supervisor.reap());
        assert_eq!(supervisor.state(), HelperState::Dead);
    }

    #[test]
    fn test_relaunch_after_death() {
        let (launcher, supervisor) = supervisor();
        supervisor.launch().unwrap();
        launcher
            .last_alive
            .lock()
            .unwrap()
            .as_ref()
            .unwrap()
            .store(false, Ordering::SeqCst);
        supervisor.reap();

        supervisor.launch().unwrap();
        assert_eq!(supervisor.state(), HelperState::Alive);
    }

    #[test]
    fn test_terminate_when_not_running_is_a_no_op() {
        let (_launcher, supervisor) = supervisor();
        supervisor.terminate();
        assert_eq!(supervisor.state(), HelperState::NotRunning);
    }
}
