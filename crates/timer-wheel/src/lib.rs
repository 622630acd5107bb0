//! One-shot timer dispatch for the daemon.
//!
//! A single dedicated thread delivers time-driven transitions (keychain idle
//! locks, helper reaping) by invoking [`TimerAction::action`] on registered
//! objects. Actions run on the dispatch thread with no wheel lock held, so
//! they may re-arm their own slot.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Implemented by objects that want timed callbacks.
pub trait TimerAction: Send + Sync + 'static {
    /// Invoked on the dispatch thread when the armed deadline passes.
    fn action(&self);
}

/// Identifies one object's registration with the wheel.
///
/// A slot is armed with [`TimerWheel::set_timer`] and disarmed with
/// [`TimerWheel::clear_timer`]; re-arming replaces the pending deadline
/// (sliding-window semantics). The wheel holds the action only weakly, so a
/// slot never keeps its object alive.
#[derive(Clone)]
pub struct TimerSlot {
    id: u64,
    action: Weak<dyn TimerAction>,
}

struct State {
    armed: HashMap<u64, (Instant, Weak<dyn TimerAction>)>,
    next_id: u64,
    shutdown: bool,
}

struct Inner {
    state: Mutex<State>,
    wakeup: Condvar,
}

/// The timer dispatch component.
///
/// Owns the dispatch thread; dropping the wheel stops the thread. Pending
/// actions that have not fired by then are discarded.
pub struct TimerWheel {
    inner: Arc<Inner>,
    thread: Option<JoinHandle<()>>,
}

impl TimerWheel {
    /// Start the wheel and its dispatch thread.
    pub fn start() -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                armed: HashMap::new(),
                next_id: 1,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });

        let dispatch = inner.clone();
        let thread = std::thread::Builder::new()
            .name("timer-wheel".into())
            .spawn(move || run_dispatch(dispatch))
            .expect("failed to spawn timer dispatch thread");

        Self {
            inner,
            thread: Some(thread),
        }
    }

    /// Create a slot for an object's timed action.
    pub fn slot(&self, action: Weak<dyn TimerAction>) -> TimerSlot {
        let mut state = self.inner.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        TimerSlot { id, action }
    }

    /// Arm (or re-arm) a slot to fire after `delay`.
    pub fn set_timer(&self, slot: &TimerSlot, delay: Duration) {
        let deadline = Instant::now() + delay;
        let mut state = self.inner.state.lock().unwrap();
        state
            .armed
            .insert(slot.id, (deadline, slot.action.clone()));
        trace!(slot = slot.id, delay_ms = delay.as_millis() as u64, "timer armed");
        self.inner.wakeup.notify_one();
    }

    /// Disarm a slot; a no-op if it is not armed.
    pub fn clear_timer(&self, slot: &TimerSlot) {
        let mut state = self.inner.state.lock().unwrap();
        if state.armed.remove(&slot.id).is_some() {
            trace!(slot = slot.id, "timer cleared");
            self.inner.wakeup.notify_one();
        }
    }

    /// Whether the slot currently has a pending deadline.
    pub fn scheduled(&self, slot: &TimerSlot) -> bool {
        self.inner.state.lock().unwrap().armed.contains_key(&slot.id)
    }
}

impl Drop for TimerWheel {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.shutdown = true;
        }
        self.inner.wakeup.notify_all();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("timer dispatch thread panicked");
            }
        }
    }
}

fn run_dispatch(inner: Arc<Inner>) {
    debug!("timer dispatch thread started");
    let mut state = inner.state.lock().unwrap();
    loop {
        if state.shutdown {
            break;
        }

        let now = Instant::now();

        // Collect everything due; firing happens with the lock released.
        let due: Vec<u64> = state
            .armed
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        if !due.is_empty() {
            let actions: Vec<Weak<dyn TimerAction>> = due
                .iter()
                .filter_map(|id| state.armed.remove(id))
                .map(|(_, action)| action)
                .collect();
            drop(state);
            for action in actions {
                if let Some(action) = action.upgrade() {
                    action.action();
                }
            }
            state = inner.state.lock().unwrap();
            continue;
        }

        let next = state.armed.values().map(|(deadline, _)| *deadline).min();
        state = match next {
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(now);
                inner.wakeup.wait_timeout(state, wait).unwrap().0
            }
            None => inner.wakeup.wait(state).unwrap(),
        };
    }
    debug!("timer dispatch thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        fired: AtomicUsize,
    }

    impl Counter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fired: AtomicUsize::new(0),
            })
        }

        fn count(&self) -> usize {
            self.fired.load(Ordering::SeqCst)
        }
    }

    impl TimerAction for Counter {
        fn action(&self) {
            self.fired.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_for(predicate: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !predicate() {
            assert!(Instant::now() < deadline, "timed out waiting for timer");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_timer_fires_once() {
        let wheel = TimerWheel::start();
        let counter = Counter::new();
        let slot = wheel.slot(Arc::downgrade(&counter) as Weak<dyn TimerAction>);

        wheel.set_timer(&slot, Duration::from_millis(20));
        wait_for(|| counter.count() == 1);

        // One-shot: no further firings, slot no longer scheduled.
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(counter.count(), 1);
        assert!(!wheel.scheduled(&slot));
    }

    #[test]
    fn test_clear_prevents_firing() {
        let wheel = TimerWheel::start();
        let counter = Counter::new();
        let slot = wheel.slot(Arc::downgrade(&counter) as Weak<dyn TimerAction>);

        wheel.set_timer(&slot, Duration::from_millis(40));
        wheel.clear_timer(&slot);

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(counter.count(), 0);
    }

    #[test]
    fn test_rearm_slides_deadline() {
        let wheel = TimerWheel::start();
        let counter = Counter::new();
        let slot = wheel.slot(Arc::downgrade(&counter) as Weak<dyn TimerAction>);

        wheel.set_timer(&slot, Duration::from_millis(30));
        std::thread::sleep(Duration::from_millis(15));
        wheel.set_timer(&slot, Duration::from_millis(100));
        std::thread::sleep(Duration::from_millis(40));

        // The original deadline passed, but the re-arm replaced it.
        assert_eq!(counter.count(), 0);
        wait_for(|| counter.count() == 1);
    }

    #[test]
    fn test_dropped_action_never_fires() {
        let wheel = TimerWheel::start();
        let counter = Counter::new();
        let slot = wheel.slot(Arc::downgrade(&counter) as Weak<dyn TimerAction>);

        wheel.set_timer(&slot, Duration::from_millis(20));
        drop(counter);

        std::thread::sleep(Duration::from_millis(60));
        assert!(!wheel.scheduled(&slot));
    }

    #[test]
    fn test_independent_slots() {
        let wheel = TimerWheel::start();
        let fast = Counter::new();
        let slow = Counter::new();
        let fast_slot = wheel.slot(Arc::downgrade(&fast) as Weak<dyn TimerAction>);
        let slow_slot = wheel.slot(Arc::downgrade(&slow) as Weak<dyn TimerAction>);

        wheel.set_timer(&fast_slot, Duration::from_millis(10));
        wheel.set_timer(&slow_slot, Duration::from_millis(500));

        wait_for(|| fast.count() == 1);
        assert_eq!(slow.count(), 0);
        assert!(wheel.scheduled(&slow_slot));
    }
}
