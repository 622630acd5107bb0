//! Shared container state and the lock automaton.

use crate::{DbError, DbIdentifier, DbParameters, DbResult};
use daemon_registry::Handle;
use keychain_crypto::MasterSecrets;
use rust_fsm::*;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use timer_wheel::{TimerAction, TimerSlot, TimerWheel};
use tracing::{debug, info};

// The lock automaton. Master secrets exist exactly while the machine is in
// Unlocked; they are wiped on every edge into Locked.
state_machine! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub lock_machine(Locked)

    Locked => {
        Unlock => Unlocked
    },
    Unlocked => {
        Activity => Unlocked,
        Lock => Locked,
        SleepLock => Locked,
        TimerFired => Locked
    }
}

pub use lock_machine::Input as LockInput;
pub use lock_machine::State as LockState;
pub use lock_machine::StateMachine as LockMachine;

struct CommonState {
    machine: LockMachine,
    secrets: Option<MasterSecrets>,
    params: DbParameters,
    valid_params: bool,
    sequence: u32,
    version: u32,
    /// Set when the container was locked for sleep; re-unlock may require
    /// passphrase re-entry rather than cached credentials.
    reentry_required: bool,
}

/// The shared state of one keychain container within one session.
///
/// All client handles onto the same `(session, identifier)` pair share one
/// `DbCommon`; it dies when the last handle goes away. Not registered in the
/// handle registry: clients never reference it directly.
pub struct DbCommon {
    identifier: DbIdentifier,
    session: Handle,
    wheel: Arc<TimerWheel>,
    slot: OnceLock<TimerSlot>,
    state: Mutex<CommonState>,
}

impl DbCommon {
    /// Create the shared state for a container, initially locked.
    pub fn create(
        session: Handle,
        identifier: DbIdentifier,
        params: DbParameters,
        wheel: Arc<TimerWheel>,
    ) -> Arc<Self> {
        let common = Arc::new(Self {
            identifier,
            session,
            wheel,
            slot: OnceLock::new(),
            state: Mutex::new(CommonState {
                machine: LockMachine::new(),
                secrets: None,
                params,
                valid_params: false,
                sequence: 0,
                version: 1,
                reentry_required: false,
            }),
        });
        let slot = common
            .wheel
            .slot(Arc::downgrade(&common) as Weak<dyn TimerAction>);
        common
            .slot
            .set(slot)
            .unwrap_or_else(|_| unreachable!("slot initialized once"));
        common
    }

    pub fn identifier(&self) -> &DbIdentifier {
        &self.identifier
    }

    pub fn session(&self) -> Handle {
        self.session
    }

    pub fn is_locked(&self) -> bool {
        *self.state.lock().unwrap().machine.state() == LockState::Locked
    }

    /// Change-tracking stamp; bumped by every mutation.
    pub fn version(&self) -> u32 {
        self.state.lock().unwrap().version
    }

    pub fn sequence(&self) -> u32 {
        self.state.lock().unwrap().sequence
    }

    pub fn params(&self) -> DbParameters {
        self.state.lock().unwrap().params
    }

    /// Whether re-unlock requires fresh passphrase entry (post-sleep).
    pub fn reentry_required(&self) -> bool {
        self.state.lock().unwrap().reentry_required
    }

    fn slot(&self) -> &TimerSlot {
        self.slot.get().expect("slot initialized at create")
    }

    fn arm_timer(&self, params: &DbParameters) {
        if params.idle_timeout_secs > 0 {
            self.wheel
                .set_timer(self.slot(), Duration::from_secs(params.idle_timeout_secs));
        }
    }

    /// Install master secrets and transition to Unlocked.
    ///
    /// Already-unlocked containers just refresh the idle window.
    pub fn unlock_with(&self, secrets: MasterSecrets) -> DbResult<()> {
        let mut state = self.state.lock().unwrap();
        if *state.machine.state() == LockState::Unlocked {
            let params = state.params;
            drop(state);
            self.arm_timer(&params);
            return Ok(());
        }
        state
            .machine
            .consume(&LockInput::Unlock)
            .map_err(|_| DbError::InvalidStateTransition("unlock".into()))?;
        state.secrets = Some(secrets);
        state.reentry_required = false;
        let params = state.params;
        drop(state);

        self.arm_timer(&params);
        info!(db = %self.identifier, "keychain unlocked");
        Ok(())
    }

    fn lock_inner(&self, input: &LockInput, for_sleep: bool) {
        let mut state = self.state.lock().unwrap();
        if *state.machine.state() == LockState::Locked {
            return;
        }
        state
            .machine
            .consume(input)
            .expect("Unlocked accepts every lock input");
        state.secrets = None; // MasterSecrets zeroizes on drop
        if for_sleep {
            state.reentry_required = true;
        }
        drop(state);

        self.wheel.clear_timer(self.slot());
        info!(db = %self.identifier, for_sleep, "keychain locked");
    }

    /// Lock the container, wiping master secrets. Idempotent.
    pub fn lock(&self, for_sleep: bool) {
        let input = if for_sleep {
            LockInput::SleepLock
        } else {
            LockInput::Lock
        };
        self.lock_inner(&input, for_sleep);
    }

    /// Record client activity: slide the idle-lock window.
    pub fn activity(&self) {
        let mut state = self.state.lock().unwrap();
        if *state.machine.state() != LockState::Unlocked {
            return;
        }
        state
            .machine
            .consume(&LockInput::Activity)
            .expect("Unlocked accepts Activity");
        let params = state.params;
        drop(state);
        self.arm_timer(&params);
    }

    /// Replace the container parameters. Requires an unlocked container;
    /// bumps sequence and version and restarts the idle window.
    pub fn set_parameters(&self, params: DbParameters) -> DbResult<()> {
        let mut state = self.state.lock().unwrap();
        if *state.machine.state() != LockState::Unlocked {
            return Err(DbError::Locked);
        }
        state.params = params;
        state.valid_params = true;
        state.sequence += 1;
        state.version += 1;
        drop(state);
        self.arm_timer(&params);
        Ok(())
    }

    /// Adopt parameters decoded from a blob, without bumping the version.
    pub(crate) fn adopt_params(&self, params: DbParameters) {
        let mut state = self.state.lock().unwrap();
        if !state.valid_params {
            state.params = params;
            state.valid_params = true;
        }
    }

    /// Bump the version stamp (a mutation happened); returns the new value.
    pub fn bump_version(&self) -> u32 {
        let mut state = self.state.lock().unwrap();
        state.version += 1;
        state.version
    }

    /// Replace the master secrets of an unlocked container (passphrase
    /// change). Fails with `Locked` when locked.
    pub(crate) fn swap_secrets(&self, secrets: MasterSecrets) -> DbResult<()> {
        let mut state = self.state.lock().unwrap();
        if *state.machine.state() != LockState::Unlocked {
            return Err(DbError::Locked);
        }
        state.secrets = Some(secrets);
        Ok(())
    }

    /// Run `f` with the master secrets; fails with `Locked` when locked.
    pub fn with_secrets<R>(
        &self,
        f: impl FnOnce(&MasterSecrets) -> DbResult<R>,
    ) -> DbResult<R> {
        let state = self.state.lock().unwrap();
        if *state.machine.state() != LockState::Unlocked {
            return Err(DbError::Locked);
        }
        match state.secrets.as_ref() {
            Some(secrets) => f(secrets),
            None => Err(DbError::Locked),
        }
    }

    /// System-sleep broadcast: lock if the container locks on sleep.
    pub fn sleep_processing(&self) {
        if self.params().lock_on_sleep {
            self.lock(true);
        }
    }

    /// Explicit lock-all broadcast: lock unconditionally.
    pub fn lock_processing(&self) {
        self.lock(false);
    }
}

impl TimerAction for DbCommon {
    fn action(&self) {
        debug!(db = %self.identifier, "idle timeout; locking keychain");
        self.lock_inner(&LockInput::TimerFired, false);
    }
}

/// The map of live [`DbCommon`]s, keyed by `(session, identifier)`.
///
/// Holds weak references only: a `DbCommon` lives exactly as long as client
/// handles pin it. The pool lock is held only for map access.
pub struct CommonPool {
    map: Mutex<BTreeMap<(Handle, DbIdentifier), Weak<DbCommon>>>,
}

impl CommonPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            map: Mutex::new(BTreeMap::new()),
        })
    }

    /// Fetch the shared state for `(session, identifier)`, creating it if no
    /// live instance exists. Returns the instance and whether it was created.
    pub fn get_or_create(
        &self,
        session: Handle,
        identifier: &DbIdentifier,
        params: DbParameters,
        wheel: &Arc<TimerWheel>,
    ) -> (Arc<DbCommon>, bool) {
        let mut map = self.map.lock().unwrap();
        let key = (session, identifier.clone());
        if let Some(existing) = map.get(&key).and_then(Weak::upgrade) {
            return (existing, false);
        }
        let common = DbCommon::create(session, identifier.clone(), params, wheel.clone());
        map.insert(key, Arc::downgrade(&common));
        (common, true)
    }

    /// Look up a live shared state without creating one.
    pub fn find(&self, session: Handle, identifier: &DbIdentifier) -> Option<Arc<DbCommon>> {
        let map = self.map.lock().unwrap();
        map.get(&(session, identifier.clone()))
            .and_then(Weak::upgrade)
    }

    /// All live commons, optionally restricted to one session.
    fn live(&self, session: Option<Handle>) -> Vec<Arc<DbCommon>> {
        let mut map = self.map.lock().unwrap();
        map.retain(|_, weak| weak.strong_count() > 0);
        map.iter()
            .filter(|((owner, _), _)| session.map_or(true, |s| *owner == s))
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }

    /// System sleep: broadcast to every container in every session.
    pub fn sleep_processing_all(&self) {
        for common in self.live(None) {
            common.sleep_processing();
        }
    }

    /// Lock every container belonging to one session.
    pub fn lock_all(&self, session: Handle) {
        for common in self.live(Some(session)) {
            common.lock_processing();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keychain_crypto::BlobSignature;

    fn ident(name: &str) -> DbIdentifier {
        DbIdentifier::new(name, BlobSignature([9u8; 20]))
    }

    fn session() -> Handle {
        Handle::from_raw(11)
    }

    fn common_with_params(params: DbParameters) -> (Arc<TimerWheel>, Arc<DbCommon>) {
        let wheel = Arc::new(TimerWheel::start());
        let common = DbCommon::create(session(), ident("kc"), params, wheel.clone());
        (wheel, common)
    }

    fn common() -> (Arc<TimerWheel>, Arc<DbCommon>) {
        common_with_params(DbParameters::default())
    }

    #[test]
    fn test_starts_locked_without_secrets() {
        let (_wheel, common) = common();
        assert!(common.is_locked());
        assert_eq!(common.with_secrets(|_| Ok(())), Err(DbError::Locked));
    }

    #[test]
    fn test_unlock_installs_secrets_and_lock_wipes_them() {
        let (_wheel, common) = common();
        common.unlock_with(MasterSecrets::random()).unwrap();
        assert!(!common.is_locked());
        common.with_secrets(|_| Ok(())).unwrap();

        common.lock(false);
        assert!(common.is_locked());
        assert_eq!(common.with_secrets(|_| Ok(())), Err(DbError::Locked));
    }

    #[test]
    fn test_lock_is_idempotent() {
        let (_wheel, common) = common();
        common.lock(false);
        common.lock(true);
        assert!(common.is_locked());
    }

    #[test]
    fn test_sleep_lock_requires_reentry() {
        let (_wheel, common) = common();
        common.unlock_with(MasterSecrets::random()).unwrap();
        common.lock(true);
        assert!(common.reentry_required());

        common.unlock_with(MasterSecrets::random()).unwrap();
        assert!(!common.reentry_required());
    }

    #[test]
    fn test_unlock_arms_idle_timer_and_lock_clears_it() {
        let (wheel, common) = common();
        common.unlock_with(MasterSecrets::random()).unwrap();
        assert!(wheel.scheduled(common.slot()));

        common.lock(false);
        assert!(!wheel.scheduled(common.slot()));
    }

    #[test]
    fn test_idle_timer_fires_and_locks() {
        let (_wheel, common) = common_with_params(DbParameters {
            idle_timeout_secs: 1,
            lock_on_sleep: true,
        });
        common.unlock_with(MasterSecrets::random()).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while !common.is_locked() {
            assert!(
                std::time::Instant::now() < deadline,
                "idle timer never locked the container"
            );
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(common.with_secrets(|_| Ok(())), Err(DbError::Locked));
    }

    #[test]
    fn test_activity_rearms_only_when_unlocked() {
        let (wheel, common) = common();
        common.activity();
        assert!(!wheel.scheduled(common.slot()));

        common.unlock_with(MasterSecrets::random()).unwrap();
        common.activity();
        assert!(wheel.scheduled(common.slot()));
    }

    #[test]
    fn test_set_parameters_requires_unlocked_and_bumps_version() {
        let (_wheel, common) = common();
        let params = DbParameters {
            idle_timeout_secs: 30,
            lock_on_sleep: false,
        };
        assert_eq!(common.set_parameters(params), Err(DbError::Locked));

        common.unlock_with(MasterSecrets::random()).unwrap();
        let before = common.version();
        common.set_parameters(params).unwrap();
        assert!(common.version() > before);
        assert_eq!(common.sequence(), 1);
        assert_eq!(common.params(), params);
    }

    #[test]
    fn test_sleep_processing_honors_lock_on_sleep() {
        let (_wheel, keep_locked) = common_with_params(DbParameters {
            idle_timeout_secs: 600,
            lock_on_sleep: false,
        });
        keep_locked.unlock_with(MasterSecrets::random()).unwrap();
        keep_locked.sleep_processing();
        assert!(!keep_locked.is_locked());

        let (_wheel, locks) = common();
        locks.unlock_with(MasterSecrets::random()).unwrap();
        locks.sleep_processing();
        assert!(locks.is_locked());
    }

    #[test]
    fn test_pool_shares_one_common_per_session_and_identifier() {
        let wheel = Arc::new(TimerWheel::start());
        let pool = CommonPool::new();

        let (first, created) =
            pool.get_or_create(session(), &ident("kc"), DbParameters::default(), &wheel);
        assert!(created);
        let (second, created) =
            pool.get_or_create(session(), &ident("kc"), DbParameters::default(), &wheel);
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));

        // A different session gets its own common.
        let (other, created) = pool.get_or_create(
            Handle::from_raw(12),
            &ident("kc"),
            DbParameters::default(),
            &wheel,
        );
        assert!(created);
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn test_pool_entry_dies_with_last_reference() {
        let wheel = Arc::new(TimerWheel::start());
        let pool = CommonPool::new();

        let (first, _) =
            pool.get_or_create(session(), &ident("kc"), DbParameters::default(), &wheel);
        let second = pool.find(session(), &ident("kc")).unwrap();

        drop(first);
        assert!(pool.find(session(), &ident("kc")).is_some());

        drop(second);
        assert!(pool.find(session(), &ident("kc")).is_none());

        // A new request creates a fresh instance.
        let (_fresh, created) =
            pool.get_or_create(session(), &ident("kc"), DbParameters::default(), &wheel);
        assert!(created);
    }

    #[test]
    fn test_lock_all_scopes_to_session() {
        let wheel = Arc::new(TimerWheel::start());
        let pool = CommonPool::new();

        let (mine, _) =
            pool.get_or_create(session(), &ident("kc"), DbParameters::default(), &wheel);
        let (other, _) = pool.get_or_create(
            Handle::from_raw(12),
            &ident("kc"),
            DbParameters::default(),
            &wheel,
        );
        mine.unlock_with(MasterSecrets::random()).unwrap();
        other.unlock_with(MasterSecrets::random()).unwrap();

        pool.lock_all(session());
        assert!(mine.is_locked());
        assert!(!other.is_locked());

        pool.sleep_processing_all();
        assert!(other.is_locked());
    }
}
