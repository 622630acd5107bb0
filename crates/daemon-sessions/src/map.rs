//! The global port-to-session map.

use crate::{SessionError, SessionResult, SessionRole};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// A service-port identifier. Each session answers on exactly one port.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Port(u32);

impl Port {
    pub const fn from_raw(raw: u32) -> Self {
        Port(raw)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port:{}", self.0)
    }
}

/// Map of live sessions by service port.
///
/// The map lock is held only for registry mutations; session operations run
/// on the returned references.
pub struct SessionMap {
    map: Mutex<BTreeMap<Port, Arc<dyn SessionRole>>>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn insert(&self, port: Port, session: Arc<dyn SessionRole>) {
        self.map.lock().unwrap().insert(port, session);
    }

    /// Locate the session answering on `port`.
    pub fn find(&self, port: Port) -> SessionResult<Arc<dyn SessionRole>> {
        self.map
            .lock()
            .unwrap()
            .get(&port)
            .cloned()
            .ok_or(SessionError::NoSuchSession(port.raw()))
    }

    /// Locate a session by its object handle (sessions are few; a scan is
    /// fine).
    pub fn find_by_handle(
        &self,
        handle: daemon_registry::Handle,
    ) -> Option<Arc<dyn SessionRole>> {
        self.map
            .lock()
            .unwrap()
            .values()
            .find(|session| session.base().handle() == handle)
            .cloned()
    }

    /// Remove the session for `port` from the map (teardown continues at the
    /// caller).
    pub fn remove(&self, port: Port) -> Option<Arc<dyn SessionRole>> {
        self.map.lock().unwrap().remove(&port)
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().unwrap().is_empty()
    }
}

impl Default for SessionMap {
    fn default() -> Self {
        Self::new()
    }
}
