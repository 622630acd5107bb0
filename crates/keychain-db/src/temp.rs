//! Per-process scratch storage.

use crate::DbResult;
use daemon_registry::{DaemonObject, Handle, ObjectCore, Registry};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// A process-local scratch database.
///
/// Holds transient key material for one client process; never persisted,
/// never shared, and torn down with the process. There is no lock state:
/// the store is only reachable from its owner.
#[derive(Debug)]
pub struct TempDatabase {
    core: ObjectCore,
    items: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl TempDatabase {
    /// Create a scratch database owned by `process`.
    pub fn create(registry: &Registry, process: Handle) -> DbResult<Arc<Self>> {
        let db = registry.register(|handle| {
            Arc::new(Self {
                core: ObjectCore::new(handle),
                items: Mutex::new(BTreeMap::new()),
            })
        });
        registry.adopt(process, db.handle())?;
        debug!(handle = %db.handle(), process = %process, "temp database created");
        Ok(db)
    }

    pub fn handle(&self) -> Handle {
        self.core.handle()
    }

    pub fn put(&self, name: &str, value: Vec<u8>) {
        self.items.lock().unwrap().insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.items.lock().unwrap().get(name).cloned()
    }

    pub fn delete(&self, name: &str) -> bool {
        self.items.lock().unwrap().remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }
}

impl DaemonObject for TempDatabase {
    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn on_kill(&self) {
        self.items.lock().unwrap().clear();
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
