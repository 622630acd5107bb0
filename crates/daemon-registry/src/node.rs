//! Shared lifecycle state embedded in every registered object.

use crate::Handle;
use std::any::Any;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Links {
    parent: Option<Handle>,
    children: BTreeSet<Handle>,
}

/// Lifecycle core composed into every daemon object.
///
/// Carries the object's handle, its tree links (as handles), and the dead
/// flag. Tree links have their own small lock so that kill cascades never
/// hold a domain lock while walking the tree.
#[derive(Debug)]
pub struct ObjectCore {
    handle: Handle,
    links: Mutex<Links>,
    dead: AtomicBool,
}

impl ObjectCore {
    /// Create a core for a freshly allocated handle.
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            links: Mutex::new(Links::default()),
            dead: AtomicBool::new(false),
        }
    }

    /// This object's handle.
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Whether `kill` has run (or is running) on this object.
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Mark the object dead. Returns false if it already was (kill is
    /// idempotent; only the first caller proceeds with teardown).
    pub(crate) fn mark_dead(&self) -> bool {
        !self.dead.swap(true, Ordering::AcqRel)
    }

    /// Current parent link, if any.
    pub fn parent(&self) -> Option<Handle> {
        self.links.lock().unwrap().parent
    }

    pub(crate) fn set_parent(&self, parent: Option<Handle>) {
        self.links.lock().unwrap().parent = parent;
    }

    /// Snapshot of the current child handles.
    pub fn children(&self) -> Vec<Handle> {
        self.links.lock().unwrap().children.iter().copied().collect()
    }

    pub(crate) fn add_child(&self, child: Handle) {
        self.links.lock().unwrap().children.insert(child);
    }

    pub(crate) fn remove_child(&self, child: Handle) {
        self.links.lock().unwrap().children.remove(&child);
    }
}

/// Trait implemented by every object that lives in the handle registry.
///
/// Implementations embed an [`ObjectCore`] and may override [`on_kill`] to
/// release domain state (under their own lock) when the object is torn down.
/// `on_kill` runs after all children have been killed and must not call back
/// into the registry for ancestors.
///
/// [`on_kill`]: DaemonObject::on_kill
pub trait DaemonObject: Send + Sync + 'static {
    /// The embedded lifecycle core.
    fn core(&self) -> &ObjectCore;

    /// Subclass-specific release hook; default does nothing.
    fn on_kill(&self) {}

    /// Upcast for typed registry lookups.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl std::fmt::Debug for dyn DaemonObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonObject")
            .field("handle", &self.core().handle())
            .finish()
    }
}
