//! The process-wide handle registry.

use crate::{DaemonObject, Handle, RegistryError, RegistryResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Map from opaque handles to live objects.
///
/// The registry holds the strong reference that keeps a registered object
/// alive; killing an object removes that reference. The internal lock is held
/// only for map lookups and mutations, never across domain operations.
pub struct Registry {
    objects: Mutex<HashMap<Handle, Arc<dyn DaemonObject>>>,
    next_handle: AtomicU64,
}

impl Registry {
    /// Create an empty registry. Handle 0 is never issued.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        })
    }

    /// Allocate a handle and register the object built for it.
    ///
    /// The constructor closure receives the new handle so the object can
    /// embed it in its [`ObjectCore`](crate::ObjectCore).
    pub fn register<T, F>(&self, make: F) -> Arc<T>
    where
        T: DaemonObject,
        F: FnOnce(Handle) -> Arc<T>,
    {
        let handle = Handle::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let object = make(handle);
        debug_assert_eq!(object.core().handle(), handle);
        self.objects
            .lock()
            .unwrap()
            .insert(handle, object.clone() as Arc<dyn DaemonObject>);
        debug!(handle = %handle, "object registered");
        object
    }

    /// Look up a live object without knowing its concrete type.
    pub fn lookup_raw(&self, handle: Handle) -> RegistryResult<Arc<dyn DaemonObject>> {
        let objects = self.objects.lock().unwrap();
        match objects.get(&handle) {
            Some(object) if !object.core().is_dead() => Ok(object.clone()),
            _ => Err(RegistryError::InvalidHandle(handle)),
        }
    }

    /// Look up a live object of a concrete type.
    ///
    /// A handle that resolves to an object of a different type is treated the
    /// same as an unknown handle.
    pub fn lookup<T: DaemonObject>(&self, handle: Handle) -> RegistryResult<Arc<T>> {
        let object = self.lookup_raw(handle)?;
        object
            .as_any()
            .downcast::<T>()
            .map_err(|_| RegistryError::InvalidHandle(handle))
    }

    /// Whether a handle currently resolves to a live object.
    pub fn contains(&self, handle: Handle) -> bool {
        self.lookup_raw(handle).is_ok()
    }

    /// Number of live registered objects.
    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// True if no objects are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Link `child` under `parent`. Both must be live.
    pub fn adopt(&self, parent: Handle, child: Handle) -> RegistryResult<()> {
        let parent_obj = self.lookup_raw(parent)?;
        let child_obj = self.lookup_raw(child)?;

        if let Some(old_parent) = child_obj.core().parent() {
            if let Ok(old) = self.lookup_raw(old_parent) {
                old.core().remove_child(child);
            }
        }
        child_obj.core().set_parent(Some(parent));
        parent_obj.core().add_child(child);
        Ok(())
    }

    /// Tear down an object: mark dead, kill children depth-first, run the
    /// object's release hook, unlink from its parent, drop the registry
    /// reference.
    ///
    /// Killing an unknown or already-dead handle is a no-op.
    pub fn kill(&self, handle: Handle) {
        let object = {
            let objects = self.objects.lock().unwrap();
            match objects.get(&handle) {
                Some(object) => object.clone(),
                None => return,
            }
        };

        if !object.core().mark_dead() {
            return; // someone else is already tearing it down
        }

        // Children first, parent-to-child lock order.
        for child in object.core().children() {
            self.kill(child);
        }

        object.on_kill();

        if let Some(parent) = object.core().parent() {
            if let Ok(parent_obj) = self.lookup_raw(parent) {
                parent_obj.core().remove_child(handle);
            }
        }
        object.core().set_parent(None);

        self.objects.lock().unwrap().remove(&handle);
        debug!(handle = %handle, "object killed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObjectCore;
    use std::any::Any;
    use std::sync::atomic::AtomicUsize;

    struct Node {
        core: ObjectCore,
        kills: Arc<AtomicUsize>,
    }

    impl Node {
        fn register(registry: &Registry, kills: Arc<AtomicUsize>) -> Arc<Node> {
            registry.register(|handle| {
                Arc::new(Node {
                    core: ObjectCore::new(handle),
                    kills,
                })
            })
        }
    }

    impl DaemonObject for Node {
        fn core(&self) -> &ObjectCore {
            &self.core
        }

        fn on_kill(&self) {
            self.kills.fetch_add(1, Ordering::SeqCst);
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    struct Other {
        core: ObjectCore,
    }

    impl DaemonObject for Other {
        fn core(&self) -> &ObjectCore {
            &self.core
        }

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = Registry::new();
        let kills = Arc::new(AtomicUsize::new(0));
        let node = Node::register(&registry, kills);

        let found = registry.lookup::<Node>(node.core().handle()).unwrap();
        assert_eq!(found.core().handle(), node.core().handle());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_lookup_unknown_handle_fails() {
        let registry = Registry::new();
        let err = registry.lookup_raw(Handle::from_raw(999)).unwrap_err();
        assert_eq!(err, RegistryError::InvalidHandle(Handle::from_raw(999)));
    }

    #[test]
    fn test_lookup_wrong_type_fails() {
        let registry = Registry::new();
        let other = registry.register(|handle| {
            Arc::new(Other {
                core: ObjectCore::new(handle),
            })
        });
        assert!(registry.lookup::<Node>(other.core().handle()).is_err());
    }

    #[test]
    fn test_handles_are_unique() {
        let registry = Registry::new();
        let kills = Arc::new(AtomicUsize::new(0));
        let a = Node::register(&registry, kills.clone());
        let b = Node::register(&registry, kills);
        assert_ne!(a.core().handle(), b.core().handle());
    }

    #[test]
    fn test_kill_cascades_to_children() {
        let registry = Registry::new();
        let kills = Arc::new(AtomicUsize::new(0));
        let parent = Node::register(&registry, kills.clone());
        let child = Node::register(&registry, kills.clone());
        let grandchild = Node::register(&registry, kills.clone());

        registry
            .adopt(parent.core().handle(), child.core().handle())
            .unwrap();
        registry
            .adopt(child.core().handle(), grandchild.core().handle())
            .unwrap();

        registry.kill(parent.core().handle());

        assert_eq!(kills.load(Ordering::SeqCst), 3);
        assert!(registry.is_empty());
        assert!(parent.core().is_dead());
        assert!(child.core().is_dead());
        assert!(grandchild.core().is_dead());
    }

    #[test]
    fn test_kill_is_idempotent() {
        let registry = Registry::new();
        let kills = Arc::new(AtomicUsize::new(0));
        let node = Node::register(&registry, kills.clone());

        registry.kill(node.core().handle());
        registry.kill(node.core().handle());

        assert_eq!(kills.load(Ordering::SeqCst), 1);
        assert!(registry
            .lookup::<Node>(node.core().handle())
            .is_err());
    }

    #[test]
    fn test_kill_unlinks_from_parent() {
        let registry = Registry::new();
        let kills = Arc::new(AtomicUsize::new(0));
        let parent = Node::register(&registry, kills.clone());
        let child = Node::register(&registry, kills);

        registry
            .adopt(parent.core().handle(), child.core().handle())
            .unwrap();
        registry.kill(child.core().handle());

        assert!(parent.core().children().is_empty());
        assert!(registry.contains(parent.core().handle()));
    }

    #[test]
    fn test_adopt_reparents() {
        let registry = Registry::new();
        let kills = Arc::new(AtomicUsize::new(0));
        let first = Node::register(&registry, kills.clone());
        let second = Node::register(&registry, kills.clone());
        let child = Node::register(&registry, kills);

        registry
            .adopt(first.core().handle(), child.core().handle())
            .unwrap();
        registry
            .adopt(second.core().handle(), child.core().handle())
            .unwrap();

        assert!(first.core().children().is_empty());
        assert_eq!(second.core().children(), vec![child.core().handle()]);
        assert_eq!(child.core().parent(), Some(second.core().handle()));
    }
}
