//! Reference-counted lifecycle management for engine resources.
//!
//! Computation cycles (and any other resource implementing
//! [`EngineResource`]) are tracked in a live-resource map. Creating a
//! resource starts its count at one; acquiring a further reference requires
//! a positive count and increments it atomically — a resource whose count
//! has reached zero is being released and must not be resurrected. When the
//! count reaches zero the resource is removed from the map and released
//! exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;
use uuid::Uuid;

/// A resource whose lifetime is managed by a [`ResourceManager`].
pub trait EngineResource: Send + Sync {
    /// Called exactly once, when the last reference is released.
    fn release_resources(&self);
}

struct Entry<R> {
    resource: Arc<R>,
    count: usize,
}

/// Live-resource map with atomic acquire/release.
pub struct ResourceManager<R: EngineResource> {
    live: Mutex<HashMap<Uuid, Entry<R>>>,
    this: Weak<ResourceManager<R>>,
}

impl<R: EngineResource> ResourceManager<R> {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            live: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    fn handle(&self) -> Arc<Self> {
        self.this.upgrade().expect("manager still referenced")
    }

    /// Register a resource with an initial count of one, returning the
    /// initial reference.
    pub fn insert(&self, id: Uuid, resource: Arc<R>) -> ResourceReference<R> {
        let mut live = self.live.lock().unwrap();
        live.insert(
            id,
            Entry {
                resource: Arc::clone(&resource),
                count: 1,
            },
        );
        ResourceReference {
            manager: self.handle(),
            id,
            resource,
            released: AtomicBool::new(false),
        }
    }

    /// Acquire a reference to a live resource. Fails (returns `None`) if
    /// the id is unknown or the resource's count already reached zero.
    pub fn create_reference(&self, id: Uuid) -> Option<ResourceReference<R>> {
        let mut live = self.live.lock().unwrap();
        let entry = live.get_mut(&id)?;
        if entry.count == 0 {
            return None;
        }
        entry.count += 1;
        Some(ResourceReference {
            manager: self.handle(),
            id,
            resource: Arc::clone(&entry.resource),
            released: AtomicBool::new(false),
        })
    }

    /// Whether the resource is present in the live map.
    pub fn is_live(&self, id: Uuid) -> bool {
        self.live.lock().unwrap().contains_key(&id)
    }

    /// Current reference count, if live.
    pub fn reference_count(&self, id: Uuid) -> Option<usize> {
        self.live.lock().unwrap().get(&id).map(|e| e.count)
    }

    fn release_id(&self, id: Uuid) {
        let released = {
            let mut live = self.live.lock().unwrap();
            let Some(entry) = live.get_mut(&id) else {
                return;
            };
            entry.count -= 1;
            if entry.count == 0 {
                live.remove(&id).map(|entry| entry.resource)
            } else {
                None
            }
        };
        // Release outside the lock; the map no longer knows the id, so a
        // concurrent create_reference cannot resurrect it.
        if let Some(resource) = released {
            debug!(resource = %id, "last reference released");
            resource.release_resources();
        }
    }
}

/// A counted reference to a live resource. Dropping it releases the
/// reference; `release()` does so explicitly.
pub struct ResourceReference<R: EngineResource> {
    manager: Arc<ResourceManager<R>>,
    id: Uuid,
    resource: Arc<R>,
    released: AtomicBool,
}

impl<R: EngineResource> ResourceReference<R> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn resource(&self) -> &Arc<R> {
        &self.resource
    }

    /// Release this reference. Safe to call once; `Drop` covers the rest.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.manager.release_id(self.id);
        }
    }
}

impl<R: EngineResource> Drop for ResourceReference<R> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Holds at most one reference at a time, implementing sliding-window
/// retention: retaining a new id releases the old one, and retaining the
/// id already held is a no-op.
pub struct ResourceRetainer<R: EngineResource> {
    current: Mutex<Option<ResourceReference<R>>>,
}

impl<R: EngineResource> Default for ResourceRetainer<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: EngineResource> ResourceRetainer<R> {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }

    /// Swap the held reference to the given resource. Returns false if the
    /// resource could not be acquired (the old reference is still released
    /// first, per the swap discipline).
    pub fn retain(&self, manager: &ResourceManager<R>, id: Uuid) -> bool {
        let mut current = self.current.lock().unwrap();
        if current.as_ref().map(|r| r.id()) == Some(id) {
            return true;
        }
        if let Some(old) = current.take() {
            old.release();
        }
        match manager.create_reference(id) {
            Some(reference) => {
                *current = Some(reference);
                true
            }
            None => false,
        }
    }

    /// The currently-retained resource, if any.
    pub fn resource(&self) -> Option<Arc<R>> {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .map(|r| Arc::clone(r.resource()))
    }

    pub fn retained_id(&self) -> Option<Uuid> {
        self.current.lock().unwrap().as_ref().map(|r| r.id())
    }

    /// Drop the held reference, if any.
    pub fn release(&self) {
        if let Some(reference) = self.current.lock().unwrap().take() {
            reference.release();
        }
    }
}
