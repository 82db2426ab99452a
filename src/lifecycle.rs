//! Idempotent ownership of session resources
//!
//! Audio engines, the microphone handle, the channel handle and the event
//! task are each held in a [`Resource`] slot. Acquiring never replaces a live
//! handle and releasing hands the handle out exactly once, so teardown paths
//! can run from several places (remote close, disconnect, failed connect)
//! without double-closing anything.

use std::sync::{Mutex, MutexGuard};
use tracing::debug;

pub struct Resource<T> {
    name: &'static str,
    slot: Mutex<Option<T>>,
}

impl<T> Resource<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Mutex::new(None),
        }
    }

    /// Store `value` if the slot is empty. Returns false (and drops `value`)
    /// when a handle is already held.
    pub fn acquire(&self, value: T) -> bool {
        let mut slot = self.lock();
        if slot.is_some() {
            debug!("{} already held, keeping existing handle", self.name);
            return false;
        }
        *slot = Some(value);
        debug!("{} acquired", self.name);
        true
    }

    /// Take the handle out of the slot. Only the first call after an
    /// acquire returns `Some`.
    pub fn release(&self) -> Option<T> {
        let taken = self.lock().take();
        if taken.is_some() {
            debug!("{} released", self.name);
        }
        taken
    }

    pub fn is_held(&self) -> bool {
        self.lock().is_some()
    }

    /// Run `f` against the held handle, if any
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.lock().as_ref().map(f)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        // A panic while holding the slot cannot leave it half-written.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: Clone> Resource<T> {
    pub fn get(&self) -> Option<T> {
        self.lock().clone()
    }
}

impl<T> std::fmt::Debug for Resource<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("name", &self.name)
            .field("held", &self.is_held())
            .finish()
    }
}
