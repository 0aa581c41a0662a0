//! Shared access to the active transport handle.
//!
//! Exactly one [`TransportOwner`] exists per slot and only it can replace the
//! handle. Readers hold cloned [`TransportSlot`]s and look the handle up on
//! every call, so a reconnect is visible to them immediately.

use std::sync::{Arc, PoisonError, RwLock};

pub struct TransportOwner<T> {
    inner: Arc<RwLock<Option<Arc<T>>>>,
}

pub struct TransportSlot<T> {
    inner: Arc<RwLock<Option<Arc<T>>>>,
}

impl<T> TransportSlot<T> {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (TransportOwner<T>, TransportSlot<T>) {
        let inner = Arc::new(RwLock::new(None));
        (
            TransportOwner {
                inner: Arc::clone(&inner),
            },
            TransportSlot { inner },
        )
    }

    /// The handle installed right now, if connected.
    pub fn current(&self) -> Option<Arc<T>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<T> Clone for TransportSlot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> TransportOwner<T> {
    /// Install `transport`, returning the handle it replaced.
    pub fn install(&self, transport: Arc<T>) -> Option<Arc<T>> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(transport)
    }

    pub fn take(&self) -> Option<Arc<T>> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// A reader view onto this owner's slot.
    pub fn slot(&self) -> TransportSlot<T> {
        TransportSlot {
            inner: Arc::clone(&self.inner),
        }
    }
}
