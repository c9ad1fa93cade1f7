//! Lifecycle listeners for extension points.
//!
//! A listener observes points coming and going. Adding one with replay
//! fires the registration callback for everything already registered,
//! which is the principal mechanism for attaching advice in bulk;
//! removing one with inverse replay fires the unregistration callback
//! for everything still registered, which is where a listener typically
//! detaches its advice by id.

use std::sync::Arc;

use crate::point::FnExtensionPoint;
use crate::registry;

/// An observer of extension-point registration events.
///
/// Both callbacks default to doing nothing; implement whichever you need.
pub trait Listener {
    /// Called when an extension point is registered, and for every
    /// already-registered point when the listener is added with replay.
    fn on_extension_point_register(&self, _point: &FnExtensionPoint) {}

    /// Called when an extension point is unregistered, and for every
    /// still-registered point when the listener is removed with inverse
    /// replay.
    fn on_extension_point_unregister(&self, _point: &FnExtensionPoint) {}
}

/// Add a listener. A listener is in the global list at most once; adding
/// an already-added listener is a no-op. With `notify_existing`, the
/// registration callback fires for every currently registered point, in
/// unspecified order.
pub fn add_listener(listener: Arc<dyn Listener>, notify_existing: bool) {
    registry::add_listener(listener, notify_existing);
}

/// Remove a listener. A no-op if it was never added. With
/// `notify_existing`, the unregistration callback fires for every
/// registered point so the listener can clean up advice it attached.
pub fn remove_listener(listener: &Arc<dyn Listener>, notify_existing: bool) {
    registry::remove_listener(listener, notify_existing);
}

/// RAII wrapper that adds a listener on construction (with replay) and
/// removes it on drop (with inverse replay).
pub struct ListenerGuard {
    listener: Arc<dyn Listener>,
}

impl ListenerGuard {
    /// Add `listener` and keep it added for the guard's lifetime.
    #[must_use]
    pub fn new(listener: Arc<dyn Listener>) -> Self {
        add_listener(listener.clone(), true);
        ListenerGuard { listener }
    }

    /// The wrapped listener.
    #[must_use]
    pub fn listener(&self) -> &Arc<dyn Listener> {
        &self.listener
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        remove_listener(&self.listener, true);
    }
}
