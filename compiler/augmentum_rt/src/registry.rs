//! The process-wide extension-point registry.
//!
//! Every per-function constructor the rewriter synthesises registers its
//! extension point here, keyed by `module::symbol`. Listeners observe
//! registration and unregistration; on the first touch of the registry a
//! teardown hook is installed with `atexit` that, at process exit,
//! notifies every listener, resets every dispatch slot to its original
//! body and releases every point — in that order, exactly once, and
//! harmlessly when nothing was ever instrumented.
//!
//! Locking discipline: the registry mutex is never held across a listener
//! callback. Notification works on a snapshot taken under the lock, so
//! callbacks are free to call [`lookup`] or attach advice.

use std::sync::{Arc, Once, OnceLock};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::listener::Listener;
use crate::point::FnExtensionPoint;

/// Raw pointer to a heap-allocated point. Points are created by module
/// constructors, have stable addresses and are only freed by [`teardown`].
#[derive(Clone, Copy)]
struct PointPtr(*mut FnExtensionPoint);

// SAFETY: mutation of points and the registry is single-threaded by the
// library contract; the map itself is lock-protected.
unsafe impl Send for PointPtr {}

#[derive(Default)]
struct Registry {
    points: FxHashMap<String, PointPtr>,
    listeners: Vec<Arc<dyn Listener>>,
}

// SAFETY: see PointPtr. Listener callbacks run on the registering thread.
unsafe impl Send for Registry {}

fn registry() -> &'static Mutex<Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        // SAFETY: teardown is an extern "C" fn with no preconditions.
        unsafe { libc::atexit(teardown) };
        Mutex::new(Registry::default())
    })
}

extern "C" fn teardown() {
    static ONCE: Once = Once::new();
    ONCE.call_once(empty_registry);
}

fn key_for(module_name: &str, name: &str) -> String {
    format!("{module_name}::{name}")
}

/// Listener identity is the listener allocation, not the vtable.
fn same_listener(a: &Arc<dyn Listener>, b: &Arc<dyn Listener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Look up a registered extension point by module and symbol name.
#[must_use]
pub fn lookup(module_name: &str, name: &str) -> Option<&'static FnExtensionPoint> {
    let reg = registry().lock();
    // SAFETY: registered points live until process exit.
    reg.points
        .get(&key_for(module_name, name))
        .map(|p| unsafe { &*p.0 })
}

/// Insert a point and notify listeners. Notification happens after the
/// insert has taken effect, so lookups from within a callback succeed.
pub(crate) fn register(point: *mut FnExtensionPoint) {
    // SAFETY: point is a live allocation handed over by its constructor.
    let pt = unsafe { &*point };
    let key = key_for(pt.module_name(), pt.name());
    let listeners = {
        let mut reg = registry().lock();
        reg.points.insert(key.clone(), PointPtr(point));
        reg.listeners.clone()
    };
    debug!(point = %key, "registered extension point");
    for listener in &listeners {
        listener.on_extension_point_register(pt);
    }
}

/// Take a point out of the registry: notify listeners, reset it to its
/// original body, then remove it from the map, in that order. The point
/// itself stays alive until process exit.
pub fn unregister(point: &FnExtensionPoint) {
    let key = key_for(point.module_name(), point.name());
    let listeners = registry().lock().listeners.clone();
    for listener in &listeners {
        listener.on_extension_point_unregister(point);
    }
    point.reset();
    registry().lock().points.remove(&key);
    debug!(point = %key, "unregistered extension point");
}

pub(crate) fn add_listener(listener: Arc<dyn Listener>, notify_existing: bool) {
    let points: Vec<PointPtr> = {
        let mut reg = registry().lock();
        if reg.listeners.iter().any(|l| same_listener(l, &listener)) {
            return;
        }
        reg.listeners.push(listener.clone());
        if notify_existing {
            reg.points.values().copied().collect()
        } else {
            Vec::new()
        }
    };
    for point in points {
        // SAFETY: registered points live until process exit.
        listener.on_extension_point_register(unsafe { &*point.0 });
    }
}

pub(crate) fn remove_listener(listener: &Arc<dyn Listener>, notify_existing: bool) {
    let points: Vec<PointPtr> = {
        let mut reg = registry().lock();
        let before = reg.listeners.len();
        reg.listeners.retain(|l| !same_listener(l, listener));
        if reg.listeners.len() == before {
            // Was never added; nothing to replay.
            return;
        }
        if notify_existing {
            reg.points.values().copied().collect()
        } else {
            Vec::new()
        }
    };
    for point in points {
        // SAFETY: registered points live until process exit.
        listener.on_extension_point_unregister(unsafe { &*point.0 });
    }
}

/// Notify, reset and release every registered point, then drop the map.
/// Type descriptors are deliberately left alone; they are owned by the
/// interning tables and the process is about to exit.
pub(crate) fn empty_registry() {
    let (points, listeners) = {
        let reg = registry().lock();
        (
            reg.points.values().copied().collect::<Vec<_>>(),
            reg.listeners.clone(),
        )
    };
    for point in &points {
        // SAFETY: points are live until freed below.
        let pt = unsafe { &*point.0 };
        for listener in &listeners {
            listener.on_extension_point_unregister(pt);
        }
        pt.reset();
    }
    let drained: Vec<PointPtr> = {
        let mut reg = registry().lock();
        reg.points.drain().map(|(_, p)| p).collect()
    };
    for point in drained {
        // SAFETY: the map held the owning reference; each point was
        // Box-allocated by create_extension_point.
        drop(unsafe { Box::from_raw(point.0) });
    }
    debug!("extension point registry emptied");
}
