//! Synchronous listener registry for snapshot observers. Listeners are
//! invoked after the state (and its cached snapshot) has been updated, so
//! a `get_snapshot` inside a listener always observes the notified state.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
};

type Listener = Arc<dyn Fn() + Send + Sync + 'static>;

#[derive(Default)]
pub(crate) struct Listeners(Arc<Inner>);

#[derive(Default)]
struct Inner {
    map: std::sync::RwLock<HashMap<usize, Listener>>,
    next_id: AtomicUsize,
}

impl Listeners {
    pub fn new() -> Self { Self::default() }

    pub fn add(&self, listener: impl Fn() + Send + Sync + 'static) -> ListenerGuard {
        let id = self.0.next_id.fetch_add(1, Ordering::Relaxed);
        self.0.map.write().expect("listeners lock poisoned").insert(id, Arc::new(listener));
        ListenerGuard { inner: Arc::downgrade(&self.0), id }
    }

    /// Call every listener. The registry lock is released first so a
    /// listener may subscribe or unsubscribe reentrantly.
    pub fn notify(&self) {
        let listeners: Vec<Listener> = {
            let map = self.0.map.read().expect("listeners lock poisoned");
            map.values().cloned().collect()
        };
        for listener in listeners {
            listener();
        }
    }

    pub fn clear(&self) { self.0.map.write().expect("listeners lock poisoned").clear(); }

    pub fn len(&self) -> usize { self.0.map.read().expect("listeners lock poisoned").len() }
}

/// Unsubscribes its listener on drop.
pub struct ListenerGuard {
    inner: Weak<Inner>,
    id: usize,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.map.write().expect("listeners lock poisoned").remove(&self.id);
        }
    }
}
