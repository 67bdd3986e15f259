//! In-process notification bus for sink state changes.
//!
//! Subscribers register a handler and keep the returned [`Subscription`]; dropping it
//! unregisters the handler. Handlers run on the publishing thread, outside the registry lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::TrackState;

type Handler = Arc<dyn Fn(&TrackState) + Send + Sync>;

struct Entry {
    key: u64,
    active: Arc<AtomicBool>,
    handler: Handler,
}

#[derive(Default)]
struct BusInner {
    next_key: AtomicU64,
    entries: Mutex<Vec<Entry>>,
}

/// Cloneable handle to a shared handler registry.
#[derive(Clone, Default)]
pub struct NotificationBus {
    inner: Arc<BusInner>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for every published state.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&TrackState) + Send + Sync + 'static,
    {
        let key = self.inner.next_key.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        if let Ok(mut entries) = self.inner.entries.lock() {
            entries.push(Entry {
                key,
                active: active.clone(),
                handler: Arc::new(handler),
            });
        }
        Subscription {
            key,
            active,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `state` to every live subscriber in registration order.
    pub fn publish(&self, state: &TrackState) {
        let targets: Vec<(Arc<AtomicBool>, Handler)> = match self.inner.entries.lock() {
            Ok(entries) => entries
                .iter()
                .map(|e| (e.active.clone(), e.handler.clone()))
                .collect(),
            Err(_) => return,
        };
        for (active, handler) in targets {
            if active.load(Ordering::Acquire) {
                handler(state);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .entries
            .lock()
            .map(|entries| entries.len())
            .unwrap_or(0)
    }
}

/// Registration handle returned by [`NotificationBus::subscribe`].
pub struct Subscription {
    key: u64,
    active: Arc<AtomicBool>,
    bus: Weak<BusInner>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
        if let Some(bus) = self.bus.upgrade() {
            if let Ok(mut entries) = bus.entries.lock() {
                entries.retain(|e| e.key != self.key);
            }
        }
    }
}
