//! What the coordinator reports while it works.
//!
//! A coordinator given an `Arc<EventBus>` emits one [`SyncEvent`] per finished
//! load, save, sync or conflict stop.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Events emitted by the sync coordinator for real-time monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// Remote document read and parsed.
    Loaded {
        #[serde(rename = "documentId")]
        document_id: String,
        version: String,
        /// Milliseconds since Unix epoch.
        timestamp: u64,
    },
    /// Local tree written to the remote document without merging.
    Saved {
        #[serde(rename = "documentId")]
        document_id: String,
        version: String,
        timestamp: u64,
    },
    /// Merge completed and persisted.
    Synced {
        #[serde(rename = "documentId")]
        document_id: String,
        version: String,
        timestamp: u64,
    },
    /// Merge stopped on conflicting categories; nothing was written.
    ConflictsDetected {
        #[serde(rename = "documentId")]
        document_id: String,
        /// Sync keys of the conflicting categories.
        categories: Vec<String>,
        timestamp: u64,
    },
}

/// Keeps a listener registered on an [`EventBus`] for as long as it lives.
#[must_use = "the listener is removed as soon as the subscription is dropped"]
pub struct Subscription {
    bus: Weak<EventBus>,
    key: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.key);
        }
    }
}

type Listener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Fan-out of [`SyncEvent`]s from a coordinator to any number of listeners.
///
/// Listeners run synchronously on the emitting task, in subscription order.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<BTreeMap<u64, Listener>>,
    next_key: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(&SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, Arc::new(listener));
        Subscription {
            bus: Arc::downgrade(self),
            key,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn remove(&self, key: u64) {
        // A listener may drop its own subscription mid-emit
        if let Ok(mut listeners) = self.listeners.try_write() {
            listeners.remove(&key);
        }
    }

    pub fn emit(&self, event: SyncEvent) {
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(&event);
        }
    }
}
