//! Event infrastructure for scheme-core.
//!
//! Provides `StoreEvent` for monitoring and `EventBus` for subscriptions.
//! Processor callbacks carry the semantic lifecycle; the bus only reports what
//! the store did, for logging and diagnostics.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

/// Events emitted by a store for real-time monitoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StoreEvent {
    /// A load or reload pass finished.
    SchemesLoaded {
        /// Managed directory.
        directory: String,
        /// Number of schemes read by this pass.
        loaded: usize,
        /// Size of the scheme list afterwards.
        total: usize,
    },
    /// A scheme file was written by `save`.
    SchemeWritten {
        /// Logical path written.
        path: String,
        /// Whether the path went to the roaming provider.
        #[serde(rename = "viaProvider")]
        via_provider: bool,
    },
    /// A scheduled file was deleted.
    SchemeFileDeleted {
        /// Logical path deleted.
        path: String,
    },
    /// A batch of external change events was applied.
    ChangesApplied {
        /// Managed directory.
        directory: String,
        /// Semantic events left after coalescing.
        events: usize,
    },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

/// Event bus for publishing store events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
#[derive(Default)]
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    ///
    /// Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&StoreEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.write().push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run while emit holds the read lock
        if let Some(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: StoreEvent) {
        // Clone the callback list so a callback may subscribe without deadlocking.
        let callbacks: Vec<Callback> = self
            .callbacks
            .read()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn written(path: &str) -> StoreEvent {
        StoreEvent::SchemeWritten {
            path: path.into(),
            via_provider: false,
        }
    }

    #[test]
    fn test_subscribe_and_emit() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let _sub = bus.subscribe(move |_event| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(written("schemes/a.json"));

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        {
            let _sub = bus.subscribe(move |_event| {
                count_clone.fetch_add(1, Ordering::Relaxed);
            });
            bus.emit(written("schemes/a.json"));
            assert_eq!(count.load(Ordering::Relaxed), 1);
        }

        bus.emit(written("schemes/b.json"));

        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_callback_sees_event_payload() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(RwLock::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let _sub = bus.subscribe(move |event| {
            seen_clone.write().push(event.clone());
        });
        bus.emit(StoreEvent::SchemeFileDeleted {
            path: "schemes/old.json".into(),
        });

        assert_eq!(
            *seen.read(),
            vec![StoreEvent::SchemeFileDeleted {
                path: "schemes/old.json".into()
            }]
        );
    }

    #[test]
    fn test_store_event_serialization() {
        let event = StoreEvent::SchemeWritten {
            path: "schemes/a.json".into(),
            via_provider: true,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"schemeWritten\""));
        assert!(json.contains("\"viaProvider\":true"));
        assert!(json.contains("\"path\":\"schemes/a.json\""));
    }
}
