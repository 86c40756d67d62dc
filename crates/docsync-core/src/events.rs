//! Event infrastructure for docsync-core.
//!
//! `EventBus<E>` is the listener registry used everywhere a component emits
//! events: channel notices, editor text changes, and `EngineEvent`s for UI
//! observers. Subscribing returns a `Subscription` that detaches on drop.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::document::SyncState;

/// Events the sync engine publishes for whoever renders the document view.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    /// The document moved between `loading` and `ready`.
    StateChanged { state: SyncState },
    /// Loaded content was applied to the editor.
    ContentLoaded {
        /// Document length in characters after load (including replayed changes).
        length: usize,
    },
    /// Displayed title changed (local edit or remote update).
    TitleChanged { title: String },
    /// Presence list changed.
    PresenceChanged { users: Vec<String> },
    /// The server persisted the document.
    Saved,
    /// The channel dropped; a reload follows once it reconnects.
    ConnectionLost,
    /// Transient message for the user (e.g. "Link copied to clipboard!").
    Notification { level: NoticeLevel, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NoticeLevel {
    Info,
    Warning,
}

trait Unsubscribe: Send + Sync {
    fn unsubscribe(&self, id: usize);
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<dyn Unsubscribe>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback<E> = Arc<dyn Fn(E) + Send + Sync>;

/// Event bus for publishing events to subscribers.
///
/// Thread-safe for use in multi-threaded Tokio runtime.
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus<E> {
    callbacks: RwLock<Vec<(usize, Callback<E>)>>,
    next_id: AtomicUsize,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    ///
    /// Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(E) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        let bus: Weak<dyn Unsubscribe> = Arc::downgrade(self) as Weak<dyn Unsubscribe>;
        Subscription { bus, id }
    }

    /// Emit an event to all subscribers, in subscription order.
    pub fn emit(&self, event: E) {
        // Clone the callback list so callbacks may subscribe or unsubscribe.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl<E: Send + 'static> Unsubscribe for EventBus<E> {
    fn unsubscribe(&self, id: usize) {
        // emit() never holds the lock while running callbacks, so this cannot
        // deadlock against a callback that drops its own subscription.
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(i, _)| *i != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_subscribe_and_emit() {
        let bus = Arc::new(EventBus::<EngineEvent>::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let _sub = bus.subscribe(move |_event| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(EngineEvent::Saved);

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let bus = Arc::new(EventBus::<u32>::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        {
            let _sub = bus.subscribe(move |_event| {
                count_clone.fetch_add(1, Ordering::Relaxed);
            });

            bus.emit(1);
            assert_eq!(count.load(Ordering::Relaxed), 1);
        }

        bus.emit(2);
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_subscribers_run_in_order() {
        let bus = Arc::new(EventBus::<u32>::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&seen);
        let _sub1 = bus.subscribe(move |n| first.lock().unwrap().push(("first", n)));
        let second = Arc::clone(&seen);
        let _sub2 = bus.subscribe(move |n| second.lock().unwrap().push(("second", n)));

        bus.emit(1);
        bus.emit(2);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("first", 1), ("second", 1), ("first", 2), ("second", 2)]
        );
    }

    #[test]
    fn test_partial_unsubscribe() {
        let bus = Arc::new(EventBus::<u32>::new());
        let count1 = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::new(AtomicUsize::new(0));

        let count1_clone = Arc::clone(&count1);
        let count2_clone = Arc::clone(&count2);

        let sub1 = bus.subscribe(move |_| {
            count1_clone.fetch_add(1, Ordering::Relaxed);
        });
        let _sub2 = bus.subscribe(move |_| {
            count2_clone.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(1);
        drop(sub1);
        bus.emit(2);

        assert_eq!(count1.load(Ordering::Relaxed), 1);
        assert_eq!(count2.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_drop_subscription_inside_callback() {
        let bus = Arc::new(EventBus::<u32>::new());
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let slot_clone = Arc::clone(&slot);
        let sub = bus.subscribe(move |_| {
            slot_clone.lock().unwrap().take();
        });
        *slot.lock().unwrap() = Some(sub);

        bus.emit(1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_engine_event_serialization() {
        let event = EngineEvent::PresenceChanged {
            users: vec!["alice".into()],
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"presenceChanged\""));
        assert!(json.contains("\"users\":[\"alice\"]"));
    }
}
