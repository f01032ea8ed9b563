//! Synchronous in-process event bus.
//!
//! `publish` runs every matching handler on the caller's stack before it
//! returns, so observers see events in exactly the order the engine mutates
//! run state. Handlers must not call back into the engine.
//!
//! A bounded history of recent events is kept for late subscribers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use termops_types::event::{Event, EventType};

/// Callback invoked for each matching event.
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Default number of events retained in history.
pub const DEFAULT_HISTORY: usize = 100;

struct Subscription {
    filter: Option<EventType>,
    handler: EventHandler,
}

struct Inner {
    subscriptions: Mutex<Vec<Subscription>>,
    history: Mutex<VecDeque<Event>>,
    capacity: usize,
}

/// Single-process publish/subscribe mediator.
///
/// Cloning the bus shares subscriptions and history.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking handler never runs while a lock is held.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl EventBus {
    /// Create a bus retaining up to `capacity` recent events.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscriptions: Mutex::new(Vec::new()),
                history: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
            }),
        }
    }

    /// Register a handler for one event type.
    pub fn subscribe<F>(&self, event_type: EventType, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        lock(&self.inner.subscriptions).push(Subscription {
            filter: Some(event_type),
            handler: Arc::new(handler),
        });
    }

    /// Register a handler for every event type.
    pub fn subscribe_all<F>(&self, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        lock(&self.inner.subscriptions).push(Subscription {
            filter: None,
            handler: Arc::new(handler),
        });
    }

    /// Record the event and invoke all matching handlers in registration order.
    pub fn publish(&self, event: Event) {
        {
            let mut history = lock(&self.inner.history);
            if self.inner.capacity > 0 {
                if history.len() == self.inner.capacity {
                    history.pop_front();
                }
                history.push_back(event.clone());
            }
        }

        // Snapshot so handlers may subscribe without deadlocking.
        let handlers: Vec<EventHandler> = lock(&self.inner.subscriptions)
            .iter()
            .filter(|s| s.filter.is_none_or(|t| t == event.event_type))
            .map(|s| Arc::clone(&s.handler))
            .collect();

        for handler in handlers {
            handler(&event);
        }
    }

    /// Recent events, oldest first.
    pub fn recent_events(&self) -> Vec<Event> {
        lock(&self.inner.history).iter().cloned().collect()
    }

    /// Recent events of one type, oldest first.
    pub fn recent_by_type(&self, event_type: EventType) -> Vec<Event> {
        lock(&self.inner.history)
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscriptions).len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}
