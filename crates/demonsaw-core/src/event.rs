//! Observer list for registry and transfer notifications.

use std::sync::{Arc, PoisonError, RwLock};

/// What changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A router session
    Session,
    /// A relay slot
    Transfer,
}

/// How it changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventAction {
    /// Entry created
    Added,
    /// Entry removed
    Removed,
    /// Entry modified
    Updated,
}

/// One notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Kind of entry
    pub kind: EventKind,
    /// Change
    pub action: EventAction,
    /// Entry id
    pub id: String,
}

impl Event {
    /// Build an event.
    #[must_use]
    pub fn new(kind: EventKind, action: EventAction, id: impl Into<String>) -> Self {
        Self {
            kind,
            action,
            id: id.into(),
        }
    }
}

type Observer = Arc<dyn Fn(&Event) + Send + Sync>;

/// Registered observers, called in subscription order.
#[derive(Default, Clone)]
pub struct EventBus {
    observers: Arc<RwLock<Vec<Observer>>>,
}

impl EventBus {
    /// Empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer.
    pub fn subscribe<F>(&self, observer: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(observer));
    }

    /// Deliver `event` to every observer. Observers run outside the lock.
    pub fn publish(&self, event: &Event) {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        tracing::debug!(kind = ?event.kind, action = ?event.action, id = %event.id, "event");
        for observer in observers {
            observer(event);
        }
    }

    /// Number of observers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nobody is listening.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("observers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_publish_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b"] {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |event: &Event| {
                seen.lock().unwrap().push(format!("{tag}:{}", event.id));
            });
        }

        bus.publish(&Event::new(EventKind::Session, EventAction::Added, "x"));
        assert_eq!(*seen.lock().unwrap(), vec!["a:x", "b:x"]);
        assert_eq!(bus.len(), 2);
    }

    #[test]
    fn test_observer_may_subscribe() {
        let bus = EventBus::new();
        let inner = bus.clone();
        bus.subscribe(move |_| inner.subscribe(|_| {}));
        bus.publish(&Event::new(EventKind::Transfer, EventAction::Removed, "y"));
        assert_eq!(bus.len(), 2);
    }
}
