//! Typed event bus.
//!
//! Listener registries across the transport (channel, server, peer) share
//! this bus: events are a closed enum, listeners subscribe to one event
//! kind, and `once` listeners deregister themselves after the first
//! invocation. Callbacks run outside the registry lock so they may
//! re-enter the bus (`off` from within a callback is fine).

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

/// An event type with a closed kind enum.
pub trait Event {
    /// Discriminant used to key subscriber lists.
    type Kind: Copy + Eq + Hash;

    /// The kind of this event instance.
    fn kind(&self) -> Self::Kind;
}

/// Handle returned by `on`/`once`, used to deregister a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Subscriber<E: Event> {
    id: u64,
    once: bool,
    callback: Callback<E>,
}

struct BusInner<E: Event> {
    next_id: u64,
    listeners: HashMap<E::Kind, Vec<Subscriber<E>>>,
}

/// Event bus keyed by a closed event-kind enum.
///
/// Each kind maps to an ordered subscriber list; `emit` invokes the
/// list in registration order.
pub struct EventBus<E: Event> {
    inner: Mutex<BusInner<E>>,
}

impl<E: Event> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> EventBus<E> {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BusInner {
                next_id: 0,
                listeners: HashMap::new(),
            }),
        }
    }

    fn locked(&self) -> MutexGuard<'_, BusInner<E>> {
        // A panicking callback never runs under this lock, so poisoning
        // cannot leave the registry in a torn state.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a listener for one event kind.
    pub fn on<F>(&self, kind: E::Kind, callback: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.subscribe(kind, false, callback)
    }

    /// Register a listener that deregisters itself after the first event.
    pub fn once<F>(&self, kind: E::Kind, callback: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.subscribe(kind, true, callback)
    }

    fn subscribe<F>(&self, kind: E::Kind, once: bool, callback: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let mut inner = self.locked();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.listeners.entry(kind).or_default().push(Subscriber {
            id,
            once,
            callback: Arc::new(callback),
        });
        ListenerId(id)
    }

    /// Deregister a listener. Returns false if it was already gone.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut inner = self.locked();
        for subscribers in inner.listeners.values_mut() {
            if let Some(pos) = subscribers.iter().position(|s| s.id == id.0) {
                subscribers.remove(pos);
                return true;
            }
        }
        false
    }

    /// Emit an event to every listener of its kind, in registration order.
    ///
    /// `once` listeners are removed before their callback runs, so they
    /// fire at most once even when emits race.
    pub fn emit(&self, event: &E) {
        let callbacks: Vec<Callback<E>> = {
            let mut inner = self.locked();
            match inner.listeners.get_mut(&event.kind()) {
                Some(subscribers) => {
                    let callbacks = subscribers.iter().map(|s| Arc::clone(&s.callback)).collect();
                    subscribers.retain(|s| !s.once);
                    callbacks
                }
                None => return,
            }
        };

        for callback in callbacks {
            callback(event);
        }
    }

    /// Number of listeners registered for a kind.
    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.locked().listeners.get(&kind).map_or(0, Vec::len)
    }

    /// Remove every listener.
    pub fn clear(&self) {
        self.locked().listeners.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum TestKind {
        Ping,
        Pong,
    }

    #[derive(Debug)]
    struct TestEvent(TestKind);

    impl Event for TestEvent {
        type Kind = TestKind;

        fn kind(&self) -> TestKind {
            self.0
        }
    }

    #[test]
    fn listeners_fire_in_registration_order() {
        let bus = EventBus::<TestEvent>::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.on(TestKind::Ping, move |_| {
                order.lock().unwrap().push(tag);
            });
        }

        bus.emit(&TestEvent(TestKind::Ping));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn once_listener_fires_exactly_once() {
        let bus = EventBus::<TestEvent>::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_clone = Arc::clone(&hits);
        bus.once(TestKind::Ping, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&TestEvent(TestKind::Ping));
        bus.emit(&TestEvent(TestKind::Ping));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(TestKind::Ping), 0);
    }

    #[test]
    fn off_removes_only_the_target_listener() {
        let bus = EventBus::<TestEvent>::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_a = Arc::clone(&hits);
        let id = bus.on(TestKind::Ping, move |_| {
            hits_a.fetch_add(1, Ordering::SeqCst);
        });
        let hits_b = Arc::clone(&hits);
        bus.on(TestKind::Ping, move |_| {
            hits_b.fetch_add(10, Ordering::SeqCst);
        });

        assert!(bus.off(id));
        assert!(!bus.off(id));

        bus.emit(&TestEvent(TestKind::Ping));
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn kinds_are_isolated() {
        let bus = EventBus::<TestEvent>::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_clone = Arc::clone(&hits);
        bus.on(TestKind::Pong, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&TestEvent(TestKind::Ping));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        bus.emit(&TestEvent(TestKind::Pong));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_may_deregister_itself() {
        let bus = Arc::new(EventBus::<TestEvent>::new());
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let bus_clone = Arc::clone(&bus);
        let slot_clone = Arc::clone(&slot);
        let id = bus.on(TestKind::Ping, move |_| {
            if let Some(id) = slot_clone.lock().unwrap().take() {
                bus_clone.off(id);
            }
        });
        *slot.lock().unwrap() = Some(id);

        bus.emit(&TestEvent(TestKind::Ping));
        assert_eq!(bus.listener_count(TestKind::Ping), 0);
    }
}
