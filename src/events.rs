//! In-process event bus for connection lifecycle notifications
//!
//! Listeners register for one or more [`EventKind`]s and receive every
//! [`Event`] fired under those kinds. Dispatch works on a snapshot of the
//! listener table, so handlers may register or remove listeners (themselves
//! included) while being invoked; such changes only affect later fires.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};
use uuid::Uuid;

/// Dispatch key for the event bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    Error,
    /// The transport lost its socket and is re-establishing it
    Reconnecting,
    /// The transport dropped messages for a slow subscriber
    SlowConsumer,
    /// The server announced it is about to shut down
    LameDuck,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::Connected,
        EventKind::Disconnected,
        EventKind::Error,
        EventKind::Reconnecting,
        EventKind::SlowConsumer,
        EventKind::LameDuck,
    ];
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Connected => "connected",
            EventKind::Disconnected => "disconnected",
            EventKind::Error => "error",
            EventKind::Reconnecting => "reconnecting",
            EventKind::SlowConsumer => "slow_consumer",
            EventKind::LameDuck => "lame_duck",
        };
        f.write_str(name)
    }
}

/// A lifecycle notification delivered to listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connected,
    Disconnected,
    Error(String),
    Reconnecting,
    /// Transport id of the subscription that fell behind
    SlowConsumer(u64),
    LameDuck,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Connected => EventKind::Connected,
            Event::Disconnected => EventKind::Disconnected,
            Event::Error(_) => EventKind::Error,
            Event::Reconnecting => EventKind::Reconnecting,
            Event::SlowConsumer(_) => EventKind::SlowConsumer,
            Event::LameDuck => EventKind::LameDuck,
        }
    }
}

/// Identifier returned by [`EventBus::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handler invoked for fired events
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// One registration, shared by every kind it was registered under
struct ListenerEntry {
    id: ListenerId,
    handler: EventHandler,
    auto_off: bool,
    /// Set once an auto_off entry has been claimed by a dispatch
    spent: AtomicBool,
}

/// Listener table keyed by event kind
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<HashMap<EventKind, Vec<Arc<ListenerEntry>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under every kind in `events`
    ///
    /// With `auto_off` the listener is removed from all of its kinds the
    /// first time any of them fires.
    pub fn register<F>(&self, events: &[EventKind], auto_off: bool, handler: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = ListenerId(Uuid::new_v4());
        let entry = Arc::new(ListenerEntry {
            id,
            handler: Arc::new(handler),
            auto_off,
            spent: AtomicBool::new(false),
        });

        let mut listeners = self.listeners.lock();
        for kind in events {
            let entries = listeners.entry(*kind).or_default();
            // Registering the same kind twice in one call must not double-invoke
            if !entries.iter().any(|e| e.id == id) {
                entries.push(entry.clone());
            }
        }

        trace!(listener = %id, kinds = ?events, auto_off, "Registered listener");
        id
    }

    /// Register a persistent listener
    pub fn on<F>(&self, events: &[EventKind], handler: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(events, false, handler)
    }

    /// Register a listener that fires at most once
    pub fn once<F>(&self, events: &[EventKind], handler: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(events, true, handler)
    }

    /// Remove a listener from every kind it was registered under
    pub fn unregister(&self, id: ListenerId) {
        let mut listeners = self.listeners.lock();
        for entries in listeners.values_mut() {
            entries.retain(|e| e.id != id);
        }
        listeners.retain(|_, entries| !entries.is_empty());
    }

    /// Alias for [`EventBus::unregister`]
    pub fn off(&self, id: ListenerId) {
        self.unregister(id);
    }

    /// Dispatch `event` to its listeners in registration order
    ///
    /// A listener that panics is logged and skipped; the rest still run.
    pub fn fire(&self, event: &Event) {
        let kind = event.kind();
        let snapshot: Vec<Arc<ListenerEntry>> = match self.listeners.lock().get(&kind) {
            Some(entries) => entries.clone(),
            None => return,
        };

        trace!(event = %kind, listeners = snapshot.len(), "Firing event");

        for entry in snapshot {
            if entry.auto_off {
                // Whoever flips the flag owns the single invocation
                if entry.spent.swap(true, Ordering::AcqRel) {
                    continue;
                }
                self.unregister(entry.id);
            }

            if panic::catch_unwind(AssertUnwindSafe(|| (entry.handler)(event))).is_err() {
                warn!(listener = %entry.id, event = %kind, "Event listener panicked");
            }
        }
    }

    /// Number of listeners currently registered for `kind`
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Whether `id` is still registered under any kind
    pub fn is_registered(&self, id: ListenerId) -> bool {
        self.listeners
            .lock()
            .values()
            .any(|entries| entries.iter().any(|e| e.id == id))
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.lock();
        let counts: HashMap<EventKind, usize> =
            listeners.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("EventBus").field("listeners", &counts).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&Event) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move |_: &Event| {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_fire_invokes_each_registered_kind_once() {
        let bus = EventBus::new();
        let (count, handler) = counter();

        bus.on(&[EventKind::Connected, EventKind::Disconnected], handler);

        bus.fire(&Event::Connected);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        bus.fire(&Event::Disconnected);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        bus.fire(&Event::Error("boom".into()));
        bus.fire(&Event::Reconnecting);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_fire_without_listeners_is_noop() {
        let bus = EventBus::new();
        bus.fire(&Event::LameDuck);
        assert_eq!(bus.listener_count(EventKind::LameDuck), 0);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_dispatch() {
        let bus = EventBus::new();
        let (count, handler) = counter();

        bus.on(&[EventKind::Connected], |_| panic!("listener failure"));
        bus.on(&[EventKind::Connected], handler);

        bus.fire(&Event::Connected);
        bus.fire(&Event::Connected);

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(bus.listener_count(EventKind::Connected), 2);
    }

    #[test]
    fn test_duplicate_kinds_in_one_registration() {
        let bus = EventBus::new();
        let (count, handler) = counter();

        bus.on(&[EventKind::Connected, EventKind::Connected], handler);
        bus.fire(&Event::Connected);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(EventKind::Connected), 1);
    }

    #[test]
    fn test_unregister_removes_from_every_kind() {
        let bus = EventBus::new();
        let (removed_count, removed) = counter();
        let (kept_count, kept) = counter();

        let id = bus.on(&EventKind::ALL, removed);
        bus.on(&[EventKind::Connected], kept);

        bus.unregister(id);
        assert!(!bus.is_registered(id));

        for kind in EventKind::ALL {
            let event = match kind {
                EventKind::Connected => Event::Connected,
                EventKind::Disconnected => Event::Disconnected,
                EventKind::Error => Event::Error("x".into()),
                EventKind::Reconnecting => Event::Reconnecting,
                EventKind::SlowConsumer => Event::SlowConsumer(1),
                EventKind::LameDuck => Event::LameDuck,
            };
            bus.fire(&event);
        }

        assert_eq!(removed_count.load(Ordering::SeqCst), 0);
        assert_eq!(kept_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister_unknown_id_is_noop() {
        let bus = EventBus::new();
        let (count, handler) = counter();
        bus.on(&[EventKind::Error], handler);

        let other = EventBus::new().on(&[EventKind::Error], |_| {});
        bus.unregister(other);
        bus.unregister(other);

        bus.fire(&Event::Error("still here".into()));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_auto_off_fires_once_across_kinds() {
        let bus = EventBus::new();
        let (count, handler) = counter();

        let id = bus.once(&[EventKind::Connected, EventKind::Error], handler);

        bus.fire(&Event::Error("first".into()));
        bus.fire(&Event::Error("second".into()));
        bus.fire(&Event::Connected);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!bus.is_registered(id));
        assert_eq!(bus.listener_count(EventKind::Connected), 0);
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = order.clone();
            bus.on(&[EventKind::Connected], move |_| order.lock().push(i));
        }

        bus.fire(&Event::Connected);
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_handler_can_remove_itself_during_dispatch() {
        let bus = Arc::new(EventBus::new());
        let (count, handler) = counter();
        let slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));

        let id = {
            let bus_ref = bus.clone();
            let slot = slot.clone();
            bus.on(&[EventKind::Disconnected], move |event| {
                handler(event);
                if let Some(id) = *slot.lock() {
                    bus_ref.off(id);
                }
            })
        };
        *slot.lock() = Some(id);

        bus.fire(&Event::Disconnected);
        bus.fire(&Event::Disconnected);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(EventKind::Disconnected), 0);
    }

    #[test]
    fn test_registration_during_dispatch_affects_next_fire_only() {
        let bus = Arc::new(EventBus::new());
        let (late_count, late) = counter();
        let late = Arc::new(late);

        {
            let bus_ref = bus.clone();
            bus.once(&[EventKind::Connected], move |_| {
                let late = late.clone();
                bus_ref.on(&[EventKind::Connected], move |e| late(e));
            });
        }

        bus.fire(&Event::Connected);
        assert_eq!(late_count.load(Ordering::SeqCst), 0);

        bus.fire(&Event::Connected);
        assert_eq!(late_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_ids_are_unique() {
        let bus = EventBus::new();
        let a = bus.on(&[EventKind::Connected], |_| {});
        let b = bus.on(&[EventKind::Connected], |_| {});
        assert_ne!(a, b);
        assert_ne!(a.to_string(), b.to_string());
    }

    #[test]
    fn test_event_kind_mapping() {
        assert_eq!(Event::Error("x".into()).kind(), EventKind::Error);
        assert_eq!(Event::SlowConsumer(3).kind(), EventKind::SlowConsumer);
        assert_eq!(EventKind::SlowConsumer.to_string(), "slow_consumer");
    }
}
