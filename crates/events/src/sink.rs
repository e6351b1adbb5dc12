//! Event sink seam injected into the dispatcher, worker and scheduler.
//!
//! `ListenerRegistry` delivers each event synchronously, in registration order,
//! to every live listener before `emit` returns. That ordering is what lets the
//! scheduler react to `JobQueued` and `RunComplete` within the same process.

use std::sync::{Arc, RwLock, Weak};

use tracing::warn;

use crate::bus::EventBus;
use crate::event::QueueEvent;

/// Something that accepts queue events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: QueueEvent);
}

impl<S> EventSink for Arc<S>
where
    S: EventSink + ?Sized,
{
    fn emit(&self, event: QueueEvent) {
        (**self).emit(event)
    }
}

/// Sink that drops everything.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: QueueEvent) {}
}

/// Receives events from a `ListenerRegistry`.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &QueueEvent);
}

impl<F> EventListener for F
where
    F: Fn(&QueueEvent) + Send + Sync,
{
    fn on_event(&self, event: &QueueEvent) {
        self(event)
    }
}

enum Entry {
    Strong(Arc<dyn EventListener>),
    Weak(Weak<dyn EventListener>),
}

impl Entry {
    fn upgrade(&self) -> Option<Arc<dyn EventListener>> {
        match self {
            Entry::Strong(l) => Some(l.clone()),
            Entry::Weak(l) => l.upgrade(),
        }
    }
}

/// Ordered, synchronous fan-out to registered listeners.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<Entry>>,
}

impl core::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener owned by the registry.
    pub fn listen(&self, listener: Arc<dyn EventListener>) {
        if let Ok(mut l) = self.listeners.write() {
            l.push(Entry::Strong(listener));
        }
    }

    /// Register a listener without keeping it alive.
    ///
    /// Use this for listeners that themselves hold the registry (the scheduler
    /// does), so the pair does not form a reference cycle.
    pub fn listen_weak(&self, listener: Weak<dyn EventListener>) {
        if let Ok(mut l) = self.listeners.write() {
            l.push(Entry::Weak(listener));
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn EventListener>> {
        match self.listeners.write() {
            Ok(mut entries) => {
                entries.retain(|e| e.upgrade().is_some());
                entries.iter().filter_map(Entry::upgrade).collect()
            }
            Err(_) => {
                warn!("listener registry lock poisoned; dropping event");
                Vec::new()
            }
        }
    }
}

impl EventSink for ListenerRegistry {
    fn emit(&self, event: QueueEvent) {
        // Listeners may emit in turn, so the lock is released before delivery.
        for listener in self.snapshot() {
            listener.on_event(&event);
        }
    }
}

/// Forwards every event onto an `EventBus` for out-of-band observers.
#[derive(Debug)]
pub struct BusListener<B> {
    bus: B,
}

impl<B> BusListener<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }
}

impl<B> EventListener for BusListener<B>
where
    B: EventBus<QueueEvent>,
{
    fn on_event(&self, event: &QueueEvent) {
        if let Err(err) = self.bus.publish(event.clone()) {
            warn!(event = event.name(), error = ?err, "failed to publish queue event");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{EventBus, InMemoryEventBus};

    fn complete(queue: &str) -> QueueEvent {
        QueueEvent::RunComplete {
            provider: "memory".into(),
            queue: queue.into(),
            jobs: vec![],
        }
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let registry = ListenerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = seen.clone();
            registry.listen(Arc::new(move |_: &QueueEvent| seen.lock().unwrap().push(tag)));
        }

        registry.emit(complete("default"));

        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn weak_listeners_are_dropped_with_their_owner() {
        let registry = ListenerRegistry::new();
        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        let listener: Arc<dyn EventListener> =
            Arc::new(move |_: &QueueEvent| *counter.lock().unwrap() += 1);

        registry.listen_weak(Arc::downgrade(&listener));
        registry.emit(complete("a"));
        drop(listener);
        registry.emit(complete("b"));

        assert_eq!(*hits.lock().unwrap(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn listener_may_emit_reentrantly() {
        let registry = Arc::new(ListenerRegistry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let inner = registry.clone();
        registry.listen(Arc::new(move |ev: &QueueEvent| {
            if ev.queue() == "outer" {
                inner.emit(complete("inner"));
            }
        }));
        let log = seen.clone();
        registry.listen(Arc::new(move |ev: &QueueEvent| {
            log.lock().unwrap().push(ev.queue().to_string())
        }));

        registry.emit(complete("outer"));

        assert_eq!(*seen.lock().unwrap(), vec!["inner", "outer"]);
    }

    #[test]
    fn bus_listener_forwards_events() {
        let bus = Arc::new(InMemoryEventBus::<QueueEvent>::new());
        let sub = bus.subscribe();
        let registry = ListenerRegistry::new();
        registry.listen(Arc::new(BusListener::new(bus.clone())));

        registry.emit(complete("default"));

        assert_eq!(sub.drain(), vec![complete("default")]);
    }
}
