//! In-process event bus.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, mpsc};

use crate::bus::{EventBus, Subscription};

#[derive(Debug)]
pub enum InMemoryBusError {
    /// The subscriber table lock was poisoned.
    Poisoned,
}

type Filter<M> = Box<dyn Fn(&M) -> bool + Send>;

struct Subscriber<M> {
    tx: mpsc::SyncSender<M>,
    filter: Option<Filter<M>>,
}

/// Fan-out over std channels, one per subscription.
///
/// - Each subscription buffers at most `capacity` messages; further messages
///   for that subscription are dropped and counted
/// - Subscriptions may filter what they receive
/// - Dropped subscriptions are pruned on the next publish
pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Vec<Subscriber<M>>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl<M> core::fmt::Debug for InMemoryEventBus<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryEventBus")
            .field("subscribers", &self.subscriber_count())
            .field("capacity", &self.capacity)
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl<M> InMemoryEventBus<M> {
    /// Default per-subscription buffer.
    pub const DEFAULT_CAPACITY: usize = 10_000;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Subscribe to the messages `filter` accepts.
    pub fn subscribe_where<F>(&self, filter: F) -> Subscription<M>
    where
        F: Fn(&M) -> bool + Send + 'static,
    {
        self.add_subscriber(Some(Box::new(filter)))
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Messages discarded because a subscriber's buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn add_subscriber(&self, filter: Option<Filter<M>>) -> Subscription<M> {
        let (tx, rx) = mpsc::sync_channel(self.capacity);

        // A poisoned table still hands out a subscription; it never receives.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(Subscriber { tx, filter });
        }

        Subscription::new(rx)
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut subs = self.subscribers.lock().map_err(|_| InMemoryBusError::Poisoned)?;

        subs.retain(|sub| {
            if sub.filter.as_ref().is_some_and(|accept| !accept(&message)) {
                return true;
            }
            match sub.tx.try_send(message.clone()) {
                Ok(()) => true,
                Err(mpsc::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(mpsc::TrySendError::Disconnected(_)) => false,
            }
        });

        Ok(())
    }

    fn subscribe(&self) -> Subscription<M> {
        self.add_subscriber(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_gets_a_copy() {
        let bus = InMemoryEventBus::<u32>::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.publish(7).unwrap();

        assert_eq!(a.try_recv().unwrap(), 7);
        assert_eq!(b.try_recv().unwrap(), 7);
    }

    #[test]
    fn dropped_subscriptions_are_pruned() {
        let bus = InMemoryEventBus::<u32>::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());

        bus.publish(1).unwrap();

        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(kept.drain(), vec![1]);
    }

    #[test]
    fn full_subscriber_loses_messages_without_blocking() {
        let bus = InMemoryEventBus::<u32>::with_capacity(2);
        let slow = bus.subscribe();

        for n in 0..5 {
            bus.publish(n).unwrap();
        }

        assert_eq!(slow.drain(), vec![0, 1]);
        assert_eq!(bus.dropped(), 3);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn filtered_subscription_sees_only_accepted_messages() {
        let bus = InMemoryEventBus::<u32>::new();
        let even = bus.subscribe_where(|n| n % 2 == 0);

        for n in 0..6 {
            bus.publish(n).unwrap();
        }

        assert_eq!(even.drain(), vec![0, 2, 4]);
    }
}
