//! Out-of-band event distribution.
//!
//! Dashboards, audit trails and tests that want a copy of queue events subscribe
//! to an `EventBus` and consume on their own thread. The scheduler's control
//! loop never goes through a bus; it listens on the `ListenerRegistry`, which
//! delivers synchronously and in order.
//!
//! Publishing happens inline with job processing (through `BusListener`), so a
//! bus must not block the publisher on a slow subscriber.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

/// Receiving end of one bus subscription.
///
/// Messages from a single publisher arrive in publication order. A subscriber
/// that falls behind a bounded bus loses messages rather than stalling workers.
///
/// ```ignore
/// let sub = bus.subscribe();
/// loop {
///     match sub.recv_timeout(Duration::from_secs(1)) {
///         Ok(QueueEvent::JobFailed { job, error, .. }) => alert(&job, &error),
///         Ok(_) => {}
///         Err(RecvTimeoutError::Timeout) => continue,
///         Err(RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything already delivered, without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Pub/sub transport for queue events.
///
/// A `publish` error is reported to the caller, which for `BusListener` means
/// a logged warning; the job that produced the event is unaffected.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
