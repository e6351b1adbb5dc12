//! One-process wiring of the queue: manager, dispatcher, worker, scheduler and
//! an in-memory trigger facility sharing a single listener registry.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use taskdrain_core::{Clock, SystemClock};
use taskdrain_events::{BusListener, EventBus, EventListener, ListenerRegistry, QueueEvent};

use crate::config::QueueConfig;
use crate::dispatcher::Dispatcher;
use crate::handler::HandlerRegistry;
use crate::lifecycle::RequestLifecycle;
use crate::manager::QueueManager;
use crate::provider::{BufferedProvider, Provider, ProviderError};
use crate::scheduler::Scheduler;
use crate::trigger::{self, InMemoryTriggerFacility, PumpConfig, PumpHandle, TriggerPump};
use crate::worker::Worker;

#[derive(Debug, Clone)]
pub struct QueueRuntime {
    pub manager: Arc<QueueManager>,
    pub handlers: Arc<HandlerRegistry>,
    pub listeners: Arc<ListenerRegistry>,
    pub lifecycle: Arc<RequestLifecycle>,
    pub triggers: Arc<InMemoryTriggerFacility>,
    pub dispatcher: Dispatcher,
    pub worker: Arc<Worker>,
    pub scheduler: Arc<Scheduler>,
    pub clock: Arc<dyn Clock>,
}

impl QueueRuntime {
    pub fn new(config: QueueConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        let manager = Arc::new(QueueManager::new(config, clock.clone()));
        let handlers = Arc::new(HandlerRegistry::new());
        let listeners = Arc::new(ListenerRegistry::new());
        let lifecycle = Arc::new(RequestLifecycle::new());
        let triggers = Arc::new(InMemoryTriggerFacility::new());

        let dispatcher = Dispatcher::new(
            manager.clone(),
            handlers.clone(),
            listeners.clone(),
            lifecycle.clone(),
        );
        let worker = Arc::new(Worker::new(
            manager.clone(),
            handlers.clone(),
            listeners.clone(),
            clock.clone(),
        ));
        let scheduler = Scheduler::new(
            manager.clone(),
            triggers.clone(),
            worker.clone(),
            lifecycle.clone(),
            clock.clone(),
        );
        scheduler.attach(&listeners);

        Self {
            manager,
            handlers,
            listeners,
            lifecycle,
            triggers,
            dispatcher,
            worker,
            scheduler,
            clock,
        }
    }

    pub fn listen(&self, listener: Arc<dyn EventListener>) {
        self.listeners.listen(listener);
    }

    /// Mirror every queue event onto `bus`.
    pub fn forward_to<B>(&self, bus: B)
    where
        B: EventBus<QueueEvent> + Send + Sync + 'static,
    {
        self.listeners.listen(Arc::new(BusListener::new(bus)));
    }

    /// Finish the current unit of work, running deferred jobs and reschedules.
    pub fn finish_request(&self) -> usize {
        self.lifecycle.finish()
    }

    /// Flush `provider` and size drain runs for every queue it released jobs to.
    ///
    /// The jobs' `JobQueued` reschedules ran while they were still held back,
    /// so without this the flushed backlog would wait for the next dispatch.
    /// Returns the number of queues rescheduled.
    pub fn mark_ready<P>(&self, provider: &BufferedProvider<P>) -> Result<usize, ProviderError>
    where
        P: Provider,
    {
        let queues = provider.mark_ready()?;
        for queue in &queues {
            if let Err(e) = self.scheduler.schedule_next_run(queue) {
                warn!(queue = %queue, error = %e, "reschedule after flush failed; will retry on next event");
            }
        }
        Ok(queues.len())
    }

    /// Fire every trigger due now on the calling thread.
    pub fn fire_due(&self) -> usize {
        trigger::pump::drain_due(&self.triggers, self.scheduler.as_ref(), self.clock.now())
    }

    /// Fire due triggers from a background thread until the handle is shut down.
    pub fn spawn_pump(&self, poll_interval: Duration) -> io::Result<PumpHandle> {
        TriggerPump::spawn(
            self.triggers.clone(),
            self.scheduler.clone(),
            self.clock.clone(),
            PumpConfig::default().with_poll_interval(poll_interval),
        )
    }
}
