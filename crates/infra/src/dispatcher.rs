//! Entry point for producing work.
//!
//! The dispatcher decides between running a job in place and queuing it. It
//! knows nothing about scheduling: `JobQueued` is the only signal it sends.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use taskdrain_core::{Job, JobId};
use taskdrain_events::{EventSink, QueueEvent};

use crate::handler::{HandlerError, HandlerRegistry};
use crate::lifecycle::RequestLifecycle;
use crate::manager::{ManagerError, QueueManager};
use crate::provider::ProviderError;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

/// What `dispatch` did with a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// Persisted by the default provider under this id.
    Queued(JobId),
    /// Ran to completion in the caller's context.
    Ran,
}

impl Dispatched {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Dispatched::Queued(id) => Some(*id),
            Dispatched::Ran => None,
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    manager: Arc<QueueManager>,
    handlers: Arc<HandlerRegistry>,
    events: Arc<dyn EventSink>,
    lifecycle: Arc<RequestLifecycle>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("manager", &self.manager)
            .field("handlers", &self.handlers)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        manager: Arc<QueueManager>,
        handlers: Arc<HandlerRegistry>,
        events: Arc<dyn EventSink>,
        lifecycle: Arc<RequestLifecycle>,
    ) -> Self {
        Self {
            manager,
            handlers,
            events,
            lifecycle,
        }
    }

    /// Queue `job` on the default provider, or run it now if it does not queue.
    pub fn dispatch(&self, job: Job) -> Result<Dispatched, DispatchError> {
        if !job.should_queue {
            self.dispatch_now(&job)?;
            return Ok(Dispatched::Ran);
        }

        self.enqueue(job).map(Dispatched::Queued)
    }

    /// Queue `job` unless the same work is already waiting on its queue.
    ///
    /// Returns `None` when the job was skipped as a duplicate.
    pub fn dispatch_unique(&self, job: Job) -> Result<Option<Dispatched>, DispatchError> {
        if job.should_queue {
            let provider = self.manager.default_provider()?;
            if provider.in_queue(&job, &job.queue)? {
                debug!(
                    provider = %provider.name(),
                    queue = %job.queue,
                    handler = %job.payload.handler_name(),
                    "skipping duplicate job"
                );
                return Ok(None);
            }
        }

        self.dispatch(job).map(Some)
    }

    /// Run the job's handler in the caller's context. Errors propagate.
    pub fn dispatch_now(&self, job: &Job) -> Result<(), DispatchError> {
        self.handlers.run(job)?;
        Ok(())
    }

    /// Run the job once the current unit of work finishes.
    ///
    /// There is no caller left to receive an error by then, so failures are logged.
    pub fn dispatch_after_response(&self, job: Job) {
        let handlers = self.handlers.clone();
        self.lifecycle.on_finish(move || {
            if let Err(err) = handlers.run(&job) {
                warn!(
                    handler = %job.payload.handler_name(),
                    error = %err,
                    "deferred job failed"
                );
            }
        });
    }

    fn enqueue(&self, mut job: Job) -> Result<JobId, DispatchError> {
        job.validate().map_err(ProviderError::from)?;
        self.handlers.apply_defaults(&mut job);

        let provider = self.manager.default_provider()?;
        let id = provider.push(job.clone())?;
        job.id = Some(id);

        info!(provider = %provider.name(), queue = %job.queue, job_id = %id, "job queued");
        self.events.emit(QueueEvent::JobQueued {
            provider: provider.name().to_string(),
            queue: job.queue.clone(),
            job,
        });
        Ok(id)
    }
}
