//! Provider wrapper that holds pushes until the surrounding work is committed.
//!
//! Jobs dispatched inside a unit of work (a transaction, a request) should not
//! become visible to workers before that work succeeds. `BufferedProvider`
//! assigns ids immediately, keeps the jobs in order, and forwards them to the
//! inner provider on `mark_ready`. `discard` drops everything still buffered.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use taskdrain_core::{Job, JobId, JobRecord};

use super::{Batch, Provider, ProviderError};

#[derive(Debug, Default)]
struct Buffer {
    ready: bool,
    held: Vec<Job>,
}

#[derive(Debug)]
pub struct BufferedProvider<P> {
    inner: P,
    buffer: Mutex<Buffer>,
}

impl<P> BufferedProvider<P>
where
    P: Provider,
{
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            buffer: Mutex::new(Buffer::default()),
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn is_ready(&self) -> bool {
        self.lock().map(|b| b.ready).unwrap_or(false)
    }

    /// Jobs pushed but not yet forwarded.
    pub fn buffered(&self) -> usize {
        self.lock().map(|b| b.held.len()).unwrap_or(0)
    }

    /// Forward every buffered job, in push order, and pass later pushes
    /// straight through. Returns the queues that received jobs, in the order
    /// they were first flushed to.
    ///
    /// If a forward fails the remaining jobs stay buffered and the error is
    /// returned; calling `mark_ready` again resumes from the failed job.
    pub fn mark_ready(&self) -> Result<Vec<String>, ProviderError> {
        let mut buffer = self.lock()?;
        let held = std::mem::take(&mut buffer.held);
        let mut flushed = 0;
        let mut queues: Vec<String> = Vec::new();

        let mut rest = held.into_iter();
        while let Some(job) = rest.next() {
            let queue = job.queue.clone();
            if let Err(err) = self.inner.push(job.clone()) {
                warn!(error = %err, remaining = rest.len() + 1, "failed to flush buffered job");
                buffer.held.push(job);
                buffer.held.extend(rest);
                return Err(err);
            }
            flushed += 1;
            if !queues.contains(&queue) {
                queues.push(queue);
            }
        }

        buffer.ready = true;
        debug!(flushed, queues = queues.len(), "buffered provider ready");
        Ok(queues)
    }

    /// Drop buffered jobs without forwarding them.
    pub fn discard(&self) -> Result<usize, ProviderError> {
        let mut buffer = self.lock()?;
        let dropped = buffer.held.len();
        buffer.held.clear();
        Ok(dropped)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Buffer>, ProviderError> {
        self.buffer
            .lock()
            .map_err(|_| ProviderError::Storage("buffer lock poisoned".to_string()))
    }
}

impl<P> Provider for BufferedProvider<P>
where
    P: Provider,
{
    fn push(&self, mut job: Job) -> Result<JobId, ProviderError> {
        job.validate()?;
        let mut buffer = self.lock()?;
        if buffer.ready {
            drop(buffer);
            return self.inner.push(job);
        }

        let id = *job.id.get_or_insert_with(JobId::new);
        buffer.held.push(job);
        Ok(id)
    }

    fn pop(&self, queue: &str, count: usize) -> Result<Batch, ProviderError> {
        self.inner.pop(queue, count)
    }

    fn pending_count(&self, queue: &str) -> Result<usize, ProviderError> {
        self.inner.pending_count(queue)
    }

    fn next_available_at(&self, queue: &str) -> Result<Option<DateTime<Utc>>, ProviderError> {
        self.inner.next_available_at(queue)
    }

    fn in_queue(&self, job: &Job, queue: &str) -> Result<bool, ProviderError> {
        let buffered = self
            .lock()?
            .held
            .iter()
            .any(|j| j.queue == queue && j.payload == job.payload);
        Ok(buffered || self.inner.in_queue(job, queue)?)
    }

    fn release(&self, id: JobId) -> Result<(), ProviderError> {
        self.inner.release(id)
    }

    fn mark_failed(&self, id: JobId, error: &str) -> Result<(), ProviderError> {
        self.inner.mark_failed(id, error)
    }

    fn mark_timed_out(&self, id: JobId, error: &str) -> Result<(), ProviderError> {
        self.inner.mark_timed_out(id, error)
    }

    fn get(&self, id: JobId) -> Result<Option<JobRecord>, ProviderError> {
        self.inner.get(id)
    }

    fn failed_jobs(&self, queue: &str, limit: usize) -> Result<Vec<JobRecord>, ProviderError> {
        self.inner.failed_jobs(queue, limit)
    }

    fn retry_failed(&self, id: JobId) -> Result<(), ProviderError> {
        self.inner.retry_failed(id)
    }

    fn forget(&self, id: JobId) -> Result<(), ProviderError> {
        let mut buffer = self.lock()?;
        let before = buffer.held.len();
        buffer.held.retain(|j| j.id != Some(id));
        if buffer.held.len() != before {
            return Ok(());
        }
        drop(buffer);
        self.inner.forget(id)
    }
}
