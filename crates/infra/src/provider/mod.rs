//! Storage abstraction for queued jobs.
//!
//! A `Provider` persists jobs, hands out leased batches and answers backlog
//! questions. The one hard correctness requirement lives here: `pop` must be
//! atomic with respect to the lease, so two concurrent batches never receive
//! the same job while its lease is active.
//!
//! Implementations:
//!
//! - `InMemoryProvider`: a mutex-guarded map, for tests/dev and single-process use
//! - `PostgresProvider`: a `queue_jobs` table claimed with `FOR UPDATE SKIP LOCKED`
//! - `BufferedProvider`: wraps another provider and holds pushes until it is ready

pub mod buffered;
pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use taskdrain_core::{CoreError, Job, JobId, JobRecord};

pub use buffered::BufferedProvider;
pub use in_memory::InMemoryProvider;
pub use postgres::PostgresProvider;

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("invalid job: {0}")]
    InvalidJob(#[from] CoreError),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

/// The jobs returned by one `pop`, in the order they must be processed.
///
/// A batch is consumed once: iterating moves the jobs out, and processing the
/// queue again means issuing a fresh `pop`.
#[derive(Debug)]
pub struct Batch {
    ids: Vec<JobId>,
    jobs: std::vec::IntoIter<Job>,
}

impl Batch {
    /// Build a batch from leased jobs. Jobs without an id are dropped.
    pub fn new(jobs: Vec<Job>) -> Self {
        let jobs: Vec<Job> = jobs.into_iter().filter(|j| j.id.is_some()).collect();
        let ids = jobs.iter().filter_map(|j| j.id).collect();
        Self {
            ids,
            jobs: jobs.into_iter(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Ids of every job the batch was created with, in order.
    pub fn job_ids(&self) -> &[JobId] {
        &self.ids
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl Iterator for Batch {
    type Item = Job;

    fn next(&mut self) -> Option<Job> {
        self.jobs.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.jobs.size_hint()
    }
}

impl ExactSizeIterator for Batch {}

/// Pluggable job storage.
pub trait Provider: Send + Sync {
    /// Persist `job` and return the id it was stored under.
    ///
    /// A job that already carries an id keeps it.
    fn push(&self, job: Job) -> Result<JobId, ProviderError>;

    /// Lease up to `count` of the oldest claimable jobs on `queue`.
    fn pop(&self, queue: &str, count: usize) -> Result<Batch, ProviderError>;

    /// Number of jobs on `queue` that are neither leased nor exhausted.
    ///
    /// Used only for sizing; a slightly stale answer is acceptable.
    fn pending_count(&self, queue: &str) -> Result<usize, ProviderError>;

    /// Earliest time a job on `queue` that is not yet claimable becomes so.
    ///
    /// Covers delayed jobs, failures waiting out their retry window and jobs
    /// whose lease has yet to lapse. `None` when nothing on the queue can ever
    /// be claimed again.
    fn next_available_at(&self, queue: &str) -> Result<Option<DateTime<Utc>>, ProviderError>;

    /// Whether the same work is already waiting on (or running from) `queue`.
    fn in_queue(&self, job: &Job, queue: &str) -> Result<bool, ProviderError>;

    /// Remove a successfully processed job.
    fn release(&self, id: JobId) -> Result<(), ProviderError>;

    /// Record a failed attempt, keeping the job for inspection or retry.
    fn mark_failed(&self, id: JobId, error: &str) -> Result<(), ProviderError>;

    /// Record an attempt that overran its timeout. The job is re-claimed once
    /// its lease lapses, even with no tries left.
    fn mark_timed_out(&self, id: JobId, error: &str) -> Result<(), ProviderError>;

    fn get(&self, id: JobId) -> Result<Option<JobRecord>, ProviderError>;

    /// Records whose most recent attempt failed, oldest failure first.
    fn failed_jobs(&self, queue: &str, limit: usize) -> Result<Vec<JobRecord>, ProviderError>;

    /// Return a failed record to the backlog with a fresh attempt budget.
    fn retry_failed(&self, id: JobId) -> Result<(), ProviderError>;

    /// Delete a record outright.
    fn forget(&self, id: JobId) -> Result<(), ProviderError>;
}

impl<P> Provider for Arc<P>
where
    P: Provider + ?Sized,
{
    fn push(&self, job: Job) -> Result<JobId, ProviderError> {
        (**self).push(job)
    }

    fn pop(&self, queue: &str, count: usize) -> Result<Batch, ProviderError> {
        (**self).pop(queue, count)
    }

    fn pending_count(&self, queue: &str) -> Result<usize, ProviderError> {
        (**self).pending_count(queue)
    }

    fn next_available_at(&self, queue: &str) -> Result<Option<DateTime<Utc>>, ProviderError> {
        (**self).next_available_at(queue)
    }

    fn in_queue(&self, job: &Job, queue: &str) -> Result<bool, ProviderError> {
        (**self).in_queue(job, queue)
    }

    fn release(&self, id: JobId) -> Result<(), ProviderError> {
        (**self).release(id)
    }

    fn mark_failed(&self, id: JobId, error: &str) -> Result<(), ProviderError> {
        (**self).mark_failed(id, error)
    }

    fn mark_timed_out(&self, id: JobId, error: &str) -> Result<(), ProviderError> {
        (**self).mark_timed_out(id, error)
    }

    fn get(&self, id: JobId) -> Result<Option<JobRecord>, ProviderError> {
        (**self).get(id)
    }

    fn failed_jobs(&self, queue: &str, limit: usize) -> Result<Vec<JobRecord>, ProviderError> {
        (**self).failed_jobs(queue, limit)
    }

    fn retry_failed(&self, id: JobId) -> Result<(), ProviderError> {
        (**self).retry_failed(id)
    }

    fn forget(&self, id: JobId) -> Result<(), ProviderError> {
        (**self).forget(id)
    }
}
