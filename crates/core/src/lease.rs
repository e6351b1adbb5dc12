//! Per-job mutual-exclusion state and the stored job record.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::JobId;
use crate::job::Job;

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Time-bounded exclusive claim on a job.
///
/// An expired lease is equivalent to no lease: a worker that dies mid-batch
/// does not strand its jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub locked_until: Option<DateTime<Utc>>,
    /// The most recent attempt raised.
    pub failed: bool,
    /// The most recent attempt overran its timeout. Such a job is re-claimed
    /// once the lease lapses, even with no tries left.
    #[serde(default)]
    pub timed_out: bool,
}

impl Lease {
    /// Whether the job is currently claimed.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| now < until)
    }
}

/// A job as held by a provider: the job itself plus storage-side state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub job: Job,
    /// Insertion order within the provider.
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    /// Earliest time the job may be claimed (`created_at + delay`).
    pub available_at: DateTime<Utc>,
    pub lease: Lease,
    pub last_error: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Wrap a job for storage. The job's `id` is overwritten with `id`.
    pub fn new(id: JobId, mut job: Job, sequence: u64, now: DateTime<Utc>) -> Self {
        job.id = Some(id);
        let available_at = job.delay.map_or(now, |d| now + to_chrono(d));
        Self {
            id,
            job,
            sequence,
            created_at: now,
            available_at,
            lease: Lease::default(),
            last_error: None,
            failed_at: None,
        }
    }

    pub fn queue(&self) -> &str {
        &self.job.queue
    }

    /// Failed with no attempts left. Kept only for inspection.
    pub fn is_exhausted(&self) -> bool {
        self.lease.failed && !self.lease.timed_out && !self.job.can_retry()
    }

    /// Earliest time the record can be claimed, or `None` once exhausted.
    pub fn claimable_from(&self) -> Option<DateTime<Utc>> {
        if self.is_exhausted() {
            return None;
        }
        Some(match self.lease.locked_until {
            Some(until) => until.max(self.available_at),
            None => self.available_at,
        })
    }

    /// Part of the queue's backlog: not leased and not exhausted.
    pub fn is_pending(&self, now: DateTime<Utc>) -> bool {
        !self.lease.is_active(now) && !self.is_exhausted()
    }

    /// Eligible to be returned by `pop` right now.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.is_pending(now) && self.available_at <= now
    }

    /// Claim the job for one attempt.
    pub fn acquire(&mut self, now: DateTime<Utc>, lease_for: Duration) {
        self.lease.locked_until = Some(now + to_chrono(lease_for));
        self.lease.failed = false;
        self.lease.timed_out = false;
        self.job.attempts += 1;
    }

    /// Record a failed attempt.
    ///
    /// A job with tries left stays leased for its `retry_after` window and is
    /// re-claimable afterwards; an exhausted job drops its lease and is retained
    /// as a failed record.
    pub fn fail(&mut self, now: DateTime<Utc>, error: impl Into<String>, default_retry_after: Duration) {
        self.lease.failed = true;
        self.lease.timed_out = false;
        self.last_error = Some(error.into());
        self.failed_at = Some(now);
        self.lease.locked_until = if self.job.can_retry() {
            let wait = self.job.retry_after.unwrap_or(default_retry_after);
            Some(now + to_chrono(wait))
        } else {
            None
        };
    }

    /// Record an attempt that overran its timeout.
    ///
    /// The lease is renewed for `lease_for` and the job becomes claimable again
    /// when it lapses, as if its worker had died.
    pub fn time_out(&mut self, now: DateTime<Utc>, error: impl Into<String>, lease_for: Duration) {
        self.lease.failed = true;
        self.lease.timed_out = true;
        self.last_error = Some(error.into());
        self.failed_at = Some(now);
        self.lease.locked_until = Some(now + to_chrono(lease_for));
    }

    /// Put a failed record back into the backlog with a fresh attempt budget.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.lease = Lease::default();
        self.job.attempts = 0;
        self.last_error = None;
        self.failed_at = None;
        self.available_at = now;
    }
}
