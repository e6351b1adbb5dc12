use serde::{Deserialize, Serialize};

use taskdrain_core::{Job, JobId};

/// An event emitted at the boundary of the queue core.
///
/// Events are facts: they describe something that already happened to a job
/// or a batch run. `provider` is the driver name the job was routed through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    /// A job was persisted by a provider.
    JobQueued {
        provider: String,
        queue: String,
        job: Job,
    },
    /// A worker claimed a batch and is about to process it.
    RunStart {
        provider: String,
        queue: String,
        jobs: Vec<JobId>,
    },
    /// A job's handler is about to run.
    JobProcessing {
        provider: String,
        queue: String,
        job: Job,
    },
    /// A job's handler returned successfully and the job was released.
    JobProcessed {
        provider: String,
        queue: String,
        job: Job,
    },
    /// A job's handler raised (or overran its budget) and the lease was marked failed.
    JobFailed {
        provider: String,
        queue: String,
        job: Job,
        error: String,
    },
    /// A batch finished, regardless of how many of its jobs failed.
    RunComplete {
        provider: String,
        queue: String,
        jobs: Vec<JobId>,
    },
}

impl QueueEvent {
    /// Stable event name (e.g. "job_queued").
    pub fn name(&self) -> &'static str {
        match self {
            QueueEvent::JobQueued { .. } => "job_queued",
            QueueEvent::RunStart { .. } => "run_start",
            QueueEvent::JobProcessing { .. } => "job_processing",
            QueueEvent::JobProcessed { .. } => "job_processed",
            QueueEvent::JobFailed { .. } => "job_failed",
            QueueEvent::RunComplete { .. } => "run_complete",
        }
    }

    pub fn queue(&self) -> &str {
        match self {
            QueueEvent::JobQueued { queue, .. }
            | QueueEvent::RunStart { queue, .. }
            | QueueEvent::JobProcessing { queue, .. }
            | QueueEvent::JobProcessed { queue, .. }
            | QueueEvent::JobFailed { queue, .. }
            | QueueEvent::RunComplete { queue, .. } => queue,
        }
    }

    pub fn provider(&self) -> &str {
        match self {
            QueueEvent::JobQueued { provider, .. }
            | QueueEvent::RunStart { provider, .. }
            | QueueEvent::JobProcessing { provider, .. }
            | QueueEvent::JobProcessed { provider, .. }
            | QueueEvent::JobFailed { provider, .. }
            | QueueEvent::RunComplete { provider, .. } => provider,
        }
    }
}
