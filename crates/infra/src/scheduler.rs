//! Adaptive drain scheduling.
//!
//! The scheduler keeps enough drain triggers outstanding to clear a queue's
//! backlog without exceeding the queue's concurrency cap. It is driven
//! entirely by events:
//!
//! - `JobQueued` marks the queue for a reschedule at the end of the current
//!   unit of work, so a burst of dispatches produces one sizing decision
//! - a due trigger runs one worker batch
//! - `RunComplete` re-evaluates the backlog, scheduling more runs or cancelling
//!   the remaining triggers once the queue is empty
//!
//! A queue whose only jobs are waiting out a retry window or an unexpired
//! lease is not empty: one trigger is kept for the moment the earliest of them
//! becomes claimable.
//!
//! Sizing for a queue with `P` pending jobs, batch size `B`, concurrency cap
//! `M` and `S` triggers already outstanding:
//!
//! ```text
//! S >= M  -> nothing to do
//! else    -> register min(M, ceil(P / B)) - S triggers,
//!            the i-th at base_delay + i * 5s
//! ```
//!
//! Failures here are never fatal: every entry point is re-invoked by the next
//! event for the queue.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use taskdrain_core::Clock;
use taskdrain_events::{EventListener, ListenerRegistry, QueueEvent};

use crate::config::BatchSettings;
use crate::lifecycle::RequestLifecycle;
use crate::manager::{ManagerError, QueueManager};
use crate::provider::ProviderError;
use crate::trigger::{Trigger, TriggerArgs, TriggerError, TriggerFacility, TriggerTarget};
use crate::worker::{RunSummary, Worker, WorkerError};

/// Offset between consecutive triggers registered in one sizing pass.
pub const STAGGER_STEP: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Trigger(#[from] TriggerError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// What one `schedule_next_run` pass decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// The queue is empty; this many outstanding triggers were cancelled.
    Drained { cancelled: usize },
    /// Nothing is claimable before `until`; a trigger is held for that time.
    Waiting { until: DateTime<Utc> },
    /// Already at the concurrency cap.
    Saturated { outstanding: usize },
    /// Triggers were requested; `rejected` of them were refused by the facility.
    Scheduled { registered: usize, rejected: usize },
}

/// Number of triggers to add for `pending` jobs when `outstanding` already exist.
pub fn triggers_needed(pending: usize, outstanding: usize, settings: &BatchSettings) -> usize {
    let cap = settings.max_concurrent_batches.max(1);
    if pending == 0 || outstanding >= cap {
        return 0;
    }
    let runs = pending.div_ceil(settings.batch_size.max(1));
    runs.min(cap).saturating_sub(outstanding)
}

/// Delay of the `index`-th trigger registered in one sizing pass.
pub fn stagger_delay(base: Duration, index: usize) -> Duration {
    let index = u32::try_from(index).unwrap_or(u32::MAX);
    base.saturating_add(STAGGER_STEP.saturating_mul(index))
}

#[derive(Debug, Default)]
struct PendingReschedule {
    queues: Vec<String>,
    flush_attached: bool,
}

pub struct Scheduler {
    manager: Arc<QueueManager>,
    triggers: Arc<dyn TriggerFacility>,
    worker: Arc<Worker>,
    lifecycle: Arc<RequestLifecycle>,
    clock: Arc<dyn Clock>,
    pending: Mutex<PendingReschedule>,
    this: Weak<Scheduler>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("provider", &self.manager.default_provider_name())
            .field("pending", &self.pending)
            .finish()
    }
}

impl Scheduler {
    pub fn new(
        manager: Arc<QueueManager>,
        triggers: Arc<dyn TriggerFacility>,
        worker: Arc<Worker>,
        lifecycle: Arc<RequestLifecycle>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            manager,
            triggers,
            worker,
            lifecycle,
            clock,
            pending: Mutex::new(PendingReschedule::default()),
            this: this.clone(),
        })
    }

    /// Subscribe to queue events without keeping the scheduler alive.
    pub fn attach(&self, listeners: &ListenerRegistry) {
        let this: Weak<dyn EventListener> = self.this.clone();
        listeners.listen_weak(this);
    }

    fn settings(&self, queue: &str) -> BatchSettings {
        self.manager
            .config()
            .settings_for(self.manager.default_provider_name(), queue)
    }

    /// Mark `queue` for rescheduling when the current unit of work finishes.
    pub fn note_queued(&self, queue: &str) {
        let attach = {
            let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            if !pending.queues.iter().any(|q| q == queue) {
                pending.queues.push(queue.to_string());
            }
            !std::mem::replace(&mut pending.flush_attached, true)
        };

        if attach {
            let this = self.this.clone();
            self.lifecycle.on_finish(move || {
                if let Some(scheduler) = this.upgrade() {
                    scheduler.flush_pending();
                }
            });
        }
    }

    /// Queues currently waiting for an end-of-request reschedule.
    pub fn pending_queues(&self) -> Vec<String> {
        self.pending
            .lock()
            .map(|p| p.queues.clone())
            .unwrap_or_default()
    }

    /// Run `schedule_next_run` once for every queue noted since the last flush.
    pub fn flush_pending(&self) -> usize {
        let queues = {
            let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            pending.flush_attached = false;
            std::mem::take(&mut pending.queues)
        };

        for queue in &queues {
            if let Err(e) = self.schedule_next_run(queue) {
                warn!(queue = %queue, error = %e, "reschedule failed; will retry on next event");
            }
        }
        queues.len()
    }

    /// Size the outstanding triggers for `queue` against its backlog.
    pub fn schedule_next_run(&self, queue: &str) -> Result<ScheduleOutcome, SchedulerError> {
        let provider = self.manager.default_provider()?;
        let pending = provider.pending_count(queue)?;

        let settings = self
            .manager
            .config()
            .settings_for(provider.name(), queue);

        if pending == 0 {
            if let Some(until) = provider.next_available_at(queue)? {
                self.hold_until(queue, until, &settings)?;
                return Ok(ScheduleOutcome::Waiting { until });
            }
            let cancelled = self.unschedule(queue)?;
            debug!(queue, cancelled, "queue drained");
            return Ok(ScheduleOutcome::Drained { cancelled });
        }

        let outstanding = self.triggers.list(queue)?.len();

        if outstanding >= settings.max_concurrent_batches {
            debug!(queue, pending, outstanding, "queue at concurrency cap");
            return Ok(ScheduleOutcome::Saturated { outstanding });
        }

        let wanted = triggers_needed(pending, outstanding, &settings);
        let mut rejected = 0;
        for i in 0..wanted {
            if !self.schedule(queue, stagger_delay(settings.base_delay, i)) {
                rejected += 1;
            }
        }

        info!(queue, pending, outstanding, registered = wanted - rejected, rejected, "scheduled drain runs");
        Ok(ScheduleOutcome::Scheduled {
            registered: wanted - rejected,
            rejected,
        })
    }

    /// Keep a trigger for `queue` that fires no later than `until`.
    ///
    /// An outstanding trigger due at or before `until` re-evaluates the queue
    /// when it fires, so none is added alongside it.
    fn hold_until(
        &self,
        queue: &str,
        until: DateTime<Utc>,
        settings: &BatchSettings,
    ) -> Result<(), SchedulerError> {
        let outstanding = self.triggers.list(queue)?;
        if outstanding.iter().any(|t| t.fire_at <= until)
            || outstanding.len() >= settings.max_concurrent_batches.max(1)
        {
            debug!(queue, %until, outstanding = outstanding.len(), "waiting on existing trigger");
            return Ok(());
        }

        let delay = (until - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
        if self.schedule(queue, delay) {
            debug!(queue, %until, "holding trigger for waiting jobs");
        }
        Ok(())
    }

    /// Register one drain trigger for `queue` at `now + delay`.
    ///
    /// Returns `false` if the facility refused it or the fire time is out of range.
    pub fn schedule(&self, queue: &str, delay: Duration) -> bool {
        let fire_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| self.clock.now().checked_add_signed(delay));
        let Some(fire_at) = fire_at else {
            warn!(queue, ?delay, "drain trigger delay out of range");
            return false;
        };
        let args = TriggerArgs {
            queue: queue.to_string(),
            scheduled_time: fire_at,
        };

        match self.triggers.register(fire_at, args) {
            Ok(id) => {
                debug!(queue, trigger_id = %id, %fire_at, "drain trigger registered");
                true
            }
            Err(e) => {
                warn!(queue, %fire_at, error = %e, "drain trigger rejected");
                false
            }
        }
    }

    /// Cancel every outstanding trigger for `queue`. Returns how many were cancelled.
    pub fn unschedule(&self, queue: &str) -> Result<usize, SchedulerError> {
        let mut cancelled = 0;
        for trigger in self.triggers.list(queue)? {
            match self.triggers.cancel(trigger.id) {
                Ok(()) => cancelled += 1,
                // Fired or cancelled concurrently.
                Err(TriggerError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(cancelled)
    }

    /// Drain one batch of `queue` at its configured batch size.
    pub fn run(&self, queue: &str) -> Result<RunSummary, SchedulerError> {
        let settings = self.settings(queue);
        Ok(self.worker.run(settings.batch_size, queue)?)
    }

    fn is_own_provider(&self, provider: &str) -> bool {
        provider == self.manager.default_provider_name()
    }
}

impl EventListener for Scheduler {
    fn on_event(&self, event: &QueueEvent) {
        if !self.is_own_provider(event.provider()) {
            return;
        }

        match event {
            QueueEvent::JobQueued { queue, .. } => self.note_queued(queue),
            QueueEvent::RunComplete { queue, .. } => {
                if let Err(e) = self.schedule_next_run(queue) {
                    warn!(queue = %queue, error = %e, "reschedule after run failed; will retry on next event");
                }
            }
            _ => {}
        }
    }
}

impl TriggerTarget for Scheduler {
    fn fire(&self, trigger: &Trigger) {
        if let Err(e) = self.run(&trigger.args.queue) {
            warn!(queue = %trigger.args.queue, trigger_id = %trigger.id, error = %e, "drain run failed");
        }
    }
}
