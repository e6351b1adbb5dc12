//! Batch worker: pulls one batch for one queue and runs each job in order.
//!
//! A job that fails (error, panic, expiry or missing handler) is recorded as
//! failed and the batch moves on. A timed-out job keeps its lease and is picked
//! up again once it lapses, the same as a job whose worker died. `RunComplete` is emitted after
//! every batch, whatever happened to its jobs.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, mpsc};
use std::thread;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use taskdrain_core::{Clock, Job};
use taskdrain_events::{EventSink, QueueEvent};

use crate::handler::{HandlerError, HandlerRegistry, JobHandler};
use crate::manager::{ManagerError, ProviderHandle, QueueManager};
use crate::provider::ProviderError;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Outcome counts for one `run`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct Worker {
    manager: Arc<QueueManager>,
    handlers: Arc<HandlerRegistry>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("manager", &self.manager)
            .field("handlers", &self.handlers)
            .finish()
    }
}

impl Worker {
    pub fn new(
        manager: Arc<QueueManager>,
        handlers: Arc<HandlerRegistry>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            manager,
            handlers,
            events,
            clock,
        }
    }

    /// Pop up to `batch_size` jobs from `queue` on the default provider and run them.
    ///
    /// Only provider resolution and `pop` failures are returned as errors.
    pub fn run(&self, batch_size: usize, queue: &str) -> Result<RunSummary, WorkerError> {
        let provider = self.manager.default_provider()?;
        let batch = provider.pop(queue, batch_size)?;
        let jobs = batch.job_ids().to_vec();

        info!(provider = %provider.name(), queue, jobs = jobs.len(), "run started");
        self.events.emit(QueueEvent::RunStart {
            provider: provider.name().to_string(),
            queue: queue.to_string(),
            jobs: jobs.clone(),
        });

        let mut summary = RunSummary::default();
        for job in batch {
            summary.processed += 1;
            if self.process(&provider, job) {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
        }

        info!(
            provider = %provider.name(),
            queue,
            processed = summary.processed,
            failed = summary.failed,
            "run complete"
        );
        self.events.emit(QueueEvent::RunComplete {
            provider: provider.name().to_string(),
            queue: queue.to_string(),
            jobs,
        });

        Ok(summary)
    }

    /// Run one leased job. Returns whether it succeeded.
    fn process(&self, provider: &ProviderHandle, job: Job) -> bool {
        let Some(id) = job.id else {
            return false;
        };

        debug!(provider = %provider.name(), queue = %job.queue, job_id = %id, "processing job");
        self.events.emit(QueueEvent::JobProcessing {
            provider: provider.name().to_string(),
            queue: job.queue.clone(),
            job: job.clone(),
        });

        match self.execute(&job) {
            Ok(()) => {
                if let Err(err) = provider.release(id) {
                    error!(job_id = %id, error = %err, "failed to release processed job");
                }
                debug!(job_id = %id, "job processed");
                self.events.emit(QueueEvent::JobProcessed {
                    provider: provider.name().to_string(),
                    queue: job.queue.clone(),
                    job,
                });
                true
            }
            Err(failure) => {
                let message = failure.to_string();
                warn!(job_id = %id, queue = %job.queue, error = %message, "job failed");

                let recorded = match &failure {
                    HandlerError::TimedOut(_) => provider.mark_timed_out(id, &message),
                    _ => provider.mark_failed(id, &message),
                };
                if let Err(err) = recorded {
                    error!(job_id = %id, error = %err, "failed to record job failure");
                }
                self.handlers.notify_failed(&job, &message);
                self.events.emit(QueueEvent::JobFailed {
                    provider: provider.name().to_string(),
                    queue: job.queue.clone(),
                    job,
                    error: message,
                });
                false
            }
        }
    }

    fn execute(&self, job: &Job) -> Result<(), HandlerError> {
        if let Some(at) = job.timeout_at.filter(|_| job.is_expired(self.clock.now())) {
            return Err(HandlerError::Expired(at));
        }

        let handler = self
            .handlers
            .resolve(&job.payload)
            .ok_or_else(|| HandlerError::MissingHandler(job.payload.handler_name().to_string()))?;

        match job.timeout {
            None => guarded(handler.as_ref(), job),
            Some(limit) => {
                // The handler thread is detached on timeout; it cannot be interrupted.
                let (tx, rx) = mpsc::channel();
                let owned = job.clone();
                thread::Builder::new()
                    .name("taskdrain-job".to_string())
                    .spawn(move || {
                        let _ = tx.send(guarded(handler.as_ref(), &owned));
                    })
                    .map_err(|e| HandlerError::Failed(anyhow::Error::new(e)))?;

                match rx.recv_timeout(limit) {
                    Ok(result) => result,
                    Err(mpsc::RecvTimeoutError::Timeout) => Err(HandlerError::TimedOut(limit)),
                    Err(mpsc::RecvTimeoutError::Disconnected) => {
                        Err(HandlerError::Panicked("handler thread exited".to_string()))
                    }
                }
            }
        }
    }
}

fn guarded(handler: &dyn JobHandler, job: &Job) -> Result<(), HandlerError> {
    match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(job))) {
        Ok(result) => result.map_err(HandlerError::from),
        Err(payload) => Err(HandlerError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use chrono::Utc;
    use taskdrain_core::ManualClock;
    use taskdrain_events::ListenerRegistry;

    use super::*;
    use crate::config::QueueConfig;
    use crate::provider::Provider;

    struct Fixture {
        worker: Worker,
        provider: ProviderHandle,
        handlers: Arc<HandlerRegistry>,
        clock: Arc<ManualClock>,
        events: Arc<Mutex<Vec<&'static str>>>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let manager = Arc::new(QueueManager::new(QueueConfig::default(), clock.clone()));
        let handlers = Arc::new(HandlerRegistry::new());
        let registry = Arc::new(ListenerRegistry::new());
        let events = Arc::new(Mutex::new(Vec::new()));
        let log = events.clone();
        registry.listen(Arc::new(move |e: &QueueEvent| log.lock().unwrap().push(e.name())));

        Fixture {
            worker: Worker::new(manager.clone(), handlers.clone(), registry, clock.clone()),
            provider: manager.default_provider().unwrap(),
            handlers,
            clock,
            events,
        }
    }

    fn push(provider: &dyn Provider, name: &str) -> taskdrain_core::JobId {
        provider
            .push(Job::typed(name, serde_json::json!({})).on_queue("q"))
            .unwrap()
    }

    #[test]
    fn successful_jobs_are_released() {
        let f = fixture();
        f.handlers.register_fn("ok", |_| Ok(()));
        push(&*f.provider, "ok");
        push(&*f.provider, "ok");

        let summary = f.worker.run(10, "q").unwrap();

        assert_eq!(summary, RunSummary { processed: 2, succeeded: 2, failed: 0 });
        assert_eq!(f.provider.pending_count("q").unwrap(), 0);
        assert_eq!(
            *f.events.lock().unwrap(),
            vec![
                "run_start",
                "job_processing",
                "job_processed",
                "job_processing",
                "job_processed",
                "run_complete"
            ]
        );
    }

    #[test]
    fn failing_job_does_not_abort_the_batch() {
        let f = fixture();
        let ran = Arc::new(Mutex::new(Vec::new()));
        let log = ran.clone();
        f.handlers.register_fn("*", move |job| {
            let name = job.payload.handler_name().to_string();
            log.lock().unwrap().push(name.clone());
            if name == "bad" {
                anyhow::bail!("bad job");
            }
            Ok(())
        });

        push(&*f.provider, "good");
        let bad = push(&*f.provider, "bad");
        push(&*f.provider, "good");

        let summary = f.worker.run(10, "q").unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(*ran.lock().unwrap(), vec!["good", "bad", "good"]);
        assert_eq!(f.events.lock().unwrap().last(), Some(&"run_complete"));

        let record = f.provider.get(bad).unwrap().unwrap();
        assert!(record.lease.failed);
        assert_eq!(record.last_error.as_deref(), Some("bad job"));
    }

    #[test]
    fn panics_and_missing_handlers_are_failures() {
        let f = fixture();
        f.handlers.register_fn("panics", |_| panic!("kaboom"));
        let panicked = push(&*f.provider, "panics");
        let orphan = push(&*f.provider, "nobody");

        let summary = f.worker.run(10, "q").unwrap();

        assert_eq!(summary.failed, 2);
        let record = f.provider.get(panicked).unwrap().unwrap();
        assert_eq!(record.last_error.as_deref(), Some("job handler panicked: kaboom"));
        let record = f.provider.get(orphan).unwrap().unwrap();
        assert_eq!(record.last_error.as_deref(), Some("no handler registered for nobody"));
    }

    #[test]
    fn overrunning_job_times_out() {
        let f = fixture();
        f.handlers.register_fn("slow", |_| {
            thread::sleep(Duration::from_millis(500));
            Ok(())
        });
        let id = f
            .provider
            .push(
                Job::typed("slow", serde_json::json!({}))
                    .on_queue("q")
                    .with_timeout(Duration::from_millis(20)),
            )
            .unwrap();

        let summary = f.worker.run(1, "q").unwrap();

        assert_eq!(summary.failed, 1);
        let record = f.provider.get(id).unwrap().unwrap();
        assert!(record.lease.timed_out);
        assert!(record.last_error.unwrap().contains("timed out"));
    }

    #[test]
    fn timed_out_job_is_picked_up_after_its_lease_lapses() {
        let f = fixture();
        let runs = Arc::new(Mutex::new(0u32));
        let count = runs.clone();
        f.handlers.register_fn("slow_once", move |_| {
            let mut n = count.lock().unwrap();
            *n += 1;
            if *n == 1 {
                drop(n);
                thread::sleep(Duration::from_millis(200));
            }
            Ok(())
        });
        let id = f
            .provider
            .push(
                Job::typed("slow_once", serde_json::json!({}))
                    .on_queue("q")
                    .with_tries(2)
                    .with_timeout(Duration::from_millis(10)),
            )
            .unwrap();

        assert_eq!(f.worker.run(1, "q").unwrap().failed, 1);
        assert_eq!(f.worker.run(1, "q").unwrap().processed, 0);

        f.clock.advance(Duration::from_secs(301));
        let summary = f.worker.run(1, "q").unwrap();

        assert_eq!(summary.succeeded, 1);
        assert!(f.provider.get(id).unwrap().is_none());
    }

    #[test]
    fn timed_out_job_is_retried_even_with_default_tries() {
        let f = fixture();
        let runs = Arc::new(Mutex::new(0u32));
        let count = runs.clone();
        f.handlers.register_fn("slow", move |_| {
            let mut n = count.lock().unwrap();
            *n += 1;
            if *n == 1 {
                drop(n);
                thread::sleep(Duration::from_millis(200));
            }
            Ok(())
        });
        let id = f
            .provider
            .push(
                Job::typed("slow", serde_json::json!({}))
                    .on_queue("q")
                    .with_timeout(Duration::from_millis(10)),
            )
            .unwrap();

        f.worker.run(1, "q").unwrap();
        assert!(!f.provider.get(id).unwrap().unwrap().is_exhausted());

        f.clock.advance(Duration::from_secs(300));
        let summary = f.worker.run(1, "q").unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(*runs.lock().unwrap(), 2);
        assert!(f.provider.get(id).unwrap().is_none());
    }

    #[test]
    fn expired_job_fails_without_running() {
        let f = fixture();
        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        f.handlers.register_fn("late", move |_| {
            *flag.lock().unwrap() = true;
            Ok(())
        });
        let deadline = f.clock.now() + chrono::Duration::seconds(10);
        f.provider
            .push(Job::typed("late", serde_json::json!({})).on_queue("q").expires_at(deadline))
            .unwrap();

        f.clock.advance(Duration::from_secs(11));
        let summary = f.worker.run(1, "q").unwrap();

        assert_eq!(summary.failed, 1);
        assert!(!*ran.lock().unwrap());
    }

    #[test]
    fn failed_hooks_run_for_each_failure() {
        let f = fixture();
        let failures = Arc::new(Mutex::new(Vec::new()));
        let log = failures.clone();
        f.handlers.register_fn("bad", |_| anyhow::bail!("nope"));
        f.handlers.on_failure(move |_, error| log.lock().unwrap().push(error.to_string()));
        push(&*f.provider, "bad");

        f.worker.run(1, "q").unwrap();

        assert_eq!(*failures.lock().unwrap(), vec!["nope"]);
    }

    #[test]
    fn empty_queue_still_reports_run_boundaries() {
        let f = fixture();

        let summary = f.worker.run(5, "q").unwrap();

        assert_eq!(summary, RunSummary::default());
        assert_eq!(*f.events.lock().unwrap(), vec!["run_start", "run_complete"]);
    }
}
