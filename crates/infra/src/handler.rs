//! Job handlers and the registry that resolves them.
//!
//! Typed jobs resolve by handler name with the usual fallbacks:
//!
//! - exact name (`mail.send`)
//! - category pattern (`mail.*`), longest prefix first
//! - wildcard (`*`)
//!
//! Inline jobs resolve by exact closure name only.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

use taskdrain_core::{Job, JobPayload};

/// Why a single job attempt did not succeed.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("no handler registered for {0}")]
    MissingHandler(String),
    #[error("{0:#}")]
    Failed(anyhow::Error),
    #[error("job timed out after {0:?}")]
    TimedOut(Duration),
    #[error("job expired at {0}")]
    Expired(DateTime<Utc>),
    #[error("job handler panicked: {0}")]
    Panicked(String),
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(err)
    }
}

/// Executes one kind of job.
///
/// The retry policy methods provide defaults the dispatcher copies onto a job
/// that does not set its own.
pub trait JobHandler: Send + Sync {
    fn handle(&self, job: &Job) -> anyhow::Result<()>;

    /// Called after an attempt fails, once the failure has been recorded.
    fn failed(&self, _job: &Job, _error: &str) {}

    fn tries(&self) -> Option<u32> {
        None
    }

    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Adapts a closure into a [`JobHandler`] with an optional retry policy.
pub struct FnHandler<F> {
    f: F,
    tries: Option<u32>,
    timeout: Option<Duration>,
    retry_after: Option<Duration>,
}

impl<F> FnHandler<F>
where
    F: Fn(&Job) -> anyhow::Result<()> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            tries: None,
            timeout: None,
            retry_after: None,
        }
    }

    pub fn with_tries(mut self, tries: u32) -> Self {
        self.tries = Some(tries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

impl<F> JobHandler for FnHandler<F>
where
    F: Fn(&Job) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, job: &Job) -> anyhow::Result<()> {
        (self.f)(job)
    }

    fn tries(&self) -> Option<u32> {
        self.tries
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

/// An inline closure: receives the job's positional arguments.
struct InlineHandler<F>(F);

impl<F> JobHandler for InlineHandler<F>
where
    F: Fn(&[JsonValue]) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, job: &Job) -> anyhow::Result<()> {
        match &job.payload {
            JobPayload::Inline { args, .. } => (self.0)(args),
            JobPayload::Typed { handler, .. } => {
                anyhow::bail!("inline closure invoked with typed job {handler}")
            }
        }
    }
}

type FailureCallback = Arc<dyn Fn(&Job, &str) + Send + Sync>;

#[derive(Default)]
pub struct HandlerRegistry {
    typed: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    inline: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    on_failure: RwLock<Vec<FailureCallback>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let typed = self.typed.read().map(|h| h.len()).unwrap_or(0);
        let inline = self.inline.read().map(|h| h.len()).unwrap_or(0);
        f.debug_struct("HandlerRegistry")
            .field("typed", &typed)
            .field("inline", &inline)
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a typed job name or pattern (`name`, `prefix.*`, `*`).
    pub fn register<H>(&self, pattern: impl Into<String>, handler: H)
    where
        H: JobHandler + 'static,
    {
        if let Ok(mut typed) = self.typed.write() {
            typed.insert(pattern.into(), Arc::new(handler));
        }
    }

    /// Register a plain closure for a typed job name or pattern.
    pub fn register_fn<F>(&self, pattern: impl Into<String>, f: F)
    where
        F: Fn(&Job) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(pattern, FnHandler::new(f));
    }

    /// Register an inline closure under an exact name.
    pub fn register_closure<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&[JsonValue]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if let Ok(mut inline) = self.inline.write() {
            inline.insert(name.into(), Arc::new(InlineHandler(f)));
        }
    }

    /// Add a callback run for every failed attempt, after the handler's own hook.
    pub fn on_failure<F>(&self, callback: F)
    where
        F: Fn(&Job, &str) + Send + Sync + 'static,
    {
        if let Ok(mut callbacks) = self.on_failure.write() {
            callbacks.push(Arc::new(callback));
        }
    }

    pub fn resolve(&self, payload: &JobPayload) -> Option<Arc<dyn JobHandler>> {
        match payload {
            JobPayload::Typed { handler, .. } => self.resolve_typed(handler),
            JobPayload::Inline { closure, .. } => {
                self.inline.read().ok()?.get(closure.as_str()).cloned()
            }
        }
    }

    fn resolve_typed(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        let typed = self.typed.read().ok()?;

        if let Some(h) = typed.get(name) {
            return Some(h.clone());
        }

        // "mail.*" matches "mail.send"; the most specific pattern wins.
        let category = typed
            .iter()
            .filter_map(|(pattern, h)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = name.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), h))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, h)| h.clone());

        category.or_else(|| typed.get("*").cloned())
    }

    /// Copy the resolved handler's retry policy onto fields the job leaves unset.
    pub fn apply_defaults(&self, job: &mut Job) {
        let Some(handler) = self.resolve(&job.payload) else {
            return;
        };
        if job.tries.is_none() {
            job.tries = handler.tries();
        }
        if job.timeout.is_none() {
            job.timeout = handler.timeout();
        }
        if job.retry_after.is_none() {
            job.retry_after = handler.retry_after();
        }
    }

    /// Run the job's handler in the current thread.
    pub fn run(&self, job: &Job) -> Result<(), HandlerError> {
        let name = job.payload.handler_name();
        let handler = self
            .resolve(&job.payload)
            .ok_or_else(|| HandlerError::MissingHandler(name.to_string()))?;

        debug!(handler = %name, queue = %job.queue, "running job handler");
        handler.handle(job).map_err(HandlerError::from)
    }

    /// Run the failure hooks for a failed attempt.
    pub fn notify_failed(&self, job: &Job, error: &str) {
        if let Some(handler) = self.resolve(&job.payload) {
            handler.failed(job, error);
        }

        let callbacks: Vec<FailureCallback> = self
            .on_failure
            .read()
            .map(|c| c.clone())
            .unwrap_or_default();
        for callback in callbacks {
            callback(job, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn named(registry: &HandlerRegistry, pattern: &str, tag: &'static str, seen: &Arc<Mutex<Vec<&'static str>>>) {
        let seen = seen.clone();
        registry.register_fn(pattern, move |_| {
            seen.lock().unwrap().push(tag);
            Ok(())
        });
    }

    #[test]
    fn exact_then_category_then_wildcard() {
        let registry = HandlerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        named(&registry, "mail.send", "exact", &seen);
        named(&registry, "mail.*", "category", &seen);
        named(&registry, "mail.digest.*", "subcategory", &seen);
        named(&registry, "*", "wildcard", &seen);

        for name in ["mail.send", "mail.bounce", "mail.digest.weekly", "report.build", "mailer"] {
            registry.run(&Job::typed(name, serde_json::json!({}))).unwrap();
        }

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["exact", "category", "subcategory", "wildcard", "wildcard"]
        );
    }

    #[test]
    fn inline_closures_receive_args() {
        let registry = HandlerRegistry::new();
        let total = Arc::new(Mutex::new(0));
        let sum = total.clone();
        registry.register_closure("add", move |args| {
            *sum.lock().unwrap() += args.iter().filter_map(|a| a.as_i64()).sum::<i64>();
            Ok(())
        });

        registry
            .run(&Job::inline("add", vec![serde_json::json!(2), serde_json::json!(3)]))
            .unwrap();

        assert_eq!(*total.lock().unwrap(), 5);
        assert!(matches!(
            registry.run(&Job::inline("missing", vec![])),
            Err(HandlerError::MissingHandler(name)) if name == "missing"
        ));
    }

    #[test]
    fn handler_policy_fills_unset_job_fields() {
        let registry = HandlerRegistry::new();
        registry.register(
            "sync",
            FnHandler::new(|_| Ok(()))
                .with_tries(3)
                .with_timeout(Duration::from_secs(5))
                .with_retry_after(Duration::from_secs(30)),
        );

        let mut job = Job::typed("sync", serde_json::json!({})).with_tries(1);
        registry.apply_defaults(&mut job);

        assert_eq!(job.tries, Some(1));
        assert_eq!(job.timeout, Some(Duration::from_secs(5)));
        assert_eq!(job.retry_after, Some(Duration::from_secs(30)));
    }

    #[test]
    fn failure_renders_context_chain() {
        let registry = HandlerRegistry::new();
        registry.register_fn("boom", |_| {
            Err(anyhow::anyhow!("disk full")).map_err(|e| e.context("writing report"))
        });

        let err = registry.run(&Job::typed("boom", serde_json::json!({}))).unwrap_err();

        assert_eq!(err.to_string(), "writing report: disk full");
    }

    #[test]
    fn failure_hooks_run_handler_first_then_callbacks() {
        struct Hooked(Arc<Mutex<Vec<String>>>);
        impl JobHandler for Hooked {
            fn handle(&self, _job: &Job) -> anyhow::Result<()> {
                anyhow::bail!("nope")
            }
            fn failed(&self, _job: &Job, error: &str) {
                self.0.lock().unwrap().push(format!("handler:{error}"));
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = HandlerRegistry::new();
        registry.register("hooked", Hooked(log.clone()));
        let cb_log = log.clone();
        registry.on_failure(move |job, error| {
            cb_log
                .lock()
                .unwrap()
                .push(format!("callback:{}:{error}", job.payload.handler_name()));
        });

        registry.notify_failed(&Job::typed("hooked", serde_json::json!({})), "nope");

        assert_eq!(*log.lock().unwrap(), vec!["handler:nope", "callback:hooked:nope"]);
    }
}
