//! The job: a serializable unit of work plus queue-routing metadata.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{CoreError, CoreResult};
use crate::id::JobId;

/// Queue name used when a producer does not pick one.
pub const DEFAULT_QUEUE: &str = "default";

/// What to run when the job is handled.
///
/// Both variants resolve to a registered handler by name; they differ in how
/// their arguments are shaped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    /// A typed job: a named handler plus a structured payload.
    Typed { handler: String, data: JsonValue },
    /// An inline closure registered under a name, plus positional arguments.
    Inline { closure: String, args: Vec<JsonValue> },
}

impl JobPayload {
    /// Name used to resolve the handler (handler name or closure name).
    pub fn handler_name(&self) -> &str {
        match self {
            JobPayload::Typed { handler, .. } => handler,
            JobPayload::Inline { closure, .. } => closure,
        }
    }
}

/// A unit of deferred work.
///
/// Created in memory by a producer; `id` stays `None` until a provider
/// persists it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Option<JobId>,
    pub queue: String,
    pub payload: JobPayload,
    /// Delay before the job becomes eligible for `pop`.
    pub delay: Option<Duration>,
    /// `false` for plain synchronous work that must never touch a provider.
    pub should_queue: bool,
    /// Maximum number of attempts (defaults to 1 when unset).
    pub tries: Option<u32>,
    /// Wall-clock budget for a single attempt.
    pub timeout: Option<Duration>,
    /// How long a failed attempt stays leased before it may be re-claimed.
    pub retry_after: Option<Duration>,
    /// Absolute deadline after which the job fails without running.
    pub timeout_at: Option<DateTime<Utc>>,
    /// Number of times the job has been claimed by a batch.
    #[serde(default)]
    pub attempts: u32,
}

impl Job {
    fn with_payload(payload: JobPayload) -> Self {
        Self {
            id: None,
            queue: DEFAULT_QUEUE.to_string(),
            payload,
            delay: None,
            should_queue: true,
            tries: None,
            timeout: None,
            retry_after: None,
            timeout_at: None,
            attempts: 0,
        }
    }

    /// Create a queued job for a named handler.
    pub fn typed(handler: impl Into<String>, data: JsonValue) -> Self {
        Self::with_payload(JobPayload::Typed {
            handler: handler.into(),
            data,
        })
    }

    /// Create a queued job for a named inline closure.
    pub fn inline(closure: impl Into<String>, args: Vec<JsonValue>) -> Self {
        Self::with_payload(JobPayload::Inline {
            closure: closure.into(),
            args,
        })
    }

    /// Route the job to a named queue.
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Opt out of queuing: the dispatcher runs the job in the caller's context.
    pub fn sync(mut self) -> Self {
        self.should_queue = false;
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
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

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.timeout_at = Some(at);
        self
    }

    /// Reject jobs that can never be routed.
    pub fn validate(&self) -> CoreResult<()> {
        if self.queue.trim().is_empty() {
            return Err(CoreError::validation("queue name must not be empty"));
        }
        if self.payload.handler_name().trim().is_empty() {
            return Err(CoreError::validation("handler name must not be empty"));
        }
        if self.tries == Some(0) {
            return Err(CoreError::validation("tries must be at least 1"));
        }
        Ok(())
    }

    /// Whether another attempt is allowed after the current one.
    pub fn can_retry(&self) -> bool {
        self.attempts < self.tries.unwrap_or(1)
    }

    /// Whether `timeout_at` has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.timeout_at.is_some_and(|at| now >= at)
    }

    /// Whether two jobs describe the same work on the same queue.
    ///
    /// Identity, attempts and retry policy are ignored.
    pub fn same_work(&self, other: &Job) -> bool {
        self.queue == other.queue && self.payload == other.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_jobs_default_to_default_queue() {
        let job = Job::typed("mail.send", serde_json::json!({"to": "a@b.c"}));

        assert_eq!(job.queue, DEFAULT_QUEUE);
        assert!(job.should_queue);
        assert!(job.id.is_none());
        assert_eq!(job.payload.handler_name(), "mail.send");
    }

    #[test]
    fn single_try_is_exhausted_after_first_attempt() {
        let mut job = Job::typed("x", serde_json::json!({}));
        assert!(job.can_retry());

        job.attempts = 1;
        assert!(!job.can_retry());
    }

    #[test]
    fn tries_allow_additional_attempts() {
        let mut job = Job::typed("x", serde_json::json!({})).with_tries(3);
        job.attempts = 2;
        assert!(job.can_retry());

        job.attempts = 3;
        assert!(!job.can_retry());
    }

    #[test]
    fn validate_rejects_blank_queue_and_zero_tries() {
        let job = Job::typed("x", serde_json::json!({})).on_queue("  ");
        assert!(matches!(job.validate(), Err(CoreError::Validation(_))));

        let job = Job::typed("x", serde_json::json!({})).with_tries(0);
        assert!(matches!(job.validate(), Err(CoreError::Validation(_))));
    }

    #[test]
    fn same_work_ignores_identity_and_attempts() {
        let a = Job::inline("cleanup", vec![serde_json::json!(1)]).on_queue("maint");
        let mut b = a.clone();
        b.id = Some(JobId::new());
        b.attempts = 4;

        assert!(a.same_work(&b));
        assert!(!a.same_work(&b.clone().on_queue("other")));
    }

    #[test]
    fn payload_serializes_with_kind_tag() {
        let job = Job::inline("cleanup", vec![serde_json::json!("x")]);
        let value = serde_json::to_value(&job.payload).unwrap();

        assert_eq!(value["kind"], "inline");
        assert_eq!(value["closure"], "cleanup");
    }
}
