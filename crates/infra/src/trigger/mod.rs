//! Timed drain triggers.
//!
//! The scheduler never runs work on its own clock: it registers triggers with a
//! `TriggerFacility` and is called back when they come due. A facility is an
//! at-least-once, best-effort timer service.
//!
//! A trigger is identified by its fire time together with its arguments, which
//! is why the scheduler staggers fire times for the same queue.

pub mod in_memory;
pub mod pump;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use taskdrain_core::TriggerId;

pub use in_memory::InMemoryTriggerFacility;
pub use pump::{PumpConfig, PumpHandle, PumpStats, TriggerPump, TriggerTarget};

#[derive(Debug, Clone, Error)]
pub enum TriggerError {
    #[error("trigger rejected: {0}")]
    Rejected(String),
    #[error("trigger not found: {0}")]
    NotFound(TriggerId),
    #[error("trigger storage error: {0}")]
    Storage(String),
}

/// Arguments carried by a drain trigger.
///
/// `scheduled_time` keeps triggers for the same queue distinguishable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriggerArgs {
    pub queue: String,
    pub scheduled_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: TriggerId,
    pub fire_at: DateTime<Utc>,
    pub args: TriggerArgs,
}

pub trait TriggerFacility: Send + Sync {
    fn register(&self, fire_at: DateTime<Utc>, args: TriggerArgs) -> Result<TriggerId, TriggerError>;

    /// Outstanding triggers whose `queue` argument is `queue`.
    fn list(&self, queue: &str) -> Result<Vec<Trigger>, TriggerError>;

    fn cancel(&self, id: TriggerId) -> Result<(), TriggerError>;
}

impl<F> TriggerFacility for std::sync::Arc<F>
where
    F: TriggerFacility + ?Sized,
{
    fn register(&self, fire_at: DateTime<Utc>, args: TriggerArgs) -> Result<TriggerId, TriggerError> {
        (**self).register(fire_at, args)
    }

    fn list(&self, queue: &str) -> Result<Vec<Trigger>, TriggerError> {
        (**self).list(queue)
    }

    fn cancel(&self, id: TriggerId) -> Result<(), TriggerError> {
        (**self).cancel(id)
    }
}
