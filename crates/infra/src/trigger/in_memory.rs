//! In-memory trigger facility for tests/dev and single-process deployments.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::debug;

use taskdrain_core::TriggerId;

use super::{Trigger, TriggerArgs, TriggerError, TriggerFacility};

/// Trigger table behind a mutex.
///
/// - Registering the same `(fire_at, args)` twice is rejected
/// - An optional capacity bounds the number of outstanding triggers
/// - Due triggers are removed as they are taken, so each fires once
#[derive(Debug, Default)]
pub struct InMemoryTriggerFacility {
    triggers: Mutex<Vec<Trigger>>,
    capacity: Option<usize>,
}

impl InMemoryTriggerFacility {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject registrations once `capacity` triggers are outstanding.
    pub fn with_capacity_limit(capacity: usize) -> Self {
        Self {
            triggers: Mutex::new(Vec::new()),
            capacity: Some(capacity),
        }
    }

    /// Remove and return every trigger due at `now`, earliest first.
    pub fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<Trigger>, TriggerError> {
        let mut triggers = self.lock()?;
        let (mut due, rest): (Vec<Trigger>, Vec<Trigger>) =
            triggers.drain(..).partition(|t| t.fire_at <= now);
        *triggers = rest;

        due.sort_by_key(|t| (t.fire_at, t.id));
        Ok(due)
    }

    /// Every outstanding trigger, earliest first.
    pub fn pending(&self) -> Result<Vec<Trigger>, TriggerError> {
        let mut all = self.lock()?.clone();
        all.sort_by_key(|t| (t.fire_at, t.id));
        Ok(all)
    }

    /// Earliest outstanding fire time.
    pub fn next_fire_at(&self) -> Option<DateTime<Utc>> {
        self.lock().ok()?.iter().map(|t| t.fire_at).min()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<Trigger>>, TriggerError> {
        self.triggers
            .lock()
            .map_err(|_| TriggerError::Storage("trigger table lock poisoned".to_string()))
    }
}

impl TriggerFacility for InMemoryTriggerFacility {
    fn register(&self, fire_at: DateTime<Utc>, args: TriggerArgs) -> Result<TriggerId, TriggerError> {
        let mut triggers = self.lock()?;

        if triggers.iter().any(|t| t.fire_at == fire_at && t.args == args) {
            return Err(TriggerError::Rejected(format!(
                "a trigger for queue {} already fires at {}",
                args.queue, fire_at
            )));
        }
        if let Some(capacity) = self.capacity.filter(|c| triggers.len() >= *c) {
            return Err(TriggerError::Rejected(format!(
                "trigger capacity of {capacity} reached"
            )));
        }

        let id = TriggerId::new();
        debug!(trigger_id = %id, queue = %args.queue, %fire_at, "trigger registered");
        triggers.push(Trigger { id, fire_at, args });
        Ok(id)
    }

    fn list(&self, queue: &str) -> Result<Vec<Trigger>, TriggerError> {
        let mut matching: Vec<Trigger> = self
            .lock()?
            .iter()
            .filter(|t| t.args.queue == queue)
            .cloned()
            .collect();
        matching.sort_by_key(|t| (t.fire_at, t.id));
        Ok(matching)
    }

    fn cancel(&self, id: TriggerId) -> Result<(), TriggerError> {
        let mut triggers = self.lock()?;
        let before = triggers.len();
        triggers.retain(|t| t.id != id);
        if triggers.len() == before {
            return Err(TriggerError::NotFound(id));
        }
        Ok(())
    }
}
