//! In-memory provider for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use taskdrain_core::{Clock, Job, JobId, JobRecord, SystemClock};

use super::{Batch, Provider, ProviderError};

#[derive(Debug, Default)]
struct State {
    records: HashMap<JobId, JobRecord>,
    next_sequence: u64,
}

/// Mutex-guarded job map.
///
/// Every operation takes the same lock, so lease acquisition in `pop` is
/// atomic with respect to concurrent callers.
#[derive(Debug)]
pub struct InMemoryProvider {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    lease_for: Duration,
}

impl InMemoryProvider {
    pub fn new(clock: Arc<dyn Clock>, lease_for: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
            lease_for,
        }
    }

    pub fn arc(clock: Arc<dyn Clock>, lease_for: Duration) -> Arc<Self> {
        Arc::new(Self::new(clock, lease_for))
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_for
    }

    /// Total number of stored records, whatever their state.
    pub fn len(&self) -> usize {
        self.lock().map(|s| s.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, ProviderError> {
        self.state
            .lock()
            .map_err(|_| ProviderError::Storage("lock poisoned".to_string()))
    }
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock), Duration::from_secs(300))
    }
}

impl Provider for InMemoryProvider {
    fn push(&self, job: Job) -> Result<JobId, ProviderError> {
        job.validate()?;
        let now = self.clock.now();
        let mut state = self.lock()?;

        let id = job.id.unwrap_or_default();
        if state.records.contains_key(&id) {
            return Err(ProviderError::AlreadyExists(id));
        }

        state.next_sequence += 1;
        let sequence = state.next_sequence;
        state.records.insert(id, JobRecord::new(id, job, sequence, now));
        Ok(id)
    }

    fn pop(&self, queue: &str, count: usize) -> Result<Batch, ProviderError> {
        if count == 0 {
            return Ok(Batch::empty());
        }

        let now = self.clock.now();
        let mut state = self.lock()?;

        let mut eligible: Vec<(u64, JobId)> = state
            .records
            .values()
            .filter(|r| r.queue() == queue && r.is_claimable(now))
            .map(|r| (r.sequence, r.id))
            .collect();
        eligible.sort_unstable();
        eligible.truncate(count);

        let mut jobs = Vec::with_capacity(eligible.len());
        for (_, id) in eligible {
            if let Some(record) = state.records.get_mut(&id) {
                record.acquire(now, self.lease_for);
                jobs.push(record.job.clone());
            }
        }

        debug!(queue, requested = count, leased = jobs.len(), "popped batch");
        Ok(Batch::new(jobs))
    }

    fn pending_count(&self, queue: &str) -> Result<usize, ProviderError> {
        let now = self.clock.now();
        let state = self.lock()?;
        Ok(state
            .records
            .values()
            .filter(|r| r.queue() == queue && r.is_pending(now))
            .count())
    }

    fn next_available_at(&self, queue: &str) -> Result<Option<DateTime<Utc>>, ProviderError> {
        let state = self.lock()?;
        Ok(state
            .records
            .values()
            .filter(|r| r.queue() == queue)
            .filter_map(JobRecord::claimable_from)
            .min())
    }

    fn in_queue(&self, job: &Job, queue: &str) -> Result<bool, ProviderError> {
        let state = self.lock()?;
        Ok(state.records.values().any(|r| {
            r.queue() == queue && r.job.payload == job.payload && !r.is_exhausted()
        }))
    }

    fn release(&self, id: JobId) -> Result<(), ProviderError> {
        let mut state = self.lock()?;
        state
            .records
            .remove(&id)
            .map(|_| ())
            .ok_or(ProviderError::NotFound(id))
    }

    fn mark_failed(&self, id: JobId, error: &str) -> Result<(), ProviderError> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        let record = state.records.get_mut(&id).ok_or(ProviderError::NotFound(id))?;
        record.fail(now, error, self.lease_for);
        Ok(())
    }

    fn mark_timed_out(&self, id: JobId, error: &str) -> Result<(), ProviderError> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        let record = state.records.get_mut(&id).ok_or(ProviderError::NotFound(id))?;
        record.time_out(now, error, self.lease_for);
        Ok(())
    }

    fn get(&self, id: JobId) -> Result<Option<JobRecord>, ProviderError> {
        Ok(self.lock()?.records.get(&id).cloned())
    }

    fn failed_jobs(&self, queue: &str, limit: usize) -> Result<Vec<JobRecord>, ProviderError> {
        let state = self.lock()?;
        let mut failed: Vec<JobRecord> = state
            .records
            .values()
            .filter(|r| r.queue() == queue && r.lease.failed)
            .cloned()
            .collect();

        failed.sort_by_key(|r| (r.failed_at, r.sequence));
        failed.truncate(limit);
        Ok(failed)
    }

    fn retry_failed(&self, id: JobId) -> Result<(), ProviderError> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        let record = state.records.get_mut(&id).ok_or(ProviderError::NotFound(id))?;
        record.reset(now);
        Ok(())
    }

    fn forget(&self, id: JobId) -> Result<(), ProviderError> {
        self.release(id)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::thread;

    use chrono::Utc;
    use taskdrain_core::ManualClock;

    use super::*;

    fn setup() -> (Arc<ManualClock>, InMemoryProvider) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let provider = InMemoryProvider::new(clock.clone(), Duration::from_secs(60));
        (clock, provider)
    }

    fn job(n: u32) -> Job {
        Job::typed("test", serde_json::json!({ "n": n })).on_queue("q")
    }

    #[test]
    fn pop_leases_oldest_first_and_hides_them() {
        let (_clock, provider) = setup();
        let ids: Vec<JobId> = (0..3).map(|n| provider.push(job(n)).unwrap()).collect();

        let batch = provider.pop("q", 5).unwrap();
        assert_eq!(batch.job_ids(), ids.as_slice());
        assert!(batch.map(|j| j.attempts).all(|a| a == 1));

        assert!(provider.pop("q", 5).unwrap().is_empty());
        assert_eq!(provider.pending_count("q").unwrap(), 0);
    }

    #[test]
    fn pop_respects_count_and_queue() {
        let (_clock, provider) = setup();
        for n in 0..4 {
            provider.push(job(n)).unwrap();
        }
        provider
            .push(Job::typed("test", serde_json::json!({})).on_queue("other"))
            .unwrap();

        assert_eq!(provider.pop("q", 3).unwrap().len(), 3);
        assert_eq!(provider.pending_count("q").unwrap(), 1);
        assert_eq!(provider.pending_count("other").unwrap(), 1);
    }

    #[test]
    fn expired_lease_makes_job_claimable_again() {
        let (clock, provider) = setup();
        let id = provider.push(job(1)).unwrap();
        provider.pop("q", 1).unwrap();

        clock.advance(Duration::from_secs(61));

        let batch = provider.pop("q", 1).unwrap();
        assert_eq!(batch.job_ids(), &[id]);
        assert_eq!(batch.map(|j| j.attempts).next(), Some(2));
    }

    #[test]
    fn delayed_job_waits_for_its_delay() {
        let (clock, provider) = setup();
        provider.push(job(1).delayed(Duration::from_secs(30))).unwrap();

        assert_eq!(provider.pending_count("q").unwrap(), 1);
        assert!(provider.pop("q", 1).unwrap().is_empty());

        clock.advance(Duration::from_secs(30));
        assert_eq!(provider.pop("q", 1).unwrap().len(), 1);
    }

    #[test]
    fn failed_job_is_retained_and_can_be_retried() {
        let (_clock, provider) = setup();
        let id = provider.push(job(1)).unwrap();
        provider.pop("q", 1).unwrap();
        provider.mark_failed(id, "boom").unwrap();

        let failed = provider.failed_jobs("q", 10).unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].lease.failed);
        assert_eq!(failed[0].last_error.as_deref(), Some("boom"));
        assert_eq!(provider.pending_count("q").unwrap(), 0);

        provider.retry_failed(id).unwrap();
        assert_eq!(provider.pending_count("q").unwrap(), 1);
        assert!(provider.failed_jobs("q", 10).unwrap().is_empty());
    }

    #[test]
    fn timed_out_job_comes_back_after_its_lease_even_without_tries_left() {
        let (clock, provider) = setup();
        let id = provider.push(job(1)).unwrap();
        provider.pop("q", 1).unwrap();
        provider.mark_timed_out(id, "timed out").unwrap();

        assert_eq!(provider.failed_jobs("q", 10).unwrap().len(), 1);
        assert!(provider.pop("q", 1).unwrap().is_empty());

        clock.advance(Duration::from_secs(60));
        let batch = provider.pop("q", 1).unwrap();
        assert_eq!(batch.job_ids(), &[id]);
    }

    #[test]
    fn next_available_at_reports_the_earliest_waiting_job() {
        let (clock, provider) = setup();
        let start = clock.now();
        assert_eq!(provider.next_available_at("q").unwrap(), None);

        provider.push(job(1).delayed(Duration::from_secs(90))).unwrap();
        let leased = provider.push(job(2)).unwrap();
        provider.pop("q", 1).unwrap();
        assert_eq!(
            provider.next_available_at("q").unwrap(),
            Some(start + chrono::Duration::seconds(60))
        );

        provider.mark_failed(leased, "boom").unwrap();
        assert_eq!(
            provider.next_available_at("q").unwrap(),
            Some(start + chrono::Duration::seconds(90))
        );
        assert_eq!(provider.next_available_at("other").unwrap(), None);
    }

    #[test]
    fn release_and_forget_delete_records() {
        let (_clock, provider) = setup();
        let a = provider.push(job(1)).unwrap();
        let b = provider.push(job(2)).unwrap();

        provider.release(a).unwrap();
        provider.forget(b).unwrap();

        assert!(provider.is_empty());
        assert!(matches!(provider.release(a), Err(ProviderError::NotFound(_))));
    }

    #[test]
    fn in_queue_matches_same_work_only() {
        let (_clock, provider) = setup();
        provider.push(job(1)).unwrap();

        assert!(provider.in_queue(&job(1), "q").unwrap());
        assert!(!provider.in_queue(&job(2), "q").unwrap());
        assert!(!provider.in_queue(&job(1), "other").unwrap());
    }

    #[test]
    fn push_rejects_duplicate_ids_and_invalid_jobs() {
        let (_clock, provider) = setup();
        let id = provider.push(job(1)).unwrap();

        let mut dup = job(2);
        dup.id = Some(id);
        assert!(matches!(provider.push(dup), Err(ProviderError::AlreadyExists(_))));
        assert!(matches!(
            provider.push(job(3).on_queue("")),
            Err(ProviderError::InvalidJob(_))
        ));
    }

    #[test]
    fn concurrent_pops_never_share_a_job() {
        let (_clock, provider) = setup();
        let provider = Arc::new(provider);
        for n in 0..200 {
            provider.push(job(n)).unwrap();
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let provider = provider.clone();
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    loop {
                        let batch = provider.pop("q", 7).unwrap();
                        if batch.is_empty() {
                            break;
                        }
                        seen.extend(batch.job_ids().iter().copied());
                    }
                    seen
                })
            })
            .collect();

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.join().unwrap());
        }
        let unique: HashSet<_> = all.iter().collect();

        assert_eq!(all.len(), 200);
        assert_eq!(unique.len(), 200);
    }
}
