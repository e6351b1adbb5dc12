//! Background thread that fires due triggers from an in-memory facility.

use std::io;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info};

use taskdrain_core::Clock;

use super::{InMemoryTriggerFacility, Trigger};

/// Receives triggers as they fire.
pub trait TriggerTarget: Send + Sync {
    fn fire(&self, trigger: &Trigger);
}

#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// How often to look for due triggers
    pub poll_interval: Duration,
    /// Thread name, also used in logs
    pub name: String,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            name: "taskdrain-trigger-pump".to_string(),
        }
    }
}

impl PumpConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PumpStats {
    pub ticks: u64,
    pub triggers_fired: u64,
    pub uptime_secs: u64,
}

/// Handle to control a running pump.
#[derive(Debug)]
pub struct PumpHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<PumpStats>>,
}

impl PumpHandle {
    /// Request graceful shutdown and wait for the current tick to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> PumpStats {
        self.stats.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

pub struct TriggerPump;

impl TriggerPump {
    /// Spawn the pump on its own thread.
    pub fn spawn(
        facility: Arc<InMemoryTriggerFacility>,
        target: Arc<dyn TriggerTarget>,
        clock: Arc<dyn Clock>,
        config: PumpConfig,
    ) -> io::Result<PumpHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(PumpStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || pump_loop(&facility, target.as_ref(), clock.as_ref(), config, shutdown_rx, stats_clone))?;

        Ok(PumpHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

/// Fire every trigger due at `now`, earliest first. Returns how many fired.
pub fn drain_due(facility: &InMemoryTriggerFacility, target: &dyn TriggerTarget, now: DateTime<Utc>) -> usize {
    let due = match facility.take_due(now) {
        Ok(due) => due,
        Err(e) => {
            error!(error = %e, "failed to take due triggers");
            return 0;
        }
    };

    for trigger in &due {
        debug!(trigger_id = %trigger.id, queue = %trigger.args.queue, "firing trigger");
        target.fire(trigger);
    }
    due.len()
}

fn pump_loop(
    facility: &InMemoryTriggerFacility,
    target: &dyn TriggerTarget,
    clock: &dyn Clock,
    config: PumpConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<PumpStats>>,
) {
    info!(pump = %config.name, "trigger pump started");
    let start_time = Instant::now();

    loop {
        let fired = drain_due(facility, target, clock.now());

        {
            let mut s = stats.lock().unwrap_or_else(|p| p.into_inner());
            s.ticks += 1;
            s.triggers_fired += fired as u64;
            s.uptime_secs = start_time.elapsed().as_secs();
        }

        match shutdown_rx.recv_timeout(config.poll_interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(pump = %config.name, "trigger pump stopped");
}

#[cfg(test)]
mod tests {
    use taskdrain_core::{ManualClock, TriggerId};

    use super::*;
    use crate::trigger::{TriggerArgs, TriggerFacility};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<TriggerId>>);

    impl TriggerTarget for Recorder {
        fn fire(&self, trigger: &Trigger) {
            self.0.lock().unwrap().push(trigger.id);
        }
    }

    fn register(facility: &InMemoryTriggerFacility, at: DateTime<Utc>) -> TriggerId {
        facility
            .register(
                at,
                TriggerArgs {
                    queue: "q".into(),
                    scheduled_time: at,
                },
            )
            .unwrap()
    }

    #[test]
    fn drain_due_fires_in_fire_time_order() {
        let facility = InMemoryTriggerFacility::new();
        let now = Utc::now();
        let second = register(&facility, now + chrono::Duration::seconds(5));
        let first = register(&facility, now);
        let recorder = Recorder::default();

        assert_eq!(drain_due(&facility, &recorder, now + chrono::Duration::seconds(5)), 2);
        assert_eq!(*recorder.0.lock().unwrap(), vec![first, second]);
        assert!(facility.is_empty());
    }

    #[test]
    fn pump_fires_due_triggers_until_shutdown() {
        let facility = Arc::new(InMemoryTriggerFacility::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let recorder = Arc::new(Recorder::default());
        let id = register(&facility, clock.now());

        let handle = TriggerPump::spawn(
            facility.clone(),
            recorder.clone(),
            clock,
            PumpConfig::default().with_poll_interval(Duration::from_millis(5)),
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().triggers_fired == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        assert!(handle.stats().ticks >= 1);
        handle.shutdown();
        assert_eq!(*recorder.0.lock().unwrap(), vec![id]);
    }
}
