//! Queue configuration: batch sizing, concurrency caps and the default driver.
//!
//! Every sizing field resolves in three steps: per-queue override, then
//! per-provider override, then the global default.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Driver name used when no default provider is configured.
pub const BUILTIN_PROVIDER: &str = "memory";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
    #[error("malformed queue configuration: {0}")]
    Json(String),
}

/// Optional sizing fields; unset fields fall through to the next level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOverrides {
    #[serde(default)]
    pub batch_size: Option<i64>,
    #[serde(default)]
    pub max_concurrent_batches: Option<i64>,
    #[serde(default)]
    pub delay_secs: Option<u64>,
}

/// Global sizing defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDefaults {
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: i64,
    #[serde(default)]
    pub delay_secs: u64,
}

impl Default for BatchDefaults {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_concurrent_batches: default_max_concurrent_batches(),
            delay_secs: 0,
        }
    }
}

/// Sizing resolved for one (provider, queue) pair. Always usable as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    /// Jobs pulled per drain run (at least 1).
    pub batch_size: usize,
    /// Upper bound on outstanding drain triggers (at least 1).
    pub max_concurrent_batches: usize,
    /// Delay of the first trigger scheduled in a sizing pass.
    pub base_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub default_provider: Option<String>,
    #[serde(default)]
    pub defaults: BatchDefaults,
    #[serde(default)]
    pub providers: HashMap<String, BatchOverrides>,
    #[serde(default)]
    pub queues: HashMap<String, BatchOverrides>,
    /// How long `pop` leases a job.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

fn default_batch_size() -> i64 {
    100
}

fn default_max_concurrent_batches() -> i64 {
    1
}

fn default_lease_secs() -> u64 {
    300
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_provider: None,
            defaults: BatchDefaults::default(),
            providers: HashMap::new(),
            queues: HashMap::new(),
            lease_secs: default_lease_secs(),
        }
    }
}

impl QueueConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::Json(e.to_string()))
    }

    /// Defaults overridden by `TASKDRAIN_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `TASKDRAIN_*` key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup("TASKDRAIN_DEFAULT_PROVIDER") {
            let name = name.trim();
            if !name.is_empty() {
                config.default_provider = Some(name.to_string());
            }
        }
        if let Some(v) = parsed::<i64>(&lookup, "TASKDRAIN_BATCH_SIZE")? {
            config.defaults.batch_size = v;
        }
        if let Some(v) = parsed::<i64>(&lookup, "TASKDRAIN_MAX_CONCURRENT_BATCHES")? {
            config.defaults.max_concurrent_batches = v;
        }
        if let Some(v) = parsed::<u64>(&lookup, "TASKDRAIN_DELAY_SECS")? {
            config.defaults.delay_secs = v;
        }
        if let Some(v) = parsed::<u64>(&lookup, "TASKDRAIN_LEASE_SECS")? {
            config.lease_secs = v;
        }

        Ok(config)
    }

    pub fn default_provider_name(&self) -> &str {
        self.default_provider
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(BUILTIN_PROVIDER)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn with_queue(mut self, queue: impl Into<String>, overrides: BatchOverrides) -> Self {
        self.queues.insert(queue.into(), overrides);
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>, overrides: BatchOverrides) -> Self {
        self.providers.insert(provider.into(), overrides);
        self
    }

    /// Resolve sizing for `queue` on `provider`, clamping counts to at least 1.
    pub fn settings_for(&self, provider: &str, queue: &str) -> BatchSettings {
        let by_queue = self.queues.get(queue);
        let by_provider = self.providers.get(provider);

        let pick = |f: fn(&BatchOverrides) -> Option<i64>, global: i64| {
            by_queue
                .and_then(f)
                .or_else(|| by_provider.and_then(f))
                .unwrap_or(global)
        };

        let batch_size = pick(|o| o.batch_size, self.defaults.batch_size);
        let max_concurrent = pick(|o| o.max_concurrent_batches, self.defaults.max_concurrent_batches);
        let delay_secs = by_queue
            .and_then(|o| o.delay_secs)
            .or_else(|| by_provider.and_then(|o| o.delay_secs))
            .unwrap_or(self.defaults.delay_secs);

        BatchSettings {
            batch_size: batch_size.max(1) as usize,
            max_concurrent_batches: max_concurrent.max(1) as usize,
            base_delay: Duration::from_secs(delay_secs),
        }
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value: raw,
            }),
    }
}
