//! Registry of named providers ("drivers").
//!
//! A driver is registered either as a ready instance or as a factory. The first
//! `get_provider` for a name resolves the driver and memoizes the connection for
//! the lifetime of the manager.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;
use tracing::{debug, info};

use taskdrain_core::{Clock, SystemClock};

use crate::config::{BUILTIN_PROVIDER, QueueConfig};
use crate::provider::{InMemoryProvider, Provider, ProviderError};

#[derive(Debug, Clone, Error)]
pub enum ManagerError {
    #[error("unknown queue provider: {0}")]
    UnknownProvider(String),
    #[error("invalid queue configuration: {0}")]
    InvalidConfiguration(String),
}

/// Builds a provider from the manager's configuration and clock.
pub type ProviderFactory =
    Box<dyn Fn(&QueueConfig, &Arc<dyn Clock>) -> Result<Arc<dyn Provider>, ProviderError> + Send + Sync>;

/// What a driver name is registered as.
pub enum ProviderSource {
    Instance(Arc<dyn Provider>),
    Factory(ProviderFactory),
}

impl ProviderSource {
    pub fn instance<P>(provider: P) -> Self
    where
        P: Provider + 'static,
    {
        Self::Instance(Arc::new(provider))
    }

    pub fn factory<F>(factory: F) -> Self
    where
        F: Fn(&QueueConfig, &Arc<dyn Clock>) -> Result<Arc<dyn Provider>, ProviderError>
            + Send
            + Sync
            + 'static,
    {
        Self::Factory(Box::new(factory))
    }
}

impl From<Arc<dyn Provider>> for ProviderSource {
    fn from(provider: Arc<dyn Provider>) -> Self {
        Self::Instance(provider)
    }
}

impl fmt::Debug for ProviderSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instance(_) => f.write_str("ProviderSource::Instance"),
            Self::Factory(_) => f.write_str("ProviderSource::Factory"),
        }
    }
}

/// A resolved provider together with the driver name it was resolved under.
///
/// The name travels into emitted events so listeners can tell providers apart.
#[derive(Clone)]
pub struct ProviderHandle {
    name: Arc<str>,
    provider: Arc<dyn Provider>,
}

impl ProviderHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }
}

impl Deref for ProviderHandle {
    type Target = dyn Provider;

    fn deref(&self) -> &Self::Target {
        self.provider.as_ref()
    }
}

impl fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderHandle").field("name", &self.name).finish()
    }
}

pub struct QueueManager {
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    drivers: RwLock<HashMap<String, ProviderSource>>,
    connections: Mutex<HashMap<String, ProviderHandle>>,
}

impl fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueManager")
            .field("default_provider", &self.config.default_provider_name())
            .field("drivers", &self.driver_names())
            .finish()
    }
}

impl QueueManager {
    /// Create a manager with the built-in in-memory driver registered.
    pub fn new(config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        let mut drivers: HashMap<String, ProviderSource> = HashMap::new();
        drivers.insert(
            BUILTIN_PROVIDER.to_string(),
            ProviderSource::factory(|config, clock| {
                let provider: Arc<dyn Provider> =
                    InMemoryProvider::arc(clock.clone(), config.lease_duration());
                Ok(provider)
            }),
        );

        Self {
            config,
            clock,
            drivers: RwLock::new(drivers),
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_system_clock(config: QueueConfig) -> Self {
        Self::new(config, Arc::new(SystemClock))
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn default_provider_name(&self) -> &str {
        self.config.default_provider_name()
    }

    /// Register (or replace) a named driver.
    ///
    /// Replacing a driver drops any connection memoized under that name.
    pub fn add_provider(&self, name: &str, source: impl Into<ProviderSource>) -> Result<(), ManagerError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ManagerError::InvalidConfiguration(
                "provider name must not be empty".to_string(),
            ));
        }

        let replaced = {
            let mut drivers = self.drivers.write().map_err(|_| poisoned())?;
            drivers.insert(name.to_string(), source.into()).is_some()
        };

        if replaced {
            self.connections.lock().map_err(|_| poisoned())?.remove(name);
        }

        info!(provider = %name, replaced, "registered queue provider");
        Ok(())
    }

    /// Resolve a driver, memoizing the connection. `None` means the default.
    pub fn get_provider(&self, name: Option<&str>) -> Result<ProviderHandle, ManagerError> {
        let name = name.unwrap_or_else(|| self.default_provider_name());

        let mut connections = self.connections.lock().map_err(|_| poisoned())?;
        if let Some(handle) = connections.get(name) {
            return Ok(handle.clone());
        }

        let provider = {
            let drivers = self.drivers.read().map_err(|_| poisoned())?;
            match drivers.get(name) {
                None => return Err(ManagerError::UnknownProvider(name.to_string())),
                Some(ProviderSource::Instance(p)) => p.clone(),
                Some(ProviderSource::Factory(factory)) => factory(&self.config, &self.clock)
                    .map_err(|e| ManagerError::UnknownProvider(format!("{name}: {e}")))?,
            }
        };

        let handle = ProviderHandle {
            name: Arc::from(name),
            provider,
        };
        connections.insert(name.to_string(), handle.clone());
        debug!(provider = %name, "resolved queue provider");
        Ok(handle)
    }

    pub fn default_provider(&self) -> Result<ProviderHandle, ManagerError> {
        self.get_provider(None)
    }

    pub fn driver_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .drivers
            .read()
            .map(|d| d.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

fn poisoned() -> ManagerError {
    ManagerError::InvalidConfiguration("queue manager lock poisoned".to_string())
}
