//! Queue infrastructure: storage providers, dispatch, workers and scheduling.

pub mod config;
pub mod dispatcher;
pub mod handler;
pub mod lifecycle;
pub mod manager;
pub mod provider;
pub mod runtime;
pub mod scheduler;
pub mod trigger;
pub mod worker;


pub use config::{BatchOverrides, BatchSettings, ConfigError, QueueConfig, BUILTIN_PROVIDER};
pub use dispatcher::{DispatchError, Dispatched, Dispatcher};
pub use handler::{FnHandler, HandlerError, HandlerRegistry, JobHandler};
pub use lifecycle::RequestLifecycle;
pub use manager::{ManagerError, ProviderHandle, ProviderSource, QueueManager};
pub use provider::{Batch, BufferedProvider, InMemoryProvider, PostgresProvider, Provider, ProviderError};
pub use runtime::QueueRuntime;
pub use scheduler::{ScheduleOutcome, Scheduler, SchedulerError, STAGGER_STEP};
pub use trigger::{
    InMemoryTriggerFacility, PumpHandle, Trigger, TriggerArgs, TriggerError, TriggerFacility, TriggerPump,
};
pub use worker::{RunSummary, Worker, WorkerError};
