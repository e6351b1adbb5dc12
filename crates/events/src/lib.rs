//! Queue lifecycle events and the seams they travel through.

pub mod bus;
pub mod event;
pub mod in_memory_bus;
pub mod sink;

pub use bus::{EventBus, Subscription};
pub use event::QueueEvent;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use sink::{BusListener, EventListener, EventSink, ListenerRegistry, NoopSink};
