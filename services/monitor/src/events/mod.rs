//! Generic event bus for discovery, drift, remediation and resource events

pub mod bus;
pub mod types;

pub use bus::{handler_fn, EventBus, EventHandler, FnHandler, Subscription};
pub use types::{BusMetrics, Event, EventBusConfig, EventBusError, EventFilter, EventType};
