//! Infra Monitor Library
//!
//! Continuous multi-cloud change monitoring: provider webhooks and adaptive
//! polling normalized into one change-event stream, re-published on an
//! in-process event bus.

pub mod events;
pub mod monitoring;
pub mod webhook;

mod shutdown;

pub use events::{Event, EventBus, EventBusConfig, EventFilter, EventHandler, EventType};
pub use monitoring::{
    ChangeType, CloudEvent, CloudProvider, ContinuousMonitor, MonitorConfig, MonitorError,
    Resource,
};
pub use webhook::EventForwarder;
