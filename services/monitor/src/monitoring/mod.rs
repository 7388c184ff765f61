//! Continuous infrastructure monitoring
//!
//! Webhook and polling ingestion feeding one event processor.

pub mod continuous;
pub mod detector;
pub mod poller;
pub mod processor;
pub mod provider;
pub mod types;

pub use continuous::ContinuousMonitor;
pub use detector::{ChangeDetector, ResourceSnapshot};
pub use poller::{AdaptivePoller, IntervalController};
pub use processor::{AuditLogSink, BusBridge, EventProcessor, EventSink, FnSink, ProcessorStats};
pub use provider::{CloudProvider, ProviderRegistry};
pub use types::{
    ChangeType, CloudEvent, MonitorConfig, MonitorError, MonitorState, Resource, ResourceChange,
};
