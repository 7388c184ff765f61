//! Event Bus Types
//!
//! The generic application event envelope and subscription filters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Enumerated application event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    // Discovery
    #[serde(rename = "discovery.started")]
    DiscoveryStarted,
    #[serde(rename = "discovery.progress")]
    DiscoveryProgress,
    #[serde(rename = "discovery.completed")]
    DiscoveryCompleted,
    #[serde(rename = "discovery.failed")]
    DiscoveryFailed,
    #[serde(rename = "discovery.resource")]
    ResourceDiscovered,

    // Drift detection
    #[serde(rename = "drift.started")]
    DriftDetectionStarted,
    #[serde(rename = "drift.progress")]
    DriftDetectionProgress,
    #[serde(rename = "drift.completed")]
    DriftDetectionCompleted,
    #[serde(rename = "drift.detected")]
    DriftDetected,
    #[serde(rename = "drift.resolved")]
    DriftResolved,

    // Remediation
    #[serde(rename = "remediation.started")]
    RemediationStarted,
    #[serde(rename = "remediation.progress")]
    RemediationProgress,
    #[serde(rename = "remediation.completed")]
    RemediationCompleted,
    #[serde(rename = "remediation.failed")]
    RemediationFailed,
    #[serde(rename = "remediation.deleted")]
    RemediationResourceDeleted,
    #[serde(rename = "remediation.imported")]
    RemediationResourceImported,

    // Observed infrastructure changes
    #[serde(rename = "resource.created")]
    ResourceCreated,
    #[serde(rename = "resource.updated")]
    ResourceUpdated,
    #[serde(rename = "resource.deleted")]
    ResourceDeleted,

    // State management
    #[serde(rename = "state.backup.created")]
    StateBackupCreated,
    #[serde(rename = "state.pulled")]
    StatePulled,
    #[serde(rename = "state.pushed")]
    StatePushed,
    #[serde(rename = "state.validated")]
    StateValidated,
    #[serde(rename = "state.modified")]
    StateModified,

    // System
    #[serde(rename = "cache.cleared")]
    CacheCleared,
    #[serde(rename = "cache.refreshed")]
    CacheRefreshed,
    #[serde(rename = "health.check")]
    HealthCheck,
    #[serde(rename = "config.changed")]
    ConfigChanged,
    #[serde(rename = "audit.log")]
    AuditLog,

    // Jobs
    #[serde(rename = "job.queued")]
    JobQueued,
    #[serde(rename = "job.started")]
    JobStarted,
    #[serde(rename = "job.completed")]
    JobCompleted,
    #[serde(rename = "job.failed")]
    JobFailed,
    #[serde(rename = "job.retrying")]
    JobRetrying,

    // WebSocket clients
    #[serde(rename = "ws.connected")]
    WsClientConnected,
    #[serde(rename = "ws.disconnected")]
    WsClientDisconnected,
    #[serde(rename = "ws.message")]
    WsMessage,
}

impl EventType {
    /// Wire name, e.g. `drift.detected`
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::DiscoveryStarted => "discovery.started",
            EventType::DiscoveryProgress => "discovery.progress",
            EventType::DiscoveryCompleted => "discovery.completed",
            EventType::DiscoveryFailed => "discovery.failed",
            EventType::ResourceDiscovered => "discovery.resource",
            EventType::DriftDetectionStarted => "drift.started",
            EventType::DriftDetectionProgress => "drift.progress",
            EventType::DriftDetectionCompleted => "drift.completed",
            EventType::DriftDetected => "drift.detected",
            EventType::DriftResolved => "drift.resolved",
            EventType::RemediationStarted => "remediation.started",
            EventType::RemediationProgress => "remediation.progress",
            EventType::RemediationCompleted => "remediation.completed",
            EventType::RemediationFailed => "remediation.failed",
            EventType::RemediationResourceDeleted => "remediation.deleted",
            EventType::RemediationResourceImported => "remediation.imported",
            EventType::ResourceCreated => "resource.created",
            EventType::ResourceUpdated => "resource.updated",
            EventType::ResourceDeleted => "resource.deleted",
            EventType::StateBackupCreated => "state.backup.created",
            EventType::StatePulled => "state.pulled",
            EventType::StatePushed => "state.pushed",
            EventType::StateValidated => "state.validated",
            EventType::StateModified => "state.modified",
            EventType::CacheCleared => "cache.cleared",
            EventType::CacheRefreshed => "cache.refreshed",
            EventType::HealthCheck => "health.check",
            EventType::ConfigChanged => "config.changed",
            EventType::AuditLog => "audit.log",
            EventType::JobQueued => "job.queued",
            EventType::JobStarted => "job.started",
            EventType::JobCompleted => "job.completed",
            EventType::JobFailed => "job.failed",
            EventType::JobRetrying => "job.retrying",
            EventType::WsClientConnected => "ws.connected",
            EventType::WsClientDisconnected => "ws.disconnected",
            EventType::WsMessage => "ws.message",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generic bus envelope for application notifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Assigned by `EventBus::publish` when empty
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Assigned by `EventBus::publish` when absent
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub source: String,
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Event {
    pub fn new(event_type: EventType, source: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            event_type,
            timestamp: None,
            source: source.into(),
            data: HashMap::new(),
            metadata: HashMap::new(),
            user_id: None,
            session_id: None,
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

type Predicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Subscription filter. Every criterion that is set must hold; an empty
/// filter matches every event.
#[derive(Clone, Default)]
pub struct EventFilter {
    pub types: Vec<EventType>,
    pub sources: Vec<String>,
    pub min_time: Option<DateTime<Utc>>,
    pub max_time: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, String>,
    predicate: Option<Predicate>,
}

impl EventFilter {
    /// Match every event
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_types(types: impl IntoIterator<Item = EventType>) -> Self {
        Self {
            types: types.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.sources.push(source.into());
        self
    }

    pub fn between(mut self, min: Option<DateTime<Utc>>, max: Option<DateTime<Utc>>) -> Self {
        self.min_time = min;
        self.max_time = max;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Add an arbitrary predicate on top of the structured criteria
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.types.is_empty() && !self.types.contains(&event.event_type) {
            return false;
        }

        if !self.sources.is_empty() && !self.sources.iter().any(|s| *s == event.source) {
            return false;
        }

        if self.min_time.is_some() || self.max_time.is_some() {
            let Some(timestamp) = event.timestamp else {
                return false;
            };
            if self.min_time.is_some_and(|min| timestamp < min) {
                return false;
            }
            if self.max_time.is_some_and(|max| timestamp > max) {
                return false;
            }
        }

        let metadata_ok = self
            .metadata
            .iter()
            .all(|(key, value)| event.metadata.get(key) == Some(value));
        if !metadata_ok {
            return false;
        }

        self.predicate.as_ref().map_or(true, |p| p(event))
    }
}

impl std::fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFilter")
            .field("types", &self.types)
            .field("sources", &self.sources)
            .field("min_time", &self.min_time)
            .field("max_time", &self.max_time)
            .field("metadata", &self.metadata)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

/// Event bus sizing
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Size of the replay ring buffer
    pub replay_capacity: usize,
    /// Bounded queue size of each subscription
    pub queue_capacity: usize,
    /// Upper bound on concurrently active subscriptions
    pub max_subscriptions: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            replay_capacity: 1000,
            queue_capacity: 100,
            max_subscriptions: 1024,
        }
    }
}

/// Point-in-time copy of the bus counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct BusMetrics {
    pub events_published: HashMap<EventType, u64>,
    pub events_delivered: HashMap<EventType, u64>,
    pub events_dropped: u64,
    pub subscription_count: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventBusError {
    #[error("event bus is closed")]
    Closed,

    #[error("subscription limit of {0} reached")]
    SubscriptionLimit(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Event {
        Event::new(EventType::DiscoveryStarted, "test-source")
            .with_timestamp(Utc.with_ymd_and_hms(2023, 1, 1, 12, 0, 0).unwrap())
            .with_metadata("env", "test")
    }

    fn at(hour: u32) -> Option<DateTime<Utc>> {
        Some(Utc.with_ymd_and_hms(2023, 1, 1, hour, 0, 0).unwrap())
    }

    #[test]
    fn test_filter_matching() {
        let event = sample();

        let cases = vec![
            ("no filter", EventFilter::all(), true),
            ("matching type", EventFilter::for_types([EventType::DiscoveryStarted]), true),
            ("non-matching type", EventFilter::for_types([EventType::DiscoveryCompleted]), false),
            ("matching source", EventFilter::all().source("test-source"), true),
            ("non-matching source", EventFilter::all().source("other-source"), false),
            ("inside time range", EventFilter::all().between(at(11), at(13)), true),
            ("before min time", EventFilter::all().between(at(13), None), false),
            ("after max time", EventFilter::all().between(None, at(11)), false),
            ("matching metadata", EventFilter::all().metadata("env", "test"), true),
            ("non-matching metadata", EventFilter::all().metadata("env", "prod"), false),
            (
                "all criteria matching",
                EventFilter::for_types([EventType::DiscoveryStarted])
                    .source("test-source")
                    .metadata("env", "test"),
                true,
            ),
            (
                "one criterion failing",
                EventFilter::for_types([EventType::DiscoveryStarted])
                    .source("test-source")
                    .metadata("env", "prod"),
                false,
            ),
            (
                "predicate rejects",
                EventFilter::all().with_predicate(|e| e.data.contains_key("missing")),
                false,
            ),
        ];

        for (name, filter, expected) in cases {
            assert_eq!(filter.matches(&event), expected, "case: {}", name);
        }
    }

    #[test]
    fn test_event_type_wire_names() {
        for event_type in [
            EventType::DiscoveryStarted,
            EventType::DriftDetected,
            EventType::RemediationResourceDeleted,
            EventType::StateBackupCreated,
            EventType::ResourceUpdated,
            EventType::WsMessage,
        ] {
            let json = serde_json::to_string(&event_type).unwrap();
            assert_eq!(json, format!("\"{}\"", event_type.as_str()));
        }
    }
}
