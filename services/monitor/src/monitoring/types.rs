//! Continuous Monitoring Types
//!
//! Canonical change records, discovered resources and monitor configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Classification of a detected infrastructure change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
    /// Catch-all for provider actions that cannot be classified
    #[default]
    Drift,
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeType::Create => write!(f, "create"),
            ChangeType::Update => write!(f, "update"),
            ChangeType::Delete => write!(f, "delete"),
            ChangeType::Drift => write!(f, "drift"),
        }
    }
}

/// Canonical representation of one infrastructure change, independent of
/// whether it arrived through a webhook push or a poll cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent {
    #[serde(default)]
    pub id: String,
    /// Provider name (aws, azure, gcp, or a registered poller name)
    pub source: String,
    /// Provider event type string
    #[serde(rename = "type")]
    pub event_type: String,
    /// Provider timestamp when known, otherwise ingestion time
    #[serde(default = "Utc::now")]
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub account: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub principal: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub change_type: ChangeType,
}

impl CloudEvent {
    /// Create an event stamped with the current time and a fresh id
    pub fn new(source: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source: source.into(),
            event_type: event_type.into(),
            time: Utc::now(),
            region: String::new(),
            account: String::new(),
            resource: String::new(),
            action: String::new(),
            principal: String::new(),
            details: HashMap::new(),
            change_type: ChangeType::Drift,
        }
    }

    pub fn with_change_type(mut self, change_type: ChangeType) -> Self {
        self.change_type = change_type;
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

/// A resource as reported by a provider's discovery call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Resource {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub resource_type: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl Resource {
    pub fn new(id: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            ..Default::default()
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }
}

/// One difference between two consecutive snapshots of a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceChange {
    pub resource_id: String,
    pub change_type: ChangeType,
    /// New representation for creates/updates, last known one for deletes
    pub resource: Resource,
    pub details: HashMap<String, serde_json::Value>,
}

/// Configuration for the continuous monitor
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub webhook_host: IpAddr,
    /// Port for the webhook listener (0 picks an ephemeral port)
    pub webhook_port: u16,
    pub polling_interval: Duration,
    pub adaptive_polling: bool,
    pub min_poll_interval: Duration,
    pub max_poll_interval: Duration,
    /// Capacity of the event processor intake queue
    pub event_buffer_size: usize,
    pub enable_webhooks: bool,
    pub enable_polling: bool,
    /// How long without changes before the poll interval starts growing
    pub quiet_period: Duration,
    /// Grace period for draining queued events on stop
    pub shutdown_grace: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            webhook_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            webhook_port: 8090,
            polling_interval: Duration::from_secs(5 * 60),
            adaptive_polling: true,
            min_poll_interval: Duration::from_secs(60),
            max_poll_interval: Duration::from_secs(30 * 60),
            event_buffer_size: 1000,
            enable_webhooks: true,
            enable_polling: true,
            quiet_period: Duration::from_secs(30 * 60),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), MonitorError> {
        if self.min_poll_interval.is_zero() || self.polling_interval.is_zero() {
            return Err(MonitorError::InvalidConfig(
                "poll intervals must be greater than zero".to_string(),
            ));
        }
        if self.min_poll_interval > self.max_poll_interval {
            return Err(MonitorError::InvalidConfig(format!(
                "min_poll_interval ({:?}) exceeds max_poll_interval ({:?})",
                self.min_poll_interval, self.max_poll_interval
            )));
        }
        if self.event_buffer_size == 0 {
            return Err(MonitorError::InvalidConfig(
                "event_buffer_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle state of the continuous monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    Created,
    Running,
    Stopped,
}

/// Errors returned by monitor lifecycle operations
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("monitor is already running")]
    AlreadyRunning,

    /// A stopped monitor cannot be restarted
    #[error("monitor has been stopped; create a new instance to restart")]
    Stopped,

    #[error("invalid monitor configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to bind webhook listener on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_type_serialization() {
        let json = serde_json::to_string(&ChangeType::Delete).unwrap();
        assert_eq!(json, "\"delete\"");
        assert_eq!(ChangeType::default(), ChangeType::Drift);
    }

    #[test]
    fn test_cloud_event_defaults_on_deserialize() {
        let before = Utc::now();
        let event: CloudEvent =
            serde_json::from_str(r#"{"source":"aws","type":"EC2 Instance State-change"}"#)
                .unwrap();

        assert!(event.time >= before);
        assert_eq!(event.change_type, ChangeType::Drift);
        assert!(event.details.is_empty());
        assert!(event.id.is_empty());
    }

    #[test]
    fn test_cloud_event_omits_empty_fields() {
        let event = CloudEvent::new("gcp", "x");
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "x");
        assert!(json.get("region").is_none());
        assert!(json.get("details").is_none());
        assert_eq!(json["change_type"], "drift");
    }

    #[test]
    fn test_config_validation() {
        assert!(MonitorConfig::default().validate().is_ok());

        let inverted = MonitorConfig {
            min_poll_interval: Duration::from_secs(600),
            max_poll_interval: Duration::from_secs(60),
            ..Default::default()
        };
        assert!(matches!(
            inverted.validate(),
            Err(MonitorError::InvalidConfig(_))
        ));

        let no_buffer = MonitorConfig {
            event_buffer_size: 0,
            ..Default::default()
        };
        assert!(no_buffer.validate().is_err());
    }
}
