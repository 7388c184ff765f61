//! Provider notification envelopes and their conversion to [`CloudEvent`]

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

use super::classify::{classify, ACTION_RULES, AZURE_RULES};
use crate::monitoring::{ChangeType, CloudEvent};

const AZURE_VALIDATION_EVENT: &str = "Microsoft.EventGrid.SubscriptionValidationEvent";

/// Rejected webhook body; always answered with 400
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid base64 message data: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("decoded message data is not a JSON object")]
    NotAnObject,

    #[error("missing required field `{0}`")]
    MissingField(&'static str),
}

impl IntoResponse for PayloadError {
    fn into_response(self) -> Response {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}

/// AWS EventBridge event
#[derive(Debug, Deserialize)]
pub struct EventBridgeEvent {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub id: String,
    #[serde(rename = "detail-type", default)]
    pub detail_type: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub detail: Option<HashMap<String, Value>>,
}

/// One element of an Azure Event Grid delivery
#[derive(Debug, Deserialize)]
pub struct EventGridEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub subject: String,
    #[serde(rename = "eventType", default)]
    pub event_type: String,
    #[serde(rename = "eventTime", default)]
    pub event_time: Option<String>,
    /// Any JSON; objects are spread into the event details
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(rename = "dataVersion", default)]
    pub data_version: String,
}

/// GCP Pub/Sub push envelope
#[derive(Debug, Deserialize)]
pub struct PushEnvelope {
    pub message: PubSubMessage,
    #[serde(default)]
    pub subscription: String,
}

#[derive(Debug, Deserialize)]
pub struct PubSubMessage {
    /// Base64 encoded JSON object
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(rename = "messageId", default)]
    pub message_id: String,
    #[serde(rename = "publishTime", default)]
    pub publish_time: Option<String>,
}

/// Result of an Azure delivery: either the subscription handshake or events
#[derive(Debug)]
pub enum AzureDelivery {
    Validation(String),
    Events(Vec<CloudEvent>),
}

/// Provider timestamp when present and RFC 3339, otherwise now
fn parse_time(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

fn id_or_new(id: String) -> String {
    if id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        id
    }
}

fn non_empty_or(value: String, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

pub fn parse_aws(body: &[u8]) -> Result<CloudEvent, PayloadError> {
    let event: EventBridgeEvent = serde_json::from_slice(body)?;
    Ok(event.into())
}

impl From<EventBridgeEvent> for CloudEvent {
    fn from(event: EventBridgeEvent) -> Self {
        let details = event.detail.unwrap_or_default();

        let action = details
            .get("eventName")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let principal = details
            .get("userIdentity")
            .and_then(|identity| identity.get("arn"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let change_type = if action.is_empty() {
            ChangeType::Drift
        } else {
            classify(ACTION_RULES, &action)
        };

        CloudEvent {
            id: id_or_new(event.id),
            source: "aws".to_string(),
            event_type: non_empty_or(event.detail_type, "aws.eventbridge"),
            time: parse_time(event.time.as_deref()),
            region: event.region,
            account: event.account,
            resource: event.resources.into_iter().next().unwrap_or_default(),
            action,
            principal,
            details,
            change_type,
        }
    }
}

pub fn parse_azure(body: &[u8]) -> Result<AzureDelivery, PayloadError> {
    let events: Vec<EventGridEvent> = serde_json::from_slice(body)?;

    if let [only] = events.as_slice() {
        if only.event_type == AZURE_VALIDATION_EVENT {
            let code = only
                .data
                .as_ref()
                .and_then(|data| data.get("validationCode"))
                .and_then(Value::as_str)
                .ok_or(PayloadError::MissingField("data.validationCode"))?;
            return Ok(AzureDelivery::Validation(code.to_string()));
        }
    }

    Ok(AzureDelivery::Events(
        events.into_iter().map(CloudEvent::from).collect(),
    ))
}

impl From<EventGridEvent> for CloudEvent {
    fn from(event: EventGridEvent) -> Self {
        let change_type = classify(AZURE_RULES, &event.event_type);
        let details = match event.data {
            Some(Value::Object(map)) => map.into_iter().collect(),
            None | Some(Value::Null) => HashMap::new(),
            Some(other) => HashMap::from([("data".to_string(), other)]),
        };

        CloudEvent {
            id: id_or_new(event.id),
            source: "azure".to_string(),
            time: parse_time(event.event_time.as_deref()),
            resource: event.subject,
            action: event.event_type.clone(),
            event_type: non_empty_or(event.event_type, "azure.eventgrid"),
            details,
            change_type,
            region: String::new(),
            account: String::new(),
            principal: String::new(),
        }
    }
}

pub fn parse_gcp(body: &[u8]) -> Result<CloudEvent, PayloadError> {
    let envelope: PushEnvelope = serde_json::from_slice(body)?;
    let message = envelope.message;

    let details = if message.data.is_empty() {
        HashMap::new()
    } else {
        let decoded = STANDARD.decode(message.data.as_bytes())?;
        match serde_json::from_slice::<Value>(&decoded)? {
            Value::Object(map) => map.into_iter().collect(),
            _ => return Err(PayloadError::NotAnObject),
        }
    };

    let event_type = message
        .attributes
        .get("eventType")
        .cloned()
        .unwrap_or_default();
    let change_type = classify(ACTION_RULES, &event_type);

    Ok(CloudEvent {
        id: id_or_new(message.message_id),
        source: "gcp".to_string(),
        time: parse_time(message.publish_time.as_deref()),
        action: event_type.clone(),
        event_type: non_empty_or(event_type, "gcp.pubsub"),
        details,
        change_type,
        region: String::new(),
        account: String::new(),
        resource: String::new(),
        principal: String::new(),
    })
}

/// Canonical CloudEvent posted as-is; only the id is filled in when missing
pub fn parse_generic(body: &[u8]) -> Result<CloudEvent, PayloadError> {
    let mut event: CloudEvent = serde_json::from_slice(body)?;

    if event.source.is_empty() {
        return Err(PayloadError::MissingField("source"));
    }
    if event.event_type.is_empty() {
        return Err(PayloadError::MissingField("type"));
    }
    event.id = id_or_new(event.id);

    Ok(event)
}
