//! Event and per-event context types flowing through a function chain

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// An analytics event. Free-form JSON; only `type`, `properties` and
/// `context` are ever looked at by the pipeline itself.
pub type AnyEvent = Value;

/// Geolocation attached to `context.geo`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Geo {
    /// Country information
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<GeoCountry>,
    /// Subdivision (state, region)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<GeoNamed>,
    /// City
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<GeoNamed>,
    /// Coordinates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoLocation>,
    /// Postal code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<GeoNamed>,
}

/// Country part of [`Geo`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoCountry {
    /// ISO code
    pub code: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Member of the EU
    #[serde(default)]
    pub is_eu: bool,
}

/// Any named geo entity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoNamed {
    /// Optional code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Display name
    pub name: String,
}

/// Coordinates part of [`Geo`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoLocation {
    /// Latitude
    pub latitude: f64,
    /// Longitude
    pub longitude: f64,
    /// Accuracy radius in km
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_radius: Option<u32>,
}

/// Identifiers used when reporting metrics for one execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsMeta {
    /// Workspace id
    pub workspace_id: String,
    /// Source stream id
    pub stream_id: String,
    /// Destination id
    pub destination_id: String,
    /// Connection id
    pub connection_id: String,
    /// Number of previous attempts
    pub retries: u32,
}

/// Context shared by every function invocation of one message
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventContext {
    /// Message id from the ingest envelope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Original HTTP headers of the ingest request (lower-cased names)
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Resolved geolocation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<Geo>,
    /// Number of previous attempts
    #[serde(default)]
    pub retries: u32,
    /// Source stream
    #[serde(default)]
    pub source_id: String,
    /// Source display name
    #[serde(default)]
    pub source_name: String,
    /// Destination id
    #[serde(default)]
    pub destination_id: String,
    /// Destination type
    #[serde(default)]
    pub destination_type: String,
    /// Connection id
    #[serde(default)]
    pub connection_id: String,
    /// Workspace id
    #[serde(default)]
    pub workspace_id: String,
    /// Function to resume from after a failed attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_function_id: Option<String>,
}

impl EventContext {
    /// Metrics identifiers for this context
    pub fn metrics_meta(&self, stream_id: &str) -> MetricsMeta {
        MetricsMeta {
            workspace_id: self.workspace_id.clone(),
            stream_id: stream_id.to_string(),
            destination_id: self.destination_id.clone(),
            connection_id: self.connection_id.clone(),
            retries: self.retries,
        }
    }
}

/// Privileged context only handed to functions with `enable_system_context`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemContext {
    /// Bulker or destination credentials the function may use
    #[serde(default)]
    pub destination_credentials: Value,
    /// Arbitrary extra entries
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

/// Ingest envelope produced by the event collector
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestMessage {
    /// Target connection
    #[serde(default)]
    pub connection_id: Option<String>,
    /// Unique message id
    #[serde(default)]
    pub message_id: Option<String>,
    /// When the collector received the message
    #[serde(default)]
    pub message_created: Option<DateTime<Utc>>,
    /// Headers of the original HTTP request
    #[serde(default)]
    pub http_headers: HashMap<String, String>,
    /// The event itself
    pub http_payload: AnyEvent,
    /// Geo resolved upstream, if any
    #[serde(default)]
    pub geo: Option<Geo>,
}

impl IngestMessage {
    /// Parse a message body. Bodies that are not an ingest envelope are
    /// treated as a bare event.
    pub fn parse(body: &[u8]) -> serde_json::Result<Self> {
        let value: Value = serde_json::from_slice(body)?;
        let is_envelope = value
            .as_object()
            .map(|o| o.contains_key("httpPayload"))
            .unwrap_or(false);
        if is_envelope {
            serde_json::from_value(value)
        } else {
            Ok(IngestMessage {
                connection_id: None,
                message_id: value
                    .get("messageId")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                message_created: None,
                http_headers: HashMap::new(),
                http_payload: value,
                geo: None,
            })
        }
    }
}

/// Mutable access to `event.context`, creating it when missing.
/// Returns `None` when the event itself is not an object.
pub fn context_mut(event: &mut AnyEvent) -> Option<&mut Map<String, Value>> {
    let obj = event.as_object_mut()?;
    let ctx = obj
        .entry("context")
        .or_insert_with(|| Value::Object(Map::new()));
    if !ctx.is_object() {
        *ctx = Value::Object(Map::new());
    }
    ctx.as_object_mut()
}

/// Read `event.context.<key>`
pub fn context_get<'a>(event: &'a AnyEvent, key: &str) -> Option<&'a Value> {
    event.get("context").and_then(|c| c.get(key))
}

/// Swap the event inside a message body, keeping the envelope if there is one
pub fn replace_payload(body: &[u8], event: &AnyEvent) -> serde_json::Result<Vec<u8>> {
    let mut value: Value = serde_json::from_slice(body)?;
    match value.as_object_mut() {
        Some(obj) if obj.contains_key("httpPayload") => {
            obj.insert("httpPayload".into(), event.clone());
            serde_json::to_vec(&value)
        }
        _ => serde_json::to_vec(event),
    }
}
