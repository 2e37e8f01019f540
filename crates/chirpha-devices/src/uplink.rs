//! Uplink event decoding.
//!
//! ChirpStack publishes one JSON event per device transmission:
//!
//! ```json
//! {
//!   "deviceInfo": {"devEui": "AA01", "deviceName": "Tank1", "applicationId": "3", "applicationName": "Site"},
//!   "object": {
//!     "temp_c": 21.5,
//!     "discovery": {"sensors": [{"field": "temp_c", "unit": "°C"}], "commands": []},
//!     "history": [{"timestamp": 1700000000, "values": {"temp_c": 21.4}}]
//!   }
//! }
//! ```
//!
//! Decoding never retries: a message that fails here is dropped.

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::discovery::{build_discovery, DataQualityWarning, DiscoverySet};

/// Application id used when neither the event nor the topic carries one.
pub const DEFAULT_APPLICATION_ID: &str = "1";

/// Reasons an inbound message is dropped.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecodeError {
    /// The payload is not a JSON object.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Neither the event nor the topic names the device.
    #[error("Missing device identity (devEui) in event on {topic}")]
    MissingDeviceIdentity { topic: String },

    /// `object` is a scalar, usually an encoded payload the codec failed on.
    #[error("Undecoded payload for device {dev_eui}: object is {found}")]
    UndecodedPayload { dev_eui: String, found: String },
}

impl From<DecodeError> for chirpha_core::Error {
    fn from(e: DecodeError) -> Self {
        chirpha_core::Error::Decode(e.to_string())
    }
}

/// One historical reading embedded in a later uplink.
#[derive(Debug, Clone, PartialEq)]
pub struct HistorySample {
    /// Unix seconds, possibly fractional.
    pub timestamp: f64,
    pub values: Map<String, Value>,
}

impl HistorySample {
    /// Timestamp truncated to whole seconds.
    pub fn timestamp_secs(&self) -> i64 {
        self.timestamp.floor() as i64
    }
}

/// A decoded uplink. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct UplinkEvent {
    pub dev_eui: String,
    pub device_name: Option<String>,
    pub application_id: String,
    pub application_name: Option<String>,
    /// Topic the event arrived on; announced as the sensors' state topic.
    pub topic: String,
    /// The decoded `object` map.
    pub payload: Map<String, Value>,
    pub discovery: DiscoverySet,
    pub history: Vec<HistorySample>,
    /// Problems found while reading descriptors and history.
    pub warnings: Vec<DataQualityWarning>,
}

impl UplinkEvent {
    /// Device name shown to users.
    ///
    /// `<application>-<device>` when both are known, else the device name,
    /// else the EUI.
    pub fn display_name(&self) -> String {
        compose_display_name(
            &self.dev_eui,
            self.device_name.as_deref(),
            self.application_name.as_deref(),
        )
    }

    /// Live value of a payload field, ignoring nulls.
    pub fn value(&self, field: &str) -> Option<&Value> {
        self.payload.get(field).filter(|v| !v.is_null())
    }
}

/// See [`UplinkEvent::display_name`].
pub fn compose_display_name(
    dev_eui: &str,
    device_name: Option<&str>,
    application_name: Option<&str>,
) -> String {
    let device_name = device_name.filter(|s| !s.is_empty());
    let application_name = application_name.filter(|s| !s.is_empty());
    match (application_name, device_name) {
        (Some(app), Some(device)) => format!("{}-{}", app, device),
        (None, Some(device)) => device.to_string(),
        _ => dev_eui.to_string(),
    }
}

/// Topic segment following `key`, e.g. the `<id>` of `application/<id>/...`.
fn topic_segment<'a>(topic: &'a str, key: &str) -> Option<&'a str> {
    let mut parts = topic.split('/');
    while let Some(part) = parts.next() {
        if part == key {
            return parts.next().filter(|s| !s.is_empty() && *s != "+" && *s != "#");
        }
    }
    None
}

fn string_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    match object.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn parse_timestamp(value: &Value) -> Option<f64> {
    let ts = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok().or_else(|| {
            chrono::DateTime::parse_from_rfc3339(s.trim())
                .ok()
                .map(|dt| dt.timestamp() as f64)
        })?,
        _ => return None,
    };
    ts.is_finite().then_some(ts)
}

/// Read `object.history`. Samples without a usable timestamp are skipped.
fn parse_history(raw: Option<&Value>, dev_eui: &str) -> Vec<HistorySample> {
    let items = match raw {
        Some(Value::Array(items)) => items,
        None | Some(Value::Null) => return Vec::new(),
        Some(other) => {
            warn!(dev_eui, found = describe(other), "History is not an array, ignoring");
            return Vec::new();
        }
    };

    let mut samples = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let Some(entry) = item.as_object() else {
            warn!(dev_eui, index, "History sample is not an object, skipping");
            continue;
        };
        let Some(timestamp) = entry.get("timestamp").and_then(parse_timestamp) else {
            warn!(dev_eui, index, "History sample has no usable timestamp, skipping");
            continue;
        };
        let values = match entry.get("values") {
            Some(Value::Object(values)) => values.clone(),
            _ => entry
                .iter()
                .filter(|(k, _)| k.as_str() != "timestamp" && k.as_str() != "values")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        samples.push(HistorySample { timestamp, values });
    }
    samples
}

/// Decode one transport message.
pub fn decode(topic: &str, payload: &[u8]) -> Result<UplinkEvent, DecodeError> {
    let root: Value = serde_json::from_slice(payload)
        .map_err(|e| DecodeError::MalformedPayload(format!("invalid JSON: {}", e)))?;
    let root = match root {
        Value::Object(map) => map,
        other => {
            return Err(DecodeError::MalformedPayload(format!(
                "expected a JSON object, found {}",
                describe(&other)
            )))
        }
    };

    let empty = Map::new();
    let device_info = root
        .get("deviceInfo")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    let dev_eui = string_field(device_info, "devEui")
        .or_else(|| topic_segment(topic, "device").map(str::to_string))
        .ok_or_else(|| DecodeError::MissingDeviceIdentity {
            topic: topic.to_string(),
        })?;

    let application_id = string_field(device_info, "applicationId")
        .or_else(|| topic_segment(topic, "application").map(str::to_string))
        .unwrap_or_else(|| DEFAULT_APPLICATION_ID.to_string());

    let mut object = match root.get("object") {
        Some(Value::Object(object)) => object.clone(),
        None | Some(Value::Null) => Map::new(),
        Some(other) => {
            return Err(DecodeError::UndecodedPayload {
                dev_eui,
                found: describe(other).to_string(),
            })
        }
    };

    let discovery = object.remove("discovery");
    let model = match &discovery {
        Some(section @ Value::Object(_)) => build_discovery(section),
        None | Some(Value::Null) => Default::default(),
        Some(other) => {
            warn!(
                dev_eui = %dev_eui,
                found = describe(other),
                "Discovery section is not an object, ignoring"
            );
            Default::default()
        }
    };
    let history = parse_history(object.remove("history").as_ref(), &dev_eui);

    Ok(UplinkEvent {
        device_name: string_field(device_info, "deviceName"),
        application_name: string_field(device_info, "applicationName"),
        dev_eui,
        application_id,
        topic: topic.to_string(),
        payload: object,
        discovery: model.set,
        history,
        warnings: model.warnings,
    })
}
