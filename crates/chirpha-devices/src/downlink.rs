//! Downlink routing for command entities.
//!
//! Payloads follow the templates declared in the discovery announcement, so a
//! command issued from the host and one typed by a user in the platform UI
//! reach the device in the same shape.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::info;

use chirpha_core::{BridgeEvent, SharedEventBus};

/// `{"<field>": true}`
pub fn press_payload(field: &str) -> String {
    json!({ field: true }).to_string()
}

/// `{"<field>": true|false}`
pub fn switch_payload(field: &str, on: bool) -> String {
    json!({ field: on }).to_string()
}

/// `{"<field>": "{{ value }}"}`, rendered by the platform on send.
pub fn command_template(field: &str) -> String {
    format!(r#"{{"{}": "{{{{ value }}}}"}}"#, field)
}

/// Renders [`command_template`] locally for `value`.
pub fn templated_payload(field: &str, value: &Value) -> String {
    let rendered = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    json!({ field: rendered }).to_string()
}

/// Fills `{application_id}` and `{dev_eui}` in a topic template.
pub fn render_topic(template: &str, application_id: &str, dev_eui: &str) -> String {
    template
        .replace("{application_id}", application_id)
        .replace("{dev_eui}", dev_eui)
}

/// One command on its way to a device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownlinkRequest {
    pub dev_eui: String,
    pub application_id: String,
    pub unique_id: String,
    pub topic: String,
    pub payload: String,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DownlinkError {
    #[error("Downlink transport unavailable: {0}")]
    Unavailable(String),
}

impl From<DownlinkError> for chirpha_core::Error {
    fn from(e: DownlinkError) -> Self {
        chirpha_core::Error::Transport(e.to_string())
    }
}

/// Where command requests end up.
#[async_trait]
pub trait DownlinkSink: Send + Sync {
    async fn send(&self, request: DownlinkRequest) -> Result<(), DownlinkError>;
}

/// Logs each request and mirrors it onto the event bus.
///
/// Radio transmission is left to ChirpStack integrations outside this bridge.
pub struct LoggingDownlinkSink {
    event_bus: SharedEventBus,
}

impl LoggingDownlinkSink {
    pub fn with_event_bus(event_bus: SharedEventBus) -> Self {
        Self { event_bus }
    }
}

#[async_trait]
impl DownlinkSink for LoggingDownlinkSink {
    async fn send(&self, request: DownlinkRequest) -> Result<(), DownlinkError> {
        info!(
            category = "downlink",
            dev_eui = %request.dev_eui,
            unique_id = %request.unique_id,
            topic = %request.topic,
            payload = %request.payload,
            "Downlink requested"
        );
        self.event_bus.publish_with_source(
            BridgeEvent::DownlinkRequested {
                dev_eui: request.dev_eui,
                topic: request.topic,
                payload: request.payload,
            },
            "downlink",
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chirpha_core::EventBus;
    use std::sync::Arc;

    #[test]
    fn test_payload_shapes() {
        assert_eq!(press_payload("reboot"), r#"{"reboot":true}"#);
        assert_eq!(switch_payload("valve", false), r#"{"valve":false}"#);
        assert_eq!(command_template("interval"), r#"{"interval": "{{ value }}"}"#);
        assert_eq!(templated_payload("interval", &json!(30)), r#"{"interval":"30"}"#);
        assert_eq!(templated_payload("mode", &json!("eco")), r#"{"mode":"eco"}"#);
    }

    #[test]
    fn test_render_topic() {
        let topic = render_topic(
            "application/{application_id}/device/{dev_eui}/command/down",
            "3",
            "AA01",
        );
        assert_eq!(topic, "application/3/device/AA01/command/down");
    }

    #[tokio::test]
    async fn test_logging_sink_publishes_event() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();
        let sink = LoggingDownlinkSink::with_event_bus(bus.clone());

        sink.send(DownlinkRequest {
            dev_eui: "AA01".to_string(),
            application_id: "3".to_string(),
            unique_id: "AA01_reboot".to_string(),
            topic: "application/3/device/AA01/command/down".to_string(),
            payload: press_payload("reboot"),
        })
        .await
        .unwrap();

        let (event, meta) = rx.try_recv().unwrap();
        assert_eq!(meta.source, "downlink");
        match event {
            BridgeEvent::DownlinkRequested { dev_eui, payload, .. } => {
                assert_eq!(dev_eui, "AA01");
                assert_eq!(payload, r#"{"reboot":true}"#);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
