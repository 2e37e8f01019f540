//! Discovery cache and publisher.
//!
//! Keeps the fingerprint of the last discovery set announced per device and
//! publishes a fresh set of retained announcements only when it changes. The
//! cache lives for the process; a restart re-announces every device once.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use chirpha_core::{BridgeEvent, SharedEventBus};

use crate::discovery::DiscoverySet;
use crate::downlink::render_topic;
use crate::hass_discovery::{render_command, render_sensor, DeviceContext, DiscoveryAnnouncement};
use crate::uplink::UplinkEvent;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PublishError {
    #[error("Discovery transport error: {0}")]
    Transport(String),

    #[error("Failed to serialize discovery payload: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for PublishError {
    fn from(e: serde_json::Error) -> Self {
        PublishError::Serialization(e.to_string())
    }
}

impl From<PublishError> for chirpha_core::Error {
    fn from(e: PublishError) -> Self {
        match e {
            PublishError::Transport(s) => chirpha_core::Error::Transport(s),
            PublishError::Serialization(s) => chirpha_core::Error::Serialization(s),
        }
    }
}

/// Outbound side of discovery: retained publication of one payload.
#[async_trait]
pub trait DiscoveryTransport: Send + Sync {
    async fn publish_retained(&self, topic: &str, payload: &str) -> Result<(), PublishError>;
}

/// Transport that keeps every publication in memory.
///
/// Used by the offline `decode` command and by tests.
#[derive(Default)]
pub struct RecordingTransport {
    published: Mutex<Vec<(String, String)>>,
    fail: Mutex<Option<String>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following publication fail with `reason`, or succeed again with `None`.
    pub fn set_failure(&self, reason: Option<&str>) {
        *self.fail.lock() = reason.map(str::to_string);
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().clone()
    }

    pub fn clear(&self) {
        self.published.lock().clear();
    }
}

#[async_trait]
impl DiscoveryTransport for RecordingTransport {
    async fn publish_retained(&self, topic: &str, payload: &str) -> Result<(), PublishError> {
        if let Some(reason) = self.fail.lock().clone() {
            return Err(PublishError::Transport(reason));
        }
        self.published
            .lock()
            .push((topic.to_string(), payload.to_string()));
        Ok(())
    }
}

/// Deterministic summary of a device's discovery set.
///
/// Descriptors serialize with a fixed field order, so equal sets in equal
/// order always produce equal fingerprints. Reordering descriptors counts as
/// a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryFingerprint {
    pub dev_eui: String,
    pub sensors: String,
    pub commands: String,
}

impl DiscoveryFingerprint {
    pub fn compute(dev_eui: &str, set: &DiscoverySet) -> Result<Self, PublishError> {
        Ok(Self {
            dev_eui: dev_eui.to_string(),
            sensors: serde_json::to_string(&set.sensors)?,
            commands: serde_json::to_string(&set.commands)?,
        })
    }
}

/// Result of one [`DiscoveryPublisher::maybe_publish`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The device advertises no sensors.
    Skipped,
    /// Same fingerprint as the last successful pass.
    Unchanged,
    /// A new pass went out with this many announcements.
    Published { announced: usize },
}

pub struct DiscoveryPublisher {
    prefix: String,
    downlink_template: String,
    cache: DashMap<String, DiscoveryFingerprint>,
    transport: Arc<dyn DiscoveryTransport>,
    event_bus: Option<SharedEventBus>,
}

impl DiscoveryPublisher {
    pub fn new(
        prefix: impl Into<String>,
        downlink_template: impl Into<String>,
        transport: Arc<dyn DiscoveryTransport>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            downlink_template: downlink_template.into(),
            cache: DashMap::new(),
            transport,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: SharedEventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Number of devices with a cached fingerprint.
    pub fn cached_devices(&self) -> usize {
        self.cache.len()
    }

    pub fn cached_fingerprint(&self, dev_eui: &str) -> Option<DiscoveryFingerprint> {
        self.cache.get(dev_eui).map(|entry| entry.value().clone())
    }

    /// Renders every announcement for an event without publishing.
    pub fn render(&self, event: &UplinkEvent) -> Vec<DiscoveryAnnouncement> {
        let display_name = event.display_name();
        let command_topic =
            render_topic(&self.downlink_template, &event.application_id, &event.dev_eui);
        let ctx = DeviceContext {
            prefix: &self.prefix,
            dev_eui: &event.dev_eui,
            display_name: &display_name,
            state_topic: &event.topic,
            command_topic: &command_topic,
        };

        let sensors = event.discovery.sensors.iter().map(|s| render_sensor(&ctx, s));
        let commands = event.discovery.commands.iter().map(|c| render_command(&ctx, c));
        sensors.chain(commands).collect()
    }

    /// Publishes the event's discovery set if it differs from the cached one.
    ///
    /// The cache is updated only after every announcement went out; a failed
    /// pass is repeated in full on the device's next uplink.
    pub async fn maybe_publish(&self, event: &UplinkEvent) -> Result<PublishOutcome, PublishError> {
        if event.discovery.sensors.is_empty() {
            return Ok(PublishOutcome::Skipped);
        }

        let fingerprint = DiscoveryFingerprint::compute(&event.dev_eui, &event.discovery)?;
        if self
            .cache
            .get(&event.dev_eui)
            .is_some_and(|cached| *cached.value() == fingerprint)
        {
            debug!(dev_eui = %event.dev_eui, "Discovery unchanged");
            return Ok(PublishOutcome::Unchanged);
        }

        let announcements = self.render(event);
        for announcement in &announcements {
            let payload = announcement.payload()?;
            self.transport
                .publish_retained(&announcement.topic, &payload)
                .await?;
            info!(
                category = "discovery",
                dev_eui = %event.dev_eui,
                unique_id = %announcement.unique_id,
                topic = %announcement.topic,
                "Published discovery config"
            );
        }

        self.cache.insert(event.dev_eui.clone(), fingerprint);

        let announced = announcements.len();
        if let Some(bus) = &self.event_bus {
            bus.publish_with_source(
                BridgeEvent::DiscoveryPublished {
                    dev_eui: event.dev_eui.clone(),
                    announced,
                },
                "discovery",
            );
        }
        Ok(PublishOutcome::Published { announced })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uplink::decode;
    use serde_json::json;

    const TOPIC: &str = "application/3/device/AA01/event/up";

    fn event(object: serde_json::Value) -> UplinkEvent {
        let body = json!({
            "deviceInfo": {"devEui": "AA01", "deviceName": "Tank1", "applicationName": "Site"},
            "object": object
        });
        decode(TOPIC, body.to_string().as_bytes()).unwrap()
    }

    fn publisher(transport: Arc<RecordingTransport>) -> DiscoveryPublisher {
        DiscoveryPublisher::new(
            "homeassistant",
            "application/{application_id}/device/{dev_eui}/command/down",
            transport,
        )
    }

    #[tokio::test]
    async fn test_same_set_published_once() {
        let transport = Arc::new(RecordingTransport::new());
        let publisher = publisher(transport.clone());
        let ev = event(json!({"discovery": {"sensors": [{"field": "temp_c", "unit": "°C"}]}}));

        assert_eq!(
            publisher.maybe_publish(&ev).await.unwrap(),
            PublishOutcome::Published { announced: 1 }
        );
        assert_eq!(publisher.maybe_publish(&ev).await.unwrap(), PublishOutcome::Unchanged);
        assert_eq!(transport.published().len(), 1);
        assert_eq!(transport.published()[0].0, "homeassistant/sensor/AA01_temp_c/config");
    }

    #[tokio::test]
    async fn test_no_sensors_never_published() {
        let transport = Arc::new(RecordingTransport::new());
        let publisher = publisher(transport.clone());
        let ev = event(json!({"discovery": {"commands": [{"field": "reboot", "type": "button"}]}}));

        assert_eq!(publisher.maybe_publish(&ev).await.unwrap(), PublishOutcome::Skipped);
        assert!(transport.published().is_empty());
        assert_eq!(publisher.cached_devices(), 0);
    }

    #[tokio::test]
    async fn test_failed_pass_is_retried() {
        let transport = Arc::new(RecordingTransport::new());
        let publisher = publisher(transport.clone());
        let ev = event(json!({"discovery": {
            "sensors": [{"field": "temp_c"}],
            "commands": [{"field": "reboot", "type": "button"}]
        }}));

        transport.set_failure(Some("broker gone"));
        assert!(matches!(
            publisher.maybe_publish(&ev).await,
            Err(PublishError::Transport(_))
        ));
        assert!(publisher.cached_fingerprint("AA01").is_none());

        transport.set_failure(None);
        assert_eq!(
            publisher.maybe_publish(&ev).await.unwrap(),
            PublishOutcome::Published { announced: 2 }
        );
        let topics: Vec<String> = transport.published().into_iter().map(|(t, _)| t).collect();
        assert_eq!(
            topics,
            vec![
                "homeassistant/sensor/AA01_temp_c/config",
                "homeassistant/button/AA01_reboot/config"
            ]
        );
    }

    #[test]
    fn test_fingerprint_is_order_sensitive() {
        let a = event(json!({"discovery": {"sensors": [{"field": "a"}, {"field": "b"}]}}));
        let b = event(json!({"discovery": {"sensors": [{"field": "b"}, {"field": "a"}]}}));
        let fa = DiscoveryFingerprint::compute("AA01", &a.discovery).unwrap();
        let fb = DiscoveryFingerprint::compute("AA01", &b.discovery).unwrap();
        assert_ne!(fa, fb);
        assert_eq!(fa, DiscoveryFingerprint::compute("AA01", &a.discovery).unwrap());
    }
}
