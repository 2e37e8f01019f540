//! MQTT transport for the bridge.
//!
//! Subscribes to the ChirpStack uplink topic and feeds every publish to a
//! single dispatch task, so events are processed one at a time in arrival
//! order. The same client publishes the retained discovery configs.
//!
//! ## Topics
//!
//! Uplink events: `application/{application_id}/device/{dev_eui}/event/up`
//! Discovery: `{prefix}/{component}/{unique_id}/config` (retained, QoS 1)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use chirpha_core::MqttSettings;

use crate::publisher::{DiscoveryTransport, PublishError};
use crate::service::BridgeService;

/// Uplinks buffered between the network loop and the dispatch task.
pub const UPLINK_QUEUE_CAPACITY: usize = 1024;

const REQUEST_CAPACITY: usize = 10;
const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Retained discovery publication over MQTT.
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
}

#[async_trait]
impl DiscoveryTransport for MqttPublisher {
    async fn publish_retained(&self, topic: &str, payload: &str) -> Result<(), PublishError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, true, payload.as_bytes().to_vec())
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))
    }
}

pub struct MqttBridge {
    client: AsyncClient,
    eventloop: EventLoop,
    uplink_topic: String,
    broker: String,
}

impl MqttBridge {
    /// Builds the client. No connection is made until [`MqttBridge::run`].
    pub fn new(settings: &MqttSettings) -> Self {
        let client_id = settings
            .client_id
            .clone()
            .unwrap_or_else(|| format!("chirpha-{}", Uuid::new_v4()));
        let mut options = MqttOptions::new(client_id, settings.host.clone(), settings.port);
        options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs.max(5)));
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        Self {
            client,
            eventloop,
            uplink_topic: settings.uplink_topic.clone(),
            broker: format!("{}:{}", settings.host, settings.port),
        }
    }

    /// Discovery transport sharing this connection.
    pub fn publisher(&self) -> MqttPublisher {
        MqttPublisher {
            client: self.client.clone(),
        }
    }

    /// Drives the connection forever.
    ///
    /// Broker errors are logged and retried after one second; the uplink
    /// topic is subscribed again on every connection acknowledgement.
    pub async fn run(self, service: Arc<BridgeService>) {
        let Self {
            client,
            mut eventloop,
            uplink_topic,
            broker,
        } = self;

        let (tx, mut rx) = mpsc::channel::<(String, Vec<u8>)>(UPLINK_QUEUE_CAPACITY);
        tokio::spawn(async move {
            while let Some((topic, payload)) = rx.recv().await {
                // Decode failures are counted and logged by the service.
                let _ = service.handle_message(&topic, &payload).await;
            }
            debug!("Uplink dispatch task stopped");
        });

        info!(
            category = "mqtt",
            broker = %broker,
            topic = %uplink_topic,
            "Connecting to MQTT broker"
        );

        let mut error_count: u64 = 0;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    error_count = 0;
                    info!(category = "mqtt", broker = %broker, "Connected to MQTT broker");
                    // The network loop must never wait on its own request queue.
                    if let Err(e) = client.try_subscribe(uplink_topic.clone(), QoS::AtLeastOnce) {
                        warn!(
                            category = "mqtt",
                            topic = %uplink_topic,
                            error = %e,
                            "Failed to subscribe"
                        );
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    debug!(category = "mqtt", topic = %uplink_topic, "Subscribed");
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    error_count = 0;
                    let topic = publish.topic.clone();
                    debug!(
                        category = "mqtt",
                        topic = %topic,
                        bytes = publish.payload.len(),
                        "Uplink received"
                    );
                    if let Err(e) = tx.try_send((topic, publish.payload.to_vec())) {
                        warn!(category = "mqtt", error = %e, "Uplink queue full, dropping message");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error_count += 1;
                    warn!(
                        category = "mqtt",
                        broker = %broker,
                        attempt = error_count,
                        error = %e,
                        "MQTT connection error, retrying"
                    );
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_uses_configured_topic() {
        let settings = MqttSettings {
            host: "broker.local".to_string(),
            port: 1884,
            username: Some("bridge".to_string()),
            password: Some("secret".to_string()),
            client_id: Some("chirpha-test".to_string()),
            uplink_topic: "application/7/device/+/event/up".to_string(),
            keep_alive_secs: 30,
        };
        let bridge = MqttBridge::new(&settings);
        assert_eq!(bridge.uplink_topic, "application/7/device/+/event/up");
        assert_eq!(bridge.broker, "broker.local:1884");
    }
}
