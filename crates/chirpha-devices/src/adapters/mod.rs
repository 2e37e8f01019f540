//! Transport adapters.

pub mod mqtt;

pub use mqtt::{MqttBridge, MqttPublisher, UPLINK_QUEUE_CAPACITY};
