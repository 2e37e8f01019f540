//! Event bus for the bridge.
//!
//! A broadcast channel that carries [`BridgeEvent`]s from the engine to
//! whoever plays the host runtime (the attachment task, the CLI, tests).

use crate::event::{BridgeEvent, EventMetadata};
use std::sync::Arc;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::RecvError;

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Event bus.
///
/// If there are no subscribers, published events are discarded.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<(BridgeEvent, EventMetadata)>,
    name: String,
}

impl EventBus {
    /// Create a new event bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with the specified capacity.
    ///
    /// The capacity determines how many events are buffered for slow subscribers.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            name: "default".to_string(),
        }
    }

    /// Create a new event bus with a name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            tx: broadcast::channel(DEFAULT_CHANNEL_CAPACITY).0,
            name: name.into(),
        }
    }

    /// Get the name of this event bus.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the number of current subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an event with default metadata.
    ///
    /// Returns `true` if there was at least one subscriber.
    pub fn publish(&self, event: BridgeEvent) -> bool {
        self.publish_with_source(event, "bridge")
    }

    /// Publish an event with a custom source.
    pub fn publish_with_source(&self, event: BridgeEvent, source: impl Into<String>) -> bool {
        self.tx.send((event, EventMetadata::new(source))).is_ok()
    }

    /// Subscribe to all events.
    ///
    /// If the subscriber falls behind, older events may be dropped.
    pub fn subscribe(&self) -> EventBusReceiver {
        EventBusReceiver {
            rx: self.tx.subscribe(),
        }
    }

    /// Subscribe to events matching a filter.
    pub fn subscribe_filtered<F>(&self, filter: F) -> FilteredReceiver<F>
    where
        F: Fn(&BridgeEvent) -> bool + Send + 'static,
    {
        FilteredReceiver {
            rx: self.tx.subscribe(),
            filter,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver for all events from the event bus.
pub struct EventBusReceiver {
    rx: broadcast::Receiver<(BridgeEvent, EventMetadata)>,
}

impl EventBusReceiver {
    /// Receive the next event.
    ///
    /// Returns `None` if the event bus is closed.
    pub async fn recv(&mut self) -> Option<(BridgeEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event bus receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<(BridgeEvent, EventMetadata)> {
        self.rx.try_recv().ok()
    }
}

/// Receiver for filtered events from the event bus.
pub struct FilteredReceiver<F>
where
    F: Fn(&BridgeEvent) -> bool + Send,
{
    rx: broadcast::Receiver<(BridgeEvent, EventMetadata)>,
    filter: F,
}

impl<F> FilteredReceiver<F>
where
    F: Fn(&BridgeEvent) -> bool + Send,
{
    /// Receive the next event matching the filter.
    ///
    /// Events lost to lag are skipped. Use [`recv_checked`](Self::recv_checked)
    /// when the caller has to recover from them.
    pub async fn recv(&mut self) -> Option<(BridgeEvent, EventMetadata)> {
        loop {
            match self.recv_checked().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Receive the next event matching the filter, reporting lag.
    ///
    /// `Err(RecvError::Lagged(n))` means `n` events, matching or not, were
    /// dropped before this receiver saw them.
    pub async fn recv_checked(&mut self) -> Result<(BridgeEvent, EventMetadata), RecvError> {
        loop {
            match self.rx.recv().await {
                Ok((event, meta)) => {
                    if (self.filter)(&event) {
                        return Ok((event, meta));
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Filtered event bus receiver lagged");
                    return Err(RecvError::Lagged(skipped));
                }
                Err(RecvError::Closed) => return Err(RecvError::Closed),
            }
        }
    }

    /// Try to receive a matching event without blocking.
    pub fn try_recv(&mut self) -> Option<(BridgeEvent, EventMetadata)> {
        while let Ok((event, meta)) = self.rx.try_recv() {
            if (self.filter)(&event) {
                return Some((event, meta));
            }
        }
        None
    }
}

/// Shared event bus handle.
pub type SharedEventBus = Arc<EventBus>;

#[cfg(test)]
mod tests {
    use super::*;

    fn published(dev_eui: &str) -> BridgeEvent {
        BridgeEvent::DiscoveryPublished {
            dev_eui: dev_eui.to_string(),
            announced: 1,
        }
    }

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        assert!(bus.publish(published("AA01")));

        let (event, meta) = rx.recv().await.unwrap();
        assert_eq!(event.type_name(), "DiscoveryPublished");
        assert_eq!(meta.source, "bridge");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::with_name("idle");
        assert_eq!(bus.name(), "idle");
        assert_eq!(bus.subscriber_count(), 0);
        assert!(!bus.publish(published("AA01")));
    }

    #[tokio::test]
    async fn test_filtered_subscription() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_filtered(BridgeEvent::is_entity_event);

        bus.publish(published("AA01"));
        bus.publish(BridgeEvent::StateChanged {
            unique_id: "AA01_temp_c".to_string(),
            entity_id: "sensor.site_tank1_temp_c".to_string(),
            state: serde_json::json!(21.5),
        });

        let (event, _) = rx.recv().await.unwrap();
        assert!(matches!(event, BridgeEvent::StateChanged { .. }));
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_filtered_receiver_reports_lag() {
        let bus = EventBus::with_capacity(2);
        let mut rx =
            bus.subscribe_filtered(|e| matches!(e, BridgeEvent::DiscoveryPublished { .. }));

        for dev_eui in ["D0", "D1", "D2", "D3"] {
            bus.publish(published(dev_eui));
        }

        assert!(matches!(rx.recv_checked().await, Err(RecvError::Lagged(2))));
        let (event, _) = rx.recv_checked().await.unwrap();
        assert_eq!(event, published("D2"));
        // Plain recv skips over lag.
        for dev_eui in ["D4", "D5", "D6"] {
            bus.publish(published(dev_eui));
        }
        let (event, _) = rx.recv().await.unwrap();
        assert_eq!(event, published("D5"));
    }
}
