//! Events published on the bridge event bus.
//!
//! The host runtime is modelled as a consumer of these events: entity
//! announcements arrive as [`BridgeEvent::EntitiesAdded`], displayed state as
//! [`BridgeEvent::StateChanged`].

use serde::{Deserialize, Serialize};

/// Bridge event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BridgeEvent {
    /// A batch of newly created entities of one kind, announced once per uplink.
    EntitiesAdded {
        kind: String,
        dev_eui: String,
        unique_ids: Vec<String>,
    },

    /// An attached entity wrote a new state.
    StateChanged {
        unique_id: String,
        entity_id: String,
        state: serde_json::Value,
    },

    /// Discovery announcements were published for a device.
    DiscoveryPublished { dev_eui: String, announced: usize },

    /// A command entity produced a downlink request.
    DownlinkRequested {
        dev_eui: String,
        topic: String,
        payload: String,
    },
}

impl BridgeEvent {
    /// Get the event type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            BridgeEvent::EntitiesAdded { .. } => "EntitiesAdded",
            BridgeEvent::StateChanged { .. } => "StateChanged",
            BridgeEvent::DiscoveryPublished { .. } => "DiscoveryPublished",
            BridgeEvent::DownlinkRequested { .. } => "DownlinkRequested",
        }
    }

    /// Check if this event concerns entity lifecycle or state.
    pub fn is_entity_event(&self) -> bool {
        matches!(
            self,
            BridgeEvent::EntitiesAdded { .. } | BridgeEvent::StateChanged { .. }
        )
    }
}

/// Metadata attached to every published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event ID
    pub event_id: String,
    /// Event source (component that published)
    pub source: String,
    /// Event timestamp
    pub timestamp: i64,
}

impl EventMetadata {
    /// Create new event metadata.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            source: source.into(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = BridgeEvent::DiscoveryPublished {
            dev_eui: "AA01".to_string(),
            announced: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "DiscoveryPublished");
        assert_eq!(json["announced"], 2);

        let back: BridgeEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_entity_event_classification() {
        let added = BridgeEvent::EntitiesAdded {
            kind: "sensor".to_string(),
            dev_eui: "AA01".to_string(),
            unique_ids: vec!["AA01_temp_c".to_string()],
        };
        assert!(added.is_entity_event());
        assert_eq!(added.type_name(), "EntitiesAdded");

        let downlink = BridgeEvent::DownlinkRequested {
            dev_eui: "AA01".to_string(),
            topic: "t".to_string(),
            payload: "{}".to_string(),
        };
        assert!(!downlink.is_entity_event());
    }
}
