//! Core types shared by the Chirpha bridge crates.
//!
//! This crate holds the umbrella error type, the configuration model and
//! its loading rules, and the event bus that stands in for the host
//! runtime (entity announcements and state changes travel over it).

pub mod config;
pub mod error;
pub mod event;
pub mod eventbus;

pub use config::{
    BridgeConfig, DiscoverySettings, DownlinkSettings, InfluxApiVersion, InfluxSettings,
    MqttSettings,
};
pub use error::{Error, Result};
pub use event::{BridgeEvent, EventMetadata};
pub use eventbus::{
    DEFAULT_CHANNEL_CAPACITY, EventBus, EventBusReceiver, FilteredReceiver, RecvError,
    SharedEventBus,
};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::config::{BridgeConfig, InfluxApiVersion, InfluxSettings, defaults, env_vars};
    pub use crate::error::{Error, Result};
    pub use crate::event::{BridgeEvent, EventMetadata};
    pub use crate::eventbus::{EventBus, SharedEventBus};
}
