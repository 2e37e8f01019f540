//! ChirpStack to Home Assistant bridge engine.
//!
//! ## Architecture
//!
//! - **uplink**: decodes a transport message into an [`UplinkEvent`]
//! - **discovery**: builds sensor and command descriptors from the event's discovery section
//! - **publisher**: announces descriptors once per distinct discovery set
//! - **registry**: per-kind entity registries fed through callback buses
//! - **telemetry**: backfills embedded history into the time-series backend
//! - **service**: wires the above behind [`BridgeService::handle_message`]
//!
//! The MQTT transport lives in [`adapters::mqtt`].

pub mod adapters;
pub mod discovery;
pub mod downlink;
pub mod entity;
pub mod hass_discovery;
pub mod publisher;
pub mod registry;
pub mod service;
pub mod telemetry;
pub mod uplink;

pub use discovery::{
    build_discovery, infer_device_class, infer_unit, normalize_unit, CommandDescriptor,
    CommandType, DataQualityWarning, DiscoveryModel, DiscoverySet, SensorDescriptor,
};
pub use downlink::{DownlinkError, DownlinkRequest, DownlinkSink, LoggingDownlinkSink};
pub use entity::{
    CommandAction, CommandError, Entity, EntityAttributes, EntityKind, EntitySnapshot,
    EntityValue, StateSink,
};
pub use hass_discovery::{DiscoveryAnnouncement, HassDeviceInfo, HassEntityConfig};
pub use publisher::{
    DiscoveryFingerprint, DiscoveryPublisher, DiscoveryTransport, PublishError, PublishOutcome,
    RecordingTransport,
};
pub use registry::{CallbackBus, EntityHost, EntityRegistry, EventBusHost, EventSubscriber};
pub use service::{BridgeService, IntegrationState, MessageOutcome, ServiceStats};
pub use telemetry::{EntityFilter, ReconcileReport, ReconcileTarget, Reconciler, SkipReason};
pub use uplink::{decode, DecodeError, HistorySample, UplinkEvent};
