//! Bridge service: decode, announce, dispatch.
//!
//! One inbound message is decoded, its discovery set published if it changed,
//! and the event dispatched to every entity kind in a fixed order before
//! [`BridgeService::handle_message`] returns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use chirpha_core::{BridgeConfig, BridgeEvent, EventBus, RecvError, SharedEventBus};
use chirpha_storage::TimeSeriesBackend;

use crate::downlink::{DownlinkRequest, DownlinkSink, LoggingDownlinkSink};
use crate::entity::{CommandAction, CommandError, EntityKind, EntitySnapshot, StateSink};
use crate::publisher::{DiscoveryPublisher, DiscoveryTransport, PublishOutcome};
use crate::registry::{
    CallbackBus, EntityHost, EntityRegistry, EventBusHost, EventBusStateSink, EventSubscriber,
};
use crate::telemetry::Reconciler;
use crate::uplink::{decode, DecodeError, UplinkEvent};

/// Registries and callback buses for every entity kind.
///
/// Each registry is subscribed to its own kind's bus at construction.
pub struct IntegrationState {
    registries: HashMap<EntityKind, Arc<EntityRegistry>>,
    buses: HashMap<EntityKind, CallbackBus>,
}

impl IntegrationState {
    pub fn new(reconciler: Arc<Reconciler>, host: Option<Arc<dyn EntityHost>>) -> Self {
        let mut registries = HashMap::new();
        let mut buses = HashMap::new();
        for kind in EntityKind::ALL {
            let mut registry = EntityRegistry::new(kind);
            if let Some(host) = &host {
                registry = registry.with_host(host.clone());
            }
            if kind == EntityKind::Sensor {
                registry = registry.with_reconciler(reconciler.clone());
            }
            let registry = Arc::new(registry);

            let bus = CallbackBus::new(kind);
            bus.register(registry.clone());
            registries.insert(kind, registry);
            buses.insert(kind, bus);
        }
        Self { registries, buses }
    }

    /// Adds a subscriber after the kind's registry.
    pub fn register(&self, kind: EntityKind, subscriber: Arc<dyn EventSubscriber>) {
        if let Some(bus) = self.buses.get(&kind) {
            bus.register(subscriber);
        }
    }

    /// Dispatches once per kind, in [`EntityKind::ALL`] order.
    pub async fn dispatch(&self, event: &UplinkEvent) {
        for kind in EntityKind::ALL {
            if let Some(bus) = self.buses.get(&kind) {
                bus.dispatch(event).await;
            }
        }
    }

    pub fn registry(&self, kind: EntityKind) -> Option<&Arc<EntityRegistry>> {
        self.registries.get(&kind)
    }

    pub fn entity(&self, kind: EntityKind, unique_id: &str) -> Option<EntitySnapshot> {
        self.registries
            .get(&kind)
            .and_then(|registry| registry.snapshot(unique_id))
    }

    pub fn entities(&self) -> Vec<EntitySnapshot> {
        EntityKind::ALL
            .iter()
            .filter_map(|kind| self.registries.get(kind))
            .flat_map(|registry| registry.snapshots())
            .collect()
    }

    pub fn entity_count(&self) -> usize {
        self.registries.values().map(|r| r.len()).sum()
    }

    pub fn attach(
        &self,
        kind: EntityKind,
        unique_id: &str,
        sink: Arc<dyn StateSink>,
    ) -> Option<bool> {
        self.registries
            .get(&kind)
            .and_then(|registry| registry.attach(unique_id, sink))
    }

    /// Attaches every entity of every kind that has no sink yet.
    pub fn attach_unattached(&self, sink: &Arc<dyn StateSink>) -> usize {
        self.registries
            .values()
            .map(|registry| registry.attach_unattached(sink))
            .sum()
    }

    pub fn apply_command(
        &self,
        kind: EntityKind,
        unique_id: &str,
        action: CommandAction,
        topic_template: &str,
    ) -> Result<DownlinkRequest, CommandError> {
        self.registries
            .get(&kind)
            .ok_or_else(|| CommandError::UnknownEntity(unique_id.to_string()))?
            .apply_command(unique_id, action, topic_template)
    }
}

/// Message counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    pub received: u64,
    pub dropped: u64,
    pub dispatched: u64,
    pub discovery_passes: u64,
    pub publish_errors: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    dropped: AtomicU64,
    dispatched: AtomicU64,
    discovery_passes: AtomicU64,
    publish_errors: AtomicU64,
}

/// What happened to one accepted message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageOutcome {
    pub dev_eui: String,
    /// `None` when publishing failed.
    pub discovery: Option<PublishOutcome>,
}

pub struct BridgeService {
    state: Arc<IntegrationState>,
    publisher: DiscoveryPublisher,
    downlink: Arc<dyn DownlinkSink>,
    downlink_template: String,
    event_bus: SharedEventBus,
    counters: Counters,
}

impl BridgeService {
    pub fn new(
        config: &BridgeConfig,
        transport: Arc<dyn DiscoveryTransport>,
        backend: Option<Arc<dyn TimeSeriesBackend>>,
        event_bus: SharedEventBus,
    ) -> Self {
        let reconciler = Arc::new(Reconciler::new(backend, config.influxdb.as_ref()));
        let host: Arc<dyn EntityHost> = Arc::new(EventBusHost::new(event_bus.clone()));
        let publisher = DiscoveryPublisher::new(
            config.discovery.prefix.clone(),
            config.downlink.topic_template.clone(),
            transport,
        )
        .with_event_bus(event_bus.clone());

        Self {
            state: Arc::new(IntegrationState::new(reconciler, Some(host))),
            publisher,
            downlink: Arc::new(LoggingDownlinkSink::with_event_bus(event_bus.clone())),
            downlink_template: config.downlink.topic_template.clone(),
            event_bus,
            counters: Counters::default(),
        }
    }

    /// Service with a private event bus and no time-series backend.
    pub fn offline(config: &BridgeConfig, transport: Arc<dyn DiscoveryTransport>) -> Self {
        Self::new(config, transport, None, Arc::new(EventBus::with_name("offline")))
    }

    pub fn with_downlink_sink(mut self, sink: Arc<dyn DownlinkSink>) -> Self {
        self.downlink = sink;
        self
    }

    pub fn state(&self) -> &Arc<IntegrationState> {
        &self.state
    }

    pub fn publisher(&self) -> &DiscoveryPublisher {
        &self.publisher
    }

    pub fn event_bus(&self) -> &SharedEventBus {
        &self.event_bus
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            received: self.counters.received.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            discovery_passes: self.counters.discovery_passes.load(Ordering::Relaxed),
            publish_errors: self.counters.publish_errors.load(Ordering::Relaxed),
        }
    }

    /// Processes one transport message.
    ///
    /// Decode failures drop the message and are returned; nothing after
    /// decoding fails the call.
    pub async fn handle_message(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Result<MessageOutcome, DecodeError> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let event = match decode(topic, payload) {
            Ok(event) => event,
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(category = "uplink", topic = %topic, error = %e, "Dropping message");
                return Err(e);
            }
        };

        for warning in &event.warnings {
            warn!(category = "data_quality", dev_eui = %event.dev_eui, "{}", warning);
        }

        let discovery = match self.publisher.maybe_publish(&event).await {
            Ok(outcome) => {
                if matches!(outcome, PublishOutcome::Published { .. }) {
                    self.counters.discovery_passes.fetch_add(1, Ordering::Relaxed);
                }
                Some(outcome)
            }
            Err(e) => {
                self.counters.publish_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    category = "discovery",
                    dev_eui = %event.dev_eui,
                    error = %e,
                    "Discovery publish failed, retrying on next uplink"
                );
                None
            }
        };

        self.state.dispatch(&event).await;
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        debug!(dev_eui = %event.dev_eui, "Uplink dispatched");

        Ok(MessageOutcome {
            dev_eui: event.dev_eui,
            discovery,
        })
    }

    /// Runs a host action on a command entity and routes the downlink.
    pub async fn execute(
        &self,
        kind: EntityKind,
        unique_id: &str,
        action: CommandAction,
    ) -> Result<DownlinkRequest, CommandError> {
        let request = self
            .state
            .apply_command(kind, unique_id, action, &self.downlink_template)?;
        self.downlink
            .send(request.clone())
            .await
            .map_err(|e| CommandError::Downlink(e.to_string()))?;
        Ok(request)
    }

    /// Attaches every announced entity to an event-bus state sink.
    ///
    /// Subscribes before returning, so entities announced by later messages
    /// are never missed. If announcements are lost to lag, every entity still
    /// without a sink is attached.
    pub fn spawn_host_attachment(&self) -> JoinHandle<()> {
        let mut rx = self
            .event_bus
            .subscribe_filtered(|event| matches!(event, BridgeEvent::EntitiesAdded { .. }));
        let state = self.state.clone();
        let sink: Arc<dyn StateSink> = Arc::new(EventBusStateSink::new(self.event_bus.clone()));

        tokio::spawn(async move {
            loop {
                match rx.recv_checked().await {
                    Ok((BridgeEvent::EntitiesAdded { kind, unique_ids, .. }, _meta)) => {
                        let kind = match kind.parse::<EntityKind>() {
                            Ok(kind) => kind,
                            Err(e) => {
                                warn!(category = "host", error = %e, "Ignoring announcement");
                                continue;
                            }
                        };
                        for unique_id in &unique_ids {
                            state.attach(kind, unique_id, sink.clone());
                        }
                        info!(
                            category = "host",
                            kind = %kind,
                            count = unique_ids.len(),
                            "Entities attached"
                        );
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        let attached = state.attach_unattached(&sink);
                        warn!(
                            category = "host",
                            skipped,
                            attached,
                            "Announcements lost, attached remaining entities"
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Host attachment task stopped");
        })
    }
}
