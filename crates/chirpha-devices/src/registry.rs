//! Per-kind entity registries and the callback buses that feed them.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info};

use chirpha_core::{BridgeEvent, SharedEventBus};

use crate::discovery::{CommandDescriptor, CommandType, SensorDescriptor};
use crate::downlink::DownlinkRequest;
use crate::entity::{
    CommandAction, CommandError, Entity, EntityAttributes, EntityKind, EntitySnapshot, StateSink,
};
use crate::hass_discovery::unique_id;
use crate::telemetry::{ReconcileTarget, Reconciler};
use crate::uplink::UplinkEvent;

/// Receives every decoded uplink dispatched on a bus.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn on_event(&self, event: &UplinkEvent);
}

/// Ordered subscriber list for one entity kind.
///
/// Registering the same subscriber twice calls it twice.
pub struct CallbackBus {
    kind: EntityKind,
    subscribers: RwLock<Vec<Arc<dyn EventSubscriber>>>,
}

impl CallbackBus {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn register(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.write().push(subscriber);
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    /// Calls each subscriber in registration order, one at a time.
    pub async fn dispatch(&self, event: &UplinkEvent) {
        let subscribers = self.subscribers.read().clone();
        for subscriber in subscribers {
            subscriber.on_event(event).await;
        }
    }
}

/// Host runtime side of entity creation.
pub trait EntityHost: Send + Sync {
    fn entities_added(&self, kind: EntityKind, dev_eui: &str, unique_ids: Vec<String>);
}

/// Announces new entities on the event bus.
pub struct EventBusHost {
    event_bus: SharedEventBus,
}

impl EventBusHost {
    pub fn new(event_bus: SharedEventBus) -> Self {
        Self { event_bus }
    }
}

impl EntityHost for EventBusHost {
    fn entities_added(&self, kind: EntityKind, dev_eui: &str, unique_ids: Vec<String>) {
        self.event_bus.publish_with_source(
            BridgeEvent::EntitiesAdded {
                kind: kind.as_str().to_string(),
                dev_eui: dev_eui.to_string(),
                unique_ids,
            },
            "registry",
        );
    }
}

/// State sink publishing every write as [`BridgeEvent::StateChanged`].
pub struct EventBusStateSink {
    event_bus: SharedEventBus,
}

impl EventBusStateSink {
    pub fn new(event_bus: SharedEventBus) -> Self {
        Self { event_bus }
    }
}

impl StateSink for EventBusStateSink {
    fn write_state(&self, unique_id: &str, entity_id: &str, value: &crate::entity::EntityValue) {
        self.event_bus.publish_with_source(
            BridgeEvent::StateChanged {
                unique_id: unique_id.to_string(),
                entity_id: entity_id.to_string(),
                state: value.to_json(),
            },
            "entity",
        );
    }
}

/// Known entities of one kind, keyed by unique id.
pub struct EntityRegistry {
    kind: EntityKind,
    entities: DashMap<String, Entity>,
    host: Option<Arc<dyn EntityHost>>,
    reconciler: Option<Arc<Reconciler>>,
}

impl EntityRegistry {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            entities: DashMap::new(),
            host: None,
            reconciler: None,
        }
    }

    pub fn with_host(mut self, host: Arc<dyn EntityHost>) -> Self {
        self.host = Some(host);
        self
    }

    /// Only used by the sensor registry.
    pub fn with_reconciler(mut self, reconciler: Arc<Reconciler>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn contains(&self, unique_id: &str) -> bool {
        self.entities.contains_key(unique_id)
    }

    pub fn snapshot(&self, unique_id: &str) -> Option<EntitySnapshot> {
        self.entities.get(unique_id).map(|e| e.snapshot())
    }

    pub fn snapshots(&self) -> Vec<EntitySnapshot> {
        let mut all: Vec<EntitySnapshot> = self.entities.iter().map(|e| e.snapshot()).collect();
        all.sort_by(|a, b| a.unique_id.cmp(&b.unique_id));
        all
    }

    /// Attaches the host sink to an entity. `None` if the entity is unknown.
    pub fn attach(&self, unique_id: &str, sink: Arc<dyn StateSink>) -> Option<bool> {
        self.entities
            .get_mut(unique_id)
            .map(|mut entity| entity.attach(sink))
    }

    /// Attaches the sink to every entity that has none yet. Returns how many.
    pub fn attach_unattached(&self, sink: &Arc<dyn StateSink>) -> usize {
        let mut attached = 0;
        for mut entity in self.entities.iter_mut() {
            if !entity.is_attached() {
                entity.attach(sink.clone());
                attached += 1;
            }
        }
        attached
    }

    pub fn apply_command(
        &self,
        unique_id: &str,
        action: CommandAction,
        topic_template: &str,
    ) -> Result<DownlinkRequest, CommandError> {
        let mut entity = self
            .entities
            .get_mut(unique_id)
            .ok_or_else(|| CommandError::UnknownEntity(unique_id.to_string()))?;
        entity.apply_command(action, topic_template)
    }

    /// Creates the entity on first sighting, otherwise refreshes it.
    ///
    /// Returns whether it was created.
    fn upsert(
        &self,
        event: &UplinkEvent,
        device_name: &str,
        field: &str,
        label: &str,
        (attributes, common): (EntityAttributes, crate::entity::CommonAttributes),
    ) -> bool {
        let uid = unique_id(&event.dev_eui, field);
        if let Some(mut existing) = self.entities.get_mut(&uid) {
            existing.refresh(device_name, label, &event.application_id, attributes, common);
            return false;
        }
        let entity = Entity::new(
            &event.dev_eui,
            &event.application_id,
            device_name,
            field,
            label,
            attributes,
            common,
        );
        debug!(
            kind = %self.kind,
            unique_id = %uid,
            entity_id = entity.entity_id(),
            "Entity created"
        );
        self.entities.insert(uid, entity);
        true
    }

    /// Forwards the live payload value of `field`, if there is one.
    fn forward_live_value(&self, event: &UplinkEvent, field: &str) {
        let Some(raw) = event.value(field) else {
            return;
        };
        let uid = unique_id(&event.dev_eui, field);
        if let Some(mut entity) = self.entities.get_mut(&uid) {
            if let Some(value) = entity.attributes().value_from_payload(raw) {
                entity.update_value(value);
            }
        }
    }

    async fn handle_sensor(
        &self,
        event: &UplinkEvent,
        device_name: &str,
        sensor: &SensorDescriptor,
    ) -> bool {
        let created = self.upsert(
            event,
            device_name,
            &sensor.field,
            sensor.label(),
            EntityAttributes::from_sensor(sensor),
        );

        if let Some(reconciler) = &self.reconciler {
            let entity_id = self
                .entities
                .get(&unique_id(&event.dev_eui, &sensor.field))
                .map(|e| e.entity_id().to_string());
            if let Some(entity_id) = entity_id {
                let target = ReconcileTarget {
                    entity_id: &entity_id,
                    field: &sensor.field,
                    unit: sensor.unit.as_deref(),
                    state_class: &sensor.state_class,
                };
                reconciler
                    .reconcile(&target, &event.history, event.value(&sensor.field))
                    .await;
            }
        }

        self.forward_live_value(event, &sensor.field);
        created
    }

    fn handle_command(
        &self,
        event: &UplinkEvent,
        device_name: &str,
        command: &CommandDescriptor,
    ) -> bool {
        let created = self.upsert(
            event,
            device_name,
            &command.field,
            command.label(),
            EntityAttributes::from_command(command),
        );
        self.forward_live_value(event, &command.field);
        created
    }

    fn command_type(&self) -> Option<CommandType> {
        match self.kind {
            EntityKind::Sensor => None,
            EntityKind::Button => Some(CommandType::Button),
            EntityKind::Number => Some(CommandType::Number),
            EntityKind::Select => Some(CommandType::Select),
            EntityKind::Switch => Some(CommandType::Switch),
            EntityKind::Text => Some(CommandType::Text),
        }
    }
}

#[async_trait]
impl EventSubscriber for EntityRegistry {
    async fn on_event(&self, event: &UplinkEvent) {
        let device_name = event.display_name();
        let mut created = Vec::new();

        match self.command_type() {
            None => {
                for sensor in &event.discovery.sensors {
                    if self.handle_sensor(event, &device_name, sensor).await {
                        created.push(unique_id(&event.dev_eui, &sensor.field));
                    }
                }
            }
            Some(command_type) => {
                for command in event.discovery.commands_of(command_type) {
                    if self.handle_command(event, &device_name, command) {
                        created.push(unique_id(&event.dev_eui, &command.field));
                    }
                }
            }
        }

        if created.is_empty() {
            return;
        }
        info!(
            kind = %self.kind,
            dev_eui = %event.dev_eui,
            count = created.len(),
            "New entities"
        );
        if let Some(host) = &self.host {
            host.entities_added(self.kind, &event.dev_eui, created);
        }
    }
}
