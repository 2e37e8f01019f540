//! End-to-end tests of the uplink pipeline with in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use chirpha_core::{BridgeConfig, BridgeEvent, EventBus};
use chirpha_devices::{
    BridgeService, CommandAction, CommandError, DecodeError, DownlinkError, DownlinkRequest,
    DownlinkSink, EntityKind, EntitySnapshot, EntityValue, PublishOutcome, RecordingTransport,
};

const TOPIC: &str = "application/3/device/AA01/event/up";

fn tank_event(discovery: Value, extra: Value) -> Vec<u8> {
    let mut object = json!({ "discovery": discovery });
    if let (Some(object), Some(extra)) = (object.as_object_mut(), extra.as_object()) {
        for (k, v) in extra {
            object.insert(k.clone(), v.clone());
        }
    }
    json!({
        "deviceInfo": {"devEui": "AA01", "deviceName": "Tank1", "applicationName": "Site"},
        "object": object
    })
    .to_string()
    .into_bytes()
}

fn temp_sensor() -> Value {
    json!({"sensors": [{"field": "temp_c", "unit": "°C"}]})
}

fn service(transport: Arc<RecordingTransport>) -> BridgeService {
    BridgeService::new(
        &BridgeConfig::default(),
        transport,
        None,
        Arc::new(EventBus::new()),
    )
}

#[derive(Default)]
struct RecordingSink {
    requests: Mutex<Vec<DownlinkRequest>>,
}

#[async_trait]
impl DownlinkSink for RecordingSink {
    async fn send(&self, request: DownlinkRequest) -> Result<(), DownlinkError> {
        self.requests.lock().push(request);
        Ok(())
    }
}

#[tokio::test]
async fn test_tank_sensor_end_to_end() {
    let transport = Arc::new(RecordingTransport::new());
    let service = service(transport.clone());
    let mut states = service
        .event_bus()
        .subscribe_filtered(|e| matches!(e, BridgeEvent::StateChanged { .. }));
    let _attach = service.spawn_host_attachment();

    let message = tank_event(temp_sensor(), json!({"temp_c": 21.5}));
    let outcome = service.handle_message(TOPIC, &message).await.unwrap();
    assert_eq!(outcome.dev_eui, "AA01");
    assert_eq!(outcome.discovery, Some(PublishOutcome::Published { announced: 1 }));

    let published = transport.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "homeassistant/sensor/AA01_temp_c/config");
    let config: Value = serde_json::from_str(&published[0].1).unwrap();
    assert_eq!(config["unique_id"], "AA01_temp_c");
    assert_eq!(config["state_topic"], TOPIC);
    assert_eq!(config["device"]["name"], "Site-Tank1");

    let entity = service.state().entity(EntityKind::Sensor, "AA01_temp_c").unwrap();
    assert_eq!(entity.display_name, "Site-Tank1 temp_c");
    assert_eq!(entity.current, Some(EntityValue::Sensor(json!(21.5))));
    assert_eq!(service.state().entity_count(), 1);

    // The pending value is flushed once the host attaches the entity.
    let (event, _) = tokio::time::timeout(Duration::from_secs(2), states.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        BridgeEvent::StateChanged {
            unique_id: "AA01_temp_c".to_string(),
            entity_id: "sensor.site_tank1_temp_c".to_string(),
            state: json!(21.5),
        }
    );

    let outcome = service.handle_message(TOPIC, &message).await.unwrap();
    assert_eq!(outcome.discovery, Some(PublishOutcome::Unchanged));
    assert_eq!(transport.published().len(), 1);
    assert_eq!(service.state().entity_count(), 1);

    let (event, _) = tokio::time::timeout(Duration::from_secs(2), states.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        event,
        BridgeEvent::StateChanged { ref unique_id, .. } if unique_id == "AA01_temp_c"
    ));

    let stats = service.stats();
    assert_eq!(stats.received, 2);
    assert_eq!(stats.dispatched, 2);
    assert_eq!(stats.discovery_passes, 1);
    assert_eq!(stats.dropped, 0);
}

#[tokio::test]
async fn test_changed_discovery_set_publishes_again() {
    let transport = Arc::new(RecordingTransport::new());
    let service = service(transport.clone());
    let d1 = tank_event(temp_sensor(), json!({}));
    let d2 = tank_event(
        json!({"sensors": [{"field": "temp_c", "unit": "°C"}, {"field": "battery"}]}),
        json!({}),
    );

    service.handle_message(TOPIC, &d1).await.unwrap();
    service.handle_message(TOPIC, &d1).await.unwrap();
    assert_eq!(service.stats().discovery_passes, 1);

    service.handle_message(TOPIC, &d2).await.unwrap();
    assert_eq!(service.stats().discovery_passes, 2);
    // One announcement from the first pass, two from the second.
    assert_eq!(transport.published().len(), 3);
    assert_eq!(service.state().entity_count(), 2);
}

#[tokio::test]
async fn test_bad_messages_do_not_stop_intake() {
    let transport = Arc::new(RecordingTransport::new());
    let service = service(transport.clone());

    let result = service.handle_message(TOPIC, b"{not json").await;
    assert!(matches!(result, Err(DecodeError::MalformedPayload(_))));

    let anonymous = json!({"deviceInfo": {"deviceName": "Tank1"}, "object": {}}).to_string();
    let result = service
        .handle_message("application/3/event/up", anonymous.as_bytes())
        .await;
    assert!(matches!(result, Err(DecodeError::MissingDeviceIdentity { .. })));

    let undecoded = json!({"deviceInfo": {"devEui": "AA01"}, "object": "AQID"}).to_string();
    let result = service.handle_message(TOPIC, undecoded.as_bytes()).await;
    assert!(matches!(result, Err(DecodeError::UndecodedPayload { .. })));

    let message = tank_event(temp_sensor(), json!({"temp_c": 19.0}));
    service.handle_message(TOPIC, &message).await.unwrap();

    let stats = service.stats();
    assert_eq!(stats.received, 4);
    assert_eq!(stats.dropped, 3);
    assert_eq!(stats.dispatched, 1);
    assert_eq!(transport.published().len(), 1);
}

#[tokio::test]
async fn test_publish_failure_still_updates_entities() {
    let transport = Arc::new(RecordingTransport::new());
    transport.set_failure(Some("not connected"));
    let service = service(transport.clone());
    let message = tank_event(temp_sensor(), json!({"temp_c": 18.0}));

    let outcome = service.handle_message(TOPIC, &message).await.unwrap();
    assert_eq!(outcome.discovery, None);
    assert_eq!(service.stats().publish_errors, 1);
    assert_eq!(
        service.state().entity(EntityKind::Sensor, "AA01_temp_c").unwrap().current,
        Some(EntityValue::Sensor(json!(18.0)))
    );

    // Nothing was cached, so the next uplink announces again.
    transport.set_failure(None);
    let outcome = service.handle_message(TOPIC, &message).await.unwrap();
    assert_eq!(outcome.discovery, Some(PublishOutcome::Published { announced: 1 }));
}

#[tokio::test]
async fn test_commands_route_downlinks() {
    let transport = Arc::new(RecordingTransport::new());
    let sink = Arc::new(RecordingSink::default());
    let service = service(transport.clone()).with_downlink_sink(sink.clone());
    let message = tank_event(
        json!({
            "sensors": [{"field": "temp_c", "unit": "°C"}],
            "commands": [
                {"field": "interval", "type": "number", "min": 10, "max": 600},
                {"field": "valve", "type": "switch"},
                {"field": "reboot", "type": "button"}
            ]
        }),
        json!({"interval": 60, "valve": false}),
    );
    service.handle_message(TOPIC, &message).await.unwrap();
    assert_eq!(transport.published().len(), 4);

    let interval = service.state().entity(EntityKind::Number, "AA01_interval").unwrap();
    assert_eq!(interval.current, Some(EntityValue::Number(60.0)));

    service
        .execute(EntityKind::Number, "AA01_interval", CommandAction::SetValue(120.0))
        .await
        .unwrap();
    service
        .execute(EntityKind::Switch, "AA01_valve", CommandAction::TurnOn)
        .await
        .unwrap();
    service
        .execute(EntityKind::Button, "AA01_reboot", CommandAction::Press)
        .await
        .unwrap();

    let requests = sink.requests.lock().clone();
    assert_eq!(requests.len(), 3);
    assert!(requests
        .iter()
        .all(|r| r.topic == "application/3/device/AA01/command/down"));
    assert_eq!(requests[0].payload, r#"{"interval":"120"}"#);
    assert_eq!(requests[1].payload, r#"{"valve":true}"#);
    assert_eq!(requests[2].payload, r#"{"reboot":true}"#);
    assert_eq!(
        service.state().entity(EntityKind::Switch, "AA01_valve").unwrap().current,
        Some(EntityValue::Switch(true))
    );

    let result = service
        .execute(EntityKind::Number, "AA01_interval", CommandAction::SetValue(5.0))
        .await;
    assert!(matches!(result, Err(CommandError::OutOfRange { .. })));
    let result = service
        .execute(EntityKind::Button, "AA01_missing", CommandAction::Press)
        .await;
    assert!(matches!(result, Err(CommandError::UnknownEntity(_))));
    assert_eq!(sink.requests.lock().len(), 3);
}

struct OfflineSink;

#[async_trait]
impl DownlinkSink for OfflineSink {
    async fn send(&self, _request: DownlinkRequest) -> Result<(), DownlinkError> {
        Err(DownlinkError::Unavailable("gateway offline".to_string()))
    }
}

#[tokio::test]
async fn test_downlink_failure_is_reported() {
    let service =
        service(Arc::new(RecordingTransport::new())).with_downlink_sink(Arc::new(OfflineSink));
    let message = tank_event(
        json!({
            "sensors": [{"field": "temp_c"}],
            "commands": [{"field": "reboot", "type": "button"}]
        }),
        json!({}),
    );
    service.handle_message(TOPIC, &message).await.unwrap();

    let result = service
        .execute(EntityKind::Button, "AA01_reboot", CommandAction::Press)
        .await;
    match result {
        Err(CommandError::Downlink(message)) => assert!(message.contains("gateway offline")),
        other => panic!("unexpected result: {other:?}"),
    }
}

/// Polls until `done` holds for the service's entities or two seconds pass.
async fn wait_for<F>(service: &BridgeService, done: F) -> Vec<EntitySnapshot>
where
    F: Fn(&[EntitySnapshot]) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let entities = service.state().entities();
        if done(&entities) || tokio::time::Instant::now() >= deadline {
            return entities;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_same_field_in_two_kinds_stays_separate() {
    let sink = Arc::new(RecordingSink::default());
    let service = service(Arc::new(RecordingTransport::new())).with_downlink_sink(sink.clone());
    let _attach = service.spawn_host_attachment();

    let message = tank_event(
        json!({
            "sensors": [{"field": "valve"}],
            "commands": [{"field": "valve", "type": "switch"}]
        }),
        json!({"valve": true}),
    );
    service.handle_message(TOPIC, &message).await.unwrap();

    let entities = wait_for(&service, |all| all.iter().all(|e| e.attached)).await;
    assert_eq!(entities.len(), 2);
    for entity in &entities {
        assert!(entity.attached, "{} not attached", entity.entity_id);
        assert_eq!(entity.pending, None);
    }

    let sensor = service.state().entity(EntityKind::Sensor, "AA01_valve").unwrap();
    assert_eq!(sensor.current, Some(EntityValue::Sensor(json!(true))));
    let switch = service.state().entity(EntityKind::Switch, "AA01_valve").unwrap();
    assert_eq!(switch.current, Some(EntityValue::Switch(true)));

    let request = service
        .execute(EntityKind::Switch, "AA01_valve", CommandAction::TurnOff)
        .await
        .unwrap();
    assert_eq!(request.payload, r#"{"valve":false}"#);
    assert_eq!(
        service.state().entity(EntityKind::Switch, "AA01_valve").unwrap().current,
        Some(EntityValue::Switch(false))
    );

    let result = service
        .execute(EntityKind::Sensor, "AA01_valve", CommandAction::TurnOn)
        .await;
    assert!(matches!(result, Err(CommandError::NotSupported { .. })));
    assert_eq!(sink.requests.lock().len(), 1);
}

#[tokio::test]
async fn test_lost_announcements_still_attach_entities() {
    let transport = Arc::new(RecordingTransport::new());
    let service = BridgeService::new(
        &BridgeConfig::default(),
        transport,
        None,
        Arc::new(EventBus::with_capacity(4)),
    );
    let _attach = service.spawn_host_attachment();

    for n in 0..8 {
        let message = json!({
            "deviceInfo": {"devEui": format!("D{n}"), "deviceName": format!("Node{n}")},
            "object": {"discovery": {"sensors": [{"field": "t"}]}, "t": n}
        })
        .to_string();
        let topic = format!("application/1/device/D{n}/event/up");
        service.handle_message(&topic, message.as_bytes()).await.unwrap();
    }

    let entities = wait_for(&service, |all| all.iter().all(|e| e.attached)).await;
    assert_eq!(entities.len(), 8);
    let unattached: Vec<&str> = entities
        .iter()
        .filter(|e| !e.attached || e.pending.is_some())
        .map(|e| e.unique_id.as_str())
        .collect();
    assert!(unattached.is_empty(), "unattached: {unattached:?}");
}
