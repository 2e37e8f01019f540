//! History backfill through the full pipeline.

use std::sync::Arc;

use serde_json::{json, Value};

use chirpha_core::{BridgeConfig, EventBus, InfluxSettings};
use chirpha_devices::{BridgeService, EntityKind, EntityValue, RecordingTransport};
use chirpha_storage::{MemoryBackend, SampleValue, SeriesKey, WritePoint};

const TOPIC: &str = "application/3/device/AA01/event/up";

fn series() -> SeriesKey {
    SeriesKey::new("°C", "sensor", "site_tank1_temp_c")
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn uplink(live: f64, history: Value) -> Vec<u8> {
    json!({
        "deviceInfo": {"devEui": "AA01", "deviceName": "Tank1", "applicationName": "Site"},
        "object": {
            "discovery": {"sensors": [{"field": "temp_c", "unit": "°C"}]},
            "temp_c": live,
            "history": history
        }
    })
    .to_string()
    .into_bytes()
}

fn service_with(config: &BridgeConfig, backend: Arc<MemoryBackend>) -> BridgeService {
    BridgeService::new(
        config,
        Arc::new(RecordingTransport::new()),
        Some(backend),
        Arc::new(EventBus::new()),
    )
}

fn seeded(value: f64) -> Arc<MemoryBackend> {
    let backend = Arc::new(MemoryBackend::new());
    backend.seed(WritePoint::for_series(&series(), SampleValue::Number(value), now() - 3600));
    backend
}

#[tokio::test]
async fn test_sample_within_tolerance_is_not_written() {
    let backend = seeded(21.50);
    let service = service_with(&BridgeConfig::default(), backend.clone());

    let history = json!([{"timestamp": now() - 60, "values": {"temp_c": 21.5000003}}]);
    service.handle_message(TOPIC, &uplink(21.5, history)).await.unwrap();

    assert_eq!(backend.query_calls(), 1);
    assert_eq!(backend.write_calls(), 0);
    assert_eq!(backend.points_for(&series()).len(), 1);
}

#[tokio::test]
async fn test_changed_sample_is_written_once() {
    let backend = seeded(21.50);
    let service = service_with(&BridgeConfig::default(), backend.clone());

    let ts = now() - 60;
    let history = json!([{"timestamp": ts, "values": {"temp_c": 21.6}}]);
    service.handle_message(TOPIC, &uplink(21.6, history)).await.unwrap();

    let points = backend.points_for(&series());
    assert_eq!(points.len(), 2);
    assert_eq!(points[1].timestamp, ts);
    assert_eq!(points[1].value, SampleValue::Number(21.6));
    assert_eq!(backend.write_calls(), 1);
}

#[tokio::test]
async fn test_backend_down_still_updates_entity() {
    let backend = seeded(20.0);
    backend.set_query_failure(true);
    backend.set_write_failure(true);
    let service = service_with(&BridgeConfig::default(), backend.clone());

    let history = json!([
        {"timestamp": now() - 120, "values": {"temp_c": 20.5}},
        {"timestamp": now() - 60, "values": {"temp_c": 21.0}}
    ]);
    let outcome = service.handle_message(TOPIC, &uplink(21.0, history)).await;
    assert!(outcome.is_ok());

    assert_eq!(backend.write_calls(), 1);
    assert_eq!(backend.points_for(&series()).len(), 1);
    assert_eq!(
        service.state().entity(EntityKind::Sensor, "AA01_temp_c").unwrap().current,
        Some(EntityValue::Sensor(json!(21.0)))
    );
}

#[tokio::test]
async fn test_static_tags_and_filters_from_config() {
    let backend = Arc::new(MemoryBackend::new());
    let mut influx = InfluxSettings::v2("http://localhost:8086", "home", "lorawan", "token");
    influx.tags.insert("site".to_string(), "north".to_string());
    let config = BridgeConfig {
        influxdb: Some(influx.clone()),
        ..BridgeConfig::default()
    };
    let service = service_with(&config, backend.clone());

    let history = json!([{"timestamp": now() - 60, "values": {"temp_c": 19.5}}]);
    service.handle_message(TOPIC, &uplink(19.5, history.clone())).await.unwrap();
    let points = backend.points();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].tag("site"), Some("north"));
    assert_eq!(points[0].tag("entity_id"), Some("site_tank1_temp_c"));
    assert_eq!(points[0].tag("domain"), Some("sensor"));

    influx.exclude_entities.push("sensor.site_tank1_temp_c".to_string());
    let config = BridgeConfig {
        influxdb: Some(influx),
        ..BridgeConfig::default()
    };
    let filtered_backend = Arc::new(MemoryBackend::new());
    let service = service_with(&config, filtered_backend.clone());
    service.handle_message(TOPIC, &uplink(19.5, history)).await.unwrap();
    assert_eq!(filtered_backend.query_calls(), 0);
    assert!(filtered_backend.points().is_empty());
}

#[tokio::test]
async fn test_every_event_reads_backend_afresh() {
    let backend = Arc::new(MemoryBackend::new());
    let service = service_with(&BridgeConfig::default(), backend.clone());

    let ts = now() - 60;
    let history = json!([{"timestamp": ts, "values": {"temp_c": 22.0}}]);
    service.handle_message(TOPIC, &uplink(22.0, history.clone())).await.unwrap();
    service.handle_message(TOPIC, &uplink(22.0, history)).await.unwrap();

    // The second pass finds the first pass's point and writes nothing.
    assert_eq!(backend.query_calls(), 2);
    assert_eq!(backend.write_calls(), 1);
    assert_eq!(backend.points().len(), 1);
}
