//! Home Assistant MQTT discovery payloads.
//!
//! Every entity is announced with one retained message on
//! `<prefix>/<component>/<unique_id>/config`:
//!
//! ```json
//! // Topic: homeassistant/sensor/AA01_temp_c/config
//! {
//!   "name": "temp_c",
//!   "unique_id": "AA01_temp_c",
//!   "state_topic": "application/3/device/AA01/event/up",
//!   "value_template": "{{ value_json.object.temp_c }}",
//!   "unit_of_measurement": "°C",
//!   "device_class": "temperature",
//!   "state_class": "measurement",
//!   "device": {"identifiers": ["AA01"], "name": "Site-Tank1", "manufacturer": "ChirpStack", "model": "LoRaWAN Device"}
//! }
//! ```
//!
//! Unset values are left out of the payload, never sent as `null`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::discovery::{CommandDescriptor, CommandType, SensorDescriptor};
use crate::downlink::{command_template, press_payload, switch_payload};

pub const MANUFACTURER: &str = "ChirpStack";
pub const MODEL: &str = "LoRaWAN Device";

/// Default upper bound of number commands.
pub const DEFAULT_NUMBER_MAX: f64 = 255.0;
/// Default length limit of text commands.
pub const DEFAULT_TEXT_MAX: u32 = 255;

/// Device grouping block shared by every entity of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HassDeviceInfo {
    pub identifiers: Vec<String>,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
}

impl HassDeviceInfo {
    pub fn new(dev_eui: &str, display_name: &str) -> Self {
        Self {
            identifiers: vec![dev_eui.to_string()],
            name: display_name.to_string(),
            manufacturer: MANUFACTURER.to_string(),
            model: MODEL.to_string(),
        }
    }
}

/// Discovery config message for any supported component.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HassEntityConfig {
    pub name: String,
    pub unique_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_template: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_press: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_on: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_off: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_display_precision: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled_by_default: Option<bool>,

    pub device: HassDeviceInfo,
}

impl Default for HassDeviceInfo {
    fn default() -> Self {
        Self::new("", "")
    }
}

/// One rendered announcement.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryAnnouncement {
    pub component: &'static str,
    pub unique_id: String,
    pub topic: String,
    pub config: HassEntityConfig,
}

impl DiscoveryAnnouncement {
    pub fn payload(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.config)
    }
}

/// Device-level context shared by all announcements of one event.
#[derive(Debug, Clone)]
pub struct DeviceContext<'a> {
    pub prefix: &'a str,
    pub dev_eui: &'a str,
    pub display_name: &'a str,
    /// Topic the uplink arrived on.
    pub state_topic: &'a str,
    /// Rendered per-device command topic.
    pub command_topic: &'a str,
}

impl DeviceContext<'_> {
    fn device(&self) -> HassDeviceInfo {
        HassDeviceInfo::new(self.dev_eui, self.display_name)
    }
}

/// `<dev_eui>_<field>`.
pub fn unique_id(dev_eui: &str, field: &str) -> String {
    format!("{}_{}", dev_eui, field)
}

/// `<prefix>/<component>/<unique_id>/config`.
pub fn discovery_topic(prefix: &str, component: &str, unique_id: &str) -> String {
    format!("{}/{}/{}/config", prefix.trim_end_matches('/'), component, unique_id)
}

/// Template extracting a field from the uplink JSON.
pub fn value_template(field: &str) -> String {
    format!("{{{{ value_json.object.{} }}}}", field)
}

/// JSON number, integral when the value has no fractional part.
pub(crate) fn json_number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}

pub fn render_sensor(ctx: &DeviceContext<'_>, sensor: &SensorDescriptor) -> DiscoveryAnnouncement {
    let unique_id = unique_id(ctx.dev_eui, &sensor.field);
    let config = HassEntityConfig {
        name: sensor.label().to_string(),
        unique_id: unique_id.clone(),
        state_topic: Some(ctx.state_topic.to_string()),
        value_template: Some(value_template(&sensor.field)),
        unit_of_measurement: sensor.unit.clone(),
        device_class: sensor.device_class.clone(),
        state_class: Some(sensor.state_class.clone()),
        suggested_display_precision: sensor.precision,
        icon: sensor.icon.clone(),
        entity_category: sensor.entity_category.clone(),
        device: ctx.device(),
        ..Default::default()
    };
    DiscoveryAnnouncement {
        component: "sensor",
        topic: discovery_topic(ctx.prefix, "sensor", &unique_id),
        unique_id,
        config,
    }
}

pub fn render_command(
    ctx: &DeviceContext<'_>,
    command: &CommandDescriptor,
) -> DiscoveryAnnouncement {
    let unique_id = unique_id(ctx.dev_eui, &command.field);
    let mut config = HassEntityConfig {
        name: command.label().to_string(),
        unique_id: unique_id.clone(),
        command_topic: Some(ctx.command_topic.to_string()),
        icon: command.icon.clone(),
        entity_category: command.entity_category.clone(),
        enabled_by_default: Some(command.enabled_by_default),
        device: ctx.device(),
        ..Default::default()
    };

    match command.command_type {
        CommandType::Button => {
            config.payload_press = Some(press_payload(&command.field));
        }
        CommandType::Number => {
            config.min = Some(json_number(command.min.unwrap_or(0.0)));
            config.max = Some(json_number(command.max.unwrap_or(DEFAULT_NUMBER_MAX)));
            config.step = Some(json_number(command.step.unwrap_or(1.0)));
            config.unit_of_measurement = command.unit.clone();
            config.mode = Some("box".to_string());
            config.command_template = Some(command_template(&command.field));
        }
        CommandType::Select => {
            config.options = Some(command.options.clone());
            config.command_template = Some(command_template(&command.field));
        }
        CommandType::Switch => {
            config.payload_on = Some(switch_payload(&command.field, true));
            config.payload_off = Some(switch_payload(&command.field, false));
        }
        CommandType::Text => {
            config.command_template = Some(command_template(&command.field));
            config.max = Some(Value::from(command.max_length.unwrap_or(DEFAULT_TEXT_MAX)));
        }
    }

    let component = command.command_type.as_str();
    DiscoveryAnnouncement {
        component,
        topic: discovery_topic(ctx.prefix, component, &unique_id),
        unique_id,
        config,
    }
}
