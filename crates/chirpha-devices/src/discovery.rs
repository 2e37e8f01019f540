//! Discovery model builder.
//!
//! Turns the `object.discovery` section of an uplink into typed sensor and
//! command descriptors. The builder is pure: the same section always yields
//! the same descriptors, in input order, plus the same data-quality
//! warnings. Nothing here is ever rejected for quality reasons; unknown
//! command types and descriptors without a `field` are skipped and reported.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// State class assumed when a sensor descriptor does not name one.
pub const DEFAULT_STATE_CLASS: &str = "measurement";

/// Field-name fragments and the device class they imply, in priority order.
///
/// `co` comes after `co2` and `no2` so that `co2_level` never lands on `co`.
pub const DEVICE_CLASS_RULES: &[(&str, &str)] = &[
    ("weight", "mass"),
    ("temperature", "temperature"),
    ("humidity", "humidity"),
    ("pressure", "pressure"),
    ("voltage", "voltage"),
    ("current", "current"),
    ("power", "power"),
    ("energy", "energy"),
    ("distance", "distance"),
    ("speed", "speed"),
    ("direction", "direction"),
    ("altitude", "altitude"),
    ("latitude", "latitude"),
    ("longitude", "longitude"),
    ("battery", "battery"),
    ("signal", "signal"),
    ("rssi", "rssi"),
    ("snr", "snr"),
    ("co2", "co2"),
    ("no2", "no2"),
    ("co", "co"),
];

/// Default units by device class or field-name fragment.
pub const UNIT_RULES: &[(&str, &str)] = &[
    ("temperature", "°C"),
    ("weight", "kg"),
    ("mass", "kg"),
    ("humidity", "%"),
    ("battery", "%"),
    ("pressure", "hPa"),
    ("voltage", "V"),
    ("current", "A"),
    ("power", "W"),
    ("energy", "Wh"),
];

/// Units considered normal for a device class. Anything else is reported.
const KNOWN_UNITS: &[(&str, &[&str])] = &[
    ("temperature", &["°C", "°F", "K"]),
    ("mass", &["kg", "g", "mg", "µg", "lb", "oz", "st"]),
    ("humidity", &["%"]),
    ("battery", &["%"]),
    ("pressure", &["hPa", "Pa", "kPa", "bar", "cbar", "mbar", "mmHg", "inHg", "psi"]),
    ("voltage", &["V", "mV"]),
    ("current", &["A", "mA"]),
    ("power", &["W", "kW"]),
    ("energy", &["Wh", "kWh", "MWh"]),
    ("distance", &["km", "m", "cm", "mm", "mi", "yd", "ft", "in"]),
    ("speed", &["m/s", "km/h", "mph", "ft/s", "kn"]),
    ("signal", &["dB", "dBm"]),
    ("rssi", &["dB", "dBm"]),
    ("snr", &["dB"]),
    ("co2", &["ppm"]),
    ("co", &["ppm"]),
    ("no2", &["µg/m³", "ppb"]),
];

/// A sensor advertised by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDescriptor {
    pub field: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    pub state_class: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_category: Option<String>,
}

impl SensorDescriptor {
    /// Descriptor name, falling back to the field.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.field)
    }

    pub fn is_measurement(&self) -> bool {
        self.state_class == DEFAULT_STATE_CLASS
    }
}

/// Kind of controllable point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandType {
    Button,
    Number,
    Select,
    Switch,
    Text,
}

impl CommandType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "button" => Some(Self::Button),
            "number" => Some(Self::Number),
            "select" => Some(Self::Select),
            "switch" => Some(Self::Switch),
            "text" => Some(Self::Text),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Button => "button",
            Self::Number => "number",
            Self::Select => "select",
            Self::Switch => "switch",
            Self::Text => "text",
        }
    }
}

/// A controllable point advertised by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDescriptor {
    pub field: String,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_category: Option<String>,
    pub enabled_by_default: bool,
}

impl CommandDescriptor {
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.field)
    }
}

/// Everything a device advertises in one uplink.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoverySet {
    pub sensors: Vec<SensorDescriptor>,
    pub commands: Vec<CommandDescriptor>,
}

impl DiscoverySet {
    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty() && self.commands.is_empty()
    }

    pub fn commands_of(
        &self,
        command_type: CommandType,
    ) -> impl Iterator<Item = &CommandDescriptor> {
        self.commands
            .iter()
            .filter(move |c| c.command_type == command_type)
    }
}

/// Non-fatal problems found while building descriptors.
#[derive(Debug, Clone, PartialEq)]
pub enum DataQualityWarning {
    /// No unit given and none could be inferred.
    MissingUnit { field: String },
    /// The unit is unusual for the device class.
    UnrecognizedUnit {
        field: String,
        unit: String,
        device_class: String,
    },
    /// Command `type` is not one of the supported kinds.
    UnrecognizedDescriptorType { field: String, kind: String },
    /// Element could not be read as a descriptor at all.
    MalformedDescriptor {
        section: &'static str,
        index: usize,
        reason: String,
    },
}

impl std::fmt::Display for DataQualityWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingUnit { field } => {
                write!(f, "no unit provided or inferred for `{}`", field)
            }
            Self::UnrecognizedUnit {
                field,
                unit,
                device_class,
            } => write!(
                f,
                "unit `{}` of `{}` is unusual for device class `{}`",
                unit, field, device_class
            ),
            Self::UnrecognizedDescriptorType { field, kind } => {
                write!(f, "unknown command type `{}` for `{}`", kind, field)
            }
            Self::MalformedDescriptor {
                section,
                index,
                reason,
            } => write!(f, "{}[{}] is not a valid descriptor: {}", section, index, reason),
        }
    }
}

/// Builder output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryModel {
    pub set: DiscoverySet,
    pub warnings: Vec<DataQualityWarning>,
}

#[derive(Deserialize)]
struct RawSensor {
    field: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default, alias = "deviceClass")]
    device_class: Option<String>,
    #[serde(default, alias = "stateClass")]
    state_class: Option<String>,
    #[serde(default)]
    precision: Option<Value>,
    #[serde(default)]
    icon: Option<String>,
    #[serde(default, alias = "entityCategory")]
    entity_category: Option<String>,
}

#[derive(Deserialize)]
struct RawCommand {
    field: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    min: Option<f64>,
    #[serde(default)]
    max: Option<Value>,
    #[serde(default)]
    step: Option<f64>,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    options: Option<Vec<Value>>,
    #[serde(default, alias = "maxLength", alias = "max_length")]
    max_len: Option<Value>,
    #[serde(default)]
    icon: Option<String>,
    #[serde(default, alias = "entityCategory")]
    entity_category: Option<String>,
    #[serde(default, alias = "enabledByDefault")]
    enabled_by_default: Option<bool>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// Read a small non-negative integer from a number or numeric string.
fn lenient_u32(value: &Value) -> Option<u32> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (n.is_finite() && n >= 0.0 && n <= u32::MAX as f64).then(|| n.round() as u32)
}

fn lenient_f64(value: &Value) -> Option<f64> {
    let n: Option<f64> = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    n.filter(|n| n.is_finite())
}

/// First device class whose fragment occurs in `field` (case-sensitive).
pub fn infer_device_class(field: &str) -> Option<&'static str> {
    DEVICE_CLASS_RULES
        .iter()
        .find(|(fragment, _)| field.contains(fragment))
        .map(|(_, class)| *class)
}

/// Default unit for a device class, else for the first matching field fragment.
pub fn infer_unit(device_class: Option<&str>, field: &str) -> Option<&'static str> {
    if let Some(class) = device_class {
        if let Some((_, unit)) = UNIT_RULES.iter().find(|(key, _)| *key == class) {
            return Some(*unit);
        }
    }
    UNIT_RULES
        .iter()
        .find(|(fragment, _)| field.contains(fragment))
        .map(|(_, unit)| *unit)
}

/// Canonical spelling of temperature units; other units pass through trimmed.
pub fn normalize_unit(unit: &str) -> String {
    match unit.trim() {
        "C" | "c" | "°C" | "℃" => "°C".to_string(),
        "F" | "f" | "°F" | "℉" => "°F".to_string(),
        other => other.to_string(),
    }
}

/// Whether `unit` is expected for `device_class`. Unknown classes accept anything.
pub fn is_known_unit(device_class: &str, unit: &str) -> bool {
    KNOWN_UNITS
        .iter()
        .find(|(class, _)| *class == device_class)
        .map_or(true, |(_, units)| units.contains(&unit))
}

fn section_items<'a>(
    section: &'a Value,
    key: &'static str,
    model: &mut DiscoveryModel,
) -> &'a [Value] {
    match section.get(key) {
        Some(Value::Array(items)) => items,
        None | Some(Value::Null) => &[],
        Some(_) => {
            model.warnings.push(DataQualityWarning::MalformedDescriptor {
                section: key,
                index: 0,
                reason: "expected an array".to_string(),
            });
            &[]
        }
    }
}

fn build_sensor(raw: RawSensor, warnings: &mut Vec<DataQualityWarning>) -> SensorDescriptor {
    let device_class = non_empty(raw.device_class)
        .or_else(|| infer_device_class(&raw.field).map(str::to_string));

    let unit = match non_empty(raw.unit) {
        Some(unit) => Some(normalize_unit(&unit)),
        None => {
            let inferred = infer_unit(device_class.as_deref(), &raw.field).map(str::to_string);
            if inferred.is_none() {
                warnings.push(DataQualityWarning::MissingUnit {
                    field: raw.field.clone(),
                });
            }
            inferred
        }
    };

    if let (Some(unit), Some(class)) = (&unit, &device_class) {
        if !is_known_unit(class, unit) {
            warnings.push(DataQualityWarning::UnrecognizedUnit {
                field: raw.field.clone(),
                unit: unit.clone(),
                device_class: class.clone(),
            });
        }
    }

    SensorDescriptor {
        name: non_empty(raw.name),
        unit,
        device_class,
        state_class: non_empty(raw.state_class).unwrap_or_else(|| DEFAULT_STATE_CLASS.to_string()),
        precision: raw.precision.as_ref().and_then(lenient_u32),
        icon: non_empty(raw.icon),
        entity_category: non_empty(raw.entity_category),
        field: raw.field,
    }
}

fn build_command(
    raw: RawCommand,
    warnings: &mut Vec<DataQualityWarning>,
) -> Option<CommandDescriptor> {
    let Some(command_type) = CommandType::parse(raw.kind.trim()) else {
        warnings.push(DataQualityWarning::UnrecognizedDescriptorType {
            field: raw.field,
            kind: raw.kind,
        });
        return None;
    };

    // Text commands use `max` as their length limit.
    let (max, max_length) = match command_type {
        CommandType::Text => (
            None,
            raw.max_len
                .as_ref()
                .or(raw.max.as_ref())
                .and_then(lenient_u32),
        ),
        _ => (raw.max.as_ref().and_then(lenient_f64), None),
    };

    let options = raw
        .options
        .unwrap_or_default()
        .into_iter()
        .filter_map(|o| match o {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        })
        .collect();

    Some(CommandDescriptor {
        command_type,
        name: non_empty(raw.name),
        min: raw.min.filter(|n| n.is_finite()),
        max,
        step: raw.step.filter(|n| n.is_finite()),
        unit: non_empty(raw.unit).map(|u| normalize_unit(&u)),
        options,
        max_length,
        icon: non_empty(raw.icon),
        entity_category: non_empty(raw.entity_category),
        enabled_by_default: raw.enabled_by_default.unwrap_or(true),
        field: raw.field,
    })
}

/// Build descriptors from a raw discovery section (`{sensors: [...], commands: [...]}`).
pub fn build_discovery(section: &Value) -> DiscoveryModel {
    let mut model = DiscoveryModel::default();

    let sensors = section_items(section, "sensors", &mut model);
    for (index, item) in sensors.iter().enumerate() {
        match serde_json::from_value::<RawSensor>(item.clone()) {
            Ok(raw) => {
                let sensor = build_sensor(raw, &mut model.warnings);
                model.set.sensors.push(sensor);
            }
            Err(e) => model.warnings.push(DataQualityWarning::MalformedDescriptor {
                section: "sensors",
                index,
                reason: e.to_string(),
            }),
        }
    }

    let commands = section_items(section, "commands", &mut model);
    for (index, item) in commands.iter().enumerate() {
        match serde_json::from_value::<RawCommand>(item.clone()) {
            Ok(raw) => {
                if let Some(command) = build_command(raw, &mut model.warnings) {
                    model.set.commands.push(command);
                }
            }
            Err(e) => model.warnings.push(DataQualityWarning::MalformedDescriptor {
                section: "commands",
                index,
                reason: e.to_string(),
            }),
        }
    }

    model
}
