//! Entities materialized from discovery descriptors.
//!
//! Each entity has a fixed kind and a fully typed attribute set per kind.
//! Values written before the host attaches a state sink are held as pending
//! and flushed once on attachment.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::discovery::{CommandDescriptor, CommandType, SensorDescriptor};
use crate::downlink::{
    press_payload, render_topic, switch_payload, templated_payload, DownlinkRequest,
};
use crate::hass_discovery::{json_number, unique_id, DEFAULT_NUMBER_MAX, DEFAULT_TEXT_MAX};

/// Entity kinds, one callback bus each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Sensor,
    Button,
    Number,
    Select,
    Switch,
    Text,
}

impl EntityKind {
    /// Dispatch order.
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Sensor,
        EntityKind::Button,
        EntityKind::Number,
        EntityKind::Select,
        EntityKind::Switch,
        EntityKind::Text,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Sensor => "sensor",
            EntityKind::Button => "button",
            EntityKind::Number => "number",
            EntityKind::Select => "select",
            EntityKind::Switch => "switch",
            EntityKind::Text => "text",
        }
    }
}

impl From<CommandType> for EntityKind {
    fn from(t: CommandType) -> Self {
        match t {
            CommandType::Button => EntityKind::Button,
            CommandType::Number => EntityKind::Number,
            CommandType::Select => EntityKind::Select,
            CommandType::Switch => EntityKind::Switch,
            CommandType::Text => EntityKind::Text,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = chirpha_core::Error;

    fn from_str(s: &str) -> chirpha_core::Result<Self> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| chirpha_core::Error::validation(format!("unknown entity kind: {s}")))
    }
}

/// Presentation attributes shared by every kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommonAttributes {
    pub icon: Option<String>,
    pub entity_category: Option<String>,
    pub enabled_by_default: bool,
}

/// Kind-specific attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EntityAttributes {
    Sensor {
        unit: Option<String>,
        device_class: Option<String>,
        state_class: String,
        precision: Option<u32>,
    },
    Button,
    Number {
        min: f64,
        max: f64,
        step: f64,
        unit: Option<String>,
    },
    Select {
        options: Vec<String>,
    },
    Switch,
    Text {
        max_length: u32,
    },
}

impl EntityAttributes {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityAttributes::Sensor { .. } => EntityKind::Sensor,
            EntityAttributes::Button => EntityKind::Button,
            EntityAttributes::Number { .. } => EntityKind::Number,
            EntityAttributes::Select { .. } => EntityKind::Select,
            EntityAttributes::Switch => EntityKind::Switch,
            EntityAttributes::Text { .. } => EntityKind::Text,
        }
    }

    pub fn from_sensor(sensor: &SensorDescriptor) -> (Self, CommonAttributes) {
        (
            EntityAttributes::Sensor {
                unit: sensor.unit.clone(),
                device_class: sensor.device_class.clone(),
                state_class: sensor.state_class.clone(),
                precision: sensor.precision,
            },
            CommonAttributes {
                icon: sensor.icon.clone(),
                entity_category: sensor.entity_category.clone(),
                enabled_by_default: true,
            },
        )
    }

    pub fn from_command(command: &CommandDescriptor) -> (Self, CommonAttributes) {
        let attributes = match command.command_type {
            CommandType::Button => EntityAttributes::Button,
            CommandType::Number => EntityAttributes::Number {
                min: command.min.unwrap_or(0.0),
                max: command.max.unwrap_or(DEFAULT_NUMBER_MAX),
                step: command.step.unwrap_or(1.0),
                unit: command.unit.clone(),
            },
            CommandType::Select => EntityAttributes::Select {
                options: command.options.clone(),
            },
            CommandType::Switch => EntityAttributes::Switch,
            CommandType::Text => EntityAttributes::Text {
                max_length: command.max_length.unwrap_or(DEFAULT_TEXT_MAX),
            },
        };
        (
            attributes,
            CommonAttributes {
                icon: command.icon.clone(),
                entity_category: command.entity_category.clone(),
                enabled_by_default: command.enabled_by_default,
            },
        )
    }

    /// Reads this kind's state from an uplink payload value.
    ///
    /// Buttons are stateless; nulls never produce a state.
    pub fn value_from_payload(&self, raw: &Value) -> Option<EntityValue> {
        if raw.is_null() {
            return None;
        }
        match self {
            EntityAttributes::Sensor { .. } => Some(EntityValue::Sensor(raw.clone())),
            EntityAttributes::Button => None,
            EntityAttributes::Number { .. } => match raw {
                Value::Number(n) => n.as_f64().map(EntityValue::Number),
                Value::String(s) => s.trim().parse().ok().map(EntityValue::Number),
                _ => None,
            },
            EntityAttributes::Select { .. } => scalar_text(raw).map(EntityValue::Select),
            EntityAttributes::Switch => match raw {
                Value::Bool(b) => Some(EntityValue::Switch(*b)),
                Value::Number(n) => n.as_f64().map(|v| EntityValue::Switch(v != 0.0)),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "on" | "true" | "1" => Some(EntityValue::Switch(true)),
                    "off" | "false" | "0" => Some(EntityValue::Switch(false)),
                    _ => None,
                },
                _ => None,
            },
            EntityAttributes::Text { .. } => scalar_text(raw).map(EntityValue::Text),
        }
    }
}

fn scalar_text(raw: &Value) -> Option<String> {
    match raw {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Current state of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityValue {
    Sensor(Value),
    Number(f64),
    Select(String),
    Switch(bool),
    Text(String),
}

impl EntityValue {
    pub fn to_json(&self) -> Value {
        match self {
            EntityValue::Sensor(v) => v.clone(),
            EntityValue::Number(n) => json_number(*n),
            EntityValue::Select(s) | EntityValue::Text(s) => Value::String(s.clone()),
            EntityValue::Switch(on) => Value::String(if *on { "on" } else { "off" }.to_string()),
        }
    }
}

/// Host-side receiver of state writes.
pub trait StateSink: Send + Sync {
    fn write_state(&self, unique_id: &str, entity_id: &str, value: &EntityValue);
}

/// Host-side action on a command entity.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandAction {
    Press,
    SetValue(f64),
    SelectOption(String),
    TurnOn,
    TurnOff,
    SetText(String),
}

impl CommandAction {
    pub fn name(&self) -> &'static str {
        match self {
            CommandAction::Press => "press",
            CommandAction::SetValue(_) => "set_value",
            CommandAction::SelectOption(_) => "select_option",
            CommandAction::TurnOn => "turn_on",
            CommandAction::TurnOff => "turn_off",
            CommandAction::SetText(_) => "set_text",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CommandError {
    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    #[error("{kind} entity {unique_id} does not support {action}")]
    NotSupported {
        unique_id: String,
        kind: EntityKind,
        action: &'static str,
    },

    #[error("Value {value} outside [{min}, {max}]")]
    OutOfRange { value: f64, min: f64, max: f64 },

    #[error("Invalid option '{option}', expected one of {options:?}")]
    InvalidOption { option: String, options: Vec<String> },

    #[error("Text is {len} characters, limit is {max}")]
    TooLong { len: usize, max: u32 },

    #[error("Downlink failed: {0}")]
    Downlink(String),
}

impl From<CommandError> for chirpha_core::Error {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::UnknownEntity(id) => chirpha_core::Error::NotFound(id),
            CommandError::Downlink(s) => chirpha_core::Error::Transport(s),
            other => chirpha_core::Error::Validation(other.to_string()),
        }
    }
}

/// Lowercase ASCII slug, runs of anything else collapsed to `_`.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_sep = false;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('_');
            }
            pending_sep = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    slug
}

/// Read-only view of an entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntitySnapshot {
    pub unique_id: String,
    pub entity_id: String,
    pub display_name: String,
    pub dev_eui: String,
    pub field: String,
    pub kind: EntityKind,
    pub attributes: EntityAttributes,
    pub current: Option<EntityValue>,
    pub pending: Option<EntityValue>,
    pub attached: bool,
}

pub struct Entity {
    unique_id: String,
    entity_id: String,
    display_name: String,
    dev_eui: String,
    application_id: String,
    field: String,
    attributes: EntityAttributes,
    common: CommonAttributes,
    current: Option<EntityValue>,
    pending: Option<EntityValue>,
    sink: Option<Arc<dyn StateSink>>,
}

impl Entity {
    /// Creates an unattached entity.
    ///
    /// `device_name` is the composed device display name; the entity id is
    /// derived from the full display name once and then kept stable.
    pub fn new(
        dev_eui: &str,
        application_id: &str,
        device_name: &str,
        field: &str,
        label: &str,
        attributes: EntityAttributes,
        common: CommonAttributes,
    ) -> Self {
        let unique_id = unique_id(dev_eui, field);
        let display_name = format!("{} {}", device_name, label);
        let mut object_id = slugify(&display_name);
        if object_id.is_empty() {
            object_id = slugify(&unique_id);
        }
        Self {
            entity_id: format!("{}.{}", attributes.kind(), object_id),
            unique_id,
            display_name,
            dev_eui: dev_eui.to_string(),
            application_id: application_id.to_string(),
            field: field.to_string(),
            attributes,
            common,
            current: None,
            pending: None,
            sink: None,
        }
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Part of the entity id after the domain.
    pub fn object_id(&self) -> &str {
        self.entity_id
            .split_once('.')
            .map(|(_, object)| object)
            .unwrap_or(&self.entity_id)
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn dev_eui(&self) -> &str {
        &self.dev_eui
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn kind(&self) -> EntityKind {
        self.attributes.kind()
    }

    pub fn attributes(&self) -> &EntityAttributes {
        &self.attributes
    }

    pub fn common(&self) -> &CommonAttributes {
        &self.common
    }

    pub fn current(&self) -> Option<&EntityValue> {
        self.current.as_ref()
    }

    pub fn pending(&self) -> Option<&EntityValue> {
        self.pending.as_ref()
    }

    pub fn is_attached(&self) -> bool {
        self.sink.is_some()
    }

    /// Applies a re-sighted descriptor. Identity and entity id stay as they are.
    pub fn refresh(
        &mut self,
        device_name: &str,
        label: &str,
        application_id: &str,
        attributes: EntityAttributes,
        common: CommonAttributes,
    ) {
        self.display_name = format!("{} {}", device_name, label);
        self.application_id = application_id.to_string();
        self.attributes = attributes;
        self.common = common;
    }

    /// Stores a new value. Returns `false` when it was buffered as pending.
    pub fn update_value(&mut self, value: EntityValue) -> bool {
        self.current = Some(value.clone());
        match &self.sink {
            Some(sink) => {
                sink.write_state(&self.unique_id, &self.entity_id, &value);
                true
            }
            None => {
                self.pending = Some(value);
                false
            }
        }
    }

    /// Attaches the host sink and flushes the pending value, if any.
    ///
    /// Returns whether a pending value was flushed.
    pub fn attach(&mut self, sink: Arc<dyn StateSink>) -> bool {
        let flushed = match self.pending.take() {
            Some(value) => {
                sink.write_state(&self.unique_id, &self.entity_id, &value);
                true
            }
            None => false,
        };
        self.sink = Some(sink);
        flushed
    }

    /// Validates a host action, updates local state, and builds the downlink.
    pub fn apply_command(
        &mut self,
        action: CommandAction,
        topic_template: &str,
    ) -> Result<DownlinkRequest, CommandError> {
        let (payload, state) = match (&self.attributes, &action) {
            (EntityAttributes::Button, CommandAction::Press) => (press_payload(&self.field), None),
            (EntityAttributes::Number { min, max, .. }, CommandAction::SetValue(value)) => {
                if !value.is_finite() || value < min || value > max {
                    return Err(CommandError::OutOfRange {
                        value: *value,
                        min: *min,
                        max: *max,
                    });
                }
                (
                    templated_payload(&self.field, &json_number(*value)),
                    Some(EntityValue::Number(*value)),
                )
            }
            (EntityAttributes::Select { options }, CommandAction::SelectOption(option)) => {
                if !options.contains(option) {
                    return Err(CommandError::InvalidOption {
                        option: option.clone(),
                        options: options.clone(),
                    });
                }
                (
                    templated_payload(&self.field, &Value::String(option.clone())),
                    Some(EntityValue::Select(option.clone())),
                )
            }
            (EntityAttributes::Switch, CommandAction::TurnOn) => (
                switch_payload(&self.field, true),
                Some(EntityValue::Switch(true)),
            ),
            (EntityAttributes::Switch, CommandAction::TurnOff) => (
                switch_payload(&self.field, false),
                Some(EntityValue::Switch(false)),
            ),
            (EntityAttributes::Text { max_length }, CommandAction::SetText(text)) => {
                let len = text.chars().count();
                if len > *max_length as usize {
                    return Err(CommandError::TooLong {
                        len,
                        max: *max_length,
                    });
                }
                (
                    templated_payload(&self.field, &Value::String(text.clone())),
                    Some(EntityValue::Text(text.clone())),
                )
            }
            _ => {
                return Err(CommandError::NotSupported {
                    unique_id: self.unique_id.clone(),
                    kind: self.kind(),
                    action: action.name(),
                })
            }
        };

        if let Some(state) = state {
            self.update_value(state);
        }

        Ok(DownlinkRequest {
            dev_eui: self.dev_eui.clone(),
            application_id: self.application_id.clone(),
            unique_id: self.unique_id.clone(),
            topic: render_topic(topic_template, &self.application_id, &self.dev_eui),
            payload,
        })
    }

    pub fn snapshot(&self) -> EntitySnapshot {
        EntitySnapshot {
            unique_id: self.unique_id.clone(),
            entity_id: self.entity_id.clone(),
            display_name: self.display_name.clone(),
            dev_eui: self.dev_eui.clone(),
            field: self.field.clone(),
            kind: self.kind(),
            attributes: self.attributes.clone(),
            current: self.current.clone(),
            pending: self.pending.clone(),
            attached: self.is_attached(),
        }
    }
}
