//! Bridge configuration.
//!
//! Configuration sources in priority order:
//! 1. an explicit TOML file (`--config <file>`)
//! 2. `chirpha.toml` in the working directory
//! 3. environment variables (fallback, compatible with the older bridge)

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Default values.
pub mod defaults {
    pub const BROKER_HOST: &str = "localhost";
    pub const BROKER_PORT: u16 = 1883;
    pub const KEEP_ALIVE_SECS: u64 = 60;
    pub const UPLINK_TOPIC: &str = "application/+/device/+/event/up";
    pub const DISCOVERY_PREFIX: &str = "homeassistant";
    pub const DOWNLINK_TOPIC: &str = "application/{application_id}/device/{dev_eui}/command/down";
    pub const LOG_LEVEL: &str = "info";
    pub const INFLUX_TIMEOUT_SECS: u64 = 5;
    pub const INFLUX_LOOKBACK_DAYS: u64 = 30;
    /// File picked up from the working directory when no `--config` is given.
    pub const CONFIG_FILE: &str = "chirpha.toml";
}

/// Environment variable names.
pub mod env_vars {
    pub const MQTT_BROKER_HOST: &str = "MQTT_BROKER_HOST";
    pub const MQTT_BROKER_PORT: &str = "MQTT_BROKER_PORT";
    pub const MQTT_USERNAME: &str = "MQTT_USERNAME";
    pub const MQTT_PASSWORD: &str = "MQTT_PASSWORD";
    pub const CHIRPSTACK_UPLINK_TOPIC: &str = "CHIRPSTACK_UPLINK_TOPIC";
    pub const HA_DISCOVERY_PREFIX: &str = "HA_DISCOVERY_PREFIX";
    pub const CHIRPSTACK_DOWNLINK_TOPIC: &str = "CHIRPSTACK_DOWNLINK_TOPIC";
    pub const LOG_LEVEL: &str = "LOG_LEVEL";

    pub const INFLUXDB_URL: &str = "INFLUXDB_URL";
    pub const INFLUXDB_API_VERSION: &str = "INFLUXDB_API_VERSION";
    pub const INFLUXDB_TOKEN: &str = "INFLUXDB_TOKEN";
    pub const INFLUXDB_ORG: &str = "INFLUXDB_ORG";
    pub const INFLUXDB_BUCKET: &str = "INFLUXDB_BUCKET";
    pub const INFLUXDB_DATABASE: &str = "INFLUXDB_DATABASE";
    pub const INFLUXDB_USERNAME: &str = "INFLUXDB_USERNAME";
    pub const INFLUXDB_PASSWORD: &str = "INFLUXDB_PASSWORD";
    pub const INFLUXDB_TAGS: &str = "INFLUXDB_TAGS";
    pub const INFLUXDB_INCLUDE_ENTITIES: &str = "INFLUXDB_INCLUDE_ENTITIES";
    pub const INFLUXDB_EXCLUDE_ENTITIES: &str = "INFLUXDB_EXCLUDE_ENTITIES";
    pub const INFLUXDB_INCLUDE_DOMAINS: &str = "INFLUXDB_INCLUDE_DOMAINS";
    pub const INFLUXDB_EXCLUDE_DOMAINS: &str = "INFLUXDB_EXCLUDE_DOMAINS";
    pub const INFLUXDB_TIMEOUT_SECS: &str = "INFLUXDB_TIMEOUT_SECS";
    pub const INFLUXDB_LOOKBACK_DAYS: &str = "INFLUXDB_LOOKBACK_DAYS";
}

const REDACTED: &str = "***";

/// Top-level bridge configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub mqtt: MqttSettings,
    #[serde(default)]
    pub discovery: DiscoverySettings,
    #[serde(default)]
    pub downlink: DownlinkSettings,
    /// Time-series backend; reconciliation is disabled when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub influxdb: Option<InfluxSettings>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttSettings {
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Client id; a random one is generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default = "default_uplink_topic")]
    pub uplink_topic: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

/// Discovery announcement settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverySettings {
    #[serde(default = "default_discovery_prefix")]
    pub prefix: String,
}

/// Command topic settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownlinkSettings {
    /// Template with `{application_id}` and `{dev_eui}` placeholders.
    #[serde(default = "default_downlink_topic")]
    pub topic_template: String,
}

/// InfluxDB protocol variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InfluxApiVersion {
    /// Database-addressed (`/write`, `/query`).
    V1,
    /// Bucket/org/token-addressed (`/api/v2/write`, `/api/v2/query`).
    #[default]
    V2,
}

impl std::str::FromStr for InfluxApiVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "1" | "v1" => Ok(Self::V1),
            "2" | "v2" => Ok(Self::V2),
            other => Err(Error::config(format!("unknown InfluxDB API version: {}", other))),
        }
    }
}

/// Time-series backend settings, consumed by the reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfluxSettings {
    pub url: String,
    #[serde(default)]
    pub api_version: InfluxApiVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_policy: Option<String>,
    /// Measurement name used for every point instead of the unit/entity id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measurement: Option<String>,
    /// Static tags added to every point.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub include_entities: Vec<String>,
    #[serde(default)]
    pub exclude_entities: Vec<String>,
    #[serde(default)]
    pub include_domains: Vec<String>,
    #[serde(default)]
    pub exclude_domains: Vec<String>,
    #[serde(default = "default_influx_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u64,
}

fn default_log_level() -> String {
    defaults::LOG_LEVEL.to_string()
}

fn default_broker_host() -> String {
    defaults::BROKER_HOST.to_string()
}

fn default_broker_port() -> u16 {
    defaults::BROKER_PORT
}

fn default_uplink_topic() -> String {
    defaults::UPLINK_TOPIC.to_string()
}

fn default_keep_alive() -> u64 {
    defaults::KEEP_ALIVE_SECS
}

fn default_discovery_prefix() -> String {
    defaults::DISCOVERY_PREFIX.to_string()
}

fn default_downlink_topic() -> String {
    defaults::DOWNLINK_TOPIC.to_string()
}

fn default_influx_timeout() -> u64 {
    defaults::INFLUX_TIMEOUT_SECS
}

fn default_lookback_days() -> u64 {
    defaults::INFLUX_LOOKBACK_DAYS
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            username: None,
            password: None,
            client_id: None,
            uplink_topic: default_uplink_topic(),
            keep_alive_secs: default_keep_alive(),
        }
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            prefix: default_discovery_prefix(),
        }
    }
}

impl Default for DownlinkSettings {
    fn default() -> Self {
        Self {
            topic_template: default_downlink_topic(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttSettings::default(),
            discovery: DiscoverySettings::default(),
            downlink: DownlinkSettings::default(),
            influxdb: None,
            log_level: default_log_level(),
        }
    }
}

impl InfluxSettings {
    /// Settings for a v2 server with everything else defaulted.
    pub fn v2(
        url: impl Into<String>,
        org: impl Into<String>,
        bucket: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            api_version: InfluxApiVersion::V2,
            token: Some(token.into()),
            org: Some(org.into()),
            bucket: Some(bucket.into()),
            database: None,
            username: None,
            password: None,
            retention_policy: None,
            measurement: None,
            tags: BTreeMap::new(),
            include_entities: Vec::new(),
            exclude_entities: Vec::new(),
            include_domains: Vec::new(),
            exclude_domains: Vec::new(),
            timeout_secs: defaults::INFLUX_TIMEOUT_SECS,
            lookback_days: defaults::INFLUX_LOOKBACK_DAYS,
        }
    }

    /// Settings for a v1 server with everything else defaulted.
    pub fn v1(url: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            api_version: InfluxApiVersion::V1,
            token: None,
            org: None,
            bucket: None,
            database: Some(database.into()),
            ..Self::v2(url, "", "", "")
        }
    }

    /// Per-request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Window searched for the last persisted value.
    pub fn lookback(&self) -> Duration {
        Duration::from_secs(self.lookback_days * 24 * 60 * 60)
    }

    fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(Error::config("influxdb.url must not be empty"));
        }
        match self.api_version {
            InfluxApiVersion::V2 => {
                if is_blank(&self.bucket) || is_blank(&self.org) {
                    return Err(Error::config(
                        "influxdb v2 requires both `bucket` and `org`",
                    ));
                }
            }
            InfluxApiVersion::V1 => {
                if is_blank(&self.database) {
                    return Err(Error::config("influxdb v1 requires `database`"));
                }
            }
        }
        Ok(())
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map(str::trim).unwrap_or("").is_empty()
}

impl BridgeConfig {
    /// Load from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Parse TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable lookup.
    ///
    /// Unset or empty variables fall back to defaults. The `influxdb` section
    /// is only produced when `INFLUXDB_URL` is set.
    pub fn from_env_with<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let list = |key: &str| get(key).map(|v| split_list(&v)).unwrap_or_default();

        let port = match get(env_vars::MQTT_BROKER_PORT) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| Error::config(format!("invalid MQTT_BROKER_PORT: {}", raw)))?,
            None => defaults::BROKER_PORT,
        };

        let mqtt = MqttSettings {
            host: get(env_vars::MQTT_BROKER_HOST).unwrap_or_else(default_broker_host),
            port,
            username: get(env_vars::MQTT_USERNAME),
            password: get(env_vars::MQTT_PASSWORD),
            client_id: None,
            uplink_topic: get(env_vars::CHIRPSTACK_UPLINK_TOPIC)
                .unwrap_or_else(default_uplink_topic),
            keep_alive_secs: defaults::KEEP_ALIVE_SECS,
        };

        let influxdb = match get(env_vars::INFLUXDB_URL) {
            Some(url) => {
                let api_version = match get(env_vars::INFLUXDB_API_VERSION) {
                    Some(raw) => raw.parse()?,
                    None => InfluxApiVersion::default(),
                };
                Some(InfluxSettings {
                    url,
                    api_version,
                    token: get(env_vars::INFLUXDB_TOKEN),
                    org: get(env_vars::INFLUXDB_ORG),
                    bucket: get(env_vars::INFLUXDB_BUCKET),
                    database: get(env_vars::INFLUXDB_DATABASE),
                    username: get(env_vars::INFLUXDB_USERNAME),
                    password: get(env_vars::INFLUXDB_PASSWORD),
                    retention_policy: None,
                    measurement: None,
                    tags: get(env_vars::INFLUXDB_TAGS)
                        .map(|v| parse_tags(&v))
                        .transpose()?
                        .unwrap_or_default(),
                    include_entities: list(env_vars::INFLUXDB_INCLUDE_ENTITIES),
                    exclude_entities: list(env_vars::INFLUXDB_EXCLUDE_ENTITIES),
                    include_domains: list(env_vars::INFLUXDB_INCLUDE_DOMAINS),
                    exclude_domains: list(env_vars::INFLUXDB_EXCLUDE_DOMAINS),
                    timeout_secs: get(env_vars::INFLUXDB_TIMEOUT_SECS)
                        .and_then(|s| s.trim().parse().ok())
                        .unwrap_or(defaults::INFLUX_TIMEOUT_SECS),
                    lookback_days: get(env_vars::INFLUXDB_LOOKBACK_DAYS)
                        .and_then(|s| s.trim().parse().ok())
                        .unwrap_or(defaults::INFLUX_LOOKBACK_DAYS),
                })
            }
            None => None,
        };

        Ok(Self {
            mqtt,
            discovery: DiscoverySettings {
                prefix: get(env_vars::HA_DISCOVERY_PREFIX)
                    .unwrap_or_else(default_discovery_prefix),
            },
            downlink: DownlinkSettings {
                topic_template: get(env_vars::CHIRPSTACK_DOWNLINK_TOPIC)
                    .unwrap_or_else(default_downlink_topic),
            },
            influxdb,
            log_level: get(env_vars::LOG_LEVEL)
                .map(|v| v.to_lowercase())
                .unwrap_or_else(default_log_level),
        })
    }

    /// Resolve configuration from the best available source and validate it.
    ///
    /// Priority: explicit file > `chirpha.toml` > environment.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let config = match Self::detect_source(explicit) {
            Some(path) => {
                info!(category = "config", "Loading config from: {}", path.display());
                Self::from_file(&path)?
            }
            None => {
                info!(category = "config", "Loading config from environment variables");
                Self::from_env()?
            }
        };
        config.validate()?;
        Ok(config)
    }

    fn detect_source(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        let local = PathBuf::from(defaults::CONFIG_FILE);
        local.is_file().then_some(local)
    }

    /// Reject configurations the bridge cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.mqtt.host.trim().is_empty() {
            return Err(Error::config("mqtt.host must not be empty"));
        }
        if self.mqtt.uplink_topic.trim().is_empty() {
            return Err(Error::config("mqtt.uplink_topic must not be empty"));
        }
        if self.discovery.prefix.trim().is_empty() {
            return Err(Error::config("discovery.prefix must not be empty"));
        }
        if let Some(influx) = &self.influxdb {
            influx.validate()?;
        }
        Ok(())
    }

    /// Copy with every secret replaced, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.mqtt.password.is_some() {
            copy.mqtt.password = Some(REDACTED.to_string());
        }
        if let Some(influx) = copy.influxdb.as_mut() {
            if influx.token.is_some() {
                influx.token = Some(REDACTED.to_string());
            }
            if influx.password.is_some() {
                influx.password = Some(REDACTED.to_string());
            }
        }
        copy
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `k=v,k=v` into a tag map.
fn parse_tags(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut tags = BTreeMap::new();
    for pair in split_list(raw) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| Error::config(format!("invalid tag `{}`, expected key=value", pair)))?;
        tags.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(tags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_env_defaults() {
        let config = BridgeConfig::from_env_with(lookup(&[])).unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.discovery.prefix, "homeassistant");
        assert!(config.influxdb.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let config = BridgeConfig::from_env_with(lookup(&[
            ("MQTT_BROKER_HOST", "broker.lan"),
            ("MQTT_BROKER_PORT", "8883"),
            ("MQTT_USERNAME", "bridge"),
            ("HA_DISCOVERY_PREFIX", "ha"),
            ("LOG_LEVEL", "DEBUG"),
            ("INFLUXDB_URL", "http://influx:8086"),
            ("INFLUXDB_API_VERSION", "1"),
            ("INFLUXDB_DATABASE", "lora"),
            ("INFLUXDB_TAGS", "site=north, source=lora"),
            ("INFLUXDB_EXCLUDE_ENTITIES", "sensor.a, sensor.b"),
        ]))
        .unwrap();

        assert_eq!(config.mqtt.host, "broker.lan");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.username.as_deref(), Some("bridge"));
        assert_eq!(config.discovery.prefix, "ha");
        assert_eq!(config.log_level, "debug");

        let influx = config.influxdb.unwrap();
        assert_eq!(influx.api_version, InfluxApiVersion::V1);
        assert_eq!(influx.database.as_deref(), Some("lora"));
        assert_eq!(influx.tags.get("site").map(String::as_str), Some("north"));
        assert_eq!(influx.exclude_entities, vec!["sensor.a", "sensor.b"]);
        assert_eq!(influx.timeout(), Duration::from_secs(5));
        assert_eq!(influx.lookback(), Duration::from_secs(30 * 86_400));
    }

    #[test]
    fn test_env_invalid_port() {
        let result = BridgeConfig::from_env_with(lookup(&[("MQTT_BROKER_PORT", "abc")]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_env_invalid_tags() {
        let result = BridgeConfig::from_env_with(lookup(&[
            ("INFLUXDB_URL", "http://influx:8086"),
            ("INFLUXDB_TAGS", "novalue"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_toml_partial_sections() {
        let config = BridgeConfig::from_toml(
            r#"
            log_level = "warn"

            [mqtt]
            host = "10.0.0.2"

            [influxdb]
            url = "http://localhost:8086"
            org = "home"
            bucket = "lora"
            token = "secret"
            tags = { site = "barn" }
            "#,
        )
        .unwrap();

        assert_eq!(config.mqtt.host, "10.0.0.2");
        assert_eq!(config.mqtt.uplink_topic, defaults::UPLINK_TOPIC);
        assert_eq!(config.downlink.topic_template, defaults::DOWNLINK_TOPIC);
        let influx = config.influxdb.as_ref().unwrap();
        assert_eq!(influx.api_version, InfluxApiVersion::V2);
        assert_eq!(influx.lookback_days, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_incomplete_backend() {
        let mut config = BridgeConfig::default();
        config.influxdb = Some(InfluxSettings::v2("http://localhost:8086", "", "lora", "t"));
        assert!(config.validate().is_err());

        config.influxdb = Some(InfluxSettings {
            database: None,
            ..InfluxSettings::v1("http://localhost:8086", "x")
        });
        assert!(config.validate().is_err());

        config.influxdb = Some(InfluxSettings::v1("http://localhost:8086", "lora"));
        assert!(config.validate().is_ok());

        config.discovery.prefix = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redacted_hides_secrets() {
        let mut config = BridgeConfig::default();
        config.mqtt.password = Some("hunter2".to_string());
        config.influxdb = Some(InfluxSettings::v2("http://x", "o", "b", "tok"));

        let shown = config.redacted().to_toml().unwrap();
        assert!(!shown.contains("hunter2"));
        assert!(!shown.contains("tok\""));
        assert!(shown.contains("***"));
    }

    #[test]
    fn test_api_version_parse() {
        assert_eq!("v1".parse::<InfluxApiVersion>().unwrap(), InfluxApiVersion::V1);
        assert_eq!("2".parse::<InfluxApiVersion>().unwrap(), InfluxApiVersion::V2);
        assert!("3".parse::<InfluxApiVersion>().is_err());
    }
}
