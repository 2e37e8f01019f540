//! Series model shared by every backend.
//!
//! A series is addressed by `(measurement, domain, entity_id)`. Values are
//! normalized into [`SampleValue`] before they are compared or written so
//! that `"21.5"`, `21.5` and `21.5000000001` all land on the same footing.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Two numeric samples closer than this are the same reading.
pub const VALUE_TOLERANCE: f64 = 1e-6;

/// Field holding numeric samples.
pub const FIELD_VALUE: &str = "value";
/// Field holding non-numeric samples.
pub const FIELD_STATE: &str = "state";

/// Tag carrying the entity domain (`sensor`, `number`, ...).
pub const TAG_DOMAIN: &str = "domain";
/// Tag carrying the entity object id without the domain.
pub const TAG_ENTITY_ID: &str = "entity_id";

/// A normalized sample value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleValue {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl SampleValue {
    /// Normalize a JSON value.
    ///
    /// Numbers and numeric strings become [`SampleValue::Number`]. Null,
    /// arrays and objects have no sample representation.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_f64().filter(|f| f.is_finite()).map(Self::Number),
            serde_json::Value::String(s) => Some(Self::from_text(s)),
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            _ => None,
        }
    }

    /// Normalize a raw string, preferring a numeric reading.
    pub fn from_text(raw: &str) -> Self {
        match raw.trim().parse::<f64>() {
            Ok(n) if n.is_finite() => Self::Number(n),
            _ => Self::Text(raw.to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Number(_))
    }

    /// Whether `self` is a different reading than `other`.
    ///
    /// Numbers compare with [`VALUE_TOLERANCE`]; everything else compares by
    /// strict equality, and a number never equals a non-number.
    pub fn differs(&self, other: &SampleValue) -> bool {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => (a - b).abs() > VALUE_TOLERANCE,
            (a, b) => a != b,
        }
    }

    /// Like [`SampleValue::differs`], with an unknown previous value always differing.
    pub fn differs_from(&self, previous: Option<&SampleValue>) -> bool {
        previous.map_or(true, |p| self.differs(p))
    }

    /// Field name this value is written under.
    pub fn field_name(&self) -> &'static str {
        if self.is_numeric() {
            FIELD_VALUE
        } else {
            FIELD_STATE
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Number(n) => serde_json::json!(n),
            Self::Bool(b) => serde_json::json!(b),
            Self::Text(s) => serde_json::json!(s),
        }
    }
}

impl std::fmt::Display for SampleValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Address of one series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    pub measurement: String,
    pub domain: String,
    pub entity_id: String,
}

impl SeriesKey {
    pub fn new(
        measurement: impl Into<String>,
        domain: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            measurement: measurement.into(),
            domain: domain.into(),
            entity_id: entity_id.into(),
        }
    }
}

/// A point to be written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WritePoint {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub value: SampleValue,
    /// Unix seconds.
    pub timestamp: i64,
}

impl WritePoint {
    /// Point for a series, tagged with its domain and entity id.
    pub fn for_series(key: &SeriesKey, value: SampleValue, timestamp: i64) -> Self {
        let mut tags = BTreeMap::new();
        tags.insert(TAG_DOMAIN.to_string(), key.domain.clone());
        tags.insert(TAG_ENTITY_ID.to_string(), key.entity_id.clone());
        Self {
            measurement: key.measurement.clone(),
            tags,
            value,
            timestamp,
        }
    }

    /// Add static tags. Series tags are never overridden.
    pub fn with_tags<'a>(
        mut self,
        tags: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> Self {
        for (key, value) in tags {
            self.tags
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        self
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Whether the point belongs to `key`.
    pub fn matches(&self, key: &SeriesKey) -> bool {
        self.measurement == key.measurement
            && self.tag(TAG_DOMAIN) == Some(key.domain.as_str())
            && self.tag(TAG_ENTITY_ID) == Some(key.entity_id.as_str())
    }

    /// Render as one line of InfluxDB line protocol with second precision.
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape_measurement(&self.measurement);
        for (key, value) in &self.tags {
            // Empty tag values are rejected by the server.
            if value.is_empty() {
                continue;
            }
            let _ = write!(line, ",{}={}", escape_tag(key), escape_tag(value));
        }
        let field = match &self.value {
            SampleValue::Number(n) => format!("{}={}", FIELD_VALUE, n),
            SampleValue::Bool(b) => format!("{}={}", FIELD_STATE, b),
            SampleValue::Text(s) => format!("{}=\"{}\"", FIELD_STATE, escape_field_string(s)),
        };
        let _ = write!(line, " {} {}", field, self.timestamp);
        line
    }
}

/// Render a batch as a newline-separated line protocol body.
pub fn to_line_protocol(points: &[WritePoint]) -> String {
    points
        .iter()
        .map(WritePoint::to_line_protocol)
        .collect::<Vec<_>>()
        .join("\n")
}

fn escape_measurement(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace(' ', "\\ ")
}

fn escape_tag(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

fn escape_field_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// A time-series store the reconciler can read from and append to.
#[async_trait]
pub trait TimeSeriesBackend: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Most recent sample of `key` no older than `lookback`.
    async fn query_last_value(
        &self,
        key: &SeriesKey,
        lookback: Duration,
    ) -> Result<Option<SampleValue>>;

    /// Write all points in one request.
    async fn write_points(&self, points: &[WritePoint]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalization() {
        assert_eq!(SampleValue::from_json(&json!(21.5)), Some(SampleValue::Number(21.5)));
        assert_eq!(SampleValue::from_json(&json!("21.5")), Some(SampleValue::Number(21.5)));
        assert_eq!(SampleValue::from_json(&json!(" 7 ")), Some(SampleValue::Number(7.0)));
        assert_eq!(
            SampleValue::from_json(&json!("open")),
            Some(SampleValue::Text("open".to_string()))
        );
        assert_eq!(
            SampleValue::from_json(&json!("NaN")),
            Some(SampleValue::Text("NaN".to_string()))
        );
        assert_eq!(SampleValue::from_json(&json!(true)), Some(SampleValue::Bool(true)));
        assert_eq!(SampleValue::from_json(&json!(null)), None);
        assert_eq!(SampleValue::from_json(&json!({"a": 1})), None);
    }

    #[test]
    fn test_differs_uses_tolerance_for_numbers() {
        let last = SampleValue::Number(21.50);
        assert!(!SampleValue::Number(21.5000003).differs(&last));
        assert!(SampleValue::Number(21.6).differs(&last));
        assert!(SampleValue::Number(21.5).differs(&SampleValue::Text("21.5x".into())));
        assert!(!SampleValue::Text("on".into()).differs(&SampleValue::Text("on".into())));
        assert!(SampleValue::Text("on".into()).differs_from(None));
    }

    #[test]
    fn test_line_protocol_escaping() {
        let key = SeriesKey::new("°C", "sensor", "site_tank1 temp");
        let mut static_tags = BTreeMap::new();
        static_tags.insert("site".to_string(), "north,barn".to_string());
        static_tags.insert("domain".to_string(), "ignored".to_string());
        static_tags.insert("empty".to_string(), String::new());

        let point = WritePoint::for_series(&key, SampleValue::Number(21.5), 1_700_000_000)
            .with_tags(&static_tags);
        assert_eq!(
            point.to_line_protocol(),
            "°C,domain=sensor,entity_id=site_tank1\\ temp,site=north\\,barn value=21.5 1700000000"
        );

        let text = WritePoint::for_series(&key, SampleValue::Text("say \"hi\"".into()), 5);
        assert!(text.to_line_protocol().ends_with(" state=\"say \\\"hi\\\"\" 5"));

        let flag = WritePoint::for_series(&key, SampleValue::Bool(false), 5);
        assert!(flag.to_line_protocol().ends_with(" state=false 5"));
    }

    #[test]
    fn test_point_matches_series() {
        let key = SeriesKey::new("kg", "sensor", "scale_weight");
        let point = WritePoint::for_series(&key, SampleValue::Number(1.0), 0);
        assert!(point.matches(&key));
        assert!(!point.matches(&SeriesKey::new("kg", "number", "scale_weight")));
    }
}
