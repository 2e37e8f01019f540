//! Time-series reconciliation of embedded history.
//!
//! For measurement sensors, history samples carried by an uplink are replayed
//! against the last persisted value and only real changes are appended. Every
//! event re-reads the last value from the backend; nothing is remembered here
//! between events.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use chirpha_core::config::defaults;
use chirpha_core::InfluxSettings;
use chirpha_storage::{SampleValue, SeriesKey, TimeSeriesBackend, WritePoint};

use crate::discovery::DEFAULT_STATE_CLASS;
use crate::uplink::HistorySample;

/// Include/exclude rules over entity ids (`<domain>.<object_id>`).
///
/// Precedence: excluded entity, included entity, excluded domain, then the
/// include domain list when any include list is set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityFilter {
    pub include_entities: Vec<String>,
    pub exclude_entities: Vec<String>,
    pub include_domains: Vec<String>,
    pub exclude_domains: Vec<String>,
}

impl EntityFilter {
    pub fn from_settings(settings: &InfluxSettings) -> Self {
        Self {
            include_entities: settings.include_entities.clone(),
            exclude_entities: settings.exclude_entities.clone(),
            include_domains: settings.include_domains.clone(),
            exclude_domains: settings.exclude_domains.clone(),
        }
    }

    pub fn allows(&self, entity_id: &str) -> bool {
        let domain = entity_id.split('.').next().unwrap_or_default();
        let listed = |list: &[String], value: &str| list.iter().any(|item| item == value);

        if listed(&self.exclude_entities, entity_id) {
            return false;
        }
        if listed(&self.include_entities, entity_id) {
            return true;
        }
        if listed(&self.exclude_domains, domain) {
            return false;
        }
        if !self.include_entities.is_empty() || !self.include_domains.is_empty() {
            return listed(&self.include_domains, domain);
        }
        true
    }
}

/// The entity field being reconciled.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileTarget<'a> {
    /// Full entity id, `sensor.<object_id>`.
    pub entity_id: &'a str,
    pub field: &'a str,
    pub unit: Option<&'a str>,
    pub state_class: &'a str,
}

impl ReconcileTarget<'_> {
    pub fn domain(&self) -> &str {
        self.entity_id.split('.').next().unwrap_or_default()
    }

    pub fn object_id(&self) -> &str {
        self.entity_id
            .split_once('.')
            .map(|(_, object)| object)
            .unwrap_or(self.entity_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotMeasurement,
    NoHistory,
    Filtered,
    NoBackend,
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub skipped: Option<SkipReason>,
    pub last_known: Option<SampleValue>,
    /// History points emitted.
    pub backfilled: usize,
    /// Whether a point carrying the live value was appended after backfill.
    pub corrective: bool,
    pub write_error: Option<String>,
}

impl ReconcileReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Default::default()
        }
    }

    /// Points handed to the backend in this pass.
    pub fn points(&self) -> usize {
        self.backfilled + usize::from(self.corrective)
    }
}

pub struct Reconciler {
    backend: Option<Arc<dyn TimeSeriesBackend>>,
    tags: BTreeMap<String, String>,
    filter: EntityFilter,
    measurement: Option<String>,
    lookback: Duration,
}

impl Reconciler {
    pub fn new(
        backend: Option<Arc<dyn TimeSeriesBackend>>,
        settings: Option<&InfluxSettings>,
    ) -> Self {
        match settings {
            Some(settings) => Self {
                backend,
                tags: settings.tags.clone(),
                filter: EntityFilter::from_settings(settings),
                measurement: settings.measurement.clone(),
                lookback: settings.lookback(),
            },
            None => Self {
                backend,
                tags: BTreeMap::new(),
                filter: EntityFilter::default(),
                measurement: None,
                lookback: Duration::from_secs(defaults::INFLUX_LOOKBACK_DAYS * 86_400),
            },
        }
    }

    /// Reconciler without a backend; every pass is skipped.
    pub fn disabled() -> Self {
        Self::new(None, None)
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn filter(&self) -> &EntityFilter {
        &self.filter
    }

    /// Configured override, else the unit, else the full entity id.
    pub fn measurement_for(&self, target: &ReconcileTarget<'_>) -> String {
        self.measurement
            .clone()
            .or_else(|| {
                target
                    .unit
                    .filter(|unit| !unit.is_empty())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| target.entity_id.to_string())
    }

    /// Backfills `history` for one field.
    ///
    /// Backend failures are logged and reported, never returned.
    pub async fn reconcile(
        &self,
        target: &ReconcileTarget<'_>,
        history: &[HistorySample],
        live: Option<&Value>,
    ) -> ReconcileReport {
        if target.state_class != DEFAULT_STATE_CLASS {
            return ReconcileReport::skipped(SkipReason::NotMeasurement);
        }
        if !history.iter().any(|s| s.values.contains_key(target.field)) {
            return ReconcileReport::skipped(SkipReason::NoHistory);
        }
        if !self.filter.allows(target.entity_id) {
            debug!(entity_id = target.entity_id, "Entity filtered from time-series");
            return ReconcileReport::skipped(SkipReason::Filtered);
        }
        let Some(backend) = &self.backend else {
            return ReconcileReport::skipped(SkipReason::NoBackend);
        };

        let key = SeriesKey::new(
            self.measurement_for(target),
            target.domain(),
            target.object_id(),
        );

        let last_known = match backend.query_last_value(&key, self.lookback).await {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    category = "storage",
                    backend = backend.name(),
                    entity_id = target.entity_id,
                    error = %e,
                    "Failed to read last value, replaying history without it"
                );
                None
            }
        };

        let mut previous = last_known.clone();
        let mut points = Vec::new();
        for sample in history {
            let Some(value) = sample.values.get(target.field).and_then(SampleValue::from_json)
            else {
                continue;
            };
            if value.differs_from(previous.as_ref()) {
                points.push(
                    WritePoint::for_series(&key, value.clone(), sample.timestamp_secs())
                        .with_tags(&self.tags),
                );
                previous = Some(value);
            }
        }

        let backfilled = points.len();
        let mut corrective = false;
        let live = live.and_then(SampleValue::from_json);
        if backfilled > 0 {
            if let (Some(live), Some(last)) = (&live, &last_known) {
                if !live.differs(last) && live.differs_from(previous.as_ref()) {
                    points.push(
                        WritePoint::for_series(&key, live.clone(), chrono::Utc::now().timestamp())
                            .with_tags(&self.tags),
                    );
                    corrective = true;
                }
            }
        }

        let mut report = ReconcileReport {
            skipped: None,
            last_known,
            backfilled,
            corrective,
            write_error: None,
        };
        if points.is_empty() {
            debug!(entity_id = target.entity_id, "History already persisted");
            return report;
        }

        match backend.write_points(&points).await {
            Ok(()) => {
                info!(
                    category = "storage",
                    entity_id = target.entity_id,
                    measurement = %key.measurement,
                    backfilled,
                    corrective,
                    "Backfilled history"
                );
            }
            Err(e) => {
                warn!(
                    category = "storage",
                    backend = backend.name(),
                    entity_id = target.entity_id,
                    points = points.len(),
                    error = %e,
                    "Failed to write history points"
                );
                report.write_error = Some(e.to_string());
            }
        }
        report
    }
}
