//! InfluxDB HTTP backend.
//!
//! Both protocol variants share one client:
//! - v2 writes to `/api/v2/write` and reads the last value with a Flux query
//!   answered as annotated CSV
//! - v1 writes to `/write` and reads with InfluxQL over `/query`
//!
//! Connection failures and timeouts map to [`Error::Unavailable`]; any other
//! failure maps to [`Error::QueryFailed`] or [`Error::WriteFailed`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use tracing::debug;

use chirpha_core::{InfluxApiVersion, InfluxSettings};

use crate::timeseries::{
    to_line_protocol, SampleValue, SeriesKey, TimeSeriesBackend, WritePoint, FIELD_STATE,
    FIELD_VALUE,
};
use crate::{Error, Result};

/// InfluxDB client for either protocol variant.
pub struct InfluxClient {
    http: Client,
    settings: InfluxSettings,
    base_url: String,
}

impl InfluxClient {
    pub fn new(settings: &InfluxSettings) -> Result<Self> {
        let http = Client::builder()
            .timeout(settings.timeout())
            .build()
            .map_err(|e| Error::InvalidInput(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: settings.url.trim_end_matches('/').to_string(),
            settings: settings.clone(),
        })
    }

    pub fn api_version(&self) -> InfluxApiVersion {
        self.settings.api_version
    }

    fn with_token(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.settings.token {
            Some(token) => request.header("Authorization", format!("Token {}", token)),
            None => request,
        }
    }

    fn with_credentials(&self, request: RequestBuilder) -> RequestBuilder {
        match (&self.settings.username, &self.settings.password) {
            (Some(user), Some(password)) => {
                request.query(&[("u", user.as_str()), ("p", password.as_str())])
            }
            _ => request,
        }
    }

    fn org(&self) -> &str {
        self.settings.org.as_deref().unwrap_or_default()
    }

    fn bucket(&self) -> &str {
        self.settings.bucket.as_deref().unwrap_or_default()
    }

    fn database(&self) -> &str {
        self.settings.database.as_deref().unwrap_or_default()
    }

    fn write_request(&self, body: String) -> RequestBuilder {
        let request = match self.settings.api_version {
            InfluxApiVersion::V2 => self.with_token(
                self.http
                    .post(format!("{}/api/v2/write", self.base_url))
                    .query(&[
                        ("org", self.org()),
                        ("bucket", self.bucket()),
                        ("precision", "s"),
                    ]),
            ),
            InfluxApiVersion::V1 => {
                let mut request = self
                    .http
                    .post(format!("{}/write", self.base_url))
                    .query(&[("db", self.database()), ("precision", "s")]);
                if let Some(rp) = &self.settings.retention_policy {
                    request = request.query(&[("rp", rp.as_str())]);
                }
                self.with_credentials(request)
            }
        };
        request
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
    }

    async fn query_last_v2(
        &self,
        key: &SeriesKey,
        lookback: Duration,
    ) -> Result<Option<SampleValue>> {
        let flux = flux_last_value_query(self.bucket(), key, lookback);
        debug!(query = %flux, "Flux last-value query");

        let request = self.with_token(
            self.http
                .post(format!("{}/api/v2/query", self.base_url))
                .query(&[("org", self.org())])
                .header("Accept", "application/csv")
                .header("Content-Type", "application/vnd.flux")
                .body(flux),
        );
        let response = request.send().await.map_err(query_error)?;
        let body = checked_body(response, Error::QueryFailed).await?;
        parse_flux_csv(&body)
    }

    async fn query_last_v1(
        &self,
        key: &SeriesKey,
        lookback: Duration,
    ) -> Result<Option<SampleValue>> {
        let q = influxql_last_value_query(key, lookback);
        debug!(query = %q, "InfluxQL last-value query");

        let request = self.with_credentials(
            self.http
                .get(format!("{}/query", self.base_url))
                .query(&[("db", self.database()), ("epoch", "s"), ("q", q.as_str())]),
        );
        let response = request.send().await.map_err(query_error)?;
        let body = checked_body(response, Error::QueryFailed).await?;
        parse_influxql_response(&body)
    }
}

#[async_trait]
impl TimeSeriesBackend for InfluxClient {
    fn name(&self) -> &str {
        match self.settings.api_version {
            InfluxApiVersion::V1 => "influxdb-v1",
            InfluxApiVersion::V2 => "influxdb-v2",
        }
    }

    async fn query_last_value(
        &self,
        key: &SeriesKey,
        lookback: Duration,
    ) -> Result<Option<SampleValue>> {
        match self.settings.api_version {
            InfluxApiVersion::V2 => self.query_last_v2(key, lookback).await,
            InfluxApiVersion::V1 => self.query_last_v1(key, lookback).await,
        }
    }

    async fn write_points(&self, points: &[WritePoint]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let response = self
            .write_request(to_line_protocol(points))
            .send()
            .await
            .map_err(write_error)?;
        checked_body(response, Error::WriteFailed).await?;
        debug!(backend = self.name(), points = points.len(), "Points written");
        Ok(())
    }
}

fn is_unreachable(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout()
}

fn query_error(e: reqwest::Error) -> Error {
    if is_unreachable(&e) {
        Error::Unavailable(e.to_string())
    } else {
        Error::QueryFailed(format!("HTTP request failed: {}", e))
    }
}

fn write_error(e: reqwest::Error) -> Error {
    if is_unreachable(&e) {
        Error::Unavailable(e.to_string())
    } else {
        Error::WriteFailed(format!("HTTP request failed: {}", e))
    }
}

/// Read the body, turning a non-success status into `failed`.
async fn checked_body(response: Response, failed: fn(String) -> Error) -> Result<String> {
    let status = response.status();
    let body = response.text().await.map_err(|e| {
        if is_unreachable(&e) {
            Error::Unavailable(e.to_string())
        } else {
            failed(format!("cannot read response: {}", e))
        }
    })?;
    if !status.is_success() {
        return Err(failed(format!("HTTP {}: {}", status, body.trim())));
    }
    Ok(body)
}

fn flux_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn influxql_identifier(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn influxql_literal(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

pub(crate) fn flux_last_value_query(bucket: &str, key: &SeriesKey, lookback: Duration) -> String {
    format!(
        "from(bucket: \"{bucket}\") \
         |> range(start: -{secs}s) \
         |> filter(fn: (r) => r._measurement == \"{measurement}\" and r.domain == \"{domain}\" and r.entity_id == \"{entity_id}\") \
         |> filter(fn: (r) => r._field == \"{FIELD_VALUE}\" or r._field == \"{FIELD_STATE}\") \
         |> last()",
        bucket = flux_string(bucket),
        secs = lookback.as_secs(),
        measurement = flux_string(&key.measurement),
        domain = flux_string(&key.domain),
        entity_id = flux_string(&key.entity_id),
    )
}

pub(crate) fn influxql_last_value_query(key: &SeriesKey, lookback: Duration) -> String {
    format!(
        "SELECT * FROM {} WHERE \"domain\" = {} AND \"entity_id\" = {} AND time > now() - {}s ORDER BY time DESC LIMIT 1",
        influxql_identifier(&key.measurement),
        influxql_literal(&key.domain),
        influxql_literal(&key.entity_id),
        lookback.as_secs(),
    )
}

/// Typed value of a stored field.
fn field_value(field: &str, raw: &str) -> SampleValue {
    if field == FIELD_STATE {
        match raw {
            "true" => return SampleValue::Bool(true),
            "false" => return SampleValue::Bool(false),
            _ => {}
        }
    }
    SampleValue::from_text(raw)
}

struct CsvColumns {
    time: Option<usize>,
    value: usize,
    field: Option<usize>,
}

/// Pick the most recent row out of a Flux annotated CSV response.
///
/// `last()` yields one table per field, so the newest `_time` across tables
/// wins.
pub(crate) fn parse_flux_csv(body: &str) -> Result<Option<SampleValue>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .comment(Some(b'#'))
        .from_reader(body.as_bytes());

    let mut columns: Option<CsvColumns> = None;
    let mut error_column: Option<usize> = None;
    let mut best: Option<(Option<DateTime<FixedOffset>>, SampleValue)> = None;

    for record in reader.records() {
        let record = record?;
        if record.iter().all(str::is_empty) {
            continue;
        }

        let position = |name: &str| record.iter().position(|f| f == name);
        if let Some(value) = position("_value") {
            columns = Some(CsvColumns {
                time: position("_time"),
                value,
                field: position("_field"),
            });
            error_column = None;
            continue;
        }
        if columns.is_none() {
            if let (Some(idx), Some(_)) = (position("error"), position("reference")) {
                error_column = Some(idx);
                continue;
            }
        }
        if let Some(idx) = error_column {
            let message = record.get(idx).unwrap_or_default();
            return Err(Error::QueryFailed(format!("Flux error: {}", message)));
        }

        let Some(cols) = &columns else {
            continue;
        };
        let Some(raw) = record.get(cols.value) else {
            continue;
        };
        let field = cols
            .field
            .and_then(|i| record.get(i))
            .unwrap_or(FIELD_VALUE);
        let time = cols
            .time
            .and_then(|i| record.get(i))
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok());
        let value = field_value(field, raw);

        let newer = match &best {
            Some((best_time, _)) => time > *best_time,
            None => true,
        };
        if newer {
            best = Some((time, value));
        }
    }

    Ok(best.map(|(_, value)| value))
}

#[derive(Debug, Deserialize)]
struct InfluxQlResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    series: Vec<InfluxQlSeries>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InfluxQlSeries {
    columns: Vec<String>,
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

pub(crate) fn parse_influxql_response(body: &str) -> Result<Option<SampleValue>> {
    let response: InfluxQlResponse = serde_json::from_str(body)?;
    if let Some(error) = response.error {
        return Err(Error::QueryFailed(error));
    }

    for statement in response.results {
        if let Some(error) = statement.error {
            return Err(Error::QueryFailed(error));
        }
        for series in statement.series {
            let column = |name: &str| series.columns.iter().position(|c| c == name);
            let Some(row) = series.values.first() else {
                continue;
            };
            let cell = |idx: Option<usize>| {
                idx.and_then(|i| row.get(i))
                    .filter(|v| !v.is_null())
            };
            if let Some(value) = cell(column(FIELD_VALUE)).and_then(SampleValue::from_json) {
                return Ok(Some(value));
            }
            if let Some(state) = cell(column(FIELD_STATE)) {
                let value = match state {
                    serde_json::Value::String(s) => Some(field_value(FIELD_STATE, s)),
                    other => SampleValue::from_json(other),
                };
                if value.is_some() {
                    return Ok(value);
                }
            }
        }
    }
    Ok(None)
}
