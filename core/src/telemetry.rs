use crate::error::{AnalysisError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// Outcome recorded on a span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SpanStatus {
    #[default]
    #[serde(rename = "OK", alias = "ok", alias = "Ok", alias = "UNSET", alias = "unset")]
    Ok,
    #[serde(rename = "ERROR", alias = "error", alias = "Error")]
    Error,
}

impl SpanStatus {
    pub fn is_error(self) -> bool {
        matches!(self, SpanStatus::Error)
    }
}

/// Scalar attribute value attached to a span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Bool(v) => write!(f, "{}", v),
            AttributeValue::Int(v) => write!(f, "{}", v),
            AttributeValue::Float(v) => write!(f, "{}", v),
            AttributeValue::String(v) => f.write_str(v),
        }
    }
}

const SERVICE_ATTRIBUTE_KEYS: [&str; 2] = ["service.name", "service"];

/// A single timed operation within a trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub span_id: String,
    pub trace_id: String,
    #[serde(default)]
    pub parent_span_id: Option<String>,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub status: SpanStatus,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl Span {
    pub fn duration_ms(&self) -> f64 {
        millis_between(self.start_time, self.end_time)
    }

    pub fn is_error(&self) -> bool {
        self.status.is_error()
    }

    /// Owning service: `service.name`, then `service`, then the span name.
    pub fn service(&self) -> &str {
        SERVICE_ATTRIBUTE_KEYS
            .iter()
            .find_map(|key| match self.attributes.get(*key) {
                Some(AttributeValue::String(name)) if !name.is_empty() => Some(name.as_str()),
                _ => None,
            })
            .unwrap_or(&self.name)
    }

    /// True when every attribute of `self` is present with an equal value in `other`.
    pub fn attributes_subset_of(&self, other: &Span) -> bool {
        self.attributes
            .iter()
            .all(|(key, value)| other.attributes.get(key) == Some(value))
    }

    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start_time <= end && start <= self.end_time
    }
}

/// The full set of spans for one logical request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: String,
    pub spans: Vec<Span>,
}

impl Trace {
    pub fn new(trace_id: impl Into<String>, spans: Vec<Span>) -> Self {
        Self {
            trace_id: trace_id.into(),
            spans,
        }
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.spans.iter().map(|s| s.start_time).min()
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.spans.iter().map(|s| s.end_time).max()
    }

    /// max(end_time) - min(start_time) across all spans
    pub fn duration_ms(&self) -> f64 {
        match (self.start_time(), self.end_time()) {
            (Some(start), Some(end)) => millis_between(start, end),
            _ => 0.0,
        }
    }

    pub fn has_error(&self) -> bool {
        self.spans.iter().any(Span::is_error)
    }

    pub fn span(&self, span_id: &str) -> Option<&Span> {
        self.spans.iter().find(|s| s.span_id == span_id)
    }

    /// Name of the earliest root span, used to pair traces of the same operation.
    pub fn root_name(&self) -> Option<&str> {
        let ids: HashSet<&str> = self.spans.iter().map(|s| s.span_id.as_str()).collect();
        self.spans
            .iter()
            .filter(|s| {
                s.parent_span_id
                    .as_deref()
                    .map_or(true, |parent| !ids.contains(parent))
            })
            .min_by_key(|s| s.start_time)
            .map(|s| s.name.as_str())
    }

    pub fn services(&self) -> Vec<String> {
        let mut services: Vec<String> =
            self.spans.iter().map(|s| s.service().to_string()).collect();
        services.sort();
        services.dedup();
        services
    }

    /// Strict structural validation; builds (and discards) the span forest.
    pub fn validate(&self) -> Result<()> {
        crate::forest::SpanForest::build(self).map(|_| ())
    }
}

/// Log severity, ordered from least to most severe
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Trace,
    Debug,
    #[default]
    Info,
    #[serde(alias = "warning")]
    Warn,
    #[serde(alias = "err")]
    Error,
    #[serde(alias = "critical", alias = "panic")]
    Fatal,
}

impl Severity {
    pub fn is_error(self) -> bool {
        self >= Severity::Error
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Trace => "trace",
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Severity::Trace),
            "debug" => Ok(Severity::Debug),
            "info" | "information" => Ok(Severity::Info),
            "warn" | "warning" => Ok(Severity::Warn),
            "error" | "err" => Ok(Severity::Error),
            "fatal" | "critical" | "panic" => Ok(Severity::Fatal),
            other => Err(AnalysisError::InvalidTelemetry(format!(
                "unknown log severity: {}",
                other
            ))),
        }
    }
}

/// A single log line, optionally linked to a span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub span_id: Option<String>,
}

impl LogEntry {
    pub fn new(timestamp: DateTime<Utc>, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            message: message.into(),
            severity,
            trace_id: None,
            span_id: None,
        }
    }

    pub fn with_span(mut self, trace_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self.span_id = Some(span_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    /// Derived by the anomaly detector; never read from input
    #[serde(default, skip_deserializing)]
    pub anomaly: bool,
}

impl MetricPoint {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            timestamp,
            value,
            anomaly: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSeries {
    #[serde(rename = "metric_name")]
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub points: Vec<MetricPoint>,
}

impl MetricSeries {
    pub fn new(name: impl Into<String>, points: Vec<MetricPoint>) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
            points,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Stable identity: name plus sorted labels, e.g. `latency{host=a}`.
    pub fn key(&self) -> String {
        if self.labels.is_empty() {
            return self.name.clone();
        }
        let labels: Vec<String> = self
            .labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        format!("{}{{{}}}", self.name, labels.join(","))
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.value).collect()
    }

    /// Split into (points before `at`, points at or after `at`).
    pub fn split_at(&self, at: DateTime<Utc>) -> (MetricSeries, MetricSeries) {
        let (before, after): (Vec<MetricPoint>, Vec<MetricPoint>) =
            self.points.iter().cloned().partition(|p| p.timestamp < at);
        (
            MetricSeries {
                name: self.name.clone(),
                labels: self.labels.clone(),
                points: before,
            },
            MetricSeries {
                name: self.name.clone(),
                labels: self.labels.clone(),
                points: after,
            },
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AnalysisError::InvalidTelemetry(
                "metric series without metric_name".into(),
            ));
        }
        for (i, point) in self.points.iter().enumerate() {
            if !point.value.is_finite() {
                return Err(AnalysisError::InvalidTelemetry(format!(
                    "{}: non-finite value at point {}",
                    self.key(),
                    i
                )));
            }
        }
        if self
            .points
            .windows(2)
            .any(|pair| pair[1].timestamp < pair[0].timestamp)
        {
            return Err(AnalysisError::InvalidTelemetry(format!(
                "{}: points are not time-ascending",
                self.key()
            )));
        }
        Ok(())
    }
}

/// Closed time range an investigation looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts <= self.end
    }

    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start <= end && start <= self.end
    }

    pub fn duration_ms(&self) -> f64 {
        millis_between(self.start, self.end)
    }
}

pub(crate) fn millis_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let delta = end - start;
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1000.0,
        None => delta.num_milliseconds() as f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn span_wire_format_uses_contract_field_names() {
        let raw = json!({
            "span_id": "s1",
            "trace_id": "t1",
            "parent_span_id": null,
            "name": "GET /orders",
            "start_time": "2024-01-01T12:00:00Z",
            "end_time": "2024-01-01T12:00:00.250Z",
            "status": "ERROR",
            "attributes": {"service.name": "orders", "http.status_code": 500}
        });

        let span: Span = serde_json::from_value(raw).unwrap();
        assert_eq!(span.status, SpanStatus::Error);
        assert_eq!(span.service(), "orders");
        assert!((span.duration_ms() - 250.0).abs() < 1e-9);
        assert_eq!(
            span.attributes.get("http.status_code"),
            Some(&AttributeValue::Int(500))
        );

        let back = serde_json::to_value(&span).unwrap();
        for field in [
            "span_id",
            "trace_id",
            "parent_span_id",
            "start_time",
            "end_time",
            "attributes",
            "status",
        ] {
            assert!(back.get(field).is_some(), "missing {}", field);
        }
    }

    #[test]
    fn service_falls_back_to_span_name() {
        let span = Span {
            span_id: "s".into(),
            trace_id: "t".into(),
            parent_span_id: None,
            name: "checkout".into(),
            start_time: base(),
            end_time: base(),
            status: SpanStatus::Ok,
            attributes: BTreeMap::new(),
        };
        assert_eq!(span.service(), "checkout");
    }

    #[test]
    fn metric_series_uses_metric_name_and_ignores_input_anomaly_flag() {
        let raw = json!({
            "metric_name": "cpu",
            "labels": {"host": "a"},
            "points": [{"timestamp": "2024-01-01T12:00:00Z", "value": 1.5, "anomaly": true}]
        });
        let series: MetricSeries = serde_json::from_value(raw).unwrap();
        assert_eq!(series.name, "cpu");
        assert_eq!(series.key(), "cpu{host=a}");
        assert!(!series.points[0].anomaly);
    }

    #[test]
    fn metric_series_rejects_unordered_points() {
        let series = MetricSeries::new(
            "cpu",
            vec![
                MetricPoint::new(base() + Duration::seconds(10), 1.0),
                MetricPoint::new(base(), 2.0),
            ],
        );
        assert!(series.validate().is_err());
    }

    #[test]
    fn split_at_partitions_by_timestamp() {
        let series = MetricSeries::new(
            "rps",
            (0..6)
                .map(|i| MetricPoint::new(base() + Duration::seconds(i), i as f64))
                .collect(),
        );
        let (before, after) = series.split_at(base() + Duration::seconds(4));
        assert_eq!(before.points.len(), 4);
        assert_eq!(after.points.len(), 2);
    }

    #[test]
    fn severity_parses_aliases() {
        assert_eq!("WARNING".parse::<Severity>().unwrap(), Severity::Warn);
        assert_eq!("critical".parse::<Severity>().unwrap(), Severity::Fatal);
        assert!("loud".parse::<Severity>().is_err());
        assert!(Severity::Fatal.is_error());
        assert!(!Severity::Warn.is_error());
    }
}
