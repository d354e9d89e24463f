use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    LatencyRegression,
    NewError,
    StructuralChange,
    FanoutPattern,
    LogAnomaly,
    MetricAnomaly,
}

impl FindingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FindingKind::LatencyRegression => "latency_regression",
            FindingKind::NewError => "new_error",
            FindingKind::StructuralChange => "structural_change",
            FindingKind::FanoutPattern => "fanout_pattern",
            FindingKind::LogAnomaly => "log_anomaly",
            FindingKind::MetricAnomaly => "metric_anomaly",
        }
    }
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a finding points at
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EvidenceRef {
    Span {
        trace_id: String,
        span_id: String,
        name: String,
        service: String,
    },
    LogCluster {
        cluster_id: u64,
        template: String,
    },
    Metric {
        series: Vec<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    Service {
        service: String,
    },
}

impl EvidenceRef {
    pub fn span(span: &crate::telemetry::Span) -> Self {
        EvidenceRef::Span {
            trace_id: span.trace_id.clone(),
            span_id: span.span_id.clone(),
            name: span.name.clone(),
            service: span.service().to_string(),
        }
    }

    pub fn trace_id(&self) -> Option<&str> {
        match self {
            EvidenceRef::Span { trace_id, .. } => Some(trace_id),
            _ => None,
        }
    }
}

/// A single piece of evidence produced by an analyzer.
///
/// `magnitude` is in the natural unit of the kind: milliseconds for latency,
/// span counts for structural and fan-out changes, a count of occurrences for
/// errors and logs, and the maximum deviation for metric anomalies.
/// `confidence` is always within `0.0..=1.0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub evidence: EvidenceRef,
    pub magnitude: f64,
    pub confidence: f64,
    pub description: String,
}

impl Finding {
    pub fn new(
        kind: FindingKind,
        evidence: EvidenceRef,
        magnitude: f64,
        confidence: f64,
        description: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            evidence,
            magnitude,
            confidence: confidence.clamp(0.0, 1.0),
            description: description.into(),
        }
    }
}

/// Highest-confidence finding; ties go to the larger magnitude, then the earlier entry.
pub fn strongest(findings: &[Finding]) -> Option<&Finding> {
    findings.iter().reduce(|best, candidate| {
        let better = candidate.confidence > best.confidence
            || (candidate.confidence == best.confidence && candidate.magnitude > best.magnitude);
        if better {
            candidate
        } else {
            best
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str) -> EvidenceRef {
        EvidenceRef::Service {
            service: name.into(),
        }
    }

    #[test]
    fn strongest_prefers_confidence_then_magnitude() {
        let findings = vec![
            Finding::new(FindingKind::NewError, service("a"), 1.0, 0.5, "a"),
            Finding::new(FindingKind::LatencyRegression, service("b"), 20.0, 0.9, "b"),
            Finding::new(FindingKind::LatencyRegression, service("c"), 40.0, 0.9, "c"),
            Finding::new(FindingKind::StructuralChange, service("d"), 40.0, 0.9, "d"),
        ];
        assert_eq!(strongest(&findings).unwrap().description, "c");
        assert!(strongest(&[]).is_none());
    }

    #[test]
    fn finding_serializes_with_snake_case_kind() {
        let finding = Finding::new(FindingKind::FanoutPattern, service("db"), 7.0, 2.0, "x");
        let json = serde_json::to_value(&finding).unwrap();
        assert_eq!(json["kind"], "fanout_pattern");
        assert_eq!(json["evidence"]["type"], "service");
        assert_eq!(json["confidence"], 1.0);
    }
}
