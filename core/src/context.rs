use crate::anomaly::AnomalyWindow;
use crate::clustering::LogCluster;
use crate::config::Config;
use crate::correlate::ExemplarCorrelator;
use crate::error::{AnalysisError, Result};
use crate::telemetry::{LogEntry, MetricSeries, TimeWindow, Trace};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use uuid::Uuid;

/// Telemetry for one investigation, as handed over by a collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvestigationRequest {
    pub window: TimeWindow,
    #[serde(default)]
    pub traces: Vec<Trace>,
    /// Healthy reference traces; when empty, baselines come from `traces`
    #[serde(default)]
    pub baseline_traces: Vec<Trace>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    /// Series covering both the baseline period (before `window.start`) and the window
    #[serde(default)]
    pub metrics: Vec<MetricSeries>,
    /// Persisted cluster state to continue from
    #[serde(default)]
    pub prior_clusters: Vec<LogCluster>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedTrace {
    pub trace_id: String,
    pub reason: String,
}

impl InvestigationRequest {
    pub fn new(window: TimeWindow) -> Self {
        Self {
            window,
            traces: Vec::new(),
            baseline_traces: Vec::new(),
            logs: Vec::new(),
            metrics: Vec::new(),
            prior_clusters: Vec::new(),
        }
    }

    /// Reject malformed telemetry.
    ///
    /// An inverted window or an invalid metric series fails the whole request.
    /// Malformed traces are removed and returned so the report can list them.
    pub fn validate(&mut self) -> Result<Vec<RejectedTrace>> {
        if self.window.end < self.window.start {
            return Err(AnalysisError::InvalidTelemetry(
                "investigation window ends before it starts".into(),
            ));
        }
        for series in &self.metrics {
            series.validate()?;
        }

        let mut rejected = Vec::new();
        for traces in [&mut self.traces, &mut self.baseline_traces] {
            traces.retain(|trace| match trace.validate() {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(trace_id = %trace.trace_id, error = %e, "rejecting trace");
                    rejected.push(RejectedTrace {
                        trace_id: trace.trace_id.clone(),
                        reason: e.to_string(),
                    });
                    false
                }
            });
        }
        Ok(rejected)
    }
}

/// Outputs of the deep-dive stage that the report stage links together
#[derive(Debug, Clone, Default)]
pub struct DeepDiveEvidence {
    pub clusters: Vec<LogCluster>,
    pub anomaly_windows: Vec<AnomalyWindow>,
}

/// State owned by one investigation.
///
/// Created at INIT and passed by reference to every analyzer. Nothing in it
/// is shared with other investigations.
pub struct InvestigationContext {
    id: Uuid,
    created_at: DateTime<Utc>,
    request: InvestigationRequest,
    config: Config,
    correlator: ExemplarCorrelator,
    evidence: OnceLock<DeepDiveEvidence>,
}

impl InvestigationContext {
    pub fn new(request: InvestigationRequest, config: Config) -> Self {
        let correlator = ExemplarCorrelator::new(config.correlation.clone());
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            request,
            config,
            correlator,
            evidence: OnceLock::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn request(&self) -> &InvestigationRequest {
        &self.request
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn correlator(&self) -> &ExemplarCorrelator {
        &self.correlator
    }

    /// Record deep-dive outputs; only the first call has an effect.
    pub fn set_evidence(&self, evidence: DeepDiveEvidence) {
        if self.evidence.set(evidence).is_err() {
            tracing::debug!(investigation_id = %self.id, "deep-dive evidence already recorded");
        }
    }

    /// Deep-dive outputs, or nothing if the stage has not produced any.
    pub fn evidence(&self) -> DeepDiveEvidence {
        self.evidence.get().cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{MetricPoint, Span, SpanStatus};
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeMap;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap() + Duration::seconds(seconds)
    }

    fn single_span(trace_id: &str, parent: Option<&str>) -> Trace {
        Trace::new(
            trace_id,
            vec![Span {
                span_id: "s".into(),
                trace_id: trace_id.into(),
                parent_span_id: parent.map(str::to_string),
                name: "op".into(),
                start_time: at(0),
                end_time: at(1),
                status: SpanStatus::Ok,
                attributes: BTreeMap::new(),
            }],
        )
    }

    #[test]
    fn validate_partitions_malformed_traces() {
        let mut request = InvestigationRequest::new(TimeWindow::new(at(0), at(60)));
        request.traces = vec![single_span("good", None), single_span("bad", Some("ghost"))];
        request.baseline_traces = vec![single_span("old-bad", Some("missing"))];

        let rejected = request.validate().unwrap();
        assert_eq!(request.traces.len(), 1);
        assert!(request.baseline_traces.is_empty());
        let ids: Vec<&str> = rejected.iter().map(|r| r.trace_id.as_str()).collect();
        assert_eq!(ids, vec!["bad", "old-bad"]);
        assert!(rejected[0].reason.contains("unknown parent"));
    }

    #[test]
    fn validate_rejects_bad_window_and_metrics() {
        let mut inverted = InvestigationRequest::new(TimeWindow::new(at(10), at(0)));
        assert!(matches!(
            inverted.validate(),
            Err(AnalysisError::InvalidTelemetry(_))
        ));

        let mut request = InvestigationRequest::new(TimeWindow::new(at(0), at(10)));
        request.metrics = vec![MetricSeries::new("cpu", vec![MetricPoint::new(at(1), f64::NAN)])];
        assert!(request.validate().is_err());
    }

    #[test]
    fn evidence_is_recorded_once() {
        let ctx = InvestigationContext::new(
            InvestigationRequest::new(TimeWindow::new(at(0), at(10))),
            Config::default(),
        );
        assert!(ctx.evidence().clusters.is_empty());
        ctx.set_evidence(DeepDiveEvidence {
            clusters: Vec::new(),
            anomaly_windows: vec![AnomalyWindow {
                start: at(1),
                end: at(2),
                series: vec!["cpu".into()],
                severity: 1.0,
                points: 1,
            }],
        });
        ctx.set_evidence(DeepDiveEvidence::default());
        assert_eq!(ctx.evidence().anomaly_windows.len(), 1);
    }
}
