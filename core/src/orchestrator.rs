use crate::analysis::{Analyzer, AnalyzerKind, AnalyzerOutput, AnalyzerRegistry};
use crate::anomaly::{AnomalyWindow, SeriesStatus};
use crate::cache::CacheStats;
use crate::clustering::LogCluster;
use crate::config::Config;
use crate::context::{DeepDiveEvidence, InvestigationContext, InvestigationRequest, RejectedTrace};
use crate::correlate::{AnomalyExemplars, EvidenceBundle};
use crate::diff::TraceComparisonReport;
use crate::error::{AnalysisError, Result};
use crate::findings::Finding;
use crate::graph::{EdgeSummary, RootCauseHypothesis};
use crate::source::TelemetrySource;
use crate::telemetry::{TimeWindow, Trace};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Investigation state machine: INIT -> TRIAGE -> {RESOLVE | DEEP_DIVE} -> REPORT -> DONE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Init,
    Triage,
    Resolve,
    DeepDive,
    Report,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Init => "INIT",
            Stage::Triage => "TRIAGE",
            Stage::Resolve => "RESOLVE",
            Stage::DeepDive => "DEEP_DIVE",
            Stage::Report => "REPORT",
            Stage::Done => "DONE",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTransition {
    pub stage: Stage,
    pub entered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnalyzerStatus {
    Ok,
    Unavailable { reason: String },
    TimedOut { timeout_ms: u64 },
    InsufficientData { reason: String },
    /// Not run because triage resolved the investigation
    Skipped,
}

impl AnalyzerStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, AnalyzerStatus::Ok)
    }

    fn from_error(err: &AnalysisError) -> Self {
        match err {
            AnalysisError::AnalyzerTimeout { timeout_ms, .. } => AnalyzerStatus::TimedOut {
                timeout_ms: *timeout_ms,
            },
            AnalysisError::InsufficientData { .. } => AnalyzerStatus::InsufficientData {
                reason: err.to_string(),
            },
            other => AnalyzerStatus::Unavailable {
                reason: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Triage found nothing worth a deep dive
    Resolved,
    Investigated,
}

/// Cheap-check results that decided escalation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriageSummary {
    pub traces: usize,
    pub error_traces: usize,
    pub error_ratio: f64,
    pub baseline_p95_ms: Option<f64>,
    pub target_p95_ms: Option<f64>,
    /// (target p95 - baseline p95) / baseline p95
    pub p95_delta: Option<f64>,
    pub escalate: bool,
    pub reason: String,
    #[serde(default)]
    pub timed_out: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchState {
    Ok,
    TimedOut,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchStatus {
    pub signal: String,
    pub state: FetchState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvestigationReport {
    pub investigation_id: Uuid,
    pub window: TimeWindow,
    pub outcome: Outcome,
    pub summary: String,
    pub stages: Vec<StageTransition>,
    pub triage: TriageSummary,
    pub analyzer_status: BTreeMap<AnalyzerKind, AnalyzerStatus>,
    pub findings: Vec<Finding>,
    pub hypothesis: Option<RootCauseHypothesis>,
    pub trace_comparison: Option<TraceComparisonReport>,
    pub log_clusters: Vec<LogCluster>,
    pub anomaly_windows: Vec<AnomalyWindow>,
    pub metric_series: BTreeMap<String, SeriesStatus>,
    pub evidence: Vec<EvidenceBundle>,
    pub anomaly_exemplars: Vec<AnomalyExemplars>,
    pub causal_edges: Vec<EdgeSummary>,
    pub correlation_cache: CacheStats,
    pub rejected_traces: Vec<RejectedTrace>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fetch_status: Vec<FetchStatus>,
}

impl InvestigationReport {
    fn new(ctx: &InvestigationContext, rejected_traces: Vec<RejectedTrace>) -> Self {
        Self {
            investigation_id: ctx.id(),
            window: ctx.request().window,
            outcome: Outcome::Investigated,
            summary: String::new(),
            stages: Vec::new(),
            triage: TriageSummary::default(),
            analyzer_status: BTreeMap::new(),
            findings: Vec::new(),
            hypothesis: None,
            trace_comparison: None,
            log_clusters: Vec::new(),
            anomaly_windows: Vec::new(),
            metric_series: BTreeMap::new(),
            evidence: Vec::new(),
            anomaly_exemplars: Vec::new(),
            causal_edges: Vec::new(),
            correlation_cache: CacheStats::default(),
            rejected_traces,
            fetch_status: Vec::new(),
        }
    }

    pub fn status(&self, kind: AnalyzerKind) -> Option<&AnalyzerStatus> {
        self.analyzer_status.get(&kind)
    }

    fn enter(&mut self, ctx: &InvestigationContext, stage: Stage) {
        tracing::info!(investigation_id = %ctx.id(), stage = %stage, "stage transition");
        self.stages.push(StageTransition {
            stage,
            entered_at: Utc::now(),
        });
    }

    fn absorb(&mut self, output: AnalyzerOutput) {
        self.findings.extend(output.findings());
        match output {
            AnalyzerOutput::TraceDiff(report) => self.trace_comparison = Some(*report),
            AnalyzerOutput::LogPatterns(logs) => self.log_clusters = logs.clusters,
            AnalyzerOutput::MetricAnomalies(detection) => {
                self.anomaly_windows = detection.windows;
                self.metric_series = detection.statuses;
            }
            AnalyzerOutput::Correlation(correlation) => {
                self.evidence = correlation.bundles;
                self.anomaly_exemplars = correlation.anomaly_exemplars;
                self.correlation_cache = correlation.cache;
            }
            AnalyzerOutput::CausalGraph(causal) => {
                let causal = *causal;
                self.causal_edges = causal.edges;
                self.hypothesis = Some(causal.hypothesis);
            }
        }
    }
}

/// Sequences the analyzers of one investigation.
///
/// Deep-dive analyzers run concurrently on the blocking pool, each under its
/// own timeout. A failed or timed-out analyzer only degrades its own status;
/// siblings are never cancelled and there are no retries. A timed-out
/// analyzer's thread is left to finish in the background and its result is
/// dropped.
pub struct StageOrchestrator {
    config: Config,
    registry: AnalyzerRegistry,
}

impl StageOrchestrator {
    pub fn new(config: Config) -> Self {
        Self::with_registry(config, AnalyzerRegistry::with_defaults())
    }

    pub fn with_registry(config: Config, registry: AnalyzerRegistry) -> Self {
        Self { config, registry }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry_mut(&mut self) -> &mut AnalyzerRegistry {
        &mut self.registry
    }

    /// Run one investigation to completion.
    ///
    /// Fails only when the request itself is invalid; analyzer problems are
    /// reported through `analyzer_status`.
    pub async fn investigate(
        &self,
        mut request: InvestigationRequest,
    ) -> Result<InvestigationReport> {
        let rejected = request.validate()?;
        let ctx = Arc::new(InvestigationContext::new(request, self.config.clone()));
        let mut report = InvestigationReport::new(&ctx, rejected);
        report.enter(&ctx, Stage::Init);

        report.enter(&ctx, Stage::Triage);
        report.triage = self.triage(&ctx).await;

        if !report.triage.escalate {
            report.enter(&ctx, Stage::Resolve);
            report.outcome = Outcome::Resolved;
            report.summary = format!("No significant issue: {}", report.triage.reason);
            for stage in [Stage::DeepDive, Stage::Report] {
                for kind in crate::analysis::capabilities(stage) {
                    report.analyzer_status.insert(*kind, AnalyzerStatus::Skipped);
                }
            }
        } else {
            report.enter(&ctx, Stage::DeepDive);
            for kind in crate::analysis::capabilities(Stage::DeepDive) {
                if !self.enabled(*kind) {
                    report.analyzer_status.insert(*kind, AnalyzerStatus::Skipped);
                }
            }
            let mut evidence = DeepDiveEvidence::default();
            for (kind, result) in self.run_stage(&ctx, Stage::DeepDive).await {
                match &result {
                    Ok(AnalyzerOutput::LogPatterns(logs)) => {
                        evidence.clusters = logs.clusters.clone()
                    }
                    Ok(AnalyzerOutput::MetricAnomalies(detection)) => {
                        evidence.anomaly_windows = detection.windows.clone()
                    }
                    _ => {}
                }
                self.record(&ctx, &mut report, kind, result);
            }
            ctx.set_evidence(evidence);

            report.enter(&ctx, Stage::Report);
            for (kind, result) in self.run_stage(&ctx, Stage::Report).await {
                self.record(&ctx, &mut report, kind, result);
            }
            report.summary = summarize(&report);
        }

        report.findings.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then(b.magnitude.total_cmp(&a.magnitude))
        });
        report.enter(&ctx, Stage::Done);
        Ok(report)
    }

    /// Fetch telemetry for `window` (plus an optional baseline period) and investigate it.
    ///
    /// Every fetch is bounded by the fetch timeout and falls back to no data.
    pub async fn investigate_source(
        &self,
        source: &dyn TelemetrySource,
        window: TimeWindow,
        baseline: Option<TimeWindow>,
    ) -> Result<InvestigationReport> {
        let limit = self.config.orchestrator.fetch_timeout();
        let mut statuses = Vec::new();
        let mut request = InvestigationRequest::new(window);

        request.traces =
            bounded_fetch("traces", limit, source.fetch_traces(&window), &mut statuses).await;
        request.logs =
            bounded_fetch("logs", limit, source.fetch_logs(&window), &mut statuses).await;

        let baseline_window = baseline.unwrap_or_else(|| {
            TimeWindow::new(window.start - (window.end - window.start), window.start)
        });
        let metric_range = TimeWindow::new(baseline_window.start.min(window.start), window.end);
        request.metrics = bounded_fetch(
            "metrics",
            limit,
            source.fetch_metrics(&metric_range),
            &mut statuses,
        )
        .await;
        if let Some(baseline) = baseline {
            request.baseline_traces = bounded_fetch(
                "baseline_traces",
                limit,
                source.fetch_traces(&baseline),
                &mut statuses,
            )
            .await;
        }

        let mut report = self.investigate(request).await?;
        report.fetch_status = statuses;
        Ok(report)
    }

    async fn triage(&self, ctx: &Arc<InvestigationContext>) -> TriageSummary {
        let limit = self.config.triage.timeout();
        let task_ctx = Arc::clone(ctx);
        let task = tokio::task::spawn_blocking(move || triage(&task_ctx));
        match tokio::time::timeout(limit, task).await {
            Ok(Ok(summary)) => summary,
            Ok(Err(join_error)) => TriageSummary {
                escalate: true,
                reason: format!("triage failed ({}); escalating", join_error),
                ..TriageSummary::default()
            },
            Err(_) => {
                tracing::warn!(
                    investigation_id = %ctx.id(),
                    timeout_ms = limit.as_millis() as u64,
                    "triage timed out"
                );
                TriageSummary {
                    escalate: true,
                    timed_out: true,
                    reason: "triage timed out; escalating".into(),
                    ..TriageSummary::default()
                }
            }
        }
    }

    async fn run_stage(
        &self,
        ctx: &Arc<InvestigationContext>,
        stage: Stage,
    ) -> Vec<(AnalyzerKind, Result<AnalyzerOutput>)> {
        let limit = self.config.orchestrator.analyzer_timeout();
        let tasks = self
            .registry
            .for_stage(stage)
            .into_iter()
            .filter(|(kind, _)| self.enabled(*kind))
            .map(|(kind, analyzer)| run_analyzer(Arc::clone(ctx), kind, analyzer, limit));
        join_all(tasks).await
    }

    /// Analyzers switched off in config are reported as skipped and never run.
    fn enabled(&self, kind: AnalyzerKind) -> bool {
        match kind {
            AnalyzerKind::MetricAnomalies => self.config.anomaly_detection.enabled,
            _ => true,
        }
    }

    fn record(
        &self,
        ctx: &InvestigationContext,
        report: &mut InvestigationReport,
        kind: AnalyzerKind,
        result: Result<AnalyzerOutput>,
    ) {
        let status = match result {
            Ok(output) => {
                report.absorb(output);
                AnalyzerStatus::Ok
            }
            Err(err) => {
                let status = AnalyzerStatus::from_error(&err);
                match status {
                    AnalyzerStatus::Unavailable { .. } => {
                        tracing::error!(
                            investigation_id = %ctx.id(),
                            analyzer = %kind,
                            error = %err,
                            "analyzer failed"
                        )
                    }
                    _ => {
                        tracing::warn!(
                            investigation_id = %ctx.id(),
                            analyzer = %kind,
                            error = %err,
                            "analyzer degraded"
                        )
                    }
                }
                status
            }
        };
        report.analyzer_status.insert(kind, status);
    }
}

async fn run_analyzer(
    ctx: Arc<InvestigationContext>,
    kind: AnalyzerKind,
    analyzer: Option<Arc<dyn Analyzer>>,
    limit: Duration,
) -> (AnalyzerKind, Result<AnalyzerOutput>) {
    let Some(analyzer) = analyzer else {
        return (kind, Err(AnalysisError::failure(kind, "no analyzer registered")));
    };

    let started = Instant::now();
    let task = tokio::task::spawn_blocking(move || analyzer.analyze(&ctx));
    let result = match tokio::time::timeout(limit, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(AnalysisError::failure(
            kind,
            format!("analyzer panicked: {}", join_error),
        )),
        Err(_) => Err(AnalysisError::AnalyzerTimeout {
            analyzer: kind,
            timeout_ms: limit.as_millis() as u64,
        }),
    };
    tracing::debug!(
        analyzer = %kind,
        elapsed_ms = started.elapsed().as_millis() as u64,
        ok = result.is_ok(),
        "analyzer finished"
    );
    (kind, result)
}

async fn bounded_fetch<T, F>(
    signal: &str,
    limit: Duration,
    fetch: F,
    statuses: &mut Vec<FetchStatus>,
) -> Vec<T>
where
    F: Future<Output = anyhow::Result<Vec<T>>>,
{
    let (data, state, error) = match tokio::time::timeout(limit, fetch).await {
        Ok(Ok(data)) => (data, FetchState::Ok, None),
        Ok(Err(e)) => {
            tracing::warn!(signal, error = %e, "telemetry fetch failed; continuing without it");
            (Vec::new(), FetchState::Failed, Some(e.to_string()))
        }
        Err(_) => {
            tracing::warn!(signal, "telemetry fetch timed out; continuing without it");
            (Vec::new(), FetchState::TimedOut, None)
        }
    };
    statuses.push(FetchStatus {
        signal: signal.to_string(),
        state,
        error,
    });
    data
}

/// Error ratio and p95 latency delta; never looks at logs or metric values.
fn triage(ctx: &InvestigationContext) -> TriageSummary {
    let request = ctx.request();
    let thresholds = &ctx.config().triage;

    let traces = request.traces.len();
    let error_traces = request.traces.iter().filter(|t| t.has_error()).count();
    let error_ratio = if traces == 0 {
        0.0
    } else {
        error_traces as f64 / traces as f64
    };
    let baseline_p95_ms = p95(&request.baseline_traces);
    let target_p95_ms = p95(&request.traces);
    let p95_delta = match (baseline_p95_ms, target_p95_ms) {
        (Some(base), Some(target)) if base > 0.0 => Some((target - base) / base),
        _ => None,
    };

    let mut reasons = Vec::new();
    if error_ratio >= thresholds.error_ratio_threshold && error_traces > 0 {
        reasons.push(format!(
            "error ratio {:.3} >= {:.3}",
            error_ratio, thresholds.error_ratio_threshold
        ));
    }
    if let Some(delta) = p95_delta.filter(|d| *d >= thresholds.p95_delta_threshold) {
        reasons.push(format!(
            "p95 latency delta {:.3} >= {:.3}",
            delta, thresholds.p95_delta_threshold
        ));
    }
    if traces == 0 && (!request.logs.is_empty() || !request.metrics.is_empty()) {
        reasons.push("no traces in window; cannot rule out an issue".into());
    }

    let escalate = !reasons.is_empty();
    let reason = if escalate {
        reasons.join("; ")
    } else {
        format!(
            "error ratio {:.3} and p95 delta {} below thresholds",
            error_ratio,
            p95_delta.map_or_else(|| "n/a".to_string(), |d| format!("{:.3}", d))
        )
    };

    TriageSummary {
        traces,
        error_traces,
        error_ratio,
        baseline_p95_ms,
        target_p95_ms,
        p95_delta,
        escalate,
        reason,
        timed_out: false,
    }
}

/// Nearest-rank 95th percentile of trace durations.
fn p95(traces: &[Trace]) -> Option<f64> {
    if traces.is_empty() {
        return None;
    }
    let mut durations: Vec<f64> = traces.iter().map(Trace::duration_ms).collect();
    durations.sort_by(f64::total_cmp);
    let rank = ((0.95 * durations.len() as f64).ceil() as usize).clamp(1, durations.len());
    Some(durations[rank - 1])
}

fn summarize(report: &InvestigationReport) -> String {
    if let Some(cause) = report
        .hypothesis
        .as_ref()
        .and_then(|h| h.primary_cause.as_ref().map(|c| (c, h)))
    {
        let (service, hypothesis) = cause;
        return format!(
            "Likely origin '{}' ({} confidence), propagation depth {}",
            service, hypothesis.confidence, hypothesis.propagation_depth
        );
    }
    match report.trace_comparison.as_ref() {
        Some(comparison) => comparison.root_cause_hypothesis.clone(),
        None => match crate::findings::strongest(&report.findings) {
            Some(finding) => finding.description.clone(),
            None => "Escalated, but no analyzer produced findings".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Analyzer;
    use crate::telemetry::{LogEntry, MetricPoint, MetricSeries, Severity, Span, SpanStatus};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::collections::BTreeMap as Map;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap() + ChronoDuration::milliseconds(ms)
    }

    fn trace(id: &str, duration_ms: i64, status: SpanStatus) -> Trace {
        Trace::new(
            id,
            vec![Span {
                span_id: "root".into(),
                trace_id: id.into(),
                parent_span_id: None,
                name: "GET /orders".into(),
                start_time: at(1_000),
                end_time: at(1_000 + duration_ms),
                status,
                attributes: Map::new(),
            }],
        )
    }

    fn window() -> TimeWindow {
        TimeWindow::new(at(0), at(60_000))
    }

    struct Sleepy;

    impl Analyzer for Sleepy {
        fn kind(&self) -> AnalyzerKind {
            AnalyzerKind::MetricAnomalies
        }

        fn analyze(&self, _: &InvestigationContext) -> Result<AnalyzerOutput> {
            std::thread::sleep(std::time::Duration::from_millis(300));
            Err(AnalysisError::failure(self.kind(), "too late"))
        }
    }

    #[tokio::test]
    async fn test_healthy_window_resolves() {
        let mut request = InvestigationRequest::new(window());
        request.traces = (0..20)
            .map(|i| trace(&format!("t{}", i), 100, SpanStatus::Ok))
            .collect();
        request.baseline_traces = (0..20)
            .map(|i| trace(&format!("b{}", i), 100, SpanStatus::Ok))
            .collect();

        let report = StageOrchestrator::new(Config::default())
            .investigate(request)
            .await
            .unwrap();

        assert_eq!(report.outcome, Outcome::Resolved);
        let stages: Vec<Stage> = report.stages.iter().map(|s| s.stage).collect();
        assert_eq!(stages, vec![Stage::Init, Stage::Triage, Stage::Resolve, Stage::Done]);
        assert_eq!(report.status(AnalyzerKind::TraceDiff), Some(&AnalyzerStatus::Skipped));
        assert_eq!(report.triage.p95_delta, Some(0.0));
    }

    #[tokio::test]
    async fn test_errors_escalate_to_deep_dive() {
        let mut request = InvestigationRequest::new(window());
        request.traces = (0..9).map(|i| trace(&format!("ok{}", i), 100, SpanStatus::Ok)).collect();
        request.traces.push(trace("bad", 400, SpanStatus::Error));

        let report = StageOrchestrator::new(Config::default())
            .investigate(request)
            .await
            .unwrap();

        assert_eq!(report.outcome, Outcome::Investigated);
        assert!(report.triage.escalate);
        assert!((report.triage.error_ratio - 0.1).abs() < 1e-9);
        let stages: Vec<Stage> = report.stages.iter().map(|s| s.stage).collect();
        assert_eq!(
            stages,
            vec![Stage::Init, Stage::Triage, Stage::DeepDive, Stage::Report, Stage::Done]
        );
        assert_eq!(report.status(AnalyzerKind::TraceDiff), Some(&AnalyzerStatus::Ok));
        assert!(matches!(
            report.status(AnalyzerKind::LogPatterns),
            Some(AnalyzerStatus::InsufficientData { .. })
        ));
        assert!(matches!(
            report.status(AnalyzerKind::MetricAnomalies),
            Some(AnalyzerStatus::InsufficientData { .. })
        ));
        assert_eq!(report.status(AnalyzerKind::Correlation), Some(&AnalyzerStatus::Ok));
        assert_eq!(report.evidence.len(), 10);
        assert!(report.trace_comparison.is_some());
        assert_eq!(report.analyzer_status.len(), 5);
    }

    #[tokio::test]
    async fn test_slow_analyzer_times_out_without_blocking_siblings() {
        let mut config = Config::default();
        config.orchestrator.analyzer_timeout_ms = 50;
        let mut orchestrator = StageOrchestrator::new(config);
        orchestrator.registry_mut().register(Arc::new(Sleepy));

        let mut request = InvestigationRequest::new(window());
        request.traces = vec![
            trace("ok", 100, SpanStatus::Ok),
            trace("bad", 300, SpanStatus::Error),
        ];
        request.logs = vec![LogEntry::new(at(1_200), Severity::Error, "order lookup failed")];

        let report = orchestrator.investigate(request).await.unwrap();
        assert_eq!(
            report.status(AnalyzerKind::MetricAnomalies),
            Some(&AnalyzerStatus::TimedOut { timeout_ms: 50 })
        );
        assert_eq!(report.status(AnalyzerKind::TraceDiff), Some(&AnalyzerStatus::Ok));
        assert_eq!(report.status(AnalyzerKind::LogPatterns), Some(&AnalyzerStatus::Ok));
        assert_eq!(report.log_clusters.len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_anomaly_detection_is_skipped() {
        let mut config = Config::default();
        config.anomaly_detection.enabled = false;
        let mut request = InvestigationRequest::new(window());
        request.traces = vec![trace("bad", 300, SpanStatus::Error)];
        request.metrics = vec![MetricSeries::new(
            "latency",
            (0..40).map(|i| MetricPoint::new(at(i * 1_000), 10.0)).collect(),
        )];

        let report = StageOrchestrator::new(config).investigate(request).await.unwrap();
        assert_eq!(
            report.status(AnalyzerKind::MetricAnomalies),
            Some(&AnalyzerStatus::Skipped)
        );
        assert_eq!(report.status(AnalyzerKind::TraceDiff), Some(&AnalyzerStatus::Ok));
        assert!(report.anomaly_windows.is_empty());
        assert_eq!(report.analyzer_status.len(), 5);
    }

    #[tokio::test]
    async fn test_missing_analyzer_is_unavailable() {
        let orchestrator =
            StageOrchestrator::with_registry(Config::default(), AnalyzerRegistry::empty());
        let mut request = InvestigationRequest::new(window());
        request.traces = vec![trace("bad", 300, SpanStatus::Error)];

        let report = orchestrator.investigate(request).await.unwrap();
        assert!(report
            .analyzer_status
            .values()
            .all(|s| matches!(s, AnalyzerStatus::Unavailable { .. })));
        assert_eq!(report.stages.last().map(|s| s.stage), Some(Stage::Done));
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected() {
        let mut request = InvestigationRequest::new(TimeWindow::new(at(10), at(0)));
        request.metrics = vec![MetricSeries::new("cpu", vec![MetricPoint::new(at(1), 1.0)])];
        let err = StageOrchestrator::new(Config::default())
            .investigate(request)
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidTelemetry(_)));
    }

    #[test]
    fn test_p95_nearest_rank() {
        let traces: Vec<Trace> = (1..=20)
            .map(|i| trace(&format!("t{}", i), i * 10, SpanStatus::Ok))
            .collect();
        assert_eq!(p95(&traces), Some(190.0));
        assert_eq!(p95(&[]), None);
    }
}
