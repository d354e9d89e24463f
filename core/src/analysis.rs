use crate::anomaly::{MetricAnomalyDetector, MultiSeriesDetection};
use crate::clustering::{ClusterId, LogCluster, LogPatternClusterer};
use crate::context::InvestigationContext;
use crate::correlate::CorrelationReport;
use crate::diff::{TraceComparisonReport, TraceDiffer};
use crate::error::{AnalysisError, Result};
use crate::findings::{EvidenceRef, Finding, FindingKind};
use crate::graph::{CausalGraphBuilder, EdgeSummary, RootCauseHypothesis};
use crate::ingest::LogIngestor;
use crate::orchestrator::Stage;
use crate::telemetry::Trace;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyzerKind {
    TraceDiff,
    LogPatterns,
    MetricAnomalies,
    Correlation,
    CausalGraph,
}

impl AnalyzerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalyzerKind::TraceDiff => "trace_diff",
            AnalyzerKind::LogPatterns => "log_patterns",
            AnalyzerKind::MetricAnomalies => "metric_anomalies",
            AnalyzerKind::Correlation => "correlation",
            AnalyzerKind::CausalGraph => "causal_graph",
        }
    }
}

impl fmt::Display for AnalyzerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Analyzers each stage runs. Fixed at compile time.
pub fn capabilities(stage: Stage) -> &'static [AnalyzerKind] {
    match stage {
        Stage::DeepDive => &[
            AnalyzerKind::TraceDiff,
            AnalyzerKind::LogPatterns,
            AnalyzerKind::MetricAnomalies,
        ],
        Stage::Report => &[AnalyzerKind::Correlation, AnalyzerKind::CausalGraph],
        Stage::Init | Stage::Triage | Stage::Resolve | Stage::Done => &[],
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPatternsOutput {
    pub ingested: usize,
    pub clusters: Vec<LogCluster>,
    pub anomalous: Vec<ClusterId>,
    pub evicted: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CausalOutput {
    pub hypothesis: RootCauseHypothesis,
    pub edges: Vec<EdgeSummary>,
    pub skipped_traces: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "analyzer", content = "result", rename_all = "snake_case")]
pub enum AnalyzerOutput {
    TraceDiff(Box<TraceComparisonReport>),
    LogPatterns(LogPatternsOutput),
    MetricAnomalies(MultiSeriesDetection),
    Correlation(CorrelationReport),
    CausalGraph(Box<CausalOutput>),
}

impl AnalyzerOutput {
    pub fn kind(&self) -> AnalyzerKind {
        match self {
            AnalyzerOutput::TraceDiff(_) => AnalyzerKind::TraceDiff,
            AnalyzerOutput::LogPatterns(_) => AnalyzerKind::LogPatterns,
            AnalyzerOutput::MetricAnomalies(_) => AnalyzerKind::MetricAnomalies,
            AnalyzerOutput::Correlation(_) => AnalyzerKind::Correlation,
            AnalyzerOutput::CausalGraph(_) => AnalyzerKind::CausalGraph,
        }
    }

    pub fn findings(&self) -> Vec<Finding> {
        match self {
            AnalyzerOutput::TraceDiff(report) => report.findings.clone(),
            AnalyzerOutput::LogPatterns(output) => output
                .clusters
                .iter()
                .filter(|c| output.anomalous.contains(&c.id))
                .map(|c| {
                    let confidence = if c.novel {
                        c.error_share().max(0.5)
                    } else {
                        c.error_share()
                    };
                    Finding::new(
                        FindingKind::LogAnomaly,
                        EvidenceRef::LogCluster {
                            cluster_id: c.id,
                            template: c.template.to_string(),
                        },
                        c.count as f64,
                        confidence,
                        format!(
                            "{} template '{}' seen {} times ({} errors)",
                            if c.novel { "new" } else { "error-dominant" },
                            c.template,
                            c.count,
                            c.error_count()
                        ),
                    )
                })
                .collect(),
            AnalyzerOutput::MetricAnomalies(detection) => detection
                .windows
                .iter()
                .map(|w| {
                    Finding::new(
                        FindingKind::MetricAnomaly,
                        EvidenceRef::Metric {
                            series: w.series.clone(),
                            start: w.start,
                            end: w.end,
                        },
                        w.severity,
                        0.25 * (w.series.len() + 1) as f64,
                        format!(
                            "{} deviated from baseline by up to {:.2}",
                            w.series.join(", "),
                            w.severity
                        ),
                    )
                })
                .collect(),
            // Reported through the hypothesis, not as individual findings.
            AnalyzerOutput::Correlation(_) | AnalyzerOutput::CausalGraph(_) => Vec::new(),
        }
    }
}

/// A unit of analysis run by the orchestrator.
///
/// Implementations are synchronous and CPU bound; the orchestrator runs each
/// one on the blocking pool under its own timeout.
pub trait Analyzer: Send + Sync {
    fn kind(&self) -> AnalyzerKind;

    fn analyze(&self, ctx: &InvestigationContext) -> Result<AnalyzerOutput>;
}

/// Analyzer implementations keyed by kind; the stage table decides which run.
#[derive(Clone)]
pub struct AnalyzerRegistry {
    analyzers: BTreeMap<AnalyzerKind, Arc<dyn Analyzer>>,
}

impl AnalyzerRegistry {
    pub fn empty() -> Self {
        Self {
            analyzers: BTreeMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(TraceDiffAnalyzer));
        registry.register(Arc::new(LogPatternAnalyzer));
        registry.register(Arc::new(MetricAnomalyAnalyzer));
        registry.register(Arc::new(CorrelationAnalyzer));
        registry.register(Arc::new(CausalGraphAnalyzer));
        registry
    }

    /// Install an analyzer, returning the one it replaced.
    pub fn register(&mut self, analyzer: Arc<dyn Analyzer>) -> Option<Arc<dyn Analyzer>> {
        self.analyzers.insert(analyzer.kind(), analyzer)
    }

    pub fn get(&self, kind: AnalyzerKind) -> Option<Arc<dyn Analyzer>> {
        self.analyzers.get(&kind).cloned()
    }

    pub fn for_stage(&self, stage: Stage) -> Vec<(AnalyzerKind, Option<Arc<dyn Analyzer>>)> {
        capabilities(stage)
            .iter()
            .map(|kind| (*kind, self.get(*kind)))
            .collect()
    }
}

impl Default for AnalyzerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

pub struct TraceDiffAnalyzer;

impl Analyzer for TraceDiffAnalyzer {
    fn kind(&self) -> AnalyzerKind {
        AnalyzerKind::TraceDiff
    }

    fn analyze(&self, ctx: &InvestigationContext) -> Result<AnalyzerOutput> {
        let request = ctx.request();
        let (baseline, target) =
            pick_comparison(&request.traces, &request.baseline_traces).ok_or_else(|| {
                AnalysisError::InsufficientData {
                    series: "traces".into(),
                    found: request.traces.len() + request.baseline_traces.len(),
                    required: 2,
                }
            })?;
        tracing::debug!(
            investigation_id = %ctx.id(),
            baseline = %baseline.trace_id,
            target = %target.trace_id,
            "comparing traces"
        );
        let report = TraceDiffer::new(ctx.config().trace_diff.clone()).diff(baseline, target)?;
        Ok(AnalyzerOutput::TraceDiff(Box::new(report)))
    }
}

pub struct LogPatternAnalyzer;

impl Analyzer for LogPatternAnalyzer {
    fn kind(&self) -> AnalyzerKind {
        AnalyzerKind::LogPatterns
    }

    fn analyze(&self, ctx: &InvestigationContext) -> Result<AnalyzerOutput> {
        let request = ctx.request();
        if request.logs.is_empty() {
            return Err(AnalysisError::InsufficientData {
                series: "logs".into(),
                found: 0,
                required: 1,
            });
        }

        let config = ctx.config();
        let clusterer = if request.prior_clusters.is_empty() {
            LogPatternClusterer::new(config.log_clustering.clone())
        } else {
            LogPatternClusterer::from_snapshot(
                config.log_clustering.clone(),
                request.prior_clusters.clone(),
            )
        };

        let mut entries: Vec<_> = request.logs.iter().collect();
        if config.log_clustering.canonicalize {
            entries.sort_by_key(|e| e.timestamp);
        }
        let ingestor = LogIngestor::new(&config.ingestion, clusterer);
        for entry in entries {
            ingestor.submit(entry.clone())?;
        }
        let clusterer = ingestor.finish();

        let anomalous = clusterer.anomalous().iter().map(|c| c.id).collect();
        Ok(AnalyzerOutput::LogPatterns(LogPatternsOutput {
            ingested: request.logs.len(),
            clusters: clusterer.snapshot(),
            anomalous,
            evicted: clusterer.evicted(),
        }))
    }
}

pub struct MetricAnomalyAnalyzer;

impl Analyzer for MetricAnomalyAnalyzer {
    fn kind(&self) -> AnalyzerKind {
        AnalyzerKind::MetricAnomalies
    }

    fn analyze(&self, ctx: &InvestigationContext) -> Result<AnalyzerOutput> {
        let request = ctx.request();
        let detector = MetricAnomalyDetector::new(ctx.config().anomaly_detection.clone());
        let detection = detector.detect_many(&request.metrics, request.window.start);
        if request.metrics.is_empty() || detection.all_insufficient() {
            return Err(AnalysisError::InsufficientData {
                series: "metrics".into(),
                found: 0,
                required: ctx.config().anomaly_detection.min_samples,
            });
        }
        Ok(AnalyzerOutput::MetricAnomalies(detection))
    }
}

pub struct CorrelationAnalyzer;

impl Analyzer for CorrelationAnalyzer {
    fn kind(&self) -> AnalyzerKind {
        AnalyzerKind::Correlation
    }

    fn analyze(&self, ctx: &InvestigationContext) -> Result<AnalyzerOutput> {
        let request = ctx.request();
        let evidence = ctx.evidence();
        let report = ctx.correlator().report(
            &request.window,
            &request.traces,
            &evidence.clusters,
            &evidence.anomaly_windows,
        );
        Ok(AnalyzerOutput::Correlation(report))
    }
}

pub struct CausalGraphAnalyzer;

impl Analyzer for CausalGraphAnalyzer {
    fn kind(&self) -> AnalyzerKind {
        AnalyzerKind::CausalGraph
    }

    fn analyze(&self, ctx: &InvestigationContext) -> Result<AnalyzerOutput> {
        let builder = CausalGraphBuilder::new(ctx.config().causal.clone());
        let graph = builder.build(&ctx.request().traces);
        let hypothesis = builder.hypothesize(&graph);
        Ok(AnalyzerOutput::CausalGraph(Box::new(CausalOutput {
            hypothesis,
            edges: graph.edges(),
            skipped_traces: graph.skipped_traces().to_vec(),
        })))
    }
}

/// Pick (baseline, target): the target is the slowest failing trace (or the
/// slowest trace), the baseline the closest-to-median healthy trace of the
/// same root operation, taken from `baseline` when given.
pub fn pick_comparison<'a>(
    traces: &'a [Trace],
    baseline: &'a [Trace],
) -> Option<(&'a Trace, &'a Trace)> {
    let slowest = |pool: &mut dyn Iterator<Item = &'a Trace>| {
        pool.max_by(|a, b| {
            a.duration_ms()
                .total_cmp(&b.duration_ms())
                .then_with(|| b.trace_id.cmp(&a.trace_id))
        })
    };
    let target = slowest(&mut traces.iter().filter(|t| t.has_error()))
        .or_else(|| slowest(&mut traces.iter()))?;

    let pool: Vec<&Trace> = if baseline.is_empty() {
        traces.iter().filter(|t| t.trace_id != target.trace_id).collect()
    } else {
        baseline.iter().collect()
    };

    let narrow = |pool: Vec<&'a Trace>, keep: &dyn Fn(&Trace) -> bool| -> Vec<&'a Trace> {
        let kept: Vec<&Trace> = pool.iter().copied().filter(|t| keep(t)).collect();
        if kept.is_empty() {
            pool
        } else {
            kept
        }
    };
    let pool = narrow(pool, &|t| t.root_name() == target.root_name());
    let pool = narrow(pool, &|t| !t.has_error());
    if pool.is_empty() {
        return None;
    }

    let mut durations: Vec<f64> = pool.iter().map(|t| t.duration_ms()).collect();
    durations.sort_by(f64::total_cmp);
    let median = durations[durations.len() / 2];

    let chosen = pool.into_iter().min_by(|a, b| {
        (a.duration_ms() - median)
            .abs()
            .total_cmp(&(b.duration_ms() - median).abs())
            .then_with(|| a.trace_id.cmp(&b.trace_id))
    })?;
    Some((chosen, target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{Span, SpanStatus};
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::BTreeMap;

    fn trace(id: &str, name: &str, duration_ms: i64, status: SpanStatus) -> Trace {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        Trace::new(
            id,
            vec![Span {
                span_id: "root".into(),
                trace_id: id.into(),
                parent_span_id: None,
                name: name.into(),
                start_time: start,
                end_time: start + Duration::milliseconds(duration_ms),
                status,
                attributes: BTreeMap::new(),
            }],
        )
    }

    #[test]
    fn capability_table_is_fixed_per_stage() {
        assert_eq!(
            capabilities(Stage::DeepDive),
            &[
                AnalyzerKind::TraceDiff,
                AnalyzerKind::LogPatterns,
                AnalyzerKind::MetricAnomalies
            ]
        );
        assert!(capabilities(Stage::Triage).is_empty());
        assert_eq!(capabilities(Stage::Report).len(), 2);
    }

    #[test]
    fn registry_replaces_by_kind() {
        struct Stub;
        impl Analyzer for Stub {
            fn kind(&self) -> AnalyzerKind {
                AnalyzerKind::LogPatterns
            }
            fn analyze(&self, _: &InvestigationContext) -> Result<AnalyzerOutput> {
                Err(AnalysisError::failure(self.kind(), "stub"))
            }
        }

        let mut registry = AnalyzerRegistry::with_defaults();
        assert!(registry.register(Arc::new(Stub)).is_some());
        let stage = registry.for_stage(Stage::DeepDive);
        assert_eq!(stage.len(), 3);
        assert!(stage.iter().all(|(_, a)| a.is_some()));
        assert!(AnalyzerRegistry::empty()
            .for_stage(Stage::DeepDive)
            .iter()
            .all(|(_, a)| a.is_none()));
    }

    #[test]
    fn comparison_targets_slowest_failure_against_typical_baseline() {
        let traces = vec![
            trace("ok-1", "GET /a", 100, SpanStatus::Ok),
            trace("ok-2", "GET /a", 120, SpanStatus::Ok),
            trace("ok-3", "GET /a", 900, SpanStatus::Ok),
            trace("err-1", "GET /a", 400, SpanStatus::Error),
            trace("err-2", "GET /a", 300, SpanStatus::Error),
            trace("other", "GET /b", 110, SpanStatus::Ok),
        ];
        let (baseline, target) = pick_comparison(&traces, &[]).unwrap();
        assert_eq!(target.trace_id, "err-1");
        assert_eq!(baseline.trace_id, "ok-2");
    }

    #[test]
    fn comparison_prefers_explicit_baseline() {
        let traces = vec![trace("now", "GET /a", 400, SpanStatus::Ok)];
        let baseline = vec![trace("then", "GET /a", 90, SpanStatus::Ok)];
        let (b, t) = pick_comparison(&traces, &baseline).unwrap();
        assert_eq!((b.trace_id.as_str(), t.trace_id.as_str()), ("then", "now"));
        assert!(pick_comparison(&traces, &[]).is_none());
    }
}
