use crate::anomaly::AnomalyWindow;
use crate::cache::{CacheStats, MemoCache};
use crate::clustering::{ClusterId, LogCluster};
use crate::config::CorrelationConfig;
use crate::telemetry::{TimeWindow, Trace};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

/// How a piece of evidence was linked to a trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    TraceId,
    SpanId,
    TimeOverlap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedCluster {
    pub cluster_id: ClusterId,
    pub template: String,
    pub count: u64,
    pub joined_by: JoinKind,
}

/// Everything linked to one trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub trace_id: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub services: Vec<String>,
    pub has_error: bool,
    pub log_clusters: Vec<LinkedCluster>,
    pub anomaly_windows: Vec<AnomalyWindow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceExemplar {
    pub trace_id: String,
    pub duration_ms: f64,
    pub has_error: bool,
}

/// Representative traces for one anomaly window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyExemplars {
    pub window: AnomalyWindow,
    pub traces: Vec<TraceExemplar>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorrelationReport {
    pub bundles: Vec<EvidenceBundle>,
    pub anomaly_exemplars: Vec<AnomalyExemplars>,
    pub cache: CacheStats,
}

/// Joins clusters and anomaly windows to traces, memoizing per trace id.
///
/// One correlator belongs to one investigation; its cache is never shared.
#[derive(Default)]
pub struct ExemplarCorrelator {
    config: CorrelationConfig,
    bundles: MemoCache<String, EvidenceBundle>,
}

impl ExemplarCorrelator {
    pub fn new(config: CorrelationConfig) -> Self {
        Self {
            config,
            bundles: MemoCache::new(),
        }
    }

    /// One bundle per distinct trace id, in first-seen order.
    pub fn correlate(
        &self,
        window: &TimeWindow,
        traces: &[Trace],
        clusters: &[LogCluster],
        anomalies: &[AnomalyWindow],
    ) -> Vec<Arc<EvidenceBundle>> {
        let mut seen = HashSet::new();
        traces
            .iter()
            .filter(|trace| seen.insert(trace.trace_id.as_str()))
            .map(|trace| self.bundle(window, trace, clusters, anomalies))
            .collect()
    }

    /// Bundle for a single trace; later calls for the same trace id return the first result.
    pub fn bundle(
        &self,
        window: &TimeWindow,
        trace: &Trace,
        clusters: &[LogCluster],
        anomalies: &[AnomalyWindow],
    ) -> Arc<EvidenceBundle> {
        self.bundles.get_or_compute(trace.trace_id.clone(), || {
            tracing::trace!(trace_id = %trace.trace_id, "building evidence bundle");
            build_bundle(window, trace, clusters, anomalies)
        })
    }

    /// Traces overlapping each anomaly; erroring traces first, then the longest.
    pub fn exemplars(
        &self,
        traces: &[Trace],
        anomalies: &[AnomalyWindow],
    ) -> Vec<AnomalyExemplars> {
        anomalies
            .iter()
            .map(|window| {
                let mut candidates: Vec<TraceExemplar> = traces
                    .iter()
                    .filter(|t| match (t.start_time(), t.end_time()) {
                        (Some(start), Some(end)) => window.overlaps(start, end),
                        _ => false,
                    })
                    .map(|t| TraceExemplar {
                        trace_id: t.trace_id.clone(),
                        duration_ms: t.duration_ms(),
                        has_error: t.has_error(),
                    })
                    .collect();
                candidates.sort_by(|a, b| {
                    b.has_error
                        .cmp(&a.has_error)
                        .then(
                            b.duration_ms
                                .partial_cmp(&a.duration_ms)
                                .unwrap_or(Ordering::Equal),
                        )
                        .then(a.trace_id.cmp(&b.trace_id))
                });
                candidates.dedup_by(|a, b| a.trace_id == b.trace_id);
                candidates.truncate(self.config.exemplars_per_anomaly);
                AnomalyExemplars {
                    window: window.clone(),
                    traces: candidates,
                }
            })
            .collect()
    }

    pub fn report(
        &self,
        window: &TimeWindow,
        traces: &[Trace],
        clusters: &[LogCluster],
        anomalies: &[AnomalyWindow],
    ) -> CorrelationReport {
        let bundles = self
            .correlate(window, traces, clusters, anomalies)
            .into_iter()
            .map(|bundle| (*bundle).clone())
            .collect();
        CorrelationReport {
            bundles,
            anomaly_exemplars: self.exemplars(traces, anomalies),
            cache: self.bundles.stats(),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.bundles.stats()
    }
}

fn build_bundle(
    window: &TimeWindow,
    trace: &Trace,
    clusters: &[LogCluster],
    anomalies: &[AnomalyWindow],
) -> EvidenceBundle {
    // Time joins only count inside the investigation window.
    let range = match (trace.start_time(), trace.end_time()) {
        (Some(start), Some(end)) if window.overlaps(start, end) => {
            Some((start.max(window.start), end.min(window.end)))
        }
        _ => None,
    };

    let log_clusters = clusters
        .iter()
        .filter_map(|cluster| {
            let joined_by = if !cluster.has_id_links() {
                let (start, end) = range?;
                cluster.overlaps(start, end).then_some(JoinKind::TimeOverlap)?
            } else if cluster.mentions_trace(&trace.trace_id) {
                JoinKind::TraceId
            } else if trace.spans.iter().any(|s| cluster.mentions_span(&s.span_id)) {
                JoinKind::SpanId
            } else {
                return None;
            };
            Some(LinkedCluster {
                cluster_id: cluster.id,
                template: cluster.template.to_string(),
                count: cluster.count,
                joined_by,
            })
        })
        .collect();

    let anomaly_windows = match range {
        Some((start, end)) => anomalies
            .iter()
            .filter(|a| a.overlaps(start, end))
            .cloned()
            .collect(),
        None => Vec::new(),
    };

    EvidenceBundle {
        trace_id: trace.trace_id.clone(),
        start: trace.start_time(),
        end: trace.end_time(),
        services: trace.services(),
        has_error: trace.has_error(),
        log_clusters,
        anomaly_windows,
    }
}
