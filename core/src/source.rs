use crate::telemetry::{LogEntry, MetricPoint, MetricSeries, TimeWindow, Trace};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

/// Where an investigation gets its telemetry from.
///
/// Vendor-specific fetching lives outside this crate; implementations hand
/// over already-parsed data for a time range.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Traces with at least one span overlapping `window`
    async fn fetch_traces(&self, window: &TimeWindow) -> Result<Vec<Trace>>;

    /// Log entries with a timestamp inside `window`
    async fn fetch_logs(&self, window: &TimeWindow) -> Result<Vec<LogEntry>>;

    /// Series restricted to points inside `range`
    async fn fetch_metrics(&self, range: &TimeWindow) -> Result<Vec<MetricSeries>>;
}

/// Telemetry held in memory, filtered by time on fetch
#[derive(Default)]
pub struct InMemorySource {
    traces: RwLock<Vec<Trace>>,
    logs: RwLock<Vec<LogEntry>>,
    metrics: RwLock<Vec<MetricSeries>>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_traces(&self, traces: impl IntoIterator<Item = Trace>) {
        self.traces.write().await.extend(traces);
    }

    pub async fn add_logs(&self, logs: impl IntoIterator<Item = LogEntry>) {
        self.logs.write().await.extend(logs);
    }

    pub async fn add_metrics(&self, metrics: impl IntoIterator<Item = MetricSeries>) {
        self.metrics.write().await.extend(metrics);
    }
}

#[async_trait]
impl TelemetrySource for InMemorySource {
    async fn fetch_traces(&self, window: &TimeWindow) -> Result<Vec<Trace>> {
        let traces = self.traces.read().await;
        Ok(traces
            .iter()
            .filter(|t| t.spans.iter().any(|s| s.overlaps(window.start, window.end)))
            .cloned()
            .collect())
    }

    async fn fetch_logs(&self, window: &TimeWindow) -> Result<Vec<LogEntry>> {
        let logs = self.logs.read().await;
        Ok(logs
            .iter()
            .filter(|l| window.contains(l.timestamp))
            .cloned()
            .collect())
    }

    async fn fetch_metrics(&self, range: &TimeWindow) -> Result<Vec<MetricSeries>> {
        let metrics = self.metrics.read().await;
        Ok(metrics
            .iter()
            .map(|series| MetricSeries {
                name: series.name.clone(),
                labels: series.labels.clone(),
                points: series
                    .points
                    .iter()
                    .filter(|p| range.contains(p.timestamp))
                    .cloned()
                    .collect::<Vec<MetricPoint>>(),
            })
            .filter(|series| !series.points.is_empty())
            .collect())
    }
}
