pub mod analysis;
pub mod anomaly;
pub mod cache;
pub mod clustering;
pub mod config;
pub mod context;
pub mod correlate;
pub mod diff;
pub mod error;
pub mod findings;
pub mod forest;
pub mod graph;
pub mod ingest;
pub mod orchestrator;
pub mod source;
pub mod telemetry;

pub use analysis::{Analyzer, AnalyzerKind, AnalyzerOutput, AnalyzerRegistry};
pub use anomaly::{AnomalyWindow, MetricAnomalyDetector};
pub use cache::MemoCache;
pub use clustering::{LogCluster, LogPatternClusterer};
pub use config::Config;
pub use context::{InvestigationContext, InvestigationRequest};
pub use correlate::{EvidenceBundle, ExemplarCorrelator};
pub use diff::{Assessment, TraceComparisonReport, TraceDiffer};
pub use error::{AnalysisError, Result};
pub use findings::{EvidenceRef, Finding, FindingKind};
pub use graph::{CausalGraph, CausalGraphBuilder, RootCauseHypothesis};
pub use ingest::LogIngestor;
pub use orchestrator::{AnalyzerStatus, InvestigationReport, Stage, StageOrchestrator};
pub use source::{InMemorySource, TelemetrySource};
pub use telemetry::{
    LogEntry, MetricPoint, MetricSeries, Severity, Span, SpanStatus, TimeWindow, Trace,
};
