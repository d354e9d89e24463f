use crate::analysis::AnalyzerKind;
use thiserror::Error;

/// Errors raised by the analysis engine.
///
/// Only `MalformedTrace` and `InvalidTelemetry` are produced at the ingestion
/// boundary; the analyzer variants are produced by the orchestrator when it
/// isolates a degraded analyzer.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// Cyclic or dangling parent references, duplicate span ids, or spans that
    /// end before they start.
    #[error("malformed trace {trace_id}: {reason}")]
    MalformedTrace { trace_id: String, reason: String },

    /// The baseline window holds too few samples to estimate dispersion.
    #[error("insufficient baseline data for {series}: {found} samples, need {required}")]
    InsufficientData {
        series: String,
        found: usize,
        required: usize,
    },

    #[error("{analyzer} timed out after {timeout_ms}ms")]
    AnalyzerTimeout {
        analyzer: AnalyzerKind,
        timeout_ms: u64,
    },

    #[error("{analyzer} failed: {message}")]
    AnalyzerFailure {
        analyzer: AnalyzerKind,
        message: String,
    },

    /// Logs, metric series or requests that fail schema validation.
    #[error("invalid telemetry: {0}")]
    InvalidTelemetry(String),

    /// A producer could not hand a log line to the ingestion queue in time.
    #[error("log ingestion stalled: queue full for {timeout_ms}ms")]
    IngestionStalled { timeout_ms: u64 },

    #[error("log ingestion queue closed")]
    IngestionClosed,
}

impl AnalysisError {
    pub fn malformed(trace_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedTrace {
            trace_id: trace_id.into(),
            reason: reason.into(),
        }
    }

    pub fn failure(analyzer: AnalyzerKind, message: impl Into<String>) -> Self {
        Self::AnalyzerFailure {
            analyzer,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
