use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Main configuration structure for Faultline.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub triage: TriageConfig,

    #[serde(default)]
    pub trace_diff: TraceDiffConfig,

    #[serde(default)]
    pub log_clustering: LogClusteringConfig,

    #[serde(default)]
    pub ingestion: IngestionConfig,

    #[serde(default)]
    pub anomaly_detection: AnomalyDetectionConfig,

    #[serde(default)]
    pub correlation: CorrelationConfig,

    #[serde(default)]
    pub causal: CausalConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

        let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the file is missing.
    pub fn from_file_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    "Failed to load config from {:?}: {}. Using defaults.",
                    path.as_ref(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Get the default configuration as a TOML string.
    pub fn default_toml() -> Result<String> {
        let config = Self::default();
        toml::to_string_pretty(&config).context("Failed to serialize default config")
    }

    /// Validate the configuration for obvious misconfiguration.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be 0");
        }

        let ratio = |name: &str, value: f64| -> Result<()> {
            if !(0.0..=1.0).contains(&value) || value.is_nan() {
                anyhow::bail!("{} must be within 0.0..=1.0, got {}", name, value);
            }
            Ok(())
        };
        ratio(
            "triage.error_ratio_threshold",
            self.triage.error_ratio_threshold,
        )?;
        ratio(
            "log_clustering.similarity_threshold",
            self.log_clustering.similarity_threshold,
        )?;

        if self.triage.p95_delta_threshold < 0.0 {
            anyhow::bail!("triage.p95_delta_threshold cannot be negative");
        }
        if self.triage.timeout_ms == 0 || self.orchestrator.analyzer_timeout_ms == 0 {
            anyhow::bail!("Stage timeouts must be greater than 0");
        }
        if self.orchestrator.fetch_timeout_ms == 0 {
            anyhow::bail!("orchestrator.fetch_timeout_ms must be greater than 0");
        }

        if self.trace_diff.top_k == 0 {
            anyhow::bail!("trace_diff.top_k must be greater than 0");
        }
        if self.trace_diff.fanout_threshold < 2 {
            anyhow::bail!("trace_diff.fanout_threshold must be at least 2");
        }
        if self.trace_diff.assessment_threshold < 0.0 {
            anyhow::bail!("trace_diff.assessment_threshold cannot be negative");
        }

        if self.log_clustering.max_clusters == 0 {
            anyhow::bail!("log_clustering.max_clusters must be greater than 0");
        }
        if self.log_clustering.prefix_depth == 0 {
            anyhow::bail!("log_clustering.prefix_depth must be greater than 0");
        }

        if self.ingestion.queue_capacity == 0 || self.ingestion.workers == 0 {
            anyhow::bail!("ingestion.queue_capacity and ingestion.workers must be greater than 0");
        }

        if self.anomaly_detection.mad_multiplier <= 0.0 {
            anyhow::bail!("anomaly_detection.mad_multiplier must be positive");
        }
        if self.anomaly_detection.min_samples < 2 {
            anyhow::bail!("anomaly_detection.min_samples must be at least 2");
        }

        if self.causal.dominance_ratio < 1.0 {
            anyhow::bail!("causal.dominance_ratio must be at least 1.0");
        }
        if self.causal.inbound_ratio < 0.0 {
            anyhow::bail!("causal.inbound_ratio cannot be negative");
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => anyhow::bail!("Invalid log level: {}", other),
        }

        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).context("Failed to parse config")?;
        Ok(config)
    }
}

/// HTTP ingestion boundary configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub verbose: bool,

    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            verbose: false,
            cors_enabled: true,
            cors_origins: default_cors_origins(),
        }
    }
}

/// Cheap checks that decide whether an investigation escalates.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TriageConfig {
    /// Escalate when erroring traces / all traces reaches this ratio.
    #[serde(default = "default_error_ratio_threshold")]
    pub error_ratio_threshold: f64,

    /// Escalate when (target p95 - baseline p95) / baseline p95 reaches this value.
    #[serde(default = "default_p95_delta_threshold")]
    pub p95_delta_threshold: f64,

    #[serde(default = "default_triage_timeout")]
    pub timeout_ms: u64,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            error_ratio_threshold: default_error_ratio_threshold(),
            p95_delta_threshold: default_p95_delta_threshold(),
            timeout_ms: default_triage_timeout(),
        }
    }
}

impl TriageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TraceDiffConfig {
    /// Number of self-time regressions reported.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Minimum same-name sequential children for a fan-out finding.
    #[serde(default = "default_fanout_threshold")]
    pub fanout_threshold: usize,

    /// Self-time deltas at or below this are treated as noise.
    #[serde(default = "default_min_delta_ms")]
    pub min_delta_ms: f64,

    /// Net weighted score above which a comparison is regressed (below its negation, improved).
    #[serde(default = "default_assessment_threshold")]
    pub assessment_threshold: f64,

    #[serde(default = "default_latency_weight")]
    pub latency_weight: f64,

    #[serde(default = "default_error_weight")]
    pub error_weight: f64,

    #[serde(default = "default_structural_weight")]
    pub structural_weight: f64,

    #[serde(default = "default_fanout_weight")]
    pub fanout_weight: f64,
}

impl Default for TraceDiffConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            fanout_threshold: default_fanout_threshold(),
            min_delta_ms: default_min_delta_ms(),
            assessment_threshold: default_assessment_threshold(),
            latency_weight: default_latency_weight(),
            error_weight: default_error_weight(),
            structural_weight: default_structural_weight(),
            fanout_weight: default_fanout_weight(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogClusteringConfig {
    /// A candidate matches only when its similarity is strictly above this.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,

    /// Leading tokens used to index candidate templates.
    #[serde(default = "default_prefix_depth")]
    pub prefix_depth: usize,

    #[serde(default = "default_max_clusters")]
    pub max_clusters: usize,

    /// Trace/span identifiers remembered per cluster.
    #[serde(default = "default_max_exemplars")]
    pub max_exemplars: usize,

    /// Sort entries by timestamp before ingesting a batch.
    #[serde(default)]
    pub canonicalize: bool,

    /// Clusters whose error-severity share reaches this are anomalous.
    #[serde(default = "default_error_dominance")]
    pub error_dominance: f64,
}

impl Default for LogClusteringConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            prefix_depth: default_prefix_depth(),
            max_clusters: default_max_clusters(),
            max_exemplars: default_max_exemplars(),
            canonicalize: false,
            error_dominance: default_error_dominance(),
        }
    }
}

/// Bounded log ingestion queue.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestionConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_submit_timeout")]
    pub submit_timeout_ms: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            workers: default_workers(),
            submit_timeout_ms: default_submit_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnomalyDetectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_mad_multiplier")]
    pub mad_multiplier: f64,

    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    /// Largest gap between anomalous points merged into one window.
    /// Defaults to the series' median sample interval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_gap_ms: Option<u64>,
}

impl Default for AnomalyDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mad_multiplier: default_mad_multiplier(),
            min_samples: default_min_samples(),
            merge_gap_ms: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CorrelationConfig {
    #[serde(default = "default_exemplars_per_anomaly")]
    pub exemplars_per_anomaly: usize,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            exemplars_per_anomaly: default_exemplars_per_anomaly(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CausalConfig {
    /// Originator error-weight over every other candidate needed for `high`.
    #[serde(default = "default_dominance_ratio")]
    pub dominance_ratio: f64,

    /// A node is an originator candidate when inbound error-weight <= ratio * outbound.
    #[serde(default = "default_inbound_ratio")]
    pub inbound_ratio: f64,
}

impl Default for CausalConfig {
    fn default() -> Self {
        Self {
            dominance_ratio: default_dominance_ratio(),
            inbound_ratio: default_inbound_ratio(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_analyzer_timeout")]
    pub analyzer_timeout_ms: u64,

    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            analyzer_timeout_ms: default_analyzer_timeout(),
            fetch_timeout_ms: default_fetch_timeout(),
        }
    }
}

impl OrchestratorConfig {
    pub fn analyzer_timeout(&self) -> Duration {
        Duration::from_millis(self.analyzer_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub include_modules: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            include_modules: false,
        }
    }
}

// Default providers ---------------------------------------------------------

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_error_ratio_threshold() -> f64 {
    0.05
}

fn default_p95_delta_threshold() -> f64 {
    0.2
}

fn default_triage_timeout() -> u64 {
    5_000
}

fn default_top_k() -> usize {
    5
}

fn default_fanout_threshold() -> usize {
    5
}

fn default_min_delta_ms() -> f64 {
    1.0
}

fn default_assessment_threshold() -> f64 {
    50.0
}

fn default_latency_weight() -> f64 {
    1.0
}

fn default_error_weight() -> f64 {
    100.0
}

fn default_structural_weight() -> f64 {
    10.0
}

fn default_fanout_weight() -> f64 {
    5.0
}

fn default_similarity_threshold() -> f64 {
    0.5
}

fn default_prefix_depth() -> usize {
    2
}

fn default_max_clusters() -> usize {
    1_000
}

fn default_max_exemplars() -> usize {
    5
}

fn default_error_dominance() -> f64 {
    0.5
}

fn default_queue_capacity() -> usize {
    1_024
}

fn default_workers() -> usize {
    1
}

fn default_submit_timeout() -> u64 {
    1_000
}

fn default_mad_multiplier() -> f64 {
    3.0
}

fn default_min_samples() -> usize {
    10
}

fn default_exemplars_per_anomaly() -> usize {
    3
}

fn default_dominance_ratio() -> f64 {
    2.0
}

fn default_inbound_ratio() -> f64 {
    0.5
}

fn default_analyzer_timeout() -> u64 {
    30_000
}

fn default_fetch_timeout() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

// Tests ---------------------------------------------------------------------
