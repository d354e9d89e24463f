use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::Serialize;

use faultline::server;
use faultline_core::orchestrator::Outcome;
use faultline_core::{
    AnalyzerStatus, Config, InvestigationReport, InvestigationRequest, LogEntry,
    LogPatternClusterer, MetricAnomalyDetector, MetricSeries, StageOrchestrator,
    TraceComparisonReport, TraceDiffer, Trace,
};

#[derive(Parser)]
#[command(name = "faultline")]
#[command(
    about = "Correlation and root-cause analysis for traces, logs and metrics",
    long_about = None
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "faultline.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Faultline HTTP server
    Serve {
        /// Override verbose setting from config
        #[arg(short, long)]
        verbose: bool,
    },

    /// Run a full investigation over a JSON request file
    Investigate {
        /// JSON file holding the window, traces, logs and metrics
        input: PathBuf,
        /// Output the raw JSON report
        #[arg(long)]
        json: bool,
    },

    /// Compare two traces
    Diff {
        /// JSON file holding the baseline trace
        baseline: PathBuf,
        /// JSON file holding the trace under suspicion
        target: PathBuf,
        #[arg(long)]
        json: bool,
    },

    /// Cluster a JSON array of log entries into templates
    Cluster {
        input: PathBuf,
        /// Sort entries by timestamp before clustering
        #[arg(long)]
        canonicalize: bool,
        #[arg(long)]
        json: bool,
    },

    /// Detect anomaly windows in a JSON array of metric series
    Detect {
        input: PathBuf,
        /// RFC 3339 instant separating baseline from comparison points
        #[arg(long)]
        comparison_start: DateTime<Utc>,
        #[arg(long)]
        json: bool,
    },

    /// Print the default configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        Config::from_file(&cli.config)?
    } else {
        Config::default()
    };
    config.validate()?;

    match cli.command {
        Commands::Serve { verbose } => {
            if verbose {
                config.server.verbose = true;
            }
            println!(
                "🚀 Starting Faultline server on {}:{}",
                config.server.host, config.server.port
            );
            server::start_server(config).await?;
        }
        Commands::Investigate { input, json } => {
            server::init_tracing(&config);
            let request: InvestigationRequest = read_json(&input)?;
            let report = StageOrchestrator::new(config).investigate(request).await?;
            if json {
                print_json(&report)?;
            } else {
                print_report(&report);
            }
        }
        Commands::Diff {
            baseline,
            target,
            json,
        } => {
            server::init_tracing(&config);
            let baseline: Trace = read_json(&baseline)?;
            let target: Trace = read_json(&target)?;
            let report = TraceDiffer::new(config.trace_diff).diff(&baseline, &target)?;
            if json {
                print_json(&report)?;
            } else {
                print_comparison(&report);
            }
        }
        Commands::Cluster {
            input,
            canonicalize,
            json,
        } => {
            server::init_tracing(&config);
            let logs: Vec<LogEntry> = read_json(&input)?;
            if canonicalize {
                config.log_clustering.canonicalize = true;
            }
            let mut clusterer = LogPatternClusterer::new(config.log_clustering);
            clusterer.ingest_batch(&logs);
            let clusters = clusterer.snapshot();
            if json {
                print_json(&clusters)?;
            } else {
                println!("🧩 {} entries -> {} clusters", logs.len(), clusters.len());
                for cluster in &clusters {
                    println!(
                        "  #{:<4} {:>6}x  errors {:>5.1}%  {}{}",
                        cluster.id,
                        cluster.count,
                        cluster.error_share() * 100.0,
                        cluster.template,
                        if cluster.novel { "  [new]" } else { "" }
                    );
                }
            }
        }
        Commands::Detect {
            input,
            comparison_start,
            json,
        } => {
            server::init_tracing(&config);
            let series: Vec<MetricSeries> = read_json(&input)?;
            for s in &series {
                s.validate()?;
            }
            let detection = MetricAnomalyDetector::new(config.anomaly_detection)
                .detect_many(&series, comparison_start);
            if json {
                print_json(&detection)?;
            } else {
                for (key, status) in &detection.statuses {
                    println!("  {:<40} {:?}", key, status);
                }
                println!("📈 {} anomaly windows", detection.windows.len());
                for window in &detection.windows {
                    println!(
                        "  {} -> {}  severity {:.3}  [{}]",
                        window.start.to_rfc3339(),
                        window.end.to_rfc3339(),
                        window.severity,
                        window.series.join(", ")
                    );
                }
            }
        }
        Commands::Config => {
            println!("{}", Config::default_toml()?);
        }
    }

    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_report(report: &InvestigationReport) {
    println!("\n🔎 Investigation {}", report.investigation_id);
    println!("═══════════════════════════════════════════════════════════");
    let path: Vec<String> = report.stages.iter().map(|s| s.stage.to_string()).collect();
    println!("Stages:   {}", path.join(" -> "));
    println!(
        "Outcome:  {}",
        match report.outcome {
            Outcome::Resolved => "resolved at triage",
            Outcome::Investigated => "investigated",
        }
    );
    println!("Triage:   {}", report.triage.reason);
    println!("Summary:  {}", report.summary);

    if !report.analyzer_status.is_empty() {
        println!("\nAnalyzers:");
        for (kind, status) in &report.analyzer_status {
            let label = match status {
                AnalyzerStatus::Ok => "ok".to_string(),
                AnalyzerStatus::Skipped => "skipped".to_string(),
                AnalyzerStatus::TimedOut { timeout_ms } => {
                    format!("timed out after {}ms", timeout_ms)
                }
                AnalyzerStatus::Unavailable { reason } => format!("unavailable: {}", reason),
                AnalyzerStatus::InsufficientData { reason } => {
                    format!("insufficient data: {}", reason)
                }
            };
            println!("  {:<18} {}", kind.as_str(), label);
        }
    }

    if let Some(hypothesis) = &report.hypothesis {
        println!("\nRoot cause:");
        match &hypothesis.primary_cause {
            Some(service) => println!(
                "  {} ({} confidence, depth {})",
                service, hypothesis.confidence, hypothesis.propagation_depth
            ),
            None => println!("  none identified"),
        }
    }

    if !report.findings.is_empty() {
        println!("\nTop findings:");
        for finding in report.findings.iter().take(10) {
            println!(
                "  [{:.2}] {:<18} {}",
                finding.confidence, finding.kind.as_str(), finding.description
            );
        }
    }

    if !report.rejected_traces.is_empty() {
        println!("\n⚠️  Rejected traces:");
        for rejected in &report.rejected_traces {
            println!("  {}: {}", rejected.trace_id, rejected.reason);
        }
    }
}

fn print_comparison(report: &TraceComparisonReport) {
    println!(
        "🔀 {} -> {}: {}",
        report.baseline_trace_id, report.target_trace_id, report.overall_assessment
    );
    println!("   {}", report.root_cause_hypothesis);
    for finding in &report.findings {
        println!(
            "  [{:.2}] {:<18} {}",
            finding.confidence, finding.kind.as_str(), finding.description
        );
    }
}
