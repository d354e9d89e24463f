use anyhow::Result;
use axum::{
    extract::State,
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Local, Utc};
use faultline_core::analysis::LogPatternsOutput;
use faultline_core::anomaly::MultiSeriesDetection;
use faultline_core::{
    AnalysisError, Config, InvestigationReport, InvestigationRequest, LogCluster, LogEntry,
    LogPatternClusterer, MetricAnomalyDetector, MetricSeries, StageOrchestrator,
    TraceComparisonReport, TraceDiffer, Trace,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<StageOrchestrator>,
    config: Arc<Config>,
    verbose: bool,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<String> {
    fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

type ApiError = (StatusCode, Json<ApiResponse<String>>);

fn reject(err: AnalysisError) -> ApiError {
    let status = match err {
        AnalysisError::MalformedTrace { .. }
        | AnalysisError::InvalidTelemetry(_)
        | AnalysisError::InsufficientData { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        AnalysisError::IngestionStalled { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ApiResponse::error(err.to_string())))
}

fn internal(message: impl std::fmt::Display) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiResponse::error(message.to_string())),
    )
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Deserialize)]
struct DiffRequest {
    baseline: Trace,
    target: Trace,
}

#[derive(Debug, Deserialize)]
struct ClusterRequest {
    logs: Vec<LogEntry>,
    #[serde(default)]
    prior_clusters: Vec<LogCluster>,
}

#[derive(Debug, Deserialize)]
struct DetectRequest {
    metrics: Vec<MetricSeries>,
    /// Points before this instant form the baseline
    comparison_start: DateTime<Utc>,
}

/// Initialize the global tracing subscriber from the logging section.
///
/// `RUST_LOG` overrides the configured level when set.
pub fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(config.logging.level.to_lowercase())
    });

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.logging.include_modules)
        .compact()
        .try_init();
}

pub async fn start_server(config: Config) -> Result<()> {
    init_tracing(&config);

    let app = build_router(&config);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!(
        "\n🔎 Faultline Server Started!\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n   🌐 Server:        http://{}\n   🧭 Investigate:   http://{}/api/investigate\n   🔀 Diff traces:   http://{}/api/diff\n   🧩 Cluster logs:  http://{}/api/logs/cluster\n   📈 Metrics:       http://{}/api/metrics/anomalies\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n",
        addr, addr, addr, addr, addr
    );
    tracing::info!(%addr, "faultline server listening");

    axum::serve(listener, app).await?;
    Ok(())
}

pub fn build_router(config: &Config) -> Router {
    let state = AppState {
        orchestrator: Arc::new(StageOrchestrator::new(config.clone())),
        config: Arc::new(config.clone()),
        verbose: config.server.verbose,
    };

    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/api/config", get(config_handler))
        .route("/api/investigate", post(investigate_handler))
        .route("/api/diff", post(diff_handler))
        .route("/api/logs/cluster", post(cluster_handler))
        .route("/api/metrics/anomalies", post(detect_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if config.server.cors_enabled {
        router.layer(build_cors(config))
    } else {
        router
    }
}

fn build_cors(config: &Config) -> CorsLayer {
    let origin = if config.server.cors_origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = config
            .server
            .cors_origins
            .iter()
            .filter_map(|o| match o.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

async fn health_handler() -> impl IntoResponse {
    Json(ApiResponse::success(HealthStatus {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    }))
}

async fn config_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.config.as_ref().clone()))
}

async fn investigate_handler(
    State(state): State<AppState>,
    Json(request): Json<InvestigationRequest>,
) -> Result<Json<ApiResponse<InvestigationReport>>, ApiError> {
    if state.verbose {
        println!(
            "[{}] 🧭 investigate_handler -> traces: {}, logs: {}, metrics: {}",
            Local::now().format("%H:%M:%S.%3f"),
            request.traces.len(),
            request.logs.len(),
            request.metrics.len()
        );
    }

    let report = state.orchestrator.investigate(request).await.map_err(reject)?;
    Ok(Json(ApiResponse::success(report)))
}

async fn diff_handler(
    State(state): State<AppState>,
    Json(request): Json<DiffRequest>,
) -> Result<Json<ApiResponse<TraceComparisonReport>>, ApiError> {
    let differ = TraceDiffer::new(state.config.trace_diff.clone());
    let report =
        tokio::task::spawn_blocking(move || differ.diff(&request.baseline, &request.target))
            .await
            .map_err(internal)?
            .map_err(reject)?;
    Ok(Json(ApiResponse::success(report)))
}

async fn cluster_handler(
    State(state): State<AppState>,
    Json(request): Json<ClusterRequest>,
) -> Result<Json<ApiResponse<LogPatternsOutput>>, ApiError> {
    let config = state.config.log_clustering.clone();
    let output = tokio::task::spawn_blocking(move || {
        let mut clusterer = if request.prior_clusters.is_empty() {
            LogPatternClusterer::new(config)
        } else {
            LogPatternClusterer::from_snapshot(config, request.prior_clusters)
        };
        clusterer.ingest_batch(&request.logs);
        LogPatternsOutput {
            ingested: request.logs.len(),
            anomalous: clusterer.anomalous().iter().map(|c| c.id).collect(),
            clusters: clusterer.snapshot(),
            evicted: clusterer.evicted(),
        }
    })
    .await
    .map_err(internal)?;
    Ok(Json(ApiResponse::success(output)))
}

async fn detect_handler(
    State(state): State<AppState>,
    Json(request): Json<DetectRequest>,
) -> Result<Json<ApiResponse<MultiSeriesDetection>>, ApiError> {
    for series in &request.metrics {
        series.validate().map_err(reject)?;
    }
    let detector = MetricAnomalyDetector::new(state.config.anomaly_detection.clone());
    let detection = tokio::task::spawn_blocking(move || {
        detector.detect_many(&request.metrics, request.comparison_start)
    })
    .await
    .map_err(internal)?;
    Ok(Json(ApiResponse::success(detection)))
}
