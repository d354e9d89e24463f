use anyhow::Result;
use axum::http::StatusCode;
use faultline_core::Config;
use faultline_test::fixtures::{
    at, checkout_traces, db_connection_logs, investigation_window, latency_series, span,
    two_span_trace,
};
use faultline_test::harness::TestApp;
use serde_json::json;

#[tokio::test]
async fn health_reports_ok() -> Result<()> {
    let app = TestApp::new(Config::default());
    let body = app.get_json("/health").await?;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "ok");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn end_to_end_investigation_flow() -> Result<()> {
    let app = TestApp::new(Config::default());
    let payload = json!({
        "window": investigation_window(),
        "traces": checkout_traces(6, 2),
        "logs": db_connection_logs(30),
        "metrics": [latency_series("checkout.latency", true)],
    });

    let body = app.post_json("/api/investigate", payload).await?;
    let data = &body["data"];

    assert_eq!(body["success"], true);
    assert_eq!(data["outcome"], "investigated");
    let stages: Vec<&str> = data["stages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["stage"].as_str().unwrap())
        .collect();
    assert_eq!(stages, vec!["INIT", "TRIAGE", "DEEP_DIVE", "REPORT", "DONE"]);

    let statuses = data["analyzer_status"].as_object().unwrap();
    assert_eq!(statuses.len(), 5);
    for analyzer in [
        "trace_diff",
        "log_patterns",
        "metric_anomalies",
        "correlation",
        "causal_graph",
    ] {
        assert_eq!(statuses[analyzer]["status"], "ok", "{} not ok", analyzer);
    }

    assert_eq!(data["trace_comparison"]["overall_assessment"], "regressed");
    assert_eq!(data["log_clusters"][0]["template"], "Error connecting to db at <*>");
    assert_eq!(data["log_clusters"][0]["count"], 30);
    assert_eq!(data["anomaly_windows"].as_array().unwrap().len(), 1);
    assert_eq!(data["evidence"].as_array().unwrap().len(), 8);
    assert!(data["hypothesis"]["primary_cause"].is_string());
    Ok(())
}

#[tokio::test]
async fn diff_endpoint_returns_comparison() -> Result<()> {
    let app = TestApp::new(Config::default());
    let payload = json!({
        "baseline": two_span_trace("before", 10),
        "target": two_span_trace("after", 500),
    });

    let body = app.post_json("/api/diff", payload).await?;
    let data = &body["data"];
    assert_eq!(data["overall_assessment"], "regressed");
    assert_eq!(data["findings"][0]["kind"], "latency_regression");
    assert_eq!(data["findings"][0]["evidence"]["type"], "span");
    Ok(())
}

#[tokio::test]
async fn malformed_trace_is_rejected_with_422() -> Result<()> {
    let app = TestApp::new(Config::default());
    let orphan = faultline_core::Trace::new(
        "orphan",
        vec![span("orphan", "child", Some("ghost"), "lookup", 0, 5)],
    );
    let payload = json!({
        "baseline": two_span_trace("before", 10),
        "target": orphan,
    });

    let (status, body) = app.post_json_status("/api/diff", payload).await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("unknown parent"));
    Ok(())
}

#[tokio::test]
async fn request_missing_fields_is_rejected() -> Result<()> {
    let app = TestApp::new(Config::default());
    let (status, _) = app
        .post_json_status("/api/investigate", json!({ "traces": [] }))
        .await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    Ok(())
}

#[tokio::test]
async fn inverted_window_is_rejected() -> Result<()> {
    let app = TestApp::new(Config::default());
    let payload = json!({
        "window": { "start": at(10_000), "end": at(0) },
    });
    let (status, body) = app.post_json_status("/api/investigate", payload).await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("invalid telemetry"));
    Ok(())
}

#[tokio::test]
async fn log_cluster_endpoint_groups_templates() -> Result<()> {
    let app = TestApp::new(Config::default());
    let body = app
        .post_json("/api/logs/cluster", json!({ "logs": db_connection_logs(100) }))
        .await?;

    let clusters = body["data"]["clusters"].as_array().unwrap();
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0]["count"], 100);
    assert_eq!(clusters[0]["severity_counts"]["error"], 100);
    assert_eq!(body["data"]["ingested"], 100);
    Ok(())
}

#[tokio::test]
async fn metric_endpoint_flags_spike() -> Result<()> {
    let app = TestApp::new(Config::default());
    let payload = json!({
        "metrics": [
            latency_series("checkout.latency", true),
            latency_series("search.latency", false),
        ],
        "comparison_start": at(0),
    });

    let body = app.post_json("/api/metrics/anomalies", payload).await?;
    let data = &body["data"];
    assert_eq!(data["windows"].as_array().unwrap().len(), 1);
    assert_eq!(data["windows"][0]["series"][0], "checkout.latency");
    assert_eq!(data["statuses"]["search.latency"]["status"], "ok");
    assert_eq!(data["statuses"]["search.latency"]["windows"], 0);
    Ok(())
}

#[tokio::test]
async fn unordered_metric_points_are_rejected() -> Result<()> {
    let app = TestApp::new(Config::default());
    let payload = json!({
        "metrics": [{
            "metric_name": "cpu",
            "points": [
                { "timestamp": at(2_000), "value": 1.0 },
                { "timestamp": at(1_000), "value": 2.0 }
            ]
        }],
        "comparison_start": at(0),
    });
    let (status, body) = app.post_json_status("/api/metrics/anomalies", payload).await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["success"], false);
    Ok(())
}
