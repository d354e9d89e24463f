use chrono::{DateTime, Duration, TimeZone, Utc};
use faultline_core::telemetry::AttributeValue;
use faultline_core::{
    LogEntry, MetricPoint, MetricSeries, Severity, Span, SpanStatus, TimeWindow, Trace,
};
use std::collections::BTreeMap;

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

pub fn at(ms: i64) -> DateTime<Utc> {
    base_time() + Duration::milliseconds(ms)
}

/// One minute starting at `base_time()`
pub fn investigation_window() -> TimeWindow {
    TimeWindow::new(at(0), at(60_000))
}

pub fn span(
    trace_id: &str,
    span_id: &str,
    parent: Option<&str>,
    name: &str,
    start_ms: i64,
    end_ms: i64,
) -> Span {
    Span {
        span_id: span_id.into(),
        trace_id: trace_id.into(),
        parent_span_id: parent.map(str::to_string),
        name: name.into(),
        start_time: at(start_ms),
        end_time: at(end_ms),
        status: SpanStatus::Ok,
        attributes: BTreeMap::new(),
    }
}

pub fn in_service(mut span: Span, service: &str) -> Span {
    span.attributes.insert(
        "service.name".into(),
        AttributeValue::String(service.into()),
    );
    span
}

pub fn failed(mut span: Span) -> Span {
    span.status = SpanStatus::Error;
    span
}

/// Root `A` spanning `[0, root_end_ms]` with a single child `B` over `[0, 10]`.
pub fn two_span_trace(trace_id: &str, root_end_ms: i64) -> Trace {
    Trace::new(
        trace_id,
        vec![
            span(trace_id, "a", None, "A", 0, root_end_ms),
            span(trace_id, "b", Some("a"), "B", 0, 10),
        ],
    )
}

/// Linear call chain across `services`, one span per service, starting at `offset_ms`.
pub fn chain_trace(trace_id: &str, services: &[&str], failing: &[&str], offset_ms: i64) -> Trace {
    let spans = services
        .iter()
        .enumerate()
        .map(|(i, service)| {
            let i = i as i64;
            let id = format!("{}-{}", trace_id, i);
            let parent = (i > 0).then(|| format!("{}-{}", trace_id, i - 1));
            let s = in_service(
                span(
                    trace_id,
                    &id,
                    parent.as_deref(),
                    &format!("call {}", service),
                    offset_ms + i,
                    offset_ms + 100 - i,
                ),
                service,
            );
            if failing.contains(service) {
                failed(s)
            } else {
                s
            }
        })
        .collect();
    Trace::new(trace_id, spans)
}

/// gateway -> orders -> payments; failing checkouts are slow and error in payments.
pub fn checkout_trace(trace_id: &str, offset_ms: i64, failing: bool) -> Trace {
    let payments_ms = if failing { 900 } else { 40 };
    let end = offset_ms + payments_ms;
    let gateway = in_service(
        span(trace_id, "gw", None, "POST /checkout", offset_ms, end + 60),
        "gateway",
    );
    let orders = in_service(
        span(trace_id, "ord", Some("gw"), "create_order", offset_ms + 5, end + 50),
        "orders",
    );
    let payments = in_service(
        span(trace_id, "pay", Some("ord"), "charge_card", offset_ms + 10, end + 10),
        "payments",
    );
    let spans = if failing {
        vec![failed(gateway), failed(orders), failed(payments)]
    } else {
        vec![gateway, orders, payments]
    };
    Trace::new(trace_id, spans)
}

/// `healthy` fast checkouts followed by `failing` slow ones, one second apart.
pub fn checkout_traces(healthy: usize, failing: usize) -> Vec<Trace> {
    (0..healthy + failing)
        .map(|i| {
            let id = format!("checkout-{:03}", i);
            checkout_trace(&id, i as i64 * 1_000, i >= healthy)
        })
        .collect()
}

/// `count` lines differing only in the trailing address.
pub fn db_connection_logs(count: usize) -> Vec<LogEntry> {
    (0..count)
        .map(|n| {
            LogEntry::new(
                at(n as i64 * 100),
                Severity::Error,
                format!("Error connecting to db at 10.0.0.{}", n),
            )
        })
        .collect()
}

/// Twenty one-second baseline samples before the window, then ten inside it.
///
/// Baseline values cycle through 100, 101, 102 (median 101, MAD 1). When
/// `spike` is set, the 5th and 6th comparison samples read 200.
pub fn latency_series(name: &str, spike: bool) -> MetricSeries {
    let baseline = (0..20).map(|i| MetricPoint::new(at((i - 20) * 1_000), 100.0 + (i % 3) as f64));
    let comparison = (0..10).map(|i| {
        let value = if spike && (i == 4 || i == 5) { 200.0 } else { 101.0 };
        MetricPoint::new(at(i * 1_000), value)
    });
    MetricSeries::new(name, baseline.chain(comparison).collect())
}

/// Same value at every sample, before and inside the window.
pub fn constant_series(name: &str, value: f64) -> MetricSeries {
    MetricSeries::new(
        name,
        (0..30)
            .map(|i| MetricPoint::new(at((i - 20) * 1_000), value))
            .collect(),
    )
}
