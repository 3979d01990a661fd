//! Prometheus metrics: dispatched requests, dispatch errors, loaded rules.
//! When `metrics:enabled`, GET /metrics on the configured port exposes the
//! text format.

use once_cell::sync::OnceCell;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, TextEncoder};

static METRICS: OnceCell<MetricsInner> = OnceCell::new();

struct MetricsInner {
    requests_total: IntCounterVec,
    dispatch_errors_total: IntCounterVec,
    rules_loaded: IntGauge,
    request_duration_seconds: prometheus::HistogramVec,
}

/// Initialize metrics and register with the default registry. Call once when
/// metrics are enabled.
pub fn init() -> Result<(), prometheus::Error> {
    let requests_total = IntCounterVec::new(
        Opts::new(
            "mockka_requests_total",
            "Total dispatched requests by service and status",
        ),
        &["service", "status"],
    )?;
    let dispatch_errors_total = IntCounterVec::new(
        Opts::new(
            "mockka_dispatch_errors_total",
            "Total dispatch errors by kind (RuleNotFound, CantProxyRequest, ...)",
        ),
        &["kind"],
    )?;
    let rules_loaded = IntGauge::new("mockka_rules_loaded", "Rules currently loaded")?;
    let request_duration_seconds = prometheus::HistogramVec::new(
        prometheus::HistogramOpts::new(
            "mockka_request_duration_seconds",
            "Dispatch duration in seconds by service",
        )
        .buckets(prometheus::exponential_buckets(0.005, 2.0, 12).unwrap()),
        &["service"],
    )?;

    prometheus::register(Box::new(requests_total.clone()))?;
    prometheus::register(Box::new(dispatch_errors_total.clone()))?;
    prometheus::register(Box::new(rules_loaded.clone()))?;
    prometheus::register(Box::new(request_duration_seconds.clone()))?;

    let _ = METRICS.set(MetricsInner {
        requests_total,
        dispatch_errors_total,
        rules_loaded,
        request_duration_seconds,
    });
    Ok(())
}

/// Record one dispatched request.
pub fn record_request(service: &str, status: u16, duration_secs: f64) {
    if let Some(m) = METRICS.get() {
        m.requests_total
            .with_label_values(&[service, &status.to_string()])
            .inc();
        m.request_duration_seconds
            .with_label_values(&[service])
            .observe(duration_secs);
    }
}

/// Record one dispatch error by `X-Mockka-Error` kind.
pub fn record_dispatch_error(kind: &str) {
    if let Some(m) = METRICS.get() {
        m.dispatch_errors_total.with_label_values(&[kind]).inc();
    }
}

/// Update the loaded-rules gauge after an observer scan.
pub fn set_rules_loaded(count: i64) {
    if let Some(m) = METRICS.get() {
        m.rules_loaded.set(count);
    }
}

/// Encode all metrics in Prometheus text format. Returns an empty string if
/// metrics were never initialized.
pub fn encode() -> String {
    if METRICS.get().is_none() {
        return String::new();
    }
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&families, &mut buffer).is_ok() {
        String::from_utf8_lossy(&buffer).into_owned()
    } else {
        String::new()
    }
}
