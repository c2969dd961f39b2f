//! Prometheus metrics exposition
//!
//! Metrics recorded by the gateway itself:
//!
//! - `http_request_duration_seconds` (histogram): labels `listener`, `status`
//! - `oidc_logins_total` (counter): label `outcome`
//! - `bearer_verifications_total` (counter): label `outcome`
//!
//! `oidc_token_refresh_total` and `jwks_fetch_total` are recorded by the
//! session and verifier crates into the same recorder.

use std::time::Instant;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_METRIC: &str = "http_request_duration_seconds";

/// 5ms up to 60s, the longest a provider round-trip may take.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Renders the duration metric as a histogram (`_bucket` lines) rather than
/// the exporter's default summary.
fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DURATION_METRIC.to_string()), DURATION_BUCKETS)
}

/// Install the process-wide Prometheus recorder.
///
/// Must run before any metric is emitted; returns the handle `/metrics`
/// renders from.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(builder()?.install_recorder()?)
}

/// Record a completed HTTP request on the named listener.
pub fn record_request(listener: &'static str, status: u16, duration_secs: f64) {
    metrics::histogram!(DURATION_METRIC, "listener" => listener, "status" => status.to_string())
        .record(duration_secs);
}

/// Record a finished login callback. `outcome` is `success` or an error type.
pub fn record_login(outcome: &'static str) {
    metrics::counter!("oidc_logins_total", "outcome" => outcome).increment(1);
}

/// Record a bearer verification result. `outcome` is `valid` or a rejection label.
pub fn record_verification(outcome: &'static str) {
    metrics::counter!("bearer_verifications_total", "outcome" => outcome).increment(1);
}

/// Middleware timing every request on the client listener.
pub async fn track_client(request: Request, next: Next) -> Response {
    track("client", request, next).await
}

/// Middleware timing every request on the resource listener.
pub async fn track_resource(request: Request, next: Next) -> Response {
    track("resource", request, next).await
}

async fn track(listener: &'static str, request: Request, next: Next) -> Response {
    let started = Instant::now();
    let response = next.run(request).await;
    record_request(
        listener,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}
