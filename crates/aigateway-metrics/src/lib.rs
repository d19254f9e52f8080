//! Metrics sink (C7): installs the global Prometheus recorder and exposes
//! the `record_*` call sites other crates use. Follows the install-once,
//! call-`counter!`/`histogram!`/`gauge!`-anywhere pattern this corpus uses
//! for its own gateway metrics module.

use std::sync::OnceLock;
use std::time::Duration;

use aigateway_breaker::BreakerObserver;
use aigateway_client::RequestObserver;
use aigateway_common::ErrorClass;
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

static RECORDER: OnceLock<PrometheusHandle> = OnceLock::new();

const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Thin handle around the global recorder. The `PrometheusHandle` is kept
/// only to render the `/metrics` endpoint; every other crate reaches the
/// recorder through the bare `metrics::` macros once `install()` has run.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Installs the global recorder on first call; later calls (the process
    /// only ever calls this once outside tests, but the test suite builds a
    /// fresh `Metrics` per case) just clone the cached handle, since a
    /// process may only register one global recorder.
    pub fn install() -> Self {
        let handle = RECORDER.get_or_init(Self::install_once).clone();
        Self { handle }
    }

    fn install_once() -> PrometheusHandle {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        describe_counter!(
            "aigateway_upstream_requests_total",
            Unit::Count,
            "Upstream calls issued by the router, labeled by outcome"
        );
        describe_histogram!(
            "aigateway_upstream_request_duration_seconds",
            Unit::Seconds,
            "Time spent waiting on one upstream call"
        );
        describe_counter!(
            "aigateway_upstream_tokens_total",
            Unit::Count,
            "Total tokens reported by upstream usage fields"
        );
        describe_gauge!(
            "aigateway_breaker_backend_unavailable",
            Unit::Count,
            "Set to 1 while the circuit breaker backend is unreachable"
        );
        describe_counter!(
            "aigateway_retry_attempts_total",
            Unit::Count,
            "Retry attempts issued, labeled by upstream and error class"
        );
        describe_counter!(
            "aigateway_cache_lookups_total",
            Unit::Count,
            "Response cache lookups, labeled by hit/miss"
        );
        describe_counter!(
            "aigateway_requests_total",
            Unit::Count,
            "Inbound requests handled, labeled by status code"
        );

        handle
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }

    pub fn record_breaker_backend_unavailable(&self, upstream: &str) {
        metrics::gauge!(
            "aigateway_breaker_backend_unavailable",
            "upstream" => upstream.to_string(),
        )
        .set(1.0);
    }

    pub fn record_retry_attempt(&self, upstream: &str, class: &ErrorClass) {
        metrics::counter!(
            "aigateway_retry_attempts_total",
            "upstream" => upstream.to_string(),
            "error_class" => class.name(),
        )
        .increment(1);
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        metrics::counter!(
            "aigateway_cache_lookups_total",
            "result" => if hit { "hit" } else { "miss" },
        )
        .increment(1);
    }

    pub fn record_inbound_request(&self, status: u16) {
        metrics::counter!(
            "aigateway_requests_total",
            "status_code" => status.to_string(),
        )
        .increment(1);
    }
}

impl BreakerObserver for Metrics {
    fn backend_unavailable(&self, upstream: &str) {
        self.record_breaker_backend_unavailable(upstream);
    }
}

impl RequestObserver for Metrics {
    fn observe(
        &self,
        upstream: &str,
        success: bool,
        elapsed: Duration,
        error_class: Option<&ErrorClass>,
        total_tokens: Option<u64>,
    ) {
        metrics::counter!(
            "aigateway_upstream_requests_total",
            "upstream" => upstream.to_string(),
            "outcome" => if success { "success" } else { "failure" },
            "error_class" => error_class.map(ErrorClass::name).unwrap_or("none"),
        )
        .increment(1);

        metrics::histogram!(
            "aigateway_upstream_request_duration_seconds",
            "upstream" => upstream.to_string(),
        )
        .record(elapsed.as_secs_f64());

        if let Some(tokens) = total_tokens {
            metrics::counter!(
                "aigateway_upstream_tokens_total",
                "upstream" => upstream.to_string(),
            )
            .increment(tokens);
        }
    }
}
