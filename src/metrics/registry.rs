use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`, `gauge!`,
/// `histogram!`) can be used anywhere in the codebase. The `PrometheusHandle`
/// is retained solely for rendering the `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric descriptions.
    ///
    /// Must be called **once** at startup before any `counter!` / `gauge!` /
    /// `histogram!` calls.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        // --- gossip ---
        describe_counter!(
            "cluster_gossip_ticks_total",
            Unit::Count,
            "Total gossip tick cycles run"
        );
        describe_counter!(
            "cluster_gossip_sends_total",
            Unit::Count,
            "Total gossip frames sent to peers"
        );
        describe_counter!(
            "cluster_gossip_send_failures_total",
            Unit::Count,
            "Total gossip send attempts that failed"
        );
        describe_histogram!(
            "cluster_gossip_tick_interval_seconds",
            Unit::Seconds,
            "Current adaptive gossip tick interval"
        );

        // directory
        describe_gauge!(
            "cluster_directory_size",
            Unit::Count,
            "Number of known peers in the NodeDirectory"
        );
        describe_counter!(
            "cluster_directory_evictions_total",
            Unit::Count,
            "Total peers evicted from the NodeDirectory"
        );

        // RPC
        describe_counter!(
            "cluster_rpc_requests_total",
            Unit::Count,
            "Total JSON-RPC requests dispatched"
        );
        describe_histogram!(
            "cluster_rpc_latency_seconds",
            Unit::Seconds,
            "JSON-RPC request handling latency"
        );
        describe_counter!(
            "cluster_rpc_errors_total",
            Unit::Count,
            "Total JSON-RPC requests that returned an error"
        );

        // rate limiting
        describe_counter!(
            "cluster_rate_limit_rejected_total",
            Unit::Count,
            "Total requests rejected by the rate limiter"
        );
        describe_counter!(
            "cluster_rate_limit_allowed_total",
            Unit::Count,
            "Total requests allowed by the rate limiter"
        );

        // certificates
        describe_counter!(
            "cluster_cert_renewals_total",
            Unit::Count,
            "Total successful leaf certificate (re)issuances"
        );
        describe_counter!(
            "cluster_cert_renewal_failures_total",
            Unit::Count,
            "Total failed certificate provisioning attempts"
        );

        // connection pool
        describe_gauge!(
            "cluster_pool_connections_active",
            Unit::Count,
            "Number of pooled per-peer HTTP clients"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
