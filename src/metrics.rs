//! Prometheus metrics
//!
//! Registered once on the default registry and served by the binary's
//! `/metrics` endpoint.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Histogram,
    IntCounter, IntCounterVec, IntGauge, Registry,
};

const BLOCK_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1., 2.5, 5., 10., 30., 60., 120., 300., 600.,
];

/// Process-wide metrics
pub static METRICS: Lazy<Metrics> = Lazy::new(|| Metrics::new(prometheus::default_registry()));

/// Container for the backup service metrics.
#[derive(Debug)]
pub struct Metrics {
    /// Blocks sealed and encoded into fragments.
    pub blocks_encoded: IntCounter,
    /// Blocks decoded back from fragments.
    pub blocks_decoded: IntCounter,
    /// Blocks that needed parity to decode.
    pub degraded_blocks: IntCounter,
    /// Fragments acknowledged by suppliers.
    pub fragments_sent: IntCounter,
    /// Fragments fetched from suppliers.
    pub fragments_fetched: IntCounter,
    /// Failed exchanges that were retried.
    pub transfer_retries: IntCounter,
    /// Exchanges abandoned, by operation.
    pub transfer_failures: IntCounterVec,
    /// Exchanges currently in flight.
    pub inflight_transfers: IntGauge,
    /// Worker jobs run, by kind.
    pub worker_jobs: IntCounterVec,
    /// Workers lost to a crash.
    pub worker_crashes: IntCounter,
    /// Supplier positions reassigned.
    pub supplier_replacements: IntCounter,
    /// End-to-end time to upload one block.
    pub block_upload_latency_s: Histogram,
}

impl Metrics {
    /// Creates the metrics on the given registry.
    pub fn new(registry: &Registry) -> Self {
        Self {
            blocks_encoded: register_int_counter_with_registry!(
                "raidmesh_blocks_encoded_total",
                "Blocks sealed and encoded into fragments",
                registry,
            )
            .expect("this is a valid metrics registration"),
            blocks_decoded: register_int_counter_with_registry!(
                "raidmesh_blocks_decoded_total",
                "Blocks decoded from fragments",
                registry,
            )
            .expect("this is a valid metrics registration"),
            degraded_blocks: register_int_counter_with_registry!(
                "raidmesh_degraded_blocks_total",
                "Blocks decoded with missing data fragments",
                registry,
            )
            .expect("this is a valid metrics registration"),
            fragments_sent: register_int_counter_with_registry!(
                "raidmesh_fragments_sent_total",
                "Fragments acknowledged by suppliers",
                registry,
            )
            .expect("this is a valid metrics registration"),
            fragments_fetched: register_int_counter_with_registry!(
                "raidmesh_fragments_fetched_total",
                "Fragments fetched from suppliers",
                registry,
            )
            .expect("this is a valid metrics registration"),
            transfer_retries: register_int_counter_with_registry!(
                "raidmesh_transfer_retries_total",
                "Fragment exchanges retried after a failure",
                registry,
            )
            .expect("this is a valid metrics registration"),
            transfer_failures: register_int_counter_vec_with_registry!(
                "raidmesh_transfer_failures_total",
                "Fragment exchanges abandoned",
                &["op"],
                registry,
            )
            .expect("this is a valid metrics registration"),
            inflight_transfers: register_int_gauge_with_registry!(
                "raidmesh_inflight_transfers",
                "Fragment exchanges in flight",
                registry,
            )
            .expect("this is a valid metrics registration"),
            worker_jobs: register_int_counter_vec_with_registry!(
                "raidmesh_worker_jobs_total",
                "Codec jobs run by the worker pool",
                &["kind"],
                registry,
            )
            .expect("this is a valid metrics registration"),
            worker_crashes: register_int_counter_with_registry!(
                "raidmesh_worker_crashes_total",
                "Workers lost to a crash",
                registry,
            )
            .expect("this is a valid metrics registration"),
            supplier_replacements: register_int_counter_with_registry!(
                "raidmesh_supplier_replacements_total",
                "Supplier positions reassigned",
                registry,
            )
            .expect("this is a valid metrics registration"),
            block_upload_latency_s: register_histogram_with_registry!(
                "raidmesh_block_upload_latency_seconds",
                "End-to-end time to upload one block",
                BLOCK_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .expect("this is a valid metrics registration"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Encoder;

    #[test]
    fn test_metrics_register_on_fresh_registry() {
        let registry = Registry::new();
        let metrics = Metrics::new(&registry);
        metrics.worker_crashes.inc();
        metrics.worker_jobs.with_label_values(&["make"]).inc();
        let mut buffer = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("raidmesh_worker_crashes_total 1"));
        assert!(text.contains("kind=\"make\""));
    }
}
