//! Prometheus metrics for item outcomes and mount operations

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec,
    TextEncoder,
};

lazy_static! {
    /// Items processed, by outcome
    pub static ref ITEMS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "minibatch_items_total",
        "Total number of mini-batch items processed",
        &["outcome"]
    ).unwrap();

    /// Wall time of one pipeline run
    pub static ref ITEM_DURATION: HistogramVec = register_histogram_vec!(
        "minibatch_item_duration_seconds",
        "Pipeline run duration per item in seconds",
        &["outcome"],
        vec![1.0, 10.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0]
    ).unwrap();

    /// Mount and unmount operations
    pub static ref MOUNT_OPERATIONS: IntCounterVec = register_int_counter_vec!(
        "minibatch_mount_operations_total",
        "Total number of dataset mount operations",
        &["operation", "status"]
    ).unwrap();
}

/// Driver metrics recorder
pub struct DriverMetrics;

impl DriverMetrics {
    /// Record a finished item
    pub fn record_item(outcome: &str, duration_secs: f64) {
        ITEMS_TOTAL.with_label_values(&[outcome]).inc();
        ITEM_DURATION
            .with_label_values(&[outcome])
            .observe(duration_secs);
    }

    /// Record a mount or unmount attempt
    pub fn record_mount_operation(operation: &str, success: bool) {
        let status = if success { "success" } else { "failure" };
        MOUNT_OPERATIONS.with_label_values(&[operation, status]).inc();
    }

    /// All registered metrics in Prometheus text format
    pub fn export_metrics() -> Result<String, String> {
        let encoder = TextEncoder::new();
        let metric_families = prometheus::gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| format!("Failed to encode metrics: {}", e))?;
        String::from_utf8(buffer).map_err(|e| format!("Failed to convert metrics to UTF-8: {}", e))
    }
}
