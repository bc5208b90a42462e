//! Prometheus exposition for the `/metrics` endpoint.
//!
//! Metric names carry the `dragonfly_` prefix for exporter compatibility.

use std::fmt::Write as _;

use darter_core::db_slice::DbTableStats;

use crate::server_state::ConnectionStats;

/// Aggregated point-in-time metrics collected across reactors and shards.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    /// Seconds since process start.
    pub uptime_secs: u64,
    /// Merged per-reactor connection counters.
    pub conn_stats: ConnectionStats,
    /// Instantaneous queries per second (6-sample window, normalized).
    pub qps: u64,
    /// Per-database statistics summed over shards, indexed by db.
    pub db: Vec<DbTableStats>,
    /// Approximate heap bytes held by shard keyspaces.
    pub heap_used_bytes: u64,
    /// Keys dropped by expiry.
    pub expired_keys: u64,
}

#[derive(Debug, Clone, Copy)]
enum MetricType {
    Counter,
    Gauge,
}

fn metric_type_name(metric_type: MetricType) -> &'static str {
    match metric_type {
        MetricType::Counter => "counter",
        MetricType::Gauge => "gauge",
    }
}

fn append_metric_header(name: &str, help: &str, metric_type: MetricType, dest: &mut String) {
    let _ = writeln!(dest, "# HELP dragonfly_{name} {help}");
    let _ = writeln!(dest, "# TYPE dragonfly_{name} {}", metric_type_name(metric_type));
}

fn append_metric_value(name: &str, labels: &str, value: u64, dest: &mut String) {
    let _ = writeln!(dest, "dragonfly_{name}{labels} {value}");
}

fn append_metric_without_labels(
    name: &str,
    help: &str,
    value: u64,
    metric_type: MetricType,
    dest: &mut String,
) {
    append_metric_header(name, help, metric_type, dest);
    append_metric_value(name, "", value, dest);
}

/// Renders the full exposition body.
#[must_use]
pub fn render_prometheus_metrics(metrics: &Metrics, used_mem_peak: u64) -> String {
    let mut body = String::new();

    append_metric_without_labels("up", "", 1, MetricType::Gauge, &mut body);
    append_metric_without_labels(
        "uptime_in_seconds",
        "",
        metrics.uptime_secs,
        MetricType::Gauge,
        &mut body,
    );

    append_metric_without_labels(
        "connected_clients",
        "",
        metrics.conn_stats.num_conns,
        MetricType::Gauge,
        &mut body,
    );

    append_metric_without_labels(
        "memory_used_bytes",
        "",
        metrics.heap_used_bytes,
        MetricType::Gauge,
        &mut body,
    );
    append_metric_without_labels(
        "memory_used_peak_bytes",
        "",
        used_mem_peak,
        MetricType::Gauge,
        &mut body,
    );

    append_metric_without_labels(
        "commands_processed_total",
        "",
        metrics.conn_stats.command_count,
        MetricType::Counter,
        &mut body,
    );
    append_metric_without_labels(
        "net_input_bytes_total",
        "",
        metrics.conn_stats.io_read_bytes,
        MetricType::Counter,
        &mut body,
    );
    append_metric_without_labels(
        "net_output_bytes_total",
        "",
        metrics.conn_stats.io_write_bytes,
        MetricType::Counter,
        &mut body,
    );
    append_metric_without_labels(
        "expired_keys_total",
        "",
        metrics.expired_keys,
        MetricType::Counter,
        &mut body,
    );

    append_metric_header(
        "db_keys",
        "Total number of keys by DB",
        MetricType::Gauge,
        &mut body,
    );
    for (index, stats) in metrics.db.iter().enumerate() {
        append_metric_value(
            "db_keys",
            &format!("{{db=\"db{index}\"}}"),
            stats.key_count,
            &mut body,
        );
    }
    append_metric_header(
        "db_keys_expiring",
        "Total number of expiring keys by DB",
        MetricType::Gauge,
        &mut body,
    );
    for (index, stats) in metrics.db.iter().enumerate() {
        append_metric_value(
            "db_keys_expiring",
            &format!("{{db=\"db{index}\"}}"),
            stats.expire_count,
            &mut body,
        );
    }

    body
}

/// Builds the minimal HTTP response wrapping one exposition body.
#[must_use]
pub fn http_metrics_response(body: &str) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body.as_bytes());
    response
}
