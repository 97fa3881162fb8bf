//! Monitoring and metric exposition.
//!
//! One process-wide prometheus registry (initialised on first touch, the
//! only global besides the driver registry) carrying the service's metric
//! families. The `/metrics` endpoint calls [`Metrics::render`], which
//! refreshes the process gauges and encodes the registry in text format.
//!
//! Counters never decrement; histogram buckets are fixed at registration
//! (second-scale for durations, log-scale for row counts) so scrapes are
//! comparable across restarts.

use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use prometheus::{
    Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

/// Latency buckets in seconds.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Log-scale buckets for row/difference counts.
const COUNT_BUCKETS: &[f64] = &[
    1.0, 10.0, 100.0, 1e3, 1e4, 1e5, 1e6, 1e7,
];

pub struct Metrics {
    registry: Registry,

    pub api_request_duration_seconds: HistogramVec,
    pub api_request_total: IntCounterVec,
    pub comparison_duration_seconds: HistogramVec,
    pub comparison_differences_total: HistogramVec,
    pub rows_compared_total: HistogramVec,
    pub difference_rate: GaugeVec,
    pub column_null_rate: GaugeVec,
    pub memory_usage_bytes: IntGauge,
    pub cpu_usage_percent: Gauge,

    cpu_state: Mutex<CpuSample>,
}

#[derive(Debug, Clone, Copy)]
struct CpuSample {
    at: Instant,
    ticks: u64,
}

/// The process-wide metrics registry.
pub fn metrics() -> &'static Metrics {
    static METRICS: OnceLock<Metrics> = OnceLock::new();
    METRICS.get_or_init(Metrics::new)
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let api_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "api_request_duration_seconds",
                "Control-plane request latency.",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["method", "route", "status"],
        )
        .expect("metric definition");
        let api_request_total = IntCounterVec::new(
            Opts::new("api_request_total", "Control-plane requests served."),
            &["method", "route", "status"],
        )
        .expect("metric definition");
        let comparison_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "comparison_duration_seconds",
                "End-to-end comparison job duration.",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["kind", "algorithm"],
        )
        .expect("metric definition");
        let comparison_differences_total = HistogramVec::new(
            HistogramOpts::new(
                "comparison_differences_total",
                "Differences found per comparison.",
            )
            .buckets(COUNT_BUCKETS.to_vec()),
            &["kind", "source_table", "target_table"],
        )
        .expect("metric definition");
        let rows_compared_total = HistogramVec::new(
            HistogramOpts::new("rows_compared_total", "Rows examined per comparison.")
                .buckets(COUNT_BUCKETS.to_vec()),
            &["kind", "source_table", "target_table"],
        )
        .expect("metric definition");
        let difference_rate = GaugeVec::new(
            Opts::new(
                "difference_rate",
                "Fraction of compared rows that differed in the latest run.",
            ),
            &["source_table", "target_table"],
        )
        .expect("metric definition");
        let column_null_rate = GaugeVec::new(
            Opts::new(
                "column_null_rate",
                "Null fraction per compared column in the latest run.",
            ),
            &["table", "column"],
        )
        .expect("metric definition");
        let memory_usage_bytes = IntGauge::new(
            "memory_usage_bytes",
            "Resident set size of the service process.",
        )
        .expect("metric definition");
        let cpu_usage_percent = Gauge::new(
            "cpu_usage_percent",
            "Process CPU usage since the previous scrape.",
        )
        .expect("metric definition");

        for metric in [
            Box::new(api_request_duration_seconds.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(api_request_total.clone()),
            Box::new(comparison_duration_seconds.clone()),
            Box::new(comparison_differences_total.clone()),
            Box::new(rows_compared_total.clone()),
            Box::new(difference_rate.clone()),
            Box::new(column_null_rate.clone()),
            Box::new(memory_usage_bytes.clone()),
            Box::new(cpu_usage_percent.clone()),
        ] {
            registry.register(metric).expect("metric registration");
        }

        Self {
            registry,
            api_request_duration_seconds,
            api_request_total,
            comparison_duration_seconds,
            comparison_differences_total,
            rows_compared_total,
            difference_rate,
            column_null_rate,
            memory_usage_bytes,
            cpu_usage_percent,
            cpu_state: Mutex::new(CpuSample {
                at: Instant::now(),
                ticks: 0,
            }),
        }
    }

    /// Record one finished comparison.
    pub fn observe_comparison(
        &self,
        kind: &str,
        algorithm: &str,
        source_table: &str,
        target_table: &str,
        duration_secs: f64,
        rows_compared: u64,
        rows_different: u64,
    ) {
        self.comparison_duration_seconds
            .with_label_values(&[kind, algorithm])
            .observe(duration_secs);
        self.comparison_differences_total
            .with_label_values(&[kind, source_table, target_table])
            .observe(rows_different as f64);
        self.rows_compared_total
            .with_label_values(&[kind, source_table, target_table])
            .observe(rows_compared as f64);
        let rate = if rows_compared == 0 {
            0.0
        } else {
            rows_different as f64 / rows_compared as f64
        };
        self.difference_rate
            .with_label_values(&[source_table, target_table])
            .set(rate);
    }

    /// Record one served API request.
    pub fn observe_request(&self, method: &str, route: &str, status: u16, duration_secs: f64) {
        let status = status.to_string();
        self.api_request_duration_seconds
            .with_label_values(&[method, route, &status])
            .observe(duration_secs);
        self.api_request_total
            .with_label_values(&[method, route, &status])
            .inc();
    }

    /// Refresh process gauges and encode the registry in text format.
    pub fn render(&self) -> String {
        self.refresh_process_gauges();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        if TextEncoder::new().encode(&families, &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }

    fn refresh_process_gauges(&self) {
        if let Some(rss) = read_rss_bytes() {
            self.memory_usage_bytes.set(rss as i64);
        }
        if let Some(ticks) = read_cpu_ticks() {
            let now = Instant::now();
            let mut prev = match self.cpu_state.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            let elapsed = now.duration_since(prev.at).as_secs_f64();
            if prev.ticks > 0 && elapsed > 0.0 {
                let tick_hz = 100.0; // USER_HZ on every mainstream kernel
                let used = ticks.saturating_sub(prev.ticks) as f64 / tick_hz;
                self.cpu_usage_percent.set(100.0 * used / elapsed);
            }
            *prev = CpuSample { at: now, ticks };
        }
    }
}

/// Resident set size from `/proc/self/statm`; `None` off Linux.
fn read_rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let rss_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(rss_pages * 4096)
}

/// utime + stime from `/proc/self/stat`; `None` off Linux.
fn read_cpu_ticks() -> Option<u64> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // Fields 14 and 15, counted after the parenthesised comm field.
    let rest = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_renders_every_family() {
        let m = metrics();
        m.observe_request("POST", "/api/v1/compare/tables/nested", 202, 0.01);
        m.observe_comparison("table", "hash", "orders", "orders", 0.2, 4, 3);
        m.column_null_rate
            .with_label_values(&["orders", "name"])
            .set(0.25);

        let text = m.render();
        for family in [
            "api_request_duration_seconds",
            "api_request_total",
            "comparison_duration_seconds",
            "comparison_differences_total",
            "rows_compared_total",
            "difference_rate",
            "column_null_rate",
            "memory_usage_bytes",
            "cpu_usage_percent",
        ] {
            assert!(text.contains(family), "missing family {family}");
        }
    }

    #[test]
    fn test_difference_rate_gauge_value() {
        let m = metrics();
        m.observe_comparison("table", "hash", "s_t", "t_t", 0.1, 4, 3);
        let rate = m
            .difference_rate
            .with_label_values(&["s_t", "t_t"])
            .get();
        assert!((rate - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_counters_accumulate() {
        let m = metrics();
        let before = m
            .api_request_total
            .with_label_values(&["GET", "/health", "200"])
            .get();
        m.observe_request("GET", "/health", 200, 0.001);
        m.observe_request("GET", "/health", 200, 0.001);
        let after = m
            .api_request_total
            .with_label_values(&["GET", "/health", "200"])
            .get();
        assert_eq!(after, before + 2);
    }
}
