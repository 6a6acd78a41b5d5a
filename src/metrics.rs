//! Metrics collection and export module

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use std::time::Instant;

/// Global metrics registry
pub struct Metrics {
    registry: Registry,

    // Pool counters
    pub checkouts_total: IntCounter,
    pub checkout_timeouts_total: IntCounter,
    pub sessions_created_total: IntCounter,
    pub sessions_destroyed_total: IntCounter,
    pub sessions_retired_total: IntCounter,
    pub leases_dropped_auto: IntCounter,

    // Transaction counters
    pub transactions_total: IntCounter,
    pub transactions_failed: IntCounter,
    pub faults_total: IntCounter,
    pub resets_total: IntCounter,

    // Gauges
    pub pool_capacity: IntGauge,
    pub sessions_idle: IntGauge,
    pub sessions_checked_out: IntGauge,

    // Histograms
    pub checkout_wait: Histogram,
    pub transaction_latency: Histogram,
    pub response_bytes: Histogram,
}

impl Metrics {
    /// Create new metrics instance
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let checkouts_total = IntCounter::with_opts(Opts::new(
            "gateway_checkouts_total",
            "Sessions checked out of the pool",
        ))?;

        let checkout_timeouts_total = IntCounter::with_opts(Opts::new(
            "gateway_checkout_timeouts_total",
            "Checkout attempts that hit their deadline",
        ))?;

        let sessions_created_total = IntCounter::with_opts(Opts::new(
            "gateway_sessions_created_total",
            "Backend sessions opened",
        ))?;

        let sessions_destroyed_total = IntCounter::with_opts(Opts::new(
            "gateway_sessions_destroyed_total",
            "Backend sessions destroyed",
        ))?;

        let sessions_retired_total = IntCounter::with_opts(Opts::new(
            "gateway_sessions_retired_total",
            "Sessions retired after exhausting their command budget",
        ))?;

        let leases_dropped_auto = IntCounter::with_opts(Opts::new(
            "gateway_leases_dropped_auto",
            "Session leases released by the drop safety net",
        ))?;

        let transactions_total = IntCounter::with_opts(Opts::new(
            "gateway_transactions_total",
            "Transactions started",
        ))?;

        let transactions_failed = IntCounter::with_opts(Opts::new(
            "gateway_transactions_failed",
            "Transactions that ended in an error",
        ))?;

        let faults_total = IntCounter::with_opts(Opts::new(
            "gateway_faults_total",
            "Backend faults found in otherwise successful responses",
        ))?;

        let resets_total = IntCounter::with_opts(Opts::new(
            "gateway_resets_total",
            "Session reset sequences sent",
        ))?;

        let pool_capacity = IntGauge::with_opts(Opts::new(
            "gateway_pool_capacity",
            "Configured maximum concurrent sessions",
        ))?;

        let sessions_idle = IntGauge::with_opts(Opts::new(
            "gateway_sessions_idle",
            "Sessions currently in the idle set",
        ))?;

        let sessions_checked_out = IntGauge::with_opts(Opts::new(
            "gateway_sessions_checked_out",
            "Sessions currently checked out",
        ))?;

        let checkout_wait = Histogram::with_opts(
            HistogramOpts::new(
                "gateway_checkout_wait_seconds",
                "Time spent waiting for a pool permit",
            )
            .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        )?;

        let transaction_latency = Histogram::with_opts(
            HistogramOpts::new(
                "gateway_transaction_seconds",
                "End-to-end transaction latency",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
        )?;

        let response_bytes = Histogram::with_opts(
            HistogramOpts::new(
                "gateway_response_bytes",
                "Bytes relayed to the caller per transaction",
            )
            .buckets(prometheus::exponential_buckets(256.0, 4.0, 10)?),
        )?;

        // Register all metrics
        registry.register(Box::new(checkouts_total.clone()))?;
        registry.register(Box::new(checkout_timeouts_total.clone()))?;
        registry.register(Box::new(sessions_created_total.clone()))?;
        registry.register(Box::new(sessions_destroyed_total.clone()))?;
        registry.register(Box::new(sessions_retired_total.clone()))?;
        registry.register(Box::new(leases_dropped_auto.clone()))?;
        registry.register(Box::new(transactions_total.clone()))?;
        registry.register(Box::new(transactions_failed.clone()))?;
        registry.register(Box::new(faults_total.clone()))?;
        registry.register(Box::new(resets_total.clone()))?;
        registry.register(Box::new(pool_capacity.clone()))?;
        registry.register(Box::new(sessions_idle.clone()))?;
        registry.register(Box::new(sessions_checked_out.clone()))?;
        registry.register(Box::new(checkout_wait.clone()))?;
        registry.register(Box::new(transaction_latency.clone()))?;
        registry.register(Box::new(response_bytes.clone()))?;

        Ok(Self {
            registry,
            checkouts_total,
            checkout_timeouts_total,
            sessions_created_total,
            sessions_destroyed_total,
            sessions_retired_total,
            leases_dropped_auto,
            transactions_total,
            transactions_failed,
            faults_total,
            resets_total,
            pool_capacity,
            sessions_idle,
            sessions_checked_out,
            checkout_wait,
            transaction_latency,
            response_bytes,
        })
    }

    /// Get the registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}

/// Global metrics instance
pub fn metrics() -> &'static Metrics {
    static METRICS: once_cell::sync::Lazy<Metrics> =
        once_cell::sync::Lazy::new(|| Metrics::new().expect("Failed to initialize metrics"));
    &METRICS
}

/// Timer helper for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn observe_duration(&self, histogram: &Histogram) {
        histogram.observe(self.start.elapsed().as_secs_f64());
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
