//! Prometheus metrics for the stETH monitoring service.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Metrics collector for the monitoring service.
///
/// Each instance owns its registry, so several collectors can coexist in one
/// process (tests, multiple chains).
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    blocks_processed: IntCounter,
    transactions_processed: IntCounter,
    findings: IntCounterVec,
    source_errors: IntCounter,
    rpc_latency: HistogramVec,
}

impl Metrics {
    /// Create a new metrics instance.
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let blocks_processed = IntCounter::new(
            "steth_monitor_blocks_processed_total",
            "Total number of blocks processed",
        )?;

        let transactions_processed = IntCounter::new(
            "steth_monitor_transactions_processed_total",
            "Total number of transactions processed",
        )?;

        let findings = IntCounterVec::new(
            Opts::new("steth_monitor_findings_total", "Total number of findings emitted"),
            &["severity"],
        )?;

        let source_errors = IntCounter::new(
            "steth_monitor_source_errors_total",
            "Total number of degraded findings caused by unavailable sources",
        )?;

        let rpc_latency = HistogramVec::new(
            HistogramOpts::new("steth_monitor_rpc_latency_seconds", "RPC call latency in seconds"),
            &["operation"],
        )?;

        registry.register(Box::new(blocks_processed.clone()))?;
        registry.register(Box::new(transactions_processed.clone()))?;
        registry.register(Box::new(findings.clone()))?;
        registry.register(Box::new(source_errors.clone()))?;
        registry.register(Box::new(rpc_latency.clone()))?;

        Ok(Self {
            registry,
            blocks_processed,
            transactions_processed,
            findings,
            source_errors,
            rpc_latency,
        })
    }

    /// Increment the blocks processed counter.
    pub fn inc_blocks_processed(&self) {
        self.blocks_processed.inc();
    }

    /// Increment the transactions processed counter.
    pub fn inc_transactions_processed(&self, count: u64) {
        self.transactions_processed.inc_by(count);
    }

    /// Count an emitted finding by severity label.
    pub fn inc_findings(&self, severity: &str) {
        self.findings.with_label_values(&[severity]).inc();
    }

    pub fn inc_source_errors(&self) {
        self.source_errors.inc();
    }

    /// Record RPC latency.
    pub fn observe_rpc_latency(&self, operation: &str, duration_secs: f64) {
        self.rpc_latency.with_label_values(&[operation]).observe(duration_secs);
    }

    /// Get Prometheus metrics as a string.
    pub fn gather(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
