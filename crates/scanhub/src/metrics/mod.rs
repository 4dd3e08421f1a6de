use prometheus::{
    opts, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Registry, TextEncoder,
};

/// Process-wide scan counters, updated at submission, dispatch, and terminal
/// transitions. Gauges mirror the store's active-scan view; the store stays
/// authoritative.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub scans_submitted: IntCounterVec,
    pub scans_completed: IntCounterVec,
    pub scans_failed: IntCounter,
    pub scans_active: IntGauge,
    pub probe_scans_active: IntGaugeVec,
    pub probe_scans_routed: IntCounterVec,
    pub scan_duration: Histogram,
    pub gvm_connection_errors: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let scans_submitted = IntCounterVec::new(
            opts!("scanhub_scans_submitted_total", "Total scans submitted"),
            &["scan_type"],
        )
        .unwrap();
        let scans_completed = IntCounterVec::new(
            opts!(
                "scanhub_scans_completed_total",
                "Total scans that reached a terminal state"
            ),
            &["gvm_status"],
        )
        .unwrap();
        let scans_failed = IntCounter::with_opts(opts!(
            "scanhub_scans_failed_total",
            "Total scans that failed due to adapter or connection errors"
        ))
        .unwrap();
        let scans_active = IntGauge::with_opts(opts!(
            "scanhub_scans_active",
            "Number of scans currently in progress"
        ))
        .unwrap();
        let probe_scans_active = IntGaugeVec::new(
            opts!(
                "scanhub_probe_scans_active",
                "Number of scans currently in progress per probe"
            ),
            &["probe"],
        )
        .unwrap();
        let probe_scans_routed = IntCounterVec::new(
            opts!(
                "scanhub_probe_scans_routed_total",
                "Total scans routed to each probe"
            ),
            &["probe"],
        )
        .unwrap();
        let scan_duration = Histogram::with_opts(
            HistogramOpts::new(
                "scanhub_scan_duration_seconds",
                "Scan duration from start to terminal state",
            )
            .buckets(vec![
                60.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0, 14400.0, 28800.0, 43200.0, 86400.0,
            ]),
        )
        .unwrap();
        let gvm_connection_errors = IntCounterVec::new(
            opts!(
                "scanhub_gvm_connection_errors_total",
                "Total engine connection failures"
            ),
            &["probe"],
        )
        .unwrap();

        registry.register(Box::new(scans_submitted.clone())).unwrap();
        registry.register(Box::new(scans_completed.clone())).unwrap();
        registry.register(Box::new(scans_failed.clone())).unwrap();
        registry.register(Box::new(scans_active.clone())).unwrap();
        registry.register(Box::new(probe_scans_active.clone())).unwrap();
        registry.register(Box::new(probe_scans_routed.clone())).unwrap();
        registry.register(Box::new(scan_duration.clone())).unwrap();
        registry
            .register(Box::new(gvm_connection_errors.clone()))
            .unwrap();

        Self {
            registry,
            scans_submitted,
            scans_completed,
            scans_failed,
            scans_active,
            probe_scans_active,
            probe_scans_routed,
            scan_duration,
            gvm_connection_errors,
        }
    }

    pub fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
