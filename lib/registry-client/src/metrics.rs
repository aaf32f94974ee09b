//! Prometheus metrics for registry client activity

use crate::error::Result;
use crate::watch::DispatchReport;
use prometheus::{CounterVec, Encoder, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Prometheus metrics collector for a registry client
#[derive(Clone)]
pub struct RegistryMetrics {
    /// Store operations by name and outcome
    pub store_operations_total: CounterVec,
    /// Watch notifications by delivery outcome
    pub watch_notifications_total: CounterVec,
    /// Session events by state
    pub session_events_total: CounterVec,
    /// Paths currently present in the watch registry
    pub watched_paths: IntGauge,
    /// Prometheus registry for metrics
    pub registry: Arc<Registry>,
}

impl RegistryMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let store_operations_total = CounterVec::new(
            Opts::new("registry_store_operations_total", "Total store operations"),
            &["op", "outcome"],
        )?;

        let watch_notifications_total = CounterVec::new(
            Opts::new(
                "registry_watch_notifications_total",
                "Watch notifications by delivery outcome",
            ),
            &["outcome"],
        )?;

        let session_events_total = CounterVec::new(
            Opts::new("registry_session_events_total", "Session events by state"),
            &["state"],
        )?;

        let watched_paths = IntGauge::new(
            "registry_watched_paths",
            "Paths with at least one registered watcher",
        )?;

        registry.register(Box::new(store_operations_total.clone()))?;
        registry.register(Box::new(watch_notifications_total.clone()))?;
        registry.register(Box::new(session_events_total.clone()))?;
        registry.register(Box::new(watched_paths.clone()))?;

        Ok(Self {
            store_operations_total,
            watch_notifications_total,
            session_events_total,
            watched_paths,
            registry,
        })
    }

    pub fn observe_op(&self, op: &str, ok: bool) {
        let outcome = if ok { "ok" } else { "error" };
        self.store_operations_total
            .with_label_values(&[op, outcome])
            .inc();
    }

    pub fn observe_dispatch(&self, report: &DispatchReport) {
        for (outcome, count) in [
            ("delivered", report.delivered),
            ("coalesced", report.coalesced),
            ("closed", report.closed),
        ] {
            if count > 0 {
                self.watch_notifications_total
                    .with_label_values(&[outcome])
                    .inc_by(count as f64);
            }
        }
    }

    pub fn observe_session_event(&self, state: &str) {
        self.session_events_total.with_label_values(&[state]).inc();
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
