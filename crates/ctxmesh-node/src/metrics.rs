//! Prometheus metrics for one node.

use anyhow::{Context, Result};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Metric handles registered against this node's registry.
///
/// Counters on the hot path are incremented where the work happens; values
/// owned by other components (propagation counts, sync cycles, context
/// count) are snapshotted into gauges at scrape time.
pub struct NodeMetrics {
    registry: Registry,
    /// Locally authoritative saves accepted.
    pub saves_total: IntCounter,
    /// Locally authoritative deletes accepted.
    pub deletes_total: IntCounter,
    /// Events handed to stream subscribers.
    pub stream_events_total: IntCounter,
    /// Currently attached stream subscribers.
    pub stream_subscribers: IntGauge,
    propagation_pushes: IntGauge,
    propagation_failures: IntGauge,
    sync_cycles: IntGauge,
    contexts: IntGauge,
}

/// Scrape-time snapshot of values owned by other components.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    /// Stored context count.
    pub contexts: u64,
    /// Propagation pushes attempted.
    pub propagation_pushes: u64,
    /// Propagation pushes failed or timed out.
    pub propagation_failures: u64,
    /// Completed replica catch-up passes.
    pub sync_cycles: u64,
}

impl NodeMetrics {
    /// Build and register all node metrics.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let saves_total = IntCounter::new("ctxmesh_saves_total", "Authoritative saves accepted")?;
        let deletes_total =
            IntCounter::new("ctxmesh_deletes_total", "Authoritative deletes accepted")?;
        let stream_events_total = IntCounter::new(
            "ctxmesh_stream_events_total",
            "Events delivered to stream subscribers",
        )?;
        let stream_subscribers = IntGauge::new(
            "ctxmesh_stream_subscribers",
            "Currently attached stream subscribers",
        )?;
        let propagation_pushes = IntGauge::new(
            "ctxmesh_propagation_pushes_total",
            "Propagation pushes attempted",
        )?;
        let propagation_failures = IntGauge::new(
            "ctxmesh_propagation_failures_total",
            "Propagation pushes failed or timed out",
        )?;
        let sync_cycles = IntGauge::new(
            "ctxmesh_sync_cycles_total",
            "Completed replica catch-up passes",
        )?;
        let contexts = IntGauge::new("ctxmesh_contexts", "Stored context count")?;

        for metric in [
            Box::new(saves_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(deletes_total.clone()),
            Box::new(stream_events_total.clone()),
            Box::new(stream_subscribers.clone()),
            Box::new(propagation_pushes.clone()),
            Box::new(propagation_failures.clone()),
            Box::new(sync_cycles.clone()),
            Box::new(contexts.clone()),
        ] {
            registry
                .register(metric)
                .context("metric registration failed")?;
        }

        Ok(Self {
            registry,
            saves_total,
            deletes_total,
            stream_events_total,
            stream_subscribers,
            propagation_pushes,
            propagation_failures,
            sync_cycles,
            contexts,
        })
    }

    /// Render the Prometheus exposition text.
    pub fn render(&self, snapshot: MetricsSnapshot) -> Result<String> {
        self.contexts.set(snapshot.contexts as i64);
        self.propagation_pushes.set(snapshot.propagation_pushes as i64);
        self.propagation_failures
            .set(snapshot.propagation_failures as i64);
        self.sync_cycles.set(snapshot.sync_cycles as i64);

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("metric encoding failed")?;
        String::from_utf8(buffer).context("metric exposition was not utf-8")
    }
}
