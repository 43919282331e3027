//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "In-process fan-out buffers between pipeline stages."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// Snapshot of buffer activity used for shutdown summaries and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BufferMetrics {
    /// Items accepted by `publish`.
    pub published: u64,
    /// Items taken off the ingress queue by the dispatch loop.
    pub dispatched: u64,
    /// Handler invocations that completed successfully.
    pub delivered: u64,
    /// Handler invocations that returned an error or panicked.
    pub failed: u64,
    /// Items discarded because a bounded queue was full.
    pub dropped: u64,
    /// Queued items and handler deliveries not finished yet.
    pub pending: u64,
}

/// Prometheus handles for one buffer. Every metric carries a constant
/// `buffer` label so several buffers can share a registry.
#[derive(Debug, Clone)]
pub struct BufferCounters {
    published: IntCounter,
    dispatched: IntCounter,
    delivered: IntCounter,
    failed: IntCounter,
    dropped: IntCounter,
    pending: IntGauge,
}

impl BufferCounters {
    /// Register the metrics of buffer `buffer` with the provided registry.
    pub fn register(registry: &Registry, buffer: &str) -> Result<Self, prometheus::Error> {
        let opts = |name: &str, help: &str| Opts::new(name, help).const_label("buffer", buffer);
        let published = IntCounter::with_opts(opts(
            "p1_buffer_published_total",
            "Items accepted by publish",
        ))?;
        let dispatched = IntCounter::with_opts(opts(
            "p1_buffer_dispatched_total",
            "Items offered to every registered handler",
        ))?;
        let delivered = IntCounter::with_opts(opts(
            "p1_buffer_delivered_total",
            "Handler invocations that completed",
        ))?;
        let failed = IntCounter::with_opts(opts(
            "p1_buffer_failed_total",
            "Handler invocations that returned an error or panicked",
        ))?;
        let dropped = IntCounter::with_opts(opts(
            "p1_buffer_dropped_total",
            "Items discarded by a full bounded queue",
        ))?;
        let pending = IntGauge::with_opts(opts(
            "p1_buffer_pending",
            "Queued items and handler deliveries not finished yet",
        ))?;

        registry.register(Box::new(published.clone()))?;
        registry.register(Box::new(dispatched.clone()))?;
        registry.register(Box::new(delivered.clone()))?;
        registry.register(Box::new(failed.clone()))?;
        registry.register(Box::new(dropped.clone()))?;
        registry.register(Box::new(pending.clone()))?;

        Ok(Self {
            published,
            dispatched,
            delivered,
            failed,
            dropped,
            pending,
        })
    }

    /// Ingress push succeeded; pending was already raised by `record_handoff`.
    pub(crate) fn record_published(&self) {
        self.published.inc();
    }

    /// Called before an item is pushed onto the ingress queue or a handler
    /// queue, so consumers can never finish it first.
    pub(crate) fn record_handoff(&self) {
        self.pending.inc();
    }

    /// Ingress queue refused an item that `record_handoff` already counted.
    pub(crate) fn record_publish_rejected(&self, full: bool) {
        if full {
            self.dropped.inc();
        }
        self.pending.dec();
    }

    /// Called once an ingress item has been offered to every handler.
    pub(crate) fn record_dispatched(&self) {
        self.dispatched.inc();
        self.pending.dec();
    }

    pub(crate) fn record_delivered(&self) {
        self.delivered.inc();
        self.pending.dec();
    }

    pub(crate) fn record_failed(&self) {
        self.failed.inc();
        self.pending.dec();
    }

    /// Handler queue refused an item that `record_handoff` already counted.
    pub(crate) fn record_handoff_rejected(&self, full: bool) {
        if full {
            self.dropped.inc();
        } else {
            self.failed.inc();
        }
        self.pending.dec();
    }

    pub(crate) fn pending(&self) -> u64 {
        u64::try_from(self.pending.get()).unwrap_or(0)
    }

    /// Read the current metric values.
    pub fn snapshot(&self) -> BufferMetrics {
        BufferMetrics {
            published: self.published.get(),
            dispatched: self.dispatched.get(),
            delivered: self.delivered.get(),
            failed: self.failed.get(),
            dropped: self.dropped.get(),
            pending: self.pending(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let registry = Registry::new();
        let counters = BufferCounters::register(&registry, "telegrams").expect("register metrics");
        for _ in 0..3 {
            counters.record_handoff();
        }
        counters.record_published();
        counters.record_published();
        counters.record_publish_rejected(true);
        counters.record_handoff();
        counters.record_handoff();
        counters.record_handoff();
        counters.record_handoff_rejected(true);
        counters.record_dispatched();
        counters.record_delivered();
        counters.record_failed();

        assert_eq!(
            counters.snapshot(),
            BufferMetrics {
                published: 2,
                dispatched: 1,
                delivered: 1,
                failed: 1,
                dropped: 2,
                pending: 1,
            }
        );
    }

    #[test]
    fn buffers_share_a_registry_by_label() {
        let registry = Registry::new();
        let telegrams = BufferCounters::register(&registry, "telegrams").expect("register metrics");
        let measurements =
            BufferCounters::register(&registry, "measurements").expect("register metrics");
        telegrams.record_handoff();
        telegrams.record_published();
        measurements.record_handoff();
        measurements.record_publish_rejected(true);

        let families = registry.gather();
        let published = families
            .iter()
            .find(|f| f.get_name() == "p1_buffer_published_total")
            .expect("published family exported");
        assert_eq!(published.get_metric().len(), 2);
        assert!(families
            .iter()
            .any(|f| f.get_name() == "p1_buffer_pending"));
        assert_eq!(telegrams.snapshot().published, 1);
        assert_eq!(measurements.snapshot().dropped, 1);
    }

    #[test]
    fn same_buffer_name_twice_is_rejected() {
        let registry = Registry::new();
        BufferCounters::register(&registry, "telegrams").expect("register metrics");
        assert!(BufferCounters::register(&registry, "telegrams").is_err());
    }
}
