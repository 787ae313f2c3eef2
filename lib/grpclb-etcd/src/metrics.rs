//! Prometheus metrics for discovery and registration

use grpclb_core::{Address, AddressSink};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Prometheus metrics collector for the discovery path
#[derive(Clone)]
pub struct DiscoveryMetrics {
    /// Watch events applied to the address table, by event type
    pub watch_events_total: IntCounterVec,
    /// Full address-set pushes delivered to the balancer
    pub address_pushes_total: IntCounter,
    /// Addresses in the most recent push
    pub addresses: IntGauge,
    /// Lease renewal acks received by registrars
    pub lease_renewals_total: IntCounter,
    /// Prometheus registry for metrics
    pub registry: Arc<Registry>,
}

impl DiscoveryMetrics {
    /// Create a new metrics collector with its own registry
    pub fn new() -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        let watch_events_total = IntCounterVec::new(
            Opts::new("grpclb_watch_events_total", "Watch events applied to the address table"),
            &["type"],
        )?;

        let address_pushes_total = IntCounter::new(
            "grpclb_address_pushes_total",
            "Address set pushes delivered to the load balancer",
        )?;

        let addresses = IntGauge::new(
            "grpclb_addresses",
            "Addresses in the most recent push",
        )?;

        let lease_renewals_total = IntCounter::new(
            "grpclb_lease_renewals_total",
            "Lease renewal acknowledgements received",
        )?;

        registry.register(Box::new(watch_events_total.clone()))?;
        registry.register(Box::new(address_pushes_total.clone()))?;
        registry.register(Box::new(addresses.clone()))?;
        registry.register(Box::new(lease_renewals_total.clone()))?;

        Ok(Self {
            watch_events_total,
            address_pushes_total,
            addresses,
            lease_renewals_total,
            registry,
        })
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Sink decorator recording every push before forwarding it
pub(crate) struct MeteredSink {
    pub(crate) inner: Arc<dyn AddressSink>,
    pub(crate) metrics: DiscoveryMetrics,
}

impl AddressSink for MeteredSink {
    fn update_addresses(&self, addresses: Vec<Address>) {
        self.metrics.address_pushes_total.inc();
        self.metrics.addresses.set(addresses.len() as i64);
        self.inner.update_addresses(addresses);
    }
}
