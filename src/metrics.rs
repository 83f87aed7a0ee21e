//! # Metrics
//!
//! Prometheus metric families owned by one [`Metrics`] instance per server.
//! The registry is not the process-global default registry, so several servers
//! (for example in tests) never collide on registration.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `meshward_last_update_seconds` | gauge | `namespace` |
//! | `meshward_http_requests_total` | counter | `method`, `status` |
//! | `meshward_relay_map_regions` | gauge | |
//! | `meshward_ephemeral_nodes_expired_total` | counter | |

use prometheus::{Encoder, GaugeVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub last_update: GaugeVec,
    pub http_requests: IntCounterVec,
    pub relay_map_regions: IntGauge,
    pub ephemeral_nodes_expired: IntCounter,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let last_update = GaugeVec::new(
            Opts::new(
                "meshward_last_update_seconds",
                "Unix time of the last topology change per namespace",
            ),
            &["namespace"],
        )?;
        let http_requests = IntCounterVec::new(
            Opts::new("meshward_http_requests_total", "HTTP requests served"),
            &["method", "status"],
        )?;
        let relay_map_regions = IntGauge::new(
            "meshward_relay_map_regions",
            "Regions in the current relay map snapshot",
        )?;
        let ephemeral_nodes_expired = IntCounter::new(
            "meshward_ephemeral_nodes_expired_total",
            "Ephemeral machines deleted after inactivity",
        )?;

        registry.register(Box::new(last_update.clone()))?;
        registry.register(Box::new(http_requests.clone()))?;
        registry.register(Box::new(relay_map_regions.clone()))?;
        registry.register(Box::new(ephemeral_nodes_expired.clone()))?;

        Ok(Self {
            registry,
            last_update,
            http_requests,
            relay_map_regions,
            ephemeral_nodes_expired,
        })
    }

    /// Text exposition of every family in this registry.
    pub fn encode(&self) -> anyhow::Result<String> {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&families, &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_independent_registries() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.ephemeral_nodes_expired.inc();
        assert_eq!(a.ephemeral_nodes_expired.get(), 1);
        assert_eq!(b.ephemeral_nodes_expired.get(), 0);
    }

    #[test]
    fn test_encode_contains_families() {
        let metrics = Metrics::new().unwrap();
        metrics.last_update.with_label_values(&["acme"]).set(42.0);
        metrics.http_requests.with_label_values(&["GET", "200"]).inc();
        metrics.relay_map_regions.set(3);

        let text = metrics.encode().unwrap();
        assert!(text.contains("meshward_last_update_seconds{namespace=\"acme\"} 42"));
        assert!(text.contains("meshward_http_requests_total{method=\"GET\",status=\"200\"} 1"));
        assert!(text.contains("meshward_relay_map_regions 3"));
    }
}
