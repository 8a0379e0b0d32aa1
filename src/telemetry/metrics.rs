//! Metrics collection for the management plane.
//!
//! Provides thread-safe counters for the NAT-PMP service and the peer
//! registry, plus gauges for current table sizes.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter for thread-safe increment operations.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Creates a new counter initialized to zero.
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Increments the counter by 1.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds a value to the counter.
    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    /// Gets the current value of the counter.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Global metrics registry.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    // NAT-PMP request path
    /// Number of datagrams received on the NAT-PMP socket.
    pub requests_received: Counter,
    /// Number of responses written back to clients.
    pub responses_sent: Counter,
    /// Number of datagrams dropped as malformed (short, bad version,
    /// unknown opcode).
    pub dropped_malformed: Counter,
    /// Number of response sends that failed.
    pub send_errors: Counter,

    // Mapping lifecycle
    /// Number of mappings created.
    pub mappings_created: Counter,
    /// Number of mapping renewals.
    pub mappings_renewed: Counter,
    /// Number of mappings removed by client request or peer deletion.
    pub mappings_removed: Counter,
    /// Number of mappings removed by the expiry reaper.
    pub mappings_expired: Counter,
    /// Number of failed host-rule applications.
    pub rule_failures: Counter,

    // Table size gauges (using AtomicU64 for gauges)
    /// Current number of active mappings.
    pub mappings_active: AtomicU64,
    /// Current number of tunnel peers.
    pub peers_active: AtomicU64,
}

impl MetricsRegistry {
    /// Creates a new metrics registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates the active-mappings gauge.
    pub fn set_mappings_active(&self, size: usize) {
        self.mappings_active.store(size as u64, Ordering::Relaxed);
    }

    /// Updates the active-peers gauge.
    pub fn set_peers_active(&self, size: usize) {
        self.peers_active.store(size as u64, Ordering::Relaxed);
    }

    /// Exports all metrics as key-value pairs.
    ///
    /// This format is designed to be easily convertible to Prometheus format
    /// in the future.
    pub fn export(&self) -> Vec<(String, u64)> {
        vec![
            ("requests_received".into(), self.requests_received.get()),
            ("responses_sent".into(), self.responses_sent.get()),
            ("dropped_malformed".into(), self.dropped_malformed.get()),
            ("send_errors".into(), self.send_errors.get()),
            ("mappings_created".into(), self.mappings_created.get()),
            ("mappings_renewed".into(), self.mappings_renewed.get()),
            ("mappings_removed".into(), self.mappings_removed.get()),
            ("mappings_expired".into(), self.mappings_expired.get()),
            ("rule_failures".into(), self.rule_failures.get()),
            (
                "mappings_active".into(),
                self.mappings_active.load(Ordering::Relaxed),
            ),
            (
                "peers_active".into(),
                self.peers_active.load(Ordering::Relaxed),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_basic() {
        let counter = Counter::new();
        assert_eq!(counter.get(), 0);

        counter.inc();
        assert_eq!(counter.get(), 1);

        counter.add(10);
        assert_eq!(counter.get(), 11);
    }

    #[test]
    fn test_metrics_registry_export() {
        let registry = MetricsRegistry::new();

        registry.requests_received.inc();
        registry.requests_received.inc();
        registry.mappings_created.inc();
        registry.set_mappings_active(1);
        registry.set_peers_active(3);

        let metrics = registry.export();

        assert!(metrics.contains(&("requests_received".into(), 2)));
        assert!(metrics.contains(&("mappings_created".into(), 1)));
        assert!(metrics.contains(&("mappings_active".into(), 1)));
        assert!(metrics.contains(&("peers_active".into(), 3)));
    }
}
