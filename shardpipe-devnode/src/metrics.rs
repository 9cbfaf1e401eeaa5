//! # Node Metrics
//!
//! Per-node counters so tests can see which node served what.
//!
//! ## Design Principles
//! 1. **Accumulator Pattern**: Atomic counters aggregate events cheaply.
//! 2. **Plain Snapshots**: Readers get a `Copy` struct, never live atomics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time counters of one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Commands parsed and dispatched.
    pub commands_total: u64,
    /// Error replies other than redirections.
    pub errors_total: u64,
    /// MOVED replies sent.
    pub redirects_total: u64,
    /// Connections accepted.
    pub connections_total: u64,
}

/// Thread-safe counters. `Relaxed` ordering is enough: fields are read
/// independently and only need to be eventually consistent.
#[derive(Debug, Default)]
pub struct Metrics {
    commands_total: AtomicU64,
    errors_total: AtomicU64,
    redirects_total: AtomicU64,
    connections_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_command(&self) {
        self.commands_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_redirect(&self) {
        self.redirects_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            commands_total: self.commands_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            redirects_total: self.redirects_total.load(Ordering::Relaxed),
            connections_total: self.connections_total.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_records() {
        let metrics = Metrics::new();
        metrics.record_connection();
        metrics.record_command();
        metrics.record_command();
        metrics.record_redirect();
        metrics.record_error();

        assert_eq!(
            metrics.snapshot(),
            MetricsSnapshot {
                commands_total: 2,
                errors_total: 1,
                redirects_total: 1,
                connections_total: 1,
            }
        );
    }
}
