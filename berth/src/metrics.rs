//! Operation counters.
//!
//! Plain atomic counters owned by the daemon context and shared by
//! reference; there is no process-wide metrics singleton. Consumed through
//! the status endpoint and `stats()`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters for daemon operations.
#[derive(Debug, Default)]
pub struct Metrics {
    allocations_total: AtomicU64,
    releases_total: AtomicU64,
    conflicts_detected: AtomicU64,
    auto_allocations: AtomicU64,
    health_check_failures: AtomicU64,
    health_cleanups: AtomicU64,
    observed_binds: AtomicU64,
    audit_dropped: AtomicU64,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Successful allocations.
    pub allocations_total: u64,
    /// Successful releases.
    pub releases_total: u64,
    /// Candidates rejected because the OS probe saw an external occupant.
    pub port_conflicts_detected: u64,
    /// Ranges synthesized for unknown service types.
    pub auto_allocations: u64,
    /// Individual failed health checks.
    pub health_check_failures: u64,
    /// Allocations removed by health escalation.
    pub health_cleanups: u64,
    /// Bind observations reported by the intercept library.
    pub observed_binds: u64,
    /// Audit events dropped due to backlog overflow.
    pub audit_events_dropped: u64,
}

impl Metrics {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful allocation.
    pub fn incr_allocations(&self) {
        self.allocations_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful release.
    pub fn incr_releases(&self) {
        self.releases_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a probe conflict during allocation.
    pub fn incr_conflicts(&self) {
        self.conflicts_detected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a synthesized range.
    pub fn incr_auto_allocations(&self) {
        self.auto_allocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed health check.
    pub fn incr_health_failures(&self) {
        self.health_check_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a health-escalation cleanup.
    pub fn incr_health_cleanups(&self) {
        self.health_cleanups.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an observed bind from the intercept library.
    pub fn incr_observed_binds(&self) {
        self.observed_binds.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dropped audit event.
    pub fn incr_audit_dropped(&self) {
        self.audit_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            allocations_total: self.allocations_total.load(Ordering::Relaxed),
            releases_total: self.releases_total.load(Ordering::Relaxed),
            port_conflicts_detected: self.conflicts_detected.load(Ordering::Relaxed),
            auto_allocations: self.auto_allocations.load(Ordering::Relaxed),
            health_check_failures: self.health_check_failures.load(Ordering::Relaxed),
            health_cleanups: self.health_cleanups.load(Ordering::Relaxed),
            observed_binds: self.observed_binds.load(Ordering::Relaxed),
            audit_events_dropped: self.audit_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let metrics = Metrics::new();
        let snap = metrics.snapshot();
        assert_eq!(snap.allocations_total, 0);
        assert_eq!(snap.port_conflicts_detected, 0);
    }

    #[test]
    fn test_increments_show_in_snapshot() {
        let metrics = Metrics::new();
        metrics.incr_allocations();
        metrics.incr_allocations();
        metrics.incr_conflicts();

        let snap = metrics.snapshot();
        assert_eq!(snap.allocations_total, 2);
        assert_eq!(snap.port_conflicts_detected, 1);
        assert_eq!(snap.releases_total, 0);
    }
}
