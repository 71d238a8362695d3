//! # Lease Statistics
//!
//! Lock-free counters for user-pool leases, recorded on the acquire hot path
//! by the connection source and read by `DbClient::pool_utilization`.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Relaxed atomic counters for one pool.
///
/// Writers record from many tasks at once; readers take a [`LeaseStatsSnapshot`].
#[derive(Debug)]
pub struct LeaseStats {
    pool_name: String,
    max_connections: u32,
    slow_threshold_us: u64,

    leases: AtomicU64,
    total_lease_time_us: AtomicU64,
    max_lease_time_us: AtomicU64,
    slow_leases: AtomicU64,

    /// Pool timeouts and pool-closed failures
    lease_errors: AtomicU64,
    /// Lease attempts abandoned because the caller cancelled or timed out
    cancelled_leases: AtomicU64,
    /// Leased handles found dead and discarded
    stale_connections: AtomicU64,
    /// Physical connections closed past their lifetime
    evictions: AtomicU64,
}

impl LeaseStats {
    pub fn new(pool_name: impl Into<String>, max_connections: u32, slow_threshold: Duration) -> Self {
        Self {
            pool_name: pool_name.into(),
            max_connections,
            slow_threshold_us: slow_threshold.as_micros() as u64,
            leases: AtomicU64::new(0),
            total_lease_time_us: AtomicU64::new(0),
            max_lease_time_us: AtomicU64::new(0),
            slow_leases: AtomicU64::new(0),
            lease_errors: AtomicU64::new(0),
            cancelled_leases: AtomicU64::new(0),
            stale_connections: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Record a successful lease. Returns true when it crossed the slow threshold.
    #[inline]
    pub fn record_lease(&self, waited: Duration) -> bool {
        let waited_us = waited.as_micros() as u64;
        self.leases.fetch_add(1, Ordering::Relaxed);
        self.total_lease_time_us
            .fetch_add(waited_us, Ordering::Relaxed);
        self.max_lease_time_us.fetch_max(waited_us, Ordering::Relaxed);

        let slow = waited_us >= self.slow_threshold_us;
        if slow {
            self.slow_leases.fetch_add(1, Ordering::Relaxed);
        }
        slow
    }

    #[inline]
    pub fn record_error(&self) {
        self.lease_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cancelled(&self) {
        self.cancelled_leases.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_stale(&self) {
        self.stale_connections.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LeaseStatsSnapshot {
        let leases = self.leases.load(Ordering::Relaxed);
        let total_lease_time_us = self.total_lease_time_us.load(Ordering::Relaxed);

        LeaseStatsSnapshot {
            pool_name: self.pool_name.clone(),
            max_connections: self.max_connections,
            leases,
            slow_leases: self.slow_leases.load(Ordering::Relaxed),
            lease_errors: self.lease_errors.load(Ordering::Relaxed),
            cancelled_leases: self.cancelled_leases.load(Ordering::Relaxed),
            stale_connections: self.stale_connections.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            average_lease_time_us: if leases > 0 {
                total_lease_time_us as f64 / leases as f64
            } else {
                0.0
            },
            max_lease_time_us: self.max_lease_time_us.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaseStatsSnapshot {
    pub pool_name: String,
    pub max_connections: u32,
    pub leases: u64,
    pub slow_leases: u64,
    pub lease_errors: u64,
    pub cancelled_leases: u64,
    pub stale_connections: u64,
    pub evictions: u64,
    pub average_lease_time_us: f64,
    pub max_lease_time_us: u64,
}
