//! Connection pool counters
//!
//! Lock-free atomics so the pool can record events without taking its own
//! state mutex.

use std::sync::atomic::{AtomicU64, Ordering};

use super::types::PoolMetrics;

/// Storage metrics tracker
#[derive(Debug, Default)]
pub struct StorageMetrics {
    /// Number of connections handed out to callers
    pub connections_acquired: AtomicU64,

    /// Number of acquisitions that gave up after the pool timeout
    pub connections_timeout: AtomicU64,

    /// Number of failed connection creation attempts
    pub connections_error: AtomicU64,

    /// Number of raw connections opened
    pub connections_created: AtomicU64,

    /// Number of connections closed by the recycling policy
    pub connections_recycled: AtomicU64,

    /// Number of idle connections that failed the liveness probe
    pub validation_failures: AtomicU64,

    /// Number of calls rejected by an open circuit
    pub circuit_rejections: AtomicU64,

    /// Total time spent acquiring connections (in milliseconds)
    total_connection_time_ms: AtomicU64,
}

impl StorageMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connection_acquired(&self, duration_ms: u64) {
        self.connections_acquired.fetch_add(1, Ordering::Relaxed);
        self.total_connection_time_ms.fetch_add(duration_ms, Ordering::Relaxed);
    }

    pub fn record_connection_timeout(&self) {
        self.connections_timeout.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_error(&self) {
        self.connections_error.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_recycled(&self) {
        self.connections_recycled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_validation_failure(&self) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_rejection(&self) {
        self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Average connection acquisition time in milliseconds
    pub fn avg_connection_time_ms(&self) -> u64 {
        let total = self.total_connection_time_ms.load(Ordering::Relaxed);
        let count = self.connections_acquired.load(Ordering::Relaxed);

        if count == 0 {
            0
        } else {
            total / count
        }
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> PoolMetrics {
        PoolMetrics {
            connections_acquired: self.connections_acquired.load(Ordering::Relaxed),
            connections_timeout: self.connections_timeout.load(Ordering::Relaxed),
            connections_error: self.connections_error.load(Ordering::Relaxed),
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_recycled: self.connections_recycled.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            avg_acquisition_time_ms: self.avg_connection_time_ms(),
        }
    }
}
