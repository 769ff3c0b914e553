//! Health and metrics snapshots reported by connection pools

use serde::Serialize;

/// Health status of a connection pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    /// Whether the pool can currently serve connections
    pub healthy: bool,

    /// Connections checked out by callers
    pub active_connections: usize,

    /// Connections parked in the idle list
    pub idle_connections: usize,

    /// Hard cap (pool size plus overflow)
    pub max_connections: usize,

    /// Whether the circuit breaker is rejecting new connections
    pub circuit_open: bool,

    /// Explanation when unhealthy
    pub message: Option<String>,
}

impl HealthStatus {
    pub fn healthy(active: usize, idle: usize, max: usize) -> Self {
        Self {
            healthy: true,
            active_connections: active,
            idle_connections: idle,
            max_connections: max,
            circuit_open: false,
            message: None,
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            active_connections: 0,
            idle_connections: 0,
            max_connections: 0,
            circuit_open: false,
            message: Some(message.into()),
        }
    }

    /// Mark the status as degraded by an open circuit
    pub fn with_circuit_open(mut self) -> Self {
        self.healthy = false;
        self.circuit_open = true;
        self.message.get_or_insert_with(|| "circuit breaker open".to_string());
        self
    }
}

/// Pool metrics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolMetrics {
    pub connections_acquired: u64,
    pub connections_timeout: u64,
    pub connections_error: u64,
    pub connections_created: u64,
    pub connections_recycled: u64,
    pub validation_failures: u64,
    pub circuit_rejections: u64,
    pub avg_acquisition_time_ms: u64,
}

#[cfg(test)]
mod tests {
    //! Unit tests for storage::types.
    use super::*;

    #[test]
    fn test_health_status_healthy() {
        let status = HealthStatus::healthy(3, 7, 15);

        assert!(status.healthy, "Status should be marked as healthy");
        assert_eq!(status.active_connections, 3);
        assert_eq!(status.idle_connections, 7);
        assert_eq!(status.max_connections, 15);
        assert!(status.message.is_none(), "Healthy status should have no message");
    }

    #[test]
    fn test_health_status_circuit_open() {
        let status = HealthStatus::healthy(0, 0, 15).with_circuit_open();
        assert!(!status.healthy);
        assert!(status.circuit_open);
        assert_eq!(status.message.as_deref(), Some("circuit breaker open"));
    }

    #[test]
    fn test_health_status_unhealthy() {
        let status = HealthStatus::unhealthy("Pool disposed");
        assert!(!status.healthy);
        assert_eq!(status.message.as_deref(), Some("Pool disposed"));
    }
}
