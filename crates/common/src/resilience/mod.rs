//! Resilience primitives used by the connection pool
//!
//! - [`CircuitBreaker`]: stops connection attempts after repeated failures
//! - [`BackoffStrategy`] / [`RetryPolicy`]: delay schedule between attempts

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitState, Clock,
    ConfigError, ConfigResult, MockClock, SystemClock,
};
pub use retry::{BackoffStrategy, RetryPolicy};
