//! Circuit breaker guarding connection creation
//!
//! The breaker counts consecutive failed connection attempts. At the failure
//! threshold it opens and refuses new attempts until the cooldown has
//! elapsed. It then moves to half-open and admits a bounded number of trial
//! attempts: a trial success closes the circuit, a trial failure re-opens it.
//!
//! Callers gate each attempt with [`CircuitBreaker::try_acquire`] and report
//! the outcome with [`CircuitBreaker::record_success`] or
//! [`CircuitBreaker::record_failure`]. Time is read through [`Clock`] so the
//! cooldown can be driven by [`MockClock`] in tests.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

/// Monotonic time source
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

/// Manually advanced clock
///
/// Clones share the same offset, so a test keeps one handle and gives
/// another to the code under test.
#[derive(Debug, Clone)]
pub struct MockClock {
    start: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl MockClock {
    pub fn new() -> Self {
        Self { start: Instant::now(), offset: Arc::new(Mutex::new(Duration::ZERO)) }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *offset += by;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.start + *self.offset.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid circuit breaker configuration: {0}")]
    Invalid(&'static str),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Attempts are allowed
    Closed,
    /// Attempts are refused until the cooldown elapses
    Open,
    /// A limited number of trial attempts are allowed
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        })
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u64,
    /// Trial successes that close a half-open circuit
    pub success_threshold: u64,
    /// Cooldown before an open circuit admits trials
    pub timeout: Duration,
    pub half_open_max_calls: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::default()
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid("failure_threshold must be greater than 0"));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::Invalid("success_threshold must be greater than 0"));
        }
        if self.half_open_max_calls == 0 {
            return Err(ConfigError::Invalid("half_open_max_calls must be greater than 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn failure_threshold(mut self, threshold: u64) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn success_threshold(mut self, threshold: u64) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn half_open_max_calls(mut self, max_calls: u64) -> Self {
        self.config.half_open_max_calls = max_calls;
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u64,
    trial_calls: u64,
    trial_successes: u64,
    opened_at: Option<Instant>,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            trial_calls: 0,
            trial_successes: 0,
            opened_at: None,
        }
    }
}

pub struct CircuitBreaker<C: Clock = SystemClock> {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    clock: C,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.lock();
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &guard.state)
            .field("consecutive_failures", &guard.consecutive_failures)
            .finish()
    }
}

impl CircuitBreaker<SystemClock> {
    pub fn new(config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self { config, inner: Mutex::new(BreakerState::closed()), clock })
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("Circuit breaker state lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn promote_if_expired(&self, guard: &mut BreakerState) {
        if guard.state != CircuitState::Open {
            return;
        }
        let expired = guard.opened_at.is_some_and(|opened_at| {
            self.clock.now().saturating_duration_since(opened_at) >= self.config.timeout
        });
        if expired {
            guard.state = CircuitState::HalfOpen;
            guard.trial_calls = 0;
            guard.trial_successes = 0;
            debug!("Circuit cooldown elapsed, moving to half-open");
        }
    }

    /// Reserve permission for one attempt
    ///
    /// Returns `false` while the circuit is open or every trial slot is
    /// taken. A `true` result must be followed by exactly one call to
    /// [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    pub fn try_acquire(&self) -> bool {
        let mut guard = self.lock();
        self.promote_if_expired(&mut guard);
        match guard.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen if guard.trial_calls < self.config.half_open_max_calls => {
                guard.trial_calls += 1;
                true
            }
            CircuitState::HalfOpen => false,
        }
    }

    pub fn record_success(&self) {
        let mut guard = self.lock();
        match guard.state {
            CircuitState::Closed => guard.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                guard.trial_successes += 1;
                if guard.trial_successes >= self.config.success_threshold {
                    *guard = BreakerState::closed();
                    info!("Circuit closed after successful trial");
                }
            }
            CircuitState::Open => warn!("Success reported while circuit is open"),
        }
    }

    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut guard = self.lock();
        guard.consecutive_failures += 1;

        match guard.state {
            CircuitState::Closed if guard.consecutive_failures >= self.config.failure_threshold => {
                guard.state = CircuitState::Open;
                guard.opened_at = Some(now);
                warn!(
                    consecutive_failures = guard.consecutive_failures,
                    cooldown_ms = self.config.timeout.as_millis() as u64,
                    "Circuit opened"
                );
            }
            CircuitState::Closed => {}
            CircuitState::HalfOpen => {
                guard.state = CircuitState::Open;
                guard.opened_at = Some(now);
                warn!("Circuit re-opened after failed trial");
            }
            CircuitState::Open => guard.opened_at = Some(now),
        }
    }

    /// Move an open circuit whose cooldown has elapsed to half-open
    ///
    /// Returns `true` if the state changed. Lets a background thread
    /// recover the circuit while nobody is connecting.
    pub fn reset_if_expired(&self) -> bool {
        let mut guard = self.lock();
        let was_open = guard.state == CircuitState::Open;
        self.promote_if_expired(&mut guard);
        was_open && guard.state == CircuitState::HalfOpen
    }

    /// Remaining cooldown while the circuit is open
    pub fn retry_after(&self) -> Option<Duration> {
        let guard = self.lock();
        match (guard.state, guard.opened_at) {
            (CircuitState::Open, Some(opened_at)) => {
                let elapsed = self.clock.now().saturating_duration_since(opened_at);
                Some(self.config.timeout.saturating_sub(elapsed))
            }
            _ => None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.lock().consecutive_failures
    }
}
