//! Connection pool for encrypted SQLite
//!
//! Connections live in slots identified by a [`SlotId`]. A slot is either
//! idle (parked in a FIFO queue together with its connection) or in use (its
//! connection owned by a [`PooledConnection`] guard). Closed slots are simply
//! forgotten. All slot bookkeeping happens under one mutex; the driver calls
//! (opening, validating, closing) run with the mutex released.
//!
//! New connections go through a circuit breaker: after
//! `max_consecutive_errors` failed attempts the pool stops calling the
//! driver until `circuit_reset_timeout` has passed, then lets exactly one
//! trial attempt through.
//!
//! A background thread sweeps idle connections that are too old, too used or
//! idle for too long, and moves an expired circuit to half-open.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use hidesync_common::resilience::{
    BackoffStrategy, CircuitBreaker, CircuitBreakerConfig, CircuitState, Clock, RetryPolicy,
    SystemClock,
};
use hidesync_common::storage::{
    apply_connection_pragmas, configure_sqlcipher, verify_encryption, ConnectionPragmas,
    HealthStatus, PoolMetrics, SqlCipherConfig, StorageError, StorageMetrics, StorageResult,
};
use hidesync_domain::{DatabaseConfig, PoolConfig};
use parking_lot::{Condvar, Mutex, MutexGuard};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

const HEALTH_THREAD_NAME: &str = "hidesync-pool-health";

/// Opens raw connections for the pool
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Open and fully configure one connection
    fn connect(&self) -> StorageResult<Connection>;

    /// Human-readable target, used in logs
    fn describe(&self) -> String;
}

/// Opens SQLCipher connections: key, cipher profile, key probe, PRAGMAs
pub struct EncryptedConnectionFactory {
    path: PathBuf,
    cipher: SqlCipherConfig,
    pragmas: ConnectionPragmas,
}

impl EncryptedConnectionFactory {
    pub fn new(path: impl Into<PathBuf>, cipher: SqlCipherConfig) -> Self {
        Self { path: path.into(), cipher, pragmas: ConnectionPragmas::default() }
    }

    pub fn with_pragmas(mut self, pragmas: ConnectionPragmas) -> Self {
        self.pragmas = pragmas;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for EncryptedConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedConnectionFactory")
            .field("path", &self.path)
            .field("cipher", &self.cipher)
            .finish()
    }
}

impl ConnectionFactory for EncryptedConnectionFactory {
    fn connect(&self) -> StorageResult<Connection> {
        let conn = open_connection(&self.path)?;
        configure_sqlcipher(&conn, &self.cipher)?;
        verify_encryption(&conn)?;
        apply_connection_pragmas(&conn, &self.pragmas)?;
        Ok(conn)
    }

    fn describe(&self) -> String {
        format!("sqlcipher:{}", self.path.display())
    }
}

/// Opens unencrypted connections with the same PRAGMAs
#[derive(Debug)]
pub struct PlainConnectionFactory {
    path: PathBuf,
    pragmas: ConnectionPragmas,
}

impl PlainConnectionFactory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), pragmas: ConnectionPragmas::default() }
    }

    pub fn with_pragmas(mut self, pragmas: ConnectionPragmas) -> Self {
        self.pragmas = pragmas;
        self
    }
}

impl ConnectionFactory for PlainConnectionFactory {
    fn connect(&self) -> StorageResult<Connection> {
        let conn = open_connection(&self.path)?;
        apply_connection_pragmas(&conn, &self.pragmas)?;
        Ok(conn)
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }
}

fn open_connection(path: &Path) -> StorageResult<Connection> {
    Connection::open(path).map_err(|e| {
        StorageError::Connection(format!("Failed to open {}: {}", path.display(), e))
    })
}

/// Connection PRAGMAs derived from the database section of the config
pub fn connection_pragmas(database: &DatabaseConfig) -> ConnectionPragmas {
    ConnectionPragmas {
        enable_wal: database.enable_wal,
        enable_foreign_keys: true,
        busy_timeout: Duration::from_millis(database.busy_timeout_ms),
    }
}

/// Pool sizing, recycling and resilience settings
///
/// A zero `recycle`, `max_idle` or `max_usage` disables that limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOptions {
    pub pool_size: usize,
    pub max_overflow: usize,
    /// How long `connect()` waits for a free slot
    pub timeout: Duration,
    /// Maximum connection age
    pub recycle: Duration,
    /// Maximum time a connection may sit idle
    pub max_idle: Duration,
    /// Maximum number of checkouts per connection
    pub max_usage: u64,
    /// Health thread period, zero disables the thread
    pub health_check_interval: Duration,
    pub max_consecutive_errors: u64,
    pub circuit_reset_timeout: Duration,
    /// Attempts per connection creation, including the first
    pub connect_retries: u32,
    pub retry_base_delay: Duration,
    /// Upper bound on a single wait for a released connection
    pub poll_interval: Duration,
}

impl PoolOptions {
    /// Hard cap on open connections
    pub fn capacity(&self) -> usize {
        self.pool_size + self.max_overflow
    }

    fn retry_policy(&self) -> RetryPolicy {
        let max_delay = self.retry_base_delay.saturating_mul(1 << self.connect_retries.min(16));
        RetryPolicy::new(
            self.connect_retries,
            BackoffStrategy::exponential(self.retry_base_delay, max_delay),
        )
    }

    fn breaker_config(&self) -> StorageResult<CircuitBreakerConfig> {
        CircuitBreakerConfig::builder()
            .failure_threshold(self.max_consecutive_errors)
            .success_threshold(1)
            .half_open_max_calls(1)
            .timeout(self.circuit_reset_timeout)
            .build()
            .map_err(|e| StorageError::InvalidConfig(e.to_string()))
    }
}

impl From<&PoolConfig> for PoolOptions {
    fn from(config: &PoolConfig) -> Self {
        Self {
            pool_size: config.pool_size,
            max_overflow: config.max_overflow,
            timeout: Duration::from_secs(config.timeout_secs),
            recycle: Duration::from_secs(config.recycle_secs),
            max_idle: Duration::from_secs(config.max_idle_secs),
            max_usage: config.max_usage,
            health_check_interval: Duration::from_secs(config.health_check_interval_secs),
            max_consecutive_errors: config.max_consecutive_errors,
            circuit_reset_timeout: Duration::from_secs(config.circuit_reset_timeout_secs),
            connect_retries: config.connect_retries,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::from(&PoolConfig::default())
    }
}

/// Stable handle of a pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SlotId(u64);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct SlotMeta {
    created_at: Instant,
    last_used: Instant,
    use_count: u64,
}

struct IdleSlot {
    id: SlotId,
    conn: Connection,
    meta: SlotMeta,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<IdleSlot>,
    in_use: HashMap<SlotId, SlotMeta>,
    /// Slots reserved by connections being opened
    pending: usize,
    next_id: u64,
    disposed: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.in_use.len() + self.pending
    }

    fn next_slot_id(&mut self) -> SlotId {
        self.next_id += 1;
        SlotId(self.next_id)
    }
}

/// Point-in-time pool occupancy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub idle: usize,
    pub in_use: usize,
    pub pending: usize,
    pub capacity: usize,
    pub circuit_state: String,
    pub disposed: bool,
}

struct PoolInner {
    factory: Box<dyn ConnectionFactory>,
    options: PoolOptions,
    retry: RetryPolicy,
    state: Mutex<PoolState>,
    available: Condvar,
    breaker: CircuitBreaker<Arc<dyn Clock>>,
    clock: Arc<dyn Clock>,
    metrics: StorageMetrics,
}

impl PoolInner {
    /// Why an idle connection may not be handed out again
    fn expiry_reason(&self, meta: &SlotMeta, now: Instant) -> Option<&'static str> {
        self.retire_reason(meta, now).or_else(|| {
            let idle_for = now.saturating_duration_since(meta.last_used);
            (!self.options.max_idle.is_zero() && idle_for > self.options.max_idle)
                .then_some("idle")
        })
    }

    /// Why a returned connection may not go back to the idle queue
    fn retire_reason(&self, meta: &SlotMeta, now: Instant) -> Option<&'static str> {
        let age = now.saturating_duration_since(meta.created_at);
        if !self.options.recycle.is_zero() && age > self.options.recycle {
            Some("age")
        } else if self.options.max_usage > 0 && meta.use_count >= self.options.max_usage {
            Some("usage")
        } else {
            None
        }
    }

    /// Close expired idle connections, returns how many were closed
    fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let mut expired = Vec::new();
        let mut kept = VecDeque::with_capacity(state.idle.len());

        for slot in state.idle.drain(..) {
            match self.expiry_reason(&slot.meta, now) {
                Some(reason) => expired.push((slot, reason)),
                None => kept.push_back(slot),
            }
        }
        state.idle = kept;
        drop(state);

        let closed = expired.len();
        for (slot, reason) in expired {
            debug!(slot = %slot.id, reason, "Closing expired idle connection");
            self.metrics.record_connection_recycled();
        }
        if closed > 0 {
            self.available.notify_all();
        }
        closed
    }

    fn checkout(self: &Arc<Self>, deadline: Option<Instant>) -> StorageResult<PooledConnection> {
        let mut state = self.state.lock();
        let mut swept = false;

        loop {
            if state.disposed {
                return Err(StorageError::Connection("connection pool has been disposed".into()));
            }

            if !swept && state.total() >= self.options.capacity() && !state.idle.is_empty() {
                swept = true;
                let closed = MutexGuard::unlocked(&mut state, || self.sweep());
                debug!(closed, "Pool at capacity, forced idle cleanup");
                continue;
            }

            while let Some(slot) = state.idle.pop_front() {
                let now = self.clock.now();
                if let Some(reason) = self.expiry_reason(&slot.meta, now) {
                    debug!(slot = %slot.id, reason, "Discarding expired idle connection");
                    self.metrics.record_connection_recycled();
                    MutexGuard::unlocked(&mut state, || drop(slot.conn));
                    continue;
                }

                let meta =
                    SlotMeta { last_used: now, use_count: slot.meta.use_count + 1, ..slot.meta };
                state.in_use.insert(slot.id, meta);

                let conn = slot.conn;
                let valid = MutexGuard::unlocked(&mut state, || is_alive(&conn));
                if valid {
                    return Ok(PooledConnection::new(slot.id, conn, Arc::clone(self)));
                }

                warn!(slot = %slot.id, "Idle connection failed validation, closing");
                self.metrics.record_validation_failure();
                state.in_use.remove(&slot.id);
                MutexGuard::unlocked(&mut state, || drop(conn));
            }

            if state.total() < self.options.capacity() {
                state.pending += 1;
                let id = state.next_slot_id();
                let created = MutexGuard::unlocked(&mut state, || self.create_with_retry(deadline));
                state.pending -= 1;

                return match created {
                    Ok(conn) => {
                        let now = self.clock.now();
                        state
                            .in_use
                            .insert(id, SlotMeta { created_at: now, last_used: now, use_count: 1 });
                        debug!(slot = %id, open = state.total(), "Opened new connection");
                        Ok(PooledConnection::new(id, conn, Arc::clone(self)))
                    }
                    Err(e) => {
                        self.available.notify_one();
                        Err(e)
                    }
                };
            }

            let Some(deadline) = deadline else {
                return Err(StorageError::PoolExhausted { capacity: self.options.capacity() });
            };
            let now = Instant::now();
            if now >= deadline {
                self.metrics.record_connection_timeout();
                warn!(
                    capacity = self.options.capacity(),
                    timeout_ms = self.options.timeout.as_millis() as u64,
                    "Timed out waiting for a pooled connection"
                );
                return Err(StorageError::Timeout(self.options.timeout));
            }
            let wait = (deadline - now).min(self.options.poll_interval);
            self.available.wait_for(&mut state, wait);
        }
    }

    /// Open a connection through the circuit breaker with backoff
    fn create_with_retry(&self, deadline: Option<Instant>) -> StorageResult<Connection> {
        let mut attempt = 0;
        loop {
            if !self.breaker.try_acquire() {
                self.metrics.record_circuit_rejection();
                let retry_after = self.breaker.retry_after();
                warn!(
                    retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
                    "Circuit open, not attempting a new connection"
                );
                return Err(StorageError::CircuitOpen { retry_after });
            }

            match self.factory.connect() {
                Ok(conn) => {
                    self.breaker.record_success();
                    self.metrics.record_connection_created();
                    return Ok(conn);
                }
                Err(e) => {
                    self.breaker.record_failure();
                    self.metrics.record_connection_error();

                    let Some(delay) = self.retry.delay_after(attempt) else {
                        warn!(attempts = attempt + 1, error = %e, "Connection attempts exhausted");
                        return Err(e);
                    };
                    if deadline.is_some_and(|d| Instant::now() + delay >= d) {
                        warn!(error = %e, "Connection attempt failed, no time left to retry");
                        return Err(e);
                    }

                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Connection attempt failed, retrying"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }

    fn release_slot(&self, id: SlotId, conn: Connection) {
        let mut broken = false;
        if !conn.is_autocommit() {
            warn!(slot = %id, "Connection returned inside a transaction, rolling back");
            if let Err(e) = conn.execute_batch("ROLLBACK") {
                warn!(slot = %id, error = %e, "Rollback on release failed, closing connection");
                broken = true;
            }
        }

        let now = self.clock.now();
        let mut state = self.state.lock();
        let Some(meta) = state.in_use.remove(&id) else {
            // Pool was disposed while the connection was out.
            drop(state);
            debug!(slot = %id, "Closing connection released after dispose");
            return;
        };

        let retire = if broken { Some("broken") } else { self.retire_reason(&meta, now) };
        match retire {
            Some(reason) => {
                drop(state);
                debug!(slot = %id, reason, "Recycling connection on release");
                self.metrics.record_connection_recycled();
                drop(conn);
            }
            None => {
                state.idle.push_back(IdleSlot { id, conn, meta: SlotMeta { last_used: now, ..meta } });
                drop(state);
            }
        }
        self.available.notify_one();
    }
}

fn is_alive(conn: &Connection) -> bool {
    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).is_ok()
}

struct HealthThread {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: JoinHandle<()>,
}

impl HealthThread {
    fn spawn(pool: Weak<PoolInner>, interval: Duration) -> StorageResult<Self> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&stop);

        let handle = thread::Builder::new().name(HEALTH_THREAD_NAME.to_string()).spawn(move || {
            let (flag, wake) = &*signal;
            loop {
                {
                    let mut stopped = flag.lock();
                    if !*stopped {
                        wake.wait_for(&mut stopped, interval);
                    }
                    if *stopped {
                        break;
                    }
                }

                let Some(inner) = pool.upgrade() else { break };
                let closed = inner.sweep();
                if inner.breaker.reset_if_expired() {
                    info!("Circuit cooldown elapsed, allowing a trial connection");
                }
                if closed > 0 {
                    debug!(closed, "Health check closed expired idle connections");
                }
            }
            debug!("Pool health thread stopped");
        })?;

        Ok(Self { stop, handle })
    }

    fn stop(self) {
        let (flag, wake) = &*self.stop;
        *flag.lock() = true;
        wake.notify_all();
        if self.handle.join().is_err() {
            warn!("Pool health thread panicked");
        }
    }
}

/// Bounded pool of SQLite connections with recycling and a circuit breaker
pub struct EnhancedConnectionPool {
    inner: Arc<PoolInner>,
    health: Mutex<Option<HealthThread>>,
}

impl fmt::Debug for EnhancedConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnhancedConnectionPool")
            .field("target", &self.inner.factory.describe())
            .field("options", &self.inner.options)
            .field("status", &self.status())
            .finish()
    }
}

impl EnhancedConnectionPool {
    pub fn new(factory: impl ConnectionFactory, options: PoolOptions) -> StorageResult<Self> {
        Self::with_clock(factory, options, Arc::new(SystemClock))
    }

    /// Pool whose slot ages and circuit cooldown follow `clock`
    pub fn with_clock(
        factory: impl ConnectionFactory,
        options: PoolOptions,
        clock: Arc<dyn Clock>,
    ) -> StorageResult<Self> {
        if options.pool_size == 0 {
            return Err(StorageError::InvalidConfig("pool_size must be greater than 0".into()));
        }

        let breaker = CircuitBreaker::with_clock(options.breaker_config()?, Arc::clone(&clock))
            .map_err(|e| StorageError::InvalidConfig(e.to_string()))?;

        let inner = Arc::new(PoolInner {
            factory: Box::new(factory),
            retry: options.retry_policy(),
            options,
            state: Mutex::new(PoolState::default()),
            available: Condvar::new(),
            breaker,
            clock,
            metrics: StorageMetrics::new(),
        });

        let health = if inner.options.health_check_interval.is_zero() {
            None
        } else {
            Some(HealthThread::spawn(Arc::downgrade(&inner), inner.options.health_check_interval)?)
        };

        info!(
            target_db = %inner.factory.describe(),
            pool_size = inner.options.pool_size,
            max_overflow = inner.options.max_overflow,
            health_thread = health.is_some(),
            "Connection pool created"
        );

        Ok(Self { inner, health: Mutex::new(health) })
    }

    /// Check out a connection, waiting up to the pool timeout for a free slot
    #[instrument(skip(self))]
    pub fn connect(&self) -> StorageResult<PooledConnection> {
        let start = Instant::now();
        let conn = self.inner.checkout(Some(start + self.inner.options.timeout))?;
        self.inner.metrics.record_connection_acquired(start.elapsed().as_millis() as u64);
        Ok(conn)
    }

    /// Check out a connection without waiting for a free slot
    ///
    /// Fails with `PoolExhausted` when every slot is taken.
    pub fn try_connect(&self) -> StorageResult<PooledConnection> {
        let start = Instant::now();
        let conn = self.inner.checkout(None)?;
        self.inner.metrics.record_connection_acquired(start.elapsed().as_millis() as u64);
        Ok(conn)
    }

    /// Return a connection to the pool
    ///
    /// Equivalent to dropping the guard.
    pub fn release(&self, conn: PooledConnection) {
        if !Arc::ptr_eq(&self.inner, &conn.pool) {
            warn!(slot = %conn.id, "Connection released to a pool that did not issue it");
        }
        drop(conn);
    }

    /// Close expired idle connections now
    pub fn cleanup(&self) -> usize {
        self.inner.sweep()
    }

    /// Stop the health thread and close every connection
    ///
    /// Connections still checked out are closed when their guards drop.
    pub fn dispose(&self) {
        if let Some(health) = self.health.lock().take() {
            health.stop();
        }

        let (idle, abandoned) = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            let idle = std::mem::take(&mut state.idle);
            let abandoned = state.in_use.len();
            state.in_use.clear();
            (idle, abandoned)
        };

        let closed = idle.len();
        drop(idle);
        self.inner.available.notify_all();
        info!(closed_idle = closed, checked_out = abandoned, "Connection pool disposed");
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            idle: state.idle.len(),
            in_use: state.in_use.len(),
            pending: state.pending,
            capacity: self.inner.options.capacity(),
            circuit_state: self.inner.breaker.state().to_string(),
            disposed: state.disposed,
        }
    }

    pub fn health_check(&self) -> HealthStatus {
        let status = self.status();
        if status.disposed {
            return HealthStatus::unhealthy("connection pool has been disposed");
        }

        let health = HealthStatus::healthy(status.in_use, status.idle, status.capacity);
        if self.inner.breaker.state() == CircuitState::Open {
            health.with_circuit_open()
        } else {
            health
        }
    }

    pub fn metrics(&self) -> PoolMetrics {
        self.inner.metrics.snapshot()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.inner.breaker.state()
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    /// Slot ids currently idle and in use, in that order
    pub fn slot_ids(&self) -> (Vec<SlotId>, Vec<SlotId>) {
        let state = self.inner.state.lock();
        let idle = state.idle.iter().map(|slot| slot.id).collect();
        let mut in_use: Vec<_> = state.in_use.keys().copied().collect();
        in_use.sort();
        (idle, in_use)
    }
}

impl Drop for EnhancedConnectionPool {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// A checked-out connection, returned to its pool on drop
pub struct PooledConnection {
    id: SlotId,
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    fn new(id: SlotId, conn: Connection, pool: Arc<PoolInner>) -> Self {
        Self { id, conn: Some(conn), pool }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection").field("id", &self.id).finish()
    }
}

// `conn` is `Some` from construction until `Drop` takes it.
impl Deref for PooledConnection {
    type Target = Connection;

    #[allow(clippy::expect_used)]
    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection is present until drop - this is a bug")
    }
}

impl DerefMut for PooledConnection {
    #[allow(clippy::expect_used)]
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection is present until drop - this is a bug")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release_slot(self.id, conn);
        }
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for database::pool.
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use hidesync_common::resilience::MockClock;

    use super::*;

    #[derive(Clone, Default)]
    struct FakeFactory {
        calls: Arc<AtomicUsize>,
        failing: Arc<AtomicBool>,
    }

    impl ConnectionFactory for FakeFactory {
        fn connect(&self) -> StorageResult<Connection> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(StorageError::Connection("refused".into()));
            }
            Ok(Connection::open_in_memory()?)
        }

        fn describe(&self) -> String {
            "fake".into()
        }
    }

    fn options() -> PoolOptions {
        PoolOptions {
            pool_size: 1,
            max_overflow: 1,
            timeout: Duration::from_millis(50),
            recycle: Duration::from_secs(3600),
            max_idle: Duration::from_secs(300),
            max_usage: 100,
            health_check_interval: Duration::ZERO,
            max_consecutive_errors: 2,
            circuit_reset_timeout: Duration::from_secs(30),
            connect_retries: 3,
            retry_base_delay: Duration::from_millis(1),
            poll_interval: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_idle_connection_reused() {
        let factory = FakeFactory::default();
        let pool = EnhancedConnectionPool::new(factory.clone(), options()).unwrap();

        let first = pool.connect().unwrap().id();
        let second = pool.connect().unwrap().id();

        assert_eq!(first, second);
        assert_eq!(factory.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.status().idle, 1);
    }

    #[test]
    fn test_capacity_timeout_and_exhaustion() {
        let pool = EnhancedConnectionPool::new(FakeFactory::default(), options()).unwrap();
        let _a = pool.connect().unwrap();
        let _b = pool.connect().unwrap();

        assert!(matches!(pool.connect(), Err(StorageError::Timeout(_))));
        assert!(matches!(pool.try_connect(), Err(StorageError::PoolExhausted { capacity: 2 })));
        assert_eq!(pool.metrics().connections_timeout, 1);
    }

    #[test]
    fn test_usage_limit_recycles() {
        let factory = FakeFactory::default();
        let pool = EnhancedConnectionPool::new(
            factory.clone(),
            PoolOptions { max_usage: 2, ..options() },
        )
        .unwrap();

        let first = pool.connect().unwrap().id();
        assert_eq!(pool.connect().unwrap().id(), first);
        // Two checkouts reached the limit, so the slot was closed on release.
        assert_eq!(pool.status().idle, 0);
        assert_ne!(pool.connect().unwrap().id(), first);
        assert_eq!(pool.metrics().connections_recycled, 1);
    }

    #[test]
    fn test_age_limit_with_mock_clock() {
        let clock = MockClock::new();
        let pool = EnhancedConnectionPool::with_clock(
            FakeFactory::default(),
            PoolOptions { recycle: Duration::from_secs(60), ..options() },
            Arc::new(clock.clone()),
        )
        .unwrap();

        let first = pool.connect().unwrap().id();
        clock.advance(Duration::from_secs(61));
        assert_ne!(pool.connect().unwrap().id(), first);
    }

    #[test]
    fn test_mutable_access_until_returned() {
        let pool = EnhancedConnectionPool::new(FakeFactory::default(), options()).unwrap();
        {
            let mut conn = pool.connect().unwrap();
            let tx = conn.transaction().unwrap();
            tx.execute_batch("CREATE TABLE scratch (x INTEGER);").unwrap();
            tx.commit().unwrap();
            assert_eq!(pool.status().in_use, 1);
        }

        assert_eq!(pool.status().idle, 1);
        let conn = pool.connect().unwrap();
        let tables: i64 = conn
            .query_row("SELECT count(*) FROM sqlite_master WHERE name = 'scratch'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(tables, 1);
    }

    #[test]
    fn test_release_rolls_back_open_transaction() {
        let pool = EnhancedConnectionPool::new(FakeFactory::default(), options()).unwrap();
        {
            let conn = pool.connect().unwrap();
            conn.execute_batch("BEGIN; CREATE TABLE scratch (x INTEGER);").unwrap();
        }

        let conn = pool.connect().unwrap();
        assert!(conn.is_autocommit());
        let tables: i64 = conn
            .query_row("SELECT count(*) FROM sqlite_master WHERE name = 'scratch'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(tables, 0);
    }

    #[test]
    fn test_circuit_opens_and_allows_one_trial() {
        let clock = MockClock::new();
        let factory = FakeFactory::default();
        factory.failing.store(true, Ordering::SeqCst);
        let pool =
            EnhancedConnectionPool::with_clock(factory.clone(), options(), Arc::new(clock.clone()))
                .unwrap();

        assert!(pool.connect().is_err());
        assert_eq!(factory.calls.load(Ordering::SeqCst), 2);
        assert_eq!(pool.circuit_state(), CircuitState::Open);

        assert!(matches!(pool.connect(), Err(StorageError::CircuitOpen { .. })));
        assert_eq!(factory.calls.load(Ordering::SeqCst), 2);

        clock.advance(Duration::from_secs(31));
        assert!(pool.connect().is_err());
        assert_eq!(factory.calls.load(Ordering::SeqCst), 3);

        clock.advance(Duration::from_secs(31));
        factory.failing.store(false, Ordering::SeqCst);
        assert!(pool.connect().is_ok());
        assert_eq!(pool.circuit_state(), CircuitState::Closed);
    }

    #[test]
    fn test_cleanup_closes_idle() {
        let clock = MockClock::new();
        let pool = EnhancedConnectionPool::with_clock(
            FakeFactory::default(),
            options(),
            Arc::new(clock.clone()),
        )
        .unwrap();
        drop(pool.connect().unwrap());
        assert_eq!(pool.status().idle, 1);

        clock.advance(Duration::from_secs(301));
        assert_eq!(pool.cleanup(), 1);
        assert_eq!(pool.status().idle, 0);
    }

    #[test]
    fn test_health_thread_half_opens_circuit() {
        let clock = MockClock::new();
        let factory = FakeFactory::default();
        factory.failing.store(true, Ordering::SeqCst);
        let pool = EnhancedConnectionPool::with_clock(
            factory,
            PoolOptions { health_check_interval: Duration::from_millis(5), ..options() },
            Arc::new(clock.clone()),
        )
        .unwrap();

        assert!(pool.connect().is_err());
        assert_eq!(pool.circuit_state(), CircuitState::Open);
        clock.advance(Duration::from_secs(31));

        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.circuit_state() != CircuitState::HalfOpen && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.circuit_state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_dispose() {
        let pool = EnhancedConnectionPool::new(FakeFactory::default(), options()).unwrap();
        let held = pool.connect().unwrap();
        drop(pool.connect().unwrap());

        pool.dispose();
        let status = pool.status();
        assert!(status.disposed);
        assert_eq!((status.idle, status.in_use), (0, 0));
        assert!(pool.connect().is_err());
        assert!(!pool.health_check().healthy);

        drop(held);
        assert_eq!(pool.status().idle, 0);
    }
}
