//! Session factory
//!
//! The session mode is chosen once, when the factory is built from
//! configuration:
//!
//! - **Encrypted**: the encryption manager loaded a key and the driver has
//!   cipher support. Every session checks a connection out of one shared
//!   [`EnhancedConnectionPool`].
//! - **Plain**: encryption is optional and unavailable. Every thread gets
//!   its own r2d2 engine over the same file, so connections never cross
//!   threads.
//!
//! When encryption is mandatory and unavailable, building the factory fails.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hidesync_common::storage::{
    apply_connection_pragmas, ConnectionPragmas, HealthStatus, StorageError, StorageResult,
};
use hidesync_domain::{Config, HideSyncError, QueryConfig};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::encryption::EncryptionManager;
use super::pool::{connection_pragmas, EnhancedConnectionPool, PoolOptions};
use super::session::Session;
use crate::errors::conversions::to_domain;
use crate::security::KeyManager;

mod sealed {
    pub trait Sealed {}
}

/// How sessions reach the database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Encrypted,
    Plain,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Encrypted => "encrypted",
            Self::Plain => "plain",
        })
    }
}

/// Source of sessions; implemented only by this module
pub trait SessionProvider: sealed::Sealed + Send + Sync {
    fn session(&self) -> StorageResult<Session>;

    fn mode(&self) -> SessionMode;

    fn health(&self) -> HealthStatus;

    /// Close pooled connections
    fn dispose(&self);
}

/// Sessions over the shared encrypted pool
pub struct EncryptedSessionProvider {
    pool: Arc<EnhancedConnectionPool>,
    query: QueryConfig,
}

impl EncryptedSessionProvider {
    pub fn new(pool: EnhancedConnectionPool, query: QueryConfig) -> Self {
        Self { pool: Arc::new(pool), query }
    }

    pub fn pool(&self) -> &EnhancedConnectionPool {
        &self.pool
    }
}

impl sealed::Sealed for EncryptedSessionProvider {}

impl SessionProvider for EncryptedSessionProvider {
    fn session(&self) -> StorageResult<Session> {
        Ok(Session::new(self.pool.connect()?, self.query.clone()))
    }

    fn mode(&self) -> SessionMode {
        SessionMode::Encrypted
    }

    fn health(&self) -> HealthStatus {
        self.pool.health_check()
    }

    fn dispose(&self) {
        self.pool.dispose();
    }
}

static NEXT_PROVIDER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static ENGINES: RefCell<HashMap<u64, Pool<SqliteConnectionManager>>> =
        RefCell::new(HashMap::new());
}

/// Sessions over per-thread plain SQLite engines
pub struct PlainSessionProvider {
    id: u64,
    path: PathBuf,
    pragmas: ConnectionPragmas,
    max_size: u32,
    timeout: Duration,
    query: QueryConfig,
}

impl fmt::Debug for PlainSessionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlainSessionProvider")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("max_size", &self.max_size)
            .finish()
    }
}

impl PlainSessionProvider {
    pub fn new(config: &Config) -> Self {
        Self {
            id: NEXT_PROVIDER_ID.fetch_add(1, Ordering::Relaxed),
            path: PathBuf::from(&config.database.path),
            pragmas: connection_pragmas(&config.database),
            max_size: u32::try_from(config.pool.capacity()).unwrap_or(u32::MAX).max(1),
            timeout: Duration::from_secs(config.pool.timeout_secs.max(1)),
            query: config.query.clone(),
        }
    }

    /// This thread's engine, built on first use
    fn engine(&self) -> StorageResult<Pool<SqliteConnectionManager>> {
        ENGINES.with(|engines| {
            let mut engines = engines.borrow_mut();
            if let Some(engine) = engines.get(&self.id) {
                return Ok(engine.clone());
            }

            let engine = self.build_engine()?;
            debug!(provider = self.id, path = %self.path.display(), "Created thread engine");
            engines.insert(self.id, engine.clone());
            Ok(engine)
        })
    }

    fn build_engine(&self) -> StorageResult<Pool<SqliteConnectionManager>> {
        let pragmas = self.pragmas.clone();
        let manager = SqliteConnectionManager::file(&self.path).with_init(move |conn| {
            apply_connection_pragmas(conn, &pragmas)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
        });

        Pool::builder()
            .max_size(self.max_size)
            .connection_timeout(self.timeout)
            .build(manager)
            .map_err(|e| StorageError::Connection(format!("Failed to create engine: {}", e)))
    }

    fn drop_engine(&self) {
        let removed = ENGINES
            .try_with(|engines| engines.borrow_mut().remove(&self.id).is_some())
            .unwrap_or(false);
        if removed {
            debug!(provider = self.id, "Dropped thread engine");
        }
    }
}

impl sealed::Sealed for PlainSessionProvider {}

impl SessionProvider for PlainSessionProvider {
    fn session(&self) -> StorageResult<Session> {
        let conn = self.engine()?.get()?;
        Ok(Session::new(conn, self.query.clone()))
    }

    fn mode(&self) -> SessionMode {
        SessionMode::Plain
    }

    fn health(&self) -> HealthStatus {
        let state = ENGINES
            .try_with(|engines| engines.borrow().get(&self.id).map(Pool::state))
            .ok()
            .flatten();
        let max = self.max_size as usize;
        match state {
            Some(state) => {
                let open = state.connections as usize;
                let idle = state.idle_connections as usize;
                HealthStatus::healthy(open - idle, idle, max)
            }
            None => HealthStatus::healthy(0, 0, max),
        }
    }

    /// Drops the calling thread's engine; other threads drop theirs on exit
    fn dispose(&self) {
        self.drop_engine();
    }
}

impl Drop for PlainSessionProvider {
    fn drop(&mut self) {
        self.drop_engine();
    }
}

/// Builds sessions in the mode chosen from configuration
#[derive(Clone)]
pub struct SessionFactory {
    provider: Arc<dyn SessionProvider>,
    encryption: Option<Arc<EncryptionManager>>,
}

impl fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFactory").field("mode", &self.provider.mode()).finish()
    }
}

impl SessionFactory {
    pub fn from_config(config: &Config) -> StorageResult<Self> {
        Self::with_key_manager(config, KeyManager::from_config(config))
    }

    /// Build with a preconfigured key manager (e.g. with cloud secret stores)
    #[instrument(skip_all, fields(path = %config.database.path))]
    pub fn with_key_manager(config: &Config, key_manager: KeyManager) -> StorageResult<Self> {
        let manager = EncryptionManager::new(config, key_manager);
        manager.initialize()?;

        if manager.is_encryption_enabled() {
            let pool =
                manager.create_pool(&config.database.path, PoolOptions::from(&config.pool))?;
            info!(mode = %SessionMode::Encrypted, "Session factory ready");
            return Ok(Self {
                provider: Arc::new(EncryptedSessionProvider::new(pool, config.query.clone())),
                encryption: Some(Arc::new(manager)),
            });
        }

        if config.encryption_mandatory() {
            return Err(StorageError::Encryption(
                "encryption is mandatory but not available".into(),
            ));
        }
        if config.encryption.use_sqlcipher {
            warn!("Database encryption unavailable, sessions will use plain SQLite");
        }
        info!(mode = %SessionMode::Plain, "Session factory ready");
        Ok(Self { provider: Arc::new(PlainSessionProvider::new(config)), encryption: None })
    }

    /// Factory over an explicit provider
    pub fn from_provider(provider: Arc<dyn SessionProvider>) -> Self {
        Self { provider, encryption: None }
    }

    pub fn session(&self) -> StorageResult<Session> {
        self.provider.session()
    }

    /// One session for one request, errors in caller-facing form
    pub fn get_db(&self) -> Result<Session, HideSyncError> {
        self.session().map_err(to_domain)
    }

    /// Run `f` with a fresh session that is closed afterwards
    ///
    /// Uncommitted work is rolled back on both success and error; commit
    /// inside `f` to keep it.
    pub fn with_session<T, F>(&self, f: F) -> Result<T, HideSyncError>
    where
        F: FnOnce(&mut Session) -> Result<T, HideSyncError>,
    {
        let mut session = self.get_db()?;
        let result = f(&mut session);
        if result.is_err() {
            if let Err(e) = session.rollback() {
                warn!(error = %e, "Rollback after failed request failed");
            }
        }
        session.close();
        result
    }

    pub fn mode(&self) -> SessionMode {
        self.provider.mode()
    }

    pub fn health(&self) -> HealthStatus {
        self.provider.health()
    }

    pub fn encryption(&self) -> Option<&EncryptionManager> {
        self.encryption.as_deref()
    }

    pub fn dispose(&self) {
        self.provider.dispose();
    }
}

/// One session from `factory`, the entry point for request handlers
pub fn get_db(factory: &SessionFactory) -> Result<Session, HideSyncError> {
    factory.get_db()
}
