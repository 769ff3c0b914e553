//! # HideSync Infrastructure
//!
//! The encrypted SQLite storage core used by every HideSync service.
//!
//! This crate contains:
//! - Key resolution (key file, environment, platform keychain, cloud secret
//!   stores)
//! - The SQLCipher encryption manager and a hand-built connection pool with
//!   recycling, a health thread and a circuit breaker
//! - A small session/query layer that stages entities and turns them into
//!   SQL against a pooled connection
//! - The session factory callers depend on
//!
//! ## Architecture
//! - Generic primitives (errors, circuit breaker, SQLCipher PRAGMAs) live in
//!   `hidesync-common`
//! - Configuration types and the caller-facing error live in
//!   `hidesync-domain`
//! - Everything that touches files, the keychain or the database is here

pub mod config;
pub mod database;
pub mod errors;
pub mod observability;
pub mod security;

// Re-export commonly used items
pub use database::{
    get_db, ColumnDef, ColumnType, DatabaseReport, EncryptionManager, EnhancedConnectionPool,
    Entity, Filter, FlushSummary, Persistable, PoolOptions, PoolStatus, PooledConnection, Query,
    Queryable, Record, ResultProxy, Session, SessionFactory, SessionMode, SessionProvider,
    TableSchema, Value,
};
pub use errors::InfraError;
pub use security::{KeyManager, SecretStore};
