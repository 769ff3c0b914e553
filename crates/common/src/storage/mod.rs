//! Storage primitives for encrypted SQLite databases
//!
//! Generic building blocks shared by the pool and session layers: the error
//! taxonomy, atomic pool counters, health/metrics snapshots and the SQLCipher
//! PRAGMA helpers.

pub mod error;
pub mod metrics;
pub mod sqlcipher;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use metrics::StorageMetrics;
pub use sqlcipher::{
    apply_connection_pragmas, configure_sqlcipher, rekey, sqlcipher_version, verify_encryption,
    ConnectionPragmas, HmacAlgorithm, KdfAlgorithm, SqlCipherConfig,
};
pub use types::{HealthStatus, PoolMetrics};
