//! Encrypted database access
//!
//! Layering, bottom up: [`pool`] hands out encrypted connections,
//! [`session`] and [`query`] turn staged objects and filters into SQL over
//! one connection, and [`factory`] picks encrypted or plain mode and hands
//! out sessions.

pub mod diagnostics;
pub mod encryption;
pub mod factory;
pub mod filter;
pub mod model;
pub mod pool;
pub mod query;
pub mod session;
pub mod value;

pub use diagnostics::{check_database, encrypt_plain_database, rekey_database, DatabaseReport};
pub use encryption::EncryptionManager;
pub use factory::{
    get_db, EncryptedSessionProvider, PlainSessionProvider, SessionFactory, SessionMode,
    SessionProvider,
};
pub use filter::{Filter, Operator};
pub use model::{quote_ident, ColumnDef, Entity, Persistable, Queryable, Record, TableMeta, TableSchema};
pub use pool::{
    connection_pragmas, ConnectionFactory, EncryptedConnectionFactory, EnhancedConnectionPool,
    PlainConnectionFactory, PoolOptions, PoolStatus, PooledConnection, SlotId,
};
pub use query::Query;
pub use session::{
    FlushSummary, ResultProxy, Session, SessionConnection, SessionStats, StagedKey,
};
pub use value::{ColumnType, Value};
