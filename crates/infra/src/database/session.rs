//! Unit-of-work session over one connection
//!
//! A [`Session`] owns a single connection for its lifetime. Writes are staged
//! with [`add`](Session::add) and [`delete`](Session::delete) and reach the
//! database on [`flush`](Session::flush), which opens the transaction lazily.
//! [`commit`](Session::commit) flushes and commits; nested transactions map
//! onto SQLite savepoints.
//!
//! Dropping a session closes it: uncommitted work is rolled back and the
//! connection goes back to where it came from.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Deref;

use hidesync_common::storage::{StorageError, StorageResult};
use hidesync_domain::QueryConfig;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, trace, warn};

use super::model::{quote_ident, Entity, Persistable, Record, TableMeta};
use super::pool::PooledConnection;
use super::query::{read_batches, Query};
use super::value::Value;

/// The connection a session runs on
pub enum SessionConnection {
    /// Checked out of the encrypted pool
    Pooled(PooledConnection),
    /// Checked out of a per-thread plain engine
    Engine(r2d2::PooledConnection<SqliteConnectionManager>),
}

impl Deref for SessionConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match self {
            Self::Pooled(conn) => conn,
            Self::Engine(conn) => conn,
        }
    }
}

impl From<PooledConnection> for SessionConnection {
    fn from(conn: PooledConnection) -> Self {
        Self::Pooled(conn)
    }
}

impl From<r2d2::PooledConnection<SqliteConnectionManager>> for SessionConnection {
    fn from(conn: r2d2::PooledConnection<SqliteConnectionManager>) -> Self {
        Self::Engine(conn)
    }
}

/// Handle for an object staged with [`Session::add`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StagedKey(u64);

/// What a flush wrote
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    keys: HashMap<StagedKey, Value>,
}

impl FlushSummary {
    /// Primary key written for a staged object
    pub fn key_for(&self, staged: StagedKey) -> Option<&Value> {
        self.keys.get(&staged)
    }

    pub fn is_empty(&self) -> bool {
        self.inserted == 0 && self.updated == 0 && self.deleted == 0
    }
}

/// Statement and fetch counters for one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub statements: u64,
    pub flushes: u64,
    /// Cursor batches read by queries
    pub fetch_batches: u64,
    pub rows_fetched: u64,
}

/// Rows returned by a raw statement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultProxy {
    columns: Vec<String>,
    rows: VecDeque<Vec<Value>>,
}

impl ResultProxy {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows not yet fetched
    pub fn remaining(&self) -> usize {
        self.rows.len()
    }

    pub fn fetchone(&mut self) -> Option<Vec<Value>> {
        self.rows.pop_front()
    }

    pub fn fetchmany(&mut self, size: usize) -> Vec<Vec<Value>> {
        let take = size.min(self.rows.len());
        self.rows.drain(..take).collect()
    }

    pub fn fetchall(&mut self) -> Vec<Vec<Value>> {
        self.rows.drain(..).collect()
    }

    /// First row, discarding the rest
    pub fn first(mut self) -> Option<Vec<Value>> {
        self.rows.pop_front()
    }

    /// First column of the first row
    pub fn scalar(self) -> Option<Value> {
        self.first().and_then(|row| row.into_iter().next())
    }
}

enum PendingWrite {
    Upsert { staged: StagedKey, object: Box<dyn Persistable> },
    Delete { table: String, primary_key: String, key: Value },
}

enum WriteKind {
    Inserted,
    Updated,
}

/// Staged writes, transactions and queries over one connection
pub struct Session {
    conn: Option<SessionConnection>,
    query_config: QueryConfig,
    autoflush: bool,
    pending: Vec<PendingWrite>,
    next_staged: u64,
    in_transaction: bool,
    savepoints: Vec<String>,
    savepoint_seq: u64,
    /// Savepoint depth at which a flush failed; writes are refused until
    /// that level is rolled back
    failed_flush: Option<usize>,
    stats: SessionStats,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("active", &self.is_active())
            .field("pending", &self.pending.len())
            .field("in_transaction", &self.in_transaction)
            .field("savepoints", &self.savepoints)
            .field("failed_flush", &self.failed_flush)
            .field("stats", &self.stats)
            .finish()
    }
}

impl Session {
    pub fn new(conn: impl Into<SessionConnection>, query_config: QueryConfig) -> Self {
        Self {
            conn: Some(conn.into()),
            query_config,
            autoflush: true,
            pending: Vec::new(),
            next_staged: 0,
            in_transaction: false,
            savepoints: Vec::new(),
            savepoint_seq: 0,
            failed_flush: None,
            stats: SessionStats::default(),
        }
    }

    pub fn set_autoflush(&mut self, autoflush: bool) {
        self.autoflush = autoflush;
    }

    pub fn autoflush(&self) -> bool {
        self.autoflush
    }

    pub fn is_active(&self) -> bool {
        self.conn.is_some()
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Number of staged writes
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn query_config(&self) -> &QueryConfig {
        &self.query_config
    }

    /// Stage an object for insert or update
    pub fn add<T: Persistable + 'static>(&mut self, object: T) -> StagedKey {
        self.next_staged += 1;
        let staged = StagedKey(self.next_staged);
        trace!(table = object.table_name(), "Staged object");
        self.pending.push(PendingWrite::Upsert { staged, object: Box::new(object) });
        staged
    }

    pub fn add_all<T, I>(&mut self, objects: I) -> Vec<StagedKey>
    where
        T: Persistable + 'static,
        I: IntoIterator<Item = T>,
    {
        objects.into_iter().map(|object| self.add(object)).collect()
    }

    /// Stage a row delete
    ///
    /// The object must carry its primary key.
    pub fn delete<T: Persistable + ?Sized>(&mut self, object: &T) -> StorageResult<()> {
        let table = object.table_name().to_string();
        let key = object.primary_key().filter(|k| !k.is_null()).ok_or_else(|| {
            StorageError::Query(format!("cannot delete from {} without a primary key", table))
        })?;
        self.pending.push(PendingWrite::Delete {
            primary_key: object.primary_key_name().to_string(),
            table,
            key,
        });
        Ok(())
    }

    /// Drop every staged write without touching the database
    pub fn expunge_all(&mut self) {
        if !self.pending.is_empty() {
            debug!(discarded = self.pending.len(), "Expunging staged writes");
        }
        self.pending.clear();
    }

    /// Whether a failed flush is waiting for `rollback`/`rollback_nested`
    pub fn needs_rollback(&self) -> bool {
        self.failed_flush.is_some()
    }

    /// Write every staged object, in staging order
    ///
    /// A failed write leaves the session unusable for further writes until
    /// the enclosing transaction or savepoint is rolled back, so earlier
    /// writes of the same flush can never be committed on their own.
    pub fn flush(&mut self) -> StorageResult<FlushSummary> {
        self.ensure_writable()?;
        let mut summary = FlushSummary::default();
        if self.pending.is_empty() {
            return Ok(summary);
        }

        self.begin()?;
        let pending = std::mem::take(&mut self.pending);
        let staged = pending.len();
        for (index, write) in pending.into_iter().enumerate() {
            if let Err(e) = self.apply_write(write, &mut summary) {
                self.failed_flush = Some(self.savepoints.len());
                warn!(
                    error = %e,
                    failed_at = index,
                    discarded = staged - index - 1,
                    "Flush failed, session must be rolled back"
                );
                return Err(e);
            }
        }

        self.stats.flushes += 1;
        debug!(
            inserted = summary.inserted,
            updated = summary.updated,
            deleted = summary.deleted,
            "Session flushed"
        );
        Ok(summary)
    }

    /// Write one object now and store its key back on it
    pub fn persist<T: Persistable>(&mut self, object: &mut T) -> StorageResult<Value> {
        self.flush()?;
        self.begin()?;
        let (key, _) = self.write_object(object)?;
        Ok(key)
    }

    /// Upsert an object now and hand it back with its key set
    pub fn merge<T: Persistable>(&mut self, mut object: T) -> StorageResult<T> {
        self.persist(&mut object)?;
        Ok(object)
    }

    /// Flush, then commit the open transaction
    ///
    /// Refused after a failed flush until `rollback` is called.
    pub fn commit(&mut self) -> StorageResult<FlushSummary> {
        let summary = self.flush()?;
        if self.in_transaction {
            self.connection()?.execute_batch("COMMIT")?;
            self.in_transaction = false;
            self.savepoints.clear();
            debug!("Transaction committed");
        }
        Ok(summary)
    }

    /// Discard staged writes and roll back the open transaction
    pub fn rollback(&mut self) -> StorageResult<()> {
        self.pending.clear();
        self.failed_flush = None;
        if self.in_transaction {
            self.in_transaction = false;
            self.savepoints.clear();
            let conn = self.connection()?;
            // SQLite ends the transaction itself on some errors (disk full, I/O)
            if !conn.is_autocommit() {
                conn.execute_batch("ROLLBACK")?;
            }
            debug!("Transaction rolled back");
        }
        Ok(())
    }

    /// Flush, then open a savepoint
    pub fn begin_nested(&mut self) -> StorageResult<()> {
        self.flush()?;
        self.begin()?;
        self.savepoint_seq += 1;
        let name = format!("sp_{}", self.savepoint_seq);
        self.connection()?.execute_batch(&format!("SAVEPOINT {}", name))?;
        debug!(savepoint = %name, depth = self.savepoints.len() + 1, "Savepoint opened");
        self.savepoints.push(name);
        Ok(())
    }

    /// Flush, then release the innermost savepoint
    pub fn commit_nested(&mut self) -> StorageResult<()> {
        self.flush()?;
        let name = self.pop_savepoint()?;
        self.connection()?.execute_batch(&format!("RELEASE SAVEPOINT {}", name))?;
        debug!(savepoint = %name, "Savepoint released");
        Ok(())
    }

    /// Discard staged writes and roll back to the innermost savepoint
    pub fn rollback_nested(&mut self) -> StorageResult<()> {
        self.pending.clear();
        let name = self.pop_savepoint()?;
        if self.failed_flush.is_some_and(|depth| depth > self.savepoints.len()) {
            self.failed_flush = None;
        }
        self.connection()?
            .execute_batch(&format!("ROLLBACK TO SAVEPOINT {0}; RELEASE SAVEPOINT {0};", name))?;
        debug!(savepoint = %name, "Rolled back to savepoint");
        Ok(())
    }

    /// Run `f` in the session transaction: commit on `Ok`, roll back on `Err`
    pub fn transaction<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Self) -> Result<T, E>,
        E: From<StorageError>,
    {
        self.begin()?;
        let result = f(self).and_then(|value| self.commit().map(|_| value).map_err(E::from));
        if result.is_err() {
            if let Err(rollback) = self.rollback() {
                warn!(error = %rollback, "Rollback after failed transaction also failed");
            }
        }
        result
    }

    /// Run `f` inside a savepoint: release on `Ok`, roll back to it on `Err`
    pub fn nested<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Self) -> Result<T, E>,
        E: From<StorageError>,
    {
        self.begin_nested()?;
        let depth = self.savepoints.len();
        let result = f(self).and_then(|value| self.commit_nested().map(|()| value).map_err(E::from));
        if result.is_err() && self.savepoints.len() == depth {
            if let Err(rollback) = self.rollback_nested() {
                warn!(error = %rollback, "Savepoint rollback failed");
            }
        }
        result
    }

    /// Load an entity by primary key
    pub fn get<T: Entity>(&mut self, key: impl Into<Value>) -> StorageResult<Option<T>> {
        let meta = T::schema().meta();
        self.fetch_by_key(&meta, key.into())?.map(T::from_record).transpose()
    }

    /// Load a plain row by its `id` column
    pub fn get_record(&mut self, table: &str, key: impl Into<Value>) -> StorageResult<Option<Record>> {
        self.fetch_by_key(&TableMeta::untyped(table, "id"), key.into())
    }

    /// Reload an entity from the database
    pub fn refresh<T: Entity>(&mut self, object: &mut T) -> StorageResult<()> {
        let table = object.table_name().to_string();
        let key = object.primary_key().ok_or_else(|| {
            StorageError::Query(format!("cannot refresh {} without a primary key", table))
        })?;
        *object = self
            .get::<T>(key.clone())?
            .ok_or_else(|| StorageError::NoResultFound(format!("{} with key {}", table, key)))?;
        Ok(())
    }

    /// Reload a plain row from the database
    pub fn refresh_record(&mut self, record: &mut Record) -> StorageResult<()> {
        let meta = TableMeta::untyped(record.table_name(), record.primary_key_name());
        let key = record.primary_key().ok_or_else(|| {
            StorageError::Query(format!("cannot refresh {} without a primary key", meta.table))
        })?;
        let fresh = self.fetch_by_key(&meta, key.clone())?.ok_or_else(|| {
            StorageError::NoResultFound(format!("{} with key {}", meta.table, key))
        })?;
        *record = fresh;
        Ok(())
    }

    pub fn query<T: Entity>(&mut self) -> Query<'_, T> {
        let meta = T::schema().meta();
        Query::new(self, meta)
    }

    /// Query a table as plain records, without column types
    pub fn query_table(&mut self, table: &str) -> Query<'_, Record> {
        Query::new(self, TableMeta::untyped(table, "id"))
    }

    /// Execute a raw statement inside the session transaction
    pub fn execute(&mut self, sql: &str, params: &[Value]) -> StorageResult<usize> {
        self.ensure_writable()?;
        self.flush_if_autoflush()?;
        self.begin()?;
        self.run(sql, params)
    }

    /// Run a raw query and buffer its rows
    pub fn execute_query(&mut self, sql: &str, params: &[Value]) -> StorageResult<ResultProxy> {
        self.flush_if_autoflush()?;
        let proxy = {
            let conn = self.connection()?;
            let mut stmt = conn.prepare(sql)?;
            let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            let width = columns.len();
            let mut rows = stmt.query(params_from_iter(params.iter()))?;
            let mut buffered = VecDeque::new();
            while let Some(row) = rows.next()? {
                let mut values = Vec::with_capacity(width);
                for i in 0..width {
                    values.push(Value::from_column(row.get_ref(i)?, None));
                }
                buffered.push_back(values);
            }
            ResultProxy { columns, rows: buffered }
        };
        self.stats.statements += 1;
        self.stats.rows_fetched += proxy.remaining() as u64;
        Ok(proxy)
    }

    /// Roll back uncommitted work and give the connection back
    pub fn close(&mut self) {
        if self.conn.is_none() {
            return;
        }
        if !self.pending.is_empty() {
            warn!(discarded = self.pending.len(), "Session closed with unflushed writes");
        }
        if self.in_transaction {
            warn!("Session closed inside a transaction, rolling back");
            if let Err(e) = self.rollback() {
                warn!(error = %e, "Rollback on close failed");
            }
        }
        self.pending.clear();
        self.failed_flush = None;
        self.conn = None;
        debug!(statements = self.stats.statements, "Session closed");
    }

    pub(crate) fn connection(&self) -> StorageResult<&Connection> {
        self.conn
            .as_deref()
            .ok_or_else(|| StorageError::TransactionState("session is closed".into()))
    }

    pub(crate) fn flush_if_autoflush(&mut self) -> StorageResult<()> {
        if self.autoflush && !self.pending.is_empty() {
            self.flush()?;
        }
        Ok(())
    }

    /// Open the session transaction if none is open
    pub(crate) fn begin(&mut self) -> StorageResult<()> {
        if !self.in_transaction {
            self.connection()?.execute_batch("BEGIN")?;
            self.in_transaction = true;
            trace!("Transaction started");
        }
        Ok(())
    }

    /// Execute one statement and count it
    pub(crate) fn run(&mut self, sql: &str, params: &[Value]) -> StorageResult<usize> {
        trace!(sql, "Executing statement");
        let changed = self.connection()?.execute(sql, params_from_iter(params.iter()))?;
        self.stats.statements += 1;
        Ok(changed)
    }

    pub(crate) fn scalar_i64(&mut self, sql: &str, params: &[Value]) -> StorageResult<i64> {
        trace!(sql, "Executing scalar query");
        let value =
            self.connection()?.query_row(sql, params_from_iter(params.iter()), |row| row.get(0))?;
        self.stats.statements += 1;
        Ok(value)
    }

    /// Run a select and read at most `limit` rows in cursor batches
    pub(crate) fn fetch_records(
        &mut self,
        meta: &TableMeta,
        sql: &str,
        params: &[Value],
        limit: usize,
    ) -> StorageResult<Vec<Record>> {
        let batch_size = self.query_config.batch_size.max(1);
        let (records, batches) = read_batches(self.connection()?, meta, sql, params, limit, batch_size)?;
        self.stats.statements += 1;
        self.stats.fetch_batches += batches;
        self.stats.rows_fetched += records.len() as u64;
        Ok(records)
    }

    fn fetch_by_key(&mut self, meta: &TableMeta, key: Value) -> StorageResult<Option<Record>> {
        self.flush_if_autoflush()?;
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ? LIMIT 1",
            quote_ident(&meta.table),
            quote_ident(&meta.primary_key)
        );
        Ok(self.fetch_records(meta, &sql, &[key], 1)?.into_iter().next())
    }

    pub(crate) fn ensure_writable(&self) -> StorageResult<()> {
        match self.failed_flush {
            None => Ok(()),
            Some(0) => Err(StorageError::TransactionState(
                "a previous flush failed; call rollback() before writing again".into(),
            )),
            Some(depth) => Err(StorageError::TransactionState(format!(
                "a previous flush failed in savepoint level {}; call rollback_nested() first",
                depth
            ))),
        }
    }

    fn apply_write(&mut self, write: PendingWrite, summary: &mut FlushSummary) -> StorageResult<()> {
        match write {
            PendingWrite::Upsert { staged, mut object } => {
                let (key, kind) = self.write_object(object.as_mut())?;
                match kind {
                    WriteKind::Inserted => summary.inserted += 1,
                    WriteKind::Updated => summary.updated += 1,
                }
                summary.keys.insert(staged, key);
            }
            PendingWrite::Delete { table, primary_key, key } => {
                let sql =
                    format!("DELETE FROM {} WHERE {} = ?", quote_ident(&table), quote_ident(&primary_key));
                summary.deleted += self.run(&sql, &[key])?;
            }
        }
        Ok(())
    }

    fn pop_savepoint(&mut self) -> StorageResult<String> {
        self.savepoints
            .pop()
            .ok_or_else(|| StorageError::TransactionState("no nested transaction is open".into()))
    }

    fn write_object(&mut self, object: &mut dyn Persistable) -> StorageResult<(Value, WriteKind)> {
        let table = quote_ident(object.table_name());
        let pk_name = object.primary_key_name().to_string();
        let pk = quote_ident(&pk_name);
        let mut values = object.to_values();
        values.retain(|(column, _)| *column != pk_name);

        if let Some(key) = object.primary_key().filter(|k| !k.is_null()) {
            let probe = format!("SELECT 1 FROM {} WHERE {} = ? LIMIT 1", table, pk);
            let exists = self
                .connection()?
                .query_row(&probe, params_from_iter(std::iter::once(&key)), |_| Ok(()))
                .optional()?
                .is_some();
            self.stats.statements += 1;

            if exists {
                if !values.is_empty() {
                    let assignments = values
                        .iter()
                        .map(|(column, _)| format!("{} = ?", quote_ident(column)))
                        .collect::<Vec<_>>()
                        .join(", ");
                    let sql = format!("UPDATE {} SET {} WHERE {} = ?", table, assignments, pk);
                    let mut params: Vec<Value> = values.into_iter().map(|(_, v)| v).collect();
                    params.push(key.clone());
                    self.run(&sql, &params)?;
                }
                return Ok((key, WriteKind::Updated));
            }

            values.insert(0, (pk_name, key.clone()));
            self.insert_row(&table, values)?;
            return Ok((key, WriteKind::Inserted));
        }

        self.insert_row(&table, values)?;
        let key = Value::Integer(self.connection()?.last_insert_rowid());
        object.set_primary_key(key.clone());
        Ok((key, WriteKind::Inserted))
    }

    fn insert_row(&mut self, table: &str, values: Vec<(String, Value)>) -> StorageResult<()> {
        if values.is_empty() {
            self.run(&format!("INSERT INTO {} DEFAULT VALUES", table), &[])?;
            return Ok(());
        }

        let columns = values.iter().map(|(c, _)| quote_ident(c)).collect::<Vec<_>>().join(", ");
        let placeholders = vec!["?"; values.len()].join(", ");
        let sql = format!("INSERT INTO {} ({}) VALUES ({})", table, columns, placeholders);
        let params: Vec<Value> = values.into_iter().map(|(_, v)| v).collect();
        self.run(&sql, &params)?;
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
