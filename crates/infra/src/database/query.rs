//! Query builder bound to a session
//!
//! [`Query`] accumulates filters, joins, ordering and paging, then renders
//! `SELECT`, `COUNT`, `EXISTS`, `UPDATE` or `DELETE` SQL when a terminal
//! method runs. Rows are read from the cursor in batches of
//! `QueryConfig::batch_size`; `all()` without a limit is capped at
//! `QueryConfig::default_limit`.

use std::marker::PhantomData;

use hidesync_common::storage::{StorageError, StorageResult};
use rusqlite::{params_from_iter, Connection};
use tracing::{trace, warn};

use super::filter::Filter;
use super::model::{quote_ident, Queryable, Record, TableMeta};
use super::session::Session;
use super::value::Value;

#[derive(Debug, Clone)]
struct Join {
    table: String,
    on: String,
}

/// A query over one table, bound to a session
pub struct Query<'s, T> {
    session: &'s mut Session,
    meta: TableMeta,
    filters: Vec<Filter>,
    joins: Vec<Join>,
    order_by: Vec<(String, bool)>,
    limit: Option<usize>,
    offset: Option<usize>,
    _entity: PhantomData<fn() -> T>,
}

impl<'s, T: Queryable> Query<'s, T> {
    pub(crate) fn new(session: &'s mut Session, meta: TableMeta) -> Self {
        Self {
            session,
            meta,
            filters: Vec::new(),
            joins: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            _entity: PhantomData,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Equality filter
    pub fn filter_by(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::eq(column, value))
    }

    /// Filter from a `column <op> literal` expression
    pub fn filter_expr(self, expr: &str) -> Self {
        self.filter(Filter::parse(expr))
    }

    /// Inner join; `on` is raw SQL
    pub fn join(mut self, table: &str, on: &str) -> Self {
        self.joins.push(Join { table: table.to_string(), on: on.to_string() });
        self
    }

    pub fn order_by(mut self, column: &str) -> Self {
        self.order_by.push((column.to_string(), false));
        self
    }

    pub fn order_by_desc(mut self, column: &str) -> Self {
        self.order_by.push((column.to_string(), true));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Every matching row, at most `default_limit` when no limit is set
    pub fn all(&mut self) -> StorageResult<Vec<T>> {
        let limit = match self.limit {
            Some(limit) => limit,
            None => {
                let cap = self.session.query_config().default_limit;
                warn!(
                    table = %self.meta.table,
                    default_limit = cap,
                    "Query without a limit, applying the default row cap"
                );
                cap
            }
        };
        self.fetch(limit)
    }

    pub fn first(&mut self) -> StorageResult<Option<T>> {
        Ok(self.fetch(1)?.into_iter().next())
    }

    /// Exactly one row
    pub fn one(&mut self) -> StorageResult<T> {
        self.one_or_none()?.ok_or_else(|| StorageError::NoResultFound(self.meta.table.clone()))
    }

    /// Zero or one row; more than one is an error
    pub fn one_or_none(&mut self) -> StorageResult<Option<T>> {
        let mut rows = self.fetch(2)?;
        if rows.len() > 1 {
            return Err(StorageError::MultipleResultsFound(self.meta.table.clone()));
        }
        Ok(rows.pop())
    }

    /// Row with the given primary key, ignoring the other filters
    pub fn get(&mut self, key: impl Into<Value>) -> StorageResult<Option<T>> {
        self.session.flush_if_autoflush()?;
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ? LIMIT 1",
            quote_ident(&self.meta.table),
            quote_ident(&self.meta.primary_key)
        );
        let records = self.session.fetch_records(&self.meta, &sql, &[key.into()], 1)?;
        records.into_iter().next().map(T::from_record).transpose()
    }

    pub fn count(&mut self) -> StorageResult<u64> {
        self.session.flush_if_autoflush()?;
        let mut params = Vec::new();
        let mut inner = self.select_sql("1", &mut params);
        if self.limit.is_some() || self.offset.is_some() {
            inner.push_str(&self.paging_sql(self.limit));
        }
        let count = self.session.scalar_i64(&format!("SELECT count(*) FROM ({})", inner), &params)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    pub fn exists(&mut self) -> StorageResult<bool> {
        self.session.flush_if_autoflush()?;
        let mut params = Vec::new();
        let inner = self.select_sql("1", &mut params);
        Ok(self.session.scalar_i64(&format!("SELECT EXISTS ({})", inner), &params)? != 0)
    }

    /// Delete every matching row, returns the number deleted
    pub fn delete(&mut self) -> StorageResult<usize> {
        self.reject_joins("delete")?;
        self.session.ensure_writable()?;
        self.session.flush_if_autoflush()?;
        let mut params = Vec::new();
        let sql = format!(
            "DELETE FROM {}{}",
            quote_ident(&self.meta.table),
            self.where_sql(&mut params)
        );
        self.session.begin()?;
        self.session.run(&sql, &params)
    }

    /// Set columns on every matching row, returns the number updated
    pub fn update(&mut self, values: &[(&str, Value)]) -> StorageResult<usize> {
        self.reject_joins("update")?;
        if values.is_empty() {
            return Ok(0);
        }
        self.session.ensure_writable()?;
        self.session.flush_if_autoflush()?;

        let mut params: Vec<Value> = values.iter().map(|(_, v)| v.clone()).collect();
        let assignments = values
            .iter()
            .map(|(column, _)| format!("{} = ?", quote_ident(column)))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {}{}",
            quote_ident(&self.meta.table),
            assignments,
            self.where_sql(&mut params)
        );
        self.session.begin()?;
        self.session.run(&sql, &params)
    }

    fn fetch(&mut self, limit: usize) -> StorageResult<Vec<T>> {
        self.session.flush_if_autoflush()?;
        let mut params = Vec::new();
        let columns = format!("{}.*", quote_ident(&self.meta.table));
        let mut sql = self.select_sql(&columns, &mut params);
        sql.push_str(&self.paging_sql(Some(limit)));

        let records = self.session.fetch_records(&self.meta, &sql, &params, limit)?;
        records.into_iter().map(T::from_record).collect()
    }

    fn select_sql(&self, columns: &str, params: &mut Vec<Value>) -> String {
        let mut sql = format!("SELECT {} FROM {}", columns, quote_ident(&self.meta.table));
        for join in &self.joins {
            sql.push_str(&format!(" JOIN {} ON {}", quote_ident(&join.table), join.on));
        }
        sql.push_str(&self.where_sql(params));
        if !self.order_by.is_empty() {
            let order = self
                .order_by
                .iter()
                .map(|(column, desc)| {
                    format!("{}{}", quote_ident(column), if *desc { " DESC" } else { "" })
                })
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(" ORDER BY ");
            sql.push_str(&order);
        }
        sql
    }

    fn where_sql(&self, params: &mut Vec<Value>) -> String {
        if self.filters.is_empty() {
            return String::new();
        }
        let clauses = self.filters.iter().map(|f| f.to_sql(params)).collect::<Vec<_>>();
        format!(" WHERE {}", clauses.join(" AND "))
    }

    fn paging_sql(&self, limit: Option<usize>) -> String {
        let limit = limit.map_or_else(|| "-1".to_string(), |l| l.to_string());
        match self.offset {
            Some(offset) => format!(" LIMIT {} OFFSET {}", limit, offset),
            None => format!(" LIMIT {}", limit),
        }
    }

    fn reject_joins(&self, operation: &str) -> StorageResult<()> {
        if self.joins.is_empty() {
            Ok(())
        } else {
            Err(StorageError::Query(format!("bulk {} does not support joins", operation)))
        }
    }
}

/// Read up to `limit` rows in batches of `batch_size`
///
/// Returns the rows and the number of batches read. Stops early on a short
/// batch.
pub(crate) fn read_batches(
    conn: &Connection,
    meta: &TableMeta,
    sql: &str,
    params: &[Value],
    limit: usize,
    batch_size: usize,
) -> StorageResult<(Vec<Record>, u64)> {
    trace!(sql, limit, batch_size, "Running query");
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(params_from_iter(params.iter()))?;

    let mut records = Vec::new();
    let mut batches = 0;
    loop {
        let want = batch_size.min(limit - records.len());
        if want == 0 {
            break;
        }

        let mut got = 0;
        while got < want {
            let Some(row) = rows.next()? else { break };
            let mut record =
                Record::new(meta.table.clone()).with_primary_key_name(meta.primary_key.clone());
            for (i, column) in columns.iter().enumerate() {
                record.set(column.clone(), Value::from_column(row.get_ref(i)?, meta.column_type(column)));
            }
            records.push(record);
            got += 1;
        }
        batches += 1;
        trace!(batch = batches, rows = got, "Fetched batch");

        if got < want {
            break;
        }
    }

    Ok((records, batches))
}
