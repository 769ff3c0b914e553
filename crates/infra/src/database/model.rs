//! Entity contracts and table schemas
//!
//! [`Persistable`] is what the session needs to write an object: its table,
//! its primary key and its column values. [`Queryable`] builds an object
//! back from a [`Record`]. Types with a fixed table implement [`Entity`] to
//! give queries their column types.

use std::collections::HashMap;
use std::fmt::Write as _;

use hidesync_common::storage::{StorageError, StorageResult};

use super::value::{ColumnType, Value};

/// An object the session can insert, update or delete
pub trait Persistable {
    fn table_name(&self) -> &str;

    fn primary_key_name(&self) -> &str {
        "id"
    }

    /// Current primary key, `None` (or `Some(Value::Null)`) before insert
    fn primary_key(&self) -> Option<Value>;

    /// Called with the generated row id after an insert
    fn set_primary_key(&mut self, key: Value);

    /// Every non-key column with its value
    fn to_values(&self) -> Vec<(String, Value)>;
}

/// An object that can be built from a fetched row
pub trait Queryable: Sized {
    fn from_record(record: Record) -> StorageResult<Self>;
}

/// A persistable type bound to one table
pub trait Entity: Persistable + Queryable {
    fn schema() -> TableSchema;
}

/// Table name, key column and known column types for a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMeta {
    pub table: String,
    pub primary_key: String,
    pub column_types: HashMap<String, ColumnType>,
}

impl TableMeta {
    /// Metadata without column types; reads fall back to sniffing
    pub fn untyped(table: impl Into<String>, primary_key: impl Into<String>) -> Self {
        Self { table: table.into(), primary_key: primary_key.into(), column_types: HashMap::new() }
    }

    pub fn column_type(&self, column: &str) -> Option<ColumnType> {
        self.column_types.get(column).copied()
    }
}

/// A plain row: table name, key column and ordered column values
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    table: String,
    primary_key_name: String,
    values: Vec<(String, Value)>,
}

impl Record {
    pub fn new(table: impl Into<String>) -> Self {
        Self { table: table.into(), primary_key_name: "id".to_string(), values: Vec::new() }
    }

    pub fn with_primary_key_name(mut self, name: impl Into<String>) -> Self {
        self.primary_key_name = name.into();
        self
    }

    /// Builder form of [`set`](Self::set)
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(column, value);
        self
    }

    /// Set a column, replacing an existing value in place
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        let column = column.into();
        let value = value.into();
        match self.values.iter_mut().find(|(name, _)| *name == column) {
            Some((_, slot)) => *slot = value,
            None => self.values.push((column, value)),
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.iter().find(|(name, _)| name == column).map(|(_, value)| value)
    }

    /// Column value, or `Value::Null` when absent
    pub fn value(&self, column: &str) -> Value {
        self.get(column).cloned().unwrap_or(Value::Null)
    }

    /// Column value, or `NoResultFound` naming the column
    pub fn require(&self, column: &str) -> StorageResult<&Value> {
        self.get(column).ok_or_else(|| {
            StorageError::NoResultFound(format!("column '{}' in {}", column, self.table))
        })
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_values(self) -> Vec<(String, Value)> {
        self.values
    }
}

impl Persistable for Record {
    fn table_name(&self) -> &str {
        &self.table
    }

    fn primary_key_name(&self) -> &str {
        &self.primary_key_name
    }

    fn primary_key(&self) -> Option<Value> {
        self.get(&self.primary_key_name).filter(|v| !v.is_null()).cloned()
    }

    fn set_primary_key(&mut self, key: Value) {
        let name = self.primary_key_name.clone();
        self.set(name, key);
    }

    fn to_values(&self) -> Vec<(String, Value)> {
        self.values.iter().filter(|(name, _)| *name != self.primary_key_name).cloned().collect()
    }
}

impl Queryable for Record {
    fn from_record(record: Record) -> StorageResult<Self> {
        Ok(record)
    }
}

/// One column of a [`TableSchema`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub primary_key: bool,
    pub autoincrement: bool,
    pub nullable: bool,
    pub unique: bool,
    pub default_sql: Option<String>,
    pub references: Option<(String, String)>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            primary_key: false,
            autoincrement: false,
            nullable: true,
            unique: false,
            default_sql: None,
            references: None,
        }
    }

    /// `INTEGER PRIMARY KEY AUTOINCREMENT` column
    pub fn id(name: impl Into<String>) -> Self {
        Self { primary_key: true, autoincrement: true, nullable: false, ..Self::new(name, ColumnType::Integer) }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Raw SQL default expression, e.g. `CURRENT_TIMESTAMP`
    pub fn default_sql(mut self, expr: impl Into<String>) -> Self {
        self.default_sql = Some(expr.into());
        self
    }

    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.references = Some((table.into(), column.into()));
        self
    }

    fn ddl(&self) -> String {
        let mut sql = format!("{} {}", quote_ident(&self.name), self.column_type.sql_type());
        if self.primary_key {
            sql.push_str(" PRIMARY KEY");
            if self.autoincrement {
                sql.push_str(" AUTOINCREMENT");
            }
        } else if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        if self.unique {
            sql.push_str(" UNIQUE");
        }
        if let Some(default) = &self.default_sql {
            let _ = write!(sql, " DEFAULT {}", default);
        }
        if let Some((table, column)) = &self.references {
            let _ = write!(sql, " REFERENCES {} ({})", quote_ident(table), quote_ident(column));
        }
        sql
    }
}

/// Table definition used for DDL and typed reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), columns: Vec::new() }
    }

    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    /// Name of the primary key column, `id` when none is marked
    pub fn primary_key(&self) -> &str {
        self.columns.iter().find(|c| c.primary_key).map(|c| c.name.as_str()).unwrap_or("id")
    }

    pub fn meta(&self) -> TableMeta {
        TableMeta {
            table: self.name.clone(),
            primary_key: self.primary_key().to_string(),
            column_types: self.columns.iter().map(|c| (c.name.clone(), c.column_type)).collect(),
        }
    }

    /// `CREATE TABLE IF NOT EXISTS` statement
    pub fn create_sql(&self) -> String {
        let columns = self.columns.iter().map(ColumnDef::ddl).collect::<Vec<_>>().join(", ");
        format!("CREATE TABLE IF NOT EXISTS {} ({})", quote_ident(&self.name), columns)
    }
}

/// Quote an identifier, splitting `table.column` into its parts
pub fn quote_ident(ident: &str) -> String {
    ident
        .split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    //! Unit tests for database::model.
    use super::*;

    fn materials() -> TableSchema {
        TableSchema::new("materials")
            .column(ColumnDef::id("id"))
            .column(ColumnDef::new("name", ColumnType::Text).not_null())
            .column(ColumnDef::new("sku", ColumnType::Text).unique())
            .column(ColumnDef::new("in_stock", ColumnType::Boolean).default_sql("1"))
            .column(ColumnDef::new("supplier_id", ColumnType::Integer).references("suppliers", "id"))
    }

    #[test]
    fn test_create_sql() {
        assert_eq!(
            materials().create_sql(),
            "CREATE TABLE IF NOT EXISTS \"materials\" (\"id\" INTEGER PRIMARY KEY AUTOINCREMENT, \
             \"name\" TEXT NOT NULL, \"sku\" TEXT UNIQUE, \"in_stock\" BOOLEAN DEFAULT 1, \
             \"supplier_id\" INTEGER REFERENCES \"suppliers\" (\"id\"))"
        );
    }

    #[test]
    fn test_meta() {
        let meta = materials().meta();
        assert_eq!(meta.primary_key, "id");
        assert_eq!(meta.column_type("in_stock"), Some(ColumnType::Boolean));
        assert_eq!(meta.column_type("missing"), None);
    }

    #[test]
    fn test_record_persistable() {
        let mut record = Record::new("materials").with("name", "Veg tan").with("thickness", 2.5);
        assert_eq!(record.primary_key(), None);
        assert_eq!(record.to_values().len(), 2);

        record.set_primary_key(Value::Integer(7));
        assert_eq!(record.primary_key(), Some(Value::Integer(7)));
        assert_eq!(record.to_values().len(), 2);

        record.set("name", "Chrome tan");
        assert_eq!(record.value("name"), Value::Text("Chrome tan".into()));
        assert_eq!(record.len(), 3);
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("materials.id"), "\"materials\".\"id\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
