//! Column values and their SQLite storage form
//!
//! Writes: booleans become 0/1, datetimes and dates ISO-8601 text, JSON
//! documents their serialized text. Reads use the declared [`ColumnType`]
//! when one is known and fall back to sniffing the stored text otherwise.
//! Sniffing can misread plain text that happens to look like JSON or a
//! timestamp, so typed schemas should be preferred for such columns.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue, ValueRef};
use tracing::warn;

use super::model::Persistable;

/// Storage format for datetimes
pub const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";
/// Storage format for dates
pub const DATE_FORMAT: &str = "%Y-%m-%d";

static ISO_DATETIME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(\.\d+)?(Z|[+-]\d{2}:?\d{2})?$")
        .expect("ISO_DATETIME should compile - this is a bug")
});

static ISO_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("ISO_DATE should compile - this is a bug")
});

/// Declared type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Blob,
    Boolean,
    DateTime,
    Date,
    Json,
}

impl ColumnType {
    /// Type name used in `CREATE TABLE`
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Text => "TEXT",
            Self::Blob => "BLOB",
            Self::Boolean => "BOOLEAN",
            Self::DateTime => "DATETIME",
            Self::Date => "DATE",
            Self::Json => "JSON",
        }
    }
}

/// A single column value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Bool(bool),
    DateTime(NaiveDateTime),
    Date(NaiveDate),
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Real(f) => Some(*f),
            Self::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Integer(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            Self::DateTime(dt) => Some(*dt),
            Self::Date(d) => d.and_hms_opt(0, 0, 0),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(d) => Some(*d),
            Self::DateTime(dt) => Some(dt.date()),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(j) => Some(j),
            _ => None,
        }
    }

    /// Foreign-key shorthand: the referenced entity's primary key
    pub fn reference(entity: &dyn Persistable) -> Self {
        entity.primary_key().unwrap_or(Self::Null)
    }

    /// Convert a raw column read back into a value
    pub fn from_column(raw: ValueRef<'_>, column_type: Option<ColumnType>) -> Self {
        match column_type {
            Some(ty) => Self::from_typed(raw, ty),
            None => Self::sniff(raw),
        }
    }

    fn from_typed(raw: ValueRef<'_>, ty: ColumnType) -> Self {
        let untyped = Self::from_raw(raw);
        match (ty, untyped) {
            (_, Self::Null) => Self::Null,
            (ColumnType::Boolean, Self::Integer(i)) => Self::Bool(i != 0),
            (ColumnType::Boolean, Self::Real(f)) => Self::Bool(f != 0.0),
            (ColumnType::Boolean, Self::Text(s)) => {
                match s.trim().to_ascii_lowercase().as_str() {
                    "1" | "true" | "t" | "yes" => Self::Bool(true),
                    "0" | "false" | "f" | "no" => Self::Bool(false),
                    _ => Self::Text(s),
                }
            }
            (ColumnType::Integer, Self::Text(s)) => {
                s.trim().parse().map(Self::Integer).unwrap_or(Self::Text(s))
            }
            (ColumnType::Real, Self::Integer(i)) => Self::Real(i as f64),
            (ColumnType::Real, Self::Text(s)) => {
                s.trim().parse().map(Self::Real).unwrap_or(Self::Text(s))
            }
            (ColumnType::DateTime, Self::Text(s)) => match parse_datetime(&s) {
                Some(dt) => Self::DateTime(dt),
                None => {
                    warn!(value = %s, "DATETIME column holds unparseable text");
                    Self::Text(s)
                }
            },
            (ColumnType::Date, Self::Text(s)) => match parse_date(&s) {
                Some(d) => Self::Date(d),
                None => {
                    warn!(value = %s, "DATE column holds unparseable text");
                    Self::Text(s)
                }
            },
            (ColumnType::Json, Self::Text(s)) => match serde_json::from_str(&s) {
                Ok(json) => Self::Json(json),
                Err(_) => {
                    warn!("JSON column holds invalid JSON, returning text");
                    Self::Text(s)
                }
            },
            (ColumnType::Text, Self::Integer(i)) => Self::Text(i.to_string()),
            (ColumnType::Text, Self::Real(f)) => Self::Text(f.to_string()),
            (_, value) => value,
        }
    }

    fn sniff(raw: ValueRef<'_>) -> Self {
        match Self::from_raw(raw) {
            Self::Text(s) => {
                let trimmed = s.trim();
                let looks_like_json = (trimmed.starts_with('{') && trimmed.ends_with('}'))
                    || (trimmed.starts_with('[') && trimmed.ends_with(']'));
                if looks_like_json {
                    if let Ok(json) = serde_json::from_str(trimmed) {
                        return Self::Json(json);
                    }
                }
                if ISO_DATETIME.is_match(trimmed) {
                    if let Some(dt) = parse_datetime(trimmed) {
                        return Self::DateTime(dt);
                    }
                }
                if ISO_DATE.is_match(trimmed) {
                    if let Some(d) = parse_date(trimmed) {
                        return Self::Date(d);
                    }
                }
                Self::Text(s)
            }
            other => other,
        }
    }

    fn from_raw(raw: ValueRef<'_>) -> Self {
        match raw {
            ValueRef::Null => Self::Null,
            ValueRef::Integer(i) => Self::Integer(i),
            ValueRef::Real(f) => Self::Real(f),
            ValueRef::Text(bytes) => Self::Text(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => Self::Blob(bytes.to_vec()),
        }
    }
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    NaiveDateTime::parse_from_str(s, DATETIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .or_else(|| parse_date(s).and_then(|d| d.and_hms_opt(0, 0, 0)))
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT).ok()
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Owned(SqlValue::Null),
            Self::Integer(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Self::Real(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Self::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Self::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
            Self::Bool(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
            Self::DateTime(dt) => {
                ToSqlOutput::Owned(SqlValue::Text(dt.format(DATETIME_FORMAT).to_string()))
            }
            Self::Date(d) => ToSqlOutput::Owned(SqlValue::Text(d.format(DATE_FORMAT).to_string())),
            Self::Json(j) => ToSqlOutput::Owned(SqlValue::Text(j.to_string())),
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Integer(i) => write!(f, "{}", i),
            Self::Real(r) => write!(f, "{}", r),
            Self::Text(s) => f.write_str(s),
            Self::Blob(b) => write!(f, "<{} bytes>", b.len()),
            Self::Bool(b) => write!(f, "{}", b),
            Self::DateTime(dt) => write!(f, "{}", dt.format(DATETIME_FORMAT)),
            Self::Date(d) => write!(f, "{}", d.format(DATE_FORMAT)),
            Self::Json(j) => write!(f, "{}", j),
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident $(as $cast:ty)?),+ $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Self::$variant(v $(as $cast)?)
                }
            }
        )+
    };
}

value_from! {
    i64 => Integer,
    i32 => Integer as i64,
    u32 => Integer as i64,
    i16 => Integer as i64,
    u8 => Integer as i64,
    f64 => Real,
    f32 => Real as f64,
    bool => Bool,
    String => Text,
    Vec<u8> => Blob,
    NaiveDateTime => DateTime,
    NaiveDate => Date,
    serde_json::Value => Json,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTime(v.naive_utc())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}
