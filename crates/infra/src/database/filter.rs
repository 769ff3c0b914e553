//! Query filter expressions
//!
//! Callers build filters from the closed set of [`Filter`] variants. Text
//! expressions such as `"price >= 10"` can still be decomposed with
//! [`Filter::parse`]; a shape it cannot decompose becomes
//! [`Filter::Unrecognized`], which renders as an always-true clause and logs
//! a warning every time it is used.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use super::model::quote_ident;
use super::value::Value;

static COMPARISON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)?)\s*(==|!=|<>|<=|>=|=|<|>|\bnot\s+like\b|\blike\b|\b[a-z_]+\b)\s*(.+?)\s*$",
    )
    .expect("COMPARISON should compile - this is a bug")
});

/// Binary comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
}

impl Operator {
    pub fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Like => "LIKE",
        }
    }

    /// Infer the operator from a symbol or an operator name
    ///
    /// Names are matched by substring, so `eq`, `__eq__` and `op_eq` all
    /// resolve to [`Operator::Eq`]. `not like` has no counterpart and yields
    /// `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.trim().to_ascii_lowercase();
        match lower.as_str() {
            "=" | "==" => return Some(Self::Eq),
            "!=" | "<>" => return Some(Self::Ne),
            "<" => return Some(Self::Lt),
            "<=" => return Some(Self::Le),
            ">" => return Some(Self::Gt),
            ">=" => return Some(Self::Ge),
            _ => {}
        }

        if lower.contains("not") && lower.contains("like") {
            None
        } else if lower.contains("like") {
            Some(Self::Like)
        } else if lower.contains("ne") {
            Some(Self::Ne)
        } else if lower.contains("le") {
            Some(Self::Le)
        } else if lower.contains("lt") {
            Some(Self::Lt)
        } else if lower.contains("ge") {
            Some(Self::Ge)
        } else if lower.contains("gt") {
            Some(Self::Gt)
        } else if lower.contains("eq") {
            Some(Self::Eq)
        } else {
            None
        }
    }
}

/// A single `WHERE` condition
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Compare { column: String, op: Operator, value: Value },
    In { column: String, values: Vec<Value> },
    IsNull(String),
    IsNotNull(String),
    /// An expression that could not be decomposed; matches every row
    Unrecognized(String),
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, Operator::Eq, value)
    }

    pub fn ne(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, Operator::Ne, value)
    }

    pub fn lt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, Operator::Lt, value)
    }

    pub fn le(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, Operator::Le, value)
    }

    pub fn gt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, Operator::Gt, value)
    }

    pub fn ge(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, Operator::Ge, value)
    }

    pub fn like(column: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::compare(column, Operator::Like, Value::Text(pattern.into()))
    }

    pub fn in_<I, V>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::In { column: column.into(), values: values.into_iter().map(Into::into).collect() }
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Self::IsNull(column.into())
    }

    pub fn is_not_null(column: impl Into<String>) -> Self {
        Self::IsNotNull(column.into())
    }

    /// Comparison filter; comparing against `NULL` becomes `IS [NOT] NULL`
    pub fn compare(column: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        let column = column.into();
        match (op, value.into()) {
            (Operator::Eq, Value::Null) => Self::IsNull(column),
            (Operator::Ne, Value::Null) => Self::IsNotNull(column),
            (op, value) => Self::Compare { column, op, value },
        }
    }

    /// Decompose a `column <op> literal` expression
    ///
    /// Literals may be quoted strings, integers, decimals, `true`/`false` or
    /// `null`. Unquoted words are taken as text.
    pub fn parse(expr: &str) -> Self {
        let Some(caps) = COMPARISON.captures(expr) else {
            warn!(expression = %expr, "Filter expression not recognised, matching all rows");
            return Self::Unrecognized(expr.to_string());
        };

        let column = &caps[1];
        let Some(op) = Operator::from_name(&caps[2]) else {
            warn!(
                expression = %expr,
                operator = %&caps[2],
                "Filter operator not recognised, matching all rows"
            );
            return Self::Unrecognized(expr.to_string());
        };

        Self::compare(column, op, parse_literal(&caps[3]))
    }

    /// Render as SQL, appending bound parameters to `params`
    pub fn to_sql(&self, params: &mut Vec<Value>) -> String {
        match self {
            Self::Compare { column, op, value } => {
                params.push(value.clone());
                format!("{} {} ?", quote_ident(column), op.sql())
            }
            Self::In { values, .. } if values.is_empty() => "1 = 0".to_string(),
            Self::In { column, values } => {
                params.extend(values.iter().cloned());
                let placeholders = vec!["?"; values.len()].join(", ");
                format!("{} IN ({})", quote_ident(column), placeholders)
            }
            Self::IsNull(column) => format!("{} IS NULL", quote_ident(column)),
            Self::IsNotNull(column) => format!("{} IS NOT NULL", quote_ident(column)),
            Self::Unrecognized(expr) => {
                warn!(expression = %expr, "Unrecognised filter ignored");
                "1 = 1".to_string()
            }
        }
    }
}

fn parse_literal(raw: &str) -> Value {
    let raw = raw.trim();
    let quoted = raw.len() >= 2
        && ((raw.starts_with('\'') && raw.ends_with('\''))
            || (raw.starts_with('"') && raw.ends_with('"')));
    if quoted {
        return Value::Text(raw[1..raw.len() - 1].to_string());
    }

    match raw.to_ascii_lowercase().as_str() {
        "null" | "none" => return Value::Null,
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }

    if let Ok(i) = raw.parse::<i64>() {
        Value::Integer(i)
    } else if let Ok(f) = raw.parse::<f64>() {
        Value::Real(f)
    } else {
        Value::Text(raw.to_string())
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for database::filter.
    use super::*;

    #[test]
    fn test_operator_from_name() {
        assert_eq!(Operator::from_name("__eq__"), Some(Operator::Eq));
        assert_eq!(Operator::from_name("ne"), Some(Operator::Ne));
        assert_eq!(Operator::from_name("op_le"), Some(Operator::Le));
        assert_eq!(Operator::from_name("gt"), Some(Operator::Gt));
        assert_eq!(Operator::from_name("like_op"), Some(Operator::Like));
        assert_eq!(Operator::from_name(">="), Some(Operator::Ge));
        assert_eq!(Operator::from_name("notlike_op"), None);
        assert_eq!(Operator::from_name("between"), None);
    }

    #[test]
    fn test_parse_comparisons() {
        assert_eq!(Filter::parse("price >= 10"), Filter::ge("price", 10_i64));
        assert_eq!(Filter::parse("name = 'Veg tan'"), Filter::eq("name", "Veg tan"));
        assert_eq!(Filter::parse("materials.weight < 2.5"), Filter::lt("materials.weight", 2.5));
        assert_eq!(Filter::parse("name like \"A%\""), Filter::like("name", "A%"));
        assert_eq!(Filter::parse("status ne archived"), Filter::ne("status", "archived"));
        assert_eq!(Filter::parse("deleted_at = null"), Filter::is_null("deleted_at"));
        assert_eq!(Filter::parse("active == true"), Filter::eq("active", true));
    }

    #[test]
    fn test_unrecognized_matches_everything() {
        let filter = Filter::parse("price BETWEEN 1 AND 5");
        assert!(matches!(filter, Filter::Unrecognized(_)));

        let mut params = Vec::new();
        assert_eq!(filter.to_sql(&mut params), "1 = 1");
        assert!(params.is_empty());

        assert!(matches!(Filter::parse("???"), Filter::Unrecognized(_)));
    }

    #[test]
    fn test_to_sql() {
        let mut params = Vec::new();
        assert_eq!(Filter::eq("name", "x").to_sql(&mut params), "\"name\" = ?");
        assert_eq!(
            Filter::in_("id", [1_i64, 2, 3]).to_sql(&mut params),
            "\"id\" IN (?, ?, ?)"
        );
        assert_eq!(Filter::in_("id", Vec::<i64>::new()).to_sql(&mut params), "1 = 0");
        assert_eq!(Filter::is_not_null("sku").to_sql(&mut params), "\"sku\" IS NOT NULL");
        assert_eq!(params.len(), 4);
    }
}
