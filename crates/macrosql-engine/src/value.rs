//! Macro values
//!
//! Every value bound in an [`Environment`](crate::Environment) or produced by
//! the expression evaluator is a [`MacroValue`]. Values are immutable once
//! bound; lambdas share their captured environment through an `Arc`.

use crate::environment::Environment;
use crate::error::{MacroError, MacroResult};
use crate::scanner::Origin;
use chrono::NaiveDate;
use macrosql_core::DialectConfig;
use std::sync::Arc;

/// A scalar value
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Date(NaiveDate),
}

/// A piece of SQL text carried as a value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlFragment {
    pub text: String,

    /// Verbatim fragments are emitted as-is and never rescanned for macros
    pub verbatim: bool,
}

/// An anonymous function `param -> body` or `(a, b) -> body`
#[derive(Debug, Clone)]
pub struct Lambda {
    pub params: Vec<String>,
    pub body: String,

    /// Where the body text starts, for error positions
    pub origin: Origin,

    /// Environment the lambda was created in
    pub scope: Arc<Environment>,
}

/// Tagged union of everything a macro variable can hold
#[derive(Debug, Clone)]
pub enum MacroValue {
    Scalar(Scalar),
    Sql(SqlFragment),
    List(Vec<MacroValue>),
    /// Insertion-ordered name → value mapping
    Mapping(Vec<(String, MacroValue)>),
    Lambda(Arc<Lambda>),
}

impl PartialEq for MacroValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Scalar(a), Self::Scalar(b)) => a == b,
            (Self::Sql(a), Self::Sql(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Mapping(a), Self::Mapping(b)) => a == b,
            (Self::Lambda(a), Self::Lambda(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl MacroValue {
    pub fn null() -> Self {
        Self::Scalar(Scalar::Null)
    }

    pub fn bool(value: bool) -> Self {
        Self::Scalar(Scalar::Bool(value))
    }

    pub fn int(value: i64) -> Self {
        Self::Scalar(Scalar::Int(value))
    }

    pub fn float(value: f64) -> Self {
        Self::Scalar(Scalar::Float(value))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::Scalar(Scalar::Str(value.into()))
    }

    pub fn date(value: NaiveDate) -> Self {
        Self::Scalar(Scalar::Date(value))
    }

    /// SQL text that may still contain macro tokens
    pub fn sql(text: impl Into<String>) -> Self {
        Self::Sql(SqlFragment { text: text.into(), verbatim: false })
    }

    /// SQL text that is final and must not be rescanned
    pub fn verbatim(text: impl Into<String>) -> Self {
        Self::Sql(SqlFragment { text: text.into(), verbatim: true })
    }

    /// Human-readable type name used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Scalar(Scalar::Null) => "null",
            Self::Scalar(Scalar::Bool(_)) => "boolean",
            Self::Scalar(Scalar::Int(_)) => "integer",
            Self::Scalar(Scalar::Float(_)) => "float",
            Self::Scalar(Scalar::Str(_)) => "string",
            Self::Scalar(Scalar::Date(_)) => "date",
            Self::Sql(_) => "sql",
            Self::List(_) => "list",
            Self::Mapping(_) => "mapping",
            Self::Lambda(_) => "lambda",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Scalar(Scalar::Null))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Scalar(Scalar::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Scalar(Scalar::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// Truth value: booleans are themselves, nonzero numbers are true,
    /// empty strings and collections are false
    pub fn truthy(&self, offset: usize) -> MacroResult<bool> {
        match self {
            Self::Scalar(Scalar::Null) => Ok(false),
            Self::Scalar(Scalar::Bool(b)) => Ok(*b),
            Self::Scalar(Scalar::Int(i)) => Ok(*i != 0),
            Self::Scalar(Scalar::Float(f)) => Ok(*f != 0.0),
            Self::Scalar(Scalar::Str(s)) => Ok(!s.is_empty()),
            Self::Scalar(Scalar::Date(_)) => Ok(true),
            Self::List(items) => Ok(!items.is_empty()),
            Self::Mapping(entries) => Ok(!entries.is_empty()),
            Self::Sql(_) | Self::Lambda(_) => Err(MacroError::type_error(
                format!("a {} value has no truth value", self.type_name()),
                offset,
            )),
        }
    }

    /// Render as SQL text
    pub fn to_sql(&self, offset: usize) -> MacroResult<String> {
        match self {
            Self::Scalar(Scalar::Null) => Ok("NULL".to_string()),
            Self::Scalar(Scalar::Bool(true)) => Ok("TRUE".to_string()),
            Self::Scalar(Scalar::Bool(false)) => Ok("FALSE".to_string()),
            Self::Scalar(Scalar::Int(i)) => Ok(i.to_string()),
            Self::Scalar(Scalar::Float(f)) => format_float(*f, offset),
            Self::Scalar(Scalar::Str(s)) => Ok(quote_string(s)),
            Self::Scalar(Scalar::Date(d)) => Ok(format!("DATE '{}'", d.format("%Y-%m-%d"))),
            Self::Sql(fragment) => Ok(fragment.text.clone()),
            Self::List(items) => {
                let rendered = items
                    .iter()
                    .map(|item| item.to_sql(offset))
                    .collect::<MacroResult<Vec<_>>>()?;
                Ok(format!("({})", rendered.join(", ")))
            }
            Self::Mapping(_) | Self::Lambda(_) => Err(MacroError::type_error(
                format!("a {} value cannot be rendered as SQL", self.type_name()),
                offset,
            )),
        }
    }

    /// Render in an identifier position: strings become quoted identifiers
    pub fn to_identifier(&self, dialect: DialectConfig, offset: usize) -> MacroResult<String> {
        match self {
            Self::Scalar(Scalar::Str(s)) => Ok(dialect.quote_identifier(s)),
            other => other.to_sql(offset),
        }
    }

    /// Plain text of the value, without SQL quoting
    pub fn display_text(&self, offset: usize) -> MacroResult<String> {
        match self {
            Self::Scalar(Scalar::Str(s)) => Ok(s.clone()),
            Self::Scalar(Scalar::Date(d)) => Ok(d.format("%Y-%m-%d").to_string()),
            other => other.to_sql(offset),
        }
    }

    /// Look up a key in a mapping value
    pub fn get(&self, key: &str) -> Option<&MacroValue> {
        match self {
            Self::Mapping(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Convert an externally supplied JSON value
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::null(),
            serde_json::Value::Bool(b) => Self::bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::int(i),
                None => Self::float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Self::string(s.clone()),
            serde_json::Value::Array(items) => Self::List(items.iter().map(Self::from_json).collect()),
            serde_json::Value::Object(entries) => Self::Mapping(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for MacroValue {
    fn from(value: bool) -> Self {
        Self::bool(value)
    }
}

impl From<i64> for MacroValue {
    fn from(value: i64) -> Self {
        Self::int(value)
    }
}

impl From<&str> for MacroValue {
    fn from(value: &str) -> Self {
        Self::string(value)
    }
}

/// Single-quoted SQL string literal
pub fn quote_string(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn format_float(f: f64, offset: usize) -> MacroResult<String> {
    if !f.is_finite() {
        return Err(MacroError::evaluation(
            format!("{} cannot be rendered as SQL", f),
            offset,
        ));
    }
    let text = f.to_string();
    if text.contains('.') || text.contains('e') {
        Ok(text)
    } else {
        Ok(format!("{}.0", text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_sql_rendering() {
        assert_eq!(MacroValue::int(42).to_sql(0).unwrap(), "42");
        assert_eq!(MacroValue::float(2.0).to_sql(0).unwrap(), "2.0");
        assert_eq!(MacroValue::float(0.25).to_sql(0).unwrap(), "0.25");
        assert_eq!(MacroValue::bool(true).to_sql(0).unwrap(), "TRUE");
        assert_eq!(MacroValue::null().to_sql(0).unwrap(), "NULL");
        assert_eq!(MacroValue::string("it's").to_sql(0).unwrap(), "'it''s'");

        let date = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        assert_eq!(MacroValue::date(date).to_sql(0).unwrap(), "DATE '2023-01-01'");
    }

    #[test]
    fn list_renders_as_tuple() {
        let list = MacroValue::List(vec![MacroValue::int(1), MacroValue::string("a")]);
        assert_eq!(list.to_sql(0).unwrap(), "(1, 'a')");
    }

    #[test]
    fn mapping_cannot_be_rendered() {
        let mapping = MacroValue::Mapping(vec![("a".to_string(), MacroValue::int(1))]);
        let err = mapping.to_sql(7).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Type);
        assert_eq!(err.offset(), 7);
    }

    #[test]
    fn truthiness() {
        assert!(MacroValue::int(3).truthy(0).unwrap());
        assert!(!MacroValue::int(0).truthy(0).unwrap());
        assert!(!MacroValue::string("").truthy(0).unwrap());
        assert!(MacroValue::string("x").truthy(0).unwrap());
        assert!(!MacroValue::List(vec![]).truthy(0).unwrap());
        assert!(!MacroValue::null().truthy(0).unwrap());
        assert!(MacroValue::sql("a > 1").truthy(0).is_err());
    }

    #[test]
    fn identifiers_follow_dialect() {
        let value = MacroValue::string("carrot");
        assert_eq!(value.to_identifier(DialectConfig::Ansi, 0).unwrap(), "\"carrot\"");
        assert_eq!(value.to_identifier(DialectConfig::BigQuery, 0).unwrap(), "`carrot`");
        assert_eq!(MacroValue::int(1).to_identifier(DialectConfig::Ansi, 0).unwrap(), "1");
    }

    #[test]
    fn json_conversion_keeps_structure() {
        let json = serde_json::json!({"sizes": [1, 2.5], "name": "x", "on": true});
        let value = MacroValue::from_json(&json);

        assert_eq!(value.get("name"), Some(&MacroValue::string("x")));
        assert_eq!(
            value.get("sizes"),
            Some(&MacroValue::List(vec![MacroValue::int(1), MacroValue::float(2.5)]))
        );
        assert_eq!(value.get("on").and_then(|v| v.as_bool()), Some(true));
    }

    #[test]
    fn json_objects_keep_key_order() {
        let json: serde_json::Value = serde_json::from_str(r#"{"zeta": 1, "alpha": 2, "mid": 3}"#).unwrap();
        let MacroValue::Mapping(entries) = MacroValue::from_json(&json) else {
            panic!("expected a mapping");
        };
        let keys: Vec<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
    }
}
