//! SQL value representation and conversion from decoded records.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};

use crate::config::Conv;
use crate::error::{MigrateError, Result};

/// A converted field value ready for binding into a destination statement.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// Absent optional field.
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
    Json(serde_json::Value),
}

fn conversion_error(field: &str, reason: impl Into<String>) -> MigrateError {
    MigrateError::Conversion {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Interpret an RFC 3339 string or an epoch number as a UTC timestamp.
///
/// Integer inputs are epoch seconds, except values large enough that they can
/// only be epoch milliseconds (anything past the year 33658 in seconds).
fn to_timestamp(field: &str, value: &serde_json::Value) -> Result<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(field, format!("'{}' is not RFC 3339: {}", s, e))),
        serde_json::Value::Number(n) => {
            let epoch = n
                .as_i64()
                .ok_or_else(|| conversion_error(field, "numeric timestamp out of range"))?;
            let dt = if epoch.abs() >= 1_000_000_000_000 {
                Utc.timestamp_millis_opt(epoch).single()
            } else {
                Utc.timestamp_opt(epoch, 0).single()
            };
            dt.ok_or_else(|| conversion_error(field, format!("epoch {} out of range", epoch)))
        }
        other => Err(conversion_error(
            field,
            format!("cannot convert {} to a timestamp", json_kind(other)),
        )),
    }
}

fn json_kind(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

/// Convert a decoded JSON value to the mapping's target type.
///
/// JSON null converts to SQL NULL for every tag. Numeric strings are accepted
/// for `int` and `float` since document dumps frequently stringify numbers.
pub fn convert(field: &str, value: &serde_json::Value, conv: Conv) -> Result<SqlValue> {
    use serde_json::Value;

    if value.is_null() {
        return Ok(SqlValue::Null);
    }

    match conv {
        Conv::Int => match value {
            Value::Number(n) => n
                .as_i64()
                .map(SqlValue::Int)
                .ok_or_else(|| conversion_error(field, format!("{} is not an integer", n))),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(SqlValue::Int)
                .map_err(|_| conversion_error(field, format!("'{}' is not an integer", s))),
            other => Err(conversion_error(
                field,
                format!("cannot convert {} to an integer", json_kind(other)),
            )),
        },

        Conv::Float => match value {
            Value::Number(n) => n
                .as_f64()
                .map(SqlValue::Float)
                .ok_or_else(|| conversion_error(field, format!("{} is not a float", n))),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(SqlValue::Float)
                .map_err(|_| conversion_error(field, format!("'{}' is not a float", s))),
            other => Err(conversion_error(
                field,
                format!("cannot convert {} to a float", json_kind(other)),
            )),
        },

        Conv::String => match value {
            Value::String(s) => Ok(SqlValue::Text(s.clone())),
            Value::Number(n) => Ok(SqlValue::Text(n.to_string())),
            Value::Bool(b) => Ok(SqlValue::Text(b.to_string())),
            other => Err(conversion_error(
                field,
                format!("cannot convert {} to a string", json_kind(other)),
            )),
        },

        Conv::Bool => match value {
            Value::Bool(b) => Ok(SqlValue::Bool(*b)),
            Value::String(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(SqlValue::Bool(true)),
                "false" | "f" | "0" => Ok(SqlValue::Bool(false)),
                _ => Err(conversion_error(field, format!("'{}' is not a boolean", s))),
            },
            other => Err(conversion_error(
                field,
                format!("cannot convert {} to a boolean", json_kind(other)),
            )),
        },

        Conv::Date => match value {
            Value::String(s) => {
                let date_part = s.get(..10).unwrap_or(s);
                NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
                    .map(SqlValue::Date)
                    .map_err(|_| conversion_error(field, format!("'{}' is not a date", s)))
            }
            other => to_timestamp(field, other).map(|dt| SqlValue::Date(dt.date_naive())),
        },

        Conv::Datetime | Conv::Timestamp => to_timestamp(field, value).map(SqlValue::DateTime),

        Conv::Bson => Ok(SqlValue::Json(value.clone())),

        Conv::Base64 => match value {
            Value::String(s) => BASE64
                .decode(s.as_bytes())
                .map(SqlValue::Bytes)
                .map_err(|e| conversion_error(field, format!("invalid base64: {}", e))),
            other => Err(conversion_error(
                field,
                format!("cannot convert {} to bytes", json_kind(other)),
            )),
        },
    }
}

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut bytes::BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Bool(v) => v.to_sql(ty, out),
            SqlValue::Int(v) => {
                if *ty == Type::INT2 {
                    (*v as i16).to_sql(ty, out)
                } else if *ty == Type::INT4 {
                    (*v as i32).to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            SqlValue::Float(v) => {
                if *ty == Type::FLOAT4 {
                    (*v as f32).to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            SqlValue::Text(v) => v.to_sql(ty, out),
            SqlValue::Bytes(v) => v.to_sql(ty, out),
            SqlValue::Date(v) => v.to_sql(ty, out),
            SqlValue::DateTime(v) => {
                if *ty == Type::TIMESTAMP {
                    v.naive_utc().to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            SqlValue::Json(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        // Type agreement is enforced up front by schema validation.
        true
    }

    to_sql_checked!();
}
