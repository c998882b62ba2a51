//! Parameter binding for PostgreSQL queries.
//!
//! Statements are prepared without declared parameter types, so the server
//! infers each one from where its placeholder sits (`joined >= $1` makes `$1`
//! a `date`). Parameters always travel in binary format, which means every
//! value must then be encoded as exactly the type the prepared statement
//! reports for its slot. [`coerce`] does that conversion.
//!
//! Raw SQL whose placeholder type cannot be inferred (`$1 IS NULL`) needs an
//! explicit cast such as `$1::text`.

use crate::db::types::{RawDecimal, TypeCategory, categorize_type};
use crate::error::{DbError, DbResult};
use crate::models::QueryParam;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgArguments, PgTypeInfo};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Postgres, TypeInfo};
use uuid::Uuid;

/// A parameter converted to the type of its placeholder.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Bound {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Oid(u32),
    Float4(f32),
    Float8(f64),
    Numeric(RawDecimal),
    Text(String),
    Bytes(Vec<u8>),
    Json(JsonValue),
    Uuid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
}

impl Bound {
    /// Encoding used when the server reported no type for the slot.
    fn natural(param: &QueryParam) -> Self {
        match param {
            QueryParam::Null => Self::Null,
            QueryParam::Bool(v) => Self::Bool(*v),
            QueryParam::Int(v) => Self::Int8(*v),
            QueryParam::Float(v) => Self::Float8(*v),
            QueryParam::String(v) => Self::Text(v.clone()),
            QueryParam::Json(v) => Self::Json(v.clone()),
        }
    }
}

/// Convert `param` (1-based `position`) to the prepared type `target`.
pub(crate) fn coerce(
    param: &QueryParam,
    position: usize,
    target: Option<&PgTypeInfo>,
) -> DbResult<Bound> {
    let Some(target) = target else {
        return Ok(Bound::natural(param));
    };
    if param.is_null() {
        return Ok(Bound::Null);
    }
    let name = target.name().to_lowercase();
    let fail = |reason: String| DbError::invalid_parameter(position, name.as_str(), reason);
    let mismatch = || fail(format!("{} value does not fit", param.type_name()));

    let bound = match (categorize_type(&name), param) {
        (TypeCategory::Text | TypeCategory::Unknown, QueryParam::Json(v)) => {
            Bound::Text(v.to_string())
        }
        (TypeCategory::Text | TypeCategory::Unknown, p) => {
            Bound::Text(p.as_text().ok_or_else(mismatch)?)
        }

        (TypeCategory::Boolean, QueryParam::Bool(v)) => Bound::Bool(*v),
        (TypeCategory::Boolean, QueryParam::String(s)) => Bound::Bool(parse_bool(s).map_err(fail)?),

        (TypeCategory::Integer, QueryParam::Int(v)) => narrow_int(*v, &name).map_err(fail)?,
        (TypeCategory::Integer, QueryParam::Float(v)) if v.fract() == 0.0 => {
            narrow_int(*v as i64, &name).map_err(fail)?
        }
        (TypeCategory::Integer, QueryParam::String(s)) => {
            let v = s
                .trim()
                .parse::<i64>()
                .map_err(|e| fail(format!("'{s}': {e}")))?;
            narrow_int(v, &name).map_err(fail)?
        }

        (TypeCategory::Float, QueryParam::Int(v)) => float(*v as f64, &name),
        (TypeCategory::Float, QueryParam::Float(v)) => float(*v, &name),
        (TypeCategory::Float, QueryParam::String(s)) => {
            let v = s
                .trim()
                .parse::<f64>()
                .map_err(|e| fail(format!("'{s}': {e}")))?;
            float(v, &name)
        }

        (TypeCategory::Decimal, QueryParam::Int(v)) => Bound::Numeric(RawDecimal(v.to_string())),
        (TypeCategory::Decimal, QueryParam::Float(v)) => {
            Bound::Numeric(RawDecimal::parse(&v.to_string()).map_err(fail)?)
        }
        (TypeCategory::Decimal, QueryParam::String(s)) => {
            Bound::Numeric(RawDecimal::parse(s).map_err(fail)?)
        }

        (TypeCategory::Json, QueryParam::Json(v)) => Bound::Json(v.clone()),
        // A string is taken as a serialized document when it parses as one.
        (TypeCategory::Json, QueryParam::String(s)) => Bound::Json(
            serde_json::from_str(s).unwrap_or_else(|_| JsonValue::String(s.clone())),
        ),
        (TypeCategory::Json, QueryParam::Bool(v)) => Bound::Json(JsonValue::Bool(*v)),
        (TypeCategory::Json, QueryParam::Int(v)) => Bound::Json(JsonValue::from(*v)),
        (TypeCategory::Json, QueryParam::Float(v)) => Bound::Json(JsonValue::from(*v)),

        (TypeCategory::Uuid, QueryParam::String(s)) => Bound::Uuid(
            Uuid::parse_str(s.trim()).map_err(|e| fail(format!("'{s}': {e}")))?,
        ),
        (TypeCategory::Date, QueryParam::String(s)) => Bound::Date(
            NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .map_err(|e| fail(format!("'{s}': {e}")))?,
        ),
        (TypeCategory::Time, QueryParam::String(s)) => Bound::Time(
            s.trim()
                .parse::<NaiveTime>()
                .map_err(|e| fail(format!("'{s}': {e}")))?,
        ),
        (TypeCategory::Timestamp, QueryParam::String(s)) => {
            Bound::Timestamp(parse_naive_datetime(s).map_err(fail)?)
        }
        (TypeCategory::TimestampTz, QueryParam::String(s)) => {
            Bound::TimestampTz(parse_datetime_utc(s).map_err(fail)?)
        }
        (TypeCategory::Binary, QueryParam::String(s)) => Bound::Bytes(s.as_bytes().to_vec()),

        _ => return Err(mismatch()),
    };
    Ok(bound)
}

fn narrow_int(v: i64, name: &str) -> Result<Bound, String> {
    let out_of_range = |_| format!("{v} is out of range");
    Ok(match name {
        "int2" | "smallint" => Bound::Int2(i16::try_from(v).map_err(out_of_range)?),
        "int4" | "integer" | "serial" => Bound::Int4(i32::try_from(v).map_err(out_of_range)?),
        "oid" => Bound::Oid(u32::try_from(v).map_err(out_of_range)?),
        _ => Bound::Int8(v),
    })
}

fn float(v: f64, name: &str) -> Bound {
    match name {
        "float4" | "real" => Bound::Float4(v as f32),
        _ => Bound::Float8(v),
    }
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s.trim().to_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "on" | "1" => Ok(true),
        "false" | "f" | "no" | "n" | "off" | "0" => Ok(false),
        _ => Err(format!("'{s}' is not a boolean")),
    }
}

/// `2024-01-31T10:00:00`, `2024-01-31 10:00:00.5` or a bare date at midnight.
fn parse_naive_datetime(s: &str) -> Result<NaiveDateTime, String> {
    let s = s.trim();
    s.parse::<NaiveDateTime>()
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .or_else(|_| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d").map(|d| d.and_time(NaiveTime::MIN))
        })
        .map_err(|e| format!("'{s}': {e}"))
}

/// RFC 3339 with an offset, or a naive timestamp taken as UTC.
fn parse_datetime_utc(s: &str) -> Result<DateTime<Utc>, String> {
    match s.trim().parse::<DateTime<FixedOffset>>() {
        Ok(dt) => Ok(dt.with_timezone(&Utc)),
        Err(_) => parse_naive_datetime(s).map(|naive| naive.and_utc()),
    }
}

/// Bind a converted parameter to a PostgreSQL query.
///
/// NULL goes out without a value; its declared type only matters to an
/// unprepared statement. Builders write a literal `NULL` into INSERT and
/// UPDATE instead.
pub(crate) fn bind_param<'q>(
    query: Query<'q, Postgres, PgArguments>,
    param: &'q Bound,
) -> Query<'q, Postgres, PgArguments> {
    match param {
        Bound::Null => query.bind(None::<String>),
        Bound::Bool(v) => query.bind(*v),
        Bound::Int2(v) => query.bind(*v),
        Bound::Int4(v) => query.bind(*v),
        Bound::Int8(v) => query.bind(*v),
        Bound::Oid(v) => query.bind(Oid(*v)),
        Bound::Float4(v) => query.bind(*v),
        Bound::Float8(v) => query.bind(*v),
        Bound::Numeric(v) => query.bind(v.clone()),
        Bound::Text(v) => query.bind(v.as_str()),
        Bound::Bytes(v) => query.bind(v.as_slice()),
        Bound::Json(v) => query.bind(Json(v)),
        Bound::Uuid(v) => query.bind(*v),
        Bound::Date(v) => query.bind(*v),
        Bound::Time(v) => query.bind(*v),
        Bound::Timestamp(v) => query.bind(*v),
        Bound::TimestampTz(v) => query.bind(*v),
    }
}

/// Build a query with all parameters bound in order.
pub(crate) fn bind_all<'q>(sql: &'q str, params: &'q [Bound]) -> Query<'q, Postgres, PgArguments> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, param| bind_param(query, param))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target(name: &'static str) -> PgTypeInfo {
        PgTypeInfo::with_name(name)
    }

    fn coerce_to(param: impl Into<QueryParam>, name: &'static str) -> DbResult<Bound> {
        coerce(&param.into(), 1, Some(&target(name)))
    }

    #[test]
    fn test_untargeted_params_bind_naturally() {
        assert_eq!(coerce(&QueryParam::from(7), 1, None).unwrap(), Bound::Int8(7));
        assert_eq!(
            coerce(&QueryParam::from("a"), 1, None).unwrap(),
            Bound::Text("a".to_string())
        );
    }

    #[test]
    fn test_strings_to_temporal_and_uuid() {
        assert_eq!(
            coerce_to("2024-01-01", "date").unwrap(),
            Bound::Date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
        );
        assert!(matches!(
            coerce_to("2024-01-01 08:30:00", "timestamp").unwrap(),
            Bound::Timestamp(_)
        ));
        let Bound::TimestampTz(ts) = coerce_to("2024-01-01T10:00:00+02:00", "timestamptz").unwrap()
        else {
            panic!("expected timestamptz");
        };
        assert_eq!(ts.to_rfc3339(), "2024-01-01T08:00:00+00:00");
        assert!(matches!(coerce_to("2024-01-01", "timestamptz").unwrap(), Bound::TimestampTz(_)));
        assert!(matches!(coerce_to("13:45:00", "time").unwrap(), Bound::Time(_)));
        assert!(matches!(
            coerce_to("a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11", "uuid").unwrap(),
            Bound::Uuid(_)
        ));
    }

    #[test]
    fn test_numbers_follow_column_width() {
        assert_eq!(coerce_to(5, "int4").unwrap(), Bound::Int4(5));
        assert_eq!(coerce_to(5, "int2").unwrap(), Bound::Int2(5));
        assert_eq!(coerce_to("42", "int8").unwrap(), Bound::Int8(42));
        assert_eq!(coerce_to(2.0, "int4").unwrap(), Bound::Int4(2));
        assert_eq!(coerce_to(3, "float4").unwrap(), Bound::Float4(3.0));
        assert_eq!(
            coerce_to("19.99", "numeric").unwrap(),
            Bound::Numeric(RawDecimal("19.99".to_string()))
        );
        assert_eq!(coerce_to(7, "text").unwrap(), Bound::Text("7".to_string()));
    }

    #[test]
    fn test_json_targets() {
        assert_eq!(coerce_to(r#"{"a":1}"#, "jsonb").unwrap(), Bound::Json(json!({"a": 1})));
        assert_eq!(coerce_to("plain", "json").unwrap(), Bound::Json(json!("plain")));
        assert_eq!(
            coerce_to(QueryParam::Json(json!([1, 2])), "text").unwrap(),
            Bound::Text("[1,2]".to_string())
        );
    }

    #[test]
    fn test_unconvertible_values_name_the_slot() {
        let err = coerce(&QueryParam::from("not-a-date"), 3, Some(&target("date"))).unwrap_err();
        match err {
            DbError::InvalidParameter { position, ref target, .. } => {
                assert_eq!(position, 3);
                assert_eq!(target, "date");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(coerce_to(70_000, "int2").is_err());
        assert!(coerce_to(1.5, "int4").is_err());
        assert!(coerce_to(true, "uuid").is_err());
        assert!(coerce_to("maybe", "bool").is_err());
    }

    #[test]
    fn test_null_is_null_for_any_target() {
        assert_eq!(coerce_to(QueryParam::Null, "date").unwrap(), Bound::Null);
    }
}
