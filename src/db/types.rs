//! PostgreSQL row decoding.
//!
//! Rows are returned to callers as JSON maps so that the adapter does not
//! need to know table shapes ahead of time.
//!
//! # Architecture
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies column types into logical categories
//! 2. Category-specific decoders handle the actual value extraction

use serde_json::Value as JsonValue;
use sqlx::encode::IsNull;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgArgumentBuffer, PgRow, PgTypeInfo, PgValueFormat, PgValueRef};
use sqlx::{Column, Decode, Encode, Row as _, Type, TypeInfo, ValueRef};

/// A decoded row: column name to JSON value, in column order.
pub type Row = serde_json::Map<String, JsonValue>;

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Timestamp,
    TimestampTz,
    Date,
    Time,
    Unknown,
}

/// Classify a PostgreSQL type name into a logical category.
pub fn categorize_type(type_name: &str) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Decimal/Numeric - check first as it overlaps with "numeric" in float checks
    if lower.contains("decimal") || lower.contains("numeric") {
        return TypeCategory::Decimal;
    }

    match lower.as_str() {
        "int2" | "int4" | "int8" | "smallint" | "integer" | "bigint" | "serial"
        | "bigserial" | "oid" => TypeCategory::Integer,
        "bool" | "boolean" => TypeCategory::Boolean,
        "float4" | "float8" | "real" | "double precision" => TypeCategory::Float,
        "json" | "jsonb" => TypeCategory::Json,
        "uuid" => TypeCategory::Uuid,
        "bytea" => TypeCategory::Binary,
        "timestamp" => TypeCategory::Timestamp,
        "timestamptz" => TypeCategory::TimestampTz,
        "date" => TypeCategory::Date,
        "time" => TypeCategory::Time,
        "text" | "varchar" | "bpchar" | "char" | "name" | "citext" => TypeCategory::Text,
        _ => TypeCategory::Unknown,
    }
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Wrapper type for raw NUMERIC values as strings.
/// This preserves the exact database representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDecimal(pub String);

const NUMERIC_OID: u32 = 1700;

impl RawDecimal {
    /// Validate a decimal literal such as `-12.50`, `NaN` or `Infinity`.
    pub fn parse(text: &str) -> Result<Self, String> {
        let text = text.trim();
        match text {
            "NaN" | "Infinity" | "-Infinity" => return Ok(Self(text.to_string())),
            "inf" | "+Infinity" => return Ok(Self("Infinity".to_string())),
            "-inf" => return Ok(Self("-Infinity".to_string())),
            _ => {}
        }
        let unsigned = text.strip_prefix(['-', '+']).unwrap_or(text);
        let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
        let valid = !(int_part.is_empty() && frac_part.is_empty())
            && int_part.bytes().all(|b| b.is_ascii_digit())
            && frac_part.bytes().all(|b| b.is_ascii_digit());
        if valid {
            Ok(Self(text.to_string()))
        } else {
            Err(format!("'{text}' is not a decimal number"))
        }
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(NUMERIC_OID))
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        match value.format() {
            PgValueFormat::Text => Ok(RawDecimal(value.as_str()?.to_string())),
            PgValueFormat::Binary => Ok(RawDecimal(numeric_to_string(value.as_bytes()?)?)),
        }
    }
}

impl Encode<'_, sqlx::Postgres> for RawDecimal {
    fn encode_by_ref(
        &self,
        buf: &mut PgArgumentBuffer,
    ) -> Result<IsNull, sqlx::error::BoxDynError> {
        buf.extend_from_slice(&string_to_numeric(&self.0)?);
        Ok(IsNull::No)
    }
}

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Render the binary NUMERIC wire format as a decimal string.
///
/// Layout: ndigits, weight, sign, dscale (all 16-bit), then `ndigits`
/// base-10000 digits.
fn numeric_to_string(buf: &[u8]) -> Result<String, sqlx::error::BoxDynError> {
    if buf.len() < 8 {
        return Err("numeric value too short".into());
    }
    let read = |i: usize| u16::from_be_bytes([buf[i], buf[i + 1]]);
    let ndigits = read(0) as usize;
    let weight = read(2) as i16 as i32;
    let sign = read(4);
    let dscale = read(6) as usize;

    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        NUMERIC_POS | NUMERIC_NEG => {}
        other => return Err(format!("unknown numeric sign 0x{other:04X}").into()),
    }
    if buf.len() < 8 + ndigits * 2 {
        return Err("numeric value truncated".into());
    }
    let digits: Vec<u16> = (0..ndigits).map(|i| read(8 + i * 2)).collect();

    let mut int_part = String::new();
    for pos in 0..=weight.max(0) {
        if pos > weight {
            break;
        }
        let d = digits.get(pos as usize).copied().unwrap_or(0);
        if int_part.is_empty() {
            if d != 0 {
                int_part.push_str(&d.to_string());
            }
        } else {
            int_part.push_str(&format!("{:04}", d));
        }
    }
    if int_part.is_empty() {
        int_part.push('0');
    }

    let mut frac_part = String::new();
    if dscale > 0 {
        // Fractional groups start at weight + 1 (may be negative weights).
        let mut pos = weight + 1;
        while frac_part.len() < dscale {
            let d = if pos < 0 {
                0
            } else {
                digits.get(pos as usize).copied().unwrap_or(0)
            };
            frac_part.push_str(&format!("{:04}", d));
            pos += 1;
        }
        frac_part.truncate(dscale);
    }

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }
    out.push_str(&int_part);
    if !frac_part.is_empty() {
        out.push('.');
        out.push_str(&frac_part);
    }
    Ok(out)
}

/// Encode a decimal string in the binary NUMERIC wire format.
fn string_to_numeric(text: &str) -> Result<Vec<u8>, sqlx::error::BoxDynError> {
    let header = |ndigits: u16, weight: i16, sign: u16, dscale: u16| {
        let mut buf = Vec::with_capacity(8 + ndigits as usize * 2);
        buf.extend_from_slice(&ndigits.to_be_bytes());
        buf.extend_from_slice(&weight.to_be_bytes());
        buf.extend_from_slice(&sign.to_be_bytes());
        buf.extend_from_slice(&dscale.to_be_bytes());
        buf
    };
    match text {
        "NaN" => return Ok(header(0, 0, NUMERIC_NAN, 0)),
        "Infinity" => return Ok(header(0, 0, NUMERIC_PINF, 0)),
        "-Infinity" => return Ok(header(0, 0, NUMERIC_NINF, 0)),
        _ => {}
    }

    let (sign, unsigned) = match text.strip_prefix('-') {
        Some(rest) => (NUMERIC_NEG, rest),
        None => (NUMERIC_POS, text.strip_prefix('+').unwrap_or(text)),
    };
    let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
        return Err(format!("'{text}' is not a decimal number").into());
    }
    let dscale = u16::try_from(frac_part.len()).map_err(|_| "numeric scale too large")?;

    // Pad both halves to whole base-10000 groups around the decimal point.
    let int_part = int_part.trim_start_matches('0');
    let int_pad = (4 - int_part.len() % 4) % 4;
    let frac_pad = (4 - frac_part.len() % 4) % 4;
    let padded: Vec<u8> = std::iter::repeat_n(b'0', int_pad)
        .chain(int_part.bytes())
        .chain(frac_part.bytes())
        .chain(std::iter::repeat_n(b'0', frac_pad))
        .collect();
    let mut groups: Vec<u16> = padded
        .chunks(4)
        .map(|chunk| chunk.iter().fold(0u16, |acc, b| acc * 10 + u16::from(b - b'0')))
        .collect();
    let mut weight = ((int_pad + int_part.len()) / 4) as i32 - 1;

    while groups.first() == Some(&0) {
        groups.remove(0);
        weight -= 1;
    }
    while groups.last() == Some(&0) {
        groups.pop();
    }
    if groups.is_empty() {
        return Ok(header(0, 0, NUMERIC_POS, dscale));
    }

    let ndigits = u16::try_from(groups.len()).map_err(|_| "numeric value too long")?;
    let weight = i16::try_from(weight).map_err(|_| "numeric value out of range")?;
    let mut buf = header(ndigits, weight, sign, dscale);
    for group in groups {
        buf.extend_from_slice(&group.to_be_bytes());
    }
    Ok(buf)
}

// =============================================================================
// Binary Encoding
// =============================================================================

/// Decode binary data to JSON value.
///
/// If `decode_binary` is true, attempts to decode as UTF-8 text first.
/// Falls back to base64 encoding if not valid UTF-8 or if `decode_binary` is false.
pub fn decode_binary_value(bytes: &[u8], decode_binary: bool) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    if decode_binary {
        match std::str::from_utf8(bytes) {
            Ok(s) => JsonValue::String(s.to_string()),
            Err(_) => JsonValue::String(STANDARD.encode(bytes)),
        }
    } else {
        JsonValue::String(STANDARD.encode(bytes))
    }
}

// =============================================================================
// Row to JSON Trait
// =============================================================================

/// Trait for converting database rows to JSON maps.
pub trait RowToJson {
    fn to_json_map(&self) -> Row;
    fn to_json_map_with_options(&self, decode_binary: bool) -> Row;
}

impl RowToJson for PgRow {
    fn to_json_map(&self) -> Row {
        self.to_json_map_with_options(false)
    }

    fn to_json_map_with_options(&self, decode_binary: bool) -> Row {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let category = categorize_type(type_name);
                let value = decode_column(self, idx, category, decode_binary);
                (col.name().to_string(), value)
            })
            .collect()
    }
}

fn is_null(row: &PgRow, idx: usize) -> bool {
    row.try_get_raw(idx).map(|v| v.is_null()).unwrap_or(true)
}

fn decode_column(row: &PgRow, idx: usize, category: TypeCategory, decode_binary: bool) -> JsonValue {
    if is_null(row, idx) {
        return JsonValue::Null;
    }
    match category {
        TypeCategory::Decimal => decode_decimal(row, idx),
        TypeCategory::Integer => decode_integer(row, idx),
        TypeCategory::Boolean => decode_as::<bool>(row, idx),
        TypeCategory::Float => decode_float(row, idx),
        TypeCategory::Binary => decode_binary_col(row, idx, decode_binary),
        TypeCategory::Json => decode_as::<JsonValue>(row, idx),
        TypeCategory::Uuid => row
            .try_get::<uuid::Uuid, _>(idx)
            .map(|v| JsonValue::String(v.to_string()))
            .unwrap_or(JsonValue::Null),
        TypeCategory::Timestamp => row
            .try_get::<chrono::NaiveDateTime, _>(idx)
            .map(|v| JsonValue::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
            .unwrap_or(JsonValue::Null),
        TypeCategory::TimestampTz => row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(idx)
            .map(|v| JsonValue::String(v.to_rfc3339()))
            .unwrap_or(JsonValue::Null),
        TypeCategory::Date => row
            .try_get::<chrono::NaiveDate, _>(idx)
            .map(|v| JsonValue::String(v.to_string()))
            .unwrap_or(JsonValue::Null),
        TypeCategory::Time => row
            .try_get::<chrono::NaiveTime, _>(idx)
            .map(|v| JsonValue::String(v.to_string()))
            .unwrap_or(JsonValue::Null),
        TypeCategory::Text | TypeCategory::Unknown => decode_text(row, idx),
    }
}

fn decode_as<'r, T>(row: &'r PgRow, idx: usize) -> JsonValue
where
    T: Decode<'r, sqlx::Postgres> + Type<sqlx::Postgres> + Into<JsonValue>,
{
    row.try_get::<T, _>(idx)
        .map(Into::into)
        .unwrap_or(JsonValue::Null)
}

fn decode_decimal(row: &PgRow, idx: usize) -> JsonValue {
    match row.try_get::<RawDecimal, _>(idx) {
        Ok(v) => JsonValue::String(v.0),
        Err(e) => {
            tracing::error!("Failed to decode NUMERIC: {:?}", e);
            JsonValue::Null
        }
    }
}

fn decode_integer(row: &PgRow, idx: usize) -> JsonValue {
    if let Ok(v) = row.try_get::<i16, _>(idx) {
        return JsonValue::Number(v.into());
    }
    if let Ok(v) = row.try_get::<i32, _>(idx) {
        return JsonValue::Number(v.into());
    }
    if let Ok(v) = row.try_get::<i64, _>(idx) {
        return JsonValue::Number(v.into());
    }
    if let Ok(v) = row.try_get::<sqlx::postgres::types::Oid, _>(idx) {
        return JsonValue::Number(v.0.into());
    }
    JsonValue::Null
}

fn decode_float(row: &PgRow, idx: usize) -> JsonValue {
    let value = row
        .try_get::<f64, _>(idx)
        .or_else(|_| row.try_get::<f32, _>(idx).map(f64::from));
    match value {
        Ok(v) => serde_json::Number::from_f64(v)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::String(v.to_string())),
        Err(_) => JsonValue::Null,
    }
}

fn decode_binary_col(row: &PgRow, idx: usize, decode_binary: bool) -> JsonValue {
    row.try_get::<Vec<u8>, _>(idx)
        .map(|v| decode_binary_value(&v, decode_binary))
        .unwrap_or(JsonValue::Null)
}

/// Text-like and unknown types. Unknown types only decode when sent as text.
fn decode_text(row: &PgRow, idx: usize) -> JsonValue {
    if let Ok(v) = row.try_get::<String, _>(idx) {
        return JsonValue::String(v);
    }
    match row.try_get_raw(idx) {
        Ok(raw) if raw.format() == PgValueFormat::Text => raw
            .as_str()
            .map(|s| JsonValue::String(s.to_string()))
            .unwrap_or(JsonValue::Null),
        _ => JsonValue::Null,
    }
}
