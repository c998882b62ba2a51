//! Query-related data models.
//!
//! This module defines bound parameter values, ordered column/value maps and
//! the options accepted by reads.

use crate::error::{DbError, DbResult};
use crate::sql::validate_identifier;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Arrays and objects, bound as `jsonb`
    Json(JsonValue),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Json(_) => "json",
        }
    }

    /// Text form used by pattern operators. `None` for null and JSON values.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Bool(v) => Some(v.to_string()),
            Self::Int(v) => Some(v.to_string()),
            Self::Float(v) => Some(v.to_string()),
            Self::String(v) => Some(v.clone()),
            Self::Null | Self::Json(_) => None,
        }
    }

    /// Convert a JSON value. Integers that fit in i64 stay integers.
    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(v) => Self::Bool(v),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => n.as_f64().map(Self::Float).unwrap_or(Self::Null),
            },
            JsonValue::String(s) => Self::String(s),
            other => Self::Json(other),
        }
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for QueryParam {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

// Typed values travel as their canonical text; the binder converts them back
// once the server reports the column type.
impl From<uuid::Uuid> for QueryParam {
    fn from(v: uuid::Uuid) -> Self {
        Self::String(v.to_string())
    }
}

impl From<chrono::NaiveDate> for QueryParam {
    fn from(v: chrono::NaiveDate) -> Self {
        Self::String(v.format("%Y-%m-%d").to_string())
    }
}

impl From<chrono::NaiveDateTime> for QueryParam {
    fn from(v: chrono::NaiveDateTime) -> Self {
        Self::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
    }
}

impl From<chrono::DateTime<chrono::Utc>> for QueryParam {
    fn from(v: chrono::DateTime<chrono::Utc>) -> Self {
        Self::String(v.to_rfc3339())
    }
}

impl From<JsonValue> for QueryParam {
    fn from(v: JsonValue) -> Self {
        Self::from_json(v)
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Column/value pairs for INSERT and UPDATE, kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValueMap {
    entries: Vec<(String, QueryParam)>,
}

impl ValueMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a column. Setting an existing column replaces its value in place.
    pub fn set(mut self, column: impl Into<String>, value: impl Into<QueryParam>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<QueryParam>) {
        let column = column.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(c, _)| *c == column) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((column, value)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &QueryParam)> {
        self.entries.iter().map(|(c, v)| (c.as_str(), v))
    }

    /// Build from a JSON object, following the object's iteration order.
    pub fn from_json_object(object: serde_json::Map<String, JsonValue>) -> Self {
        let mut map = Self::new();
        for (column, value) in object {
            map.insert(column, QueryParam::from_json(value));
        }
        map
    }
}

impl<K: Into<String>, V: Into<QueryParam>> FromIterator<(K, V)> for ValueMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

/// Column list for SELECT.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Columns {
    /// `*`
    #[default]
    All,
    List(Vec<String>),
}

impl Columns {
    pub fn list<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::List(columns.into_iter().map(Into::into).collect())
    }

    /// Parse a comma separated list. `*` or an empty string selects all columns.
    pub fn parse(s: &str) -> Self {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed == "*" {
            return Self::All;
        }
        Self::list(trimmed.split(',').map(|c| c.trim().to_string()))
    }
}

/// Sort direction for one ORDER BY term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

/// Placement of NULLs for one ORDER BY term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nulls {
    First,
    Last,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTerm {
    pub column: String,
    pub direction: Direction,
    pub nulls: Option<Nulls>,
}

/// Validated ORDER BY clause.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderBy {
    terms: Vec<OrderTerm>,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> DbResult<Self> {
        Self::default().then(column, Direction::Asc)
    }

    pub fn desc(column: impl Into<String>) -> DbResult<Self> {
        Self::default().then(column, Direction::Desc)
    }

    /// Append a term.
    pub fn then(mut self, column: impl Into<String>, direction: Direction) -> DbResult<Self> {
        let column = column.into();
        validate_identifier(&column)?;
        self.terms.push(OrderTerm {
            column,
            direction,
            nulls: None,
        });
        Ok(self)
    }

    /// Parse `"created desc, name"` style input. Each term is a column,
    /// optionally followed by `asc`/`desc` and `nulls first`/`nulls last`.
    pub fn parse(s: &str) -> DbResult<Self> {
        let mut order = Self::default();
        for raw in s.split(',') {
            let words: Vec<&str> = raw.split_whitespace().collect();
            let Some((column, rest)) = words.split_first() else {
                continue;
            };
            validate_identifier(column)?;

            let lowered: Vec<String> = rest.iter().map(|w| w.to_ascii_lowercase()).collect();
            let words: Vec<&str> = lowered.iter().map(String::as_str).collect();
            let (direction, tail) = match words.as_slice() {
                ["asc", tail @ ..] => (Direction::Asc, tail),
                ["desc", tail @ ..] => (Direction::Desc, tail),
                tail => (Direction::Asc, tail),
            };
            let nulls = match tail {
                [] => None,
                ["nulls", "first"] => Some(Nulls::First),
                ["nulls", "last"] => Some(Nulls::Last),
                _ => return Err(DbError::invalid_identifier(raw.trim())),
            };
            order.terms.push(OrderTerm {
                column: column.to_string(),
                direction,
                nulls,
            });
        }
        Ok(order)
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn terms(&self) -> &[OrderTerm] {
        &self.terms
    }

    /// Render without the `ORDER BY` keyword.
    pub fn to_sql(&self) -> String {
        self.terms
            .iter()
            .map(|t| {
                let mut s = t.column.clone();
                if t.direction == Direction::Desc {
                    s.push_str(" DESC");
                }
                match t.nulls {
                    Some(Nulls::First) => s.push_str(" NULLS FIRST"),
                    Some(Nulls::Last) => s.push_str(" NULLS LAST"),
                    None => {}
                }
                s
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Column list, ordering and pagination for reads.
///
/// Everything defaults to "unspecified": all columns, no ORDER BY, no OFFSET, no LIMIT.
/// `limit: Some(0)` is honored literally and returns no rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectOptions {
    pub columns: Columns,
    pub order_by: OrderBy,
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

impl SelectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn columns(mut self, columns: Columns) -> Self {
        self.columns = columns;
        self
    }

    pub fn order_by(mut self, order_by: OrderBy) -> Self {
        self.order_by = order_by;
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }
}
