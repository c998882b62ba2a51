//! Keyword filter models.
//!
//! Filters are plain key/value data such as `{"age__gte": 18, "name__icontains": "an"}`.
//! A key is a column name, optionally followed by `__` and an operator suffix.

use crate::error::{DbError, DbResult};
use crate::models::QueryParam;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Comparison operator selected by a key suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    /// No suffix
    Eq,
    In,
    NotIn,
    Lt,
    Lte,
    Gt,
    Gte,
    Contains,
    IContains,
    StartsWith,
    IStartsWith,
    EndsWith,
    IEndsWith,
}

impl Operator {
    /// Every suffixed operator, in documentation order.
    pub const SUFFIXED: [Operator; 12] = [
        Operator::In,
        Operator::NotIn,
        Operator::Lt,
        Operator::Lte,
        Operator::Gt,
        Operator::Gte,
        Operator::Contains,
        Operator::IContains,
        Operator::StartsWith,
        Operator::IStartsWith,
        Operator::EndsWith,
        Operator::IEndsWith,
    ];

    pub fn from_suffix(suffix: &str) -> Option<Self> {
        Some(match suffix {
            "in" => Self::In,
            "not_in" => Self::NotIn,
            "lt" => Self::Lt,
            "lte" => Self::Lte,
            "gt" => Self::Gt,
            "gte" => Self::Gte,
            "contains" => Self::Contains,
            "icontains" => Self::IContains,
            "startswith" => Self::StartsWith,
            "istartswith" => Self::IStartsWith,
            "endswith" => Self::EndsWith,
            "iendswith" => Self::IEndsWith,
            _ => return None,
        })
    }

    pub fn suffix(&self) -> Option<&'static str> {
        Some(match self {
            Self::Eq => return None,
            Self::In => "in",
            Self::NotIn => "not_in",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Contains => "contains",
            Self::IContains => "icontains",
            Self::StartsWith => "startswith",
            Self::IStartsWith => "istartswith",
            Self::EndsWith => "endswith",
            Self::IEndsWith => "iendswith",
        })
    }

    /// LIKE/ILIKE operators.
    pub fn is_pattern(&self) -> bool {
        matches!(
            self,
            Self::Contains
                | Self::IContains
                | Self::StartsWith
                | Self::IStartsWith
                | Self::EndsWith
                | Self::IEndsWith
        )
    }

    /// Operators whose value must be a list.
    pub fn takes_list(&self) -> bool {
        matches!(self, Self::In | Self::NotIn)
    }
}

/// Split a filter key into its column and operator.
///
/// Fails with `UnsupportedOperator` for an unknown suffix.
pub fn split_key(key: &str) -> DbResult<(&str, Operator)> {
    match key.split_once("__") {
        None => Ok((key, Operator::Eq)),
        Some((column, suffix)) => Operator::from_suffix(suffix)
            .map(|op| (column, op))
            .ok_or_else(|| DbError::unsupported_operator(key)),
    }
}

/// Value side of a filter.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Scalar(QueryParam),
    List(Vec<QueryParam>),
}

impl FilterValue {
    pub fn list<I, T>(values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<QueryParam>,
    {
        Self::List(values.into_iter().map(Into::into).collect())
    }

    /// JSON arrays become lists, everything else a scalar.
    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::Array(items) => {
                Self::List(items.into_iter().map(QueryParam::from_json).collect())
            }
            other => Self::Scalar(QueryParam::from_json(other)),
        }
    }
}

macro_rules! impl_scalar_filter_value {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl From<$ty> for FilterValue {
                fn from(v: $ty) -> Self {
                    Self::Scalar(v.into())
                }
            }

            impl From<Vec<$ty>> for FilterValue {
                fn from(v: Vec<$ty>) -> Self {
                    Self::list(v)
                }
            }
        )+
    };
}

impl_scalar_filter_value!(bool, i32, i64, f64, &str, String, QueryParam);

impl<T: Into<QueryParam>> From<Option<T>> for FilterValue {
    fn from(v: Option<T>) -> Self {
        Self::Scalar(v.into())
    }
}

/// Ordered set of filters. Order decides clause and parameter order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterSpec {
    entries: Vec<(String, FilterValue)>,
}

impl FilterSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter. Re-adding a key replaces its value in place.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FilterValue>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FilterValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Build filters from request-style JSON.
    ///
    /// A `search` key holding an object is taken out as a [`SearchSpec`];
    /// every other key becomes a filter, in the object's iteration order.
    pub fn from_json_object(
        object: serde_json::Map<String, JsonValue>,
    ) -> DbResult<(Self, Option<SearchSpec>)> {
        let mut filters = Self::new();
        let mut search = None;
        for (key, value) in object {
            if key == "search" && value.is_object() {
                let spec: SearchSpec = serde_json::from_value(value).map_err(|e| {
                    DbError::invalid_filter_value("search", format!("malformed search: {e}"))
                })?;
                search = Some(spec);
                continue;
            }
            filters.insert(key, FilterValue::from_json(value));
        }
        Ok((filters, search))
    }
}

impl<K: Into<String>, V: Into<FilterValue>> FromIterator<(K, V)> for FilterSpec {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut spec = Self::new();
        for (k, v) in iter {
            spec.insert(k, v);
        }
        spec
    }
}

/// Free-text search over several columns.
///
/// Each column may carry a pattern suffix (`name__istartswith`); the default is
/// a case-insensitive contains match. Column clauses are OR-ed together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchSpec {
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub term: String,
}

impl SearchSpec {
    pub fn new<I, S>(columns: I, term: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            term: term.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}
