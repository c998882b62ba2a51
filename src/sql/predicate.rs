//! Filter predicate compiler.
//!
//! Turns a [`FilterSpec`] and an optional [`SearchSpec`] into the body of a
//! `WHERE` clause. Filter clauses are joined with `AND`, search clauses with
//! `OR`; with both present the result is `(search) AND (filters)`.

use crate::error::{DbError, DbResult};
use crate::models::{FilterSpec, FilterValue, Operator, QueryParam, SearchSpec, split_key};
use crate::sql::{Bindings, validate_identifier};

/// A compiled `WHERE` body and its parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predicate {
    pub sql: String,
    pub params: Vec<QueryParam>,
}

impl Predicate {
    pub fn compile(filters: &FilterSpec, search: Option<&SearchSpec>) -> DbResult<Self> {
        let mut bindings = Bindings::new();
        let sql = compile_into(filters, search, &mut bindings)?;
        Ok(Self {
            sql,
            params: bindings.into_params(),
        })
    }

    /// True when there is nothing to filter on and `WHERE` should be omitted.
    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }
}

/// Compile into an existing binding list. Returns an empty string when there
/// are no filters and no search columns.
pub fn compile_into(
    filters: &FilterSpec,
    search: Option<&SearchSpec>,
    bindings: &mut Bindings,
) -> DbResult<String> {
    let search_sql = match search {
        Some(spec) if !spec.is_empty() => compile_search(spec, bindings)?,
        _ => String::new(),
    };

    let mut clauses = Vec::with_capacity(filters.len());
    for (key, value) in filters.iter() {
        let (column, op) = split_key(key)?;
        clauses.push(compile_clause(key, column, op, value, bindings)?);
    }
    let filter_sql = clauses.join(" AND ");

    Ok(match (search_sql.is_empty(), filter_sql.is_empty()) {
        (true, _) => filter_sql,
        (false, true) => search_sql,
        (false, false) => format!("({search_sql}) AND ({filter_sql})"),
    })
}

/// Equality-only form used by `UPDATE ... WHERE`. Suffixed keys are rejected.
pub fn compile_equality_into(filters: &FilterSpec, bindings: &mut Bindings) -> DbResult<String> {
    let mut clauses = Vec::with_capacity(filters.len());
    for (key, value) in filters.iter() {
        if key.contains("__") {
            return Err(DbError::unsupported_operator(key));
        }
        clauses.push(compile_clause(key, key, Operator::Eq, value, bindings)?);
    }
    Ok(clauses.join(" AND "))
}

fn compile_search(spec: &SearchSpec, bindings: &mut Bindings) -> DbResult<String> {
    let term = QueryParam::String(spec.term.clone());
    let mut clauses = Vec::with_capacity(spec.columns.len());
    for key in &spec.columns {
        let (column, op) = match split_key(key)? {
            (column, Operator::Eq) => (column, Operator::IContains),
            (column, op) if op.is_pattern() => (column, op),
            _ => return Err(DbError::unsupported_operator(key.as_str())),
        };
        validate_identifier(column)?;
        clauses.push(pattern_clause(key, column, op, &term, bindings)?);
    }
    Ok(clauses.join(" OR "))
}

fn compile_clause(
    key: &str,
    column: &str,
    op: Operator,
    value: &FilterValue,
    bindings: &mut Bindings,
) -> DbResult<String> {
    validate_identifier(column)?;

    if op.takes_list() {
        let FilterValue::List(items) = value else {
            return Err(DbError::invalid_filter_value(key, "expected a list"));
        };
        if items.is_empty() {
            return Ok(if op == Operator::In { "FALSE" } else { "TRUE" }.to_string());
        }
        let placeholders: Vec<String> = items.iter().map(|v| bindings.push(v.clone())).collect();
        let keyword = if op == Operator::In { "IN" } else { "NOT IN" };
        return Ok(format!("{column} {keyword} ({})", placeholders.join(", ")));
    }

    let FilterValue::Scalar(value) = value else {
        return Err(DbError::invalid_filter_value(key, "expected a single value"));
    };

    match op {
        Operator::Eq if value.is_null() => Ok(format!("{column} IS NULL")),
        Operator::Eq => Ok(format!("{column} = {}", bindings.push(value.clone()))),
        Operator::Lt | Operator::Lte | Operator::Gt | Operator::Gte => {
            if value.is_null() {
                return Err(DbError::invalid_filter_value(key, "cannot compare with null"));
            }
            let symbol = match op {
                Operator::Lt => "<",
                Operator::Lte => "<=",
                Operator::Gt => ">",
                _ => ">=",
            };
            Ok(format!("{column} {symbol} {}", bindings.push(value.clone())))
        }
        _ => pattern_clause(key, column, op, value, bindings),
    }
}

fn pattern_clause(
    key: &str,
    column: &str,
    op: Operator,
    value: &QueryParam,
    bindings: &mut Bindings,
) -> DbResult<String> {
    let text = value
        .as_text()
        .ok_or_else(|| {
            DbError::invalid_filter_value(
                key,
                format!("pattern match needs a text value, got {}", value.type_name()),
            )
        })
        .map(|t| escape_like(&t))?;

    let (keyword, pattern) = match op {
        Operator::Contains => ("LIKE", format!("%{text}%")),
        Operator::IContains => ("ILIKE", format!("%{text}%")),
        Operator::StartsWith => ("LIKE", format!("{text}%")),
        Operator::IStartsWith => ("ILIKE", format!("{text}%")),
        Operator::EndsWith => ("LIKE", format!("%{text}")),
        Operator::IEndsWith => ("ILIKE", format!("%{text}")),
        _ => return Err(DbError::unsupported_operator(key)),
    };
    let placeholder = bindings.push(QueryParam::String(pattern));
    Ok(format!("{column} {keyword} {placeholder}"))
}

/// Escape LIKE wildcards. `\` is the default escape character in PostgreSQL.
fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
